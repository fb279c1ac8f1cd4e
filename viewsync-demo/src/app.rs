//! The counter application.
//!
//! ```text
//! App ─┬─ title
//!      ├─ counter ─► Counter { currentCount }
//!      └─ history ─► History [0, 1, 2, ...]
//! ```
//!
//! Every change of the count appends the new value to `history`.

use serde::{Deserialize, Serialize};
use viewsync_collab::{
    AppRoot, Application, CommandError, CommandManager, FnCommand, SessionData, SessionError,
};
use viewsync_core::{GraphError, Model, NodeKey, Schema, SchemaRegistry, View};

/// What a session stores between runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct SavedState {
    count: i64,
    history: Vec<i64>,
}

pub struct CounterApp {
    title: String,
}

impl CounterApp {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
        }
    }
}

fn schemas() -> Result<SchemaRegistry, GraphError> {
    SchemaRegistry::new()
        .with(
            Schema::builder("App")
                .value("title")
                .node("counter")
                .node("history")
                .build(),
        )?
        .with(Schema::builder("Counter").value("currentCount").build())?
        .with(Schema::builder("History").collection().build())
}

fn child(view: &View, name: &str) -> Result<NodeKey, CommandError> {
    view.get(view.root(), name)?
        .as_node()
        .ok_or_else(|| CommandError::Failed(format!("'{name}' is missing")))
}

fn current(view: &View) -> Result<i64, CommandError> {
    let counter = child(view, "counter")?;
    Ok(view.get(counter, "currentCount")?.as_i64().unwrap_or(0))
}

fn record(view: &mut View, count: i64) -> Result<(), CommandError> {
    let counter = child(view, "counter")?;
    view.set_property(counter, "currentCount", count)?;
    let history = child(view, "history")?;
    view.push_item(history, count)?;
    Ok(())
}

fn commands() -> Result<CommandManager, CommandError> {
    let mut commands = CommandManager::new();
    commands.register_flag("canDecrement", |view, _| current(view).map_or(false, |n| n > 0));
    commands.register(
        "Increment",
        FnCommand::new(|view, _| {
            let n = current(view)?;
            record(view, n + 1)
        }),
    )?;
    commands.register(
        "Decrement",
        FnCommand::new(|view, _| {
            let n = current(view)?;
            record(view, n - 1)
        })
        .with_condition("canDecrement")?,
    )?;
    commands.register(
        "Clear",
        FnCommand::new(|view, _| {
            let history = child(view, "history")?;
            loop {
                let len = view.items(history)?.len();
                if len == 0 {
                    break;
                }
                view.remove_item(history, len - 1)?;
            }
            let counter = child(view, "counter")?;
            view.set_property(counter, "currentCount", 0)?;
            Ok(())
        }),
    )?;
    Ok(commands)
}

impl Application for CounterApp {
    fn create(&self, stored: Option<&SessionData>) -> Result<AppRoot, SessionError> {
        let state = match stored {
            Some(data) => serde_json::from_slice::<SavedState>(data.as_bytes()).unwrap_or_else(|e| {
                log::warn!("Ignoring unreadable stored state: {e}");
                SavedState::default()
            }),
            None => SavedState::default(),
        };

        let mut model = Model::new(schemas()?);
        let app = model.create("App")?;
        let counter = model.create("Counter")?;
        let history = model.create("History")?;
        model.set(counter, "currentCount", state.count)?;
        for value in state.history {
            model.push(history, value)?;
        }
        model.set(app, "title", self.title.as_str())?;
        model.set(app, "counter", counter)?;
        model.set(app, "history", history)?;

        let commands = commands().map_err(|e| SessionError::Application(e.to_string()))?;
        Ok(AppRoot::new(model, app, commands))
    }

    fn save(&self, view: &View) -> Option<SessionData> {
        let count = current(view).ok()?;
        let history = child(view, "history").ok()?;
        let history = view
            .items(history)
            .ok()?
            .iter()
            .filter_map(|v| v.as_i64())
            .collect();
        let bytes = serde_json::to_vec(&SavedState { count, history }).ok()?;
        Some(SessionData::new(bytes))
    }
}
