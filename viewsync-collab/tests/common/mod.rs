//! Shared test application: a counter plus an entry list and a tag list.
//!
//! ```text
//! App ─┬─ title
//!      ├─ counter ─► Counter { currentCount }
//!      ├─ entries ─► EntryList [Entry { text }, ...]
//!      └─ tags    ─► TagList ["a", "b", ...]
//! ```
//!
//! Stored state is the counter value followed by the tags, one per line.

#![allow(dead_code)]

use viewsync_collab::{AppRoot, Application, CommandError, CommandManager, FnCommand, SessionData, SessionError};
use viewsync_core::{GraphError, Model, NodeKey, Schema, SchemaRegistry, View};

pub struct ListApp;

fn schemas() -> Result<SchemaRegistry, GraphError> {
    SchemaRegistry::new()
        .with(
            Schema::builder("App")
                .value("title")
                .node("counter")
                .node("entries")
                .node("tags")
                .build(),
        )?
        .with(Schema::builder("Counter").value("currentCount").build())?
        .with(Schema::builder("EntryList").collection().build())?
        .with(Schema::builder("Entry").value("text").build())?
        .with(Schema::builder("TagList").collection().build())
}

fn child(view: &View, name: &str) -> Result<NodeKey, CommandError> {
    view.get(view.root(), name)?
        .as_node()
        .ok_or_else(|| CommandError::Failed(format!("'{name}' is not set")))
}

fn text_arg(args: &serde_json::Value, name: &str) -> Result<String, CommandError> {
    args.get(name)
        .and_then(serde_json::Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| CommandError::Failed(format!("missing argument '{name}'")))
}

fn commands() -> Result<CommandManager, CommandError> {
    let mut commands = CommandManager::new();
    commands.register_flag("canDecrement", |view, _| {
        child(view, "counter")
            .ok()
            .and_then(|c| view.get(c, "currentCount").ok()?.as_i64())
            .map_or(false, |n| n > 0)
    });
    commands.register(
        "Increment",
        FnCommand::new(|view, _| {
            let counter = child(view, "counter")?;
            let n = view.get(counter, "currentCount")?.as_i64().unwrap_or(0);
            view.set_property(counter, "currentCount", n + 1)?;
            Ok(())
        }),
    )?;
    commands.register(
        "Decrement",
        FnCommand::new(|view, _| {
            let counter = child(view, "counter")?;
            let n = view.get(counter, "currentCount")?.as_i64().unwrap_or(0);
            view.set_property(counter, "currentCount", n - 1)?;
            Ok(())
        })
        .with_condition("canDecrement")?,
    )?;
    commands.register(
        "AddEntry",
        FnCommand::new(|view, inv| {
            let text = text_arg(inv.event_args, "text")?;
            let entries = child(view, "entries")?;
            let entry = view.create_node("Entry")?;
            view.set_property(entry, "text", text)?;
            view.push_item(entries, entry)?;
            Ok(())
        }),
    )?;
    commands.register(
        "RemoveEntry",
        FnCommand::new(|view, inv| {
            let index = inv
                .event_args
                .get("index")
                .and_then(serde_json::Value::as_u64)
                .unwrap_or(0) as usize;
            let entries = child(view, "entries")?;
            view.remove_item(entries, index)?;
            Ok(())
        }),
    )?;
    commands.register(
        "AddTag",
        FnCommand::new(|view, inv| {
            let tag = text_arg(inv.event_args, "tag")?;
            let tags = child(view, "tags")?;
            view.push_item(tags, tag)?;
            Ok(())
        }),
    )?;
    commands.register(
        "Explode",
        FnCommand::new(|_, _| Err(CommandError::Failed("boom".into()))),
    )?;
    Ok(commands)
}

impl Application for ListApp {
    fn create(&self, stored: Option<&SessionData>) -> Result<AppRoot, SessionError> {
        let text = stored
            .and_then(|data| std::str::from_utf8(data.as_bytes()).ok())
            .unwrap_or("0");
        let mut lines = text.lines();
        let count: i64 = lines.next().and_then(|l| l.parse().ok()).unwrap_or(0);

        let mut model = Model::new(schemas()?);
        let app = model.create("App")?;
        let counter = model.create("Counter")?;
        let entries = model.create("EntryList")?;
        let tags = model.create("TagList")?;
        model.set(counter, "currentCount", count)?;
        for tag in lines {
            model.push(tags, tag)?;
        }
        model.set(app, "title", "list")?;
        model.set(app, "counter", counter)?;
        model.set(app, "entries", entries)?;
        model.set(app, "tags", tags)?;

        let commands = commands().map_err(|e| SessionError::Application(e.to_string()))?;
        Ok(AppRoot::new(model, app, commands))
    }

    fn save(&self, view: &View) -> Option<SessionData> {
        let counter = view.get(view.root(), "counter").ok()?.as_node()?;
        let count = view.get(counter, "currentCount").ok()?.as_i64()?;
        let tags = view.get(view.root(), "tags").ok()?.as_node()?;
        let mut text = count.to_string();
        for tag in view.items(tags).ok()? {
            text.push('\n');
            text.push_str(tag.as_str()?);
        }
        Some(SessionData::new(text.into_bytes()))
    }
}
