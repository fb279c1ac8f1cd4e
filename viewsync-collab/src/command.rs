//! Command dispatch table.
//!
//! Associates command names with an executable, an authorization predicate
//! and a client-evaluable [`Condition`]. Execution is gated twice: by the
//! condition (whose flags are resolved here, on the server) and by the
//! command's own server-only check.

use crate::condition::{Condition, ConditionError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use viewsync_core::{GraphError, NodeKey, View};

/// Stable identity of the user a request acts for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Principal {
    pub name: String,
}

impl Principal {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn is_anonymous(&self) -> bool {
        self.name.is_empty()
    }

    /// Key under which this principal's session is cached and stored.
    pub fn user_key(&self) -> &str {
        &self.name
    }
}

/// Arguments of one command evaluation.
#[derive(Debug, Clone, Copy)]
pub struct Invocation<'a> {
    pub principal: &'a Principal,
    pub target: NodeKey,
    pub event_args: &'a serde_json::Value,
}

/// Errors raised by the dispatch table or by command code.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandError {
    NotFound { name: String, suggestion: Option<String> },
    Unauthorized(String),
    /// `execute` was called although `can_execute` is false.
    PreconditionFailed(String),
    UnknownFlag { command: String, flag: String },
    Condition(ConditionError),
    Graph(GraphError),
    /// Application-level failure reported by the command itself.
    Failed(String),
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandError::NotFound { name, suggestion } => {
                write!(f, "Command with name '{name}' was not found")?;
                if let Some(found) = suggestion {
                    write!(f, ", but '{found}' was found (case-sensitive)")?;
                }
                Ok(())
            }
            CommandError::Unauthorized(name) => write!(f, "Unauthorized to execute command '{name}'"),
            CommandError::PreconditionFailed(name) => {
                write!(f, "Command '{name}' cannot be executed in the current state")
            }
            CommandError::UnknownFlag { command, flag } => {
                write!(f, "Command '{command}' uses unknown flag '{flag}'")
            }
            CommandError::Condition(e) => write!(f, "{e}"),
            CommandError::Graph(e) => write!(f, "{e}"),
            CommandError::Failed(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for CommandError {}

impl From<GraphError> for CommandError {
    fn from(e: GraphError) -> Self {
        CommandError::Graph(e)
    }
}

impl From<ConditionError> for CommandError {
    fn from(e: ConditionError) -> Self {
        CommandError::Condition(e)
    }
}

/// An executable command.
pub trait Command: Send + Sync {
    /// Precondition shipped to clients.
    fn condition(&self) -> &Condition;

    /// Server-only check evaluated after the condition.
    fn additional_can_execute(&self, _view: &View, _invocation: &Invocation<'_>) -> bool {
        true
    }

    fn execute(&self, view: &mut View, invocation: &Invocation<'_>) -> Result<(), CommandError>;
}

type ExecuteFn = dyn Fn(&mut View, &Invocation<'_>) -> Result<(), CommandError> + Send + Sync;
type CheckFn = dyn Fn(&View, &Invocation<'_>) -> bool + Send + Sync;
type AuthorizeFn = dyn Fn(&Principal) -> bool + Send + Sync;

/// Closure-backed [`Command`].
pub struct FnCommand {
    condition: Condition,
    can_execute: Option<Box<CheckFn>>,
    execute: Box<ExecuteFn>,
}

impl FnCommand {
    pub fn new<F>(execute: F) -> Self
    where
        F: Fn(&mut View, &Invocation<'_>) -> Result<(), CommandError> + Send + Sync + 'static,
    {
        Self {
            condition: Condition::True,
            can_execute: None,
            execute: Box::new(execute),
        }
    }

    /// Attach a client-evaluable condition. Flag names are checked when the
    /// command is registered.
    pub fn with_condition(mut self, text: &str) -> Result<Self, ConditionError> {
        self.condition = Condition::parse(text, is_identifier)?;
        Ok(self)
    }

    pub fn with_can_execute<F>(mut self, check: F) -> Self
    where
        F: Fn(&View, &Invocation<'_>) -> bool + Send + Sync + 'static,
    {
        self.can_execute = Some(Box::new(check));
        self
    }
}

impl Command for FnCommand {
    fn condition(&self) -> &Condition {
        &self.condition
    }

    fn additional_can_execute(&self, view: &View, invocation: &Invocation<'_>) -> bool {
        self.can_execute.as_ref().map_or(true, |check| check(view, invocation))
    }

    fn execute(&self, view: &mut View, invocation: &Invocation<'_>) -> Result<(), CommandError> {
        (self.execute)(view, invocation)
    }
}

fn is_identifier(text: &str) -> bool {
    let mut chars = text.chars();
    matches!(chars.next(), Some(c) if c.is_alphabetic() || c == '_')
        && chars.all(|c| c.is_alphanumeric() || c == '_')
}

/// What a client needs to know about a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandDescriptor {
    pub name: String,
    pub condition: String,
}

struct Entry {
    name: String,
    command: Arc<dyn Command>,
    authorize: Arc<AuthorizeFn>,
}

/// Registry of the commands available in one session.
#[derive(Default)]
pub struct CommandManager {
    entries: Vec<Entry>,
    flags: HashMap<String, Arc<CheckFn>>,
}

impl std::fmt::Debug for CommandManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandManager")
            .field("commands", &self.names())
            .field("flags", &self.flags.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl CommandManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Define a flag usable in command conditions.
    pub fn register_flag<F>(&mut self, name: impl Into<String>, flag: F)
    where
        F: Fn(&View, &Invocation<'_>) -> bool + Send + Sync + 'static,
    {
        self.flags.insert(name.into(), Arc::new(flag));
    }

    /// Register a command anyone may execute. Replaces an existing command
    /// with the same name.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        command: impl Command + 'static,
    ) -> Result<(), CommandError> {
        self.register_with_authorization(name, command, |_| true)
    }

    pub fn register_with_authorization<A>(
        &mut self,
        name: impl Into<String>,
        command: impl Command + 'static,
        authorize: A,
    ) -> Result<(), CommandError>
    where
        A: Fn(&Principal) -> bool + Send + Sync + 'static,
    {
        let name = name.into();
        if let Some(flag) = command
            .condition()
            .flags()
            .into_iter()
            .find(|flag| !self.flags.contains_key(*flag))
        {
            return Err(CommandError::UnknownFlag {
                command: name,
                flag: flag.to_string(),
            });
        }
        let entry = Entry {
            name,
            command: Arc::new(command),
            authorize: Arc::new(authorize),
        };
        match self.entries.iter_mut().find(|e| e.name == entry.name) {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
        Ok(())
    }

    pub fn exists(&self, name: &str) -> bool {
        self.entry(name).is_some()
    }

    /// The registered name equal to `name` ignoring case, if any.
    pub fn find_case_insensitive(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.name.eq_ignore_ascii_case(name))
            .map(|e| e.name.as_str())
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_authorized(&self, principal: &Principal, name: &str) -> Result<bool, CommandError> {
        Ok((self.lookup(name)?.authorize)(principal))
    }

    /// False if unauthorized, else the condition and the command's own check.
    pub fn can_execute(
        &self,
        view: &View,
        name: &str,
        invocation: &Invocation<'_>,
    ) -> Result<bool, CommandError> {
        let entry = self.lookup(name)?;
        if !(entry.authorize)(invocation.principal) {
            return Ok(false);
        }
        let condition_holds = entry.command.condition().evaluate(&mut |flag| {
            self.flags
                .get(flag)
                .map_or(false, |check| check(view, invocation))
        });
        Ok(condition_holds && entry.command.additional_can_execute(view, invocation))
    }

    /// Execute a command whose `can_execute` holds.
    pub fn execute(
        &self,
        view: &mut View,
        name: &str,
        invocation: &Invocation<'_>,
    ) -> Result<(), CommandError> {
        if !self.can_execute(view, name, invocation)? {
            return Err(CommandError::PreconditionFailed(name.to_string()));
        }
        self.lookup(name)?.command.execute(view, invocation)
    }

    /// Names and client conditions of all commands, in registration order.
    pub fn descriptors(&self) -> Vec<CommandDescriptor> {
        self.entries
            .iter()
            .map(|e| CommandDescriptor {
                name: e.name.clone(),
                condition: e.command.condition().to_string(),
            })
            .collect()
    }

    fn entry(&self, name: &str) -> Option<&Entry> {
        self.entries.iter().find(|e| e.name == name)
    }

    fn lookup(&self, name: &str) -> Result<&Entry, CommandError> {
        self.entry(name).ok_or_else(|| CommandError::NotFound {
            name: name.to_string(),
            suggestion: self.find_case_insensitive(name).map(str::to_string),
        })
    }
}
