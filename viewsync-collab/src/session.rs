//! Per-user session: command pipeline plus change delivery.
//!
//! ```text
//!  execute_command ──► ProcessingQueue ──► worker task ──► CommandManager
//!        │ (validate,        │ start()         │ (one per        │ execute
//!        │  resolve target)  ▼                 │  session)       ▼
//!        │             Notify / spawn-once     │              View ──► ChangeLog
//!        ▼                                     ▼                           │
//!  PendingCommand ◄──────── completion ── on_processed, pulse ─► Waiter     │
//!                                                                 │         │
//!  flush / flush_or_wait ◄────────────────────────────────────────┴─────────┘
//! ```
//!
//! Commands of one session run strictly one at a time, in submission order,
//! on a single worker task that is spawned the first time the queue becomes
//! non-empty and woken on every later empty → non-empty transition.

use crate::command::{CommandError, CommandManager, Invocation, Principal};
use crate::queue::ProcessingQueue;
use crate::waiter::{AtMostOneAwaiter, WaiterConfig, WaiterError};
use log::{debug, error, info, warn};
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::task::{Context, Poll};
use tokio::sync::{oneshot, Notify};
use viewsync_core::{
    ChangeLog, CommandInstruction, GraphError, IdentityTable, InstructionError, InstructionId,
    Model, NodeId, NodeKey, Response, Substitutions, View,
};

/// Session tuning.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionConfig {
    /// Long-poll backoff.
    pub waiter: WaiterConfig,
    /// Free detached nodes after every command.
    pub reclaim_detached: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            waiter: WaiterConfig::default(),
            reclaim_detached: true,
        }
    }
}

impl SessionConfig {
    pub fn for_testing() -> Self {
        Self {
            waiter: WaiterConfig::for_testing(),
            reclaim_detached: true,
        }
    }
}

/// Everything an application factory hands to a new session.
pub struct AppRoot {
    pub model: Model,
    pub root: NodeKey,
    pub commands: CommandManager,
    pub substitutions: Substitutions,
}

impl AppRoot {
    pub fn new(model: Model, root: NodeKey, commands: CommandManager) -> Self {
        Self {
            model,
            root,
            commands,
            substitutions: Substitutions::new(),
        }
    }

    pub fn with_substitutions(mut self, substitutions: Substitutions) -> Self {
        self.substitutions = substitutions;
        self
    }
}

/// Successful terminal states of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Executed,
    /// The command's precondition did not hold. Not an error.
    Canceled,
}

/// Why an instruction failed.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandFailure {
    TargetNotFound(NodeId),
    CommandNotFound { name: String, suggestion: Option<String> },
    Unauthorized(String),
    /// The command itself failed or panicked.
    Execution(String),
    /// The session went away before the instruction completed.
    WorkerStopped,
}

impl std::fmt::Display for CommandFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandFailure::TargetNotFound(id) => write!(f, "View model with id '{id}' was not found"),
            CommandFailure::CommandNotFound { name, suggestion } => {
                let not_found = CommandError::NotFound {
                    name: name.clone(),
                    suggestion: suggestion.clone(),
                };
                write!(f, "{not_found}")
            }
            CommandFailure::Unauthorized(name) => write!(f, "Unauthorized to execute command '{name}'"),
            CommandFailure::Execution(e) => write!(f, "Command failed: {e}"),
            CommandFailure::WorkerStopped => {
                write!(f, "The session stopped before the instruction completed")
            }
        }
    }
}

impl std::error::Error for CommandFailure {}

/// Session-level errors.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionError {
    Graph(GraphError),
    Waiter(WaiterError),
    Instruction(InstructionError),
    Command(CommandFailure),
    /// The application factory failed.
    Application(String),
    Storage(String),
    /// Sessions spawn their worker on the ambient tokio runtime.
    NoRuntime,
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Graph(e) => write!(f, "Graph error: {e}"),
            SessionError::Waiter(e) => write!(f, "{e}"),
            SessionError::Instruction(e) => write!(f, "{e}"),
            SessionError::Command(e) => write!(f, "{e}"),
            SessionError::Application(e) => write!(f, "Application error: {e}"),
            SessionError::Storage(e) => write!(f, "Storage error: {e}"),
            SessionError::NoRuntime => write!(f, "No tokio runtime available for the session worker"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<GraphError> for SessionError {
    fn from(e: GraphError) -> Self {
        SessionError::Graph(e)
    }
}

impl From<WaiterError> for SessionError {
    fn from(e: WaiterError) -> Self {
        SessionError::Waiter(e)
    }
}

impl From<InstructionError> for SessionError {
    fn from(e: InstructionError) -> Self {
        SessionError::Instruction(e)
    }
}

impl From<CommandFailure> for SessionError {
    fn from(e: CommandFailure) -> Self {
        SessionError::Command(e)
    }
}

type Outcome = Result<Completion, CommandFailure>;

struct WorkItem {
    seq: u64,
    instruction: CommandInstruction,
    target_id: NodeId,
    target: Option<NodeKey>,
    principal: Principal,
    completion: Mutex<Option<oneshot::Sender<Outcome>>>,
}

impl PartialEq for WorkItem {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl WorkItem {
    fn complete(&self, outcome: Outcome) {
        let sender = self
            .completion
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sender) = sender {
            // The caller may have stopped waiting.
            let _ = sender.send(outcome);
        }
    }
}

/// Completion of a submitted instruction.
#[derive(Debug)]
pub struct PendingCommand {
    rx: oneshot::Receiver<Outcome>,
}

impl Future for PendingCommand {
    type Output = Outcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(CommandFailure::WorkerStopped)))
    }
}

/// Command counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub executed: u64,
    pub canceled: u64,
    pub failed: u64,
    pub flushes: u64,
}

#[derive(Default)]
struct StatCounters {
    executed: AtomicU64,
    canceled: AtomicU64,
    failed: AtomicU64,
    flushes: AtomicU64,
}

struct SessionShared {
    config: SessionConfig,
    view: Mutex<View>,
    commands: RwLock<CommandManager>,
    ids: Arc<IdentityTable<NodeKey>>,
    log: ChangeLog,
    queue: ProcessingQueue<Arc<WorkItem>>,
    waiter: AtMostOneAwaiter,
    next_seq: AtomicU64,
    wake: Arc<Notify>,
    stats: StatCounters,
}

impl Drop for SessionShared {
    fn drop(&mut self) {
        // Let an idle worker observe that the session is gone.
        self.wake.notify_one();
    }
}

/// Handle to one user's session. Cheap to clone.
#[derive(Clone)]
pub struct UserSession {
    shared: Arc<SessionShared>,
}

impl std::fmt::Debug for UserSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserSession")
            .field("pending_changes", &self.shared.log.len())
            .field("pending_commands", &self.shared.queue.count())
            .finish()
    }
}

impl UserSession {
    /// Build a session around an application root. Must be called within a
    /// tokio runtime.
    pub fn new(app: AppRoot, config: SessionConfig) -> Result<Self, SessionError> {
        let handle = tokio::runtime::Handle::try_current().map_err(|_| SessionError::NoRuntime)?;
        let waiter = AtMostOneAwaiter::new(config.waiter)?;
        let ids = Arc::new(IdentityTable::new());
        let log = ChangeLog::new();
        let view = View::new(app.model, app.root, ids.clone(), log.clone(), app.substitutions)?;
        let wake = Arc::new(Notify::new());

        let shared = Arc::new_cyclic(|weak: &Weak<SessionShared>| {
            let spawned = AtomicBool::new(false);
            let weak = weak.clone();
            let notify = wake.clone();
            let start = move || {
                if !spawned.swap(true, Ordering::SeqCst) {
                    handle.spawn(worker_loop(weak.clone(), notify.clone()));
                }
                notify.notify_one();
            };
            SessionShared {
                config,
                view: Mutex::new(view),
                commands: RwLock::new(app.commands),
                ids,
                log,
                queue: ProcessingQueue::new(start),
                waiter,
                next_seq: AtomicU64::new(0),
                wake,
                stats: StatCounters::default(),
            }
        });
        Ok(Self { shared })
    }

    /// Validate and enqueue an instruction.
    ///
    /// Malformed instructions fail here; everything else is decided by the
    /// worker and reported through the returned [`PendingCommand`].
    pub fn execute_command(
        &self,
        instruction: CommandInstruction,
        principal: &Principal,
    ) -> Result<PendingCommand, InstructionError> {
        let target_id = instruction.check().map_err(|e| {
            warn!("Rejected instruction '{}': {e}", instruction.command_name);
            e
        })?;
        let target = self.shared.ids.node(target_id).ok();
        let (tx, rx) = oneshot::channel();
        let item = Arc::new(WorkItem {
            seq: self.shared.next_seq.fetch_add(1, Ordering::Relaxed),
            instruction,
            target_id,
            target,
            principal: principal.clone(),
            completion: Mutex::new(Some(tx)),
        });
        debug!(
            "Enqueued '{}' on view model {target_id}",
            item.instruction.command_name
        );
        self.shared.queue.enqueue(item);
        Ok(PendingCommand { rx })
    }

    /// Drain pending changes.
    pub fn flush(&self) -> Response {
        self.shared.flush()
    }

    /// Drain pending changes, or wait for some if there are none.
    pub async fn flush_or_wait(&self) -> Response {
        let response = self.shared.flush();
        if !response.is_empty() {
            return response;
        }
        self.shared.waiter.wait().await;
        self.shared.flush()
    }

    /// Full-state snapshot for a (re)connecting client. Discards changes
    /// that were pending, since the snapshot supersedes them.
    pub fn open(&self) -> Result<Response, SessionError> {
        let view = self.shared.lock_view();
        let discarded = self.shared.log.drain().len();
        if discarded > 0 {
            debug!("Discarded {discarded} pending changes before snapshot");
        }
        view.snapshot_as_changes(view.root())?;
        Ok(self.shared.drain(&view))
    }

    /// Read access to the tracked graph.
    pub fn with_view<R>(&self, f: impl FnOnce(&View) -> R) -> R {
        f(&self.shared.lock_view())
    }

    /// Mutable access to the command table, e.g. to register commands late.
    pub fn with_commands<R>(&self, f: impl FnOnce(&mut CommandManager) -> R) -> R {
        f(&mut self.shared.commands.write().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn root_id(&self) -> Result<NodeId, SessionError> {
        let root = self.shared.lock_view().root();
        Ok(self.shared.ids.id(root).map_err(GraphError::from)?)
    }

    /// Queued plus executing instructions.
    pub fn pending_commands(&self) -> usize {
        self.shared.queue.count()
    }

    pub fn pending_changes(&self) -> usize {
        self.shared.log.len()
    }

    pub fn stats(&self) -> SessionStats {
        let s = &self.shared.stats;
        SessionStats {
            executed: s.executed.load(Ordering::Relaxed),
            canceled: s.canceled.load(Ordering::Relaxed),
            failed: s.failed.load(Ordering::Relaxed),
            flushes: s.flushes.load(Ordering::Relaxed),
        }
    }
}

impl SessionShared {
    fn lock_view(&self) -> std::sync::MutexGuard<'_, View> {
        self.view.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Waits for a running command to finish, so a response never carries
    /// part of one.
    fn flush(&self) -> Response {
        let view = self.lock_view();
        self.drain(&view)
    }

    /// The caller holds the view lock.
    fn drain(&self, _view: &View) -> Response {
        let changes = self.log.drain();
        if !changes.is_empty() {
            self.waiter.reset();
        }
        self.stats.flushes.fetch_add(1, Ordering::Relaxed);
        Response::new(changes, self.queue.count() != 0)
    }

    fn process(&self, item: &Arc<WorkItem>) {
        let outcome = self.run(item);
        let name = &item.instruction.command_name;
        match &outcome {
            Ok(Completion::Executed) => {
                self.stats.executed.fetch_add(1, Ordering::Relaxed);
                debug!("Executed '{name}' on view model {}", item.target_id);
            }
            Ok(Completion::Canceled) => {
                self.stats.canceled.fetch_add(1, Ordering::Relaxed);
                warn!("Canceled '{name}': precondition does not hold");
            }
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                warn!("Instruction '{name}' failed: {e}");
            }
        }

        if let Err(e) = self.queue.on_processed(item) {
            error!("Queue bookkeeping failed for '{name}': {e}");
        }
        if !self.log.is_empty() {
            self.waiter.pulse();
        }
        item.complete(outcome);
    }

    fn run(&self, item: &WorkItem) -> Outcome {
        let target = item
            .target
            .filter(|key| self.ids.contains_node(*key))
            .ok_or(CommandFailure::TargetNotFound(item.target_id))?;

        let commands = self.commands.read().unwrap_or_else(PoisonError::into_inner);
        let name = item.instruction.command_name.as_str();
        if !commands.exists(name) {
            return Err(CommandFailure::CommandNotFound {
                name: name.to_string(),
                suggestion: commands.find_case_insensitive(name).map(str::to_string),
            });
        }
        if !commands.is_authorized(&item.principal, name).map_err(failure)? {
            return Err(CommandFailure::Unauthorized(name.to_string()));
        }

        let mut view = self.lock_view();
        let invocation = Invocation {
            principal: &item.principal,
            target,
            event_args: &item.instruction.event_args,
        };
        if !commands.can_execute(&view, name, &invocation).map_err(failure)? {
            return Ok(Completion::Canceled);
        }

        view.set_instruction(item.instruction.instruction_id);
        let result = catch_unwind(AssertUnwindSafe(|| {
            commands.execute(&mut view, name, &invocation)
        }));
        view.set_instruction(InstructionId::NONE);
        if self.config.reclaim_detached {
            view.reclaim_detached();
        }

        match result {
            Ok(Ok(())) => Ok(Completion::Executed),
            Ok(Err(e)) => Err(failure(e)),
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "command panicked".to_string());
                error!("Command '{name}' panicked: {message}");
                Err(CommandFailure::Execution(message))
            }
        }
    }
}

fn failure(e: CommandError) -> CommandFailure {
    match e {
        CommandError::NotFound { name, suggestion } => CommandFailure::CommandNotFound { name, suggestion },
        CommandError::Unauthorized(name) => CommandFailure::Unauthorized(name),
        other => CommandFailure::Execution(other.to_string()),
    }
}

async fn worker_loop(session: Weak<SessionShared>, wake: Arc<Notify>) {
    debug!("Session worker started");
    loop {
        wake.notified().await;
        let Some(shared) = session.upgrade() else {
            break;
        };
        while let Some(item) = shared.queue.try_dequeue() {
            shared.process(&item);
            tokio::task::yield_now().await;
        }
    }
    info!("Session worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::FnCommand;
    use serde_json::json;
    use std::time::Duration;
    use viewsync_core::{Change, Schema, SchemaRegistry};

    fn counter_app() -> AppRoot {
        let schemas = SchemaRegistry::new()
            .with(Schema::builder("Counter").value("currentCount").build())
            .unwrap();
        let mut model = Model::new(schemas);
        let counter = model.create("Counter").unwrap();
        model.set(counter, "currentCount", 0).unwrap();

        let mut commands = CommandManager::new();
        commands
            .register(
                "Increment",
                FnCommand::new(|view, inv| {
                    let n = view.get(inv.target, "currentCount")?.as_i64().unwrap_or(0);
                    view.set_property(inv.target, "currentCount", n + 1)?;
                    Ok(())
                }),
            )
            .unwrap();
        commands
            .register(
                "Never",
                FnCommand::new(|_, _| Ok(())).with_can_execute(|_, _| false),
            )
            .unwrap();
        commands
            .register(
                "Fail",
                FnCommand::new(|_, _| Err(CommandError::Failed("boom".into()))),
            )
            .unwrap();
        commands
            .register("Panic", FnCommand::new(|_, _| panic!("kaboom")))
            .unwrap();
        AppRoot::new(model, counter, commands)
    }

    fn session() -> UserSession {
        UserSession::new(counter_app(), SessionConfig::for_testing()).unwrap()
    }

    fn instruction(name: &str, id: u32) -> CommandInstruction {
        CommandInstruction::new(name, NodeId(id))
    }

    #[test]
    fn test_requires_runtime() {
        let err = UserSession::new(counter_app(), SessionConfig::default()).unwrap_err();
        assert_eq!(err, SessionError::NoRuntime);
    }

    #[tokio::test]
    async fn test_fresh_session_flushes_nothing() {
        let session = session();
        let response = session.flush();
        assert!(response.changes.is_empty());
        assert!(!response.rerequest);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_flush_never_splits_a_running_command() {
        let session = session();
        session
            .with_commands(|commands| {
                commands.register(
                    "Twice",
                    FnCommand::new(|view, inv| {
                        view.set_property(inv.target, "currentCount", 1)?;
                        std::thread::sleep(Duration::from_millis(150));
                        view.set_property(inv.target, "currentCount", 2)?;
                        Ok(())
                    }),
                )
            })
            .unwrap();

        let pending = session
            .execute_command(instruction("Twice", 0), &Principal::anonymous())
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let flusher = session.clone();
        let during = tokio::task::spawn_blocking(move || flusher.flush()).await.unwrap();
        assert_eq!(pending.await, Ok(Completion::Executed));
        let after = session.flush();

        assert_ne!(during.changes.len(), 1);
        assert_eq!(during.changes.len() + after.changes.len(), 2);
    }

    #[tokio::test]
    async fn test_command_on_root_succeeds() {
        let session = session();
        let principal = Principal::anonymous();
        let outcome = session
            .execute_command(instruction("Increment", 0), &principal)
            .unwrap()
            .await;
        assert_eq!(outcome, Ok(Completion::Executed));
        let response = session.flush();
        assert_eq!(
            response.changes,
            vec![Change::property(NodeId(0), "currentCount", json!(1).into())]
        );
        assert_eq!(session.stats().executed, 1);
    }

    #[tokio::test]
    async fn test_failures_and_cancellation() {
        let session = session();
        let principal = Principal::anonymous();

        let missing_target = session
            .execute_command(instruction("Increment", 2), &principal)
            .unwrap()
            .await;
        assert_eq!(missing_target, Err(CommandFailure::TargetNotFound(NodeId(2))));
        assert_eq!(
            missing_target.unwrap_err().to_string(),
            "View model with id '2' was not found"
        );

        let missing_command = session
            .execute_command(instruction("increment", 0), &principal)
            .unwrap()
            .await;
        assert_eq!(
            missing_command,
            Err(CommandFailure::CommandNotFound {
                name: "increment".into(),
                suggestion: Some("Increment".into())
            })
        );

        let canceled = session
            .execute_command(instruction("Never", 0), &principal)
            .unwrap()
            .await;
        assert_eq!(canceled, Ok(Completion::Canceled));

        let failed = session
            .execute_command(instruction("Fail", 0), &principal)
            .unwrap()
            .await;
        assert!(matches!(failed, Err(CommandFailure::Execution(_))));

        assert!(session.flush().changes.is_empty());
        assert_eq!(session.stats().failed, 3);
        assert_eq!(session.stats().canceled, 1);
    }

    #[tokio::test]
    async fn test_panicking_command_does_not_kill_worker() {
        let session = session();
        let principal = Principal::anonymous();
        let panicked = session
            .execute_command(instruction("Panic", 0), &principal)
            .unwrap()
            .await;
        assert_eq!(panicked, Err(CommandFailure::Execution("kaboom".into())));

        let next = session
            .execute_command(instruction("Increment", 0), &principal)
            .unwrap()
            .await;
        assert_eq!(next, Ok(Completion::Executed));
    }

    #[tokio::test]
    async fn test_malformed_instruction_fails_on_caller() {
        let session = session();
        let mut bad = instruction("Increment", 0);
        bad.view_model_id = -1;
        assert_eq!(
            session.execute_command(bad, &Principal::anonymous()).unwrap_err(),
            InstructionError::NegativeViewModelId
        );
        assert_eq!(session.pending_commands(), 0);
    }

    #[tokio::test]
    async fn test_commands_run_in_submission_order() {
        let session = session();
        let principal = Principal::anonymous();
        let pending: Vec<_> = (0..20)
            .map(|_| session.execute_command(instruction("Increment", 0), &principal).unwrap())
            .collect();
        for p in pending {
            assert_eq!(p.await, Ok(Completion::Executed));
        }
        let values: Vec<_> = session
            .flush()
            .changes
            .into_iter()
            .map(|c| match c {
                Change::Property(p) => p.value,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        let expected: Vec<_> = (1..=20).map(|i| json!(i).into()).collect::<Vec<viewsync_core::Payload>>();
        assert_eq!(values, expected);
    }

    #[tokio::test]
    async fn test_flush_or_wait_waits_without_changes() {
        let session = UserSession::new(
            counter_app(),
            SessionConfig {
                waiter: WaiterConfig::constant(Duration::from_millis(200)),
                reclaim_detached: true,
            },
        )
        .unwrap();
        let poll = tokio::spawn({
            let session = session.clone();
            async move { session.flush_or_wait().await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!poll.is_finished());
        let response = poll.await.unwrap();
        assert!(response.changes.is_empty());
    }

    #[tokio::test]
    async fn test_second_flush_or_wait_releases_first() {
        let session = UserSession::new(
            counter_app(),
            SessionConfig {
                waiter: WaiterConfig::constant(Duration::from_secs(5)),
                reclaim_detached: true,
            },
        )
        .unwrap();
        let first = tokio::spawn({
            let session = session.clone();
            async move { session.flush_or_wait().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let _second = tokio::spawn({
            let session = session.clone();
            async move { session.flush_or_wait().await }
        });
        let released = tokio::time::timeout(Duration::from_millis(500), first).await;
        assert!(released.is_ok(), "first long-poll should be released");
    }

    #[tokio::test]
    async fn test_property_change_wakes_long_poll() {
        let session = UserSession::new(
            counter_app(),
            SessionConfig {
                waiter: WaiterConfig::constant(Duration::from_secs(5)),
                reclaim_detached: true,
            },
        )
        .unwrap();
        let poll = tokio::spawn({
            let session = session.clone();
            async move { session.flush_or_wait().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        session
            .execute_command(instruction("Increment", 0), &Principal::anonymous())
            .unwrap()
            .await
            .unwrap();
        let response = tokio::time::timeout(Duration::from_millis(500), poll)
            .await
            .expect("long-poll should wake on new changes")
            .unwrap();
        assert_eq!(response.changes.len(), 1);
        match &response.changes[0] {
            Change::Property(p) => {
                assert_eq!(p.id, NodeId(0));
                assert_eq!(p.property_name, "currentCount");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_open_returns_snapshot_and_discards_pending() {
        let session = session();
        session
            .execute_command(instruction("Increment", 0), &Principal::anonymous())
            .unwrap()
            .await
            .unwrap();
        let response = session.open().unwrap();
        assert_eq!(
            response.changes,
            vec![Change::property(NodeId(0), "currentCount", json!(1).into())]
        );
        assert!(session.flush().changes.is_empty());
    }

    #[tokio::test]
    async fn test_dropping_session_fails_nothing_already_completed() {
        let session = session();
        let pending = session
            .execute_command(instruction("Increment", 0), &Principal::anonymous())
            .unwrap();
        assert_eq!(pending.await, Ok(Completion::Executed));
        drop(session);
        tokio::task::yield_now().await;
    }
}
