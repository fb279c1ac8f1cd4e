//! Ledger of speculative collection edits awaiting server confirmation.
//!
//! ```text
//!   client edit ──► on_added_client_side ──► ledger[(collection, instruction)]
//!                                                  │
//!   server delta ──► on_added_server_side ─────────┤
//!                      ├─ match found   → confirm(entry), handled
//!                      ├─ collection untouched → not handled, apply delta
//!                      └─ collection touched, no match → Desynchronized
//! ```
//!
//! Matching is by collection and instruction id. Several speculative edits
//! on one collection under the same instruction match server deltas in the
//! order they were recorded, so the client must make them in the order the
//! server will.

use viewsync_core::InstructionId;

/// A locally applied edit the server has not confirmed yet.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEdit<C, T> {
    pub collection: C,
    pub item: T,
    pub index: usize,
    pub instruction: InstructionId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    /// `on_command_start` while another instruction is open.
    CommandAlreadyRunning(InstructionId),
    NoCommandRunning,
    /// `on_command_end` named an instruction other than the open one.
    CommandMismatch {
        expected: InstructionId,
        found: InstructionId,
    },
    /// A server delta arrived while a speculative edit was being recorded.
    ServerDeltaDuringCommand,
    /// A server delta hit a collection whose speculative edits it cannot
    /// account for. The client must refetch.
    Desynchronized,
    /// The server finished all commands but these edits were never confirmed.
    Unconfirmed { added: usize, removed: usize },
}

impl std::fmt::Display for ReconcileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReconcileError::CommandAlreadyRunning(id) => {
                write!(f, "Another command is already running (instruction {id})")
            }
            ReconcileError::NoCommandRunning => {
                write!(f, "No command has been set to be currently executing")
            }
            ReconcileError::CommandMismatch { expected, found } => write!(
                f,
                "The command could not be ended: instruction {expected} is running, not {found}"
            ),
            ReconcileError::ServerDeltaDuringCommand => {
                write!(f, "A server change arrived while a client command was executing")
            }
            ReconcileError::Desynchronized => {
                write!(f, "Collection was modified in a way the server change cannot be applied to")
            }
            ReconcileError::Unconfirmed { added, removed } => write!(
                f,
                "The client made {added} additions and {removed} removals the server did not"
            ),
        }
    }
}

impl std::error::Error for ReconcileError {}

/// Per-client ledger of speculative additions and removals.
#[derive(Debug)]
pub struct CollectionReconciler<C, T> {
    current: Option<InstructionId>,
    added: Vec<PendingEdit<C, T>>,
    removed: Vec<PendingEdit<C, T>>,
}

impl<C, T> Default for CollectionReconciler<C, T> {
    fn default() -> Self {
        Self {
            current: None,
            added: Vec::new(),
            removed: Vec::new(),
        }
    }
}

impl<C: Copy + Eq, T> CollectionReconciler<C, T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_command_start(&mut self, instruction: InstructionId) -> Result<(), ReconcileError> {
        if let Some(running) = self.current {
            return Err(ReconcileError::CommandAlreadyRunning(running));
        }
        self.current = Some(instruction);
        Ok(())
    }

    pub fn on_command_end(&mut self, instruction: InstructionId) -> Result<(), ReconcileError> {
        match self.current {
            None => Err(ReconcileError::NoCommandRunning),
            Some(running) if running != instruction => Err(ReconcileError::CommandMismatch {
                expected: running,
                found: instruction,
            }),
            Some(_) => {
                self.current = None;
                Ok(())
            }
        }
    }

    /// Instruction currently recording edits, if any.
    pub fn current(&self) -> Option<InstructionId> {
        self.current
    }

    pub fn on_added_client_side(
        &mut self,
        collection: C,
        item: T,
        index: usize,
    ) -> Result<(), ReconcileError> {
        let instruction = self.current.ok_or(ReconcileError::NoCommandRunning)?;
        self.added.push(PendingEdit {
            collection,
            item,
            index,
            instruction,
        });
        Ok(())
    }

    pub fn on_removed_client_side(
        &mut self,
        collection: C,
        item: T,
        index: usize,
    ) -> Result<(), ReconcileError> {
        let instruction = self.current.ok_or(ReconcileError::NoCommandRunning)?;
        self.removed.push(PendingEdit {
            collection,
            item,
            index,
            instruction,
        });
        Ok(())
    }

    /// Reconcile a server-side addition.
    ///
    /// Returns `true` when a speculative addition accounted for it; `confirm`
    /// has then been called with that edit. Returns `false` when the caller
    /// should apply the delta itself.
    pub fn on_added_server_side<F>(
        &mut self,
        collection: C,
        instruction: InstructionId,
        confirm: F,
    ) -> Result<bool, ReconcileError>
    where
        F: FnOnce(PendingEdit<C, T>) -> Result<(), ReconcileError>,
    {
        if self.current.is_some() {
            return Err(ReconcileError::ServerDeltaDuringCommand);
        }
        reconcile(&mut self.added, &self.removed, collection, instruction, confirm)
    }

    /// Reconcile a server-side removal. Same contract as
    /// [`on_added_server_side`](Self::on_added_server_side).
    pub fn on_removed_server_side<F>(
        &mut self,
        collection: C,
        instruction: InstructionId,
        confirm: F,
    ) -> Result<bool, ReconcileError>
    where
        F: FnOnce(PendingEdit<C, T>) -> Result<(), ReconcileError>,
    {
        if self.current.is_some() {
            return Err(ReconcileError::ServerDeltaDuringCommand);
        }
        reconcile(&mut self.removed, &self.added, collection, instruction, confirm)
    }

    /// Fails if any speculative edit is still unconfirmed. Only meaningful
    /// once the server has no commands pending for this client.
    pub fn assert_consistent_when_idle(&self) -> Result<(), ReconcileError> {
        if self.added.is_empty() && self.removed.is_empty() {
            Ok(())
        } else {
            Err(ReconcileError::Unconfirmed {
                added: self.added.len(),
                removed: self.removed.len(),
            })
        }
    }

    pub fn pending(&self) -> usize {
        self.added.len() + self.removed.len()
    }

    pub fn clear(&mut self) {
        self.current = None;
        self.added.clear();
        self.removed.clear();
    }
}

/// Confirms the first matching entry of `ledger`. Any other speculative edit
/// on the collection, of either kind, means the delta cannot be placed.
fn reconcile<C: Copy + Eq, T, F>(
    ledger: &mut Vec<PendingEdit<C, T>>,
    other: &[PendingEdit<C, T>],
    collection: C,
    instruction: InstructionId,
    confirm: F,
) -> Result<bool, ReconcileError>
where
    F: FnOnce(PendingEdit<C, T>) -> Result<(), ReconcileError>,
{
    let found = ledger
        .iter()
        .position(|e| e.collection == collection && e.instruction == instruction);
    if let Some(position) = found {
        confirm(ledger.remove(position))?;
        return Ok(true);
    }
    if ledger
        .iter()
        .chain(other)
        .any(|e| e.collection == collection)
    {
        return Err(ReconcileError::Desynchronized);
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    type Ledger = CollectionReconciler<u8, &'static str>;

    #[test]
    fn test_command_bracketing() {
        let mut ledger = Ledger::new();
        assert_eq!(ledger.on_command_end(InstructionId(1)), Err(ReconcileError::NoCommandRunning));
        ledger.on_command_start(InstructionId(1)).unwrap();
        assert_eq!(
            ledger.on_command_start(InstructionId(2)),
            Err(ReconcileError::CommandAlreadyRunning(InstructionId(1)))
        );
        assert_eq!(
            ledger.on_command_end(InstructionId(2)),
            Err(ReconcileError::CommandMismatch {
                expected: InstructionId(1),
                found: InstructionId(2)
            })
        );
        ledger.on_command_end(InstructionId(1)).unwrap();
        assert_eq!(ledger.current(), None);
    }

    #[test]
    fn test_client_edit_requires_running_command() {
        let mut ledger = Ledger::new();
        assert_eq!(
            ledger.on_added_client_side(0, "a", 0),
            Err(ReconcileError::NoCommandRunning)
        );
    }

    #[test]
    fn test_matching_addition_is_handled() {
        let mut ledger = Ledger::new();
        ledger.on_command_start(InstructionId(4)).unwrap();
        ledger.on_added_client_side(7, "x", 0).unwrap();
        ledger.on_command_end(InstructionId(4)).unwrap();

        let mut confirmed = None;
        let handled = ledger
            .on_added_server_side(7, InstructionId(4), |edit| {
                confirmed = Some(edit.item);
                Ok(())
            })
            .unwrap();
        assert!(handled);
        assert_eq!(confirmed, Some("x"));
        assert!(ledger.assert_consistent_when_idle().is_ok());
    }

    #[test]
    fn test_untouched_collection_passes_through() {
        let mut ledger = Ledger::new();
        ledger.on_command_start(InstructionId(1)).unwrap();
        ledger.on_added_client_side(1, "x", 0).unwrap();
        ledger.on_command_end(InstructionId(1)).unwrap();

        let handled = ledger
            .on_removed_server_side(2, InstructionId::NONE, |_| panic!("nothing to confirm"))
            .unwrap();
        assert!(!handled);
        assert_eq!(ledger.pending(), 1);
    }

    #[test]
    fn test_unmatched_edit_on_same_collection_desyncs() {
        let mut ledger = Ledger::new();
        ledger.on_command_start(InstructionId(1)).unwrap();
        ledger.on_added_client_side(3, "x", 0).unwrap();
        ledger.on_command_end(InstructionId(1)).unwrap();

        let result = ledger.on_added_server_side(3, InstructionId(9), |_| Ok(()));
        assert_eq!(result, Err(ReconcileError::Desynchronized));
    }

    #[test]
    fn test_pending_addition_blocks_foreign_removal() {
        let mut ledger = Ledger::new();
        ledger.on_command_start(InstructionId(5)).unwrap();
        ledger.on_added_client_side(3, "x", 2).unwrap();
        ledger.on_command_end(InstructionId(5)).unwrap();

        let result = ledger.on_removed_server_side(3, InstructionId(77), |_| Ok(()));
        assert_eq!(result, Err(ReconcileError::Desynchronized));
        assert_eq!(ledger.pending(), 1);
    }

    #[test]
    fn test_pending_removal_blocks_foreign_addition() {
        let mut ledger = Ledger::new();
        ledger.on_command_start(InstructionId(5)).unwrap();
        ledger.on_removed_client_side(3, "x", 0).unwrap();
        ledger.on_command_end(InstructionId(5)).unwrap();

        let result = ledger.on_added_server_side(3, InstructionId::NONE, |_| Ok(()));
        assert_eq!(result, Err(ReconcileError::Desynchronized));
        assert_eq!(ledger.pending(), 1);
    }

    #[test]
    fn test_mixed_edits_confirm_in_server_order() {
        let mut ledger = Ledger::new();
        ledger.on_command_start(InstructionId(2)).unwrap();
        ledger.on_removed_client_side(0, "old", 0).unwrap();
        ledger.on_added_client_side(0, "new", 0).unwrap();
        ledger.on_command_end(InstructionId(2)).unwrap();

        assert!(ledger
            .on_removed_server_side(0, InstructionId(2), |_| Ok(()))
            .unwrap());
        assert!(ledger
            .on_added_server_side(0, InstructionId(2), |_| Ok(()))
            .unwrap());
        assert!(ledger.assert_consistent_when_idle().is_ok());
    }

    #[test]
    fn test_server_delta_during_command_is_rejected() {
        let mut ledger = Ledger::new();
        ledger.on_command_start(InstructionId(1)).unwrap();
        let result = ledger.on_added_server_side(0, InstructionId(1), |_| Ok(()));
        assert_eq!(result, Err(ReconcileError::ServerDeltaDuringCommand));
    }

    #[test]
    fn test_same_instruction_matches_in_order() {
        let mut ledger = Ledger::new();
        ledger.on_command_start(InstructionId(2)).unwrap();
        ledger.on_added_client_side(0, "first", 0).unwrap();
        ledger.on_added_client_side(0, "second", 1).unwrap();
        ledger.on_command_end(InstructionId(2)).unwrap();

        let mut order = Vec::new();
        for _ in 0..2 {
            ledger
                .on_added_server_side(0, InstructionId(2), |edit| {
                    order.push(edit.item);
                    Ok(())
                })
                .unwrap();
        }
        assert_eq!(order, vec!["first", "second"]);
    }

    #[test]
    fn test_unconfirmed_edits_reported() {
        let mut ledger = Ledger::new();
        ledger.on_command_start(InstructionId(1)).unwrap();
        ledger.on_added_client_side(0, "a", 0).unwrap();
        ledger.on_removed_client_side(0, "b", 1).unwrap();
        ledger.on_command_end(InstructionId(1)).unwrap();
        assert_eq!(
            ledger.assert_consistent_when_idle(),
            Err(ReconcileError::Unconfirmed { added: 1, removed: 1 })
        );
        ledger.clear();
        assert!(ledger.assert_consistent_when_idle().is_ok());
    }
}
