//! Change vocabulary and wire envelope.
//!
//! Every response of the sync endpoints is a [`Response`]: the drained list
//! of changes plus a `rerequest` flag. Changes are JSON objects discriminated
//! by their shape, with camelCase field names:
//!
//! ```text
//! PropertyChange           { id, propertyName, value }
//! CollectionItemAdded      { id, item, index?, instructionId }
//! CollectionItemRemoved    { id, removedItemId?, index, instructionId }
//! CollectionItemsReordered { id, index1, index2 }
//! Reference                { __id, isCollection }
//! ```
//!
//! Snapshots and incremental updates use the same vocabulary, so the client
//! has a single apply path.

use crate::identity::NodeId;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};

/// Correlates collection deltas with the client instruction that caused them.
///
/// `0` means the delta was not caused by a client instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstructionId(pub u32);

impl InstructionId {
    pub const NONE: InstructionId = InstructionId(0);

    pub fn is_none(self) -> bool {
        self == Self::NONE
    }
}

impl std::fmt::Display for InstructionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Pointer to a tracked node inside a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Reference {
    #[serde(rename = "__id")]
    pub id: NodeId,
    #[serde(rename = "isCollection")]
    pub is_collection: bool,
}

/// A value on the wire: either a primitive or a reference to a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    Reference(Reference),
    Value(serde_json::Value),
}

impl Payload {
    pub fn reference(id: NodeId, is_collection: bool) -> Self {
        Payload::Reference(Reference { id, is_collection })
    }

    pub fn as_reference(&self) -> Option<Reference> {
        match self {
            Payload::Reference(r) => Some(*r),
            Payload::Value(_) => None,
        }
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Payload::Value(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyChange {
    pub id: NodeId,
    pub property_name: String,
    pub value: Payload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionItemAdded {
    pub id: NodeId,
    pub item: Payload,
    /// `None` appends.
    pub index: Option<usize>,
    pub instruction_id: InstructionId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionItemRemoved {
    pub id: NodeId,
    /// Absent for primitive elements.
    pub removed_item_id: Option<NodeId>,
    pub index: usize,
    pub instruction_id: InstructionId,
}

/// Never produced by the tracker; rejected by the client mirror.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionItemsReordered {
    pub id: NodeId,
    pub index1: usize,
    pub index2: usize,
}

/// One delta. Variant order matters for shape-based decoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Change {
    Property(PropertyChange),
    ItemAdded(CollectionItemAdded),
    ItemRemoved(CollectionItemRemoved),
    ItemsReordered(CollectionItemsReordered),
}

impl Change {
    pub fn property(id: NodeId, name: impl Into<String>, value: Payload) -> Self {
        Change::Property(PropertyChange {
            id,
            property_name: name.into(),
            value,
        })
    }

    pub fn item_added(
        id: NodeId,
        item: Payload,
        index: Option<usize>,
        instruction_id: InstructionId,
    ) -> Self {
        Change::ItemAdded(CollectionItemAdded {
            id,
            item,
            index,
            instruction_id,
        })
    }

    pub fn item_removed(
        id: NodeId,
        removed_item_id: Option<NodeId>,
        index: usize,
        instruction_id: InstructionId,
    ) -> Self {
        Change::ItemRemoved(CollectionItemRemoved {
            id,
            removed_item_id,
            index,
            instruction_id,
        })
    }

    /// Id of the node the change is addressed to.
    pub fn id(&self) -> NodeId {
        match self {
            Change::Property(c) => c.id,
            Change::ItemAdded(c) => c.id,
            Change::ItemRemoved(c) => c.id,
            Change::ItemsReordered(c) => c.id,
        }
    }

    /// Correlation id for collection deltas.
    pub fn instruction_id(&self) -> Option<InstructionId> {
        match self {
            Change::ItemAdded(c) => Some(c.instruction_id),
            Change::ItemRemoved(c) => Some(c.instruction_id),
            Change::Property(_) | Change::ItemsReordered(_) => None,
        }
    }
}

/// Envelope returned by `open`, `executeCommand` and `registerRequest`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Response {
    pub changes: Vec<Change>,
    /// The client should immediately issue another `registerRequest`.
    pub rerequest: bool,
}

impl Response {
    pub fn new(changes: Vec<Change>, rerequest: bool) -> Self {
        Self { changes, rerequest }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

/// Request body of `executeCommand`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandInstruction {
    pub command_name: String,
    pub view_model_id: i64,
    #[serde(default)]
    pub event_args: serde_json::Value,
    #[serde(default)]
    pub instruction_id: InstructionId,
}

impl CommandInstruction {
    pub fn new(command_name: impl Into<String>, view_model_id: NodeId) -> Self {
        Self {
            command_name: command_name.into(),
            view_model_id: i64::from(view_model_id.0),
            event_args: serde_json::Value::Object(Default::default()),
            instruction_id: InstructionId::NONE,
        }
    }

    pub fn with_args(mut self, event_args: serde_json::Value) -> Self {
        self.event_args = event_args;
        self
    }

    pub fn with_instruction(mut self, instruction_id: InstructionId) -> Self {
        self.instruction_id = instruction_id;
        self
    }

    /// Validate the instruction and return its target id.
    pub fn check(&self) -> Result<NodeId, InstructionError> {
        if self.command_name.trim().is_empty() {
            return Err(InstructionError::EmptyCommandName);
        }
        if self.event_args.is_null() {
            return Err(InstructionError::MissingEventArgs);
        }
        if self.view_model_id < 0 {
            return Err(InstructionError::NegativeViewModelId);
        }
        u32::try_from(self.view_model_id)
            .map(NodeId)
            .map_err(|_| InstructionError::ViewModelIdOutOfRange(self.view_model_id))
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

/// Malformed command instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstructionError {
    EmptyCommandName,
    MissingEventArgs,
    NegativeViewModelId,
    ViewModelIdOutOfRange(i64),
}

impl std::fmt::Display for InstructionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstructionError::EmptyCommandName => write!(f, "An empty command name was specified"),
            InstructionError::MissingEventArgs => write!(f, "No event args were specified"),
            InstructionError::NegativeViewModelId => {
                write!(f, "A negative view model id was specified")
            }
            InstructionError::ViewModelIdOutOfRange(id) => {
                write!(f, "View model id {id} is out of range")
            }
        }
    }
}

impl std::error::Error for InstructionError {}

/// Wire encoding errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            ProtocolError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Pending changes of one session, appended in mutation order and drained
/// atomically on flush.
#[derive(Debug, Clone, Default)]
pub struct ChangeLog {
    changes: Arc<Mutex<Vec<Change>>>,
}

impl ChangeLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, change: Change) {
        self.changes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(change);
    }

    pub fn drain(&self) -> Vec<Change> {
        std::mem::take(&mut *self.changes.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn len(&self) -> usize {
        self.changes.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
