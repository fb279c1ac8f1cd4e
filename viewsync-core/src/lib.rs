//! # viewsync-core: change tracking for mirrored object graphs
//!
//! Keeps a server-side node graph observable so that a remote client can
//! mirror it from a stream of small deltas.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  schema   ┌──────────────┐
//! │ SchemaRegistry│ ───────► │ Model (arena)│
//! └──────────────┘           └──────┬───────┘
//!                                   │ owned by
//!                                   ▼
//! ┌──────────────┐  ids      ┌──────────────┐  deltas  ┌───────────┐
//! │IdentityTable │ ◄──────── │ View         │ ───────► │ ChangeLog │
//! │ (id ↔ node)  │           │ (tracker)    │          │ (pending) │
//! └──────────────┘           └──────┬───────┘          └───────────┘
//!                                   │ traversal
//!                                   ▼
//!                            ┌──────────────┐
//!                            │ visitor      │
//!                            └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`schema`]: Static per-type property declarations
//! - [`model`]: Node arena and values
//! - [`identity`]: Bidirectional id ↔ node table
//! - [`visitor`]: Schema-driven graph traversal
//! - [`change`]: Wire vocabulary (`Change`, `Response`, `CommandInstruction`)
//! - [`substitution`]: Per-session reported-value substitution
//! - [`view`]: The change tracker

pub mod change;
pub mod identity;
pub mod model;
pub mod schema;
pub mod substitution;
pub mod view;
pub mod visitor;

pub use change::{
    Change, ChangeLog, CollectionItemAdded, CollectionItemRemoved, CollectionItemsReordered,
    CommandInstruction, InstructionError, InstructionId, Payload, PropertyChange, ProtocolError,
    Reference, Response,
};
pub use identity::{IdentityError, IdentityTable, NodeId};
pub use model::{GraphError, Model, NodeData, NodeKey, Value};
pub use schema::{PropertyDescriptor, PropertyKind, Schema, SchemaBuilder, SchemaRegistry};
pub use substitution::Substitutions;
pub use view::{CollectionMutation, View};
pub use visitor::{visit, visit_nodes, GraphVisitor};
