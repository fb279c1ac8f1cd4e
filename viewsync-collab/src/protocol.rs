//! JSON request/reply framing over WebSocket text frames.
//!
//! ```text
//! client ──► { "type": "open",            "requestId": 1, "user": "alice" }
//!        ──► { "type": "executeCommand",  "requestId": 2, "instruction": {...} }
//!        ──► { "type": "registerRequest", "requestId": 3 }
//! server ──► { "requestId": 2, "status": "ok" | "canceled" | "failed",
//!              "response": { "changes": [...], "rerequest": false },
//!              "error": "..." }
//! ```
//!
//! Requests on one connection may complete out of order; `requestId`
//! correlates each reply with its request.

use serde::{Deserialize, Serialize};
use viewsync_core::{CommandInstruction, ProtocolError, Response};

/// Client → server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Request {
    /// Select the acting user and fetch a full snapshot.
    Open {
        request_id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user: Option<String>,
    },
    ExecuteCommand {
        request_id: u64,
        instruction: CommandInstruction,
    },
    /// Long-poll for changes.
    RegisterRequest { request_id: u64 },
}

impl Request {
    pub fn request_id(&self) -> u64 {
        match self {
            Request::Open { request_id, .. }
            | Request::ExecuteCommand { request_id, .. }
            | Request::RegisterRequest { request_id } => *request_id,
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    Ok,
    /// The command's precondition did not hold.
    Canceled,
    Failed,
}

/// Server → client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reply {
    pub request_id: u64,
    pub status: ReplyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Response>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Reply {
    pub fn ok(request_id: u64, response: Response) -> Self {
        Self {
            request_id,
            status: ReplyStatus::Ok,
            response: Some(response),
            error: None,
        }
    }

    pub fn canceled(request_id: u64, response: Response) -> Self {
        Self {
            request_id,
            status: ReplyStatus::Canceled,
            response: Some(response),
            error: None,
        }
    }

    pub fn failed(request_id: u64, error: impl Into<String>) -> Self {
        Self {
            request_id,
            status: ReplyStatus::Failed,
            response: None,
            error: Some(error.into()),
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}
