//! Wire protocol definitions and message types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// Wire protocol version for compatibility checking
pub const WIRE_PROTOCOL_VERSION: u32 = 1;

/// Messages sent from the farm coordinator to a worker unit
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// One-time handshake, delivered before any call. `setup_args` is an
    /// opaque payload handed to the module's `setup` hook.
    Setup { setup_args: JsonValue },

    /// Invoke an exported method
    Call {
        call_id: Uuid,
        method: String,
        args: Vec<JsonValue>,
    },

    /// Out-of-band payload the farm does not interpret (broadcast)
    Message { payload: JsonValue },

    /// Drain and exit
    Shutdown,
}

/// Messages sent from a worker unit back to the farm coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FarmMessage {
    /// The unit loaded its module and can accept calls. `methods` lists the
    /// module's exported method names for callable-surface validation.
    Ready { pid: u32, methods: Vec<String> },

    /// Successful call completion
    Result { call_id: Uuid, output: JsonValue },

    /// The invoked method returned an error
    Error { call_id: Uuid, error: ErrorInfo },

    /// Side-channel payload emitted while the identified call is in flight
    Message { call_id: Uuid, payload: JsonValue },

    /// Teardown finished after a `Shutdown`
    ShutdownAck,

    /// Unit-level failure outside any call (e.g. setup failed)
    Fault { error: String },
}

/// Application error carried across the unit boundary. Name, message and
/// stack text survive reconstruction so callers see the original failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
}

impl ErrorInfo {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

/// Envelope wrapping every frame on the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope<T> {
    pub protocol_version: u32,
    pub timestamp: DateTime<Utc>,
    pub message: T,
}

impl<T> MessageEnvelope<T> {
    /// Create a new envelope stamped with the current protocol version
    pub fn new(message: T) -> Self {
        Self {
            protocol_version: WIRE_PROTOCOL_VERSION,
            timestamp: Utc::now(),
            message,
        }
    }

    /// Check if the peer speaks our protocol version
    pub fn is_compatible(&self) -> bool {
        self.protocol_version == WIRE_PROTOCOL_VERSION
    }
}
