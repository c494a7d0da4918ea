//! Inter-process communication for taskfarm
//!
//! This crate provides the wire protocol and transport abstractions used for
//! communication between the farm coordinator and its worker units, whether
//! those units are child processes (pipe-based framing) or dedicated threads
//! (in-process channels).

pub mod error;
pub mod protocol;
pub mod transport;

// Re-export commonly used types
pub use error::IpcError;
pub use protocol::{
    ErrorInfo, FarmMessage, MessageEnvelope, WorkerMessage, WIRE_PROTOCOL_VERSION,
};
pub use transport::{
    channel_pair, ChannelTransport, ChildProcessTransport, StdioTransport, Transport,
};
