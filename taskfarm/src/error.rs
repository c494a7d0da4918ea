//! Farm error taxonomy
//!
//! Callers can always distinguish "my function failed" (`Remote`) from "the
//! sandbox died" (`CrashExhausted`, `PoolFailed`) and from their own
//! mistakes (`Config`, `Serialization`).

use thiserror::Error;

use taskfarm_ipc::{ErrorInfo, IpcError};

/// Application error reconstructed from a worker unit, preserving the
/// original name, message and stack text.
#[derive(Debug, Clone, Error)]
#[error("{name}: {message}")]
pub struct RemoteError {
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
}

impl From<ErrorInfo> for RemoteError {
    fn from(info: ErrorInfo) -> Self {
        Self {
            name: info.name,
            message: info.message,
            stack: info.stack,
        }
    }
}

/// Errors surfaced by the farm
#[derive(Debug, Error)]
pub enum FarmError {
    /// Invalid configuration or unresolvable method; fatal, never retried
    #[error("configuration error: {0}")]
    Config(String),

    /// Arguments or results not representable on the wire; task not dispatched
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The called function failed; propagated to the caller exactly once
    #[error(transparent)]
    Remote(RemoteError),

    /// The unit crashed (or timed out) on every permitted attempt
    #[error("worker crashed on all {attempts} attempts (last exit: {last_exit})")]
    CrashExhausted { attempts: u32, last_exit: String },

    /// The farm stopped accepting work, or rejected this task on shutdown
    #[error("farm ended")]
    Ended,

    /// No worker slot can serve tasks any more
    #[error("worker pool failed: {0}")]
    PoolFailed(String),

    /// Transport failure outside the crash-retry path
    #[error("ipc error: {0}")]
    Ipc(#[from] IpcError),
}

impl FarmError {
    /// Whether this error came from the executed function rather than the
    /// farm's own machinery
    pub fn is_application_error(&self) -> bool {
        matches!(self, FarmError::Remote(_))
    }

    /// Whether this error means the farm infrastructure gave up on the task
    pub fn is_infrastructure_error(&self) -> bool {
        matches!(
            self,
            FarmError::CrashExhausted { .. } | FarmError::PoolFailed(_) | FarmError::Ipc(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_error_reconstruction() {
        let info = ErrorInfo::new("TypeError", "boom").with_stack("at run (mod.rs:3)");
        let err = RemoteError::from(info);

        assert_eq!(err.name, "TypeError");
        assert_eq!(err.message, "boom");
        assert_eq!(err.stack.as_deref(), Some("at run (mod.rs:3)"));
        assert_eq!(err.to_string(), "TypeError: boom");
    }

    #[test]
    fn test_error_classification() {
        let remote = FarmError::Remote(RemoteError::from(ErrorInfo::new("Error", "boom")));
        assert!(remote.is_application_error());
        assert!(!remote.is_infrastructure_error());

        let crashed = FarmError::CrashExhausted {
            attempts: 2,
            last_exit: "signal: 9".to_string(),
        };
        assert!(!crashed.is_application_error());
        assert!(crashed.is_infrastructure_error());

        assert!(!FarmError::Ended.is_infrastructure_error());
    }
}
