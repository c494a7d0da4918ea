//! Worker module contract

use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use taskfarm_ipc::ErrorInfo;

/// Application-level error returned by a module method. Name, message and
/// optional stack text travel back to the caller unchanged.
#[derive(Debug, Clone, Error)]
#[error("{name}: {message}")]
pub struct ModuleError {
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
}

impl ModuleError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            name: "Error".to_string(),
            message: message.into(),
            stack: None,
        }
    }

    pub fn named(name: impl Into<String>, message: impl Into<String>) -> Self {
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

impl From<ModuleError> for ErrorInfo {
    fn from(err: ModuleError) -> Self {
        ErrorInfo {
            name: err.name,
            message: err.message,
            stack: err.stack,
        }
    }
}

/// Result of one method invocation
pub type MethodResult = Result<JsonValue, ModuleError>;

/// A user-supplied module whose exported methods the farm dispatches to.
///
/// Arguments and return values cross the unit boundary as JSON, so they
/// must be plain data. Returning `Err` is an application failure and
/// propagates to the caller exactly once; panicking counts as a unit crash
/// and goes through the farm's retry policy instead.
pub trait WorkerModule: Send + Sync + 'static {
    /// Names of the callable methods this module exports
    fn methods(&self) -> Vec<&'static str>;

    /// Invoke an exported method with its ordered arguments. Runs on the
    /// unit's blocking thread; one call is in flight at a time.
    fn invoke(&self, method: &str, args: Vec<JsonValue>, ctx: &CallContext) -> MethodResult;

    /// Called once after the unit loads the module, before any call
    fn setup(&self, _setup_args: &JsonValue) -> Result<(), ModuleError> {
        Ok(())
    }

    /// Called once before the unit exits gracefully
    fn teardown(&self) {}

    /// Out-of-band payload broadcast by the farm
    fn on_message(&self, _payload: &JsonValue) {}
}

/// Side channel of the in-flight call. Payloads passed to [`emit`] stream
/// back to the caller's update handler without affecting call completion.
///
/// [`emit`]: CallContext::emit
pub struct CallContext {
    call_id: Uuid,
    updates: mpsc::UnboundedSender<(Uuid, JsonValue)>,
}

impl CallContext {
    pub(crate) fn new(call_id: Uuid, updates: mpsc::UnboundedSender<(Uuid, JsonValue)>) -> Self {
        Self { call_id, updates }
    }

    /// Correlation id of the call being served
    pub fn call_id(&self) -> Uuid {
        self.call_id
    }

    /// Stream a progress payload to the caller. Delivery is best-effort;
    /// a farm that has already given up on the call simply drops it.
    pub fn emit(&self, payload: JsonValue) {
        let _ = self.updates.send((self.call_id, payload));
    }
}
