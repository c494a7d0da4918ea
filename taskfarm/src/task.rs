//! Pending-call bookkeeping

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use serde_json::Value as JsonValue;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::FarmError;

pub(crate) type UpdateHandler = Arc<dyn Fn(JsonValue) + Send + Sync>;

/// One pending remote call. Owned exclusively by the coordinator from
/// submission until it settles; the id stays the same across retry
/// attempts so the caller observes exactly one settlement.
pub(crate) struct Task {
    pub id: Uuid,
    pub method: String,
    pub args: Vec<JsonValue>,
    pub worker_key: Option<String>,
    pub retries_remaining: u32,
    pub attempts: u32,
    pub on_update: Option<UpdateHandler>,
    reply: Option<oneshot::Sender<Result<JsonValue, FarmError>>>,
}

impl Task {
    pub fn new(
        method: String,
        args: Vec<JsonValue>,
        on_update: Option<UpdateHandler>,
        reply: oneshot::Sender<Result<JsonValue, FarmError>>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            method,
            args,
            worker_key: None,
            retries_remaining: 0,
            attempts: 0,
            on_update,
            reply: Some(reply),
        }
    }

    /// Settle the caller's future. A caller that dropped its handle is
    /// simply no longer listening; that is not an error.
    pub fn settle(mut self, outcome: Result<JsonValue, FarmError>) {
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(outcome);
        }
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("method", &self.method)
            .field("worker_key", &self.worker_key)
            .field("retries_remaining", &self.retries_remaining)
            .field("attempts", &self.attempts)
            .finish()
    }
}

/// Future returned for a submitted call; resolves when the task settles.
pub struct PendingCall {
    rx: oneshot::Receiver<Result<JsonValue, FarmError>>,
}

impl PendingCall {
    pub(crate) fn new(rx: oneshot::Receiver<Result<JsonValue, FarmError>>) -> Self {
        Self { rx }
    }
}

impl Future for PendingCall {
    type Output = Result<JsonValue, FarmError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|settled| match settled {
            Ok(outcome) => outcome,
            // The coordinator went away without settling; the farm is gone
            Err(_) => Err(FarmError::Ended),
        })
    }
}
