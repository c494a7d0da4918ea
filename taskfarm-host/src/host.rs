//! Long-lived worker host
//!
//! One host runs inside every execution unit. It performs the setup
//! handshake, reports the module's exported methods, then serves calls one
//! at a time: the coordinator never pipelines, so at most one invocation is
//! in flight. Side-channel payloads emitted by the running call are
//! forwarded as they arrive, always ahead of the call's completion frame.

use std::sync::Arc;

use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use taskfarm_ipc::{
    FarmMessage, IpcError, MessageEnvelope, StdioTransport, Transport, WorkerMessage,
};

use crate::module::{CallContext, MethodResult, ModuleError, WorkerModule};

/// Errors terminating the host loop. Any of these ends the unit; the
/// coordinator observes the closed channel and reacts (restart or fatal
/// configuration error, depending on whether `Ready` was ever sent).
#[derive(Debug, Error)]
pub enum HostError {
    /// The module's setup hook failed; reported as a `Fault` before exit
    #[error("module setup failed: {0}")]
    Setup(ModuleError),

    /// The module panicked while serving a call; the unit is unusable
    #[error("module panicked while serving `{method}`")]
    ModulePanic { method: String },

    /// The coordinator sent something the protocol does not allow here
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The transport failed or the coordinator went away
    #[error("transport failure: {0}")]
    Ipc(#[from] IpcError),
}

type RunningCall = (Uuid, String, JoinHandle<MethodResult>);

/// Await the in-flight invocation, if any. Pends forever when idle so this
/// can sit in a `select!` arm without a precondition.
async fn finish_call(
    running: &mut Option<RunningCall>,
) -> (Uuid, String, Result<MethodResult, tokio::task::JoinError>) {
    if let Some((call_id, method, handle)) = running.as_mut() {
        let outcome = handle.await;
        let finished = (*call_id, method.clone(), outcome);
        *running = None;
        finished
    } else {
        std::future::pending().await
    }
}

/// The worker-side host loop around one module instance
pub struct WorkerHost<T> {
    transport: T,
    module: Arc<dyn WorkerModule>,
    updates_tx: mpsc::UnboundedSender<(Uuid, JsonValue)>,
    updates_rx: mpsc::UnboundedReceiver<(Uuid, JsonValue)>,
    calls_served: u64,
    calls_failed: u64,
}

impl<T> WorkerHost<T>
where
    T: Transport<FarmMessage, WorkerMessage>,
{
    pub fn new(transport: T, module: Arc<dyn WorkerModule>) -> Self {
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        Self {
            transport,
            module,
            updates_tx,
            updates_rx,
            calls_served: 0,
            calls_failed: 0,
        }
    }

    /// Run the host until shutdown or failure
    pub async fn run(mut self) -> Result<(), HostError> {
        // Handshake: Setup must be the first frame on the wire
        let setup_args = match self.transport.receive().await?.message {
            WorkerMessage::Setup { setup_args } => setup_args,
            other => {
                return Err(HostError::Protocol(format!(
                    "expected setup as first message, got {:?}",
                    other
                )))
            }
        };

        if let Err(e) = self.module.setup(&setup_args) {
            // A module that cannot load is a configuration error, not a
            // transient fault; tell the coordinator before dying.
            let _ = self
                .send(FarmMessage::Fault {
                    error: e.to_string(),
                })
                .await;
            return Err(HostError::Setup(e));
        }

        let methods: Vec<String> = self.module.methods().iter().map(|m| m.to_string()).collect();
        debug!(pid = std::process::id(), ?methods, "worker host ready");
        self.send(FarmMessage::Ready {
            pid: std::process::id(),
            methods,
        })
        .await?;

        let mut running: Option<RunningCall> = None;
        let mut shutting_down = false;

        loop {
            if shutting_down && running.is_none() {
                debug!(
                    served = self.calls_served,
                    failed = self.calls_failed,
                    "worker host shutting down"
                );
                self.module.teardown();
                self.send(FarmMessage::ShutdownAck).await?;
                let _ = self.transport.close().await;
                return Ok(());
            }

            tokio::select! {
                biased;

                Some((call_id, payload)) = self.updates_rx.recv(), if running.is_some() => {
                    self.send(FarmMessage::Message { call_id, payload }).await?;
                }

                (call_id, method, outcome) = finish_call(&mut running) => {
                    // Flush updates emitted before completion so they reach
                    // the caller ahead of the settlement frame.
                    while let Ok((id, payload)) = self.updates_rx.try_recv() {
                        self.send(FarmMessage::Message { call_id: id, payload }).await?;
                    }

                    match outcome {
                        Ok(Ok(output)) => {
                            self.calls_served += 1;
                            self.send(FarmMessage::Result { call_id, output }).await?;
                        }
                        Ok(Err(err)) => {
                            self.calls_served += 1;
                            self.calls_failed += 1;
                            self.send(FarmMessage::Error { call_id, error: err.into() }).await?;
                        }
                        Err(join_err) => {
                            warn!(%method, "module panicked: {}", join_err);
                            return Err(HostError::ModulePanic { method });
                        }
                    }
                }

                frame = self.transport.receive() => {
                    match frame?.message {
                        WorkerMessage::Call { call_id, method, args } => {
                            if running.is_some() {
                                return Err(HostError::Protocol(
                                    "call received while another is in flight".to_string(),
                                ));
                            }
                            if shutting_down {
                                return Err(HostError::Protocol(
                                    "call received after shutdown".to_string(),
                                ));
                            }

                            let module = Arc::clone(&self.module);
                            let ctx = CallContext::new(call_id, self.updates_tx.clone());
                            let name = method.clone();
                            let handle = tokio::task::spawn_blocking(move || {
                                module.invoke(&name, args, &ctx)
                            });
                            running = Some((call_id, method, handle));
                        }
                        WorkerMessage::Message { payload } => {
                            self.module.on_message(&payload);
                        }
                        WorkerMessage::Setup { .. } => {
                            return Err(HostError::Protocol("duplicate setup".to_string()));
                        }
                        WorkerMessage::Shutdown => {
                            shutting_down = true;
                        }
                    }
                }
            }
        }
    }

    async fn send(&mut self, message: FarmMessage) -> Result<(), HostError> {
        self.transport
            .send(&MessageEnvelope::new(message))
            .await
            .map_err(HostError::from)
    }
}

/// Entry point for process-mode worker binaries running under an existing
/// runtime; serves the module over the process's stdin/stdout.
pub async fn worker_main<M: WorkerModule>(module: M) -> Result<(), HostError> {
    WorkerHost::new(StdioTransport::new(), Arc::new(module)).run().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use taskfarm_ipc::{channel_pair, ChannelTransport};

    #[derive(Default)]
    struct ArithModule {
        fail_setup: bool,
        torn_down: AtomicBool,
        broadcasts: AtomicUsize,
    }

    impl WorkerModule for ArithModule {
        fn methods(&self) -> Vec<&'static str> {
            vec!["add", "boom", "progress", "panic", "broadcasts_seen"]
        }

        fn invoke(&self, method: &str, args: Vec<JsonValue>, ctx: &CallContext) -> MethodResult {
            match method {
                "add" => {
                    let a = args.first().and_then(JsonValue::as_i64).unwrap_or(0);
                    let b = args.get(1).and_then(JsonValue::as_i64).unwrap_or(0);
                    Ok(json!(a + b))
                }
                "boom" => Err(ModuleError::new("boom")),
                "progress" => {
                    ctx.emit(json!({"step": 1}));
                    ctx.emit(json!({"step": 2}));
                    Ok(json!("done"))
                }
                "panic" => panic!("worker blew up"),
                "broadcasts_seen" => Ok(json!(self.broadcasts.load(Ordering::SeqCst))),
                other => Err(ModuleError::named(
                    "MethodNotFound",
                    format!("unknown method `{}`", other),
                )),
            }
        }

        fn setup(&self, _setup_args: &JsonValue) -> Result<(), ModuleError> {
            if self.fail_setup {
                Err(ModuleError::new("bad module config"))
            } else {
                Ok(())
            }
        }

        fn teardown(&self) {
            self.torn_down.store(true, Ordering::SeqCst);
        }

        fn on_message(&self, _payload: &JsonValue) {
            self.broadcasts.fetch_add(1, Ordering::SeqCst);
        }
    }

    type FarmEnd = ChannelTransport<WorkerMessage, FarmMessage>;

    fn spawn_host(
        module: Arc<ArithModule>,
    ) -> (FarmEnd, tokio::task::JoinHandle<Result<(), HostError>>) {
        let (farm_end, worker_end) = channel_pair::<WorkerMessage, FarmMessage>();
        let host = WorkerHost::new(worker_end, module as Arc<dyn WorkerModule>);
        (farm_end, tokio::spawn(host.run()))
    }

    async fn send(end: &mut FarmEnd, message: WorkerMessage) {
        end.send(&MessageEnvelope::new(message)).await.unwrap();
    }

    async fn recv(end: &mut FarmEnd) -> FarmMessage {
        end.receive().await.unwrap().message
    }

    async fn handshake(end: &mut FarmEnd) -> Vec<String> {
        send(end, WorkerMessage::Setup { setup_args: json!(null) }).await;
        match recv(end).await {
            FarmMessage::Ready { methods, .. } => methods,
            other => panic!("expected ready, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_handshake_reports_methods() {
        let (mut farm, _host) = spawn_host(Arc::new(ArithModule::default()));
        let methods = handshake(&mut farm).await;
        assert!(methods.contains(&"add".to_string()));
        assert!(methods.contains(&"boom".to_string()));
    }

    #[tokio::test]
    async fn test_call_returns_result() {
        let (mut farm, _host) = spawn_host(Arc::new(ArithModule::default()));
        handshake(&mut farm).await;

        let call_id = Uuid::new_v4();
        send(
            &mut farm,
            WorkerMessage::Call {
                call_id,
                method: "add".to_string(),
                args: vec![json!(2), json!(3)],
            },
        )
        .await;

        match recv(&mut farm).await {
            FarmMessage::Result { call_id: id, output } => {
                assert_eq!(id, call_id);
                assert_eq!(output, json!(5));
            }
            other => panic!("expected result, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_application_error_propagates() {
        let (mut farm, _host) = spawn_host(Arc::new(ArithModule::default()));
        handshake(&mut farm).await;

        send(
            &mut farm,
            WorkerMessage::Call {
                call_id: Uuid::new_v4(),
                method: "boom".to_string(),
                args: vec![],
            },
        )
        .await;

        match recv(&mut farm).await {
            FarmMessage::Error { error, .. } => {
                assert_eq!(error.name, "Error");
                assert_eq!(error.message, "boom");
            }
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_updates_arrive_before_completion() {
        let (mut farm, _host) = spawn_host(Arc::new(ArithModule::default()));
        handshake(&mut farm).await;

        let call_id = Uuid::new_v4();
        send(
            &mut farm,
            WorkerMessage::Call {
                call_id,
                method: "progress".to_string(),
                args: vec![],
            },
        )
        .await;

        let mut updates = Vec::new();
        loop {
            match recv(&mut farm).await {
                FarmMessage::Message { call_id: id, payload } => {
                    assert_eq!(id, call_id);
                    updates.push(payload);
                }
                FarmMessage::Result { output, .. } => {
                    assert_eq!(output, json!("done"));
                    break;
                }
                other => panic!("unexpected frame: {:?}", other),
            }
        }
        assert_eq!(updates, vec![json!({"step": 1}), json!({"step": 2})]);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_module() {
        let (mut farm, _host) = spawn_host(Arc::new(ArithModule::default()));
        handshake(&mut farm).await;

        send(
            &mut farm,
            WorkerMessage::Message {
                payload: json!({"note": "hello"}),
            },
        )
        .await;
        send(
            &mut farm,
            WorkerMessage::Call {
                call_id: Uuid::new_v4(),
                method: "broadcasts_seen".to_string(),
                args: vec![],
            },
        )
        .await;

        match recv(&mut farm).await {
            FarmMessage::Result { output, .. } => assert_eq!(output, json!(1)),
            other => panic!("expected result, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_shutdown_acks_after_teardown() {
        let module = Arc::new(ArithModule::default());
        let (mut farm, host) = spawn_host(Arc::clone(&module));
        handshake(&mut farm).await;

        send(&mut farm, WorkerMessage::Shutdown).await;
        assert!(matches!(recv(&mut farm).await, FarmMessage::ShutdownAck));
        assert!(module.torn_down.load(Ordering::SeqCst));
        assert!(host.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_setup_failure_reports_fault() {
        let module = Arc::new(ArithModule {
            fail_setup: true,
            ..Default::default()
        });
        let (mut farm, host) = spawn_host(module);

        send(&mut farm, WorkerMessage::Setup { setup_args: json!(null) }).await;
        match recv(&mut farm).await {
            FarmMessage::Fault { error } => assert!(error.contains("bad module config")),
            other => panic!("expected fault, got {:?}", other),
        }
        assert!(matches!(host.await.unwrap(), Err(HostError::Setup(_))));
    }

    #[tokio::test]
    async fn test_module_panic_kills_host() {
        let (mut farm, host) = spawn_host(Arc::new(ArithModule::default()));
        handshake(&mut farm).await;

        send(
            &mut farm,
            WorkerMessage::Call {
                call_id: Uuid::new_v4(),
                method: "panic".to_string(),
                args: vec![],
            },
        )
        .await;

        assert!(matches!(
            host.await.unwrap(),
            Err(HostError::ModulePanic { .. })
        ));
        // The unit is gone; the coordinator sees a closed channel
        assert!(matches!(
            farm.receive().await,
            Err(IpcError::ChannelClosed)
        ));
    }
}
