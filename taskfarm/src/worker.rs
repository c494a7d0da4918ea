//! Worker slot management
//!
//! Each slot owns exactly one execution unit (child process or dedicated
//! thread) and presents the same interface for both. The unit's transport
//! is driven by a spawned IO task; the coordinator talks to it through a
//! command channel and hears back through the shared event channel. A
//! replaced unit keeps its slot id.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value as JsonValue;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use taskfarm_host::WorkerHost;
use taskfarm_ipc::{
    channel_pair, ChildProcessTransport, FarmMessage, IpcError, MessageEnvelope, Transport,
    WorkerMessage,
};

use crate::config::ExecutionMode;
use crate::error::FarmError;
use crate::scheduler::SlotView;
use crate::task::Task;

/// Lifecycle of one worker slot.
///
/// `Spawning -> Idle <-> Busy -> (Exiting | Dead)`; an unexpected exit from
/// any live state lands in `Dead`, a restart goes back through `Spawning`,
/// and an exhausted restart budget parks the slot in `Failed` for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Spawning,
    Idle,
    Busy,
    Exiting,
    Dead,
    Failed,
}

impl std::fmt::Display for SlotState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SlotState::Spawning => "spawning",
            SlotState::Idle => "idle",
            SlotState::Busy => "busy",
            SlotState::Exiting => "exiting",
            SlotState::Dead => "dead",
            SlotState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Instructions from the coordinator to a unit's IO task
#[derive(Debug)]
pub(crate) enum UnitCommand {
    Call {
        call_id: Uuid,
        method: String,
        args: Vec<JsonValue>,
    },
    /// Out-of-band payload (broadcast)
    Message { payload: JsonValue },
    /// Graceful: the host tears down and acks before exiting
    Shutdown,
    /// Immediate termination
    Kill,
}

/// Notifications from IO tasks (and restart timers) to the coordinator
#[derive(Debug)]
pub(crate) enum UnitEvent {
    Ready {
        slot: usize,
        pid: u32,
        methods: Vec<String>,
    },
    Reply {
        slot: usize,
        message: FarmMessage,
    },
    Exited {
        slot: usize,
        reason: ExitReason,
    },
    RespawnDue {
        slot: usize,
    },
}

/// Why a unit went away
#[derive(Debug, Clone)]
pub(crate) enum ExitReason {
    /// Unexpected death: process exited, pipe broke, channel dropped
    Crashed(String),
    /// The in-flight call outlived its deadline; the unit was put down
    TimedOut,
    /// Killed on command (forced shutdown)
    Killed,
    /// Acked a graceful shutdown
    Shutdown,
    /// Faulted before ever becoming ready
    SetupFailed(String),
}

impl ExitReason {
    pub fn detail(&self) -> String {
        match self {
            ExitReason::Crashed(detail) => detail.clone(),
            ExitReason::TimedOut => "call deadline elapsed".to_string(),
            ExitReason::Killed => "killed".to_string(),
            ExitReason::Shutdown => "clean shutdown".to_string(),
            ExitReason::SetupFailed(error) => format!("setup failed: {}", error),
        }
    }
}

/// Per-slot snapshot surfaced through `Farm::stats`
#[derive(Debug, Clone)]
pub struct WorkerStats {
    pub slot: usize,
    pub state: SlotState,
    pub tasks_executed: u64,
    pub tasks_failed: u64,
    pub restart_count: u32,
    pub uptime: Duration,
}

/// Coordinator-side handle for one slot
pub(crate) struct Slot {
    pub id: usize,
    pub state: SlotState,
    pub commands: Option<mpsc::UnboundedSender<UnitCommand>>,
    pub current: Option<Task>,
    pub restart_count: u32,
    pub assignments: u64,
    pub tasks_executed: u64,
    pub tasks_failed: u64,
    pub started_at: Instant,
}

impl Slot {
    pub fn new(id: usize, commands: mpsc::UnboundedSender<UnitCommand>) -> Self {
        Self {
            id,
            state: SlotState::Spawning,
            commands: Some(commands),
            current: None,
            restart_count: 0,
            assignments: 0,
            tasks_executed: 0,
            tasks_failed: 0,
            started_at: Instant::now(),
        }
    }

    pub fn is_alive(&self) -> bool {
        matches!(
            self.state,
            SlotState::Spawning | SlotState::Idle | SlotState::Busy
        )
    }

    /// Send a command to the unit's IO task; false if the unit is gone
    pub fn send(&self, command: UnitCommand) -> bool {
        match &self.commands {
            Some(tx) => tx.send(command).is_ok(),
            None => false,
        }
    }

    pub fn view(&self) -> SlotView {
        SlotView {
            id: self.id,
            idle: self.state == SlotState::Idle,
            alive: self.is_alive(),
            assignments: self.assignments,
        }
    }

    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            slot: self.id,
            state: self.state,
            tasks_executed: self.tasks_executed,
            tasks_failed: self.tasks_failed,
            restart_count: self.restart_count,
            uptime: self.started_at.elapsed(),
        }
    }
}

/// The execution unit behind a slot
enum ExecUnit {
    Process(tokio::process::Child),
    Thread(Option<std::thread::JoinHandle<()>>),
}

impl ExecUnit {
    /// Terminate immediately. Threads cannot be preempted: the transport
    /// drop ends their host loop and the thread is detached.
    async fn terminate(&mut self) {
        match self {
            ExecUnit::Process(child) => {
                let _ = child.kill().await;
            }
            ExecUnit::Thread(handle) => {
                let _ = handle.take();
            }
        }
    }

    /// Wait for the unit to be gone and describe how it went
    async fn reap(&mut self) -> String {
        match self {
            ExecUnit::Process(child) => match child.wait().await {
                Ok(status) => status.to_string(),
                Err(e) => format!("wait failed: {}", e),
            },
            ExecUnit::Thread(handle) => {
                if let Some(handle) = handle.take() {
                    let _ = tokio::task::spawn_blocking(move || handle.join()).await;
                }
                "worker thread terminated".to_string()
            }
        }
    }
}

/// Launch a fresh unit for `slot` and hand its transport to a spawned IO
/// task. Returns the command channel on success; a spawn failure is
/// reported synchronously so the caller can decide whether it is fatal
/// (first start) or another crash (restart).
pub(crate) fn spawn_unit(
    slot: usize,
    mode: &ExecutionMode,
    setup_args: JsonValue,
    call_timeout: Option<Duration>,
    events: mpsc::UnboundedSender<UnitEvent>,
) -> Result<mpsc::UnboundedSender<UnitCommand>, FarmError> {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();

    let (transport, unit): (Box<dyn Transport<WorkerMessage, FarmMessage>>, ExecUnit) = match mode
    {
        ExecutionMode::Process(spec) => {
            let mut child = spec.command().spawn().map_err(|e| {
                FarmError::Config(format!(
                    "failed to spawn worker process `{}`: {}",
                    spec.program().display(),
                    e
                ))
            })?;
            let stdin = child
                .stdin
                .take()
                .ok_or_else(|| FarmError::Config("worker stdin not piped".to_string()))?;
            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| FarmError::Config("worker stdout not piped".to_string()))?;
            (
                Box::new(ChildProcessTransport::new(stdin, stdout)),
                ExecUnit::Process(child),
            )
        }
        ExecutionMode::Thread(factory) => {
            let (farm_end, worker_end) = channel_pair::<WorkerMessage, FarmMessage>();
            let module = factory();
            let handle = std::thread::Builder::new()
                .name(format!("taskfarm-worker-{}", slot))
                .spawn(move || {
                    let runtime = match tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                    {
                        Ok(rt) => rt,
                        Err(e) => {
                            warn!(slot, "failed to build worker runtime: {}", e);
                            return;
                        }
                    };
                    if let Err(e) =
                        runtime.block_on(WorkerHost::new(worker_end, Arc::from(module)).run())
                    {
                        debug!(slot, "worker host exited: {}", e);
                    }
                })
                .map_err(|e| {
                    FarmError::Config(format!("failed to spawn worker thread: {}", e))
                })?;
            (Box::new(farm_end), ExecUnit::Thread(Some(handle)))
        }
    };

    tokio::spawn(unit_io(
        slot,
        transport,
        unit,
        setup_args,
        call_timeout,
        commands_rx,
        events,
    ));
    Ok(commands_tx)
}

async fn next_command(
    queued: &mut VecDeque<UnitCommand>,
    commands: &mut mpsc::UnboundedReceiver<UnitCommand>,
) -> Option<UnitCommand> {
    match queued.pop_front() {
        Some(command) => Some(command),
        None => commands.recv().await,
    }
}

/// Pends forever while no deadline is armed, so it can sit in a `select!`
/// arm unconditionally.
async fn wait_deadline(deadline: &mut Option<Pin<Box<tokio::time::Sleep>>>) {
    match deadline {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

fn exit_detail(err: &IpcError, unit_detail: &str) -> String {
    match err {
        IpcError::ChannelClosed => unit_detail.to_string(),
        other => format!("{} ({})", other, unit_detail),
    }
}

/// Drive one unit's transport: write assigned work, forward replies as
/// events, watch the call deadline, and report the exit. Exactly one
/// `Exited` event is emitted, always last.
async fn unit_io(
    slot: usize,
    mut transport: Box<dyn Transport<WorkerMessage, FarmMessage>>,
    mut unit: ExecUnit,
    setup_args: JsonValue,
    call_timeout: Option<Duration>,
    mut commands: mpsc::UnboundedReceiver<UnitCommand>,
    events: mpsc::UnboundedSender<UnitEvent>,
) {
    // Handshake: Setup out, Ready (or Fault) back. Kill is honored even
    // here so a hung spawn cannot stall a forced shutdown; other commands
    // wait until the unit is ready.
    if let Err(e) = transport
        .send(&MessageEnvelope::new(WorkerMessage::Setup { setup_args }))
        .await
    {
        let detail = unit.reap().await;
        let _ = events.send(UnitEvent::Exited {
            slot,
            reason: ExitReason::Crashed(exit_detail(&e, &detail)),
        });
        return;
    }

    let mut queued: VecDeque<UnitCommand> = VecDeque::new();
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(UnitCommand::Kill) | None => {
                    let _ = transport.close().await;
                    unit.terminate().await;
                    let _ = events.send(UnitEvent::Exited { slot, reason: ExitReason::Killed });
                    return;
                }
                Some(other) => queued.push_back(other),
            },
            frame = transport.receive() => match frame {
                Ok(envelope) => match envelope.message {
                    FarmMessage::Ready { pid, methods } => {
                        let _ = events.send(UnitEvent::Ready { slot, pid, methods });
                        break;
                    }
                    FarmMessage::Fault { error } => {
                        let _ = transport.close().await;
                        unit.reap().await;
                        let _ = events.send(UnitEvent::Exited {
                            slot,
                            reason: ExitReason::SetupFailed(error),
                        });
                        return;
                    }
                    other => warn!(slot, "unexpected frame during handshake: {:?}", other),
                },
                Err(e) => {
                    let detail = unit.reap().await;
                    let _ = events.send(UnitEvent::Exited {
                        slot,
                        reason: ExitReason::Crashed(exit_detail(&e, &detail)),
                    });
                    return;
                }
            },
        }
    }

    let mut deadline: Option<Pin<Box<tokio::time::Sleep>>> = None;
    let mut shutdown_sent = false;

    loop {
        tokio::select! {
            biased;

            command = next_command(&mut queued, &mut commands) => {
                let frame = match command {
                    None | Some(UnitCommand::Kill) => {
                        let _ = transport.close().await;
                        unit.terminate().await;
                        let _ = events.send(UnitEvent::Exited { slot, reason: ExitReason::Killed });
                        return;
                    }
                    Some(UnitCommand::Call { call_id, method, args }) => {
                        if call_timeout.is_some() && deadline.is_none() {
                            deadline = call_timeout.map(|t| Box::pin(tokio::time::sleep(t)));
                        }
                        WorkerMessage::Call { call_id, method, args }
                    }
                    Some(UnitCommand::Message { payload }) => WorkerMessage::Message { payload },
                    Some(UnitCommand::Shutdown) => {
                        shutdown_sent = true;
                        WorkerMessage::Shutdown
                    }
                };

                if let Err(e) = transport.send(&MessageEnvelope::new(frame)).await {
                    let detail = unit.reap().await;
                    let _ = events.send(UnitEvent::Exited {
                        slot,
                        reason: ExitReason::Crashed(exit_detail(&e, &detail)),
                    });
                    return;
                }
            }

            () = wait_deadline(&mut deadline) => {
                warn!(slot, "call deadline elapsed; treating unit as crashed");
                let _ = transport.close().await;
                unit.terminate().await;
                let _ = events.send(UnitEvent::Exited { slot, reason: ExitReason::TimedOut });
                return;
            }

            frame = transport.receive() => match frame {
                Ok(envelope) => match envelope.message {
                    message @ (FarmMessage::Result { .. } | FarmMessage::Error { .. }) => {
                        deadline = None;
                        let _ = events.send(UnitEvent::Reply { slot, message });
                    }
                    message @ FarmMessage::Message { .. } => {
                        let _ = events.send(UnitEvent::Reply { slot, message });
                    }
                    FarmMessage::ShutdownAck => {
                        let _ = transport.close().await;
                        unit.reap().await;
                        let _ = events.send(UnitEvent::Exited { slot, reason: ExitReason::Shutdown });
                        return;
                    }
                    FarmMessage::Fault { error } => {
                        let _ = transport.close().await;
                        unit.terminate().await;
                        let _ = events.send(UnitEvent::Exited {
                            slot,
                            reason: ExitReason::Crashed(error),
                        });
                        return;
                    }
                    FarmMessage::Ready { .. } => warn!(slot, "duplicate ready ignored"),
                },
                Err(e) => {
                    let detail = unit.reap().await;
                    let reason = if shutdown_sent && matches!(e, IpcError::ChannelClosed) {
                        // EOF instead of an ack still counts as a shutdown
                        ExitReason::Shutdown
                    } else {
                        ExitReason::Crashed(exit_detail(&e, &detail))
                    };
                    let _ = events.send(UnitEvent::Exited { slot, reason });
                    return;
                }
            },
        }
    }
}
