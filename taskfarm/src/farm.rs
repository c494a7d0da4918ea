//! Farm orchestration
//!
//! `Farm` is the caller-facing handle. Every piece of mutable pool state
//! (slots, sticky map, queues) is owned by one coordinator task; callers
//! and worker IO tasks reach it only through channels, so state transitions
//! happen on a single logical thread and need no locks.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use taskfarm_ipc::FarmMessage;

use crate::config::{ExecutionMode, FarmBuilder, FarmConfig, WorkerKeyFn};
use crate::error::{FarmError, RemoteError};
use crate::retry::{on_crash, CrashOutcome, RestartBackoff};
use crate::scheduler::{Scheduler, SlotView};
use crate::task::{PendingCall, Task, UpdateHandler};
use crate::worker::{
    spawn_unit, ExitReason, Slot, SlotState, UnitCommand, UnitEvent, WorkerStats,
};

enum Command {
    Start(oneshot::Sender<Result<(), FarmError>>),
    Submit(Task),
    Broadcast(JsonValue, oneshot::Sender<Result<(), FarmError>>),
    Stats(oneshot::Sender<Vec<WorkerStats>>),
    End {
        force: bool,
        reply: oneshot::Sender<()>,
    },
}

/// Public orchestrator owning the worker pool and task dispatch.
///
/// ```ignore
/// let farm = Farm::builder()
///     .workers(4)
///     .execution(ExecutionMode::thread(|| MyModule::default()))
///     .build()?;
/// farm.start().await?;
/// let five = farm.call("add", (2, 3)).await?;
/// farm.end(false).await?;
/// ```
pub struct Farm {
    commands: mpsc::UnboundedSender<Command>,
}

impl Farm {
    pub fn builder() -> FarmBuilder {
        FarmBuilder::new()
    }

    pub(crate) fn new(
        config: FarmConfig,
        mode: ExecutionMode,
        worker_key: Option<WorkerKeyFn>,
        known_methods: Option<HashSet<String>>,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let coordinator = Coordinator {
            config,
            mode,
            worker_key,
            known_methods,
            slots: Vec::new(),
            scheduler: Scheduler::new(),
            backoff: RestartBackoff::default(),
            commands: commands_rx,
            events_rx,
            events_tx,
            phase: Phase::Created,
            starting: None,
            end_waiters: Vec::new(),
        };
        tokio::spawn(coordinator.run());

        Self {
            commands: commands_tx,
        }
    }

    /// Spawn every worker unit and wait until the whole pool is ready.
    /// Fails fatally if a module cannot be loaded or the configured method
    /// surface does not match what the module exports.
    pub async fn start(&self) -> Result<(), FarmError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Start(tx))
            .map_err(|_| FarmError::Ended)?;
        rx.await.map_err(|_| FarmError::Ended)?
    }

    /// Begin building a call; finish with `send()` or `invoke()`
    pub fn request(&self, method: impl Into<String>) -> CallRequest<'_> {
        CallRequest {
            farm: self,
            method: method.into(),
            args: Ok(Vec::new()),
            on_update: None,
        }
    }

    /// Invoke an exported method and await its settlement. `args` must
    /// serialize to a JSON array (tuples do); pass `()` for no arguments.
    pub async fn call<A: Serialize>(
        &self,
        method: &str,
        args: A,
    ) -> Result<JsonValue, FarmError> {
        self.request(method).args(args).invoke().await
    }

    /// Deliver an out-of-band payload to every live unit, without creating
    /// a task. The farm does not interpret it.
    pub async fn broadcast<P: Serialize>(&self, payload: P) -> Result<(), FarmError> {
        let payload =
            serde_json::to_value(payload).map_err(|e| FarmError::Serialization(e.to_string()))?;
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Broadcast(payload, tx))
            .map_err(|_| FarmError::Ended)?;
        rx.await.map_err(|_| FarmError::Ended)?
    }

    /// Per-slot execution counters and lifecycle states
    pub async fn stats(&self) -> Result<Vec<WorkerStats>, FarmError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Stats(tx))
            .map_err(|_| FarmError::Ended)?;
        rx.await.map_err(|_| FarmError::Ended)
    }

    /// Stop the farm. With `force` every outstanding task is rejected and
    /// all units are terminated immediately; otherwise queued and in-flight
    /// work drains to completion first. Resolves once every unit is gone.
    pub async fn end(&self, force: bool) -> Result<(), FarmError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::End { force, reply: tx })
            .map_err(|_| FarmError::Ended)?;
        rx.await.map_err(|_| FarmError::Ended)
    }
}

/// One call under construction
pub struct CallRequest<'a> {
    farm: &'a Farm,
    method: String,
    args: Result<Vec<JsonValue>, FarmError>,
    on_update: Option<UpdateHandler>,
}

impl<'a> CallRequest<'a> {
    /// Ordered call arguments; anything serializing to a JSON array works
    pub fn args<A: Serialize>(mut self, args: A) -> Self {
        self.args = encode_args(args);
        self
    }

    /// Receive the call's side-channel payloads as they stream in. The
    /// handler runs on the coordinator, so keep it cheap.
    pub fn on_update<F>(mut self, handler: F) -> Self
    where
        F: Fn(JsonValue) + Send + Sync + 'static,
    {
        self.on_update = Some(Arc::new(handler));
        self
    }

    /// Submit the call and get its settlement future
    pub fn send(self) -> Result<PendingCall, FarmError> {
        let args = self.args?;
        let (tx, rx) = oneshot::channel();
        let task = Task::new(self.method, args, self.on_update, tx);
        self.farm
            .commands
            .send(Command::Submit(task))
            .map_err(|_| FarmError::Ended)?;
        Ok(PendingCall::new(rx))
    }

    /// Submit and await in one step
    pub async fn invoke(self) -> Result<JsonValue, FarmError> {
        self.send()?.await
    }
}

fn encode_args<A: Serialize>(args: A) -> Result<Vec<JsonValue>, FarmError> {
    match serde_json::to_value(args) {
        Ok(JsonValue::Array(items)) => Ok(items),
        Ok(JsonValue::Null) => Ok(Vec::new()),
        Ok(other) => Err(FarmError::Serialization(format!(
            "arguments must serialize to a JSON array, got {}",
            json_kind(&other)
        ))),
        Err(e) => Err(FarmError::Serialization(e.to_string())),
    }
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Created,
    Starting,
    Running,
    Draining,
    Terminating,
    Ended,
}

struct Starting {
    reply: oneshot::Sender<Result<(), FarmError>>,
    pending: usize,
}

struct Coordinator {
    config: FarmConfig,
    mode: ExecutionMode,
    worker_key: Option<WorkerKeyFn>,
    known_methods: Option<HashSet<String>>,
    slots: Vec<Slot>,
    scheduler: Scheduler,
    backoff: RestartBackoff,
    commands: mpsc::UnboundedReceiver<Command>,
    events_rx: mpsc::UnboundedReceiver<UnitEvent>,
    events_tx: mpsc::UnboundedSender<UnitEvent>,
    phase: Phase,
    starting: Option<Starting>,
    end_waiters: Vec<oneshot::Sender<()>>,
}

impl Coordinator {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    // Every Farm handle dropped
                    None => break,
                },
                Some(event) = self.events_rx.recv() => self.handle_event(event),
            }
            self.pump();
        }

        // The farm went away without an explicit end; nothing may linger
        for slot in &mut self.slots {
            if let Some(task) = slot.current.take() {
                task.settle(Err(FarmError::Ended));
            }
            slot.send(UnitCommand::Kill);
        }
        for task in self.scheduler.drain_all() {
            task.settle(Err(FarmError::Ended));
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start(reply) => self.handle_start(reply),
            Command::Submit(task) => self.handle_submit(task),
            Command::Broadcast(payload, reply) => self.handle_broadcast(payload, reply),
            Command::Stats(reply) => {
                let _ = reply.send(self.slots.iter().map(Slot::stats).collect());
            }
            Command::End { force, reply } => self.handle_end(force, reply),
        }
    }

    fn handle_event(&mut self, event: UnitEvent) {
        match event {
            UnitEvent::Ready { slot, pid, methods } => self.handle_ready(slot, pid, methods),
            UnitEvent::Reply { slot, message } => self.handle_reply(slot, message),
            UnitEvent::Exited { slot, reason } => self.handle_exited(slot, reason),
            UnitEvent::RespawnDue { slot } => self.handle_respawn(slot),
        }
    }

    fn handle_start(&mut self, reply: oneshot::Sender<Result<(), FarmError>>) {
        if self.phase != Phase::Created {
            let _ = reply.send(Err(FarmError::Config("farm already started".to_string())));
            return;
        }

        info!(workers = self.config.workers, mode = ?self.mode, "starting worker farm");
        for id in 0..self.config.workers {
            match spawn_unit(
                id,
                &self.mode,
                self.config.setup_args.clone(),
                self.config.call_timeout,
                self.events_tx.clone(),
            ) {
                Ok(commands) => self.slots.push(Slot::new(id, commands)),
                Err(e) => {
                    let _ = reply.send(Err(e));
                    self.force_terminate();
                    return;
                }
            }
        }

        self.phase = Phase::Starting;
        self.starting = Some(Starting {
            reply,
            pending: self.config.workers,
        });
    }

    fn handle_submit(&mut self, mut task: Task) {
        match self.phase {
            Phase::Created | Phase::Starting => {
                task.settle(Err(FarmError::Config("farm not started".to_string())));
                return;
            }
            Phase::Running => {}
            Phase::Draining | Phase::Terminating | Phase::Ended => {
                task.settle(Err(FarmError::Ended));
                return;
            }
        }

        if self.slots.iter().all(|s| s.state == SlotState::Failed) {
            task.settle(Err(FarmError::PoolFailed(
                "every worker slot exhausted its restart budget".to_string(),
            )));
            return;
        }

        match &self.known_methods {
            Some(known) if known.contains(&task.method) => {}
            Some(_) => {
                let msg = format!("unknown method `{}`", task.method);
                task.settle(Err(FarmError::Config(msg)));
                return;
            }
            None => {
                // Running implies the registry exists; guard anyway
                task.settle(Err(FarmError::Config(
                    "method registry unavailable".to_string(),
                )));
                return;
            }
        }

        task.retries_remaining = self.config.max_retries;
        if let Some(key_fn) = &self.worker_key {
            task.worker_key = key_fn(&task.method, &task.args);
        }
        debug!(task = %task.id, method = %task.method, key = ?task.worker_key, "task submitted");
        self.scheduler.submit(task);
    }

    fn handle_broadcast(
        &mut self,
        payload: JsonValue,
        reply: oneshot::Sender<Result<(), FarmError>>,
    ) {
        match self.phase {
            Phase::Created | Phase::Starting => {
                let _ = reply.send(Err(FarmError::Config("farm not started".to_string())));
                return;
            }
            Phase::Running => {}
            _ => {
                let _ = reply.send(Err(FarmError::Ended));
                return;
            }
        }

        let mut delivered = 0usize;
        for slot in &self.slots {
            if slot.is_alive()
                && slot.send(UnitCommand::Message {
                    payload: payload.clone(),
                })
            {
                delivered += 1;
            }
        }
        debug!(delivered, "broadcast delivered");
        let _ = reply.send(Ok(()));
    }

    fn handle_end(&mut self, force: bool, reply: oneshot::Sender<()>) {
        match self.phase {
            Phase::Ended => {
                let _ = reply.send(());
            }
            Phase::Created => {
                self.phase = Phase::Ended;
                let _ = reply.send(());
            }
            Phase::Starting => {
                // The pending start can no longer succeed
                if let Some(starting) = self.starting.take() {
                    let _ = starting.reply.send(Err(FarmError::Ended));
                }
                self.end_waiters.push(reply);
                self.reject_outstanding();
                self.force_terminate();
            }
            Phase::Running | Phase::Draining => {
                self.end_waiters.push(reply);
                if force {
                    info!("force-ending farm");
                    self.reject_outstanding();
                    self.force_terminate();
                } else if self.phase == Phase::Running {
                    info!("draining farm before shutdown");
                    self.phase = Phase::Draining;
                }
            }
            Phase::Terminating => {
                self.end_waiters.push(reply);
            }
        }
    }

    /// Settle everything queued or in flight with `Ended`
    fn reject_outstanding(&mut self) {
        for task in self.scheduler.drain_all() {
            task.settle(Err(FarmError::Ended));
        }
        for slot in &mut self.slots {
            if let Some(task) = slot.current.take() {
                task.settle(Err(FarmError::Ended));
            }
        }
    }

    /// Kill every live unit and wait for their exit events
    fn force_terminate(&mut self) {
        self.phase = Phase::Terminating;
        for slot in &mut self.slots {
            if slot.commands.is_some() {
                slot.send(UnitCommand::Kill);
                slot.state = SlotState::Exiting;
            } else if slot.state != SlotState::Failed {
                slot.state = SlotState::Dead;
            }
        }
        self.check_terminated();
    }

    fn check_terminated(&mut self) {
        if self.phase != Phase::Terminating {
            return;
        }
        if self.slots.iter().all(|s| s.commands.is_none()) {
            self.phase = Phase::Ended;
            info!("farm ended");
            for waiter in self.end_waiters.drain(..) {
                let _ = waiter.send(());
            }
        }
    }

    fn handle_ready(&mut self, slot_id: usize, pid: u32, methods: Vec<String>) {
        let Some(slot) = self.slots.get_mut(slot_id) else {
            return;
        };
        if slot.state != SlotState::Spawning {
            warn!(slot = slot_id, state = %slot.state, "ready from unexpected state ignored");
            return;
        }
        slot.state = SlotState::Idle;
        debug!(slot = slot_id, pid, "worker unit ready");

        // First Ready in process mode fixes the callable surface, exactly
        // where the original module exports become observable
        if self.known_methods.is_none() {
            let exported: HashSet<String> = methods.into_iter().collect();
            if let Some(exposed) = &self.config.exposed_methods {
                let missing: Vec<&String> =
                    exposed.iter().filter(|m| !exported.contains(*m)).collect();
                if !missing.is_empty() {
                    let error = FarmError::Config(format!(
                        "exposed method(s) {:?} not exported by the worker module",
                        missing
                    ));
                    self.fail_start(error);
                    return;
                }
                self.known_methods = Some(exposed.iter().cloned().collect());
            } else {
                self.known_methods = Some(exported);
            }
        }

        if let Some(mut starting) = self.starting.take() {
            starting.pending -= 1;
            if starting.pending == 0 {
                let _ = starting.reply.send(Ok(()));
                self.phase = Phase::Running;
                info!("worker farm started");
            } else {
                self.starting = Some(starting);
            }
        }
    }

    fn handle_reply(&mut self, slot_id: usize, message: FarmMessage) {
        match message {
            FarmMessage::Result { call_id, output } => {
                self.settle_current(slot_id, call_id, Ok(output));
            }
            FarmMessage::Error { call_id, error } => {
                self.settle_current(
                    slot_id,
                    call_id,
                    Err(FarmError::Remote(RemoteError::from(error))),
                );
            }
            FarmMessage::Message { call_id, payload } => {
                if let Some(slot) = self.slots.get(slot_id) {
                    if let Some(task) = &slot.current {
                        if task.id == call_id {
                            if let Some(handler) = &task.on_update {
                                handler(payload);
                            }
                            return;
                        }
                    }
                }
                debug!(slot = slot_id, call = %call_id, "dropping update for unknown call");
            }
            other => warn!(slot = slot_id, "unexpected frame from unit: {:?}", other),
        }
    }

    fn settle_current(
        &mut self,
        slot_id: usize,
        call_id: Uuid,
        outcome: Result<JsonValue, FarmError>,
    ) {
        let Some(slot) = self.slots.get_mut(slot_id) else {
            return;
        };
        match slot.current.take() {
            Some(task) if task.id == call_id => {
                slot.tasks_executed += 1;
                if outcome.is_err() {
                    slot.tasks_failed += 1;
                }
                if slot.state == SlotState::Busy {
                    slot.state = SlotState::Idle;
                }
                task.settle(outcome);
            }
            Some(task) => {
                // Replies must match the in-flight call; a stray frame is a
                // unit protocol bug, not a reason to lose the task
                warn!(slot = slot_id, expected = %task.id, got = %call_id, "mismatched reply ignored");
                slot.current = Some(task);
            }
            None => {
                warn!(slot = slot_id, call = %call_id, "reply with no call in flight");
            }
        }
    }

    fn handle_exited(&mut self, slot_id: usize, reason: ExitReason) {
        let Some(slot) = self.slots.get_mut(slot_id) else {
            return;
        };
        slot.commands = None;
        debug!(slot = slot_id, ?reason, "unit exited");

        if self.phase == Phase::Terminating {
            let slot = &mut self.slots[slot_id];
            if slot.state != SlotState::Failed {
                slot.state = SlotState::Dead;
            }
            if let Some(task) = slot.current.take() {
                task.settle(Err(FarmError::Ended));
            }
            self.check_terminated();
            return;
        }

        // Any exit before the pool ever came up is a configuration problem;
        // crash-looping through the restart budget would only hide it
        if self.starting.is_some() {
            self.slots[slot_id].state = SlotState::Dead;
            self.fail_start(FarmError::Config(format!(
                "worker unit failed during startup: {}",
                reason.detail()
            )));
            return;
        }

        // A crash mid-task goes to the retry policy; the task keeps its id
        // and key across attempts
        let detail = reason.detail();
        if let Some(mut task) = self.slots[slot_id].current.take() {
            match on_crash(&mut task) {
                CrashOutcome::Resubmit => {
                    info!(
                        task = %task.id,
                        attempts = task.attempts,
                        remaining = task.retries_remaining,
                        "unit crashed mid-task; retrying"
                    );
                    self.scheduler.submit(task);
                }
                CrashOutcome::Exhausted => {
                    warn!(task = %task.id, attempts = task.attempts, "crash-retry budget exhausted");
                    self.slots[slot_id].tasks_failed += 1;
                    let attempts = task.attempts;
                    task.settle(Err(FarmError::CrashExhausted {
                        attempts,
                        last_exit: detail.clone(),
                    }));
                }
            }
        }

        // Clear affinity and reroute whatever was queued for this slot
        self.slots[slot_id].state = SlotState::Dead;
        for task in self.scheduler.on_slot_dead(slot_id) {
            self.scheduler.submit(task);
        }

        self.schedule_respawn(slot_id);
    }

    fn schedule_respawn(&mut self, slot_id: usize) {
        let slot = &mut self.slots[slot_id];
        slot.restart_count += 1;
        if slot.restart_count > self.config.max_unit_restarts {
            warn!(
                slot = slot_id,
                restarts = slot.restart_count - 1,
                "restart budget exhausted; slot permanently failed"
            );
            slot.state = SlotState::Failed;
            self.handle_all_failed();
            return;
        }

        let delay = self.backoff.delay_for(slot.restart_count);
        debug!(slot = slot_id, ?delay, "scheduling unit restart");
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(UnitEvent::RespawnDue { slot: slot_id });
        });
    }

    fn handle_respawn(&mut self, slot_id: usize) {
        if !matches!(self.phase, Phase::Running | Phase::Draining) {
            return;
        }
        let Some(slot) = self.slots.get(slot_id) else {
            return;
        };
        if slot.state != SlotState::Dead {
            return;
        }

        match spawn_unit(
            slot_id,
            &self.mode,
            self.config.setup_args.clone(),
            self.config.call_timeout,
            self.events_tx.clone(),
        ) {
            Ok(commands) => {
                let slot = &mut self.slots[slot_id];
                slot.commands = Some(commands);
                slot.state = SlotState::Spawning;
                slot.started_at = std::time::Instant::now();
                debug!(slot = slot_id, "unit respawning");
            }
            Err(e) => {
                warn!(slot = slot_id, "respawn failed: {}", e);
                self.schedule_respawn(slot_id);
            }
        }
    }

    /// When the last slot fails permanently, queued work can never run
    fn handle_all_failed(&mut self) {
        if self.slots.iter().any(|s| s.state != SlotState::Failed) {
            return;
        }
        warn!("every worker slot failed; rejecting queued tasks");
        for task in self.scheduler.drain_all() {
            task.settle(Err(FarmError::PoolFailed(
                "every worker slot exhausted its restart budget".to_string(),
            )));
        }
    }

    /// Dispatch until nothing fits, then check drain completion
    fn pump(&mut self) {
        if matches!(self.phase, Phase::Running | Phase::Draining) {
            loop {
                let views: Vec<SlotView> = self.slots.iter().map(Slot::view).collect();
                match self.scheduler.take_dispatch(&views) {
                    Some((slot_id, task)) => self.dispatch(slot_id, task),
                    None => break,
                }
            }
        }
        self.maybe_finish_drain();
    }

    fn dispatch(&mut self, slot_id: usize, mut task: Task) {
        let slot = &mut self.slots[slot_id];
        // The scheduler only ever picks idle slots
        debug_assert_eq!(slot.state, SlotState::Idle, "dispatch to non-idle slot");
        if slot.state != SlotState::Idle {
            warn!(slot = slot_id, "dispatch to non-idle slot; requeueing");
            self.scheduler.submit(task);
            return;
        }

        let sent = slot.send(UnitCommand::Call {
            call_id: task.id,
            method: task.method.clone(),
            args: task.args.clone(),
        });
        if !sent {
            // The IO task is already gone; its exit event drives the restart
            slot.state = SlotState::Dead;
            self.scheduler.submit(task);
            return;
        }

        task.attempts += 1;
        slot.assignments += 1;
        slot.state = SlotState::Busy;
        debug!(
            slot = slot_id,
            task = %task.id,
            method = %task.method,
            attempt = task.attempts,
            "task dispatched"
        );
        slot.current = Some(task);
    }

    fn maybe_finish_drain(&mut self) {
        if self.phase != Phase::Draining {
            return;
        }
        let busy = self.slots.iter().any(|s| s.state == SlotState::Busy);
        if busy || !self.scheduler.is_empty() {
            return;
        }

        info!("drain complete; shutting down units");
        self.phase = Phase::Terminating;
        for slot in &mut self.slots {
            if matches!(slot.state, SlotState::Idle | SlotState::Spawning) {
                slot.send(UnitCommand::Shutdown);
                slot.state = SlotState::Exiting;
            }
        }
        self.check_terminated();
    }

    fn fail_start(&mut self, error: FarmError) {
        warn!("farm startup failed: {}", error);
        if let Some(starting) = self.starting.take() {
            let _ = starting.reply.send(Err(error));
        }
        self.force_terminate();
    }
}
