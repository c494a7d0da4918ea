//! Task scheduling
//!
//! Routing rules, in priority order: a task whose sticky key is bound to a
//! live slot belongs to that slot (its private queue preserves per-key
//! FIFO); otherwise the least-loaded idle slot wins; with no idle slot the
//! task waits in a global FIFO. A slot coming back to idle drains its own
//! queue before touching the global one; affinity correctness outranks
//! global fairness.

use std::collections::{HashMap, VecDeque};

use tracing::debug;

use crate::task::Task;

/// Coordinator's snapshot of one slot, indexed by slot id
#[derive(Debug, Clone, Copy)]
pub(crate) struct SlotView {
    pub id: usize,
    pub idle: bool,
    pub alive: bool,
    pub assignments: u64,
}

pub(crate) struct Scheduler {
    /// Sticky key -> owning slot; scoped to this farm instance
    sticky: HashMap<String, usize>,
    /// Per-slot queues for tasks bound to a busy slot
    slot_queues: HashMap<usize, VecDeque<Task>>,
    /// Global FIFO for everything else
    queue: VecDeque<Task>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            sticky: HashMap::new(),
            slot_queues: HashMap::new(),
            queue: VecDeque::new(),
        }
    }

    /// Accept a task. Dispatch decisions happen in [`take_dispatch`];
    /// a task with an already-bound key goes straight to the owner's queue
    /// so same-key submission order is preserved.
    ///
    /// [`take_dispatch`]: Scheduler::take_dispatch
    pub fn submit(&mut self, task: Task) {
        match task.worker_key.as_ref().and_then(|k| self.sticky.get(k)) {
            Some(&slot) => {
                debug!(task = %task.id, slot, "queueing task on bound slot");
                self.slot_queues.entry(slot).or_default().push_back(task);
            }
            None => self.queue.push_back(task),
        }
    }

    /// Pick the next (slot, task) pair that can run right now. Callers
    /// invoke this repeatedly after every state change until it yields
    /// `None`, marking the chosen slot busy in between.
    pub fn take_dispatch(&mut self, slots: &[SlotView]) -> Option<(usize, Task)> {
        // Sticky queues first
        for view in slots {
            if !view.idle {
                continue;
            }
            if let Some(queue) = self.slot_queues.get_mut(&view.id) {
                if let Some(task) = queue.pop_front() {
                    return Some((view.id, task));
                }
            }
        }

        // Global FIFO. A task whose key got bound while it waited moves to
        // the owning slot's queue rather than running elsewhere.
        while let Some(task) = self.queue.pop_front() {
            let bound = task
                .worker_key
                .as_ref()
                .and_then(|k| self.sticky.get(k))
                .copied()
                .filter(|&slot| slots.get(slot).is_some_and(|v| v.alive));

            if let Some(slot) = bound {
                if slots[slot].idle {
                    return Some((slot, task));
                }
                debug!(task = %task.id, slot, "moving queued task to bound slot");
                self.slot_queues.entry(slot).or_default().push_back(task);
                continue;
            }

            match self.least_loaded_idle(slots) {
                Some(slot) => {
                    if let Some(key) = &task.worker_key {
                        self.sticky.insert(key.clone(), slot);
                    }
                    return Some((slot, task));
                }
                None => {
                    // No capacity; keep submission order intact
                    self.queue.push_front(task);
                    return None;
                }
            }
        }

        None
    }

    fn least_loaded_idle(&self, slots: &[SlotView]) -> Option<usize> {
        slots
            .iter()
            .filter(|v| v.idle)
            .min_by_key(|v| (v.assignments, v.id))
            .map(|v| v.id)
    }

    /// A unit died: clear its key bindings and hand back its queued tasks
    /// for re-placement. Keys re-bind at their next dispatch.
    pub fn on_slot_dead(&mut self, slot: usize) -> Vec<Task> {
        self.sticky.retain(|_, bound| *bound != slot);
        self.slot_queues
            .remove(&slot)
            .map(Vec::from)
            .unwrap_or_default()
    }

    /// Drain every queued task (forced shutdown)
    pub fn drain_all(&mut self) -> Vec<Task> {
        let mut all: Vec<Task> = self.queue.drain(..).collect();
        for (_, queue) in self.slot_queues.drain() {
            all.extend(queue);
        }
        self.sticky.clear();
        all
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty() && self.slot_queues.values().all(|q| q.is_empty())
    }

    #[cfg(test)]
    fn bound_slot(&self, key: &str) -> Option<usize> {
        self.sticky.get(key).copied()
    }
}
