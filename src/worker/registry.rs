//! Task registry: every request currently bound to a worker slot.
//!
//! Entries iterate in insertion order, which is the order the scheduler
//! considers tasks for finalization.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use indexmap::IndexMap;
use tokio::time::Instant;
use uuid::Uuid;

use crate::ledger::TaskRequest;
use crate::worker::pool::TaskHandle;
use crate::worker::publisher::{PreparedResult, TaskOutcome, ToolInfo};
use crate::worker::state::{Lifecycle, TaskPhase};

/// Time allowed for storing and delivering a result.
pub const FINALIZATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Largest factor by which load can shorten a deadline.
const MAX_DEADLINE_COMPRESSION: usize = 5;

/// Execution deadline for a task dequeued while `queue_len` requests wait.
///
/// The divisor is the overflow count `queue_len - max_queue_size`, not the
/// ratio of the two, capped at five. With a max of 5 a queue of 7 halves
/// the deadline and a queue of 10 or more divides it by five.
pub fn task_deadline(base: Duration, queue_len: usize, max_queue_size: usize) -> Duration {
    if queue_len <= max_queue_size {
        return base;
    }
    let factor = (queue_len - max_queue_size).min(MAX_DEADLINE_COMPRESSION);
    base / factor as u32
}

/// Result being stored for a task.
#[derive(Debug)]
pub struct Finalization {
    pub prepared: PreparedResult,
    pub deadline: Instant,
    /// Correlation id of the store call in flight, if any.
    pub store_call: Option<Uuid>,
}

/// A request waiting in the queue, with the history of earlier attempts.
#[derive(Debug)]
pub struct QueuedRequest {
    pub request: TaskRequest,
    pub lifecycle: Lifecycle,
}

impl QueuedRequest {
    pub fn new(request: TaskRequest) -> Self {
        Self {
            request,
            lifecycle: Lifecycle::new(),
        }
    }

    pub fn request_id(&self) -> u64 {
        self.request.request_id
    }
}

/// A request bound to a worker slot.
#[derive(Debug)]
pub struct ExecutingTask {
    pub request: TaskRequest,
    pub executor_idx: usize,
    pub lifecycle: Lifecycle,
    /// Tool, resolved model and tool params.
    pub info: ToolInfo,
    pub handle: Option<TaskHandle>,
    pub timeout_deadline: Option<Instant>,
    pub is_invalid: bool,
    /// Captured when the handle completes or the timeout limit is hit.
    pub outcome: Option<TaskOutcome>,
    pub finalization: Option<Finalization>,
}

impl ExecutingTask {
    /// Bind a queued request to a slot, keeping its lifecycle.
    pub fn new(queued: QueuedRequest, executor_idx: usize) -> Self {
        Self {
            request: queued.request,
            executor_idx,
            lifecycle: queued.lifecycle,
            info: ToolInfo::default(),
            handle: None,
            timeout_deadline: None,
            is_invalid: false,
            outcome: None,
            finalization: None,
        }
    }

    pub fn request_id(&self) -> u64 {
        self.request.request_id
    }

    pub fn phase(&self) -> TaskPhase {
        self.lifecycle.phase
    }

    pub fn is_pending_finalization(&self) -> bool {
        self.finalization.is_some()
    }

    /// Move to `phase`, logging rather than failing on an illegal move.
    pub fn advance(&mut self, phase: TaskPhase, reason: impl Into<String>) {
        if let Err(e) = self.lifecycle.transition_to(phase, Some(reason.into())) {
            tracing::warn!(request_id = self.request.request_id, "{e}");
        }
    }

    pub fn has_timed_out(&self, now: Instant) -> bool {
        self.timeout_deadline.is_some_and(|deadline| deadline <= now)
    }

    /// Unbind from the slot and go back to the queue.
    pub fn requeue(mut self, reason: impl Into<String>) -> QueuedRequest {
        self.advance(TaskPhase::Pending, reason);
        QueuedRequest {
            request: self.request,
            lifecycle: self.lifecycle,
        }
    }
}

/// Authoritative map of in-progress tasks plus per-request retry counts.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: IndexMap<u64, ExecutingTask>,
    timeouts: HashMap<u64, u32>,
    fetch_failures: HashMap<u64, u32>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, task: ExecutingTask) {
        self.tasks.insert(task.request_id(), task);
    }

    pub fn get(&self, request_id: u64) -> Option<&ExecutingTask> {
        self.tasks.get(&request_id)
    }

    pub fn get_mut(&mut self, request_id: u64) -> Option<&mut ExecutingTask> {
        self.tasks.get_mut(&request_id)
    }

    /// Apply `f` to a task, if present.
    pub fn update<F, R>(&mut self, request_id: u64, f: F) -> Option<R>
    where
        F: FnOnce(&mut ExecutingTask) -> R,
    {
        self.tasks.get_mut(&request_id).map(f)
    }

    /// Remove a task, keeping the order of the rest.
    pub fn remove(&mut self, request_id: u64) -> Option<ExecutingTask> {
        self.tasks.shift_remove(&request_id)
    }

    pub fn contains(&self, request_id: u64) -> bool {
        self.tasks.contains_key(&request_id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ExecutingTask> {
        self.tasks.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ExecutingTask> {
        self.tasks.values_mut()
    }

    /// Slots bound to a task.
    pub fn busy_slots(&self) -> HashSet<usize> {
        self.tasks.values().map(|task| task.executor_idx).collect()
    }

    /// The task currently being finalized, if any.
    pub fn pending_finalization(&self) -> Option<u64> {
        self.tasks
            .values()
            .find(|task| task.is_pending_finalization())
            .map(ExecutingTask::request_id)
    }

    /// Record one more timeout for a request and return the new count.
    pub fn count_timeout(&mut self, request_id: u64) -> u32 {
        let count = self.timeouts.entry(request_id).or_insert(0);
        *count += 1;
        *count
    }

    pub fn timeouts(&self, request_id: u64) -> u32 {
        self.timeouts.get(&request_id).copied().unwrap_or(0)
    }

    /// Record one more failed payload fetch and return the new count.
    pub fn count_fetch_failure(&mut self, request_id: u64) -> u32 {
        let count = self.fetch_failures.entry(request_id).or_insert(0);
        *count += 1;
        *count
    }

    /// Forget the retry counts of a published request.
    pub fn clear_counters(&mut self, request_id: u64) {
        self.timeouts.remove(&request_id);
        self.fetch_failures.remove(&request_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(id: u64) -> TaskRequest {
        TaskRequest {
            request_id: id,
            request_id_with_nonce: format!("{id}-0"),
            sender: "0xsender".into(),
            contract_address: "0xmech".into(),
            data: vec![],
        }
    }

    #[test]
    fn deadline_scaling() {
        let base = Duration::from_secs(100);
        assert_eq!(task_deadline(base, 20, 5), Duration::from_secs(20));
        assert_eq!(task_deadline(base, 3, 5), Duration::from_secs(100));
        assert_eq!(task_deadline(base, 5, 5), Duration::from_secs(100));
        assert_eq!(task_deadline(base, 7, 5), Duration::from_secs(50));
    }

    #[test]
    fn keeps_insertion_order_after_removal() {
        let mut registry = TaskRegistry::new();
        for id in [5, 1, 9] {
            registry.insert(ExecutingTask::new(QueuedRequest::new(request(id)), id as usize));
        }
        registry.remove(1);
        let ids: Vec<u64> = registry.iter().map(ExecutingTask::request_id).collect();
        assert_eq!(ids, vec![5, 9]);
        assert_eq!(registry.busy_slots(), HashSet::from([5, 9]));
    }

    #[test]
    fn timeout_counter() {
        let mut registry = TaskRegistry::new();
        assert_eq!(registry.count_timeout(3), 1);
        assert_eq!(registry.count_timeout(3), 2);
        assert_eq!(registry.timeouts(3), 2);
        assert_eq!(registry.count_fetch_failure(3), 1);
        registry.clear_counters(3);
        assert_eq!(registry.timeouts(3), 0);
        assert_eq!(registry.count_fetch_failure(3), 1);
    }

    #[test]
    fn lifecycle_survives_requeue() {
        let mut task = ExecutingTask::new(QueuedRequest::new(request(4)), 0);
        task.advance(TaskPhase::AwaitingPayload, "slot 0");
        task.advance(TaskPhase::Executing, "running");

        let queued = task.requeue("timed out");
        assert_eq!(queued.request_id(), 4);
        assert_eq!(queued.lifecycle.phase, TaskPhase::Pending);

        let mut task = ExecutingTask::new(queued, 1);
        task.advance(TaskPhase::AwaitingPayload, "slot 1");
        assert_eq!(task.lifecycle.attempts(), 2);
        assert_eq!(task.lifecycle.transitions.len(), 4);
    }

    #[test]
    fn update_and_phase() {
        let mut registry = TaskRegistry::new();
        registry.insert(ExecutingTask::new(QueuedRequest::new(request(1)), 0));
        registry.update(1, |task| {
            task.advance(TaskPhase::AwaitingPayload, "slot 0");
            task.advance(TaskPhase::Terminal, "illegal");
        });
        assert_eq!(registry.get(1).unwrap().phase(), TaskPhase::AwaitingPayload);
        assert!(registry.pending_finalization().is_none());
        assert!(registry.update(2, |_| ()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_check() {
        let mut task = ExecutingTask::new(QueuedRequest::new(request(1)), 0);
        let now = Instant::now();
        assert!(!task.has_timed_out(now));
        task.timeout_deadline = Some(now + Duration::from_secs(1));
        assert!(!task.has_timed_out(now));
        assert!(task.has_timed_out(now + Duration::from_secs(1)));
    }
}
