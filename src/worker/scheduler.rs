//! Task scheduler: the cooperative loop that drives every request from
//! intake to publication.
//!
//! One tick, in order:
//! 1. dispatch responses that arrived on the network inbox
//! 2. expire calls that outlived their timeout
//! 3. let the tool cache start the next download
//! 4. finalize or time out at most one task, then dequeue at most one
//!    request onto a free slot
//! 5. let the intake poller query the ledger
//!
//! No step blocks on the network; every round trip is a spawned call whose
//! response is picked up by a later tick.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::FutureExt;
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::delivery::Delivery;
use crate::error::StorageError;
use crate::health::HealthState;
use crate::keychain::KeyChain;
use crate::ledger::{IntakePoller, Ledger, TaskRequest};
use crate::storage::{ContentHash, ContentStore, Files};
use crate::tools::{CachedTool, ToolCache, ToolRegistry, ToolRequest};
use crate::worker::network::{CallOutcome, CallPurpose, Network};
use crate::worker::pool::{Job, WorkerPool};
use crate::worker::publisher::{DoneTasks, ResultPublisher, TaskOutcome, ToolInfo, prepare};
use crate::worker::registry::{
    ExecutingTask, FINALIZATION_TIMEOUT, Finalization, QueuedRequest, TaskRegistry, task_deadline,
};
use crate::worker::state::TaskPhase;

/// How many finalized request ids are remembered for deduplication.
const RECENTLY_FINALIZED_CAPACITY: usize = 10_000;

/// Collaborators the scheduler talks to.
pub struct SchedulerDeps {
    pub ledger: Arc<dyn Ledger>,
    pub store: Arc<dyn ContentStore>,
    pub delivery: Arc<dyn Delivery>,
    pub tools: Arc<ToolRegistry>,
}

/// Bounded memory of request ids that were already published.
#[derive(Debug, Default)]
struct RecentIds {
    order: VecDeque<u64>,
    ids: HashSet<u64>,
}

impl RecentIds {
    fn insert(&mut self, id: u64) {
        if !self.ids.insert(id) {
            return;
        }
        self.order.push_back(id);
        if self.order.len() > RECENTLY_FINALIZED_CAPACITY
            && let Some(oldest) = self.order.pop_front()
        {
            self.ids.remove(&oldest);
        }
    }

    fn contains(&self, id: u64) -> bool {
        self.ids.contains(&id)
    }
}

/// A decoded request payload.
#[derive(Debug)]
struct TaskPayload {
    tool: String,
    prompt: String,
    model: Option<String>,
    extra: Map<String, Value>,
}

/// Why a payload was rejected; carries the tool name when one was given.
#[derive(Debug)]
struct InvalidPayload {
    tool: Option<String>,
    reason: &'static str,
}

fn parse_payload(files: &Files, clear_queue: bool) -> Result<TaskPayload, InvalidPayload> {
    let invalid = |tool: Option<String>, reason| InvalidPayload { tool, reason };

    let Some(contents) = files.values().next() else {
        return Err(invalid(None, "payload has no files"));
    };
    let Ok(Value::Object(mut fields)) = serde_json::from_slice::<Value>(contents) else {
        return Err(invalid(None, "payload is not a JSON object"));
    };

    let tool = match fields.remove("tool") {
        Some(Value::String(tool)) => tool,
        _ => return Err(invalid(None, "payload has no tool")),
    };
    let prompt = match fields.remove("prompt") {
        Some(Value::String(prompt)) => prompt,
        _ => return Err(invalid(Some(tool), "payload has no prompt")),
    };
    if clear_queue {
        return Err(invalid(Some(tool), "clearing the queue"));
    }
    let model = match fields.remove("model") {
        Some(Value::String(model)) => Some(model),
        _ => None,
    };

    Ok(TaskPayload {
        tool,
        prompt,
        model,
        extra: fields,
    })
}

/// Owns all scheduling state. Driven by [`TaskScheduler::tick`].
pub struct TaskScheduler {
    config: WorkerConfig,
    network: Network,
    poller: IntakePoller,
    tool_cache: ToolCache,
    tools: Arc<ToolRegistry>,
    registry: TaskRegistry,
    pending: VecDeque<QueuedRequest>,
    pool: WorkerPool,
    publisher: ResultPublisher,
    health: HealthState,
    keychain: KeyChain,
    task_index: usize,
    recently_finalized: RecentIds,
}

impl TaskScheduler {
    /// Build a scheduler. Starts the worker pool, so this must run inside a
    /// tokio runtime.
    pub fn new(config: WorkerConfig, deps: SchedulerDeps) -> Self {
        let done_tasks = DoneTasks::new();
        let health = HealthState::new(done_tasks.clone(), config.health_max_idle);
        let publisher = ResultPublisher::new(
            config.mech_to_config.clone(),
            deps.delivery,
            done_tasks,
            health.clone(),
        );

        Self {
            network: Network::new(deps.ledger, deps.store),
            poller: IntakePoller::new(
                config.polling_interval,
                config.contract_addresses.clone(),
                config.max_block_window,
            ),
            tool_cache: ToolCache::new(config.tools_to_file_hash()),
            tools: deps.tools,
            registry: TaskRegistry::new(),
            pending: VecDeque::new(),
            pool: WorkerPool::new(config.max_executing_tasks),
            publisher,
            health,
            keychain: config.api_keys.clone(),
            task_index: 0,
            recently_finalized: RecentIds::default(),
            config,
        }
    }

    pub fn done_tasks(&self) -> DoneTasks {
        self.publisher.done_tasks().clone()
    }

    pub fn health(&self) -> HealthState {
        self.health.clone()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn tool_cache(&self) -> &ToolCache {
        &self.tool_cache
    }

    pub fn keychain(&self) -> &KeyChain {
        &self.keychain
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Direct access to the worker slots, for operators restarting a slot.
    pub fn pool_mut(&mut self) -> &mut WorkerPool {
        &mut self.pool
    }

    /// Number of ledger or content-store calls awaiting a response.
    pub fn outstanding_calls(&self) -> usize {
        self.network.outstanding()
    }

    /// Queue a request unless it is already queued, running, or was
    /// published recently. Returns whether it was queued.
    pub fn enqueue(&mut self, request: TaskRequest) -> bool {
        let id = request.request_id;
        if self.recently_finalized.contains(id)
            || self.registry.contains(id)
            || self.pending.iter().any(|queued| queued.request_id() == id)
        {
            debug!(request_id = id, "Skipping duplicate request");
            return false;
        }
        info!(request_id = id, sender = %request.sender, "Request queued");
        self.pending.push_back(QueuedRequest::new(request));
        true
    }

    /// Run one scheduling pass.
    pub async fn tick(&mut self) {
        self.dispatch_responses().await;
        self.handle_expired_calls();
        self.tool_cache.ensure(&mut self.network);
        self.execute_tasks().await;
        self.poller.poll(&mut self.network, Instant::now());
        self.health
            .set_queue_gauges(self.pending.len(), self.registry.len())
            .await;
    }

    /// Tick on the configured interval until `shutdown` is set.
    pub async fn run(mut self, shutdown: Arc<AtomicBool>) {
        let mut tick = tokio::time::interval(self.config.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tick.tick().await;

            if shutdown.load(Ordering::Relaxed) {
                info!("Task scheduler shutting down");
                return;
            }

            self.tick().await;
        }
    }

    async fn dispatch_responses(&mut self) {
        for resolved in self.network.drain() {
            match (resolved.purpose, resolved.outcome) {
                (CallPurpose::FetchTool { tool }, CallOutcome::Files(Ok(files))) => {
                    if let Err(e) = self.tool_cache.complete(&tool, &files, &self.tools).await {
                        warn!(tool = %tool, "Could not load tool package: {e}");
                    }
                }
                (CallPurpose::FetchTool { tool }, CallOutcome::Files(Err(e))) => {
                    warn!(tool = %tool, "Tool fetch failed: {e}");
                    self.tool_cache.fail(&tool);
                }
                (CallPurpose::FetchPayload { request_id }, CallOutcome::Files(result)) => {
                    self.on_payload(request_id, result);
                }
                (CallPurpose::StoreResult { request_id }, CallOutcome::Stored(result)) => {
                    self.on_stored(resolved.correlation_id, request_id, result)
                        .await;
                }
                (CallPurpose::LatestBlock, CallOutcome::LatestBlock(result)) => {
                    self.poller.on_latest_block(result);
                }
                (CallPurpose::ScanRequests, CallOutcome::Requests(result)) => {
                    for request in self.poller.on_requests(result) {
                        self.enqueue(request);
                    }
                }
                (purpose, outcome) => {
                    warn!(?purpose, ?outcome, "Response does not match its call");
                }
            }
        }
    }

    fn handle_expired_calls(&mut self) {
        for purpose in self.network.take_expired() {
            match purpose {
                CallPurpose::FetchTool { tool } => self.tool_cache.fail(&tool),
                CallPurpose::FetchPayload { request_id } => {
                    self.payload_unavailable(request_id, "payload fetch timed out");
                }
                CallPurpose::StoreResult { request_id } => {
                    if let Some(finalization) = self
                        .registry
                        .get_mut(request_id)
                        .and_then(|task| task.finalization.as_mut())
                    {
                        finalization.store_call = None;
                    }
                }
                CallPurpose::LatestBlock | CallPurpose::ScanRequests => {}
            }
        }
    }

    fn on_payload(&mut self, request_id: u64, result: Result<Files, StorageError>) {
        let Some(task) = self.registry.get(request_id) else {
            warn!(request_id, "Payload for an unknown request");
            return;
        };
        if task.phase() != TaskPhase::AwaitingPayload {
            debug!(request_id, phase = %task.phase(), "Ignoring payload");
            return;
        }

        let files = match result {
            Ok(files) => files,
            Err(e) => {
                warn!(request_id, "Payload fetch failed: {e}");
                self.payload_unavailable(request_id, "payload fetch failed");
                return;
            }
        };

        match parse_payload(&files, self.config.clear_queue) {
            Ok(payload) => match self.tool_cache.get(&payload.tool) {
                Some(cached) => self.start_task(request_id, payload, cached),
                None if self.tool_cache.is_known(&payload.tool)
                    && !self.tool_cache.is_failed(&payload.tool) =>
                {
                    info!(request_id, tool = %payload.tool, "Tool not downloaded yet");
                    self.requeue(request_id, "tool not downloaded yet");
                }
                None => {
                    warn!(request_id, tool = %payload.tool, "Tool is not available");
                    self.mark_invalid(request_id, Some(payload.tool), "unknown tool");
                }
            },
            Err(invalid) => {
                warn!(request_id, reason = invalid.reason, "Data for task is not valid");
                self.mark_invalid(request_id, invalid.tool, invalid.reason);
            }
        }
    }

    fn start_task(&mut self, request_id: u64, payload: TaskPayload, cached: Arc<CachedTool>) {
        let manifest = &cached.package.manifest;
        let model = payload
            .model
            .or_else(|| manifest.default_model().map(str::to_string));
        let params = manifest.params.clone();

        let request = ToolRequest {
            request_id,
            tool: payload.tool.clone(),
            prompt: payload.prompt,
            model: model.clone(),
            params: params.clone(),
            extra: payload.extra,
            api_keys: self.keychain.clone(),
        };
        let executable = Arc::clone(&cached.executable);
        let job: Job = async move { executable.run(request).await }.boxed();
        let deadline = task_deadline(
            self.config.task_deadline,
            self.pending.len(),
            self.config.max_queue_size,
        );

        let Some(task) = self.registry.get_mut(request_id) else {
            return;
        };
        task.info = ToolInfo {
            tool: Some(payload.tool),
            model,
            params,
        };
        let slot = task.executor_idx;
        match self.pool.submit(slot, job) {
            Ok(handle) => {
                task.handle = Some(handle);
                task.timeout_deadline = Some(Instant::now() + deadline);
                info!(
                    request_id,
                    slot,
                    deadline_secs = deadline.as_secs(),
                    "Task submitted"
                );
                task.advance(TaskPhase::Executing, format!("running on slot {slot}"));
            }
            Err(e) => {
                warn!(request_id, "Could not submit task: {e}");
                task.is_invalid = true;
                task.advance(TaskPhase::Executing, "submit failed");
            }
        }
    }

    /// Retry a payload that could not be fetched, up to the timeout limit.
    /// Past it the request is published as invalid.
    fn payload_unavailable(&mut self, request_id: u64, reason: &str) {
        if !self.registry.contains(request_id) {
            return;
        }
        let failures = self.registry.count_fetch_failure(request_id);
        if failures < self.config.timeout_limit {
            self.requeue(request_id, reason);
            return;
        }
        warn!(request_id, failures, "Payload unavailable, giving up");
        self.mark_invalid(request_id, None, reason);
    }

    fn mark_invalid(&mut self, request_id: u64, tool: Option<String>, reason: &str) {
        self.registry.update(request_id, |task| {
            task.is_invalid = true;
            task.info.tool = tool;
            task.advance(TaskPhase::Executing, reason);
        });
    }

    /// Unbind a task from its slot and put its request at the back of the
    /// queue.
    fn requeue(&mut self, request_id: u64, reason: &str) {
        let Some(task) = self.registry.remove(request_id) else {
            return;
        };
        info!(request_id, reason, "Adding task to the end of the queue");
        self.pending.push_back(task.requeue(reason));
    }

    async fn execute_tasks(&mut self) {
        if self.network.is_busy() {
            return;
        }
        let now = Instant::now();

        for task in self.registry.iter_mut() {
            if let Some(finalization) = &task.finalization
                && now > finalization.deadline
            {
                warn!(
                    request_id = task.request_id(),
                    "Finalization timed out, marking task invalid"
                );
                task.is_invalid = true;
                task.finalization = None;
                break;
            }
        }

        match self.registry.pending_finalization() {
            Some(request_id) => self.issue_store(request_id),
            None => self.advance_one(now),
        }

        self.dequeue();
    }

    /// Finalize or time out the first task that is ready for it.
    fn advance_one(&mut self, now: Instant) {
        enum Next {
            Finalize(u64),
            TimedOut(u64),
        }

        let mut next = None;
        for task in self.registry.iter_mut() {
            if task.is_pending_finalization() || task.phase() == TaskPhase::AwaitingPayload {
                continue;
            }
            let request_id = task.request_id();
            if task.is_invalid || task.outcome.is_some() {
                next = Some(Next::Finalize(request_id));
                break;
            }
            if let Some(done) = task.handle.as_mut().and_then(|h| h.poll_done()) {
                task.outcome = Some(match done {
                    Ok(response) => TaskOutcome::Completed(response),
                    Err(e) => {
                        warn!(request_id, "Exception raised while executing task: {e}");
                        TaskOutcome::Failed
                    }
                });
                next = Some(Next::Finalize(request_id));
                break;
            }
            if task.has_timed_out(now) {
                next = Some(Next::TimedOut(request_id));
                break;
            }
        }

        match next {
            Some(Next::Finalize(request_id)) => self.finalize(request_id),
            Some(Next::TimedOut(request_id)) => self.handle_timeout(request_id),
            None => {}
        }
    }

    fn handle_timeout(&mut self, request_id: u64) {
        let count = self.registry.count_timeout(request_id);
        let Some(task) = self.registry.get_mut(request_id) else {
            return;
        };
        info!(request_id, timeouts = count, "Task timed out");

        if let Some(mut handle) = task.handle.take() {
            handle.cancel();
        }
        // The job may ignore cancellation; a fresh slot guarantees the next
        // task does not queue behind it.
        if let Err(e) = self.pool.restart(task.executor_idx) {
            warn!(request_id, "Could not restart worker slot: {e}");
        }

        if count < self.config.timeout_limit {
            self.requeue(request_id, "timed out");
            return;
        }

        info!(
            request_id,
            limit = self.config.timeout_limit,
            "Task reached the timeout limit, it won't be queued again"
        );
        task.outcome = Some(TaskOutcome::TimedOut {
            limit: self.config.timeout_limit,
        });
        self.finalize(request_id);
    }

    /// Build the result of a task and start storing it.
    fn finalize(&mut self, request_id: u64) {
        let Some(task) = self.registry.get_mut(request_id) else {
            return;
        };
        let outcome = match task.outcome.take() {
            Some(outcome) if !task.is_invalid => outcome,
            _ => TaskOutcome::Failed,
        };
        let mut prepared = prepare(
            &task.request,
            &task.info,
            &self.config.agent_address,
            outcome,
        );
        if let Some(keys) = prepared.keys.take() {
            self.keychain = keys;
        }

        info!(
            request_id,
            result = %prepared.envelope.result,
            "Task result ready"
        );
        if task.phase() == TaskPhase::Executing {
            task.advance(TaskPhase::PendingFinalization, "result ready");
        }
        task.handle = None;
        task.finalization = Some(Finalization {
            prepared,
            deadline: Instant::now() + FINALIZATION_TIMEOUT,
            store_call: None,
        });
        self.issue_store(request_id);
    }

    fn issue_store(&mut self, request_id: u64) {
        if self.network.is_busy() {
            return;
        }
        let Some(finalization) = self
            .registry
            .get_mut(request_id)
            .and_then(|task| task.finalization.as_mut())
        else {
            return;
        };
        if finalization.store_call.is_some() {
            return;
        }
        let files = finalization.prepared.envelope.to_files();
        finalization.store_call = Some(self.network.store_files(files, request_id));
    }

    async fn on_stored(
        &mut self,
        correlation_id: Uuid,
        request_id: u64,
        result: Result<ContentHash, StorageError>,
    ) {
        let Some(finalization) = self
            .registry
            .get_mut(request_id)
            .and_then(|task| task.finalization.as_mut())
        else {
            debug!(request_id, "Store response for a task no longer finalizing");
            return;
        };
        if finalization.store_call != Some(correlation_id) {
            debug!(request_id, "Ignoring store response for a replaced result");
            return;
        }
        finalization.store_call = None;

        let hash = match result {
            Ok(hash) => hash,
            Err(e) => {
                warn!(request_id, "Storing the result failed, will retry: {e}");
                return;
            }
        };

        let Some(mut task) = self.registry.remove(request_id) else {
            return;
        };
        let Some(finalization) = task.finalization.take() else {
            return;
        };
        task.advance(TaskPhase::Terminal, "result published");
        info!(
            request_id,
            attempts = task.lifecycle.attempts(),
            "Publishing task result"
        );
        self.publisher
            .complete(&task.request, finalization.prepared.done_task, hash)
            .await;
        self.registry.clear_counters(request_id);
        self.recently_finalized.insert(request_id);
    }

    /// Bind the next queued request to a free slot and fetch its payload.
    fn dequeue(&mut self) {
        if self.pending.is_empty()
            || self.registry.len() >= self.pool.size()
            || self.network.is_busy()
        {
            return;
        }
        let Some(slot) = self.next_free_slot() else {
            return;
        };
        let Some(queued) = self.pending.pop_front() else {
            return;
        };

        let request_id = queued.request_id();
        let mut task = ExecutingTask::new(queued, slot);
        task.advance(TaskPhase::AwaitingPayload, format!("bound to slot {slot}"));

        match ContentHash::from_request_data(&task.request.data) {
            Ok(hash) => {
                debug!(request_id, slot, hash = %hash, "Fetching task payload");
                self.network
                    .fetch_files(hash, CallPurpose::FetchPayload { request_id });
            }
            Err(e) => {
                warn!(request_id, "Undecodable payload reference: {e}");
                task.is_invalid = true;
                task.advance(TaskPhase::Executing, "undecodable payload reference");
            }
        }
        self.registry.insert(task);
    }

    /// Round-robin over slots not bound to a task.
    fn next_free_slot(&mut self) -> Option<usize> {
        let size = self.pool.size();
        let busy = self.registry.busy_slots();
        let slot = (0..size)
            .map(|offset| (self.task_index + offset) % size)
            .find(|slot| !busy.contains(slot))?;
        self.task_index = slot + 1;
        Some(slot)
    }
}

/// Spawn the scheduler loop.
///
/// Returns a `JoinHandle` and a shutdown flag. Set the flag to stop ticking.
pub fn spawn_scheduler(scheduler: TaskScheduler) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!("Task scheduler started");
        scheduler.run(shutdown).await;
    });

    (handle, shutdown_flag)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files(body: &str) -> Files {
        Files::from([("payload".to_string(), body.as_bytes().to_vec())])
    }

    #[test]
    fn payload_parsing() {
        let payload = parse_payload(
            &files(r#"{"tool": "echo", "prompt": "hi", "model": "m", "nonce": 4}"#),
            false,
        )
        .unwrap();
        assert_eq!(payload.tool, "echo");
        assert_eq!(payload.prompt, "hi");
        assert_eq!(payload.model.as_deref(), Some("m"));
        assert_eq!(payload.extra["nonce"], 4);
        assert!(!payload.extra.contains_key("tool"));
    }

    #[test]
    fn invalid_payloads() {
        let err = parse_payload(&files(r#"{"prompt": "hi"}"#), false).unwrap_err();
        assert!(err.tool.is_none());

        let err = parse_payload(&files(r#"{"tool": "echo"}"#), false).unwrap_err();
        assert_eq!(err.tool.as_deref(), Some("echo"));

        assert!(parse_payload(&files("[1, 2]"), false).is_err());
        assert!(parse_payload(&files("not json"), false).is_err());
        assert!(parse_payload(&Files::new(), false).is_err());

        let err = parse_payload(&files(r#"{"tool": "echo", "prompt": "p"}"#), true).unwrap_err();
        assert_eq!(err.reason, "clearing the queue");
    }

    #[test]
    fn recent_ids_are_bounded() {
        let mut recent = RecentIds::default();
        for id in 0..(RECENTLY_FINALIZED_CAPACITY as u64 + 5) {
            recent.insert(id);
        }
        assert!(!recent.contains(0));
        assert!(!recent.contains(4));
        assert!(recent.contains(5));
        assert_eq!(recent.order.len(), RECENTLY_FINALIZED_CAPACITY);
    }
}
