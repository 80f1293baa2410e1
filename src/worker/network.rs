//! Round trips to the ledger and the content store.
//!
//! Every call runs as a spawned task whose result comes back over an mpsc
//! inbox tagged with a correlation id. The scheduler drains the inbox once
//! per tick and matches each response against the pending-call table.
//!
//! A single [`InFlightGuard`] covers all calls: while it is held nobody
//! issues a new ledger or content-store request. Any response clears the
//! guard, and so does the call's timeout. A response that arrives after its
//! call timed out can therefore clear the guard of a newer call; that race
//! is accepted.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{LedgerError, StorageError};
use crate::ledger::{Ledger, UndeliveredRequests};
use crate::storage::{ContentHash, ContentStore, Files};

/// Timeout for content-store gets and puts.
pub const CONTENT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// What a call was issued for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallPurpose {
    FetchTool { tool: String },
    FetchPayload { request_id: u64 },
    StoreResult { request_id: u64 },
    LatestBlock,
    ScanRequests,
}

/// Result of a finished call.
#[derive(Debug)]
pub enum CallOutcome {
    Files(Result<Files, StorageError>),
    Stored(Result<ContentHash, StorageError>),
    LatestBlock(Result<u64, LedgerError>),
    Requests(Result<UndeliveredRequests, LedgerError>),
}

/// Message posted to the inbox by a finished call.
#[derive(Debug)]
pub struct CallResponse {
    pub correlation_id: Uuid,
    pub outcome: CallOutcome,
}

/// A response matched with the call that produced it.
#[derive(Debug)]
pub struct Resolved {
    pub correlation_id: Uuid,
    pub purpose: CallPurpose,
    pub outcome: CallOutcome,
}

/// System-wide "a call is outstanding" marker with self-clearing timeout.
#[derive(Debug, Default)]
pub struct InFlightGuard {
    held_until: Option<Instant>,
}

impl InFlightGuard {
    pub fn acquire(&mut self, now: Instant, timeout: Duration) {
        self.held_until = Some(now + timeout);
    }

    pub fn clear(&mut self) {
        self.held_until = None;
    }

    /// Whether the guard is held at `now`. An expired guard clears itself.
    pub fn is_held(&mut self, now: Instant) -> bool {
        match self.held_until {
            Some(until) if now < until => true,
            Some(_) => {
                debug!("In-flight guard timed out");
                self.held_until = None;
                false
            }
            None => false,
        }
    }
}

#[derive(Debug)]
struct PendingCall {
    purpose: CallPurpose,
    deadline: Instant,
}

/// Pending-call table plus the inbox its responses arrive on.
pub struct Network {
    ledger: Arc<dyn Ledger>,
    store: Arc<dyn ContentStore>,
    guard: InFlightGuard,
    pending: HashMap<Uuid, PendingCall>,
    responses_tx: mpsc::UnboundedSender<CallResponse>,
    responses_rx: mpsc::UnboundedReceiver<CallResponse>,
}

impl Network {
    pub fn new(ledger: Arc<dyn Ledger>, store: Arc<dyn ContentStore>) -> Self {
        let (responses_tx, responses_rx) = mpsc::unbounded_channel();
        Self {
            ledger,
            store,
            guard: InFlightGuard::default(),
            pending: HashMap::new(),
            responses_tx,
            responses_rx,
        }
    }

    /// Whether a ledger or content-store call is in flight.
    pub fn is_busy(&mut self) -> bool {
        self.guard.is_held(Instant::now())
    }

    /// Number of calls still waiting for a response.
    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }

    pub fn fetch_files(&mut self, hash: ContentHash, purpose: CallPurpose) -> Uuid {
        let store = Arc::clone(&self.store);
        self.issue(purpose, CONTENT_CALL_TIMEOUT, async move {
            CallOutcome::Files(store.get(&hash).await)
        })
    }

    pub fn store_files(&mut self, files: Files, request_id: u64) -> Uuid {
        let store = Arc::clone(&self.store);
        self.issue(
            CallPurpose::StoreResult { request_id },
            CONTENT_CALL_TIMEOUT,
            async move { CallOutcome::Stored(store.put(files).await) },
        )
    }

    pub fn latest_block(&mut self, timeout: Duration) -> Uuid {
        let ledger = Arc::clone(&self.ledger);
        self.issue(CallPurpose::LatestBlock, timeout, async move {
            CallOutcome::LatestBlock(ledger.latest_block().await)
        })
    }

    pub fn undelivered_requests(
        &mut self,
        from_block: u64,
        contract_addresses: Vec<String>,
        max_block_window: u64,
        timeout: Duration,
    ) -> Uuid {
        let ledger = Arc::clone(&self.ledger);
        self.issue(CallPurpose::ScanRequests, timeout, async move {
            CallOutcome::Requests(
                ledger
                    .undelivered_requests(from_block, &contract_addresses, max_block_window)
                    .await,
            )
        })
    }

    fn issue<F>(&mut self, purpose: CallPurpose, timeout: Duration, call: F) -> Uuid
    where
        F: Future<Output = CallOutcome> + Send + 'static,
    {
        let correlation_id = Uuid::new_v4();
        let now = Instant::now();
        self.guard.acquire(now, timeout);
        debug!(correlation_id = %correlation_id, purpose = ?purpose, "Issuing call");
        self.pending.insert(
            correlation_id,
            PendingCall {
                purpose,
                deadline: now + timeout,
            },
        );

        let tx = self.responses_tx.clone();
        tokio::spawn(async move {
            let outcome = call.await;
            // The receiver lives as long as the scheduler.
            let _ = tx.send(CallResponse {
                correlation_id,
                outcome,
            });
        });
        correlation_id
    }

    /// Collect every response that arrived since the last drain.
    ///
    /// Each response clears the guard. Responses for calls that already
    /// timed out are dropped.
    pub fn drain(&mut self) -> Vec<Resolved> {
        let mut resolved = Vec::new();
        while let Ok(response) = self.responses_rx.try_recv() {
            self.guard.clear();
            match self.pending.remove(&response.correlation_id) {
                Some(call) => resolved.push(Resolved {
                    correlation_id: response.correlation_id,
                    purpose: call.purpose,
                    outcome: response.outcome,
                }),
                None => {
                    debug!(
                        correlation_id = %response.correlation_id,
                        "Dropping late response for a timed-out call"
                    );
                }
            }
        }
        resolved
    }

    /// Remove calls whose timeout has passed and return what they were for.
    pub fn take_expired(&mut self) -> Vec<CallPurpose> {
        let now = Instant::now();
        let expired: Vec<Uuid> = self
            .pending
            .iter()
            .filter(|(_, call)| call.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        expired
            .into_iter()
            .filter_map(|id| self.pending.remove(&id))
            .map(|call| {
                warn!(purpose = ?call.purpose, "Call timed out without a response");
                call.purpose
            })
            .collect()
    }
}
