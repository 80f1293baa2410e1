//! In-memory ledger, used for local runs and tests.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{Ledger, TaskRequest, UndeliveredRequests};
use crate::error::LedgerError;
use crate::storage::CallTracker;

#[derive(Debug, Default)]
struct Chain {
    head: u64,
    /// Requests with the block they were made in.
    requests: Vec<(u64, TaskRequest)>,
    delivered: HashSet<u64>,
}

/// Ledger backed by a vector of requests. Every pushed request mines a
/// new block.
pub struct InMemoryLedger {
    chain: RwLock<Chain>,
    tracker: Arc<CallTracker>,
    latency: Duration,
    failing_calls: AtomicUsize,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::with_tracker(CallTracker::new())
    }

    /// Share a call tracker with other collaborators.
    pub fn with_tracker(tracker: Arc<CallTracker>) -> Self {
        Self {
            chain: RwLock::new(Chain::default()),
            tracker,
            latency: Duration::ZERO,
            failing_calls: AtomicUsize::new(0),
        }
    }

    /// Delay every call by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Make the next `count` calls fail.
    pub fn fail_next_calls(&self, count: usize) {
        self.failing_calls.store(count, Ordering::SeqCst);
    }

    /// Record a request in a freshly mined block. Returns that block.
    pub async fn push_request(&self, request: TaskRequest) -> u64 {
        let mut chain = self.chain.write().await;
        chain.head += 1;
        let block = chain.head;
        chain.requests.push((block, request));
        block
    }

    /// Advance the head without adding requests.
    pub async fn mine(&self, blocks: u64) {
        self.chain.write().await.head += blocks;
    }

    /// Flag a request as delivered so later scans skip it.
    pub async fn mark_delivered(&self, request_id: u64) {
        self.chain.write().await.delivered.insert(request_id);
    }

    pub async fn head(&self) -> u64 {
        self.chain.read().await.head
    }

    async fn enter_call(&self, method: &str) -> Result<(), LedgerError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let failing = self
            .failing_calls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match failing {
            Ok(_) => Err(LedgerError::RequestFailed {
                method: method.to_string(),
                reason: "injected failure".to_string(),
            }),
            Err(_) => Ok(()),
        }
    }
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Ledger for InMemoryLedger {
    async fn latest_block(&self) -> Result<u64, LedgerError> {
        let _call = self.tracker.start();
        self.enter_call("latest_block").await?;
        Ok(self.chain.read().await.head)
    }

    async fn undelivered_requests(
        &self,
        from_block: u64,
        contract_addresses: &[String],
        max_block_window: u64,
    ) -> Result<UndeliveredRequests, LedgerError> {
        let _call = self.tracker.start();
        self.enter_call("undelivered_requests").await?;

        let chain = self.chain.read().await;
        let to_block = chain.head.min(from_block.saturating_add(max_block_window));
        let requests = chain
            .requests
            .iter()
            .filter(|(block, _)| (from_block..=to_block).contains(block))
            .filter(|(_, request)| {
                contract_addresses.is_empty()
                    || contract_addresses
                        .iter()
                        .any(|a| a.eq_ignore_ascii_case(&request.contract_address))
            })
            .filter(|(_, request)| !chain.delivered.contains(&request.request_id))
            .map(|(_, request)| request.clone())
            .collect();

        Ok(UndeliveredRequests { requests, to_block })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(id: u64, mech: &str) -> TaskRequest {
        TaskRequest {
            request_id: id,
            request_id_with_nonce: format!("{id}-0"),
            sender: "0xsender".into(),
            contract_address: mech.into(),
            data: vec![],
        }
    }

    #[tokio::test]
    async fn scan_filters_by_window_address_and_delivery() {
        let ledger = InMemoryLedger::new();
        ledger.push_request(request(1, "0xMech")).await;
        ledger.push_request(request(2, "0xother")).await;
        ledger.push_request(request(3, "0xmech")).await;
        ledger.mine(10).await;
        ledger.push_request(request(4, "0xmech")).await;
        ledger.mark_delivered(3).await;

        let mechs = vec!["0xmech".to_string()];
        let scan = ledger.undelivered_requests(0, &mechs, 5).await.unwrap();
        assert_eq!(scan.to_block, 5);
        let ids: Vec<u64> = scan.requests.iter().map(|r| r.request_id).collect();
        assert_eq!(ids, vec![1]);

        let scan = ledger.undelivered_requests(5, &mechs, 100).await.unwrap();
        assert_eq!(scan.to_block, 14);
        assert_eq!(scan.requests[0].request_id, 4);
    }

    #[tokio::test]
    async fn injected_failure() {
        let ledger = InMemoryLedger::new();
        ledger.fail_next_calls(1);
        assert!(ledger.latest_block().await.is_err());
        assert_eq!(ledger.latest_block().await.unwrap(), 0);
    }
}
