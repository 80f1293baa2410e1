//! Intake poller: asks the ledger for undelivered requests.
//!
//! The first poll seeds `from_block` from the chain head. Every later poll
//! scans from `from_block - REORG_WINDOW` so that requests in blocks that
//! were reorganised since the last scan are seen again.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::LedgerError;
use crate::ledger::{TaskRequest, UndeliveredRequests};
use crate::worker::network::Network;

/// Blocks re-scanned on every poll.
pub const REORG_WINDOW: u64 = 200;

/// Timeout for the seeding latest-block query.
pub const SEED_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for a scan for undelivered requests.
pub const SCAN_TIMEOUT: Duration = Duration::from_secs(900);

/// Polls the ledger at a fixed interval, one query at a time.
#[derive(Debug)]
pub struct IntakePoller {
    polling_interval: Duration,
    last_polling: Option<Instant>,
    from_block: Option<u64>,
    contract_addresses: Vec<String>,
    max_block_window: u64,
}

impl IntakePoller {
    pub fn new(
        polling_interval: Duration,
        contract_addresses: Vec<String>,
        max_block_window: u64,
    ) -> Self {
        Self {
            polling_interval,
            last_polling: None,
            from_block: None,
            contract_addresses,
            max_block_window,
        }
    }

    pub fn from_block(&self) -> Option<u64> {
        self.from_block
    }

    /// Whether the polling interval has elapsed since the last query.
    pub fn should_poll(&self, now: Instant) -> bool {
        self.last_polling
            .is_none_or(|last| now.duration_since(last) >= self.polling_interval)
    }

    /// Issue the next query if one is due and no call is in flight.
    /// Returns whether a query was issued.
    pub fn poll(&mut self, net: &mut Network, now: Instant) -> bool {
        if net.is_busy() || !self.should_poll(now) {
            return false;
        }
        self.last_polling = Some(now);

        match self.from_block {
            None => {
                debug!("Seeding intake from the latest block");
                net.latest_block(SEED_TIMEOUT);
            }
            Some(from_block) => {
                let from_block = from_block.saturating_sub(REORG_WINDOW);
                debug!(from_block, "Scanning for undelivered requests");
                net.undelivered_requests(
                    from_block,
                    self.contract_addresses.clone(),
                    self.max_block_window,
                    SCAN_TIMEOUT,
                );
            }
        }
        true
    }

    pub fn on_latest_block(&mut self, result: Result<u64, LedgerError>) {
        match result {
            Ok(block) => {
                info!(block, "Intake seeded");
                self.from_block = Some(block);
            }
            Err(e) => warn!("Failed to fetch the latest block: {e}"),
        }
    }

    /// Advance `from_block` and hand back the scanned requests.
    pub fn on_requests(
        &mut self,
        result: Result<UndeliveredRequests, LedgerError>,
    ) -> Vec<TaskRequest> {
        match result {
            Ok(scan) => {
                if !scan.requests.is_empty() {
                    info!(
                        count = scan.requests.len(),
                        to_block = scan.to_block,
                        "Received undelivered requests"
                    );
                }
                self.from_block = Some(scan.to_block);
                scan.requests
            }
            Err(e) => {
                warn!("Failed to scan for undelivered requests: {e}");
                Vec::new()
            }
        }
    }
}
