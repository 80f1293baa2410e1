//! Ledger boundary: where compute requests come from.

pub mod memory;
pub mod poller;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::LedgerError;

pub use memory::InMemoryLedger;
pub use poller::IntakePoller;

/// A compute request referenced on the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRequest {
    /// Ledger-assigned, unique per request.
    pub request_id: u64,
    pub request_id_with_nonce: String,
    pub sender: String,
    pub contract_address: String,
    /// Opaque payload reference, usually a content hash.
    #[serde(with = "hex_bytes")]
    pub data: Vec<u8>,
}

/// Result of one scan for undelivered requests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UndeliveredRequests {
    pub requests: Vec<TaskRequest>,
    /// Last block covered by the scan.
    pub to_block: u64,
}

/// Ledger collaborator.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Current chain head.
    async fn latest_block(&self) -> Result<u64, LedgerError>;

    /// Requests made since `from_block` that have not been delivered yet,
    /// scanning at most `max_block_window` blocks.
    async fn undelivered_requests(
        &self,
        from_block: u64,
        contract_addresses: &[String],
        max_block_window: u64,
    ) -> Result<UndeliveredRequests, LedgerError>;
}

/// `0x`-prefixed hex encoding for byte fields.
mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", hex::encode(bytes)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s.trim_start_matches("0x")).map_err(serde::de::Error::custom)
    }
}
