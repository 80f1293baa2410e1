//! JSON fixtures for running the worker without a real ledger or content
//! store.
//!
//! ```json
//! {
//!   "contract_address": "0xMech",
//!   "tools": [
//!     {"manifest": {"name": "echo", "entry_point": "echo.py", "callable": "echo"},
//!      "source": "def run(**kwargs): ..."}
//!   ],
//!   "requests": [
//!     {"request_id": 1, "sender": "0xUser", "payload": {"tool": "echo", "prompt": "hi"}}
//!   ]
//! }
//! ```

use std::path::Path;

use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use crate::error::ConfigError;
use crate::ledger::{InMemoryLedger, TaskRequest};
use crate::storage::{ContentHash, Files, InMemoryContentStore};
use crate::tools::{ToolManifest, ToolPackage};

/// File name under which request payloads are stored.
pub const PAYLOAD_FILE: &str = "payload.json";

#[derive(Debug, Clone, Deserialize)]
pub struct Fixture {
    /// Mech address used by requests that don't name one.
    #[serde(default)]
    pub contract_address: Option<String>,
    #[serde(default)]
    pub tools: Vec<FixtureTool>,
    #[serde(default)]
    pub requests: Vec<FixtureRequest>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FixtureTool {
    pub manifest: ToolManifest,
    #[serde(default)]
    pub source: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FixtureRequest {
    pub request_id: u64,
    pub sender: String,
    #[serde(default)]
    pub contract_address: Option<String>,
    #[serde(default)]
    pub nonce: Option<String>,
    /// Stored in the content store; the request references its hash.
    #[serde(default)]
    pub payload: Option<Value>,
    /// Raw `0x` hex request data, used instead of a stored payload.
    #[serde(default)]
    pub data: Option<String>,
}

/// What installing a fixture produced.
#[derive(Debug, Default)]
pub struct InstalledFixture {
    /// Tool package hashes, ready for `WorkerConfig::file_hash_to_tools`.
    pub file_hash_to_tools: IndexMap<ContentHash, Vec<String>>,
    pub requests: usize,
}

impl Fixture {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(raw).map_err(|e| ConfigError::ParseError(format!("fixture: {e}")))
    }

    /// Store tool packages and payloads, then record every request on the
    /// ledger, one block per request.
    pub async fn install(
        self,
        ledger: &InMemoryLedger,
        store: &InMemoryContentStore,
    ) -> Result<InstalledFixture, ConfigError> {
        let mut installed = InstalledFixture::default();

        for tool in self.tools {
            let name = tool.manifest.name.clone();
            let package = ToolPackage {
                manifest: tool.manifest,
                source: tool.source.into_bytes(),
            };
            let hash = store.insert(package.to_files()).await;
            info!(tool = %name, hash = %hash, "Fixture tool stored");
            installed
                .file_hash_to_tools
                .entry(hash)
                .or_default()
                .push(name);
        }

        for request in self.requests {
            let data = match (request.data, request.payload) {
                (Some(raw), _) => hex::decode(raw.trim_start_matches("0x")).map_err(|e| {
                    ConfigError::InvalidValue {
                        key: format!("requests[{}].data", request.request_id),
                        message: e.to_string(),
                    }
                })?,
                (None, Some(payload)) => {
                    let body = serde_json::to_vec(&payload)
                        .map_err(|e| ConfigError::ParseError(e.to_string()))?;
                    let files = Files::from([(PAYLOAD_FILE.to_string(), body)]);
                    store.insert(files).await.multihash()
                }
                (None, None) => Vec::new(),
            };

            let contract_address = request
                .contract_address
                .or_else(|| self.contract_address.clone())
                .unwrap_or_default();
            let nonce = request.nonce.unwrap_or_else(|| "0".to_string());

            ledger
                .push_request(TaskRequest {
                    request_id: request.request_id,
                    request_id_with_nonce: format!("{}-{nonce}", request.request_id),
                    sender: request.sender,
                    contract_address,
                    data,
                })
                .await;
            installed.requests += 1;
        }

        Ok(installed)
    }
}
