//! Result publication: response envelopes, on-chain task results and the
//! shared done list.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::MechConfig;
use crate::delivery::Delivery;
use crate::health::HealthState;
use crate::keychain::KeyChain;
use crate::ledger::TaskRequest;
use crate::storage::{ContentHash, Files};
use crate::tools::ToolResponse;

/// Result string of every failed request.
pub const INVALID_RESPONSE: &str = "Invalid response";

/// A finished request, ready to be delivered on chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoneTask {
    pub request_id: u64,
    pub mech_address: String,
    pub task_executor_address: String,
    pub tool: Option<String>,
    pub request_id_nonce: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction: Option<Value>,
    /// Hex-encoded multihash of the stored envelope, ABI-wrapped with the
    /// cost when the mech prices dynamically.
    pub task_result: Option<String>,
}

/// The JSON document stored for every request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    #[serde(rename = "requestId")]
    pub request_id: u64,
    pub result: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_dict: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl ResponseEnvelope {
    pub fn invalid(request_id: u64) -> Self {
        Self {
            request_id,
            result: INVALID_RESPONSE.to_string(),
            prompt: None,
            cost_dict: None,
            metadata: None,
        }
    }

    /// File map stored in the content store: one file named after the
    /// request id.
    pub fn to_files(&self) -> Files {
        let body = serde_json::to_vec(self).unwrap_or_default();
        Files::from([(self.request_id.to_string(), body)])
    }
}

/// How a task ended.
#[derive(Debug)]
pub enum TaskOutcome {
    Completed(ToolResponse),
    /// Timed out `limit` times; never requeued again.
    TimedOut { limit: u32 },
    /// Invalid payload, tool error or discarded execution.
    Failed,
}

/// Tool identity recorded in the envelope metadata.
#[derive(Debug, Clone, Default)]
pub struct ToolInfo {
    pub tool: Option<String>,
    pub model: Option<String>,
    pub params: Map<String, Value>,
}

/// Envelope and done task computed when a task enters finalization.
#[derive(Debug, Clone)]
pub struct PreparedResult {
    pub envelope: ResponseEnvelope,
    pub done_task: DoneTask,
    /// Key chain handed back by the tool, if it ran.
    pub keys: Option<KeyChain>,
}

/// Build the envelope and the done task for a finished request.
pub fn prepare(
    request: &TaskRequest,
    info: &ToolInfo,
    agent_address: &str,
    outcome: TaskOutcome,
) -> PreparedResult {
    let mut done_task = DoneTask {
        request_id: request.request_id,
        mech_address: request.contract_address.clone(),
        task_executor_address: agent_address.to_string(),
        tool: info.tool.clone(),
        request_id_nonce: request.request_id_with_nonce.clone(),
        transaction: None,
        task_result: None,
    };

    let (envelope, keys) = match outcome {
        TaskOutcome::Completed(response) => {
            done_task.transaction = response.transaction;
            let cost_dict = response
                .usage
                .as_ref()
                .map_or_else(|| json!({}), |usage| usage.cost_dict());
            let envelope = ResponseEnvelope {
                request_id: request.request_id,
                result: response.message,
                prompt: response.prompt,
                cost_dict: Some(cost_dict),
                metadata: Some(json!({
                    "model": info.model,
                    "tool": info.tool,
                    "params": info.params,
                })),
            };
            (envelope, Some(response.keys))
        }
        TaskOutcome::TimedOut { limit } => {
            let envelope = ResponseEnvelope {
                request_id: request.request_id,
                result: format!("Task timed out {limit} times during execution."),
                prompt: Some(String::new()),
                cost_dict: None,
                metadata: None,
            };
            (envelope, None)
        }
        TaskOutcome::Failed => (ResponseEnvelope::invalid(request.request_id), None),
    };

    PreparedResult {
        envelope,
        done_task,
        keys,
    }
}

/// ABI encoding of `(uint256, bytes)`.
pub fn abi_encode_uint256_bytes(value: u64, bytes: &[u8]) -> Vec<u8> {
    fn word(n: u64) -> [u8; 32] {
        let mut out = [0u8; 32];
        out[24..].copy_from_slice(&n.to_be_bytes());
        out
    }

    let padded_len = bytes.len().div_ceil(32) * 32;
    let mut out = Vec::with_capacity(96 + padded_len);
    out.extend_from_slice(&word(value));
    // Offset of the dynamic part: two head words.
    out.extend_from_slice(&word(64));
    out.extend_from_slice(&word(bytes.len() as u64));
    out.extend_from_slice(bytes);
    out.resize(96 + padded_len, 0);
    out
}

/// The on-chain task result for a stored envelope.
pub fn encode_task_result(hash: &ContentHash, cost: u64, dynamic_pricing: bool) -> String {
    if dynamic_pricing {
        hex::encode(abi_encode_uint256_bytes(cost, &hash.multihash()))
    } else {
        hash.to_multihash_hex()
    }
}

/// Shared list of done tasks, drained by whoever delivers them on chain.
#[derive(Debug, Clone, Default)]
pub struct DoneTasks(Arc<Mutex<Vec<DoneTask>>>);

impl DoneTasks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn append(&self, task: DoneTask) {
        self.0.lock().await.push(task);
    }

    pub async fn snapshot(&self) -> Vec<DoneTask> {
        self.0.lock().await.clone()
    }

    /// Take every done task out of the list.
    pub async fn drain(&self) -> Vec<DoneTask> {
        std::mem::take(&mut *self.0.lock().await)
    }

    pub async fn len(&self) -> usize {
        self.0.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.0.lock().await.is_empty()
    }
}

/// Runs the last step of a request once its envelope is stored.
pub struct ResultPublisher {
    mech_to_config: HashMap<String, MechConfig>,
    delivery: Arc<dyn Delivery>,
    done_tasks: DoneTasks,
    health: HealthState,
}

impl ResultPublisher {
    pub fn new(
        mech_to_config: HashMap<String, MechConfig>,
        delivery: Arc<dyn Delivery>,
        done_tasks: DoneTasks,
        health: HealthState,
    ) -> Self {
        let mech_to_config = mech_to_config
            .into_iter()
            .map(|(address, config)| (address.to_lowercase(), config))
            .collect();
        Self {
            mech_to_config,
            delivery,
            done_tasks,
            health,
        }
    }

    pub fn done_tasks(&self) -> &DoneTasks {
        &self.done_tasks
    }

    /// Cost of a done task: the mech's price for its tool, else the mech's
    /// default price.
    pub fn cost_for_done_task(&self, done_task: &DoneTask) -> u64 {
        self.mech_config(&done_task.mech_address)
            .map_or(0, |config| config.price_for(done_task.tool.as_deref()))
    }

    fn mech_config(&self, mech_address: &str) -> Option<&MechConfig> {
        self.mech_to_config.get(&mech_address.to_lowercase())
    }

    /// Deliver the stored hash to the requester, fill in the task result and
    /// append the done task to the shared list.
    pub async fn complete(
        &self,
        request: &TaskRequest,
        mut done_task: DoneTask,
        hash: ContentHash,
    ) -> DoneTask {
        let cid = hash.to_cid_v1();
        info!(
            request_id = request.request_id,
            cid = %cid,
            "Response stored"
        );

        let delivery = Arc::clone(&self.delivery);
        let sender = request.sender.clone();
        let request_id = request.request_id;
        let payload = cid.clone();
        tokio::spawn(async move {
            if let Err(e) = delivery.send(&sender, request_id, &payload).await {
                warn!(request_id, "Side-channel delivery failed: {e}");
            }
        });

        self.health.set_last_executed(request.request_id).await;

        let cost = self.cost_for_done_task(&done_task);
        let dynamic_pricing = match self.mech_config(&done_task.mech_address) {
            Some(config) => config.use_dynamic_pricing,
            None => {
                warn!(
                    mech = %done_task.mech_address,
                    "No pricing configured for mech, reporting a plain multihash"
                );
                false
            }
        };
        info!(request_id = request.request_id, cost, dynamic_pricing, "Task cost");

        done_task.task_result = Some(encode_task_result(&hash, cost, dynamic_pricing));
        self.done_tasks.append(done_task.clone()).await;
        done_task
    }
}
