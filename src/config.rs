//! Configuration types.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

use crate::error::ConfigError;
use crate::keychain::KeyChain;
use crate::storage::ContentHash;

/// Pricing settings for one mech contract.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MechConfig {
    #[serde(default)]
    pub use_dynamic_pricing: bool,
    /// Price charged for tools without an explicit price.
    #[serde(default)]
    pub default_price: u64,
    #[serde(default)]
    pub tool_prices: HashMap<String, u64>,
}

impl MechConfig {
    /// Price of one run of `tool`.
    pub fn price_for(&self, tool: Option<&str>) -> u64 {
        tool.and_then(|t| self.tool_prices.get(t))
            .copied()
            .unwrap_or(self.default_price)
    }
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Address reported as the task executor on every done task.
    pub agent_address: String,
    /// Mech contracts whose requests this worker serves.
    pub contract_addresses: Vec<String>,
    /// Number of worker slots.
    pub max_executing_tasks: usize,
    /// Scheduler tick period.
    pub tick_interval: Duration,
    /// Minimum time between two ledger queries.
    pub polling_interval: Duration,
    /// Queue length beyond which task deadlines shrink.
    pub max_queue_size: usize,
    /// Execution deadline for a task under normal load.
    pub task_deadline: Duration,
    /// Timeouts tolerated before a task is finalized as failed.
    pub timeout_limit: u32,
    /// Largest block range scanned by one ledger query.
    pub max_block_window: u64,
    /// Finalize every incoming request as invalid without running it.
    pub clear_queue: bool,
    /// Tool packages to download, in download order.
    pub file_hash_to_tools: IndexMap<ContentHash, Vec<String>>,
    /// Pricing per mech contract address.
    pub mech_to_config: HashMap<String, MechConfig>,
    pub api_keys: KeyChain,
    /// Port for the health endpoint; disabled when unset.
    pub health_port: Option<u16>,
    /// Longest tolerated gap between executed tasks while work is pending.
    pub health_max_idle: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            agent_address: "0x0000000000000000000000000000000000000000".to_string(),
            contract_addresses: Vec::new(),
            max_executing_tasks: 10,
            tick_interval: Duration::from_millis(100),
            polling_interval: Duration::from_secs(30),
            max_queue_size: 10,
            task_deadline: Duration::from_secs(240),
            timeout_limit: 3,
            max_block_window: 5000,
            clear_queue: false,
            file_hash_to_tools: IndexMap::new(),
            mech_to_config: HashMap::new(),
            api_keys: KeyChain::default(),
            health_port: None,
            health_max_idle: Duration::from_secs(3600), // 1 hour
        }
    }
}

impl WorkerConfig {
    /// Load from `MECH_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let secs = |key: &str| parsed::<u64, _>(&lookup, key).map(Duration::from_secs);

        let contract_addresses: Vec<String> = lookup("MECH_CONTRACT_ADDRESSES")
            .map(|s| {
                s.split(',')
                    .map(|a| a.trim().to_string())
                    .filter(|a| !a.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let file_hash_to_tools: IndexMap<String, Vec<String>> =
            json_var(&lookup, "MECH_FILE_HASH_TO_TOOLS")?.unwrap_or_default();
        let file_hash_to_tools = file_hash_to_tools
            .into_iter()
            .map(|(hash, tools)| {
                let hash = hash.parse::<ContentHash>().map_err(|e| ConfigError::InvalidValue {
                    key: "MECH_FILE_HASH_TO_TOOLS".to_string(),
                    message: e.to_string(),
                })?;
                Ok((hash, tools))
            })
            .collect::<Result<IndexMap<_, _>, ConfigError>>()?;

        let mech_to_config: HashMap<String, MechConfig> =
            json_var(&lookup, "MECH_TO_CONFIG")?.unwrap_or_default();
        let mech_to_config = mech_to_config
            .into_iter()
            .map(|(address, config)| (address.to_lowercase(), config))
            .collect();

        let api_keys: HashMap<String, Vec<String>> =
            json_var(&lookup, "MECH_API_KEYS")?.unwrap_or_default();

        let max_executing_tasks = parsed(&lookup, "MECH_MAX_EXECUTING_TASKS")
            .unwrap_or(defaults.max_executing_tasks);
        if max_executing_tasks == 0 {
            return Err(ConfigError::InvalidValue {
                key: "MECH_MAX_EXECUTING_TASKS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            agent_address: lookup("MECH_AGENT_ADDRESS").unwrap_or(defaults.agent_address),
            contract_addresses,
            max_executing_tasks,
            tick_interval: parsed(&lookup, "MECH_TICK_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.tick_interval),
            polling_interval: secs("MECH_POLLING_INTERVAL_SECS")
                .unwrap_or(defaults.polling_interval),
            max_queue_size: parsed(&lookup, "MECH_MAX_QUEUE_SIZE").unwrap_or(defaults.max_queue_size),
            task_deadline: secs("MECH_TASK_DEADLINE_SECS").unwrap_or(defaults.task_deadline),
            timeout_limit: parsed(&lookup, "MECH_TIMEOUT_LIMIT").unwrap_or(defaults.timeout_limit),
            max_block_window: parsed(&lookup, "MECH_MAX_BLOCK_WINDOW")
                .unwrap_or(defaults.max_block_window),
            clear_queue: parsed(&lookup, "MECH_CLEAR_QUEUE").unwrap_or(defaults.clear_queue),
            file_hash_to_tools,
            mech_to_config,
            api_keys: KeyChain::new(api_keys),
            health_port: parsed(&lookup, "MECH_HEALTH_PORT"),
            health_max_idle: secs("MECH_HEALTH_MAX_IDLE_SECS")
                .unwrap_or(defaults.health_max_idle),
        })
    }

    /// Tool name to package hash, in configuration order.
    pub fn tools_to_file_hash(&self) -> IndexMap<String, ContentHash> {
        self.file_hash_to_tools
            .iter()
            .flat_map(|(hash, tools)| tools.iter().map(|tool| (tool.clone(), *hash)))
            .collect()
    }

    /// Pricing for a mech, looked up case-insensitively.
    pub fn mech_config(&self, mech_address: &str) -> Option<&MechConfig> {
        self.mech_to_config.get(&mech_address.to_lowercase())
    }
}

fn parsed<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    lookup(key).and_then(|s| s.trim().parse().ok())
}

fn json_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: DeserializeOwned,
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|raw| {
            serde_json::from_str(&raw).map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = WorkerConfig::from_lookup(vars(&[])).unwrap();
        assert_eq!(config.max_executing_tasks, 10);
        assert_eq!(config.timeout_limit, 3);
        assert!(config.file_hash_to_tools.is_empty());
        assert!(config.health_port.is_none());
    }

    #[test]
    fn reads_scalars_and_json() {
        let echo = ContentHash::of(b"echo-package");
        let transfer = ContentHash::of(b"transfer-package");
        let tools = format!(
            r#"{{"{}": ["echo"], "{}": ["native_transfer", "transfer_alias"]}}"#,
            echo.to_cid_v1(),
            transfer.to_multihash_hex()
        );
        let config = WorkerConfig::from_lookup(vars(&[
            ("MECH_MAX_EXECUTING_TASKS", "2"),
            ("MECH_TASK_DEADLINE_SECS", "100"),
            ("MECH_CONTRACT_ADDRESSES", "0xA, 0xB"),
            ("MECH_CLEAR_QUEUE", "true"),
            ("MECH_FILE_HASH_TO_TOOLS", tools.as_str()),
            (
                "MECH_TO_CONFIG",
                r#"{"0xMECH": {"use_dynamic_pricing": true, "default_price": 5, "tool_prices": {"echo": 1}}}"#,
            ),
            ("MECH_API_KEYS", r#"{"openai": ["k1", "k2"]}"#),
            ("MECH_HEALTH_PORT", "8716"),
        ]))
        .unwrap();

        assert_eq!(config.max_executing_tasks, 2);
        assert_eq!(config.task_deadline, Duration::from_secs(100));
        assert_eq!(config.contract_addresses, vec!["0xA", "0xB"]);
        assert!(config.clear_queue);
        assert_eq!(config.health_port, Some(8716));

        let order: Vec<String> = config.tools_to_file_hash().keys().cloned().collect();
        assert_eq!(order, vec!["echo", "native_transfer", "transfer_alias"]);
        assert_eq!(config.tools_to_file_hash()["transfer_alias"], transfer);

        let mech = config.mech_config("0xmech").unwrap();
        assert!(mech.use_dynamic_pricing);
        assert_eq!(mech.price_for(Some("echo")), 1);
        assert_eq!(mech.price_for(Some("other")), 5);
        assert_eq!(config.api_keys.max_retries()["openai"], 1);
    }

    #[test]
    fn rejects_bad_json() {
        let err = WorkerConfig::from_lookup(vars(&[("MECH_TO_CONFIG", "{not json")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "MECH_TO_CONFIG"));
    }

    #[test]
    fn rejects_zero_slots() {
        assert!(WorkerConfig::from_lookup(vars(&[("MECH_MAX_EXECUTING_TASKS", "0")])).is_err());
    }
}
