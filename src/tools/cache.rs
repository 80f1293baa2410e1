//! Lazily downloaded tool packages.
//!
//! Tools are fetched one at a time in configuration order and kept for the
//! life of the worker. A package that does not decode, or that cannot be
//! fetched after a few attempts, is given up on so later tools still load.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use indexmap::IndexMap;
use tracing::{debug, info, warn};

use crate::error::PackageError;
use crate::storage::{ContentHash, Files};
use crate::tools::package::ToolPackage;
use crate::tools::registry::ToolRegistry;
use crate::tools::tool::Tool;
use crate::worker::network::{CallPurpose, Network};

/// Fetch attempts per tool before it is given up on.
pub const MAX_DOWNLOAD_ATTEMPTS: u32 = 3;

/// A downloaded tool, bound to its executable.
pub struct CachedTool {
    pub package: ToolPackage,
    pub executable: Arc<dyn Tool>,
}

/// Tool name to downloaded package, filled one fetch at a time.
pub struct ToolCache {
    tools_to_file_hash: IndexMap<String, ContentHash>,
    cached: HashMap<String, Arc<CachedTool>>,
    failed: HashSet<String>,
    attempts: HashMap<String, u32>,
    in_flight: Option<String>,
}

impl ToolCache {
    pub fn new(tools_to_file_hash: IndexMap<String, ContentHash>) -> Self {
        Self {
            tools_to_file_hash,
            cached: HashMap::new(),
            failed: HashSet::new(),
            attempts: HashMap::new(),
            in_flight: None,
        }
    }

    /// Start downloading the next missing tool, if nothing else is in
    /// flight. Returns whether a fetch was issued.
    pub fn ensure(&mut self, net: &mut Network) -> bool {
        if self.in_flight.is_some() || self.all_settled() || net.is_busy() {
            return false;
        }
        let Some((tool, hash)) = self
            .tools_to_file_hash
            .iter()
            .find(|(tool, _)| !self.is_settled(tool))
        else {
            return false;
        };

        debug!(tool = %tool, hash = %hash, "Downloading tool package");
        let tool = tool.clone();
        net.fetch_files(*hash, CallPurpose::FetchTool { tool: tool.clone() });
        self.in_flight = Some(tool);
        true
    }

    /// Decode a downloaded package and bind it to its executable. A package
    /// that cannot be bound will not bind on a second download either, so
    /// the tool is marked failed.
    pub async fn complete(
        &mut self,
        tool: &str,
        files: &Files,
        registry: &ToolRegistry,
    ) -> Result<(), PackageError> {
        self.clear_in_flight(tool);

        let (package, executable) = match Self::bind(files, registry).await {
            Ok(bound) => bound,
            Err(e) => {
                warn!(tool = %tool, "Giving up on tool package: {e}");
                self.failed.insert(tool.to_string());
                return Err(e);
            }
        };

        info!(
            tool = %tool,
            callable = %package.manifest.callable,
            "Tool downloaded"
        );
        self.cached.insert(
            tool.to_string(),
            Arc::new(CachedTool {
                package,
                executable,
            }),
        );
        Ok(())
    }

    async fn bind(
        files: &Files,
        registry: &ToolRegistry,
    ) -> Result<(ToolPackage, Arc<dyn Tool>), PackageError> {
        let package = ToolPackage::load(files)?;
        let executable = registry
            .resolve(&package.manifest.callable)
            .await
            .ok_or_else(|| PackageError::UnknownCallable {
                callable: package.manifest.callable.clone(),
            })?;
        Ok((package, executable))
    }

    /// Record a failed download. It is retried on a later tick until
    /// [`MAX_DOWNLOAD_ATTEMPTS`] is reached.
    pub fn fail(&mut self, tool: &str) {
        self.clear_in_flight(tool);
        let attempts = self.attempts.entry(tool.to_string()).or_insert(0);
        *attempts += 1;
        if *attempts >= MAX_DOWNLOAD_ATTEMPTS {
            warn!(tool = %tool, attempts = *attempts, "Tool download failed, giving up");
            self.failed.insert(tool.to_string());
        } else {
            warn!(tool = %tool, attempts = *attempts, "Tool download failed");
        }
    }

    fn clear_in_flight(&mut self, tool: &str) {
        if self.in_flight.as_deref() == Some(tool) {
            self.in_flight = None;
        }
    }

    /// Whether the tool is configured at all.
    pub fn is_known(&self, tool: &str) -> bool {
        self.tools_to_file_hash.contains_key(tool)
    }

    pub fn get(&self, tool: &str) -> Option<Arc<CachedTool>> {
        self.cached.get(tool).cloned()
    }

    /// Whether the tool was given up on.
    pub fn is_failed(&self, tool: &str) -> bool {
        self.failed.contains(tool)
    }

    fn is_settled(&self, tool: &str) -> bool {
        self.cached.contains_key(tool) || self.failed.contains(tool)
    }

    /// Whether every configured tool is either cached or given up on.
    pub fn all_settled(&self) -> bool {
        self.tools_to_file_hash
            .keys()
            .all(|tool| self.is_settled(tool))
    }

    pub fn in_flight(&self) -> Option<&str> {
        self.in_flight.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::ledger::InMemoryLedger;
    use crate::storage::InMemoryContentStore;
    use crate::tools::package::ToolManifest;
    use crate::worker::network::CallOutcome;

    fn package(name: &str, callable: &str) -> ToolPackage {
        ToolPackage {
            manifest: ToolManifest {
                name: name.into(),
                description: String::new(),
                entry_point: format!("{name}.py"),
                callable: callable.into(),
                params: Default::default(),
            },
            source: b"source".to_vec(),
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn downloads_in_order_one_at_a_time() {
        let store = Arc::new(InMemoryContentStore::new());
        let echo = store.insert(package("echo", "echo").to_files()).await;
        let transfer = store
            .insert(package("native_transfer", "native_transfer").to_files())
            .await;
        let mut net = Network::new(Arc::new(InMemoryLedger::new()), store);
        let registry = ToolRegistry::with_builtin_tools();
        let mut cache = ToolCache::new(IndexMap::from([
            ("echo".to_string(), echo),
            ("native_transfer".to_string(), transfer),
        ]));

        assert!(cache.ensure(&mut net));
        assert_eq!(cache.in_flight(), Some("echo"));
        assert!(!cache.ensure(&mut net));
        settle().await;

        for resolved in net.drain() {
            let (CallPurpose::FetchTool { tool }, CallOutcome::Files(Ok(files))) =
                (resolved.purpose, resolved.outcome)
            else {
                panic!("expected a tool download");
            };
            cache.complete(&tool, &files, &registry).await.unwrap();
        }
        assert!(cache.get("echo").is_some());
        assert!(!cache.all_settled());

        assert!(cache.ensure(&mut net));
        assert_eq!(cache.in_flight(), Some("native_transfer"));
    }

    #[tokio::test]
    async fn unknown_callable_is_a_decode_failure() {
        let registry = ToolRegistry::with_builtin_tools();
        let mut cache = ToolCache::new(IndexMap::from([(
            "mystery".to_string(),
            ContentHash::of(b"m"),
        )]));
        let err = cache
            .complete("mystery", &package("mystery", "nope").to_files(), &registry)
            .await
            .unwrap_err();
        assert!(matches!(err, PackageError::UnknownCallable { .. }));
        assert!(cache.get("mystery").is_none());
        assert!(cache.is_known("mystery"));
        assert!(cache.is_failed("mystery"));
        assert!(cache.all_settled());
        assert!(!cache.is_known("echo"));
    }

    #[tokio::test(start_paused = true)]
    async fn bad_package_does_not_block_later_tools() {
        let store = Arc::new(InMemoryContentStore::new());
        let broken = store.insert(package("broken", "not_registered").to_files()).await;
        let echo = store.insert(package("echo", "echo").to_files()).await;
        let mut net = Network::new(Arc::new(InMemoryLedger::new()), store);
        let registry = ToolRegistry::with_builtin_tools();
        let mut cache = ToolCache::new(IndexMap::from([
            ("broken".to_string(), broken),
            ("echo".to_string(), echo),
        ]));

        for expected in ["broken", "echo"] {
            assert!(cache.ensure(&mut net));
            assert_eq!(cache.in_flight(), Some(expected));
            settle().await;
            for resolved in net.drain() {
                let (CallPurpose::FetchTool { tool }, CallOutcome::Files(Ok(files))) =
                    (resolved.purpose, resolved.outcome)
                else {
                    panic!("expected a tool download");
                };
                let _ = cache.complete(&tool, &files, &registry).await;
            }
        }

        assert!(cache.is_failed("broken"));
        assert!(cache.get("echo").is_some());
        assert!(cache.all_settled());
        assert!(!cache.ensure(&mut net));
    }

    #[test]
    fn repeated_fetch_failures_give_up() {
        let mut cache = ToolCache::new(IndexMap::from([(
            "echo".to_string(),
            ContentHash::of(b"e"),
        )]));
        for _ in 1..MAX_DOWNLOAD_ATTEMPTS {
            cache.fail("echo");
            assert!(!cache.is_failed("echo"));
        }
        cache.fail("echo");
        assert!(cache.is_failed("echo"));
        assert!(cache.all_settled());
    }

    #[test]
    fn failure_clears_marker() {
        let mut cache = ToolCache::new(IndexMap::new());
        cache.in_flight = Some("echo".into());
        cache.fail("other");
        assert_eq!(cache.in_flight(), Some("echo"));
        cache.fail("echo");
        assert!(cache.in_flight().is_none());
        assert!(cache.all_settled());
    }
}
