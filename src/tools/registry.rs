//! Callable table: maps the `callable` named in a tool package manifest to
//! the executable that runs it.
//!
//! The built-in callables are bound at construction and stay bound; extra
//! callables can be added while the worker runs.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::tools::builtin::{EchoTool, NativeTransferTool};
use crate::tools::tool::Tool;

/// Callables shipped with the worker.
const BUILTIN_CALLABLES: &[&str] = &["echo", "native_transfer"];

pub struct ToolRegistry {
    callables: RwLock<HashMap<String, Arc<dyn Tool>>>,
}

impl ToolRegistry {
    /// An empty table, with no built-ins bound.
    pub fn new() -> Self {
        Self {
            callables: RwLock::new(HashMap::new()),
        }
    }

    /// A table holding the built-in callables.
    pub fn with_builtin_tools() -> Self {
        let builtins: [Arc<dyn Tool>; 2] =
            [Arc::new(EchoTool), Arc::new(NativeTransferTool::new())];
        let callables = builtins
            .into_iter()
            .map(|tool| (tool.name().to_string(), tool))
            .collect();
        Self {
            callables: RwLock::new(callables),
        }
    }

    /// Bind an extra callable while building the table.
    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        Self::bind(self.callables.get_mut(), tool);
        self
    }

    /// Bind an extra callable at runtime. Returns whether it was bound.
    pub async fn register(&self, tool: Arc<dyn Tool>) -> bool {
        Self::bind(&mut *self.callables.write().await, tool)
    }

    fn bind(callables: &mut HashMap<String, Arc<dyn Tool>>, tool: Arc<dyn Tool>) -> bool {
        let callable = tool.name().to_string();
        if Self::is_protected(&callable) {
            warn!(callable = %callable, "Refusing to rebind a built-in callable");
            return false;
        }
        debug!(callable = %callable, "Callable bound");
        callables.insert(callable, tool);
        true
    }

    pub fn is_protected(callable: &str) -> bool {
        BUILTIN_CALLABLES.contains(&callable)
    }

    /// Look up the executable for a manifest's callable.
    pub async fn resolve(&self, callable: &str) -> Option<Arc<dyn Tool>> {
        self.callables.read().await.get(callable).cloned()
    }

    /// Bound callable names, sorted.
    pub async fn callables(&self) -> Vec<String> {
        let mut names: Vec<String> = self.callables.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn len(&self) -> usize {
        self.callables.read().await.len()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
