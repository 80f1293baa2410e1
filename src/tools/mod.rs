//! Tools: the executable implementations, the packages that reference them
//! and the cache that downloads those packages.

pub mod builtin;
pub mod cache;
pub mod package;
pub mod registry;
pub mod tool;

pub use cache::{CachedTool, ToolCache};
pub use package::{ToolManifest, ToolPackage};
pub use registry::ToolRegistry;
pub use tool::*;
