//! Error types for the mech worker.

/// Top-level error type for the worker.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("Tool package error: {0}")]
    Package(#[from] PackageError),

    #[error("Worker pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Ledger collaborator errors.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Ledger call {method} failed: {reason}")]
    RequestFailed { method: String, reason: String },

    #[error("Ledger unavailable: {0}")]
    Unavailable(String),
}

/// Content-addressed storage errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Content {hash} not found")]
    NotFound { hash: String },

    #[error("Invalid content hash: {0}")]
    InvalidHash(String),

    #[error("Storage request failed: {0}")]
    RequestFailed(String),

    #[error("Refusing to store an empty file set")]
    EmptyFileSet,
}

/// Tool execution errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ToolError {
    #[error("Rate limited by {service}")]
    RateLimited { service: String },

    #[error("Invalid parameters for tool {name}: {reason}")]
    InvalidParameters { name: String, reason: String },

    #[error("Tool panicked: {reason}")]
    Panicked { reason: String },

    #[error("Execution was discarded by worker slot {slot}")]
    Discarded { slot: usize },
}

/// Tool package decoding errors.
#[derive(Debug, thiserror::Error)]
pub enum PackageError {
    #[error("Package has no component manifest")]
    MissingManifest,

    #[error("Invalid component manifest: {0}")]
    InvalidManifest(#[from] serde_json::Error),

    #[error("Package is missing entry point {file}")]
    MissingEntryPoint { file: String },

    #[error("No executable registered for callable {callable}")]
    UnknownCallable { callable: String },
}

/// Worker pool errors.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Worker slot {slot} out of range (pool has {slots} slots)")]
    SlotOutOfRange { slot: usize, slots: usize },

    #[error("Worker slot {slot} is broken and could not be restarted")]
    Broken { slot: usize },
}

/// Side-channel delivery errors.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("Failed to deliver to {recipient}: {reason}")]
    SendFailed { recipient: String, reason: String },
}

/// Result type alias for the worker.
pub type Result<T> = std::result::Result<T, Error>;
