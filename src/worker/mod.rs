//! Worker system: request scheduling and tool execution.
//!
//! Core components:
//! - `network`: spawned ledger/content-store calls and the in-flight guard
//! - `state`: per-request lifecycle (Pending → AwaitingPayload → Executing → ...)
//! - `pool`: fixed set of restartable execution slots
//! - `registry`: requests currently bound to a slot
//! - `publisher`: response envelopes, task results and the done list
//! - `scheduler`: the tick loop tying it all together

pub mod network;
pub mod pool;
pub mod publisher;
pub mod registry;
pub mod scheduler;
pub mod state;

pub use network::{CallOutcome, CallPurpose, Network};
pub use pool::{SlotState, TaskHandle, WorkerPool};
pub use publisher::{DoneTask, DoneTasks, ResponseEnvelope, ResultPublisher, TaskOutcome};
pub use registry::{ExecutingTask, QueuedRequest, TaskRegistry};
pub use scheduler::{SchedulerDeps, TaskScheduler, spawn_scheduler};
pub use state::{Lifecycle, TaskPhase};
