//! showrunner-tasks: dispatch-and-tracking core for the Showrunner
//! media-production pipeline
//!
//! Clients submit long-running jobs (video/image/audio generation,
//! department evaluations, automated content gathering); this crate owns the
//! durable task records, the typed work queues, the worker execution
//! lifecycle with timeouts/retries/cancellation, and terminal webhook
//! delivery. Payload logic stays behind the [`Executor`] seam.

pub mod error;
pub mod state;
pub mod task;
pub mod entry;
pub mod retry;
pub mod routing;
pub mod metrics;

pub mod store;
pub mod broker;
pub mod executor;
pub mod lifecycle;
pub mod worker;
pub mod reaper;
pub mod webhook;
pub mod health;

// Re-exports
pub use error::{FailureKind, TaskError, TaskFailure};
pub use state::TaskState;
pub use task::{Priority, TaskId, TaskRecord, TaskType};
pub use entry::QueueEntry;
pub use retry::RetryPolicy;
pub use routing::{ExecutionPolicy, PolicyConfig, TaskRouter};
pub use metrics::CounterSnapshot;

// Store re-exports
pub use store::{
    MemoryStore, MutationStep, Mutator, Page, PageRequest, TaskFilter, TaskStore, TerminalEvent,
    UpdateOutcome,
};

#[cfg(feature = "redis")]
pub use store::{RedisStore, RedisStoreConfig};

// Broker re-exports
pub use broker::{Broker, Delivery, LeaseToken, MemoryBroker};

#[cfg(feature = "redis")]
pub use broker::{RedisBroker, RedisBrokerConfig};

// Executor re-exports
pub use executor::{
    ExecutionContext, ExecutionOutcome, Executor, ExecutorRegistry, ProgressSink,
};

// Lifecycle re-exports
pub use lifecycle::{CancelOutcome, LifecycleManager};

// Worker re-exports
pub use worker::{Worker, WorkerConfig, WorkerExit};

// Reaper re-exports
pub use reaper::{Reaper, ReaperConfig};

// Webhook re-exports
pub use webhook::{WebhookConfig, WebhookDeliverer};

// Health re-exports
pub use health::{Alert, AlertKind, HealthChecker, HealthReport, HealthStatus};

/// Result type for dispatch-core operations
pub type Result<T> = std::result::Result<T, TaskError>;
