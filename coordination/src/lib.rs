//! Dispatch Coordination Library
//!
//! Dispatches tasks to interchangeable, independently failing backends and
//! keeps doing so while individual backends degrade and recover.
//!
//! # Components
//!
//! - **Circuit breaker**: per-backend `closed → open → half_open` state
//!   machine with a single trial call per half-open window
//! - **Backend stats**: running success rate and latency per backend
//! - **Selector**: rule cascade mapping a task profile to a backend class,
//!   never returning a backend the breaker excludes
//! - **Execution coordinator**: retry with exponential backoff, fallback
//!   across ranked candidates, fatal errors abort
//! - **Result cache**: content-addressed TTL cache behind a reader/writer
//!   lock, persisted atomically on every write
//!
//! # Usage
//!
//! ```rust,ignore
//! let config = EngineConfig::load(Path::new("dispatch.toml"))?;
//! let engine = Engine::from_config(config, Arc::new(MyInvoker)).await;
//!
//! let task = TaskProfile::builder().deep_reasoning().build();
//! let outcome = engine.execute(&task, "payload").await?;
//! ```

pub mod cache;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod persistence;
pub mod registry;
pub mod resilience;
pub mod router;

// Re-export the engine surface
pub use config::{BackendConfig, ConfigError, EngineConfig};
pub use engine::{CachedResult, Engine};
pub use error::{BackendFailure, EngineError, EngineResult};

// Re-export backend identity types
pub use registry::{BackendClass, BackendId, BackendProfile, BackendRegistry};

// Re-export routing types
pub use router::{
    BackendMetric, BackendSelector, BackendStats, BreakerConfig, BreakerRecord, CircuitBreaker,
    CircuitState, Complexity, Domain, Selection, SelectionRule, SelectorConfig, TaskProfile,
};

// Re-export resilience types
pub use resilience::{
    AuditSink, BackendInvoker, BroadcastAuditSink, ExecutionCoordinator, ExecutionEvent,
    ExecutionOutcome, InvocationError, RetryConfig,
};

// Re-export cache types
pub use cache::{compute_key, CacheConfig, CacheEntry, CacheStats, ResultCache};

// Re-export infrastructure
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use persistence::{JsonFileStore, MemoryStore, RecordStore, SharedStore, StoreError};
