//! Backend Router Module
//!
//! Decides which backend serves a task, based on:
//! - Task profile (complexity, required capabilities, domain)
//! - Circuit breaker state per backend
//! - Historical success rate per backend
//!
//! # Class Preferences
//!
//! ```text
//! Task trait              | Preferred class
//! ------------------------|-------------------
//! Speed + low complexity  | fast
//! Deep reasoning          | deep_reasoning
//! Complex code generation | code_generation
//! Small token budget      | economy
//! High complexity         | deep_reasoning
//! ```

pub mod circuit_breaker;
pub mod selector;
pub mod stats;
pub mod task;

pub use circuit_breaker::{BreakerConfig, BreakerRecord, CircuitBreaker, CircuitState};
pub use selector::{BackendSelector, Selection, SelectionRule, SelectorConfig};
pub use stats::{BackendMetric, BackendStats};
pub use task::{Complexity, Domain, TaskProfile, TaskProfileBuilder};
