//! Resilience — retry, fallback and audit around backend calls
//!
//! A logical call is tried against ranked candidates. Transient failures are
//! retried with exponential backoff, hard failures move on to the next
//! candidate, and fatal failures stop the call outright.

pub mod audit;
pub mod backoff;
pub mod coordinator;
pub mod invoker;

pub use audit::{AuditSink, BroadcastAuditSink, ExecutionEvent, SharedAuditSink};
pub use backoff::RetryConfig;
pub use coordinator::{ExecutionCoordinator, ExecutionOutcome};
pub use invoker::{BackendInvoker, InvocationError};
