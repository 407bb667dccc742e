//! Execution coordinator — retry, fallback and breaker reporting
//!
//! ```text
//! execute(task, payload)
//!   ├─ rank candidates (selector)
//!   └─ for each candidate
//!        ├─ breaker denies       → skip ("circuit open")
//!        ├─ transient error      → back off, retry up to max_attempts
//!        ├─ hard error / retries → on_failure, next candidate
//!        ├─ fatal error          → abort, no fallback
//!        └─ success              → on_success, return
//! ```
//!
//! Stats are updated after every attempt; the breaker hears about each
//! candidate exactly once.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::audit::{ExecutionEvent, SharedAuditSink};
use super::backoff::RetryConfig;
use super::invoker::{BackendInvoker, InvocationError};
use crate::clock::SharedClock;
use crate::error::{BackendFailure, EngineError, EngineResult};
use crate::registry::BackendId;
use crate::router::{BackendSelector, BackendStats, CircuitBreaker, TaskProfile};

/// Successful execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub execution_id: Uuid,
    /// Backend that produced the output
    pub backend: BackendId,
    pub output: String,
    /// Invocations across every candidate, including the successful one
    pub attempts: u32,
    pub elapsed: Duration,
    /// Candidates that failed or were skipped before the successful one
    pub fallbacks: u32,
}

/// How one candidate ended
enum CandidateResult {
    Succeeded(String),
    Failed(InvocationError),
}

/// Wraps one logical call with retry, fallback and breaker/stats reporting
pub struct ExecutionCoordinator {
    selector: BackendSelector,
    breaker: Arc<CircuitBreaker>,
    stats: Arc<BackendStats>,
    invoker: Arc<dyn BackendInvoker>,
    retry: RetryConfig,
    clock: SharedClock,
    audit: Option<SharedAuditSink>,
}

impl std::fmt::Debug for ExecutionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionCoordinator")
            .field("retry", &self.retry)
            .field("audit", &self.audit.is_some())
            .finish()
    }
}

impl ExecutionCoordinator {
    pub fn new(
        selector: BackendSelector,
        breaker: Arc<CircuitBreaker>,
        stats: Arc<BackendStats>,
        invoker: Arc<dyn BackendInvoker>,
        retry: RetryConfig,
        clock: SharedClock,
    ) -> Self {
        Self {
            selector,
            breaker,
            stats,
            invoker,
            retry,
            clock,
            audit: None,
        }
    }

    pub fn with_audit(mut self, sink: SharedAuditSink) -> Self {
        self.audit = Some(sink);
        self
    }

    pub fn selector(&self) -> &BackendSelector {
        &self.selector
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    /// Run `payload` against the best backend for `task`, falling back
    /// through every registered backend.
    pub async fn execute(
        &self,
        task: &TaskProfile,
        payload: &str,
    ) -> EngineResult<ExecutionOutcome> {
        let candidates = self.selector.registry().ids();
        self.execute_with(task, &candidates, payload).await
    }

    /// Like [`execute`](Self::execute), restricted to `candidates`.
    pub async fn execute_with(
        &self,
        task: &TaskProfile,
        candidates: &[BackendId],
        payload: &str,
    ) -> EngineResult<ExecutionOutcome> {
        let execution_id = Uuid::new_v4();
        let started = Instant::now();
        let ranked = self.selector.rank(task, candidates);
        let mut failures = self.excluded_candidates(candidates, &ranked);
        let mut total_attempts = 0u32;
        let mut fallbacks = 0u32;

        debug!(
            execution_id = %execution_id,
            candidates = ranked.len(),
            excluded = failures.len(),
            "Starting execution"
        );

        for backend in &ranked {
            if !self.breaker.is_available(backend) {
                debug!(
                    execution_id = %execution_id,
                    backend = %backend,
                    "Skipping candidate, circuit open"
                );
                failures.push(BackendFailure {
                    backend: backend.clone(),
                    reason: "circuit open".to_string(),
                    attempts: 0,
                });
                fallbacks += 1;
                continue;
            }

            let candidate_started = Instant::now();
            let (result, attempts) = self.run_candidate(backend, task, payload).await;
            total_attempts += attempts;
            let latency = candidate_started.elapsed();

            match result {
                CandidateResult::Succeeded(output) => {
                    self.breaker.on_success(backend).await;
                    self.emit(execution_id, task, backend, attempts, latency, None);
                    self.stats.flush().await;

                    let elapsed = started.elapsed();
                    if fallbacks > 0 {
                        info!(
                            execution_id = %execution_id,
                            backend = %backend,
                            fallbacks,
                            attempts = total_attempts,
                            "Execution succeeded on fallback backend"
                        );
                    } else {
                        debug!(
                            execution_id = %execution_id,
                            backend = %backend,
                            attempts = total_attempts,
                            "Execution succeeded"
                        );
                    }
                    return Ok(ExecutionOutcome {
                        execution_id,
                        backend: backend.clone(),
                        output,
                        attempts: total_attempts,
                        elapsed,
                        fallbacks,
                    });
                }
                CandidateResult::Failed(InvocationError::Fatal(reason)) => {
                    // The request is at fault, not the backend.
                    self.breaker.release_trial(backend);
                    self.emit(
                        execution_id,
                        task,
                        backend,
                        attempts,
                        latency,
                        Some(reason.as_str()),
                    );
                    self.stats.flush().await;
                    warn!(
                        execution_id = %execution_id,
                        backend = %backend,
                        reason = %reason,
                        "Fatal error, aborting execution"
                    );
                    return Err(EngineError::Fatal {
                        backend: backend.clone(),
                        reason,
                    });
                }
                CandidateResult::Failed(error) => {
                    self.breaker.on_failure(backend).await;
                    let reason = error.to_string();
                    self.emit(
                        execution_id,
                        task,
                        backend,
                        attempts,
                        latency,
                        Some(reason.as_str()),
                    );
                    warn!(
                        execution_id = %execution_id,
                        backend = %backend,
                        attempts,
                        error = %error,
                        "Backend failed, falling back"
                    );
                    failures.push(BackendFailure {
                        backend: backend.clone(),
                        reason,
                        attempts,
                    });
                    fallbacks += 1;
                }
            }
        }

        self.stats.flush().await;
        warn!(
            execution_id = %execution_id,
            backends = failures.len(),
            attempts = total_attempts,
            "All backends exhausted"
        );
        Err(EngineError::BackendsExhausted { failures })
    }

    /// Invoke one backend with retries. Returns the final result and the
    /// number of invocations made.
    ///
    /// A half-open trial held for `backend` is renewed before every attempt
    /// and every backoff, so no second trial is granted while this one is
    /// still retrying.
    async fn run_candidate(
        &self,
        backend: &BackendId,
        task: &TaskProfile,
        payload: &str,
    ) -> (CandidateResult, u32) {
        let max_attempts = self.retry.max_attempts.max(1);
        let timeout = self.selector.registry().timeout_for(backend);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            self.breaker.renew_trial(backend);
            let call_started = Instant::now();
            let result =
                match tokio::time::timeout(timeout, self.invoker.invoke(backend, task, payload))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(InvocationError::Transient(format!(
                        "timed out after {}s",
                        timeout.as_secs_f64()
                    ))),
                };
            self.stats
                .record_attempt(backend, result.is_ok(), call_started.elapsed());

            match result {
                Ok(output) => return (CandidateResult::Succeeded(output), attempt),
                Err(error) if error.is_retryable() && attempt < max_attempts => {
                    let delay = self.retry.delay_for(attempt - 1);
                    debug!(
                        backend = %backend,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Transient failure, retrying"
                    );
                    self.breaker.renew_trial(backend);
                    tokio::time::sleep(delay).await;
                }
                Err(error) => return (CandidateResult::Failed(error), attempt),
            }
        }
    }

    /// Requested candidates that ranking dropped, with the reason.
    fn excluded_candidates(
        &self,
        candidates: &[BackendId],
        ranked: &[BackendId],
    ) -> Vec<BackendFailure> {
        let mut excluded: Vec<BackendFailure> = Vec::new();
        for candidate in candidates {
            if ranked.contains(candidate) || excluded.iter().any(|f| &f.backend == candidate) {
                continue;
            }
            let reason = if self.selector.registry().contains(candidate) {
                "circuit open"
            } else {
                "unknown backend"
            };
            excluded.push(BackendFailure {
                backend: candidate.clone(),
                reason: reason.to_string(),
                attempts: 0,
            });
        }
        excluded
    }

    fn emit(
        &self,
        execution_id: Uuid,
        task: &TaskProfile,
        backend: &BackendId,
        attempts: u32,
        latency: Duration,
        error: Option<&str>,
    ) {
        let Some(sink) = &self.audit else {
            return;
        };
        sink.record(&ExecutionEvent {
            execution_id,
            task: task.clone(),
            backend: backend.clone(),
            success: error.is_none(),
            attempts,
            latency_ms: latency.as_millis() as u64,
            error: error.map(str::to_string),
            timestamp: self.clock.now(),
        });
    }
}
