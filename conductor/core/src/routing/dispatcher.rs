//! Task Dispatch
//!
//! Drives one task through its ranked candidates until a backend produces a
//! response good enough to win, or until the candidates or attempt budget run
//! out.
//!
//! # State Machine
//!
//! ```text
//!  Selecting ──(best untried)──▶ Attempting(backend) ──(won)──▶ Succeeded
//!      ▲                                 │
//!      │                                 │ failed / below threshold
//!      └──────(backoff)────── Retrying ◀─┘
//!
//!  Selecting / Retrying ──(no candidate left or budget spent)──▶ Exhausted
//! ```
//!
//! Every attempt is appended to the performance ledger whatever its outcome.
//! The admission slot of an attempt is released before its outcome is
//! evaluated, so a finished task never holds capacity.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::admission::{AdmissionController, AdmissionError};
use super::config::{BackendConfig, DegradedPolicy, DispatchConfig, RetryConfig};
use super::ledger::{AttemptRecord, ErrorKind, PerformanceLedger};
use super::quality::QualityEvaluator;
use super::registry::BackendRegistry;
use super::selector::{SelectionError, Selector};
use crate::backend::{BackendResponse, InvokeOptions};
use crate::tasks::{Task, TaskId, TaskType};

// ============================================================================
// Options and Results
// ============================================================================

/// Per-call dispatch options
#[derive(Clone, Debug)]
pub struct ExecuteOptions {
    /// Maximum distinct backends tried
    pub max_attempts: usize,
    /// Time limit for one backend call
    pub per_attempt_timeout: Duration,
    /// Time limit for waiting on a slot
    pub admission_timeout: Duration,
    /// Minimum quality score for a response to win
    pub quality_threshold: f64,
    /// What to do when only below-threshold responses came back
    pub degraded_policy: DegradedPolicy,
    /// Backoff between attempts
    pub retry: RetryConfig,
    /// Aborts waits and calls when cancelled
    pub cancel: CancellationToken,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self::from(&DispatchConfig::default())
    }
}

impl From<&DispatchConfig> for ExecuteOptions {
    fn from(config: &DispatchConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            per_attempt_timeout: config.per_attempt_timeout,
            admission_timeout: config.admission_timeout,
            quality_threshold: config.quality_threshold,
            degraded_policy: config.degraded_policy,
            retry: config.retry.clone(),
            cancel: CancellationToken::new(),
        }
    }
}

impl ExecuteOptions {
    /// Set the attempt budget
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the per-call timeout
    #[must_use]
    pub fn with_per_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.per_attempt_timeout = timeout;
        self
    }

    /// Set the slot wait timeout
    #[must_use]
    pub fn with_admission_timeout(mut self, timeout: Duration) -> Self {
        self.admission_timeout = timeout;
        self
    }

    /// Set the quality threshold
    #[must_use]
    pub fn with_quality_threshold(mut self, threshold: f64) -> Self {
        self.quality_threshold = threshold;
        self
    }

    /// Set the degraded policy
    #[must_use]
    pub fn with_degraded_policy(mut self, policy: DegradedPolicy) -> Self {
        self.degraded_policy = policy;
        self
    }

    /// Use a caller-owned cancellation token
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Terminal outcome of one task
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    /// Task this result belongs to
    pub task_id: TaskId,
    /// Task type
    pub task_type: TaskType,
    /// Backend whose response was returned
    pub backend_name: Option<String>,
    /// Every attempt, in order
    pub attempts: Vec<AttemptRecord>,
    /// Whether a response is returned
    pub final_success: bool,
    /// The response fell below the quality threshold (best-effort policy)
    pub degraded: bool,
    /// Returned response text
    pub response: Option<String>,
    /// Quality score of the returned response
    pub quality_score: f64,
    /// Wall time from dispatch to outcome
    pub total_elapsed: Duration,
}

impl TaskResult {
    /// Backends tried, in order
    pub fn attempted_backends(&self) -> Vec<&str> {
        self.attempts
            .iter()
            .map(|a| a.backend_name.as_str())
            .collect()
    }

    /// Tokens spent across all attempts
    pub fn total_tokens(&self) -> u64 {
        self.attempts.iter().map(|a| a.tokens_used).sum()
    }

    /// Cost across all attempts
    pub fn total_cost(&self) -> f64 {
        self.attempts.iter().map(|a| a.cost).sum()
    }
}

/// Dispatch errors
///
/// Per-attempt failures never surface here; they are recovered by falling
/// back and show up in the attempt history instead.
#[derive(Clone, Debug, Error)]
pub enum DispatchError {
    /// No registered backend supports the task type
    #[error("no backend supports {task_type} tasks")]
    NoEligibleBackend {
        /// Task type that found no taker
        task_type: TaskType,
    },

    /// Every candidate was tried without a winner
    #[error("all {} attempt(s) failed for task {}", .result.attempts.len(), .result.task_id)]
    ExhaustedFallback {
        /// History of the failed attempts
        result: Box<TaskResult>,
    },

    /// The caller cancelled the task
    #[error("task {} was cancelled", .result.task_id)]
    Cancelled {
        /// History up to cancellation
        result: Box<TaskResult>,
    },

    /// The task's worker died
    #[error("internal dispatch failure: {0}")]
    Internal(String),
}

impl DispatchError {
    /// Attempt history, if the task got as far as attempting
    pub fn result(&self) -> Option<&TaskResult> {
        match self {
            Self::ExhaustedFallback { result } | Self::Cancelled { result } => Some(result.as_ref()),
            _ => None,
        }
    }
}

impl From<SelectionError> for DispatchError {
    fn from(e: SelectionError) -> Self {
        match e {
            SelectionError::NoEligibleBackend { task_type } => Self::NoEligibleBackend { task_type },
        }
    }
}

// ============================================================================
// State Machine
// ============================================================================

/// A scored response and the backend that produced it
struct Runner {
    backend: String,
    text: String,
    quality: f64,
}

/// What one attempt produced
enum AttemptOutcome {
    Won(Runner),
    BelowThreshold(Runner),
    Failed(ErrorKind),
}

enum DispatchState {
    Selecting,
    Attempting(BackendConfig),
    Retrying,
    Succeeded(Runner),
    Exhausted,
    Cancelled,
}

/// Mutable bookkeeping of one task's dispatch
struct Progress {
    attempted: HashSet<String>,
    attempts: Vec<AttemptRecord>,
    best_below_threshold: Option<Runner>,
    first_selection: bool,
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Runs tasks against the backend pool
#[derive(Clone)]
pub struct Dispatcher {
    selector: Selector,
    registry: Arc<BackendRegistry>,
    admission: Arc<AdmissionController>,
    ledger: Arc<PerformanceLedger>,
    evaluator: Arc<dyn QualityEvaluator>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("registry", &self.registry)
            .field("admission", &self.admission)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Create a dispatcher over shared state
    pub fn new(
        registry: Arc<BackendRegistry>,
        admission: Arc<AdmissionController>,
        ledger: Arc<PerformanceLedger>,
        evaluator: Arc<dyn QualityEvaluator>,
    ) -> Self {
        Self {
            selector: Selector::new(
                Arc::clone(&registry),
                Arc::clone(&admission),
                Arc::clone(&ledger),
            ),
            registry,
            admission,
            ledger,
            evaluator,
        }
    }

    /// Selector used to rank candidates
    pub fn selector(&self) -> &Selector {
        &self.selector
    }

    /// Run one task to a terminal outcome
    pub async fn execute(
        &self,
        task: &Task,
        options: &ExecuteOptions,
    ) -> Result<TaskResult, DispatchError> {
        let span = tracing::info_span!(
            "dispatch",
            task_id = %task.id,
            task_type = %task.task_type,
            complexity = ?task.complexity,
        );
        self.run(task, options).instrument(span).await
    }

    /// Run independent tasks concurrently; results keep input order
    pub async fn execute_all(
        &self,
        tasks: Vec<Task>,
        options: &ExecuteOptions,
    ) -> Vec<Result<TaskResult, DispatchError>> {
        let handles: Vec<_> = tasks
            .into_iter()
            .map(|task| {
                let dispatcher = self.clone();
                let options = options.clone();
                tokio::spawn(async move { dispatcher.execute(&task, &options).await })
            })
            .collect();

        futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|joined| joined.unwrap_or_else(|e| Err(DispatchError::Internal(e.to_string()))))
            .collect()
    }

    async fn run(&self, task: &Task, options: &ExecuteOptions) -> Result<TaskResult, DispatchError> {
        let started = Instant::now();
        let prompt = task.render_prompt();
        let mut progress = Progress {
            attempted: HashSet::new(),
            attempts: Vec::new(),
            best_below_threshold: None,
            first_selection: true,
        };

        let mut state = DispatchState::Selecting;
        loop {
            state = match state {
                DispatchState::Selecting => self.select_next(task, options, &mut progress)?,

                DispatchState::Attempting(config) => {
                    progress.attempted.insert(config.name.clone());
                    let (record, outcome) = self.attempt(task, &prompt, &config, options).await;
                    self.ledger.record(record.clone());
                    progress.attempts.push(record);

                    match outcome {
                        AttemptOutcome::Won(runner) => DispatchState::Succeeded(runner),
                        AttemptOutcome::Failed(ErrorKind::Cancelled) => DispatchState::Cancelled,
                        AttemptOutcome::Failed(kind) => {
                            tracing::warn!(backend = %config.name, error = %kind, "Attempt failed, falling back");
                            DispatchState::Retrying
                        }
                        AttemptOutcome::BelowThreshold(runner) => {
                            tracing::warn!(
                                backend = %config.name,
                                quality = runner.quality,
                                threshold = options.quality_threshold,
                                "Response below quality threshold, falling back"
                            );
                            let better = progress
                                .best_below_threshold
                                .as_ref()
                                .map_or(true, |best| runner.quality > best.quality);
                            if better {
                                progress.best_below_threshold = Some(runner);
                            }
                            DispatchState::Retrying
                        }
                    }
                }

                DispatchState::Retrying => {
                    if progress.attempts.len() >= options.max_attempts {
                        DispatchState::Exhausted
                    } else {
                        let failed = u32::try_from(progress.attempts.len().saturating_sub(1))
                            .unwrap_or(u32::MAX);
                        let backoff = options.retry.backoff_for_attempt(failed);
                        if backoff.is_zero() {
                            DispatchState::Selecting
                        } else {
                            tokio::select! {
                                biased;
                                () = options.cancel.cancelled() => DispatchState::Cancelled,
                                () = tokio::time::sleep(backoff) => DispatchState::Selecting,
                            }
                        }
                    }
                }

                DispatchState::Succeeded(winner) => {
                    tracing::info!(
                        backend = %winner.backend,
                        quality = winner.quality,
                        attempts = progress.attempts.len(),
                        "Task succeeded"
                    );
                    return Ok(finish(task, progress, Some(winner), false, started));
                }

                DispatchState::Exhausted => {
                    if options.degraded_policy == DegradedPolicy::BestEffort {
                        if let Some(best) = progress.best_below_threshold.take() {
                            tracing::warn!(
                                backend = %best.backend,
                                quality = best.quality,
                                "Returning best below-threshold response"
                            );
                            return Ok(finish(task, progress, Some(best), true, started));
                        }
                    }
                    tracing::warn!(attempts = progress.attempts.len(), "All candidates exhausted");
                    return Err(DispatchError::ExhaustedFallback {
                        result: Box::new(finish(task, progress, None, false, started)),
                    });
                }

                DispatchState::Cancelled => {
                    tracing::info!(attempts = progress.attempts.len(), "Task cancelled");
                    return Err(DispatchError::Cancelled {
                        result: Box::new(finish(task, progress, None, false, started)),
                    });
                }
            };
        }
    }

    /// Pick the best untried candidate
    fn select_next(
        &self,
        task: &Task,
        options: &ExecuteOptions,
        progress: &mut Progress,
    ) -> Result<DispatchState, DispatchError> {
        if options.cancel.is_cancelled() {
            return Ok(DispatchState::Cancelled);
        }

        // Eligibility is judged before the attempt budget, and only fails the
        // task before anything was tried
        let ranked = match self.selector.rank(task) {
            Ok(ranked) => ranked,
            Err(e) if progress.first_selection => return Err(e.into()),
            Err(_) => return Ok(DispatchState::Exhausted),
        };
        progress.first_selection = false;

        if progress.attempts.len() >= options.max_attempts {
            return Ok(DispatchState::Exhausted);
        }

        let mut untried: VecDeque<BackendConfig> = ranked
            .into_iter()
            .filter(|c| !progress.attempted.contains(&c.name))
            .collect();

        Ok(match untried.pop_front() {
            Some(config) => {
                tracing::debug!(backend = %config.name, attempt = progress.attempts.len() + 1, "Selected candidate");
                DispatchState::Attempting(config)
            }
            None => DispatchState::Exhausted,
        })
    }

    /// One attempt: wait for a slot, call the backend, score the response
    async fn attempt(
        &self,
        task: &Task,
        prompt: &str,
        config: &BackendConfig,
        options: &ExecuteOptions,
    ) -> (AttemptRecord, AttemptOutcome) {
        let started_at = Utc::now();
        let start = Instant::now();
        let fail = |kind: ErrorKind| {
            (
                AttemptRecord::failed(
                    task.id.clone(),
                    config.name.clone(),
                    task.task_type,
                    started_at,
                    start.elapsed(),
                    kind,
                ),
                AttemptOutcome::Failed(kind),
            )
        };

        let slot = match self
            .admission
            .acquire_cancellable(&config.name, options.admission_timeout, &options.cancel)
            .await
        {
            Ok(slot) => slot,
            Err(AdmissionError::Timeout { waited, .. }) => {
                tracing::debug!(backend = %config.name, ?waited, "No slot within admission timeout");
                return fail(ErrorKind::AdmissionTimeout);
            }
            Err(AdmissionError::Cancelled(_)) => return fail(ErrorKind::Cancelled),
            Err(AdmissionError::UnknownBackend(_)) => {
                tracing::warn!(backend = %config.name, "Backend has no admission gate");
                return fail(ErrorKind::Connection);
            }
        };

        let Some(backend) = self.registry.backend(&config.name) else {
            return fail(ErrorKind::Connection);
        };

        let invoke_options = InvokeOptions::from_config(config);
        let call_start = Instant::now();
        let call = tokio::time::timeout(
            options.per_attempt_timeout,
            backend.invoke(prompt, &invoke_options),
        );
        let result = tokio::select! {
            biased;
            () = options.cancel.cancelled() => None,
            result = call => Some(result),
        };
        let call_elapsed = call_start.elapsed();
        self.admission.release(slot);

        let response: BackendResponse = match result {
            None => return fail(ErrorKind::Cancelled),
            Some(Err(_)) => {
                tracing::debug!(backend = %config.name, timeout = ?options.per_attempt_timeout, "Backend call timed out");
                return fail(ErrorKind::Timeout);
            }
            Some(Ok(Err(e))) => {
                tracing::debug!(backend = %config.name, error = %e, "Backend call failed");
                return fail(ErrorKind::from(&e));
            }
            Some(Ok(Ok(response))) => response,
        };

        let quality = self
            .evaluator
            .evaluate(task.task_type, &response.text, call_elapsed);
        let won = quality >= options.quality_threshold;
        let record = AttemptRecord {
            task_id: task.id.clone(),
            backend_name: config.name.clone(),
            task_type: task.task_type,
            started_at,
            elapsed: start.elapsed(),
            success: won,
            quality_score: quality,
            tokens_used: response.tokens_used,
            cost: response
                .cost
                .unwrap_or_else(|| config.cost_for(response.tokens_used)),
            error_kind: (!won).then_some(ErrorKind::QualityBelowThreshold),
        };
        tracing::debug!(backend = %config.name, quality, tokens = response.tokens_used, "Backend responded");

        let runner = Runner {
            backend: config.name.clone(),
            text: response.text,
            quality,
        };
        let outcome = if won {
            AttemptOutcome::Won(runner)
        } else {
            AttemptOutcome::BelowThreshold(runner)
        };
        (record, outcome)
    }
}

fn finish(
    task: &Task,
    progress: Progress,
    returned: Option<Runner>,
    degraded: bool,
    started: Instant,
) -> TaskResult {
    let (backend_name, response, quality_score) = match returned {
        Some(r) => (Some(r.backend), Some(r.text), r.quality),
        None => (None, None, 0.0),
    };

    TaskResult {
        task_id: task.id.clone(),
        task_type: task.task_type,
        final_success: backend_name.is_some(),
        backend_name,
        attempts: progress.attempts,
        degraded,
        response,
        quality_score,
        total_elapsed: started.elapsed(),
    }
}
