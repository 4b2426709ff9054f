//! Performance Ledger
//!
//! Append-only record of every attempt the dispatcher makes. The ledger keeps
//! a bounded window of raw records per (backend, task type) for rolling
//! statistics, and folds whatever leaves the window into a per-backend
//! lifetime aggregate so nothing is silently lost.
//!
//! # Reads
//!
//! - [`PerformanceLedger::stats`]: rolling stats for one (backend, task type)
//! - [`PerformanceLedger::report`]: rolling stats per backend
//! - [`PerformanceLedger::lifetime_report`]: all-time stats per backend
//! - [`PerformanceLedger::detailed_report`]: per backend, per task type,
//!   overall totals and latency percentiles
//! - [`PerformanceLedger::recommendations`]: most efficient backends per task type
//! - [`PerformanceLedger::to_prometheus`]: lifetime metrics for scraping

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::config::LedgerConfig;
use super::metrics::{self, BackendMetrics, BackendMetricsSummary};
use crate::backend::BackendError;
use crate::tasks::{TaskId, TaskType};

// ============================================================================
// Attempt Records
// ============================================================================

/// Why an attempt failed
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// No slot freed up within the admission timeout
    AdmissionTimeout,
    /// The backend call exceeded the per-attempt timeout
    Timeout,
    /// The backend could not be reached
    Connection,
    /// The backend answered with something unusable
    InvalidResponse,
    /// The backend refused because of rate limits
    RateLimited,
    /// A response arrived but scored below the quality threshold
    QualityBelowThreshold,
    /// The caller cancelled the task mid-attempt
    Cancelled,
}

impl ErrorKind {
    /// Canonical snake_case name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AdmissionTimeout => "admission_timeout",
            Self::Timeout => "timeout",
            Self::Connection => "connection",
            Self::InvalidResponse => "invalid_response",
            Self::RateLimited => "rate_limited",
            Self::QualityBelowThreshold => "quality_below_threshold",
            Self::Cancelled => "cancelled",
        }
    }
}

impl From<&BackendError> for ErrorKind {
    fn from(error: &BackendError) -> Self {
        match error {
            BackendError::Timeout(_) => Self::Timeout,
            BackendError::Connection(_) => Self::Connection,
            BackendError::InvalidResponse(_) => Self::InvalidResponse,
            BackendError::RateLimited { .. } => Self::RateLimited,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one attempt of one task on one backend
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// Task the attempt belongs to
    pub task_id: TaskId,
    /// Backend tried
    pub backend_name: String,
    /// Task type (denormalized for per-type stats)
    pub task_type: TaskType,
    /// Wall-clock start of the attempt
    pub started_at: DateTime<Utc>,
    /// Time from admission request to outcome
    pub elapsed: Duration,
    /// Whether this attempt produced the winning response
    pub success: bool,
    /// Quality score of the response (0 when there was none)
    pub quality_score: f64,
    /// Tokens consumed
    pub tokens_used: u64,
    /// Cost of the call
    pub cost: f64,
    /// Failure reason, if the attempt failed
    pub error_kind: Option<ErrorKind>,
}

impl AttemptRecord {
    /// A failed attempt with no response
    pub fn failed(
        task_id: TaskId,
        backend_name: impl Into<String>,
        task_type: TaskType,
        started_at: DateTime<Utc>,
        elapsed: Duration,
        error_kind: ErrorKind,
    ) -> Self {
        Self {
            task_id,
            backend_name: backend_name.into(),
            task_type,
            started_at,
            elapsed,
            success: false,
            quality_score: 0.0,
            tokens_used: 0,
            cost: 0.0,
            error_kind: Some(error_kind),
        }
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Aggregate statistics over a set of attempts
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendStats {
    /// Number of attempts
    pub count: u64,
    /// Share of attempts that succeeded
    pub success_rate: f64,
    /// Mean attempt latency
    pub avg_latency: Duration,
    /// Mean quality score (failed attempts count as 0)
    pub avg_quality: f64,
    /// Summed cost
    pub total_cost: f64,
    /// Summed tokens
    pub total_tokens: u64,
}

/// Running sums that can absorb records and other aggregates
#[derive(Clone, Debug, Default)]
struct Aggregate {
    count: u64,
    successes: u64,
    latency: Duration,
    quality: f64,
    cost: f64,
    tokens: u64,
}

impl Aggregate {
    fn add(&mut self, record: &AttemptRecord) {
        self.count += 1;
        self.successes += u64::from(record.success);
        self.latency += record.elapsed;
        self.quality += record.quality_score;
        self.cost += record.cost;
        self.tokens += record.tokens_used;
    }

    fn merge(&mut self, other: &Aggregate) {
        self.count += other.count;
        self.successes += other.successes;
        self.latency += other.latency;
        self.quality += other.quality;
        self.cost += other.cost;
        self.tokens += other.tokens;
    }

    fn stats(&self) -> BackendStats {
        if self.count == 0 {
            return BackendStats::default();
        }
        let n = self.count as f64;
        BackendStats {
            count: self.count,
            success_rate: self.successes as f64 / n,
            avg_latency: self.latency.div_f64(n),
            avg_quality: self.quality / n,
            total_cost: self.cost,
            total_tokens: self.tokens,
        }
    }
}

/// One recommended backend for a task type
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    /// Backend name
    pub backend: String,
    /// avg_quality / max(avg_latency_secs, 0.1)
    pub efficiency: f64,
    /// Rolling mean quality
    pub avg_quality: f64,
    /// Rolling mean latency in seconds
    pub avg_latency_secs: f64,
    /// Windowed attempts behind the numbers
    pub samples: u64,
}

/// Latency percentiles of one backend (lifetime, milliseconds)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LatencyPercentiles {
    /// Median
    pub p50_ms: f64,
    /// 90th percentile
    pub p90_ms: f64,
    /// 99th percentile
    pub p99_ms: f64,
}

/// Full breakdown of the rolling window
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DetailedReport {
    /// Per backend across task types
    pub by_backend: BTreeMap<String, BackendStats>,
    /// Per task type across backends
    pub by_task_type: BTreeMap<TaskType, BackendStats>,
    /// Per backend and task type
    pub by_backend_and_task_type: BTreeMap<String, BTreeMap<TaskType, BackendStats>>,
    /// Everything in the window
    pub overall: BackendStats,
    /// Lifetime latency percentiles per backend
    pub latency: BTreeMap<String, LatencyPercentiles>,
}

// ============================================================================
// Ledger
// ============================================================================

#[derive(Default)]
struct LedgerState {
    windows: HashMap<(String, TaskType), VecDeque<AttemptRecord>>,
    evicted: HashMap<String, Aggregate>,
}

impl LedgerState {
    fn evict_stale(&mut self, config: &LedgerConfig, now: DateTime<Utc>) {
        let Some(max_age) = config
            .window_max_age
            .and_then(|age| chrono::Duration::from_std(age).ok())
        else {
            return;
        };
        let cutoff = now - max_age;

        for ((backend, _), window) in &mut self.windows {
            while window.front().is_some_and(|r| r.started_at < cutoff) {
                if let Some(record) = window.pop_front() {
                    self.evicted.entry(backend.clone()).or_default().add(&record);
                }
            }
        }
    }
}

/// Thread-safe, append-only attempt ledger
pub struct PerformanceLedger {
    config: LedgerConfig,
    state: Mutex<LedgerState>,
    metrics: DashMap<String, Arc<BackendMetrics>>,
}

impl std::fmt::Debug for PerformanceLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerformanceLedger")
            .field("config", &self.config)
            .field("backends", &self.metrics.len())
            .finish()
    }
}

impl Default for PerformanceLedger {
    fn default() -> Self {
        Self::new(LedgerConfig::default())
    }
}

impl PerformanceLedger {
    /// Create an empty ledger
    pub fn new(config: LedgerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(LedgerState::default()),
            metrics: DashMap::new(),
        }
    }

    /// Retention settings
    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Append an attempt
    pub fn record(&self, record: AttemptRecord) {
        self.metrics
            .entry(record.backend_name.clone())
            .or_insert_with(|| Arc::new(BackendMetrics::new(record.backend_name.clone())))
            .observe(&record);

        let window_size = self.config.window_size.max(1);
        let mut state = self.state.lock();
        let LedgerState { windows, evicted } = &mut *state;

        let window = windows
            .entry((record.backend_name.clone(), record.task_type))
            .or_default();
        window.push_back(record);

        while window.len() > window_size {
            if let Some(old) = window.pop_front() {
                evicted.entry(old.backend_name.clone()).or_default().add(&old);
            }
        }
    }

    /// Run `f` over the window after dropping stale records
    fn with_window<R>(&self, f: impl FnOnce(&LedgerState) -> R) -> R {
        let mut state = self.state.lock();
        state.evict_stale(&self.config, Utc::now());
        f(&state)
    }

    /// Rolling stats for one backend on one task type
    pub fn stats(&self, backend: &str, task_type: TaskType) -> BackendStats {
        self.with_window(|state| {
            let mut agg = Aggregate::default();
            if let Some(window) = state.windows.get(&(backend.to_string(), task_type)) {
                window.iter().for_each(|r| agg.add(r));
            }
            agg.stats()
        })
    }

    /// Rolling stats per backend across task types
    pub fn report(&self) -> BTreeMap<String, BackendStats> {
        self.with_window(|state| {
            window_by_backend(state)
                .into_iter()
                .map(|(backend, agg)| (backend, agg.stats()))
                .collect()
        })
    }

    /// All-time stats per backend: evicted aggregate plus the current window
    pub fn lifetime_report(&self) -> BTreeMap<String, BackendStats> {
        self.with_window(|state| {
            let mut totals = window_by_backend(state);
            for (backend, agg) in &state.evicted {
                totals.entry(backend.clone()).or_default().merge(agg);
            }
            totals
                .into_iter()
                .map(|(backend, agg)| (backend, agg.stats()))
                .collect()
        })
    }

    /// Per backend, per task type and overall stats with latency percentiles
    pub fn detailed_report(&self) -> DetailedReport {
        let mut report = self.with_window(|state| {
            let mut by_task_type: BTreeMap<TaskType, Aggregate> = BTreeMap::new();
            let mut by_pair: BTreeMap<String, BTreeMap<TaskType, Aggregate>> = BTreeMap::new();
            let mut overall = Aggregate::default();

            for ((backend, task_type), window) in &state.windows {
                if window.is_empty() {
                    continue;
                }
                let mut agg = Aggregate::default();
                window.iter().for_each(|r| agg.add(r));

                by_task_type.entry(*task_type).or_default().merge(&agg);
                overall.merge(&agg);
                by_pair
                    .entry(backend.clone())
                    .or_default()
                    .insert(*task_type, agg);
            }

            DetailedReport {
                by_backend: window_by_backend(state)
                    .into_iter()
                    .map(|(b, agg)| (b, agg.stats()))
                    .collect(),
                by_task_type: by_task_type
                    .into_iter()
                    .map(|(t, agg)| (t, agg.stats()))
                    .collect(),
                by_backend_and_task_type: by_pair
                    .into_iter()
                    .map(|(b, types)| {
                        (b, types.into_iter().map(|(t, agg)| (t, agg.stats())).collect())
                    })
                    .collect(),
                overall: overall.stats(),
                latency: BTreeMap::new(),
            }
        });

        report.latency = self
            .metrics_summaries()
            .into_iter()
            .map(|s| {
                (
                    s.backend,
                    LatencyPercentiles {
                        p50_ms: s.latency_p50_ms,
                        p90_ms: s.latency_p90_ms,
                        p99_ms: s.latency_p99_ms,
                    },
                )
            })
            .collect();
        report
    }

    /// Up to three most efficient backends per task type
    ///
    /// Only (backend, task type) pairs with at least `min_samples` windowed
    /// attempts qualify. Efficiency is `avg_quality / max(avg_latency_secs, 0.1)`.
    pub fn recommendations(&self, min_samples: u64) -> BTreeMap<TaskType, Vec<Recommendation>> {
        let mut out: BTreeMap<TaskType, Vec<Recommendation>> = BTreeMap::new();

        self.with_window(|state| {
            for ((backend, task_type), window) in &state.windows {
                let mut agg = Aggregate::default();
                window.iter().for_each(|r| agg.add(r));
                if agg.count == 0 || agg.count < min_samples {
                    continue;
                }

                let stats = agg.stats();
                let latency_secs = stats.avg_latency.as_secs_f64();
                out.entry(*task_type).or_default().push(Recommendation {
                    backend: backend.clone(),
                    efficiency: stats.avg_quality / latency_secs.max(0.1),
                    avg_quality: stats.avg_quality,
                    avg_latency_secs: latency_secs,
                    samples: stats.count,
                });
            }
        });

        for recs in out.values_mut() {
            recs.sort_by(|a, b| {
                b.efficiency
                    .total_cmp(&a.efficiency)
                    .then_with(|| a.backend.cmp(&b.backend))
            });
            recs.truncate(3);
        }
        out
    }

    /// Raw windowed records of one task, oldest first
    pub fn records_for(&self, task_id: &TaskId) -> Vec<AttemptRecord> {
        let mut records: Vec<AttemptRecord> = self.with_window(|state| {
            state
                .windows
                .values()
                .flatten()
                .filter(|r| &r.task_id == task_id)
                .cloned()
                .collect()
        });
        records.sort_by_key(|r| r.started_at);
        records
    }

    /// Lifetime counters of one backend
    pub fn metrics(&self, backend: &str) -> Option<BackendMetricsSummary> {
        self.metrics.get(backend).map(|m| m.summary())
    }

    fn metrics_summaries(&self) -> Vec<BackendMetricsSummary> {
        let mut summaries: Vec<_> = self.metrics.iter().map(|m| m.summary()).collect();
        summaries.sort_by(|a, b| a.backend.cmp(&b.backend));
        summaries
    }

    /// Export lifetime metrics in Prometheus text format
    pub fn to_prometheus(&self) -> String {
        metrics::to_prometheus(&self.metrics_summaries())
    }
}

fn window_by_backend(state: &LedgerState) -> BTreeMap<String, Aggregate> {
    let mut totals: BTreeMap<String, Aggregate> = BTreeMap::new();
    for ((backend, _), window) in &state.windows {
        if window.is_empty() {
            continue;
        }
        let agg = totals.entry(backend.clone()).or_default();
        window.iter().for_each(|r| agg.add(r));
    }
    totals
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn attempt(backend: &str, task_type: TaskType, success: bool, quality: f64, ms: u64) -> AttemptRecord {
        AttemptRecord {
            task_id: TaskId::generate(),
            backend_name: backend.to_string(),
            task_type,
            started_at: Utc::now(),
            elapsed: Duration::from_millis(ms),
            success,
            quality_score: quality,
            tokens_used: 100,
            cost: 0.5,
            error_kind: (!success).then_some(ErrorKind::Connection),
        }
    }

    #[test]
    fn test_stats_and_report() {
        let ledger = PerformanceLedger::default();
        ledger.record(attempt("a", TaskType::Coding, true, 0.8, 1000));
        ledger.record(attempt("a", TaskType::Coding, false, 0.0, 3000));
        ledger.record(attempt("a", TaskType::Review, true, 0.6, 2000));

        let coding = ledger.stats("a", TaskType::Coding);
        assert_eq!(coding.count, 2);
        assert!((coding.success_rate - 0.5).abs() < 1e-9);
        assert!((coding.avg_quality - 0.4).abs() < 1e-9);
        assert_eq!(coding.avg_latency, Duration::from_millis(2000));
        assert_eq!(coding.total_tokens, 200);

        let report = ledger.report();
        assert_eq!(report["a"].count, 3);
        assert!((report["a"].total_cost - 1.5).abs() < 1e-9);

        assert_eq!(ledger.stats("b", TaskType::Coding), BackendStats::default());
    }

    #[test]
    fn test_window_eviction_folds_into_lifetime() {
        let ledger = PerformanceLedger::new(LedgerConfig {
            window_size: 2,
            window_max_age: None,
            min_samples_for_recommendation: 1,
        });
        for _ in 0..5 {
            ledger.record(attempt("a", TaskType::Coding, true, 1.0, 100));
        }

        assert_eq!(ledger.report()["a"].count, 2);
        assert_eq!(ledger.lifetime_report()["a"].count, 5);
        assert_eq!(ledger.metrics("a").unwrap().attempts, 5);
    }

    #[test]
    fn test_stale_records_leave_the_window() {
        let ledger = PerformanceLedger::new(LedgerConfig {
            window_size: 10,
            window_max_age: Some(Duration::from_secs(60)),
            min_samples_for_recommendation: 1,
        });
        let mut old = attempt("a", TaskType::Testing, true, 0.9, 100);
        old.started_at = Utc::now() - chrono::Duration::minutes(5);
        ledger.record(old);
        ledger.record(attempt("a", TaskType::Testing, true, 0.7, 100));

        assert_eq!(ledger.stats("a", TaskType::Testing).count, 1);
        assert_eq!(ledger.lifetime_report()["a"].count, 2);
    }

    #[test]
    fn test_recommendations() {
        let ledger = PerformanceLedger::default();
        for _ in 0..3 {
            ledger.record(attempt("slow", TaskType::Coding, true, 0.9, 9000));
            ledger.record(attempt("fast", TaskType::Coding, true, 0.8, 1000));
        }
        ledger.record(attempt("rare", TaskType::Coding, true, 1.0, 10));

        let recs = ledger.recommendations(3);
        let names: Vec<_> = recs[&TaskType::Coding].iter().map(|r| r.backend.as_str()).collect();
        assert_eq!(names, vec!["fast", "slow"]);
        assert!((recs[&TaskType::Coding][0].efficiency - 0.8).abs() < 1e-9);
        assert!(!recs.contains_key(&TaskType::Review));
    }

    #[test]
    fn test_records_for_task() {
        let ledger = PerformanceLedger::default();
        let mut first = attempt("a", TaskType::Coding, false, 0.0, 10);
        let task_id = first.task_id.clone();
        first.started_at = Utc::now() - chrono::Duration::seconds(1);
        let mut second = attempt("b", TaskType::Coding, true, 0.9, 10);
        second.task_id = task_id.clone();

        ledger.record(second);
        ledger.record(first);
        ledger.record(attempt("a", TaskType::Coding, true, 0.9, 10));

        let records = ledger.records_for(&task_id);
        let backends: Vec<_> = records.iter().map(|r| r.backend_name.as_str()).collect();
        assert_eq!(backends, vec!["a", "b"]);
    }

    #[test]
    fn test_detailed_report_and_prometheus() {
        let ledger = PerformanceLedger::default();
        ledger.record(attempt("a", TaskType::Coding, true, 0.8, 1000));
        ledger.record(attempt("b", TaskType::Planning, true, 0.6, 200));

        let report = ledger.detailed_report();
        assert_eq!(report.overall.count, 2);
        assert_eq!(report.by_task_type[&TaskType::Planning].count, 1);
        assert_eq!(report.by_backend_and_task_type["a"][&TaskType::Coding].count, 1);
        assert_eq!(report.latency["a"].p50_ms, 1000.0);

        let text = ledger.to_prometheus();
        assert!(text.contains("conductor_attempts_total{backend=\"a\"} 1"));
        assert!(text.contains("conductor_attempts_total{backend=\"b\"} 1"));
    }
}
