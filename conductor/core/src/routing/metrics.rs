//! Attempt Metrics
//!
//! Lifetime counters and latency histograms per backend, fed by the
//! performance ledger on every recorded attempt. Unlike the ledger's rolling
//! window these never forget, which is what monitoring scrapes want.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use super::ledger::{AttemptRecord, ErrorKind};

/// Upper bounds of the latency buckets in milliseconds
///
/// Anything slower than the last bound lands in an overflow bucket reported
/// as the last bound.
pub const LATENCY_BOUNDS_MS: [u64; 12] = [
    100, 250, 500, 1_000, 2_500, 5_000, 10_000, 30_000, 60_000, 120_000, 300_000, 600_000,
];

/// Lock-free attempt latency distribution
#[derive(Debug, Default)]
pub struct LatencyHistogram {
    /// One slot per bound plus overflow
    buckets: [AtomicU64; LATENCY_BOUNDS_MS.len() + 1],
    samples: AtomicU64,
    total_ms: AtomicU64,
}

impl LatencyHistogram {
    /// Count one attempt duration
    pub fn observe(&self, elapsed: Duration) {
        let ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        let slot = LATENCY_BOUNDS_MS.partition_point(|&bound| bound < ms);

        self.buckets[slot].fetch_add(1, Ordering::Relaxed);
        self.samples.fetch_add(1, Ordering::Relaxed);
        self.total_ms.fetch_add(ms, Ordering::Relaxed);
    }

    /// Attempts observed
    pub fn samples(&self) -> u64 {
        self.samples.load(Ordering::Relaxed)
    }

    /// Mean duration in milliseconds
    pub fn mean_ms(&self) -> f64 {
        match self.samples() {
            0 => 0.0,
            n => self.total_ms.load(Ordering::Relaxed) as f64 / n as f64,
        }
    }

    /// Bucket bound at or below which a `q` share of the samples fall
    ///
    /// Returns 0 with no samples.
    pub fn quantile_ms(&self, q: f64) -> u64 {
        let samples = self.samples();
        if samples == 0 {
            return 0;
        }

        let rank = ((samples as f64 * q.clamp(0.0, 1.0)).ceil() as u64).max(1);
        let mut seen = 0;
        for (slot, bucket) in self.buckets.iter().enumerate() {
            seen += bucket.load(Ordering::Relaxed);
            if seen >= rank {
                return LATENCY_BOUNDS_MS[slot.min(LATENCY_BOUNDS_MS.len() - 1)];
            }
        }
        LATENCY_BOUNDS_MS[LATENCY_BOUNDS_MS.len() - 1]
    }
}

fn bump(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

fn read(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

// ============================================================================
// Per-Backend Metrics
// ============================================================================

/// Lifetime metrics for a single backend
#[derive(Debug, Default)]
pub struct BackendMetrics {
    backend: String,
    attempts: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    timeouts: AtomicU64,
    admission_timeouts: AtomicU64,
    below_threshold: AtomicU64,
    tokens: AtomicU64,
    /// Millionths of a currency unit
    cost_micros: AtomicU64,
    latency: LatencyHistogram,
}

impl BackendMetrics {
    /// Create empty metrics for a backend
    pub fn new(backend: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            ..Self::default()
        }
    }

    /// Fold one attempt into the counters
    pub fn observe(&self, record: &AttemptRecord) {
        bump(&self.attempts, 1);
        bump(
            if record.success {
                &self.successes
            } else {
                &self.failures
            },
            1,
        );

        match record.error_kind {
            Some(ErrorKind::Timeout) => bump(&self.timeouts, 1),
            Some(ErrorKind::AdmissionTimeout) => bump(&self.admission_timeouts, 1),
            Some(ErrorKind::QualityBelowThreshold) => bump(&self.below_threshold, 1),
            _ => {}
        }

        self.latency.observe(record.elapsed);
        bump(&self.tokens, record.tokens_used);
        bump(
            &self.cost_micros,
            (record.cost.max(0.0) * 1_000_000.0).round() as u64,
        );
    }

    /// Share of attempts that failed
    pub fn error_rate(&self) -> f64 {
        match read(&self.attempts) {
            0 => 0.0,
            n => read(&self.failures) as f64 / n as f64,
        }
    }

    /// Point-in-time copy of every counter
    pub fn summary(&self) -> BackendMetricsSummary {
        BackendMetricsSummary {
            backend: self.backend.clone(),
            attempts: read(&self.attempts),
            successes: read(&self.successes),
            failures: read(&self.failures),
            timeouts: read(&self.timeouts),
            admission_timeouts: read(&self.admission_timeouts),
            below_threshold: read(&self.below_threshold),
            error_rate: self.error_rate(),
            latency_mean_ms: self.latency.mean_ms(),
            latency_p50_ms: self.latency.quantile_ms(0.5) as f64,
            latency_p90_ms: self.latency.quantile_ms(0.9) as f64,
            latency_p99_ms: self.latency.quantile_ms(0.99) as f64,
            tokens: read(&self.tokens),
            total_cost: read(&self.cost_micros) as f64 / 1_000_000.0,
        }
    }
}

/// Summary of backend metrics
#[derive(Clone, Debug, PartialEq)]
#[allow(missing_docs)]
pub struct BackendMetricsSummary {
    pub backend: String,
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub admission_timeouts: u64,
    pub below_threshold: u64,
    pub error_rate: f64,
    pub latency_mean_ms: f64,
    pub latency_p50_ms: f64,
    pub latency_p90_ms: f64,
    pub latency_p99_ms: f64,
    pub tokens: u64,
    pub total_cost: f64,
}

/// Render backend summaries in the Prometheus text exposition format
///
/// Each metric family is written once with all backends grouped under it.
pub fn to_prometheus(summaries: &[BackendMetricsSummary]) -> String {
    use std::fmt::Write;

    type Field = fn(&BackendMetricsSummary) -> String;
    let families: [(&str, &str, &str, Field); 10] = [
        ("conductor_attempts_total", "counter", "Attempts per backend", |s| s.attempts.to_string()),
        ("conductor_successes_total", "counter", "Winning attempts", |s| s.successes.to_string()),
        ("conductor_failures_total", "counter", "Failed attempts", |s| s.failures.to_string()),
        ("conductor_timeouts_total", "counter", "Backend calls that timed out", |s| {
            s.timeouts.to_string()
        }),
        (
            "conductor_admission_timeouts_total",
            "counter",
            "Attempts that never got a slot",
            |s| s.admission_timeouts.to_string(),
        ),
        (
            "conductor_below_threshold_total",
            "counter",
            "Responses rejected for low quality",
            |s| s.below_threshold.to_string(),
        ),
        ("conductor_latency_p50_ms", "gauge", "Median attempt latency", |s| {
            s.latency_p50_ms.to_string()
        }),
        ("conductor_latency_p99_ms", "gauge", "p99 attempt latency", |s| {
            s.latency_p99_ms.to_string()
        }),
        ("conductor_tokens_total", "counter", "Tokens consumed", |s| s.tokens.to_string()),
        ("conductor_cost_total", "counter", "Accumulated cost", |s| s.total_cost.to_string()),
    ];

    let mut output = String::new();
    for (name, kind, help, field) in families {
        let _ = writeln!(output, "# HELP {name} {help}");
        let _ = writeln!(output, "# TYPE {name} {kind}");
        for summary in summaries {
            let _ = writeln!(output, "{name}{{backend=\"{}\"}} {}", summary.backend, field(summary));
        }
        output.push('\n');
    }
    output
}
