//! Response Quality Evaluation
//!
//! Scores a backend response between 0.0 and 1.0. The dispatcher compares the
//! score with the configured threshold to decide whether a response wins or
//! the task falls back to the next candidate.

use std::time::Duration;

use crate::tasks::TaskType;

/// Scores responses
pub trait QualityEvaluator: Send + Sync {
    /// Score `response` to a task of `task_type` that took `elapsed`
    fn evaluate(&self, task_type: TaskType, response: &str, elapsed: Duration) -> f64;
}

/// Cheap structural heuristic
///
/// Base 0.5, plus up to 0.2 for length (full marks at 1000 chars), up to 0.1
/// for answering within 5 seconds, plus a task-specific factor. Empty
/// responses score 0.
#[derive(Clone, Copy, Debug, Default)]
pub struct HeuristicEvaluator;

const REVIEW_KEYWORDS: &[&str] = &[
    "security",
    "performance",
    "best practice",
    "improvement",
    "issue",
];
const PLANNING_KEYWORDS: &[&str] = &["architecture", "structure", "components", "database", "api"];
const TESTING_KEYWORDS: &[&str] = &["test", "assert", "expect", "coverage", "scenario"];
const DOCUMENTATION_KEYWORDS: &[&str] = &["usage", "example", "parameter", "return", "description"];
const CODE_KEYWORDS: &[&str] = &["function", "class", "import", "export"];

/// 0.1 per keyword present, capped at 0.3
fn keyword_factor(text: &str, keywords: &[&str]) -> f64 {
    let hits = keywords.iter().filter(|k| text.contains(*k)).count();
    (hits as f64 * 0.1).min(0.3)
}

/// Expects the lowercased response
fn coding_factor(lower: &str) -> f64 {
    let mut factor = 0.0;
    if lower.contains("```") {
        factor += 0.2;
    }
    if CODE_KEYWORDS.iter().any(|k| lower.contains(k)) {
        factor += 0.2;
    }
    if lower.contains("//") || lower.contains('#') {
        factor += 0.1;
    }
    factor
}

impl QualityEvaluator for HeuristicEvaluator {
    fn evaluate(&self, task_type: TaskType, response: &str, elapsed: Duration) -> f64 {
        if response.trim().is_empty() {
            return 0.0;
        }

        let length_factor = (response.chars().count() as f64 / 1000.0).min(1.0) * 0.2;
        let speed_factor = ((5.0 - elapsed.as_secs_f64()) / 5.0).max(0.0) * 0.1;

        let lower = response.to_lowercase();
        let task_factor = match task_type {
            TaskType::Coding => coding_factor(&lower),
            TaskType::Review => keyword_factor(&lower, REVIEW_KEYWORDS),
            TaskType::Planning => keyword_factor(&lower, PLANNING_KEYWORDS),
            TaskType::Testing => keyword_factor(&lower, TESTING_KEYWORDS),
            TaskType::Documentation => keyword_factor(&lower, DOCUMENTATION_KEYWORDS),
            TaskType::Debugging | TaskType::Deployment => 0.2,
        };

        (0.5 + length_factor + speed_factor + task_factor).clamp(0.0, 1.0)
    }
}

/// Gives every non-empty response the same score
#[derive(Clone, Copy, Debug)]
pub struct FixedEvaluator(pub f64);

impl QualityEvaluator for FixedEvaluator {
    fn evaluate(&self, _task_type: TaskType, response: &str, _elapsed: Duration) -> f64 {
        if response.trim().is_empty() {
            0.0
        } else {
            self.0.clamp(0.0, 1.0)
        }
    }
}
