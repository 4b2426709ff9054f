//! Candidate Selection
//!
//! Ranks the backends eligible for a task into the order the dispatcher will
//! try them. The order is a deterministic total order:
//!
//! ```text
//! 1. Filter to backends supporting the task type
//! 2. Score tier affinity (exact = 2, adjacent = 1, distant = 0)
//! 3. Score rolling quality from the ledger (0.5 with no history)
//! 4. Score load from free admission slots (saturated = 0, still listed)
//! 5. Sort by (affinity, priority weight, quality, load) descending, name ascending
//! ```

use std::cmp::Ordering;
use std::sync::Arc;

use thiserror::Error;

use super::admission::AdmissionController;
use super::config::BackendConfig;
use super::ledger::PerformanceLedger;
use super::registry::BackendRegistry;
use crate::tasks::{Task, TaskType};

/// Quality assumed for a backend with no history on a task type
pub const NEUTRAL_QUALITY: f64 = 0.5;

/// Selection errors
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum SelectionError {
    /// No registered backend supports the task type
    #[error("no backend supports {task_type} tasks")]
    NoEligibleBackend {
        /// Task type that found no taker
        task_type: TaskType,
    },
}

/// A ranked backend with the scores that placed it
#[derive(Clone, Debug, PartialEq)]
pub struct Candidate {
    /// Backend configuration
    pub config: BackendConfig,
    /// 0..=2, higher fits the task complexity better
    pub tier_affinity: u8,
    /// Rolling average quality for the task type
    pub quality: f64,
    /// Share of free slots, 0 when saturated
    pub load: f64,
}

impl Candidate {
    fn by_task_key(&self, other: &Self) -> Ordering {
        other
            .tier_affinity
            .cmp(&self.tier_affinity)
            .then_with(|| other.config.priority_weight.cmp(&self.config.priority_weight))
            .then_with(|| other.quality.total_cmp(&self.quality))
            .then_with(|| other.load.total_cmp(&self.load))
            .then_with(|| self.config.name.cmp(&other.config.name))
    }

    fn by_type_key(&self, other: &Self) -> Ordering {
        other
            .quality
            .total_cmp(&self.quality)
            .then_with(|| other.config.priority_weight.cmp(&self.config.priority_weight))
            .then_with(|| other.load.total_cmp(&self.load))
            .then_with(|| self.config.name.cmp(&other.config.name))
    }
}

/// Ranks eligible backends for tasks
#[derive(Clone, Debug)]
pub struct Selector {
    registry: Arc<BackendRegistry>,
    admission: Arc<AdmissionController>,
    ledger: Arc<PerformanceLedger>,
}

impl Selector {
    /// Create a selector over shared state
    pub fn new(
        registry: Arc<BackendRegistry>,
        admission: Arc<AdmissionController>,
        ledger: Arc<PerformanceLedger>,
    ) -> Self {
        Self {
            registry,
            admission,
            ledger,
        }
    }

    fn score(&self, config: BackendConfig, task_type: TaskType, tier_affinity: u8) -> Candidate {
        let stats = self.ledger.stats(&config.name, task_type);
        let quality = if stats.count == 0 {
            NEUTRAL_QUALITY
        } else {
            stats.avg_quality
        };

        let load = match self.admission.probe(&config.name) {
            Some(free) if config.concurrency_limit > 0 => {
                (free as f64 / config.concurrency_limit as f64).min(1.0)
            }
            _ => 0.0,
        };

        Candidate {
            config,
            tier_affinity,
            quality,
            load,
        }
    }

    /// Ranked candidates with their scores
    pub fn rank_scored(&self, task: &Task) -> Result<Vec<Candidate>, SelectionError> {
        let preferred = task.complexity.preferred_tier();
        let mut candidates: Vec<Candidate> = self
            .registry
            .list_for_task_type(task.task_type)
            .into_iter()
            .map(|config| {
                let affinity = config.tier.affinity_to(preferred);
                self.score(config, task.task_type, affinity)
            })
            .collect();

        if candidates.is_empty() {
            return Err(SelectionError::NoEligibleBackend {
                task_type: task.task_type,
            });
        }

        candidates.sort_by(Candidate::by_task_key);
        Ok(candidates)
    }

    /// Backends to try for `task`, best first
    pub fn rank(&self, task: &Task) -> Result<Vec<BackendConfig>, SelectionError> {
        Ok(self
            .rank_scored(task)?
            .into_iter()
            .map(|c| c.config)
            .collect())
    }

    /// Best backends for a task type when complexity is unknown
    ///
    /// Ordered by (quality, priority weight, load) descending, name ascending.
    pub fn recommend(&self, task_type: TaskType) -> Vec<String> {
        let mut candidates: Vec<Candidate> = self
            .registry
            .list_for_task_type(task_type)
            .into_iter()
            .map(|config| self.score(config, task_type, 0))
            .collect();

        candidates.sort_by(Candidate::by_type_key);
        candidates.into_iter().map(|c| c.config.name).collect()
    }
}
