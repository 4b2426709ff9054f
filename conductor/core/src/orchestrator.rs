//! Orchestrator - The Dispatch Context
//!
//! Owns the shared state every dispatch works against:
//! - Backend registry
//! - Admission controller
//! - Performance ledger
//! - Dispatch defaults and the quality evaluator
//!
//! There is no process-wide instance. Callers build an `Orchestrator`, register
//! backends on it and hand it (or clones of its [`Dispatcher`]) to whatever
//! drives the work. Several independent orchestrators can live in one process,
//! which is how the tests isolate scenarios.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::backend::ModelBackend;
use crate::config::ConductorConfig;
use crate::routing::{
    AdmissionController, AdmissionError, AdmissionStats, BackendConfig, BackendRegistry,
    BackendStats, DetailedReport, DispatchConfig, DispatchError, Dispatcher, ExecuteOptions,
    HeuristicEvaluator, PerformanceLedger, QualityEvaluator, Recommendation, RegistryError,
    Selector, TaskResult,
};
use crate::tasks::{Task, TaskType};

/// Shared dispatch state
#[derive(Clone)]
pub struct Orchestrator {
    dispatch: DispatchConfig,
    registry: Arc<BackendRegistry>,
    admission: Arc<AdmissionController>,
    ledger: Arc<PerformanceLedger>,
    evaluator: Arc<dyn QualityEvaluator>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("dispatch", &self.dispatch)
            .field("registry", &self.registry)
            .field("admission", &self.admission)
            .field("ledger", &self.ledger)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Create an orchestrator with no backends
    ///
    /// Only the dispatch and ledger sections of `config` are used; backends
    /// are added with [`Orchestrator::register_backend`].
    pub fn new(config: &ConductorConfig) -> Self {
        Self {
            dispatch: config.dispatch.clone(),
            registry: Arc::new(BackendRegistry::new()),
            admission: Arc::new(AdmissionController::new()),
            ledger: Arc::new(PerformanceLedger::new(config.ledger.clone())),
            evaluator: Arc::new(HeuristicEvaluator),
        }
    }

    /// Create an orchestrator and register every configured backend
    ///
    /// `connect` builds the capability for each catalog entry.
    pub fn from_config<F>(config: &ConductorConfig, mut connect: F) -> Result<Self, RegistryError>
    where
        F: FnMut(&BackendConfig) -> Arc<dyn ModelBackend>,
    {
        let orchestrator = Self::new(config);
        for backend in &config.backends {
            let capability = connect(backend);
            orchestrator.register_backend(backend.clone(), capability)?;
        }
        Ok(orchestrator)
    }

    /// Replace the quality evaluator
    #[must_use]
    pub fn with_evaluator(mut self, evaluator: Arc<dyn QualityEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    /// Add a backend to the pool
    pub fn register_backend(
        &self,
        config: BackendConfig,
        backend: Arc<dyn ModelBackend>,
    ) -> Result<(), RegistryError> {
        let name = config.name.clone();
        let limit = config.concurrency_limit;
        let tier = config.tier;

        self.registry.register(config, backend)?;
        self.admission.register(&name, limit);

        tracing::info!(backend = %name, %tier, limit, "Registered backend");
        Ok(())
    }

    /// Retune a backend's concurrency limit
    ///
    /// Tasks already holding slots keep them; a lower limit takes effect as
    /// they release.
    pub fn set_concurrency_limit(&self, name: &str, limit: usize) -> Result<(), RegistryError> {
        self.registry
            .update(name, |config| config.concurrency_limit = limit)?;
        self.admission.set_limit(name, limit).map_err(|e| match e {
            AdmissionError::UnknownBackend(missing) => RegistryError::UnknownBackend(missing),
            other => RegistryError::InvalidConfig {
                name: name.to_string(),
                reason: other.to_string(),
            },
        })
    }

    /// Dispatch defaults
    pub fn dispatch_config(&self) -> &DispatchConfig {
        &self.dispatch
    }

    /// Default options for [`Dispatcher::execute`]
    pub fn options(&self) -> ExecuteOptions {
        ExecuteOptions::from(&self.dispatch)
    }

    /// Backend catalog
    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    /// Admission gates
    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    /// Attempt history
    pub fn ledger(&self) -> &Arc<PerformanceLedger> {
        &self.ledger
    }

    /// Dispatcher over this orchestrator's state
    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.admission),
            Arc::clone(&self.ledger),
            Arc::clone(&self.evaluator),
        )
    }

    /// Selector over this orchestrator's state
    pub fn selector(&self) -> Selector {
        Selector::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.admission),
            Arc::clone(&self.ledger),
        )
    }

    /// Run one task with the configured defaults
    pub async fn execute(&self, task: &Task) -> Result<TaskResult, DispatchError> {
        self.execute_with(task, &self.options()).await
    }

    /// Run one task with explicit options
    pub async fn execute_with(
        &self,
        task: &Task,
        options: &ExecuteOptions,
    ) -> Result<TaskResult, DispatchError> {
        self.dispatcher().execute(task, options).await
    }

    /// Run independent tasks concurrently with the configured defaults
    pub async fn execute_all(&self, tasks: Vec<Task>) -> Vec<Result<TaskResult, DispatchError>> {
        self.execute_all_with(tasks, &self.options()).await
    }

    /// Run independent tasks concurrently with explicit options
    pub async fn execute_all_with(
        &self,
        tasks: Vec<Task>,
        options: &ExecuteOptions,
    ) -> Vec<Result<TaskResult, DispatchError>> {
        tracing::info!(tasks = tasks.len(), "Dispatching batch");
        self.dispatcher().execute_all(tasks, options).await
    }

    /// Windowed statistics per backend
    pub fn report(&self) -> BTreeMap<String, BackendStats> {
        self.ledger.report()
    }

    /// Statistics per backend since start, including evicted records
    pub fn lifetime_report(&self) -> BTreeMap<String, BackendStats> {
        self.ledger.lifetime_report()
    }

    /// Statistics broken down by task type
    pub fn detailed_report(&self) -> DetailedReport {
        self.ledger.detailed_report()
    }

    /// Backend names for a task type, best first
    pub fn recommend(&self, task_type: TaskType) -> Vec<String> {
        self.selector().recommend(task_type)
    }

    /// Efficiency-ranked recommendations per task type
    pub fn recommendations(&self) -> BTreeMap<TaskType, Vec<Recommendation>> {
        self.ledger
            .recommendations(self.ledger.config().min_samples_for_recommendation)
    }

    /// Ledger metrics in Prometheus text format
    pub fn to_prometheus(&self) -> String {
        self.ledger.to_prometheus()
    }

    /// Admission counters per backend
    pub fn admission_stats(&self) -> BTreeMap<String, AdmissionStats> {
        self.admission.all_stats()
    }
}
