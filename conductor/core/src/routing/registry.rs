//! Backend Registry
//!
//! Catalog of the model backends the dispatcher may route to. Each entry pairs
//! a [`BackendConfig`] with the capability object that serves it. Several
//! entries may share one capability (one Ollama server hosting many models).
//!
//! Reads hand out clones taken under a short read lock, so a selector ranking
//! candidates never holds the lock while it scores them.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;

use super::config::BackendConfig;
use crate::backend::ModelBackend;
use crate::tasks::TaskType;

/// Registry errors
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// A backend with this name is already registered
    #[error("backend '{0}' is already registered")]
    DuplicateBackend(String),

    /// No backend with this name
    #[error("unknown backend '{0}'")]
    UnknownBackend(String),

    /// The configuration is unusable
    #[error("invalid config for backend '{name}': {reason}")]
    InvalidConfig {
        /// Backend name
        name: String,
        /// What is wrong
        reason: String,
    },
}

struct RegistryEntry {
    config: BackendConfig,
    backend: Arc<dyn ModelBackend>,
}

/// Catalog of registered backends, keyed and ordered by name
#[derive(Default)]
pub struct BackendRegistry {
    entries: RwLock<BTreeMap<String, RegistryEntry>>,
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.names())
            .finish()
    }
}

/// Reject configurations the dispatcher cannot work with
pub fn validate_backend_config(config: &BackendConfig) -> Result<(), RegistryError> {
    let invalid = |reason: &str| RegistryError::InvalidConfig {
        name: config.name.clone(),
        reason: reason.to_string(),
    };

    if config.name.trim().is_empty() {
        return Err(invalid("name must not be empty"));
    }
    if config.concurrency_limit == 0 {
        return Err(invalid("concurrency_limit must be positive"));
    }
    if config.supported_task_types.is_empty() {
        return Err(invalid("at least one task type is required"));
    }
    if !config.cost_per_1k_tokens.is_finite() || config.cost_per_1k_tokens < 0.0 {
        return Err(invalid("cost_per_1k_tokens must be a non-negative number"));
    }
    Ok(())
}

impl BackendRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a backend
    pub fn register(
        &self,
        config: BackendConfig,
        backend: Arc<dyn ModelBackend>,
    ) -> Result<(), RegistryError> {
        validate_backend_config(&config)?;

        let mut entries = self.entries.write();
        if entries.contains_key(&config.name) {
            return Err(RegistryError::DuplicateBackend(config.name));
        }
        entries.insert(config.name.clone(), RegistryEntry { config, backend });
        Ok(())
    }

    /// Configuration of a backend
    pub fn get(&self, name: &str) -> Result<BackendConfig, RegistryError> {
        self.entries
            .read()
            .get(name)
            .map(|e| e.config.clone())
            .ok_or_else(|| RegistryError::UnknownBackend(name.to_string()))
    }

    /// Capability serving a backend
    pub fn backend(&self, name: &str) -> Option<Arc<dyn ModelBackend>> {
        self.entries.read().get(name).map(|e| Arc::clone(&e.backend))
    }

    /// Backends supporting `task_type`, ordered by name
    pub fn list_for_task_type(&self, task_type: TaskType) -> Vec<BackendConfig> {
        self.entries
            .read()
            .values()
            .filter(|e| e.config.supports(task_type))
            .map(|e| e.config.clone())
            .collect()
    }

    /// Every backend configuration, ordered by name
    pub fn configs(&self) -> Vec<BackendConfig> {
        self.entries
            .read()
            .values()
            .map(|e| e.config.clone())
            .collect()
    }

    /// Registered names, ordered
    pub fn names(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    /// Mutate a backend's configuration in place
    ///
    /// The name cannot change. If the mutated config fails validation the
    /// previous config is kept and the error returned.
    pub fn update<F>(&self, name: &str, f: F) -> Result<BackendConfig, RegistryError>
    where
        F: FnOnce(&mut BackendConfig),
    {
        let mut entries = self.entries.write();
        let entry = entries
            .get_mut(name)
            .ok_or_else(|| RegistryError::UnknownBackend(name.to_string()))?;

        let mut updated = entry.config.clone();
        f(&mut updated);
        updated.name = entry.config.name.clone();
        validate_backend_config(&updated)?;

        entry.config = updated.clone();
        Ok(updated)
    }

    /// Number of backends
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether no backend is registered
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
