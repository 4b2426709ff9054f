//! Admission Control
//!
//! Per-backend concurrency gates. Every backend gets a counting semaphore
//! sized at its `concurrency_limit`; a task must hold an [`AdmissionSlot`]
//! while it talks to the backend.
//!
//! # Design
//!
//! Slots are RAII guards around an owned semaphore permit, so the slot goes
//! back exactly once whichever way the holder exits: success, error, timeout,
//! cancellation or panic unwinding.
//!
//! Limits can be retuned at runtime. Growing adds permits. Shrinking forgets
//! as many free permits as it can and records the rest as owed; released
//! permits pay the debt off instead of returning to the semaphore. No new slot
//! is granted while `active >= limit`.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

// ============================================================================
// Admission Types
// ============================================================================

/// Snapshot of one backend's gate
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AdmissionStats {
    /// Configured concurrency limit
    pub limit: usize,
    /// Slots currently held
    pub active: usize,
    /// Highest `active` ever observed
    pub peak_active: usize,
    /// Slots granted since registration
    pub total_acquired: u64,
    /// Acquisitions that gave up waiting
    pub total_timeouts: u64,
    /// Tasks currently waiting for a slot
    pub waiting: usize,
}

/// Admission errors
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum AdmissionError {
    /// No gate exists for this backend
    #[error("unknown backend '{0}'")]
    UnknownBackend(String),

    /// No slot freed up in time
    #[error("timed out after {waited:?} waiting for a slot on '{backend}'")]
    Timeout {
        /// Backend name
        backend: String,
        /// How long the caller waited
        waited: Duration,
    },

    /// The caller cancelled while waiting
    #[error("cancelled while waiting for a slot on '{0}'")]
    Cancelled(String),
}

/// Atomic statistics for lock-free updates
#[derive(Default)]
struct GateStatsAtomic {
    active: AtomicUsize,
    peak_active: AtomicUsize,
    total_acquired: AtomicU64,
    total_timeouts: AtomicU64,
    waiting: AtomicUsize,
}

// ============================================================================
// Backend Gate
// ============================================================================

/// Concurrency gate for a single backend
struct BackendGate {
    backend: String,
    semaphore: Arc<Semaphore>,
    limit: AtomicUsize,
    /// Permits to retire as slots come back after a shrink
    owed: AtomicUsize,
    /// Serializes limit changes
    resize: Mutex<()>,
    stats: GateStatsAtomic,
}

impl BackendGate {
    fn new(backend: &str, limit: usize) -> Self {
        Self {
            backend: backend.to_string(),
            semaphore: Arc::new(Semaphore::new(limit)),
            limit: AtomicUsize::new(limit),
            owed: AtomicUsize::new(0),
            resize: Mutex::new(()),
            stats: GateStatsAtomic::default(),
        }
    }

    fn snapshot(&self) -> AdmissionStats {
        AdmissionStats {
            limit: self.limit.load(Ordering::SeqCst),
            active: self.stats.active.load(Ordering::SeqCst),
            peak_active: self.stats.peak_active.load(Ordering::SeqCst),
            total_acquired: self.stats.total_acquired.load(Ordering::Relaxed),
            total_timeouts: self.stats.total_timeouts.load(Ordering::Relaxed),
            waiting: self.stats.waiting.load(Ordering::SeqCst),
        }
    }

    fn grant(self: &Arc<Self>, permit: OwnedSemaphorePermit) -> AdmissionSlot {
        let active = self.stats.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.peak_active.fetch_max(active, Ordering::SeqCst);
        self.stats.total_acquired.fetch_add(1, Ordering::Relaxed);

        AdmissionSlot {
            gate: Arc::clone(self),
            permit: Some(permit),
            acquired_at: Instant::now(),
        }
    }

    fn set_limit(&self, new_limit: usize) {
        let _resize = self.resize.lock();
        let old_limit = self.limit.swap(new_limit, Ordering::SeqCst);

        if new_limit > old_limit {
            // Cancel outstanding debt before minting new permits
            let mut grow = new_limit - old_limit;
            while grow > 0 {
                let owed = self.owed.load(Ordering::SeqCst);
                if owed == 0 {
                    break;
                }
                let pay = owed.min(grow);
                if self
                    .owed
                    .compare_exchange(owed, owed - pay, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    grow -= pay;
                }
            }
            self.semaphore.add_permits(grow);
        } else if new_limit < old_limit {
            let shrink = old_limit - new_limit;
            let forgotten = self.semaphore.forget_permits(shrink);
            self.owed.fetch_add(shrink - forgotten, Ordering::SeqCst);
        }
    }

    fn release(&self, permit: OwnedSemaphorePermit) {
        // Shrinks count free permits, so a permit must not come back mid-resize
        let _resize = self.resize.lock();
        self.stats.active.fetch_sub(1, Ordering::SeqCst);

        let mut owed = self.owed.load(Ordering::SeqCst);
        while owed > 0 {
            match self
                .owed
                .compare_exchange(owed, owed - 1, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => {
                    permit.forget();
                    return;
                }
                Err(actual) => owed = actual,
            }
        }
        drop(permit);
    }
}

/// Decrements the waiting gauge when the wait ends, however it ends
struct WaitingGuard<'a>(&'a AtomicUsize);

impl<'a> WaitingGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Admission Slot
// ============================================================================

/// The right to run one task on a backend (RAII guard)
pub struct AdmissionSlot {
    gate: Arc<BackendGate>,
    permit: Option<OwnedSemaphorePermit>,
    acquired_at: Instant,
}

impl AdmissionSlot {
    /// Backend this slot belongs to
    pub fn backend(&self) -> &str {
        &self.gate.backend
    }

    /// How long the slot has been held
    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }
}

impl std::fmt::Debug for AdmissionSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionSlot")
            .field("backend", &self.gate.backend)
            .field("held_for", &self.held_for())
            .finish()
    }
}

impl Drop for AdmissionSlot {
    fn drop(&mut self) {
        if let Some(permit) = self.permit.take() {
            self.gate.release(permit);
        }
    }
}

// ============================================================================
// Admission Controller
// ============================================================================

/// Concurrency gates for all backends
#[derive(Default)]
pub struct AdmissionController {
    gates: DashMap<String, Arc<BackendGate>>,
}

impl std::fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionController")
            .field("gates", &self.gates.len())
            .finish()
    }
}

impl AdmissionController {
    /// Create a controller with no gates
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the gate for a backend, or retune it if it already exists
    pub fn register(&self, backend: &str, limit: usize) {
        if let Some(gate) = self.gate(backend) {
            gate.set_limit(limit);
            return;
        }
        self.gates
            .entry(backend.to_string())
            .or_insert_with(|| Arc::new(BackendGate::new(backend, limit)));
    }

    /// Clone the gate out so no map shard stays locked across an await
    fn gate(&self, backend: &str) -> Option<Arc<BackendGate>> {
        self.gates.get(backend).map(|g| Arc::clone(g.value()))
    }

    /// Take a slot if one is free right now
    pub fn try_acquire(&self, backend: &str) -> Option<AdmissionSlot> {
        let gate = self.gate(backend)?;
        let permit = Arc::clone(&gate.semaphore).try_acquire_owned().ok()?;
        Some(gate.grant(permit))
    }

    /// Free slots right now, probed without counting as an acquisition
    ///
    /// Returns `None` for unknown backends and `Some(0)` when saturated.
    pub fn probe(&self, backend: &str) -> Option<usize> {
        let gate = self.gate(backend)?;
        let free = match gate.semaphore.try_acquire() {
            Ok(_permit) => gate.semaphore.available_permits() + 1,
            Err(_) => 0,
        };
        Some(free)
    }

    /// Wait up to `timeout` for a slot
    pub async fn acquire(
        &self,
        backend: &str,
        timeout: Duration,
    ) -> Result<AdmissionSlot, AdmissionError> {
        self.acquire_cancellable(backend, timeout, &CancellationToken::new())
            .await
    }

    /// Wait up to `timeout` for a slot, giving up early if `cancel` fires
    pub async fn acquire_cancellable(
        &self,
        backend: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<AdmissionSlot, AdmissionError> {
        let gate = self
            .gate(backend)
            .ok_or_else(|| AdmissionError::UnknownBackend(backend.to_string()))?;

        // Fast path avoids registering as a waiter
        if let Ok(permit) = Arc::clone(&gate.semaphore).try_acquire_owned() {
            return Ok(gate.grant(permit));
        }

        let _waiting = WaitingGuard::enter(&gate.stats.waiting);
        let wait_start = Instant::now();
        let acquire = tokio::time::timeout(timeout, Arc::clone(&gate.semaphore).acquire_owned());

        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(AdmissionError::Cancelled(backend.to_string())),
            result = acquire => match result {
                Ok(Ok(permit)) => Ok(gate.grant(permit)),
                // Gates are never closed; treat a closed semaphore as gone
                Ok(Err(_)) => Err(AdmissionError::UnknownBackend(backend.to_string())),
                Err(_) => {
                    gate.stats.total_timeouts.fetch_add(1, Ordering::Relaxed);
                    Err(AdmissionError::Timeout {
                        backend: backend.to_string(),
                        waited: wait_start.elapsed(),
                    })
                }
            },
        }
    }

    /// Give a slot back (same as dropping it)
    pub fn release(&self, slot: AdmissionSlot) {
        drop(slot);
    }

    /// Slots currently held on a backend (0 if unknown)
    pub fn active_count(&self, backend: &str) -> usize {
        self.gate(backend)
            .map_or(0, |g| g.stats.active.load(Ordering::SeqCst))
    }

    /// Configured limit of a backend
    pub fn limit(&self, backend: &str) -> Option<usize> {
        self.gate(backend).map(|g| g.limit.load(Ordering::SeqCst))
    }

    /// Change a backend's limit at runtime
    pub fn set_limit(&self, backend: &str, limit: usize) -> Result<(), AdmissionError> {
        let gate = self
            .gate(backend)
            .ok_or_else(|| AdmissionError::UnknownBackend(backend.to_string()))?;
        gate.set_limit(limit);
        tracing::info!(backend, limit, "Concurrency limit changed");
        Ok(())
    }

    /// Statistics of one backend's gate
    pub fn stats(&self, backend: &str) -> Option<AdmissionStats> {
        self.gate(backend).map(|g| g.snapshot())
    }

    /// Statistics of every gate, ordered by backend name
    pub fn all_stats(&self) -> std::collections::BTreeMap<String, AdmissionStats> {
        self.gates
            .iter()
            .map(|g| (g.key().clone(), g.value().snapshot()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready_ok};

    #[test]
    fn test_try_acquire_respects_limit() {
        let admission = AdmissionController::new();
        admission.register("a", 2);

        let s1 = admission.try_acquire("a").unwrap();
        let s2 = admission.try_acquire("a").unwrap();
        assert!(admission.try_acquire("a").is_none());
        assert_eq!(admission.active_count("a"), 2);

        admission.release(s1);
        assert_eq!(admission.active_count("a"), 1);
        assert!(admission.try_acquire("a").is_some());
        drop(s2);

        let stats = admission.stats("a").unwrap();
        assert_eq!(stats.active, 0);
        assert_eq!(stats.peak_active, 2);
        assert_eq!(stats.total_acquired, 3);
    }

    #[test]
    fn test_unknown_backend() {
        let admission = AdmissionController::new();
        assert!(admission.try_acquire("nope").is_none());
        assert_eq!(admission.active_count("nope"), 0);
        assert_eq!(admission.limit("nope"), None);
        assert_eq!(admission.probe("nope"), None);
    }

    #[test]
    fn test_probe_does_not_count() {
        let admission = AdmissionController::new();
        admission.register("a", 3);
        let _slot = admission.try_acquire("a").unwrap();

        assert_eq!(admission.probe("a"), Some(2));
        assert_eq!(admission.stats("a").unwrap().total_acquired, 1);
        assert_eq!(admission.active_count("a"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_times_out() {
        let admission = AdmissionController::new();
        admission.register("a", 1);
        let _held = admission.try_acquire("a").unwrap();

        let err = admission
            .acquire("a", Duration::from_millis(500))
            .await
            .unwrap_err();
        assert!(matches!(err, AdmissionError::Timeout { ref backend, .. } if backend == "a"));

        let stats = admission.stats("a").unwrap();
        assert_eq!(stats.total_timeouts, 1);
        assert_eq!(stats.waiting, 0);
    }

    #[tokio::test]
    async fn test_waiter_wakes_on_release() {
        let admission = AdmissionController::new();
        admission.register("a", 1);
        let held = admission.try_acquire("a").unwrap();

        let mut waiter = tokio_test::task::spawn(admission.acquire("a", Duration::from_secs(60)));
        assert_pending!(waiter.poll());
        assert_eq!(admission.stats("a").unwrap().waiting, 1);

        drop(held);
        assert!(waiter.is_woken());
        let slot = assert_ready_ok!(waiter.poll());
        assert_eq!(slot.backend(), "a");
        assert_eq!(admission.active_count("a"), 1);
    }

    #[tokio::test]
    async fn test_cancel_while_waiting() {
        let admission = AdmissionController::new();
        admission.register("a", 1);
        let _held = admission.try_acquire("a").unwrap();
        let token = CancellationToken::new();

        let mut waiter = tokio_test::task::spawn(admission.acquire_cancellable(
            "a",
            Duration::from_secs(60),
            &token,
        ));
        assert_pending!(waiter.poll());

        token.cancel();
        let result = waiter.poll();
        assert!(matches!(
            result,
            std::task::Poll::Ready(Err(AdmissionError::Cancelled(_)))
        ));
        drop(waiter);
        assert_eq!(admission.stats("a").unwrap().waiting, 0);
        assert_eq!(admission.active_count("a"), 1);
    }

    #[test]
    fn test_shrink_retires_in_flight_permits() {
        let admission = AdmissionController::new();
        admission.register("a", 3);
        let s1 = admission.try_acquire("a").unwrap();
        let s2 = admission.try_acquire("a").unwrap();

        // One free permit is forgotten now, one is owed by the in-flight slots
        admission.set_limit("a", 1).unwrap();
        assert_eq!(admission.limit("a"), Some(1));
        assert!(admission.try_acquire("a").is_none());

        drop(s1);
        assert!(admission.try_acquire("a").is_none());

        drop(s2);
        let s3 = admission.try_acquire("a").unwrap();
        assert!(admission.try_acquire("a").is_none());
        drop(s3);
    }

    #[test]
    fn test_grow_pays_debt_first() {
        let admission = AdmissionController::new();
        admission.register("a", 2);
        let s1 = admission.try_acquire("a").unwrap();
        let s2 = admission.try_acquire("a").unwrap();

        admission.set_limit("a", 1).unwrap();
        admission.set_limit("a", 3).unwrap();
        assert_eq!(admission.probe("a"), Some(1));

        drop(s1);
        drop(s2);
        assert_eq!(admission.probe("a"), Some(3));
    }

    #[test]
    fn test_register_existing_retunes() {
        let admission = AdmissionController::new();
        admission.register("a", 1);
        admission.register("a", 4);
        assert_eq!(admission.limit("a"), Some(4));
        assert_eq!(admission.probe("a"), Some(4));
    }
}
