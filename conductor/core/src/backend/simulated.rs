//! Simulated Backend
//!
//! A scripted [`ModelBackend`] for tests and dry runs. Every call sleeps for
//! the configured latency (on the tokio clock, so paused-clock tests stay
//! instant) and then plays the next scripted outcome. Once the script is used
//! up, the fallback outcome repeats forever.
//!
//! ```ignore
//! let backend = SimulatedBackend::new("codellama:13b-instruct")
//!     .with_latency(Duration::from_secs(2))
//!     .then_fail(BackendError::Connection("refused".into()))
//!     .then_succeed("fn main() {}");
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::traits::{BackendError, BackendResponse, InvokeOptions, ModelBackend};

/// What a simulated call does after its latency elapses
#[derive(Clone, Debug, PartialEq)]
pub enum SimulatedOutcome {
    /// Return this text
    Succeed(String),
    /// Fail with this error
    Fail(BackendError),
    /// Never return
    Hang,
}

/// Captured call for test verification
#[derive(Clone, Debug, PartialEq)]
pub struct SimulatedCall {
    /// Model requested in the options
    pub model: String,
    /// Prompt sent
    pub prompt: String,
}

/// Scripted backend with call tracking
#[derive(Debug)]
pub struct SimulatedBackend {
    name: String,
    latency: Duration,
    script: Mutex<VecDeque<SimulatedOutcome>>,
    fallback: SimulatedOutcome,
    cost: Option<f64>,
    history: Mutex<Vec<SimulatedCall>>,
    calls: AtomicU64,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl SimulatedBackend {
    /// Create a backend that answers instantly with a canned reply
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let fallback = SimulatedOutcome::Succeed(format!("Simulated response from {name}"));
        Self {
            name,
            latency: Duration::ZERO,
            script: Mutex::new(VecDeque::new()),
            fallback,
            cost: None,
            history: Mutex::new(Vec::new()),
            calls: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    /// Set per-call latency
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Report this cost on every successful call
    #[must_use]
    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = Some(cost);
        self
    }

    /// Outcome used once the script is exhausted
    #[must_use]
    pub fn always(mut self, outcome: SimulatedOutcome) -> Self {
        self.fallback = outcome;
        self
    }

    /// Queue a successful call
    #[must_use]
    pub fn then_succeed(self, text: impl Into<String>) -> Self {
        self.then(SimulatedOutcome::Succeed(text.into()))
    }

    /// Queue a failing call
    #[must_use]
    pub fn then_fail(self, error: BackendError) -> Self {
        self.then(SimulatedOutcome::Fail(error))
    }

    /// Queue a call that never returns
    #[must_use]
    pub fn then_hang(self) -> Self {
        self.then(SimulatedOutcome::Hang)
    }

    /// Queue an outcome
    #[must_use]
    pub fn then(self, outcome: SimulatedOutcome) -> Self {
        self.script.lock().push_back(outcome);
        self
    }

    /// Calls started so far
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Calls currently running
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of calls that ran at once
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Every call received, in order
    pub fn history(&self) -> Vec<SimulatedCall> {
        self.history.lock().clone()
    }

    fn next_outcome(&self) -> SimulatedOutcome {
        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

/// Decrements the in-flight gauge however the call ends
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ModelBackend for SimulatedBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(
        &self,
        prompt: &str,
        options: &InvokeOptions,
    ) -> Result<BackendResponse, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.history.lock().push(SimulatedCall {
            model: options.model.clone(),
            prompt: prompt.to_string(),
        });

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        let outcome = self.next_outcome();
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        match outcome {
            SimulatedOutcome::Succeed(text) => {
                let tokens = (prompt.split_whitespace().count() + text.split_whitespace().count())
                    as u64;
                let response = BackendResponse::new(text, tokens);
                Ok(match self.cost {
                    Some(cost) => response.with_cost(cost),
                    None => response,
                })
            }
            SimulatedOutcome::Fail(error) => Err(error),
            SimulatedOutcome::Hang => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_script_then_fallback() {
        let backend = SimulatedBackend::new("sim")
            .then_fail(BackendError::Connection("refused".into()))
            .then_succeed("first");
        let options = InvokeOptions::new("sim");

        assert!(matches!(
            backend.invoke("p", &options).await,
            Err(BackendError::Connection(_))
        ));
        assert_eq!(backend.invoke("p", &options).await.unwrap().text, "first");
        assert_eq!(
            backend.invoke("p", &options).await.unwrap().text,
            "Simulated response from sim"
        );
        assert_eq!(backend.calls(), 3);
        assert_eq!(backend.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hang_is_cancellable() {
        let backend = SimulatedBackend::new("sim").then_hang();
        let options = InvokeOptions::new("sim");

        let result =
            tokio::time::timeout(Duration::from_secs(1), backend.invoke("p", &options)).await;
        assert!(result.is_err());
        assert_eq!(backend.in_flight(), 0);
        assert_eq!(backend.peak_in_flight(), 1);
    }

    #[tokio::test]
    async fn test_history_and_cost() {
        let backend = SimulatedBackend::new("sim").with_cost(0.01);
        let response = backend
            .invoke("write tests", &InvokeOptions::new("llama2:7b"))
            .await
            .unwrap();

        assert_eq!(response.cost, Some(0.01));
        assert!(response.tokens_used > 0);
        assert_eq!(
            backend.history(),
            vec![SimulatedCall {
                model: "llama2:7b".to_string(),
                prompt: "write tests".to_string(),
            }]
        );
    }
}
