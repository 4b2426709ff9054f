//! End-to-end dispatch scenarios
//!
//! Each test builds its own [`Orchestrator`] over simulated backends and runs
//! tasks through the full path: selection, admission, invocation, quality
//! evaluation, fallback and ledger recording.
//!
//! Timing scenarios run on a paused tokio clock, so simulated latencies of
//! seconds finish instantly while still being measured exactly.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use model_conductor::routing::FixedEvaluator;
use model_conductor::{
    AttemptRecord, BackendConfig, BackendError, Complexity, ConductorConfig, DegradedPolicy,
    DispatchError, ErrorKind, ModelBackend, Orchestrator, QualityEvaluator, SimulatedBackend,
    SimulatedOutcome, Task, TaskId, TaskType, Tier,
};

// =============================================================================
// Test Infrastructure
// =============================================================================

/// Scores a response by parsing it as a number ("0.3" scores 0.3)
struct ScoreFromText;

impl QualityEvaluator for ScoreFromText {
    fn evaluate(&self, _task_type: TaskType, response: &str, _elapsed: Duration) -> f64 {
        response.trim().parse().unwrap_or(0.0)
    }
}

fn orchestrator() -> Orchestrator {
    Orchestrator::new(&ConductorConfig::empty()).with_evaluator(Arc::new(FixedEvaluator(0.9)))
}

fn add(
    orch: &Orchestrator,
    name: &str,
    tier: Tier,
    limit: usize,
    weight: i32,
    backend: SimulatedBackend,
) -> Arc<SimulatedBackend> {
    let backend = Arc::new(backend);
    let config = BackendConfig::new(name, tier, [TaskType::Coding, TaskType::Debugging])
        .with_concurrency_limit(limit)
        .with_priority_weight(weight);
    orch.register_backend(config, Arc::clone(&backend) as Arc<dyn ModelBackend>)
        .expect("register backend");
    backend
}

fn refusing(name: &str) -> SimulatedBackend {
    SimulatedBackend::new(name).always(SimulatedOutcome::Fail(BackendError::Connection(
        "refused".into(),
    )))
}

fn coding(description: &str) -> Task {
    Task::new(TaskType::Coding, description)
}

// =============================================================================
// Fallback
// =============================================================================

#[tokio::test(start_paused = true)]
async fn timeout_on_powerful_backend_falls_back_to_balanced() {
    let orch = orchestrator();
    let a = add(&orch, "A", Tier::Powerful, 1, 0, SimulatedBackend::new("A").then_hang());
    let b = add(&orch, "B", Tier::Balanced, 2, 0, SimulatedBackend::new("B"));

    let task = coding("Refactor the parser").with_complexity(Complexity::Complex);
    let options = orch
        .options()
        .with_per_attempt_timeout(Duration::from_secs(30));
    let result = orch.execute_with(&task, &options).await.unwrap();

    assert!(result.final_success);
    assert_eq!(result.backend_name.as_deref(), Some("B"));
    assert_eq!(result.attempted_backends(), vec!["A", "B"]);
    assert!(!result.attempts[0].success);
    assert_eq!(result.attempts[0].error_kind, Some(ErrorKind::Timeout));
    assert!(result.attempts[1].success);
    assert_eq!(a.calls(), 1);
    assert_eq!(b.calls(), 1);

    // The hung call was abandoned and its slot returned
    assert_eq!(orch.admission().active_count("A"), 0);
    assert_eq!(a.in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn admission_timeout_falls_back_without_calling_the_backend() {
    let orch = orchestrator();
    let busy = add(&orch, "busy", Tier::Balanced, 1, 5, SimulatedBackend::new("busy"));
    add(&orch, "idle", Tier::Balanced, 1, 1, SimulatedBackend::new("idle"));

    let _held = orch.admission().try_acquire("busy").unwrap();
    let options = orch
        .options()
        .with_admission_timeout(Duration::from_millis(100));
    let result = orch
        .execute_with(&coding("anything"), &options)
        .await
        .unwrap();

    assert_eq!(result.attempted_backends(), vec!["busy", "idle"]);
    assert_eq!(result.attempts[0].error_kind, Some(ErrorKind::AdmissionTimeout));
    assert_eq!(busy.calls(), 0);
}

#[tokio::test]
async fn backend_errors_are_recorded_and_skipped() {
    let orch = orchestrator();
    add(
        &orch,
        "flaky",
        Tier::Balanced,
        1,
        9,
        SimulatedBackend::new("flaky").then_fail(BackendError::Connection("refused".into())),
    );
    add(
        &orch,
        "limited",
        Tier::Balanced,
        1,
        5,
        SimulatedBackend::new("limited").then_fail(BackendError::RateLimited { retry_after: None }),
    );
    add(&orch, "steady", Tier::Balanced, 1, 1, SimulatedBackend::new("steady"));

    let result = orch.execute(&coding("anything")).await.unwrap();

    assert_eq!(result.attempted_backends(), vec!["flaky", "limited", "steady"]);
    let kinds: Vec<_> = result.attempts.iter().map(|a| a.error_kind).collect();
    assert_eq!(
        kinds,
        vec![Some(ErrorKind::Connection), Some(ErrorKind::RateLimited), None]
    );
}

#[tokio::test]
async fn attempted_backends_are_never_repeated() {
    let orch = orchestrator();
    for (name, weight) in [("x", 3), ("y", 2), ("z", 1)] {
        add(&orch, name, Tier::Balanced, 1, weight, refusing(name));
    }

    let options = orch.options().with_max_attempts(10);
    let err = orch
        .execute_with(&coding("anything"), &options)
        .await
        .unwrap_err();

    let DispatchError::ExhaustedFallback { result } = err else {
        panic!("expected exhaustion, got {err:?}");
    };
    let tried = result.attempted_backends();
    let unique: HashSet<_> = tried.iter().collect();
    assert_eq!(tried.len(), 3);
    assert_eq!(unique.len(), 3);
    assert!(!result.final_success);
    assert!(result.response.is_none());
}

#[tokio::test]
async fn max_attempts_limits_fallback_depth() {
    let orch = orchestrator();
    for (name, weight) in [("x", 3), ("y", 2), ("z", 1)] {
        add(&orch, name, Tier::Balanced, 1, weight, refusing(name));
    }

    let options = orch.options().with_max_attempts(2);
    let err = orch
        .execute_with(&coding("anything"), &options)
        .await
        .unwrap_err();

    assert_eq!(err.result().unwrap().attempted_backends(), vec!["x", "y"]);
}

// =============================================================================
// Eligibility
// =============================================================================

#[tokio::test]
async fn review_without_eligible_backend_fails_before_any_attempt() {
    let orch = orchestrator();
    let coder = add(&orch, "coder", Tier::Balanced, 1, 0, SimulatedBackend::new("coder"));

    let err = orch
        .execute(&Task::new(TaskType::Review, "Review this diff"))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        DispatchError::NoEligibleBackend {
            task_type: TaskType::Review
        }
    ));
    assert!(err.result().is_none());
    assert!(orch.report().is_empty());
    assert_eq!(coder.calls(), 0);
}

// =============================================================================
// Quality
// =============================================================================

fn scored_pair(policy: DegradedPolicy, first: &str, second: &str) -> (Orchestrator, Task) {
    let mut config = ConductorConfig::empty();
    config.dispatch.degraded_policy = policy;
    let orch = Orchestrator::new(&config).with_evaluator(Arc::new(ScoreFromText));
    add(&orch, "first", Tier::Balanced, 1, 2, SimulatedBackend::new("first").then_succeed(first));
    add(&orch, "second", Tier::Balanced, 1, 1, SimulatedBackend::new("second").then_succeed(second));
    (orch, coding("anything"))
}

#[tokio::test]
async fn below_threshold_response_falls_back() {
    let (orch, task) = scored_pair(DegradedPolicy::HardFailure, "0.3", "0.8");

    let result = orch.execute(&task).await.unwrap();

    assert_eq!(result.backend_name.as_deref(), Some("second"));
    assert_eq!(result.response.as_deref(), Some("0.8"));
    assert!(!result.degraded);
    assert_eq!(result.quality_score, 0.8);

    let first = &result.attempts[0];
    assert!(!first.success);
    assert_eq!(first.quality_score, 0.3);
    assert_eq!(first.error_kind, Some(ErrorKind::QualityBelowThreshold));
}

#[tokio::test]
async fn below_threshold_never_wins_under_hard_failure() {
    let (orch, task) = scored_pair(DegradedPolicy::HardFailure, "0.3", "0.5");

    let err = orch.execute(&task).await.unwrap_err();

    let result = err.result().unwrap();
    assert!(matches!(err, DispatchError::ExhaustedFallback { .. }));
    assert!(!result.final_success);
    assert!(result.attempts.iter().all(|a| !a.success));
}

#[tokio::test]
async fn best_effort_returns_highest_quality_degraded_response() {
    let (orch, task) = scored_pair(DegradedPolicy::BestEffort, "0.3", "0.5");

    let result = orch.execute(&task).await.unwrap();

    assert!(result.final_success);
    assert!(result.degraded);
    assert_eq!(result.backend_name.as_deref(), Some("second"));
    assert_eq!(result.quality_score, 0.5);
    assert_eq!(result.attempts.len(), 2);
}

// =============================================================================
// Concurrency
// =============================================================================

#[tokio::test(start_paused = true)]
async fn five_tasks_through_limit_two_take_three_rounds() {
    let orch = orchestrator();
    let backend = add(
        &orch,
        "solo",
        Tier::Balanced,
        2,
        0,
        SimulatedBackend::new("solo").with_latency(Duration::from_secs(2)),
    );

    let tasks: Vec<Task> = (0..5).map(|i| coding(&format!("task {i}"))).collect();
    let started = Instant::now();
    let results = orch.execute_all(tasks).await;
    let elapsed = started.elapsed();

    assert!(results.iter().all(|r| r.as_ref().is_ok_and(|r| r.final_success)));
    assert!(elapsed >= Duration::from_secs(6), "finished in {elapsed:?}");
    assert!(elapsed < Duration::from_millis(6500), "finished in {elapsed:?}");
    assert_eq!(backend.peak_in_flight(), 2);
    assert_eq!(orch.admission().active_count("solo"), 0);
}

#[tokio::test(start_paused = true)]
async fn limit_one_serializes_concurrent_tasks() {
    let orch = orchestrator();
    let backend = add(
        &orch,
        "single",
        Tier::Balanced,
        1,
        0,
        SimulatedBackend::new("single").with_latency(Duration::from_secs(1)),
    );

    let started = Instant::now();
    let results = orch
        .execute_all(vec![coding("first"), coding("second")])
        .await;

    assert!(results.iter().all(Result::is_ok));
    assert_eq!(backend.peak_in_flight(), 1);
    assert!(started.elapsed() >= Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn active_count_never_exceeds_limit() {
    let orch = orchestrator();
    let backend = add(
        &orch,
        "pool",
        Tier::Balanced,
        3,
        0,
        SimulatedBackend::new("pool").with_latency(Duration::from_millis(250)),
    );

    let tasks: Vec<Task> = (0..20).map(|i| coding(&format!("task {i}"))).collect();
    let options = orch
        .options()
        .with_admission_timeout(Duration::from_secs(60));
    let results = orch.execute_all_with(tasks, &options).await;

    assert_eq!(results.len(), 20);
    assert!(results.iter().all(Result::is_ok));
    assert!(backend.peak_in_flight() <= 3);

    let stats = &orch.admission_stats()["pool"];
    assert!(stats.peak_active <= 3);
    assert_eq!(stats.active, 0);
    assert_eq!(stats.total_acquired, 20);
}

#[tokio::test(start_paused = true)]
async fn execute_all_keeps_input_order() {
    let orch = orchestrator();
    add(&orch, "b", Tier::Balanced, 4, 0, SimulatedBackend::new("b"));

    let tasks: Vec<Task> = (0..4)
        .map(|i| coding(&format!("task {i}")).with_id(format!("t{i}")))
        .collect();
    let results = orch.execute_all(tasks).await;

    let ids: Vec<String> = results
        .into_iter()
        .map(|r| r.unwrap().task_id.to_string())
        .collect();
    assert_eq!(ids, vec!["t0", "t1", "t2", "t3"]);
}

// =============================================================================
// Cancellation
// =============================================================================

#[tokio::test(start_paused = true)]
async fn cancellation_aborts_in_flight_call_and_releases_slot() {
    let orch = orchestrator();
    let backend = add(&orch, "slow", Tier::Balanced, 1, 0, SimulatedBackend::new("slow").then_hang());

    let cancel = CancellationToken::new();
    let options = orch.options().with_cancellation(cancel.clone());
    let task = coding("never finishes");

    let handle = {
        let orch = orch.clone();
        let task = task.clone();
        tokio::spawn(async move { orch.execute_with(&task, &options).await })
    };

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(orch.admission().active_count("slow"), 1);

    cancel.cancel();
    let err = handle.await.unwrap().unwrap_err();

    let DispatchError::Cancelled { result } = err else {
        panic!("expected cancellation, got {err:?}");
    };
    assert_eq!(result.attempts.len(), 1);
    assert_eq!(result.attempts[0].error_kind, Some(ErrorKind::Cancelled));
    assert_eq!(orch.admission().active_count("slow"), 0);
    assert_eq!(backend.in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn cancellation_while_waiting_for_a_slot_records_one_attempt() {
    let orch = orchestrator();
    let backend = add(&orch, "busy", Tier::Balanced, 1, 0, SimulatedBackend::new("busy"));
    let held = orch.admission().try_acquire("busy").unwrap();

    let cancel = CancellationToken::new();
    let options = orch
        .options()
        .with_cancellation(cancel.clone())
        .with_admission_timeout(Duration::from_secs(60));
    let task = coding("queued behind another task");

    let handle = {
        let orch = orch.clone();
        let task = task.clone();
        tokio::spawn(async move { orch.execute_with(&task, &options).await })
    };

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(orch.admission().stats("busy").unwrap().waiting, 1);

    cancel.cancel();
    let err = handle.await.unwrap().unwrap_err();

    let DispatchError::Cancelled { result } = err else {
        panic!("expected cancellation, got {err:?}");
    };
    assert_eq!(result.attempted_backends(), vec!["busy"]);
    assert_eq!(result.attempts[0].error_kind, Some(ErrorKind::Cancelled));
    assert_eq!(backend.calls(), 0);

    let stats = orch.admission().stats("busy").unwrap();
    assert_eq!(stats.waiting, 0);
    assert_eq!(stats.active, 1);

    orch.admission().release(held);
    assert_eq!(orch.admission().active_count("busy"), 0);
    assert!(orch.admission().try_acquire("busy").is_some());
}

// =============================================================================
// Ledger feedback
// =============================================================================

#[tokio::test]
async fn report_counts_match_windowed_records() {
    let mut config = ConductorConfig::empty();
    config.ledger.window_size = 3;
    let orch = Orchestrator::new(&config).with_evaluator(Arc::new(FixedEvaluator(0.9)));
    add(&orch, "b", Tier::Balanced, 1, 0, SimulatedBackend::new("b"));

    for i in 0..5 {
        orch.execute(&coding(&format!("task {i}"))).await.unwrap();
    }

    assert_eq!(orch.report()["b"].count, 3);
    assert_eq!(orch.lifetime_report()["b"].count, 5);
    assert_eq!(orch.report()["b"].success_rate, 1.0);
}

#[tokio::test]
async fn poor_history_demotes_a_backend() {
    let orch = Orchestrator::new(&ConductorConfig::empty()).with_evaluator(Arc::new(ScoreFromText));
    add(
        &orch,
        "weak",
        Tier::Balanced,
        1,
        1,
        SimulatedBackend::new("weak").always(SimulatedOutcome::Succeed("0.2".into())),
    );
    add(
        &orch,
        "strong",
        Tier::Balanced,
        1,
        1,
        SimulatedBackend::new("strong")
            .always(SimulatedOutcome::Succeed("0.9".into())),
    );

    // Equal weights and no history: the name breaks the tie
    let first = orch.execute(&coding("one")).await.unwrap();
    assert_eq!(first.attempted_backends(), vec!["strong"]);

    for _ in 0..2 {
        orch.ledger().record(AttemptRecord::failed(
            TaskId::generate(),
            "strong",
            TaskType::Coding,
            chrono::Utc::now(),
            Duration::from_secs(1),
            ErrorKind::Timeout,
        ));
    }

    // strong now averages (0.9 + 0 + 0) / 3 = 0.3, weak has no history (0.5)
    assert_eq!(orch.recommend(TaskType::Coding), vec!["weak", "strong"]);
}
