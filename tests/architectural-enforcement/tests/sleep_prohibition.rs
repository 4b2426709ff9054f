//! Integration Test: Sleep Prohibition
//!
//! **Policy**: Production code in the conductor crates MUST NOT block a
//! runtime thread with `std::thread::sleep`, and MUST NOT use async sleeps to
//! wait for events. Waiting happens on semaphores, timeouts and cancellation
//! tokens.
//!
//! **Exceptions**:
//! - `dispatcher.rs`: backoff between fallback attempts
//! - `simulated.rs`: the simulated backend's configured latency

use architectural_enforcement::{assert_clean, scan};

const CRATES: &[&str] = &["conductor/core/src", "conductor/cli/src"];

#[test]
fn test_no_blocking_sleep() {
    let violations: Vec<_> = CRATES
        .iter()
        .flat_map(|dir| scan(dir, &[], |code| code.contains("thread::sleep(")))
        .collect();

    assert_clean("blocking std::thread::sleep in production code", &violations);
}

#[test]
fn test_async_sleep_only_where_delay_is_intended() {
    let violations: Vec<_> = CRATES
        .iter()
        .flat_map(|dir| {
            scan(dir, &["dispatcher.rs", "simulated.rs"], |code| {
                code.contains("time::sleep(") || code.contains("sleep_until(")
            })
        })
        .collect();

    assert_clean("tokio sleep outside backoff or simulated latency", &violations);
}
