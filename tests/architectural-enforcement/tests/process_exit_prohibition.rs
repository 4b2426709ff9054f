//! Integration Test: Process Exit Prohibition
//!
//! **Policy**: The core library never terminates the process and never
//! blocks on HTTP. Failures surface as `Result`s for the caller to handle;
//! only binaries decide exit codes, and they do it by returning from `main`.

use architectural_enforcement::{assert_clean, scan};

#[test]
fn test_no_process_exit_in_core() {
    let violations = scan("conductor/core/src", &[], |code| {
        code.contains("process::exit(") || code.contains("process::abort(")
    });

    assert_clean("process exit in library code", &violations);
}

#[test]
fn test_no_process_exit_in_cli() {
    let violations = scan("conductor/cli/src", &[], |code| code.contains("process::exit("));

    assert_clean("process::exit in the CLI (return an error from main instead)", &violations);
}

#[test]
fn test_no_blocking_http_client() {
    let violations = scan("conductor/core/src", &[], |code| code.contains("reqwest::blocking"));

    assert_clean("blocking reqwest client in library code", &violations);
}
