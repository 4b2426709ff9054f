//! Architectural Enforcement Integration Tests
//!
//! Source scanners shared by the tests in `tests/`. They walk the production
//! sources of the workspace crates and report lines that break the rules:
//! - No blocking sleeps, and async sleeps only where a delay is the point
//! - No process exits from library code
//!
//! Test modules (everything from a `#[cfg(test)]` line to the end of a file)
//! are not production code and are skipped.

use std::fs;
use std::path::{Path, PathBuf};

/// A rule-breaking line
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Violation {
    /// File containing the line
    pub path: PathBuf,
    /// 1-based line number
    pub line: usize,
    /// Trimmed source line
    pub source: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{} - {}", self.path.display(), self.line, self.source)
    }
}

/// Workspace root, two levels above this package
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .ancestors()
        .nth(2)
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
}

/// Every `.rs` file under `dir` (relative to the workspace root)
pub fn rust_files(dir: &str) -> Vec<PathBuf> {
    let root = workspace_root().join(dir);
    let mut files: Vec<PathBuf> = walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.path().extension().and_then(|s| s.to_str()) == Some("rs"))
        .map(walkdir::DirEntry::into_path)
        .collect();
    files.sort();
    files
}

/// Production lines of a source file: (1-based number, code without comments)
///
/// Stops at the first `#[cfg(test)]`.
pub fn production_lines(content: &str) -> Vec<(usize, &str)> {
    content
        .lines()
        .enumerate()
        .take_while(|(_, line)| line.trim() != "#[cfg(test)]")
        .map(|(idx, line)| (idx + 1, line.split("//").next().unwrap_or(line)))
        .filter(|(_, code)| !code.trim().is_empty())
        .collect()
}

/// Lines in production code of `dir` for which `is_violation` holds
///
/// `allowed` lists file names (not paths) exempt from the rule.
pub fn scan(dir: &str, allowed: &[&str], is_violation: impl Fn(&str) -> bool) -> Vec<Violation> {
    let mut violations = Vec::new();

    for path in rust_files(dir) {
        let exempt = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|name| allowed.contains(&name));
        if exempt {
            continue;
        }

        let Ok(content) = fs::read_to_string(&path) else {
            continue;
        };
        for (line, code) in production_lines(&content) {
            if is_violation(code) {
                violations.push(Violation {
                    path: path.clone(),
                    line,
                    source: code.trim().to_string(),
                });
            }
        }
    }

    violations
}

/// Panic with a readable list when any violation was found
pub fn assert_clean(rule: &str, violations: &[Violation]) {
    if violations.is_empty() {
        return;
    }

    eprintln!("\n{rule}:");
    for violation in violations {
        eprintln!("  {violation}");
    }
    panic!("\nFound {} violation(s) of: {rule}", violations.len());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_production_lines_stop_at_test_module() {
        let src = "fn a() {}\n// comment only\nlet x = 1; // trailing\n#[cfg(test)]\nfn b() {}\n";
        let lines = production_lines(src);
        assert_eq!(lines, vec![(1, "fn a() {}"), (3, "let x = 1; ")]);
    }

    #[test]
    fn test_workspace_root_has_manifest() {
        assert!(workspace_root().join("Cargo.toml").exists());
    }
}
