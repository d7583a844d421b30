//! Architectural Enforcement
//!
//! Source scanners shared by the integration tests in `tests/`. They enforce
//! the async discipline of the pipeline crates:
//! - No sleep() calls in production code (wait on queues, timers and flags)
//! - No blocking I/O inside async functions
//!
//! The scanners are line based. Test modules (`#[cfg(test)] mod ...`) are cut
//! off before scanning, so fixtures may do whatever they like.

use std::fs;
use std::path::{Path, PathBuf};

/// Production source roots, relative to the workspace root
pub const PRODUCTION_DIRS: &[&str] = &["pipeline/core/src", "pipeline/cli/src"];

/// Workspace root, resolved from this crate's manifest
#[must_use]
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .ancestors()
        .nth(2)
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
}

/// Every `.rs` file under the production roots
#[must_use]
pub fn production_files() -> Vec<PathBuf> {
    let root = workspace_root();
    let mut files = Vec::new();

    for dir in PRODUCTION_DIRS {
        let path = root.join(dir);
        if !path.exists() {
            continue;
        }

        for entry in walkdir::WalkDir::new(&path)
            .into_iter()
            .filter_map(Result::ok)
        {
            if entry.path().extension().and_then(|s| s.to_str()) == Some("rs") {
                files.push(entry.path().to_path_buf());
            }
        }
    }

    files.sort();
    files
}

/// Read a source file and drop its trailing test module
#[must_use]
pub fn production_source(path: &Path) -> Option<String> {
    let content = fs::read_to_string(path).ok()?;
    let lines: Vec<&str> = content.lines().collect();
    let end = test_module_start(&lines).unwrap_or(lines.len());
    Some(lines[..end].join("\n"))
}

/// Index of the `#[cfg(test)]` attribute that opens a test module
#[must_use]
pub fn test_module_start(lines: &[&str]) -> Option<usize> {
    lines.iter().enumerate().find_map(|(idx, line)| {
        if line.trim() != "#[cfg(test)]" {
            return None;
        }
        let next = lines.get(idx + 1)?.trim();
        (next.starts_with("mod ") || next.starts_with("pub mod ")).then_some(idx)
    })
}

/// Code part of a line, without a trailing `//` comment
#[must_use]
pub fn code_part(line: &str) -> &str {
    line.split("//").next().unwrap_or(line)
}

/// Parse a function header: `Some(true)` for `async fn`, `Some(false)` for `fn`
#[must_use]
pub fn fn_header(line: &str) -> Option<bool> {
    let mut rest = line.trim();
    for prefix in ["pub(crate) ", "pub(super) ", "pub ", "const ", "unsafe "] {
        rest = rest.strip_prefix(prefix).unwrap_or(rest);
    }

    if rest.starts_with("async fn ") {
        Some(true)
    } else if rest.starts_with("fn ") {
        Some(false)
    } else {
        None
    }
}

/// Header of the function enclosing `current_idx`, if any
fn enclosing_fn(lines: &[&str], current_idx: usize) -> Option<bool> {
    for line in lines[..current_idx].iter().rev() {
        if let Some(is_async) = fn_header(line) {
            return Some(is_async);
        }

        // Stop at module/impl boundaries
        let trimmed = line.trim();
        if trimmed.starts_with("mod ") || (trimmed.starts_with("impl") && trimmed.contains('{')) {
            return None;
        }
    }
    None
}

/// Check if line is inside an async function
#[must_use]
pub fn is_in_async_function(lines: &[&str], current_idx: usize) -> bool {
    enclosing_fn(lines, current_idx) == Some(true)
}

/// Check if line is inside a non-async function (blocking I/O is fine there)
#[must_use]
pub fn is_in_non_async_function(lines: &[&str], current_idx: usize) -> bool {
    enclosing_fn(lines, current_idx) == Some(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fn_header_handles_visibility() {
        assert_eq!(fn_header("    pub async fn generate(&self) {"), Some(true));
        assert_eq!(fn_header("pub(crate) fn helper() {"), Some(false));
        assert_eq!(fn_header("fn main() {"), Some(false));
        assert_eq!(fn_header("let f = |x| x;"), None);
    }

    #[test]
    fn test_test_module_is_cut() {
        let lines = vec!["fn a() {}", "", "#[cfg(test)]", "mod tests {", "}"];
        assert_eq!(test_module_start(&lines), Some(2));

        let gated_item = vec!["#[cfg(test)]", "fn only_in_tests() {}"];
        assert_eq!(test_module_start(&gated_item), None);
    }

    #[test]
    fn test_workspace_root_contains_pipeline() {
        assert!(workspace_root().join("pipeline").exists());
    }
}
