//! Integration Test: Sleep Prohibition
//!
//! **Policy**: Production code in the pipeline crates MUST NOT call sleep methods.
//! Idle pings, execution deadlines and audio drains wait on `timeout`/`timeout_at`
//! around a real event source instead.
//! **Exceptions**: exponential backoff (retry logic only), periodic
//! `tokio::time::interval` ticks, test modules

use std::path::Path;

use architectural_enforcement::{code_part, production_files, production_source};

/// Test that production code does not contain sleep() calls
#[test]
fn test_no_sleep_in_production_code() {
    let violations = find_sleep_violations();

    if !violations.is_empty() {
        eprintln!("\n❌ CRITICAL: Sleep calls found in production code!\n");

        for violation in &violations {
            eprintln!("  ❌ {violation}");
        }

        eprintln!("\n✅ ACCEPTABLE sleep uses:");
        eprintln!("  - Exponential backoff in retry logic");
        eprintln!("  - Test code (#[cfg(test)] modules)");
        eprintln!("  - Periodic tasks using tokio::time::interval()");
        eprintln!("\n❌ FORBIDDEN:");
        eprintln!("  - Sleep in polling loops (use timeout() around recv())");
        eprintln!("  - Sleep as poor man's synchronization (use Notify or a channel)");
        eprintln!("  - Sleep to 'wait' for a deadline (use timeout_at())");

        panic!(
            "\nFound {} sleep violation(s) in production code.\nFix these before merging!",
            violations.len()
        );
    }
}

#[test]
fn test_scanner_sees_production_files() {
    let files = production_files();
    assert!(
        files.iter().any(|f| f.ends_with("queue/task_queue.rs")),
        "scanner must cover the queue module, found {files:?}"
    );
}

fn find_sleep_violations() -> Vec<String> {
    let mut violations = Vec::new();
    for path in production_files() {
        check_file(&path, &mut violations);
    }
    violations
}

fn check_file(path: &Path, violations: &mut Vec<String>) {
    let Some(content) = production_source(path) else {
        return;
    };
    let lines: Vec<&str> = content.lines().collect();

    for (idx, line) in lines.iter().enumerate() {
        let code = code_part(line);
        if !(code.contains("::sleep(") || code.contains(".sleep(") || code.contains("sleep_until(")) {
            continue;
        }

        if is_backoff_context(&lines, idx) || is_interval_pattern(&lines, idx) {
            continue;
        }

        violations.push(format!("{}:{} - {}", path.display(), idx + 1, line.trim()));
    }
}

/// Check if sleep is used for exponential backoff (acceptable for retry logic)
fn is_backoff_context(lines: &[&str], current_idx: usize) -> bool {
    let context_range = current_idx.saturating_sub(15)..std::cmp::min(current_idx + 5, lines.len());

    let mut has_backoff_calc = false;
    let mut has_retry_context = false;

    for line in &lines[context_range] {
        let line = line.to_lowercase();

        if line.contains("<<") || line.contains("pow") || line.contains("* 2") {
            has_backoff_calc = true;
        }

        if line.contains("retry")
            || line.contains("reconnect")
            || line.contains("backoff")
            || line.contains("attempt")
        {
            has_retry_context = true;
        }
    }

    has_backoff_calc && has_retry_context
}

/// Check if this is a `tokio::time::interval` loop (acceptable for periodic tasks)
fn is_interval_pattern(lines: &[&str], current_idx: usize) -> bool {
    let backward = current_idx.saturating_sub(20)..current_idx;
    if lines[backward]
        .iter()
        .any(|line| line.contains("interval.tick()") || line.contains("tokio::time::interval"))
    {
        return true;
    }

    let forward = current_idx..std::cmp::min(current_idx + 5, lines.len());
    lines[forward].iter().any(|line| line.contains("interval.tick()"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_detection() {
        let test_code = vec![
            "fn reconnect() {",
            "    let delay = base_delay * (1 << attempt);",
            "    tracing::warn!(attempt, \"Retrying\");",
            "    tokio::time::sleep(Duration::from_millis(delay)).await;",
            "}",
        ];

        assert!(
            is_backoff_context(&test_code, 3),
            "Should detect exponential backoff pattern"
        );
    }

    #[test]
    fn test_polling_sleep_is_not_excused() {
        let test_code = vec![
            "async fn wait_for_event(&self) {",
            "    while self.queue.is_empty() {",
            "        tokio::time::sleep(Duration::from_millis(10)).await;",
            "    }",
            "}",
        ];

        assert!(!is_backoff_context(&test_code, 2));
        assert!(!is_interval_pattern(&test_code, 2));
    }
}
