//! Integration Test: Blocking I/O Prohibition
//!
//! **Policy**: Async code in the pipeline crates MUST NOT use blocking I/O.
//! **Required**: Use `tokio::fs`, `tokio::net`, `tokio::io::stdout`, not their `std` twins
//! **Acceptable**: Non-async functions (config loading runs before the
//! pipeline starts), test modules

use std::path::Path;

use architectural_enforcement::{
    code_part, is_in_async_function, is_in_non_async_function, production_files,
    production_source,
};

/// Test that production code does not use blocking I/O
#[test]
fn test_no_blocking_io_in_production_code() {
    let violations = find_blocking_io_violations();

    if !violations.is_empty() {
        eprintln!("\n❌ CRITICAL: Blocking I/O calls found in production code!\n");

        for violation in &violations {
            eprintln!("  ❌ {violation}");
        }

        eprintln!("\n❌ FORBIDDEN blocking I/O:");
        eprintln!("  - std::fs::read(), std::fs::write(), std::fs::File");
        eprintln!("  - std::net::TcpStream, std::net::TcpListener");
        eprintln!("  - std::process::Command::output()");
        eprintln!("  - std::io::stdin()/stdout() inside async functions");
        eprintln!("\n✅ REQUIRED async I/O:");
        eprintln!("  - tokio::fs::read().await, tokio::fs::write().await");
        eprintln!("  - tokio::io::stdout() with AsyncWriteExt");
        eprintln!("\n✅ ACCEPTABLE blocking I/O:");
        eprintln!("  - Non-async functions (before the runtime starts work)");
        eprintln!("  - Test code");

        panic!(
            "\nFound {} blocking I/O violation(s) in production code.\nFix these before merging!",
            violations.len()
        );
    }
}

fn find_blocking_io_violations() -> Vec<String> {
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
        let mut report = |kind: &str| {
            violations.push(format!(
                "{}:{} - {kind}: {}",
                path.display(),
                idx + 1,
                line.trim()
            ));
        };

        if (code.contains("std::io::stdin()") || code.contains("std::io::stdout()"))
            && is_in_async_function(&lines, idx)
        {
            report("Blocking stdin/stdout in async");
        }

        if is_in_non_async_function(&lines, idx) {
            continue;
        }

        if code.contains("std::fs::") || code.contains("use std::fs") {
            report("Blocking file I/O");
        }

        if code.contains("std::net::") || code.contains("use std::net") {
            report("Blocking network I/O");
        }

        if code.contains("std::process::Command") {
            report("Blocking process I/O");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocking_io_detection() {
        let test_code = vec![
            "pub async fn load(&self) {",
            "    let contents = std::fs::read_to_string(\"pipeline.toml\")?;",
            "}",
        ];

        assert!(is_in_async_function(&test_code, 1));
        assert!(!is_in_non_async_function(&test_code, 1));
    }

    #[test]
    fn test_non_async_function_detection() {
        let test_code = vec![
            "pub fn load_config_from_path(path: Option<PathBuf>) -> Result<Config> {",
            "    if let Some(ref config_path) = path {",
            "        let toml_content = std::fs::read_to_string(config_path)?;",
            "    }",
            "}",
        ];

        assert!(is_in_non_async_function(&test_code, 2));
    }
}
