use std::path::{Path, PathBuf};
use std::process::Command;

const MAX_LINES: usize = 750;

const CHECKED_EXTENSIONS: &[&str] = &["rs", "yaml", "toml"];

const EXCLUDED_DIRS: &[&str] = &["target", ".git", "examples", "original_source"];

const EXCLUDED_FILES: &[&str] = &["Cargo.lock"];

fn main() {
    println!("cargo:rerun-if-changed=voxkeeper.yaml");

    let root = PathBuf::from(
        std::env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR must be set"),
    );
    let files = collect_files_to_check(&root);
    for file in &files {
        println!("cargo:rerun-if-changed={}", file.display());
    }

    let rust_files: Vec<PathBuf> = files
        .iter()
        .filter(|p| {
            p.extension().and_then(|e| e.to_str()) == Some("rs")
                && p.file_name().and_then(|n| n.to_str()) != Some("build.rs")
        })
        .cloned()
        .collect();

    enforce_line_limits(&root, &files);
    enforce_no_dead_code_allows(&root, &rust_files);
    enforce_no_test_skips(&root, &rust_files);
    enforce_serial_for_env_mutations(&root, &rust_files);
}

type Violations = Vec<(PathBuf, Vec<(usize, String)>)>;

fn enforce_line_limits(root: &Path, files: &[PathBuf]) {
    let mut violations = Vec::new();
    for file in files {
        match count_lines(file) {
            Ok(line_count) if line_count > MAX_LINES => {
                let rel_path = file.strip_prefix(root).unwrap_or(file);
                violations.push((rel_path.to_path_buf(), line_count));
            }
            Ok(_) => {}
            Err(e) => {
                let rel_path = file.strip_prefix(root).unwrap_or(file);
                println!(
                    "cargo:warning=Could not read file {}: {}",
                    rel_path.display(),
                    e
                );
            }
        }
    }

    if !violations.is_empty() {
        eprintln!("\n========================================");
        eprintln!("FILE LINE LIMIT EXCEEDED (max {} lines)", MAX_LINES);
        eprintln!("========================================");
        for (path, lines) in &violations {
            eprintln!(
                "  {} - {} lines (exceeds by {})",
                path.display(),
                lines,
                lines - MAX_LINES
            );
        }
        eprintln!("========================================\n");
        eprintln!("Please split these files into smaller modules.\n");
        panic!(
            "Build failed: {} file(s) exceed the {} line limit",
            violations.len(),
            MAX_LINES
        );
    }
}

fn collect_files_to_check(root: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    if let Ok(output) = Command::new("git")
        .args(["ls-files"])
        .current_dir(root)
        .output()
    {
        if output.status.success() {
            if let Ok(stdout) = String::from_utf8(output.stdout) {
                for line in stdout.lines() {
                    let path = root.join(line);
                    if should_check_file(&path, root) {
                        files.push(path);
                    }
                }
                if !files.is_empty() {
                    return files;
                }
            }
        }
    }

    walk_directory(root, root, &mut files);
    files
}

fn walk_directory(dir: &Path, root: &Path, files: &mut Vec<PathBuf>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return,
    };

    for entry in entries.flatten() {
        let path = entry.path();

        if path.is_dir() {
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                if EXCLUDED_DIRS.contains(&name) {
                    continue;
                }
            }
            walk_directory(&path, root, files);
        } else if should_check_file(&path, root) {
            files.push(path);
        }
    }
}

fn should_check_file(path: &Path, root: &Path) -> bool {
    let ext = match path.extension().and_then(|e| e.to_str()) {
        Some(e) => e,
        None => return false,
    };

    if !CHECKED_EXTENSIONS.contains(&ext) {
        return false;
    }

    if let Ok(rel_path) = path.strip_prefix(root) {
        let rel_str = rel_path.to_string_lossy();
        if EXCLUDED_FILES.iter().any(|excluded| rel_str == *excluded) {
            return false;
        }

        for component in rel_path.components() {
            if let Some(name) = component.as_os_str().to_str() {
                if EXCLUDED_DIRS.contains(&name) {
                    return false;
                }
            }
        }
    }

    true
}

fn count_lines(path: &Path) -> std::io::Result<usize> {
    let content = std::fs::read_to_string(path)?;
    Ok(content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .count())
}

fn enforce_no_dead_code_allows(root: &Path, rust_files: &[PathBuf]) {
    let mut violations: Violations = Vec::new();

    for file in rust_files {
        if let Ok(content) = std::fs::read_to_string(file) {
            let file_violations: Vec<(usize, String)> = content
                .lines()
                .enumerate()
                .filter(|(_, line)| {
                    let trimmed = line.trim();
                    (trimmed.starts_with("#[allow(") || trimmed.starts_with("#![allow("))
                        && trimmed.contains("dead_code")
                })
                .map(|(line_num, line)| (line_num + 1, line.to_string()))
                .collect();
            if !file_violations.is_empty() {
                let rel_path = file.strip_prefix(root).unwrap_or(file).to_path_buf();
                violations.push((rel_path, file_violations));
            }
        }
    }

    if !violations.is_empty() {
        report(
            "#[allow(dead_code)] IS NOT ALLOWED",
            &violations,
            &[
                "Do NOT use #[allow(dead_code)] to silence warnings.",
                "",
                "Instead:",
                "  - DELETE unused code entirely",
                "  - If the code is for tests, use #[cfg(test)]",
                "  - If the code is a public API, make it actually public",
            ],
        );
        panic!(
            "Build failed: {} #[allow(dead_code)] occurrence(s) found. Remove the dead code.",
            count(&violations)
        );
    }
}

/// Bans tests that silently skip instead of failing.
///
/// A test that cannot run must FAIL, not pass quietly.
fn enforce_no_test_skips(root: &Path, rust_files: &[PathBuf]) {
    let skip_patterns = [
        "Skipping test",
        "skipping test",
        "Test skipped",
        "test skipped",
        "not installed, skipping",
    ];

    let mut violations: Violations = Vec::new();

    for file in rust_files {
        let Ok(content) = std::fs::read_to_string(file) else {
            continue;
        };
        let mut file_violations = Vec::new();
        for test in test_functions(&content) {
            if let Some(pattern) = skip_patterns
                .iter()
                .find(|pattern| test.lines.iter().any(|line| line.contains(*pattern)))
            {
                file_violations.push((
                    test.start,
                    format!("test `{}` contains skip pattern: {}", test.name, pattern),
                ));
            } else if test.has_nested_return {
                file_violations.push((
                    test.start,
                    format!("test `{}` has conditional early return (silent skip)", test.name),
                ));
            }
        }
        if !file_violations.is_empty() {
            let rel_path = file.strip_prefix(root).unwrap_or(file).to_path_buf();
            violations.push((rel_path, file_violations));
        }
    }

    if !violations.is_empty() {
        report(
            "SILENT TEST SKIPS ARE NOT ALLOWED",
            &violations,
            &[
                "Tests must FAIL if they cannot run, not silently pass.",
                "",
                "Instead of skipping:",
                "  - Use assert!() to verify preconditions",
                "  - If truly optional, use #[ignore] with a reason",
            ],
        );
        panic!(
            "Build failed: {} silent test skip(s) found. Make tests fail instead of skip.",
            count(&violations)
        );
    }
}

fn enforce_serial_for_env_mutations(root: &Path, rust_files: &[PathBuf]) {
    let mut violations: Violations = Vec::new();

    for file in rust_files {
        let Ok(content) = std::fs::read_to_string(file) else {
            continue;
        };
        let file_violations: Vec<(usize, String)> = test_functions(&content)
            .into_iter()
            .filter(|test| !test.has_serial)
            .filter(|test| {
                test.lines.iter().any(|line| {
                    let trimmed = line.trim();
                    !trimmed.starts_with("//")
                        && (trimmed.contains("env::set_var") || trimmed.contains("env::remove_var"))
                })
            })
            .map(|test| {
                (
                    test.start,
                    format!("test `{}` mutates env without #[serial]", test.name),
                )
            })
            .collect();
        if !file_violations.is_empty() {
            let rel_path = file.strip_prefix(root).unwrap_or(file).to_path_buf();
            violations.push((rel_path, file_violations));
        }
    }

    if !violations.is_empty() {
        report(
            "ENV MUTATIONS REQUIRE #[serial]",
            &violations,
            &[
                "Tests that call std::env::set_var or std::env::remove_var",
                "modify global state and cause flaky failures in parallel.",
                "",
                "Add #[serial] from the serial_test crate.",
            ],
        );
        panic!(
            "Build failed: {} test(s) mutate env vars without #[serial].",
            count(&violations)
        );
    }
}

struct TestFn<'a> {
    name: String,
    start: usize,
    has_serial: bool,
    has_nested_return: bool,
    lines: Vec<&'a str>,
}

/// Finds `#[test]`/`#[tokio::test]` functions by brace counting.
fn test_functions(content: &str) -> Vec<TestFn<'_>> {
    let lines: Vec<&str> = content.lines().collect();
    let mut tests = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        let trimmed = lines[i].trim();
        if trimmed != "#[test]" && !trimmed.starts_with("#[tokio::test") {
            i += 1;
            continue;
        }

        let start = i + 1;
        let mut has_serial = i > 0 && is_serial_attr(lines[i - 1]);
        let mut j = i + 1;
        while j < lines.len() && !lines[j].contains("fn ") {
            has_serial |= is_serial_attr(lines[j]);
            j += 1;
        }
        let Some(header) = lines.get(j) else {
            break;
        };
        let name = header
            .find("fn ")
            .map(|pos| &header[pos + 3..])
            .and_then(|rest| rest.find('(').map(|paren| rest[..paren].trim().to_string()))
            .unwrap_or_default();

        let mut depth = 0i32;
        let mut opened = false;
        let mut has_nested_return = false;
        let mut body = Vec::new();
        while j < lines.len() {
            let line = lines[j];
            body.push(line);
            if line.trim() == "return;" && depth > 1 {
                has_nested_return = true;
            }
            for c in line.chars() {
                match c {
                    '{' => {
                        depth += 1;
                        opened = true;
                    }
                    '}' => depth -= 1,
                    _ => {}
                }
            }
            j += 1;
            if opened && depth == 0 {
                break;
            }
        }

        tests.push(TestFn {
            name,
            start,
            has_serial,
            has_nested_return,
            lines: body,
        });
        i = j;
    }
    tests
}

fn is_serial_attr(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed == "#[serial]" || trimmed == "#[serial_test::serial]"
}

fn count(violations: &Violations) -> usize {
    violations.iter().map(|(_, v)| v.len()).sum()
}

fn report(title: &str, violations: &Violations, advice: &[&str]) {
    eprintln!("\n========================================");
    eprintln!("{}", title);
    eprintln!("========================================");
    eprintln!();
    for (path, lines) in violations {
        for (line_num, message) in lines {
            eprintln!("  {}:{}", path.display(), line_num);
            eprintln!("    {}", message.trim());
            eprintln!();
        }
    }
    eprintln!("========================================");
    eprintln!();
    for line in advice {
        eprintln!("{}", line);
    }
    eprintln!();
    eprintln!("========================================\n");
}
