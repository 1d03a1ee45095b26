//! Project scaffolding
//!
//! Housekeeping files written next to a task's materialized sources:
//! a `.gitignore` when the task starts executing and, for Python tasks, a
//! `requirements.txt` listing the third-party modules the accepted artifacts
//! import.

use std::collections::BTreeSet;
use std::path::Path;

use crate::conductor::generator::extract_imports;

pub const GITIGNORE: &str = "\
# Python
__pycache__/
*.py[cod]
*$py.class
*.so
.Python
env/
venv/
ENV/
build/
dist/
*.egg-info/

# IDEs
.vscode/
.idea/
*.swp
*.swo

# OS
.DS_Store
Thumbs.db

# Tests
.pytest_cache/
.coverage
htmlcov/

# Logs
*.log
";

/// Modules that ship with the interpreter and never go in requirements
const STDLIB_MODULES: &[&str] = &[
    "os",
    "sys",
    "json",
    "time",
    "datetime",
    "re",
    "math",
    "random",
    "collections",
    "itertools",
    "functools",
    "pathlib",
    "io",
    "typing",
];

/// Third-party top-level modules imported by a set of artifacts
///
/// Sorted and deduplicated. Relative imports are ignored.
pub fn analyze_dependencies<'a>(artifacts: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut modules = BTreeSet::new();
    for code in artifacts {
        for line in extract_imports(code) {
            for module in imported_modules(&line) {
                if !STDLIB_MODULES.contains(&module.as_str()) {
                    modules.insert(module);
                }
            }
        }
    }
    modules.into_iter().collect()
}

/// Top-level module names of one `import` / `from` line
fn imported_modules(line: &str) -> Vec<String> {
    let top_level = |name: &str| {
        name.split('.')
            .next()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(str::to_string)
    };

    if let Some(rest) = line.strip_prefix("from ") {
        return rest
            .split_whitespace()
            .next()
            .and_then(top_level)
            .into_iter()
            .collect();
    }

    line.strip_prefix("import ")
        .map(|rest| {
            rest.split(',')
                .filter_map(|part| part.split_whitespace().next())
                .filter_map(top_level)
                .collect()
        })
        .unwrap_or_default()
}

/// Write `.gitignore` into the project directory
pub async fn write_gitignore(project_dir: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(project_dir).await?;
    tokio::fs::write(project_dir.join(".gitignore"), GITIGNORE).await
}

/// Write `requirements.txt`, one module per line
///
/// Returns the number of modules listed.
pub async fn write_requirements<'a>(
    project_dir: &Path,
    artifacts: impl IntoIterator<Item = &'a str>,
) -> std::io::Result<usize> {
    let modules = analyze_dependencies(artifacts);
    let mut body = modules.join("\n");
    if !body.is_empty() {
        body.push('\n');
    }
    tokio::fs::create_dir_all(project_dir).await?;
    tokio::fs::write(project_dir.join("requirements.txt"), body).await?;
    Ok(modules.len())
}
