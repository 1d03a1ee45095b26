//! Static safety policy for generated artifacts
//!
//! Every artifact is scanned before it reaches the executor. A match ends the
//! step: violations are never sent to the repair loop.
//!
//! Rules come from three places:
//! - `safety.restricted_imports`: operation names from config
//! - a fixed set of destructive filesystem operations
//! - `safety.max_file_operations`: a quota on file opens and directory creation
//!
//! The scan is a pure function of the artifact text. Comment lines are not
//! skipped.

use regex::Regex;
use std::fmt;

use crate::config::SafetyConfig;

/// Destructive operations that are always refused
const DANGEROUS_PATTERNS: &[(&str, &str)] = &[
    ("rm -rf", r"\brm\s+-(?:rf|fr|Rf|fR|r\s+-f|f\s+-r)\b"),
    ("shutil.rmtree", r"\bshutil\s*\.\s*rmtree\b"),
    ("os.remove", r"\bos\s*\.\s*remove\b"),
    ("os.unlink", r"\bos\s*\.\s*unlink\b"),
];

/// Operations counted against the file quota
const FILE_OPERATION_PATTERN: &str =
    r"\bos\s*\.\s*(?:open|makedirs|mkdir)\s*\(|\.(?:write|read)_(?:text|bytes)\s*\(|\bopen\s*\(";

/// Result of scanning one artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SafetyVerdict {
    Pass,
    Violation(SafetyViolation),
}

impl SafetyVerdict {
    pub fn is_pass(&self) -> bool {
        matches!(self, SafetyVerdict::Pass)
    }
}

/// First rule an artifact broke
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafetyViolation {
    /// Restricted name or built-in rule id
    pub rule: String,
    /// Offending text
    pub matched: String,
    /// 1-based line number
    pub line: usize,
}

impl fmt::Display for SafetyViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rule '{}' matched '{}' on line {}",
            self.rule, self.matched, self.line
        )
    }
}

struct Rule {
    name: String,
    pattern: Regex,
}

pub struct SafetyPolicy {
    rules: Vec<Rule>,
    file_operations: Regex,
    max_file_operations: usize,
}

impl SafetyPolicy {
    /// Compile the policy from config
    ///
    /// # Errors
    ///
    /// Returns an error if a restricted name produces an invalid pattern.
    pub fn from_config(config: &SafetyConfig) -> anyhow::Result<Self> {
        let mut rules = Vec::new();

        for name in &config.restricted_imports {
            let name = name.trim().trim_end_matches('(').trim();
            if name.is_empty() {
                continue;
            }
            rules.push(Rule {
                name: name.to_string(),
                pattern: Regex::new(&restricted_name_pattern(name))?,
            });
        }

        for (name, pattern) in DANGEROUS_PATTERNS {
            rules.push(Rule {
                name: name.to_string(),
                pattern: Regex::new(pattern)?,
            });
        }

        Ok(Self {
            rules,
            file_operations: Regex::new(FILE_OPERATION_PATTERN)?,
            max_file_operations: config.max_file_operations,
        })
    }

    /// Scan an artifact
    ///
    /// Lines are scanned top to bottom, so the reported violation is the
    /// earliest one. The file quota is checked after the rule scan.
    pub fn check(&self, artifact: &str) -> SafetyVerdict {
        for (index, line) in artifact.lines().enumerate() {
            for rule in &self.rules {
                if let Some(m) = rule.pattern.find(line) {
                    tracing::warn!(
                        "Safety rule '{}' matched on line {}: {}",
                        rule.name,
                        index + 1,
                        m.as_str()
                    );
                    return SafetyVerdict::Violation(SafetyViolation {
                        rule: rule.name.clone(),
                        matched: m.as_str().trim().to_string(),
                        line: index + 1,
                    });
                }
            }
        }

        let mut count = 0usize;
        for (index, line) in artifact.lines().enumerate() {
            for m in self.file_operations.find_iter(line) {
                count += 1;
                if count > self.max_file_operations {
                    return SafetyVerdict::Violation(SafetyViolation {
                        rule: "max_file_operations".to_string(),
                        matched: format!(
                            "{} (more than {} file operations)",
                            m.as_str().trim(),
                            self.max_file_operations
                        ),
                        line: index + 1,
                    });
                }
            }
        }

        SafetyVerdict::Pass
    }

    /// Names of every active rule, for diagnostics
    pub fn rule_names(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.name.as_str()).collect()
    }
}

/// Regex for one restricted name
///
/// A dotted name such as `os.system` matches attribute access and
/// `from os import system`. A bare name such as `subprocess` or `eval`
/// matches imports of it, attribute access on it and calls to it.
fn restricted_name_pattern(name: &str) -> String {
    match name.rsplit_once('.') {
        Some((module, attr)) => {
            let dotted = name
                .split('.')
                .map(regex::escape)
                .collect::<Vec<_>>()
                .join(r"\s*\.\s*");
            format!(
                r"\b{dotted}\b|^\s*from\s+{module}\s+import\s+(?:.*[\s,(])?{attr}\b",
                dotted = dotted,
                module = regex::escape(module),
                attr = regex::escape(attr),
            )
        }
        None => {
            let n = regex::escape(name);
            format!(
                r"^\s*import\s+(?:[\w.]+\s*,\s*)*{n}\b|^\s*from\s+{n}\b|\b{n}\s*\.\s*\w|\b{n}\s*\(",
                n = n
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> SafetyPolicy {
        SafetyPolicy::from_config(&SafetyConfig::default()).unwrap()
    }

    fn rule_of(verdict: SafetyVerdict) -> String {
        match verdict {
            SafetyVerdict::Violation(v) => v.rule,
            SafetyVerdict::Pass => panic!("expected a violation"),
        }
    }

    #[test]
    fn test_clean_code_passes() {
        let code = "import math\n\nprint(math.sqrt(16))\n";
        assert_eq!(policy().check(code), SafetyVerdict::Pass);
    }

    #[test]
    fn test_restricted_module_forms() {
        let policy = policy();
        for code in [
            "import subprocess",
            "import os, subprocess",
            "from subprocess import run",
            "x = subprocess.run(['ls'])",
        ] {
            assert_eq!(rule_of(policy.check(code)), "subprocess", "{}", code);
        }
    }

    #[test]
    fn test_restricted_calls() {
        let policy = policy();
        assert_eq!(rule_of(policy.check("print(eval('1+1'))")), "eval");
        assert_eq!(rule_of(policy.check("os.system('ls')")), "os.system");
        assert_eq!(
            rule_of(policy.check("from os import path, system")),
            "os.system"
        );
        assert_eq!(rule_of(policy.check("m = __import__('os')")), "__import__");
        // Names that only contain a restricted word are fine
        assert!(policy.check("import ast\nast.literal_eval('1')").is_pass());
        assert!(policy.check("evaluate(3)").is_pass());
    }

    #[test]
    fn test_comments_are_scanned() {
        let verdict = policy().check("print(1)\n# os.system('rm')\n");
        match verdict {
            SafetyVerdict::Violation(v) => assert_eq!(v.line, 2),
            SafetyVerdict::Pass => panic!("comment was not scanned"),
        }
    }

    #[test]
    fn test_dangerous_patterns_always_apply() {
        let config = SafetyConfig {
            restricted_imports: vec![],
            ..SafetyConfig::default()
        };
        let policy = SafetyPolicy::from_config(&config).unwrap();
        assert_eq!(rule_of(policy.check("rm -rf /tmp/x")), "rm -rf");
        assert_eq!(rule_of(policy.check("shutil.rmtree(path)")), "shutil.rmtree");
        assert_eq!(rule_of(policy.check("os.unlink(p)")), "os.unlink");
    }

    #[test]
    fn test_file_operation_quota() {
        let config = SafetyConfig {
            max_file_operations: 2,
            ..SafetyConfig::default()
        };
        let policy = SafetyPolicy::from_config(&config).unwrap();

        let two = "a = open('a')\nb = Path('b').read_text()\n";
        assert!(policy.check(two).is_pass());

        let three = "a = open('a')\nos.makedirs('d')\nPath('c').write_text('x')\n";
        match policy.check(three) {
            SafetyVerdict::Violation(v) => {
                assert_eq!(v.rule, "max_file_operations");
                assert_eq!(v.line, 3);
            }
            SafetyVerdict::Pass => panic!("quota not enforced"),
        }

        // os.open counts once, not twice
        let os_open = "os.open('a')\nos.open('b')\n";
        assert!(policy.check(os_open).is_pass());
    }

    #[test]
    fn test_empty_names_are_ignored() {
        let config = SafetyConfig {
            restricted_imports: vec!["".to_string(), "  ".to_string(), "exec(".to_string()],
            ..SafetyConfig::default()
        };
        let policy = SafetyPolicy::from_config(&config).unwrap();
        assert_eq!(rule_of(policy.check("exec('x')")), "exec");
        assert_eq!(policy.rule_names().len(), 1 + DANGEROUS_PATTERNS.len());
    }
}
