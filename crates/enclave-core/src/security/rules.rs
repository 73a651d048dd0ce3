//! Escape-pattern rules: an ordered list of `(matcher, severity)` pairs.

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{EnclaveError, EnclaveResult};

/// Ordered from least to most severe, so `max()` picks the worst match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct EscapeRule {
    pub label: String,
    pub severity: Severity,
    regex: Regex,
}

impl EscapeRule {
    pub fn new(label: impl Into<String>, pattern: &str, severity: Severity) -> EnclaveResult<Self> {
        let label = label.into();
        let regex = Regex::new(pattern).map_err(|e| {
            EnclaveError::InvalidConfig(format!("escape rule {label}: {e}"))
        })?;
        Ok(Self {
            label,
            severity,
            regex,
        })
    }

    pub fn is_match(&self, code: &str) -> bool {
        self.regex.is_match(code)
    }
}

/// Outcome of scanning one piece of code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Detection {
    pub detected: bool,
    /// Labels of every rule that matched, in rule order.
    pub matched_patterns: Vec<String>,
    /// Highest severity among the matches.
    pub severity: Option<Severity>,
}

const STANDARD_RULES: &[(&str, &str, Severity)] = &[
    // Dynamic execution
    ("eval", r"\beval\s*\(", Severity::Critical),
    ("exec", r"\bexec\s*\(", Severity::Critical),
    ("new Function", r"\bnew\s+Function\s*\(", Severity::Critical),
    ("__import__", r"__import__\s*\(", Severity::Critical),
    ("Function", r"\bFunction\s*\(", Severity::Critical),
    ("__builtins__", r"\b__builtins__\b|\bimport\s+builtins\b", Severity::Critical),
    ("importlib", r"\bimportlib\b", Severity::Critical),
    // Bare `compile(`, not a method such as `re.compile(`.
    ("compile", r"(?:^|[^.\w])compile\s*\(", Severity::High),
    // Process / OS escape
    ("os.system", r"\bos\.system\s*\(", Severity::Critical),
    ("os.exec", r"\bos\.(popen|fork|exec\w*|spawn\w*)\s*\(", Severity::Critical),
    ("os import", r"\bfrom\s+os\s+import\b|\bimport\s+os\b", Severity::High),
    ("pty", r"\bpty\b", Severity::High),
    ("subprocess", r"\bsubprocess\b", Severity::Critical),
    ("child_process", r"\bchild_process\b", Severity::Critical),
    ("ctypes", r"\bctypes\b", Severity::High),
    ("ptrace", r"\bptrace\b", Severity::High),
    ("/proc/self", r"/proc/self\b", Severity::High),
    // Raw network access
    ("socket", r"\bsocket\b", Severity::High),
    ("node net", r#"require\(\s*['"](net|dgram|tls)['"]\s*\)"#, Severity::High),
    ("metadata endpoint", r"169\.254\.169\.254", Severity::High),
    (
        "http client import",
        r"\b(import|from)\s+(urllib|requests|httpx)\b",
        Severity::Medium,
    ),
    // Loopback targeting
    (
        "loopback",
        r"\b127\.0\.0\.1\b|\blocalhost\b|\b0\.0\.0\.0\b|\[::1\]",
        Severity::Medium,
    ),
];

#[derive(Debug, Clone, Default)]
pub struct EscapeRuleSet {
    rules: Vec<EscapeRule>,
}

impl EscapeRuleSet {
    pub fn empty() -> Self {
        Self::default()
    }

    /// The built-in rule list.
    pub fn standard() -> Self {
        let mut set = Self::empty();
        for (label, pattern, severity) in STANDARD_RULES {
            match EscapeRule::new(*label, pattern, *severity) {
                Ok(rule) => set.rules.push(rule),
                Err(e) => warn!(error = %e, "skipping escape rule"),
            }
        }
        set
    }

    pub fn with_rule(mut self, rule: EscapeRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn detect(&self, code: &str) -> Detection {
        let matched: Vec<&EscapeRule> = self.rules.iter().filter(|r| r.is_match(code)).collect();
        Detection {
            detected: !matched.is_empty(),
            severity: matched.iter().map(|r| r.severity).max(),
            matched_patterns: matched.into_iter().map(|r| r.label.clone()).collect(),
        }
    }
}
