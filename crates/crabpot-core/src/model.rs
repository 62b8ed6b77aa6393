//! Shared data types: `Decision`, `Pattern`, `AuditEntry`, `Alert`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome of evaluating a domain against the policy engine.
///
/// `Pending` is never persisted; it only escapes the engine to drive
/// `ActionGate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Permit the request.
    Allow,
    /// Block the request.
    Deny,
    /// Unknown domain; escalate to human approval.
    Pending,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Decision::Allow => "allow",
            Decision::Deny => "deny",
            Decision::Pending => "pending",
        };
        f.write_str(s)
    }
}

/// A domain-matching rule loaded from (or about to be written to) the
/// egress policy file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pattern {
    /// Matches exactly one domain.
    Exact(String),
    /// `*.suffix` — matches `suffix` itself and any strict subdomain.
    Wildcard(String),
    /// Shell-style glob fallback (contains `*`, `?`, or `[` in a shape that
    /// is not a simple left-wildcard).
    Glob(String),
}

impl Pattern {
    /// Parse a single non-comment, non-blank line from the policy file
    /// (without its leading `!`, if any) into a `Pattern`.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        if let Some(suffix) = raw.strip_prefix("*.") {
            Pattern::Wildcard(suffix.to_string())
        } else if raw.contains('*') || raw.contains('?') || raw.contains('[') {
            Pattern::Glob(raw.to_string())
        } else {
            Pattern::Exact(raw.to_string())
        }
    }

    /// Render back to the textual form used by the policy file.
    #[must_use]
    pub fn to_source(&self) -> String {
        match self {
            Pattern::Exact(s) | Pattern::Glob(s) => s.clone(),
            Pattern::Wildcard(suffix) => format!("*.{suffix}"),
        }
    }

    /// Does this pattern match `domain` (already lowercased)?
    #[must_use]
    pub fn matches(&self, domain: &str) -> bool {
        match self {
            Pattern::Exact(s) => s == domain,
            Pattern::Wildcard(suffix) => {
                domain == suffix || domain.ends_with(&format!(".{suffix}"))
            }
            Pattern::Glob(pat) => glob_match(pat, domain),
        }
    }
}

/// Minimal recursive shell-glob matcher (`*` and `?`) over the domain
/// alphabet; not a filesystem path matcher, so no `/` special-casing.
fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    glob_match_rec(&p, &t)
}

fn glob_match_rec(p: &[char], t: &[char]) -> bool {
    match p.first() {
        None => t.is_empty(),
        Some('*') => glob_match_rec(&p[1..], t) || (!t.is_empty() && glob_match_rec(p, &t[1..])),
        Some('?') => !t.is_empty() && glob_match_rec(&p[1..], &t[1..]),
        Some(c) => t.first() == Some(c) && glob_match_rec(&p[1..], &t[1..]),
    }
}

/// A single audit-log record produced by `PolicyEngine::log_attempt`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Seconds since the Unix epoch.
    pub timestamp: u64,
    /// The domain the request targeted.
    pub domain: String,
    /// The destination port.
    pub port: u16,
    /// HTTP method, or `CONNECT`.
    pub method: String,
    /// One of `allow`, `deny`, `pending`, `allow_after_review`,
    /// `deny_after_review`, `blocked_secrets`.
    pub decision: String,
}

/// Alert severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    /// Informational, no action required.
    Info,
    /// Worth a human's attention.
    Warning,
    /// Requires immediate attention; may trigger auto-pause.
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Critical => "CRITICAL",
        };
        f.write_str(s)
    }
}

/// A single alert emitted by `AlertBus::fire`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    /// Severity tag.
    pub severity: Severity,
    /// Component that raised the alert (e.g. `"policy"`, `"stats"`).
    pub source: String,
    /// Human-readable message. Must never contain scanned secret content.
    pub message: String,
    /// `%H:%M:%S` local-ish short form, for terminal display.
    pub timestamp: String,
    /// RFC3339 full timestamp, for the JSONL log.
    pub timestamp_full: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_pattern_parses() {
        assert_eq!(Pattern::parse("api.openai.com"), Pattern::Exact("api.openai.com".into()));
    }

    #[test]
    fn wildcard_pattern_matches_base_and_subdomain() {
        let p = Pattern::parse("*.anthropic.com");
        assert!(p.matches("anthropic.com"));
        assert!(p.matches("sub.anthropic.com"));
        assert!(!p.matches("evilanthropic.com"));
    }

    #[test]
    fn glob_pattern_falls_back() {
        let p = Pattern::parse("api-?.example.com");
        assert!(p.matches("api-1.example.com"));
        assert!(!p.matches("api-12.example.com"));
    }

    #[test]
    fn decision_display_matches_audit_strings() {
        assert_eq!(Decision::Allow.to_string(), "allow");
        assert_eq!(Decision::Deny.to_string(), "deny");
        assert_eq!(Decision::Pending.to_string(), "pending");
    }
}
