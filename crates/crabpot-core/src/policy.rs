//! Deterministic egress policy engine: allowlist/blocklist/session sets,
//! audit trail, and plain-text persistence.

use crate::model::{AuditEntry, Decision, Pattern};
use crate::paths::CrabpotPaths;
use crate::scanner;
use std::collections::{HashSet, VecDeque};
use std::fs;
use std::io::Write as _;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Built-in blocklist seeded ahead of any file-sourced entries, in this
/// exact order. Tunnel/webhook/paste services commonly abused for
/// exfiltration.
pub const DEFAULT_BLOCKLIST: &[&str] = &[
    "*.ngrok.io",
    "*.ngrok-free.app",
    "*.requestbin.com",
    "*.pipedream.net",
    "webhook.site",
    "*.burpcollaborator.net",
    "*.oastify.com",
    "*.interact.sh",
    "*.canarytokens.com",
    "pastebin.com",
    "hastebin.com",
    "*.requestcatcher.com",
    "*.hookbin.com",
];

const AUDIT_LOG_CAP: usize = 5000;
const AUDIT_LOG_TRIM_TO: usize = 2500;

struct PolicyState {
    allowed: Vec<Pattern>,
    blocked: Vec<Pattern>,
    session_approved: HashSet<String>,
    session_denied: HashSet<String>,
    audit_log: VecDeque<AuditEntry>,
}

/// Evaluates a domain against allowlist/blocklist/session sets, persists
/// the allowlist, and records an audit trail.
///
/// All state lives behind one lock (`spec.md` §5: "PolicyEngine owns one
/// lock covering all its sets and the audit log").
pub struct PolicyEngine {
    state: Mutex<PolicyState>,
    policy_file: std::path::PathBuf,
}

impl PolicyEngine {
    /// Load from `paths.egress_policy_file()`. A missing file is not an
    /// error: it yields an empty allowlist with the built-in blocklist
    /// still active.
    #[must_use]
    pub fn new(paths: &CrabpotPaths) -> Self {
        let policy_file = paths.egress_policy_file();
        let (allowed, extra_blocked) = load_policy_file(&policy_file);
        let mut blocked: Vec<Pattern> = DEFAULT_BLOCKLIST.iter().map(|s| Pattern::parse(s)).collect();
        blocked.extend(extra_blocked);
        Self {
            state: Mutex::new(PolicyState {
                allowed,
                blocked,
                session_approved: HashSet::new(),
                session_denied: HashSet::new(),
                audit_log: VecDeque::new(),
            }),
            policy_file,
        }
    }

    /// Construct directly from an in-memory policy file path without
    /// requiring `CrabpotPaths`. Used by tests and the gate/proxy test
    /// doubles.
    #[must_use]
    pub fn at_path(policy_file: impl Into<std::path::PathBuf>) -> Self {
        let policy_file = policy_file.into();
        let (allowed, extra_blocked) = load_policy_file(&policy_file);
        let mut blocked: Vec<Pattern> = DEFAULT_BLOCKLIST.iter().map(|s| Pattern::parse(s)).collect();
        blocked.extend(extra_blocked);
        Self {
            state: Mutex::new(PolicyState {
                allowed,
                blocked,
                session_approved: HashSet::new(),
                session_denied: HashSet::new(),
                audit_log: VecDeque::new(),
            }),
            policy_file,
        }
    }

    /// Evaluate `domain` against blocked > session-denied > allowed >
    /// session-approved > unknown (pending), in that fixed precedence.
    pub fn check_domain(&self, domain: &str) -> Decision {
        let domain = domain.to_lowercase();
        let state = self.state.lock().expect("policy lock poisoned");
        if state.blocked.iter().any(|p| p.matches(&domain)) {
            return Decision::Deny;
        }
        if state.session_denied.contains(&domain) {
            return Decision::Deny;
        }
        if state.allowed.iter().any(|p| p.matches(&domain)) {
            return Decision::Allow;
        }
        if state.session_approved.contains(&domain) {
            return Decision::Allow;
        }
        Decision::Pending
    }

    /// Add `domain` to the in-memory session-approved set, removing it
    /// from session-denied.
    pub fn session_approve(&self, domain: &str) {
        let domain = domain.to_lowercase();
        let mut state = self.state.lock().expect("policy lock poisoned");
        state.session_denied.remove(&domain);
        state.session_approved.insert(domain);
    }

    /// Add `domain` to the in-memory session-denied set, removing it from
    /// session-approved.
    pub fn session_deny(&self, domain: &str) {
        let domain = domain.to_lowercase();
        let mut state = self.state.lock().expect("policy lock poisoned");
        state.session_approved.remove(&domain);
        state.session_denied.insert(domain);
    }

    /// Add `domain` to the persisted allowlist; mutate under lock, then
    /// persist outside it.
    pub fn add_permanent(&self, domain: &str) {
        let domain = domain.to_lowercase();
        let snapshot = {
            let mut state = self.state.lock().expect("policy lock poisoned");
            if !state.allowed.iter().any(|p| p.matches(&domain)) {
                state.allowed.push(Pattern::Exact(domain));
            }
            snapshot_for_save(&state)
        };
        self.save(&snapshot);
    }

    /// Remove `domain` from the persisted allowlist (exact-match entries
    /// only); mutate under lock, then persist outside it.
    pub fn remove_permanent(&self, domain: &str) {
        let domain = domain.to_lowercase();
        let snapshot = {
            let mut state = self.state.lock().expect("policy lock poisoned");
            state.allowed.retain(|p| p.to_source() != domain);
            snapshot_for_save(&state)
        };
        self.save(&snapshot);
    }

    /// Append an audit entry; trims to the most recent 2500 once the log
    /// would exceed 5000.
    pub fn log_attempt(&self, domain: &str, port: u16, method: &str, decision: &str) {
        let entry = AuditEntry {
            timestamp: now_unix(),
            domain: domain.to_lowercase(),
            port,
            method: method.to_string(),
            decision: decision.to_string(),
        };
        let mut state = self.state.lock().expect("policy lock poisoned");
        state.audit_log.push_back(entry);
        if state.audit_log.len() > AUDIT_LOG_CAP {
            let excess = state.audit_log.len() - AUDIT_LOG_TRIM_TO;
            for _ in 0..excess {
                state.audit_log.pop_front();
            }
        }
    }

    /// Snapshot of the persisted allowlist, in insertion order.
    #[must_use]
    pub fn get_allowlist(&self) -> Vec<String> {
        let state = self.state.lock().expect("policy lock poisoned");
        state.allowed.iter().map(Pattern::to_source).collect()
    }

    /// Snapshot of the in-memory session-approved set.
    #[must_use]
    pub fn get_session_approved(&self) -> Vec<String> {
        let state = self.state.lock().expect("policy lock poisoned");
        state.session_approved.iter().cloned().collect()
    }

    /// Last `last` audit entries, oldest first.
    #[must_use]
    pub fn get_audit_log(&self, last: usize) -> Vec<AuditEntry> {
        let state = self.state.lock().expect("policy lock poisoned");
        let len = state.audit_log.len();
        let skip = len.saturating_sub(last);
        state.audit_log.iter().skip(skip).cloned().collect()
    }

    /// Delegate to the stateless scanner.
    #[must_use]
    pub fn scan_for_secrets(content: &str) -> Vec<String> {
        scanner::scan(content)
    }

    fn save(&self, snapshot: &PolicySnapshot) {
        let mut out = String::new();
        out.push_str("# CrabPot Egress Allowlist\n");
        out.push_str("# Managed by crabpot policy commands\n");
        for entry in &snapshot.allowed {
            out.push_str(entry);
            out.push('\n');
        }
        out.push('\n');
        for entry in &snapshot.non_default_blocked {
            out.push('!');
            out.push_str(entry);
            out.push('\n');
        }
        if let Some(parent) = self.policy_file.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                tracing::warn!(error = %e, "failed to create policy file parent dir");
                return;
            }
        }
        match fs::File::create(&self.policy_file) {
            Ok(mut f) => {
                if let Err(e) = f.write_all(out.as_bytes()) {
                    tracing::warn!(error = %e, "failed to write policy file");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to create policy file"),
        }
    }
}

struct PolicySnapshot {
    allowed: Vec<String>,
    non_default_blocked: Vec<String>,
}

fn snapshot_for_save(state: &PolicyState) -> PolicySnapshot {
    let defaults: HashSet<&str> = DEFAULT_BLOCKLIST.iter().copied().collect();
    let non_default_blocked = state
        .blocked
        .iter()
        .map(Pattern::to_source)
        .filter(|s| !defaults.contains(s.as_str()))
        .collect();
    PolicySnapshot { allowed: state.allowed.iter().map(Pattern::to_source).collect(), non_default_blocked }
}

/// Parse the policy file format: `#` comments and blank lines ignored,
/// `!pattern` is a blocklist entry, anything else is an allowlist entry.
fn load_policy_file(path: &std::path::Path) -> (Vec<Pattern>, Vec<Pattern>) {
    let Ok(contents) = fs::read_to_string(path) else {
        tracing::warn!(path = ?path, "egress policy file not found; starting with empty allowlist");
        return (Vec::new(), Vec::new());
    };
    let mut allowed = Vec::new();
    let mut blocked = Vec::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(blocked_pattern) = line.strip_prefix('!') {
            blocked.push(Pattern::parse(blocked_pattern));
        } else {
            allowed.push(Pattern::parse(line));
        }
    }
    (allowed, blocked)
}

fn now_unix() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn engine_at_empty_file() -> (PolicyEngine, NamedTempFile) {
        let tmp = NamedTempFile::new().unwrap();
        let engine = PolicyEngine::at_path(tmp.path());
        (engine, tmp)
    }

    #[test]
    fn missing_file_yields_empty_allowlist_with_blocklist_active() {
        let engine = PolicyEngine::at_path("/nonexistent/path/egress-allowlist.txt");
        assert!(engine.get_allowlist().is_empty());
        assert_eq!(engine.check_domain("webhook.site"), Decision::Deny);
    }

    #[test]
    fn unknown_domain_is_pending() {
        let (engine, _tmp) = engine_at_empty_file();
        assert_eq!(engine.check_domain("example.com"), Decision::Pending);
    }

    #[test]
    fn blocklist_supremacy_over_session_approve() {
        let (engine, _tmp) = engine_at_empty_file();
        engine.session_approve("evil.ngrok.io");
        assert_eq!(engine.check_domain("evil.ngrok.io"), Decision::Deny);
    }

    #[test]
    fn session_deny_is_sticky_until_explicit_approve() {
        let (engine, _tmp) = engine_at_empty_file();
        engine.session_deny("example.com");
        assert_eq!(engine.check_domain("example.com"), Decision::Deny);
        assert_eq!(engine.check_domain("example.com"), Decision::Deny);
        engine.session_approve("example.com");
        assert_eq!(engine.check_domain("example.com"), Decision::Allow);
    }

    #[test]
    fn add_permanent_persists_and_survives_reload() {
        let tmp = NamedTempFile::new().unwrap();
        let path = tmp.path().to_path_buf();
        let engine = PolicyEngine::at_path(&path);
        engine.add_permanent("api.openai.com");
        assert_eq!(engine.check_domain("api.openai.com"), Decision::Allow);

        let reloaded = PolicyEngine::at_path(&path);
        assert_eq!(reloaded.check_domain("api.openai.com"), Decision::Allow);
        assert!(reloaded.get_allowlist().contains(&"api.openai.com".to_string()));
    }

    #[test]
    fn wildcard_allowlist_matches_subdomains() {
        let tmp = NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), "*.anthropic.com\n").unwrap();
        let engine = PolicyEngine::at_path(tmp.path());
        assert_eq!(engine.check_domain("sub.anthropic.com"), Decision::Allow);
        assert_eq!(engine.check_domain("anthropic.com"), Decision::Allow);
        assert_eq!(engine.check_domain("evil.com"), Decision::Pending);
    }

    #[test]
    fn audit_log_trims_past_cap() {
        let (engine, _tmp) = engine_at_empty_file();
        for i in 0..(AUDIT_LOG_CAP + 10) {
            engine.log_attempt(&format!("d{i}.com"), 443, "CONNECT", "allow");
        }
        let all = engine.get_audit_log(usize::MAX);
        assert!(all.len() <= AUDIT_LOG_TRIM_TO + 1);
    }

    #[test]
    fn comment_and_blank_lines_are_ignored() {
        let tmp = NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), "# a comment\n\napi.openai.com\n").unwrap();
        let engine = PolicyEngine::at_path(tmp.path());
        assert_eq!(engine.get_allowlist(), vec!["api.openai.com".to_string()]);
    }
}
