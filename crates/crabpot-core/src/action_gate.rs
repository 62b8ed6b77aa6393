//! Serialises pending human decisions, coalesces duplicate requests, and
//! blocks callers until decide-or-timeout.

use crate::alerts::AlertBus;
use crate::policy::PolicyEngine;
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Default time a caller waits for a human verdict before the request is
/// treated as denied.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// A single in-flight approval request shared by every caller asking
/// about the same domain at the same time.
struct PendingRequest {
    domain: String,
    port: u16,
    created_at: Instant,
    verdict: Mutex<Option<bool>>,
    condvar: Condvar,
}

impl PendingRequest {
    fn new(domain: String, port: u16) -> Self {
        Self { domain, port, created_at: Instant::now(), verdict: Mutex::new(None), condvar: Condvar::new() }
    }

    /// Set the verdict and wake every waiter. Legal before any `wait`
    /// call; calling twice is a no-op (the verdict already set is kept).
    fn signal(&self, verdict: bool) {
        let mut v = self.verdict.lock().expect("pending-request lock poisoned");
        if v.is_none() {
            *v = Some(verdict);
        }
        self.condvar.notify_all();
    }

    /// Block until a verdict is set or `timeout` elapses.
    fn wait(&self, timeout: Duration) -> Option<bool> {
        let mut guard = self.verdict.lock().expect("pending-request lock poisoned");
        let deadline = Instant::now() + timeout;
        while guard.is_none() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let (next_guard, timeout_result) =
                self.condvar.wait_timeout(guard, remaining).expect("pending-request lock poisoned");
            guard = next_guard;
            if timeout_result.timed_out() && guard.is_none() {
                return None;
            }
        }
        *guard
    }
}

/// One decided-or-timed-out entry in `ActionGate`'s history.
#[derive(Debug, Clone)]
pub struct GateHistoryEntry {
    /// The domain that was requested.
    pub domain: String,
    /// The destination port.
    pub port: u16,
    /// `true` if approved, `false` if denied or timed out.
    pub approved: bool,
    /// Seconds since the Unix epoch when the request resolved.
    pub timestamp: u64,
}

/// A snapshot-friendly view of a still-pending request.
#[derive(Debug, Clone)]
pub struct PendingSnapshot {
    /// The domain awaiting a verdict.
    pub domain: String,
    /// The destination port.
    pub port: u16,
    /// How long the request has been pending.
    pub age: Duration,
}

struct GateState {
    pending: HashMap<String, Arc<PendingRequest>>,
    history: Vec<GateHistoryEntry>,
}

/// Serialises human approval decisions for domains the policy engine
/// returned `Pending` for.
pub struct ActionGate {
    state: Mutex<GateState>,
    timeout: Duration,
    bus: Arc<AlertBus>,
}

impl ActionGate {
    /// Construct a gate with the default 60s timeout.
    #[must_use]
    pub fn new(bus: Arc<AlertBus>) -> Self {
        Self::with_timeout(bus, DEFAULT_TIMEOUT)
    }

    /// Construct a gate with a custom timeout (used heavily by tests).
    #[must_use]
    pub fn with_timeout(bus: Arc<AlertBus>, timeout: Duration) -> Self {
        Self { state: Mutex::new(GateState { pending: HashMap::new(), history: Vec::new() }), timeout, bus }
    }

    /// Request human approval for `domain`. Coalesces with any in-flight
    /// request for the same domain. Blocks the calling thread for up to
    /// the configured timeout. Returns `true` iff the verdict was
    /// approval; a timeout counts as denial.
    pub fn request_approval(&self, domain: &str, port: u16) -> bool {
        let (request, is_new) = {
            let mut state = self.state.lock().expect("gate lock poisoned");
            if let Some(existing) = state.pending.get(domain) {
                (Arc::clone(existing), false)
            } else {
                let request = Arc::new(PendingRequest::new(domain.to_string(), port));
                state.pending.insert(domain.to_string(), Arc::clone(&request));
                (request, true)
            }
        };

        if is_new {
            self.bus.fire(
                crate::model::Severity::Warning,
                "gate",
                &format!("approval needed for {domain}:{port}"),
            );
        }

        let verdict = request.wait(self.timeout).unwrap_or(false);

        let mut state = self.state.lock().expect("gate lock poisoned");
        state.pending.remove(domain);
        state.history.push(GateHistoryEntry {
            domain: domain.to_string(),
            port,
            approved: verdict,
            timestamp: now_unix(),
        });
        drop(state);

        if verdict {
            self.bus.fire(crate::model::Severity::Info, "gate", &format!("{domain} approved"));
        } else {
            self.bus.fire(crate::model::Severity::Warning, "gate", &format!("{domain} denied"));
        }
        verdict
    }

    /// Approve `domain`: mutate the policy engine (permanently or for this
    /// session), then signal any live pending request. Returns whether a
    /// request was live.
    pub fn approve(&self, policy: &PolicyEngine, domain: &str, permanent: bool) -> bool {
        if permanent {
            policy.add_permanent(domain);
        } else {
            policy.session_approve(domain);
        }
        self.signal_pending(domain, true)
    }

    /// Deny `domain` for this session and signal any live pending
    /// request.
    pub fn deny(&self, policy: &PolicyEngine, domain: &str) -> bool {
        policy.session_deny(domain);
        self.signal_pending(domain, false)
    }

    fn signal_pending(&self, domain: &str, verdict: bool) -> bool {
        let state = self.state.lock().expect("gate lock poisoned");
        if let Some(request) = state.pending.get(domain) {
            request.signal(verdict);
            true
        } else {
            false
        }
    }

    /// Snapshot of every domain currently awaiting a verdict.
    #[must_use]
    pub fn get_pending(&self) -> Vec<PendingSnapshot> {
        let state = self.state.lock().expect("gate lock poisoned");
        state
            .pending
            .values()
            .map(|r| PendingSnapshot { domain: r.domain.clone(), port: r.port, age: r.created_at.elapsed() })
            .collect()
    }

    /// Last `last` resolved requests, oldest first.
    #[must_use]
    pub fn get_history(&self, last: usize) -> Vec<GateHistoryEntry> {
        let state = self.state.lock().expect("gate lock poisoned");
        let len = state.history.len();
        let skip = len.saturating_sub(last);
        state.history[skip..].to_vec()
    }
}

fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::CrabpotPaths;
    use std::sync::Barrier;

    fn test_bus() -> Arc<AlertBus> {
        let tmp = tempfile::tempdir().unwrap();
        Arc::new(AlertBus::new(&CrabpotPaths::at(tmp.into_path())))
    }

    #[test]
    fn approval_unblocks_waiter_with_true() {
        let bus = test_bus();
        let gate = Arc::new(ActionGate::with_timeout(bus, Duration::from_secs(5)));
        let policy_tmp = tempfile::NamedTempFile::new().unwrap();
        let policy = Arc::new(PolicyEngine::at_path(policy_tmp.path()));

        let gate2 = Arc::clone(&gate);
        let handle = std::thread::spawn(move || gate2.request_approval("new.com", 443));

        // Give the waiter time to register as pending.
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(gate.get_pending().len(), 1);

        assert!(gate.approve(&policy, "new.com", false));
        assert!(handle.join().unwrap());
    }

    #[test]
    fn timeout_counts_as_deny() {
        let bus = test_bus();
        let gate = ActionGate::with_timeout(bus, Duration::from_millis(100));
        let approved = gate.request_approval("slow.com", 443);
        assert!(!approved);
    }

    #[test]
    fn coalesces_concurrent_requests_for_same_domain() {
        let bus = test_bus();
        let gate = Arc::new(ActionGate::with_timeout(bus, Duration::from_secs(5)));
        let policy_tmp = tempfile::NamedTempFile::new().unwrap();
        let policy = Arc::new(PolicyEngine::at_path(policy_tmp.path()));
        let barrier = Arc::new(Barrier::new(4));

        let mut handles = Vec::new();
        for _ in 0..3 {
            let gate = Arc::clone(&gate);
            let barrier = Arc::clone(&barrier);
            handles.push(std::thread::spawn(move || {
                barrier.wait();
                gate.request_approval("shared.com", 443)
            }));
        }
        barrier.wait();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(gate.get_pending().len(), 1);
        gate.approve(&policy, "shared.com", false);

        for h in handles {
            assert!(h.join().unwrap());
        }
    }

    #[test]
    fn signal_before_wait_is_legal() {
        let request = PendingRequest::new("x.com".into(), 80);
        request.signal(true);
        assert_eq!(request.wait(Duration::from_millis(10)), Some(true));
    }

    #[test]
    fn double_signal_is_a_no_op() {
        let request = PendingRequest::new("x.com".into(), 80);
        request.signal(true);
        request.signal(false);
        assert_eq!(request.wait(Duration::from_millis(10)), Some(true));
    }
}
