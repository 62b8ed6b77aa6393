//! Error taxonomy for CrabPot's core crate.
//!
//! Only the error classes that actually need to escape a function as a
//! typed value get a variant here. `TransientRuntimeError`,
//! `SecurityDecision`, and `SinkFailure` (see `spec.md` §7) are handled in
//! place by logging and continuing — they never become a `CrabpotError`.
//! Policy file load/save is likewise best-effort (logged, not
//! propagated) by design, so there is no `Configuration` variant here;
//! add one if a future caller needs to react to a bad policy file rather
//! than fall back to an empty allowlist.

use thiserror::Error;

/// Errors surfaced to callers of the core crate.
#[derive(Debug, Error)]
pub enum CrabpotError {
    /// Underlying I/O failure that the caller must react to (as opposed to
    /// a best-effort sink write, which is swallowed at the call site).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// An upstream HTTP failure while forwarding a proxied request.
    #[error("upstream error: {0}")]
    Upstream(String),
}
