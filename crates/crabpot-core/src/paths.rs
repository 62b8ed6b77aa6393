//! Environment contract: where CrabPot reads and writes its two files.

use std::path::PathBuf;

/// Default egress proxy listen port.
pub const DEFAULT_EGRESS_PROXY_PORT: u16 = 9877;

const ENV_HOME: &str = "CRABPOT_HOME";

/// Resolved filesystem layout rooted at `$CRABPOT_HOME` (default `~/.crabpot`).
///
/// The only files the core reads or writes live under this root:
/// `config/egress-allowlist.txt` and `data/alerts.log`.
#[derive(Debug, Clone)]
pub struct CrabpotPaths {
    home: PathBuf,
}

impl CrabpotPaths {
    /// Resolve paths from `$CRABPOT_HOME`, falling back to `~/.crabpot`, and
    /// ensure `config/` and `data/` exist (best-effort).
    #[must_use]
    pub fn from_env() -> Self {
        let home = std::env::var_os(ENV_HOME)
            .map(PathBuf::from)
            .or_else(|| dirs_home().map(|h| h.join(".crabpot")))
            .unwrap_or_else(|| PathBuf::from(".crabpot"));
        let paths = Self { home };
        if let Err(e) = std::fs::create_dir_all(paths.config_dir()) {
            tracing::warn!(error = %e, dir = ?paths.config_dir(), "failed to create config dir");
        }
        if let Err(e) = std::fs::create_dir_all(paths.data_dir()) {
            tracing::warn!(error = %e, dir = ?paths.data_dir(), "failed to create data dir");
        }
        paths
    }

    /// Construct directly from a root path, without touching the environment
    /// or the filesystem. Used by tests.
    #[must_use]
    pub fn at(home: impl Into<PathBuf>) -> Self {
        Self { home: home.into() }
    }

    /// Root data directory.
    #[must_use]
    pub fn home(&self) -> &std::path::Path {
        &self.home
    }

    /// `<home>/config`
    #[must_use]
    pub fn config_dir(&self) -> PathBuf {
        self.home.join("config")
    }

    /// `<home>/data`
    #[must_use]
    pub fn data_dir(&self) -> PathBuf {
        self.home.join("data")
    }

    /// `<home>/config/egress-allowlist.txt`
    #[must_use]
    pub fn egress_policy_file(&self) -> PathBuf {
        self.config_dir().join("egress-allowlist.txt")
    }

    /// `<home>/data/alerts.log`
    #[must_use]
    pub fn alerts_log(&self) -> PathBuf {
        self.data_dir().join("alerts.log")
    }
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_are_rooted_under_home() {
        let p = CrabpotPaths::at("/tmp/crabpot-test-home");
        assert_eq!(p.egress_policy_file(), PathBuf::from("/tmp/crabpot-test-home/config/egress-allowlist.txt"));
        assert_eq!(p.alerts_log(), PathBuf::from("/tmp/crabpot-test-home/data/alerts.log"));
    }
}
