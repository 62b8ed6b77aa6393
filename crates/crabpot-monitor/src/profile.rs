//! The boolean feature-flag record the monitor consumes to decide which
//! watchers to spawn. The preset name table (`minimal`/`standard`/
//! `paranoid`) and the merge logic that resolves overrides into one of
//! these records are out of scope — only the record shape is in scope.

/// Boolean feature flags for every security layer. `Default` matches the
/// `standard` preset of the external resolution table this monitor is
/// designed to be fed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecurityProfile {
    /// Mount the container root filesystem read-only.
    pub read_only_rootfs: bool,
    /// Drop all Linux capabilities before exec.
    pub drop_all_caps: bool,
    /// Apply a seccomp profile.
    pub seccomp_profile: bool,
    /// Set `no-new-privileges`.
    pub no_new_privileges: bool,
    /// Enforce CPU/memory/pid resource limits. Gates the `stats` watcher.
    pub resource_limits: bool,
    /// Enforce a pid limit.
    pub pid_limit: bool,
    /// Route all egress through `EgressProxy`.
    pub egress_proxy: bool,
    /// Run the secret scanner over plaintext HTTP bodies.
    pub secret_scanner: bool,
    /// Gates the `processes` watcher.
    pub process_watchdog: bool,
    /// Gates the `logs` watcher.
    pub log_scanner: bool,
    /// Gates the `network` watcher.
    pub network_auditor: bool,
    /// Use a hardened base image.
    pub hardened_image: bool,
    /// Gates the auto-pause reflex on CRITICAL conditions.
    pub auto_pause_on_critical: bool,
}

impl Default for SecurityProfile {
    fn default() -> Self {
        Self {
            read_only_rootfs: true,
            drop_all_caps: true,
            seccomp_profile: true,
            no_new_privileges: true,
            resource_limits: true,
            pid_limit: true,
            egress_proxy: true,
            secret_scanner: true,
            process_watchdog: false,
            log_scanner: true,
            network_auditor: false,
            hardened_image: false,
            auto_pause_on_critical: true,
        }
    }
}

/// Resource constraint values. Carried for interface completeness with
/// the `Runtime`'s `Stats` type (which reports percentages already
/// normalised against these limits); no watcher logic consumes this
/// struct directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceProfile {
    /// CPU core count limit, e.g. `"2"`.
    pub cpu_limit: String,
    /// Memory limit, e.g. `"2g"`.
    pub memory_limit: String,
    /// Max process count inside the container.
    pub pids_limit: u32,
}

impl Default for ResourceProfile {
    fn default() -> Self {
        Self { cpu_limit: "2".to_string(), memory_limit: "2g".to_string(), pids_limit: 200 }
    }
}
