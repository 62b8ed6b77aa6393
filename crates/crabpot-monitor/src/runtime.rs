//! The minimal capability CrabPot's core requires of a container/VM
//! runtime. No concrete adaptor ships here — Docker and WSL2 adaptors are
//! out of scope; this module characterises the runtime only through the
//! interface the monitor and proxy call.

/// Lifecycle state of the sandboxed container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    /// Created but never started.
    Created,
    /// Actively running.
    Running,
    /// Running but paused (e.g. via an auto-pause reflex).
    Paused,
    /// Process exited.
    Exited,
    /// No container by that name exists.
    NotFound,
}

/// A point-in-time resource usage snapshot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Stats {
    /// CPU usage, 0-100+ (can exceed 100 on multi-core containers).
    pub cpu_percent: f64,
    /// Resident memory usage in bytes.
    pub memory_usage: u64,
    /// Configured memory limit in bytes.
    pub memory_limit: u64,
    /// `memory_usage / memory_limit * 100`.
    pub memory_percent: f64,
    /// Cumulative received network bytes.
    pub network_rx: u64,
    /// Cumulative transmitted network bytes.
    pub network_tx: u64,
    /// Current process count inside the container.
    pub pids: u32,
    /// Seconds since the Unix epoch when the snapshot was taken.
    pub timestamp: u64,
}

/// One row of `top` output inside the container.
#[derive(Debug, Clone)]
pub struct ProcessEntry {
    /// The full command line as reported by `top`/`ps`.
    pub cmd: String,
}

/// A single lifecycle event as reported by the runtime's event stream.
#[derive(Debug, Clone)]
pub struct ContainerEvent {
    /// The action name, e.g. `"die"`, `"oom"`, `"kill"`, `"restart"`,
    /// `"start"`.
    pub action: String,
}

/// The capability surface the core depends on but does not implement.
///
/// Implementations must be safe to call from multiple threads
/// concurrently (the monitor runs several watchers against the same
/// `Runtime` instance at once).
pub trait Runtime: Send + Sync {
    /// Current lifecycle status.
    fn get_status(&self) -> ContainerStatus;
    /// Latest resource usage snapshot, if available.
    fn stats_snapshot(&self) -> Option<Stats>;
    /// Process table inside the container.
    fn top(&self) -> Vec<ProcessEntry>;
    /// Run `cmd` inside the container and capture stdout.
    fn exec(&self, cmd: &[&str]) -> std::io::Result<String>;
    /// Stream log lines; `tail` bounds how much history to replay before
    /// following.
    fn logs(&self, follow: bool, tail: usize) -> Box<dyn Iterator<Item = String> + Send>;
    /// Stream lifecycle events.
    fn events(&self) -> Box<dyn Iterator<Item = ContainerEvent> + Send>;
    /// Current health-check status string (e.g. `"healthy"`,
    /// `"unhealthy"`), if the container defines a health check.
    fn get_health(&self) -> Option<String>;
    /// Pause the container.
    fn pause(&self) -> std::io::Result<()>;
    /// Resume a paused container.
    fn resume(&self) -> std::io::Result<()>;
    /// Stop the container.
    fn stop(&self) -> std::io::Result<()>;
    /// Start the container.
    fn start(&self) -> std::io::Result<()>;
    /// Destroy the container and its resources.
    fn destroy(&self) -> std::io::Result<()>;
    /// ISO-8601 start time, if the container has been started.
    fn get_start_time(&self) -> Option<String>;
}

#[cfg(test)]
/// A canned, deterministic `Runtime` used across this crate's tests —
/// characterises the interface without depending on a real container
/// engine.
pub struct NullRuntime {
    /// Stats returned by `stats_snapshot`; `None` simulates "unavailable".
    pub stats: std::sync::Mutex<Option<Stats>>,
    /// Rows returned by `top`.
    pub processes: std::sync::Mutex<Vec<ProcessEntry>>,
    /// Health string returned by `get_health`.
    pub health: std::sync::Mutex<Option<String>>,
    /// Lines handed out by `logs`, one iterator's worth, consumed once.
    pub log_lines: std::sync::Mutex<Vec<String>>,
    /// Events handed out by `events`, consumed once.
    pub pending_events: std::sync::Mutex<Vec<ContainerEvent>>,
    /// Number of times `pause()` was called.
    pub pause_calls: std::sync::atomic::AtomicU32,
    /// When `true`, `pause()` returns an error.
    pub fail_pause: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
impl Default for NullRuntime {
    fn default() -> Self {
        Self {
            stats: std::sync::Mutex::new(None),
            processes: std::sync::Mutex::new(Vec::new()),
            health: std::sync::Mutex::new(None),
            log_lines: std::sync::Mutex::new(Vec::new()),
            pending_events: std::sync::Mutex::new(Vec::new()),
            pause_calls: std::sync::atomic::AtomicU32::new(0),
            fail_pause: std::sync::atomic::AtomicBool::new(false),
        }
    }
}

#[cfg(test)]
impl Runtime for NullRuntime {
    fn get_status(&self) -> ContainerStatus {
        ContainerStatus::Running
    }
    fn stats_snapshot(&self) -> Option<Stats> {
        *self.stats.lock().unwrap()
    }
    fn top(&self) -> Vec<ProcessEntry> {
        self.processes.lock().unwrap().clone()
    }
    fn exec(&self, _cmd: &[&str]) -> std::io::Result<String> {
        Ok(String::new())
    }
    fn logs(&self, _follow: bool, _tail: usize) -> Box<dyn Iterator<Item = String> + Send> {
        Box::new(std::mem::take(&mut *self.log_lines.lock().unwrap()).into_iter())
    }
    fn events(&self) -> Box<dyn Iterator<Item = ContainerEvent> + Send> {
        Box::new(std::mem::take(&mut *self.pending_events.lock().unwrap()).into_iter())
    }
    fn get_health(&self) -> Option<String> {
        self.health.lock().unwrap().clone()
    }
    fn pause(&self) -> std::io::Result<()> {
        self.pause_calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if self.fail_pause.load(std::sync::atomic::Ordering::SeqCst) {
            Err(std::io::Error::other("pause failed"))
        } else {
            Ok(())
        }
    }
    fn resume(&self) -> std::io::Result<()> {
        Ok(())
    }
    fn stop(&self) -> std::io::Result<()> {
        Ok(())
    }
    fn start(&self) -> std::io::Result<()> {
        Ok(())
    }
    fn destroy(&self) -> std::io::Result<()> {
        Ok(())
    }
    fn get_start_time(&self) -> Option<String> {
        None
    }
}
