//! Multi-sink severity-tagged alert distributor.

use crate::model::{Alert, Severity};
use crate::paths::CrabpotPaths;
use std::io::{BufRead, Write as _};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

const HISTORY_CAP: usize = 1000;
const HISTORY_TRIM_TO: usize = 500;

/// An output adaptor for alerts. The bus knows nothing about its sinks'
/// internals beyond this trait (`spec.md` §9).
pub trait AlertSink: Send + Sync {
    /// Receive one alert. Must not block for long and must not panic on
    /// malformed input; failures are the sink's own problem to swallow.
    fn accept(&self, alert: &Alert);
}

struct JsonlFileSink {
    path: std::path::PathBuf,
}

impl AlertSink for JsonlFileSink {
    fn accept(&self, alert: &Alert) {
        let Ok(line) = serde_json::to_string(alert) else { return };
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let file = std::fs::OpenOptions::new().create(true).append(true).open(&self.path);
        match file {
            Ok(mut f) => {
                if writeln!(f, "{line}").is_err() {
                    tracing::debug!("failed to append alert to log");
                }
            }
            Err(e) => tracing::debug!(error = %e, "failed to open alerts log"),
        }
    }
}

struct StderrSink;

impl AlertSink for StderrSink {
    fn accept(&self, alert: &Alert) {
        let (open, close) = match alert.severity {
            Severity::Critical => ("\x1b[1;31m", "\x1b[0m"),
            Severity::Warning => ("\x1b[33m", "\x1b[0m"),
            Severity::Info => ("\x1b[34m", "\x1b[0m"),
        };
        eprintln!("{open}[{}] {} {}: {}{close}", alert.timestamp, alert.severity, alert.source, alert.message);
    }
}

/// Multi-sink severity-tagged alert distributor with bounded in-memory
/// history and JSONL persistence.
pub struct AlertBus {
    history: Mutex<Vec<Alert>>,
    sinks: Vec<Arc<dyn AlertSink>>,
    push_sink: Mutex<Option<Arc<dyn AlertSink>>>,
}

impl AlertBus {
    /// Construct the bus with its default sinks (JSONL file + stderr),
    /// reloading history from `paths.alerts_log()` if present.
    #[must_use]
    pub fn new(paths: &CrabpotPaths) -> Self {
        let log_path = paths.alerts_log();
        let history = load_history(&log_path);
        Self {
            history: Mutex::new(history),
            sinks: vec![Arc::new(JsonlFileSink { path: log_path }), Arc::new(StderrSink)],
            push_sink: Mutex::new(None),
        }
    }

    /// Attach (or replace) the optional push sink (e.g. a websocket
    /// fan-out adaptor). External to the core; not implemented here.
    pub fn set_push_sink(&self, sink: Option<Arc<dyn AlertSink>>) {
        *self.push_sink.lock().expect("push-sink lock poisoned") = sink;
    }

    /// Build an `Alert`, append to bounded history, and fan out to every
    /// sink. Sink failures are swallowed; history append always
    /// succeeds.
    pub fn fire(&self, severity: Severity, source: &str, message: &str) {
        let alert = build_alert(severity, source, message);

        {
            let mut history = self.history.lock().expect("alert history lock poisoned");
            history.push(alert.clone());
            if history.len() > HISTORY_CAP {
                let excess = history.len() - HISTORY_TRIM_TO;
                history.drain(0..excess);
            }
        }

        for sink in &self.sinks {
            sink.accept(&alert);
        }
        if let Some(sink) = self.push_sink.lock().expect("push-sink lock poisoned").as_ref() {
            sink.accept(&alert);
        }
        if severity == Severity::Critical {
            send_os_notification(source, message);
        }
    }

    /// Fan out a structured stats snapshot to the push sink, if any.
    /// Best-effort; does not enter the bounded alert history.
    pub fn push_stats(&self, stats_json: &serde_json::Value) {
        if let Some(sink) = self.push_sink.lock().expect("push-sink lock poisoned").as_ref() {
            let alert = build_alert(Severity::Info, "stats", &stats_json.to_string());
            sink.accept(&alert);
        }
    }

    /// Last `last` alerts (optionally filtered by severity), oldest
    /// first.
    #[must_use]
    pub fn get_history(&self, last: usize, severity: Option<Severity>) -> Vec<Alert> {
        let history = self.history.lock().expect("alert history lock poisoned");
        let filtered: Vec<Alert> = match severity {
            Some(s) => history.iter().filter(|a| a.severity == s).cloned().collect(),
            None => history.clone(),
        };
        let len = filtered.len();
        let skip = len.saturating_sub(last);
        filtered[skip..].to_vec()
    }

    /// Count of alerts in history per severity.
    #[must_use]
    pub fn get_counts(&self) -> (usize, usize, usize) {
        let history = self.history.lock().expect("alert history lock poisoned");
        let info = history.iter().filter(|a| a.severity == Severity::Info).count();
        let warning = history.iter().filter(|a| a.severity == Severity::Warning).count();
        let critical = history.iter().filter(|a| a.severity == Severity::Critical).count();
        (info, warning, critical)
    }
}

fn build_alert(severity: Severity, source: &str, message: &str) -> Alert {
    let now = SystemTime::now();
    let secs = now.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
    Alert {
        severity,
        source: source.to_string(),
        message: message.to_string(),
        timestamp: format_hms(secs),
        timestamp_full: format_rfc3339(secs),
    }
}

fn format_hms(secs_since_epoch: u64) -> String {
    let secs_of_day = secs_since_epoch % 86400;
    format!("{:02}:{:02}:{:02}", secs_of_day / 3600, (secs_of_day % 3600) / 60, secs_of_day % 60)
}

/// Minimal RFC3339 (UTC) rendering without pulling in a datetime crate;
/// CrabPot only ever needs this for log lines, not calendar arithmetic.
fn format_rfc3339(secs_since_epoch: u64) -> String {
    let days = secs_since_epoch / 86400;
    let secs_of_day = secs_since_epoch % 86400;
    let (year, month, day) = civil_from_days(days as i64);
    format!(
        "{year:04}-{month:02}-{day:02}T{:02}:{:02}:{:02}Z",
        secs_of_day / 3600,
        (secs_of_day % 3600) / 60,
        secs_of_day % 60
    )
}

/// Howard Hinnant's `civil_from_days` algorithm (days since epoch -> y/m/d).
fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719468;
    let era = if z >= 0 { z } else { z - 146096 } / 146097;
    let doe = (z - era * 146097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    (if m <= 2 { y + 1 } else { y }, m, d)
}

/// Strip everything outside `[A-Za-z0-9 .,!?:/()-]` and truncate to 200
/// chars. This is a security property: attacker-controlled alert content
/// must never reach a shell-interpreted context.
fn sanitize_for_toast(s: &str) -> String {
    let filtered: String =
        s.chars().filter(|c| c.is_ascii_alphanumeric() || " .,!?:/()-".contains(*c)).collect();
    filtered.chars().take(200).collect()
}

fn send_os_notification(source: &str, message: &str) {
    let title = sanitize_for_toast(&format!("CrabPot: {source}"));
    let body = sanitize_for_toast(message);

    if command_exists("notify-send") {
        let result = Command::new("notify-send")
            .arg(&title)
            .arg(&body)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        if let Err(e) = result {
            tracing::debug!(error = %e, "notify-send dispatch failed");
        }
        return;
    }

    if command_exists("powershell.exe") {
        let script = format!(
            "[Windows.UI.Notifications.ToastNotificationManager, Windows.UI.Notifications, ContentType = WindowsRuntime] | Out-Null; Write-Host '{title}: {body}'"
        );
        let encoded = encode_utf16le_base64(&script);
        let result = Command::new("powershell.exe")
            .args(["-NoProfile", "-EncodedCommand", &encoded])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        if let Err(e) = result {
            tracing::debug!(error = %e, "powershell.exe dispatch failed");
        }
    }
}

fn command_exists(name: &str) -> bool {
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(name).is_file()))
        .unwrap_or(false)
}

fn encode_utf16le_base64(s: &str) -> String {
    use base64::Engine;
    let mut bytes = Vec::with_capacity(s.len() * 2);
    for unit in s.encode_utf16() {
        bytes.extend_from_slice(&unit.to_le_bytes());
    }
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

fn load_history(log_path: &std::path::Path) -> Vec<Alert> {
    let Ok(file) = std::fs::File::open(log_path) else { return Vec::new() };
    let reader = std::io::BufReader::new(file);
    let mut history: Vec<Alert> = Vec::new();
    for line in reader.lines().map_while(Result::ok) {
        if line.trim().is_empty() {
            continue;
        }
        if let Ok(alert) = serde_json::from_str::<Alert>(&line) {
            history.push(alert);
        }
    }
    if history.len() > HISTORY_CAP {
        let excess = history.len() - HISTORY_TRIM_TO;
        history.drain(0..excess);
    }
    history
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizer_strips_unsafe_bytes_and_truncates() {
        let raw = "rm -rf / ; echo `pwned` && $(evil) #\u{1}\u{2}";
        let sanitized = sanitize_for_toast(raw);
        assert!(sanitized.chars().all(|c| c.is_ascii_alphanumeric() || " .,!?:/()-".contains(c)));
        let long = "a".repeat(500);
        assert_eq!(sanitize_for_toast(&long).len(), 200);
    }

    #[test]
    fn fire_appends_to_history() {
        let tmp = tempfile::tempdir().unwrap();
        let bus = AlertBus::new(&CrabpotPaths::at(tmp.path()));
        bus.fire(Severity::Warning, "test", "hello");
        let history = bus.get_history(10, None);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].message, "hello");
    }

    #[test]
    fn history_trims_past_cap() {
        let tmp = tempfile::tempdir().unwrap();
        let bus = AlertBus::new(&CrabpotPaths::at(tmp.path()));
        for i in 0..(HISTORY_CAP + 10) {
            bus.fire(Severity::Info, "test", &format!("msg {i}"));
        }
        let history = bus.get_history(usize::MAX, None);
        assert!(history.len() <= HISTORY_TRIM_TO + 1);
    }

    #[test]
    fn severity_filter_returns_matching_only() {
        let tmp = tempfile::tempdir().unwrap();
        let bus = AlertBus::new(&CrabpotPaths::at(tmp.path()));
        bus.fire(Severity::Info, "a", "1");
        bus.fire(Severity::Critical, "b", "2");
        let criticals = bus.get_history(10, Some(Severity::Critical));
        assert_eq!(criticals.len(), 1);
        assert_eq!(criticals[0].source, "b");
    }

    #[test]
    fn history_reloads_from_jsonl_on_construction() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = CrabpotPaths::at(tmp.path());
        {
            let bus = AlertBus::new(&paths);
            bus.fire(Severity::Info, "boot", "first run");
        }
        let bus2 = AlertBus::new(&paths);
        let history = bus2.get_history(10, None);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].message, "first run");
    }

    #[test]
    fn malformed_lines_are_dropped_on_reload() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = CrabpotPaths::at(tmp.path());
        std::fs::create_dir_all(paths.data_dir()).unwrap();
        std::fs::write(paths.alerts_log(), "not json\n{\"bad\":true}\n").unwrap();
        let bus = AlertBus::new(&paths);
        assert!(bus.get_history(10, None).is_empty());
    }
}
