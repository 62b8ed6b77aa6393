//! Process entry point: wires the policy engine, alert bus, action gate,
//! egress proxy, and security monitor together and runs until killed.
//!
//! The CLI dispatcher, preset resolution, and YAML config loading that
//! the original tool layers on top of this core are out of scope here —
//! this binary exists to prove the components run together, not to
//! reproduce an operator-facing surface.

#![deny(unsafe_code)]

use crabpot_core::{ActionGate, AlertBus, CrabpotPaths, PolicyEngine};
use crabpot_monitor::runtime::{ContainerEvent, ContainerStatus, ProcessEntry, Stats};
use crabpot_monitor::{Runtime, SecurityMonitor, SecurityProfile};
use crabpot_proxy::EgressProxy;
use std::sync::Arc;

/// A `Runtime` that reports an always-healthy, idle container. Stands in
/// for the Docker/WSL2 adaptor this workspace does not ship; replace with
/// a real adaptor to drive the monitor against an actual sandbox.
struct StubRuntime;

impl Runtime for StubRuntime {
    fn get_status(&self) -> ContainerStatus {
        ContainerStatus::Running
    }
    fn stats_snapshot(&self) -> Option<Stats> {
        None
    }
    fn top(&self) -> Vec<ProcessEntry> {
        Vec::new()
    }
    fn exec(&self, _cmd: &[&str]) -> std::io::Result<String> {
        Ok(String::new())
    }
    fn logs(&self, _follow: bool, _tail: usize) -> Box<dyn Iterator<Item = String> + Send> {
        Box::new(std::iter::empty())
    }
    fn events(&self) -> Box<dyn Iterator<Item = ContainerEvent> + Send> {
        Box::new(std::iter::empty())
    }
    fn get_health(&self) -> Option<String> {
        Some("healthy".to_string())
    }
    fn pause(&self) -> std::io::Result<()> {
        Ok(())
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

fn main() {
    crabpot_telemetry::init_logging();

    let paths = CrabpotPaths::from_env();
    let bus = Arc::new(AlertBus::new(&paths));
    let policy = Arc::new(PolicyEngine::new(&paths));
    let gate = Arc::new(ActionGate::new(Arc::clone(&bus)));

    let proxy = EgressProxy::new(
        Arc::clone(&policy),
        Some(Arc::clone(&gate)),
        Arc::clone(&bus),
        crabpot_core::paths::DEFAULT_EGRESS_PROXY_PORT,
    );
    if let Err(e) = proxy.start() {
        tracing::error!("failed to start egress proxy: {e}");
        return;
    }

    let runtime: Arc<dyn Runtime> = Arc::new(StubRuntime);
    let monitor = SecurityMonitor::new(SecurityProfile::default(), runtime, Arc::clone(&bus));
    monitor.start();

    tracing::info!("crabpot running, home={:?}", paths.home());
    loop {
        std::thread::park();
    }
}
