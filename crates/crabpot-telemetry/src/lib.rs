//! Process-wide structured logging setup shared by the `crabpot` binary
//! and any tooling built against this workspace.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

/// Install a JSON-formatted `tracing` subscriber with an `EnvFilter`
/// defaulting to `"info"`. Set `RUST_LOG` to override, e.g.
/// `"info,crabpot_core=debug"`. Safe to call at most once per process;
/// subsequent calls are ignored.
pub fn init_logging() {
    let fmt_layer = fmt::layer().json().with_current_span(true).with_span_list(true);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = Registry::default().with(filter).with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber).ok();
}
