//! Logging bootstrap and metric names shared by the dispatch core.
//!
//! The library only emits `tracing` events and `metrics` samples; installing a
//! subscriber or a metrics recorder is up to the embedding process.

use crate::{Error, Result};

use tracing::Level;
use tracing_subscriber::FmtSubscriber;

pub const PING_TOTAL: &str = "searchdispatch_ping_total";
pub const NODE_TRANSITIONS: &str = "searchdispatch_node_transitions_total";
pub const DISPATCH_ROUTE: &str = "searchdispatch_dispatch_route_total";
pub const INVOKER_OUTCOME: &str = "searchdispatch_invoker_outcome_total";
pub const INVOKER_LATENCY: &str = "searchdispatch_invoker_latency_seconds";

/// Install a global fmt subscriber at `log_level`.
pub fn init_logging(log_level: &str, json: bool) -> Result<()> {
    let level = parse_log_level(log_level)?;
    let builder = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_thread_ids(true);

    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| Error::Config(format!("failed to initialize log subscriber: {e}")))
}

pub fn parse_log_level(raw: &str) -> Result<Level> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        other => Err(Error::Config(format!(
            "invalid log level '{other}', expected one of [trace, debug, info, warn, error]"
        ))),
    }
}
