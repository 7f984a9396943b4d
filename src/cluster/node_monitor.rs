//! Per-node health tracking with hysteresis
//!
//! A node is taken out of service only after connectivity errors have
//! persisted for longer than the hysteresis window since its last successful
//! response, and is put back into service on the first successful response.

use crate::clock::Clock;
use crate::error::ErrorKind;
use crate::telemetry::NODE_TRANSITIONS;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

#[derive(Debug)]
struct HealthState {
    /// Last successful response; `None` until the node first answers
    succeeded_at: Option<Instant>,
    /// Whether the node claims to have searchable documents
    search_nodes_online: bool,
    /// No successful response observed yet
    at_start_up: bool,
}

/// Health state machine for a single node.
///
/// `is_working` is readable without taking the lock; transitions are made
/// under the per-node mutex so concurrent `responded`/`failed` calls from the
/// ping path and from in-flight invokers cannot interleave.
#[derive(Debug)]
pub struct NodeMonitor {
    /// Node description used in log lines
    label: String,
    working: AtomicBool,
    state: Mutex<HealthState>,
    hysteresis: Duration,
    clock: Arc<dyn Clock>,
}

impl NodeMonitor {
    pub fn new(label: impl Into<String>, hysteresis: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            label: label.into(),
            working: AtomicBool::new(true),
            state: Mutex::new(HealthState {
                succeeded_at: None,
                search_nodes_online: true,
                at_start_up: true,
            }),
            hysteresis,
            clock,
        }
    }

    /// Whether the node should currently receive traffic.
    pub fn is_working(&self) -> bool {
        self.working.load(Ordering::Acquire)
    }

    /// Whether the node reported searchable documents on its last response.
    pub fn search_nodes_online(&self) -> bool {
        self.state.lock().search_nodes_online
    }

    /// Whether the node has ever answered successfully.
    pub fn has_responded(&self) -> bool {
        !self.state.lock().at_start_up
    }

    pub fn last_success(&self) -> Option<Instant> {
        self.state.lock().succeeded_at
    }

    /// Record a successful response.
    pub fn responded(&self, search_nodes_online: bool) {
        let mut state = self.state.lock();
        state.succeeded_at = Some(self.clock.now());
        state.search_nodes_online = search_nodes_online;
        state.at_start_up = false;

        if !self.is_working() {
            self.set_working(&state, true, "Responds correctly");
        }
    }

    /// Record a failure of the given kind.
    ///
    /// Only connectivity failures count; anything else leaves the state as is.
    pub fn failed(&self, kind: ErrorKind) {
        if kind != ErrorKind::Connectivity {
            debug!(node = %self.label, kind = kind.as_str(), "Ignoring non-connectivity failure");
            return;
        }

        let state = self.state.lock();
        let now = self.clock.now();
        let outage = match state.succeeded_at {
            Some(at) => now.saturating_duration_since(at) > self.hysteresis,
            None => true,
        };

        if outage {
            let explanation = format!("Not working for {:?}", self.hysteresis);
            self.set_working(&state, false, &explanation);
        }
    }

    fn set_working(&self, state: &HealthState, working: bool, explanation: &str) {
        if self.is_working() == working {
            return;
        }

        if working {
            info!("Putting {} in service: {}", self.label, explanation);
        } else if !state.at_start_up {
            info!("Taking {} out of service: {}", self.label, explanation);
        }

        self.working.store(working, Ordering::Release);
        metrics::counter!(
            NODE_TRANSITIONS,
            "state" => if working { "up" } else { "down" }
        )
        .increment(1);
    }
}
