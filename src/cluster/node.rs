//! Content node identity and live state

use super::node_monitor::NodeMonitor;
use crate::clock::Clock;
use crate::config::NodeConfig;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A backend content node.
///
/// Identity is fixed at construction; the document count and health state
/// are updated continuously by the ping path.
#[derive(Debug)]
pub struct Node {
    key: u32,
    hostname: String,
    rpc_port: u16,
    group: u32,
    fs4_port: Option<u16>,
    /// Active documents as last reported by a ping
    active_documents: AtomicU64,
    monitor: NodeMonitor,
}

impl Node {
    pub fn new(config: &NodeConfig, hysteresis: Duration, clock: Arc<dyn Clock>) -> Self {
        let label = format!(
            "search node key={} group={} {}:{}",
            config.key, config.group, config.host, config.port
        );
        Self {
            key: config.key,
            hostname: config.host.clone(),
            rpc_port: config.port,
            group: config.group,
            fs4_port: config.fs4_port,
            active_documents: AtomicU64::new(0),
            monitor: NodeMonitor::new(label, hysteresis, clock),
        }
    }

    /// Distribution key
    pub fn key(&self) -> u32 {
        self.key
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn rpc_port(&self) -> u16 {
        self.rpc_port
    }

    pub fn group(&self) -> u32 {
        self.group
    }

    pub fn fs4_port(&self) -> Option<u16> {
        self.fs4_port
    }

    pub fn active_documents(&self) -> u64 {
        self.active_documents.load(Ordering::Acquire)
    }

    pub fn set_active_documents(&self, documents: u64) {
        self.active_documents.store(documents, Ordering::Release);
    }

    pub fn is_working(&self) -> bool {
        self.monitor.is_working()
    }

    pub fn monitor(&self) -> &NodeMonitor {
        &self.monitor
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "node {} (group {}, {}:{})",
            self.key, self.group, self.hostname, self.rpc_port
        )
    }
}
