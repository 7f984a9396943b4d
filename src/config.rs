//! Static dispatch configuration
//!
//! The dispatch core is handed a fully-formed [`DispatchConfig`] at
//! construction. A handful of knobs can be overridden from the environment,
//! which is how deployments tune a container without re-rendering its config.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use tracing::info;

/// One content node in the static cluster topology.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Distribution key, unique across the cluster
    pub key: u32,
    pub host: String,
    /// RPC port
    pub port: u16,
    /// Group (replica) this node belongs to
    pub group: u32,
    /// Legacy fs4 port, carried through for topology reporting only
    #[serde(default)]
    pub fs4_port: Option<u16>,
}

impl NodeConfig {
    pub fn new(key: u32, host: impl Into<String>, port: u16, group: u32) -> Self {
        Self {
            key,
            host: host.into(),
            port,
            group,
            fs4_port: None,
        }
    }
}

/// Dispatch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Name of the search cluster, used in log lines
    pub cluster_name: String,
    /// All content nodes, in configuration order
    pub nodes: Vec<NodeConfig>,
    /// Pooled RPC connections per node
    pub num_rpc_connections: usize,
    /// Minimum active-document coverage (fraction) for a group or a
    /// direct-dispatch target to be considered complete
    pub min_activedocs_coverage: f64,
    /// How long connectivity errors must persist before a node is taken out
    pub health_hysteresis_ms: u64,
    /// Background ping period
    pub ping_interval_ms: u64,
    /// Per-ping response budget
    pub ping_timeout_ms: u64,
    /// Fraction of nodes that must answer before the adaptive timeout kicks in
    pub min_search_coverage: f64,
    pub min_wait_after_coverage_factor: f64,
    pub max_wait_after_coverage_factor: f64,
    pub searchable_copies: u32,
    /// Hostname of this container; resolved from `HOSTNAME` when unset
    pub local_hostname: Option<String>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            cluster_name: "search".to_string(),
            nodes: Vec::new(),
            num_rpc_connections: 8,
            min_activedocs_coverage: 0.97,
            health_hysteresis_ms: 10_000,
            ping_interval_ms: 1_000,
            ping_timeout_ms: 500,
            min_search_coverage: 1.0,
            min_wait_after_coverage_factor: 0.0,
            max_wait_after_coverage_factor: 1.0,
            searchable_copies: 1,
            local_hostname: None,
        }
    }
}

impl DispatchConfig {
    /// Create a config for the given nodes with default tuning.
    pub fn with_nodes(cluster_name: impl Into<String>, nodes: Vec<NodeConfig>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            nodes,
            ..Default::default()
        }
    }

    /// Parse an already-loaded JSON document.
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: DispatchConfig = serde_json::from_str(raw)
            .map_err(|e| Error::Config(format!("invalid dispatch config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides
    ///
    /// Environment variables:
    /// - DISPATCH_NUM_CONNECTIONS: pooled connections per node
    /// - DISPATCH_MIN_ACTIVEDOCS_COVERAGE: coverage threshold as a fraction
    /// - DISPATCH_PING_INTERVAL_MS: background ping period
    /// - DISPATCH_LOCAL_HOSTNAME: hostname used to find the local node
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Some(n) = parse_env::<usize>("DISPATCH_NUM_CONNECTIONS")? {
            info!("Overriding num_rpc_connections from environment: {}", n);
            self.num_rpc_connections = n;
        }
        if let Some(c) = parse_env::<f64>("DISPATCH_MIN_ACTIVEDOCS_COVERAGE")? {
            info!("Overriding min_activedocs_coverage from environment: {}", c);
            self.min_activedocs_coverage = c;
        }
        if let Some(ms) = parse_env::<u64>("DISPATCH_PING_INTERVAL_MS")? {
            self.ping_interval_ms = ms;
        }
        if let Ok(host) = std::env::var("DISPATCH_LOCAL_HOSTNAME") {
            let host = host.trim();
            if !host.is_empty() {
                self.local_hostname = Some(host.to_string());
            }
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(Error::Config("dispatch config has no nodes".to_string()));
        }
        let mut keys = HashSet::new();
        for node in &self.nodes {
            if !keys.insert(node.key) {
                return Err(Error::Config(format!(
                    "duplicate distribution key {} in dispatch config",
                    node.key
                )));
            }
        }
        if self.num_rpc_connections == 0 {
            return Err(Error::Config(
                "num_rpc_connections must be at least 1".to_string(),
            ));
        }
        if !(self.min_activedocs_coverage > 0.0 && self.min_activedocs_coverage <= 1.0) {
            return Err(Error::Config(format!(
                "min_activedocs_coverage must be in (0, 1], got {}",
                self.min_activedocs_coverage
            )));
        }
        if !(0.0..=1.0).contains(&self.min_search_coverage) {
            return Err(Error::Config(format!(
                "min_search_coverage must be in [0, 1], got {}",
                self.min_search_coverage
            )));
        }
        if self.ping_timeout_ms == 0 || self.ping_interval_ms == 0 {
            return Err(Error::Config(
                "ping interval and timeout must be non-zero".to_string(),
            ));
        }
        if self.min_wait_after_coverage_factor < 0.0 {
            return Err(Error::Config(format!(
                "min_wait_after_coverage_factor must not be negative, got {}",
                self.min_wait_after_coverage_factor
            )));
        }
        if self.min_wait_after_coverage_factor > self.max_wait_after_coverage_factor {
            return Err(Error::Config(
                "min_wait_after_coverage_factor exceeds max_wait_after_coverage_factor"
                    .to_string(),
            ));
        }
        Ok(())
    }

    pub fn health_hysteresis(&self) -> Duration {
        Duration::from_millis(self.health_hysteresis_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    /// Hostname this container identifies as when looking for its local node.
    pub fn resolve_local_hostname(&self) -> String {
        self.local_hostname
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "localhost".to_string())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    let Some(raw) = std::env::var(name).ok() else {
        return Ok(None);
    };
    raw.trim()
        .parse::<T>()
        .map(Some)
        .map_err(|_| Error::Config(format!("{name} has an invalid value '{raw}'")))
}
