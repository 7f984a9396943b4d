//! Content cluster model and node health
//!
//! Tracks every content node's liveness and document count, groups nodes
//! into replicas, and answers the coverage questions dispatch asks before
//! routing a query.

pub mod monitor;
pub mod node;
pub mod node_monitor;
pub mod search_cluster;

pub use monitor::{ClusterMonitor, PingRound, Pinger};
pub use node::Node;
pub use node_monitor::NodeMonitor;
pub use search_cluster::{Group, SearchCluster};

/// A successful ping answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pong {
    /// Documents the node currently serves
    pub active_documents: u64,
    /// Whether the node reports its search components as online
    pub search_nodes_online: bool,
}
