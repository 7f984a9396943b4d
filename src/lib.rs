//! # searchdispatch
//!
//! Query dispatch and content-node health tracking for the serving tier of a
//! distributed search engine.
//!
//! A container holds a static view of its content cluster: nodes arranged in
//! groups, each group one full replica of the corpus. This crate decides, per
//! query, whether the query can go straight to a co-located node or must fan
//! out to a whole group, and runs the per-node RPC exchanges.
//!
//! ## Key Features
//!
//! - **Health hysteresis**: a node is only taken out of service after it has
//!   failed to answer for a full window, and put back on its first answer
//! - **Direct dispatch**: single-node groups can be served by the local node
//!   when its document coverage is in line with the other groups
//! - **Pooled transport**: several multiplexed connections per node with
//!   LZ4 payload compression
//! - **Deadline-bounded invokers**: every exchange ends by the query deadline
//!
//! ## Architecture
//!
//! - **cluster**: node health, groups, coverage and the ping loop
//! - **dispatch**: connection pool, compression, wire protocol and invokers
//! - **dispatcher**: the facade wiring both together

pub mod clock;
pub mod cluster;
pub mod config;
pub mod dispatch;
pub mod dispatcher;
pub mod query;
pub mod telemetry;

mod error;

pub use error::{Error, ErrorKind, Result};

/// Re-exports for convenience
pub mod prelude {
    pub use crate::cluster::{ClusterMonitor, Node, NodeMonitor, Pinger, Pong, SearchCluster};
    pub use crate::config::{DispatchConfig, NodeConfig};
    pub use crate::dispatch::{
        CompressionType, Compressor, DispatchPlan, FillInvoker, Hit, InvokerFactory,
        InvokerState, Outcome, RpcResourcePool, SearchInvoker, TcpRpcClient,
    };
    pub use crate::dispatcher::{Dispatcher, Route};
    pub use crate::query::Query;
    pub use crate::{Error, ErrorKind, Result};
}
