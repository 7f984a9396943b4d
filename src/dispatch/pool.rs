//! Per-node pools of RPC connections
//!
//! Every node gets a fixed set of independent connections, opened once at
//! construction. A request picks one uniformly at random; there is no
//! load tracking and pool membership never changes.

use super::compression::{Compressed, CompressionType, Compressor};
use super::transport::{NodeConnection, RpcClient};
use crate::config::DispatchConfig;
use crate::query::{Query, DISPATCH_COMPRESSION};
use crate::{Error, Result};
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Connections to one node.
struct NodeConnectionPool {
    connections: Vec<Arc<dyn NodeConnection>>,
}

impl NodeConnectionPool {
    fn pick(&self) -> Option<&Arc<dyn NodeConnection>> {
        self.connections.choose(&mut rand::thread_rng())
    }
}

/// Connections to every node in the cluster, plus the payload compressor.
pub struct RpcResourcePool {
    pools: HashMap<u32, NodeConnectionPool>,
    compressor: Compressor,
    released: AtomicBool,
    /// Cancelled on release so background pingers stop with the pool
    shutdown: CancellationToken,
}

impl RpcResourcePool {
    /// Open `num_rpc_connections` connections to every configured node.
    pub fn new(config: &DispatchConfig, client: &dyn RpcClient) -> Self {
        let pools = config
            .nodes
            .iter()
            .map(|node| {
                let connections = (0..config.num_rpc_connections)
                    .map(|_| client.create_connection(&node.host, node.port))
                    .collect();
                (node.key, NodeConnectionPool { connections })
            })
            .collect::<HashMap<_, _>>();

        info!(
            nodes = pools.len(),
            per_node = config.num_rpc_connections,
            "Created RPC resource pool"
        );
        Self::with_pools(pools)
    }

    /// Build a pool from already-open connections, keyed by distribution key.
    pub fn from_connections(connections: HashMap<u32, Vec<Arc<dyn NodeConnection>>>) -> Self {
        Self::with_pools(
            connections
                .into_iter()
                .map(|(key, connections)| (key, NodeConnectionPool { connections }))
                .collect(),
        )
    }

    fn with_pools(pools: HashMap<u32, NodeConnectionPool>) -> Self {
        Self {
            pools,
            compressor: Compressor::default(),
            released: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    /// A random connection to the node with distribution key `key`.
    pub fn get_connection(&self, key: u32) -> Result<Arc<dyn NodeConnection>> {
        let pool = self.pools.get(&key).ok_or(Error::UnknownNode(key))?;
        pool.pick()
            .cloned()
            .ok_or_else(|| Error::Routing(format!("no connections configured for node {key}")))
    }

    pub fn compressor(&self) -> &Compressor {
        &self.compressor
    }

    /// Compress `payload` with the codec the query asks for, LZ4 by default.
    pub fn compress(&self, query: &Query, payload: &[u8]) -> Result<Compressed> {
        let requested = match query.properties().get(DISPATCH_COMPRESSION) {
            Some(name) => name.parse::<CompressionType>()?,
            None => CompressionType::Lz4,
        };
        self.compressor.compress(requested, payload)
    }

    /// Close every connection. Only the first call has any effect.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            debug!("RPC resource pool already released");
            return;
        }
        let mut closed = 0usize;
        for pool in self.pools.values() {
            for connection in &pool.connections {
                connection.close();
                closed += 1;
            }
        }
        self.shutdown.cancel();
        info!(connections = closed, "Released RPC resource pool");
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Token cancelled when the pool is released.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Number of pooled connections for `key`, 0 if unknown.
    pub fn connection_count(&self, key: u32) -> usize {
        self.pools.get(&key).map(|p| p.connections.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::dispatch::transport::{RpcRequest, RpcResponse};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Debug)]
    struct Counting {
        endpoint: String,
        closes: AtomicUsize,
    }

    #[async_trait]
    impl NodeConnection for Counting {
        fn endpoint(&self) -> &str {
            &self.endpoint
        }

        async fn request(&self, _request: RpcRequest) -> Result<RpcResponse> {
            Err(Error::TransportClosed)
        }

        fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct CountingClient;

    impl RpcClient for CountingClient {
        fn create_connection(&self, host: &str, port: u16) -> Arc<dyn NodeConnection> {
            Arc::new(Counting {
                endpoint: format!("{host}:{port}"),
                closes: AtomicUsize::new(0),
            })
        }
    }

    fn config() -> DispatchConfig {
        let mut config = DispatchConfig::with_nodes(
            "pool",
            vec![NodeConfig::new(0, "a", 1, 0), NodeConfig::new(1, "b", 2, 1)],
        );
        config.num_rpc_connections = 3;
        config
    }

    #[test]
    fn test_connections_belong_to_their_node() {
        let pool = RpcResourcePool::new(&config(), &CountingClient);
        assert_eq!(pool.connection_count(0), 3);
        for _ in 0..50 {
            assert_eq!(pool.get_connection(1).unwrap().endpoint(), "b:2");
        }
    }

    #[test]
    fn test_unknown_key_is_routing_error() {
        let pool = RpcResourcePool::new(&config(), &CountingClient);
        let err = pool.get_connection(42).unwrap_err();
        assert!(matches!(err, Error::UnknownNode(42)));
        assert_eq!(err.kind(), crate::ErrorKind::Routing);
    }

    #[test]
    fn test_compression_follows_query_property() {
        let pool = RpcResourcePool::new(&config(), &CountingClient);
        let payload = vec![b'x'; 512];

        let query = Query::new(Duration::from_secs(1));
        assert_eq!(pool.compress(&query, &payload).unwrap().compression, CompressionType::Lz4);

        let query = query.with_property(DISPATCH_COMPRESSION, "none");
        assert_eq!(pool.compress(&query, &payload).unwrap().compression, CompressionType::None);

        let query = Query::new(Duration::from_secs(1)).with_property(DISPATCH_COMPRESSION, "gzip");
        assert!(matches!(pool.compress(&query, &payload), Err(Error::Encode(_))));
    }

    #[test]
    fn test_release_cancels_shutdown_token() {
        let pool = RpcResourcePool::new(&config(), &CountingClient);
        let token = pool.shutdown_token();
        assert!(!token.is_cancelled());
        pool.release();
        assert!(token.is_cancelled());
        assert!(pool.is_released());
    }
}
