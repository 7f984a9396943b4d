//! In-memory content nodes for dispatch tests
//!
//! A [`FakeClient`] hands out connections to scripted nodes that answer
//! pings, searches and docsum requests, or hang, or refuse connections.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use prost::Message;
use searchdispatch::config::{DispatchConfig, NodeConfig};
use searchdispatch::dispatch::protocol::{
    MonitorReply, ReplyHit, SearchReply, METHOD_DOCSUM, METHOD_LEGACY_DOCSUM, METHOD_PING,
    METHOD_SEARCH,
};
use searchdispatch::dispatch::{
    CompressionType, Compressor, NodeConnection, RpcClient, RpcRequest, RpcResponse,
};
use searchdispatch::{Error, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Answer,
    Hang,
    Refuse,
}

/// Behaviour and request counters of one fake content node.
#[derive(Debug)]
pub struct FakeNode {
    pub key: u32,
    docs: Mutex<u64>,
    mode: Mutex<Mode>,
    pub pings: AtomicUsize,
    pub searches: AtomicUsize,
    pub docsums: AtomicUsize,
    pub last_docsum_method: Mutex<Option<String>>,
}

impl FakeNode {
    fn new(key: u32) -> Self {
        Self {
            key,
            docs: Mutex::new(0),
            mode: Mutex::new(Mode::Answer),
            pings: AtomicUsize::new(0),
            searches: AtomicUsize::new(0),
            docsums: AtomicUsize::new(0),
            last_docsum_method: Mutex::new(None),
        }
    }

    pub fn set_docs(&self, docs: u64) {
        *self.docs.lock() = docs;
    }

    pub fn set_mode(&self, mode: Mode) {
        *self.mode.lock() = mode;
    }

    pub fn searches(&self) -> usize {
        self.searches.load(Ordering::SeqCst)
    }

    fn answer(&self, request: &RpcRequest) -> Result<Vec<u8>> {
        let docs = *self.docs.lock();
        match request.method.as_str() {
            METHOD_PING => {
                self.pings.fetch_add(1, Ordering::SeqCst);
                Ok(MonitorReply {
                    online: docs > 0,
                    active_docs: docs,
                }
                .encode_to_vec())
            }
            METHOD_SEARCH => {
                self.searches.fetch_add(1, Ordering::SeqCst);
                Ok(SearchReply {
                    total_hit_count: 1,
                    coverage_docs: docs,
                    active_docs: docs,
                    hits: vec![ReplyHit {
                        global_id: vec![self.key as u8; 12],
                        relevance: f64::from(self.key),
                    }],
                    ..Default::default()
                }
                .encode_to_vec())
            }
            METHOD_DOCSUM | METHOD_LEGACY_DOCSUM => {
                self.docsums.fetch_add(1, Ordering::SeqCst);
                *self.last_docsum_method.lock() = Some(request.method.clone());
                let count = self.docsum_count(request)?;
                let docsums: Vec<_> = (0..count)
                    .map(|i| serde_json::json!({"docsum": {"node": self.key, "index": i}}))
                    .collect();
                let body = serde_json::to_vec(&serde_json::json!({ "docsums": docsums }))?;
                if request.method == METHOD_DOCSUM {
                    Ok(searchdispatch::dispatch::protocol::DocsumReply {
                        summaries: body,
                        errors: vec![],
                    }
                    .encode_to_vec())
                } else {
                    Ok(body)
                }
            }
            other => Err(Error::Protocol(format!("unknown method {other}"))),
        }
    }

    fn docsum_count(&self, request: &RpcRequest) -> Result<usize> {
        let body = Compressor::default().decompress(
            request.compression,
            &request.payload,
            request.uncompressed_len,
        )?;
        if request.method == METHOD_DOCSUM {
            let decoded = searchdispatch::dispatch::protocol::DocsumRequest::decode(body)?;
            Ok(decoded.global_ids.len())
        } else {
            let decoded: serde_json::Value = serde_json::from_slice(&body)?;
            Ok(decoded["gids"].as_array().map(Vec::len).unwrap_or(0))
        }
    }
}

/// One pooled connection to a [`FakeNode`].
#[derive(Debug)]
pub struct FakeConnection {
    endpoint: String,
    node: Arc<FakeNode>,
    closed: AtomicBool,
    pub closes: AtomicUsize,
}

impl FakeConnection {
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NodeConnection for FakeConnection {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn request(&self, request: RpcRequest) -> Result<RpcResponse> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::TransportClosed);
        }
        let mode = *self.node.mode.lock();
        match mode {
            Mode::Hang => std::future::pending().await,
            Mode::Refuse => Err(Error::Connectivity(format!(
                "connection to {} refused",
                self.endpoint
            ))),
            Mode::Answer => {
                let body = self.node.answer(&request)?;
                Ok(RpcResponse::new(
                    Compressor::default().compress(CompressionType::Lz4, &body)?,
                ))
            }
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Hands out connections to the fake nodes of one cluster.
#[derive(Debug, Default)]
pub struct FakeClient {
    nodes: HashMap<String, Arc<FakeNode>>,
    connections: Mutex<Vec<Arc<FakeConnection>>>,
}

impl FakeClient {
    pub fn for_config(config: &DispatchConfig) -> Self {
        let nodes = config
            .nodes
            .iter()
            .map(|n| (format!("{}:{}", n.host, n.port), Arc::new(FakeNode::new(n.key))))
            .collect();
        Self {
            nodes,
            connections: Mutex::new(Vec::new()),
        }
    }

    pub fn node(&self, key: u32) -> Arc<FakeNode> {
        self.nodes
            .values()
            .find(|n| n.key == key)
            .cloned()
            .unwrap_or_else(|| panic!("no fake node {key}"))
    }

    pub fn connections(&self) -> Vec<Arc<FakeConnection>> {
        self.connections.lock().clone()
    }

    pub fn connections_to(&self, key: u32) -> Vec<Arc<FakeConnection>> {
        self.connections()
            .into_iter()
            .filter(|c| c.node.key == key)
            .collect()
    }
}

impl RpcClient for FakeClient {
    fn create_connection(&self, host: &str, port: u16) -> Arc<dyn NodeConnection> {
        let endpoint = format!("{host}:{port}");
        let node = self
            .nodes
            .get(&endpoint)
            .cloned()
            .unwrap_or_else(|| Arc::new(FakeNode::new(u32::MAX)));
        let connection = Arc::new(FakeConnection {
            endpoint,
            node,
            closed: AtomicBool::new(false),
            closes: AtomicUsize::new(0),
        });
        self.connections.lock().push(connection.clone());
        connection
    }
}

/// `groups` groups of `per_group` nodes; node `key` lives on host
/// `node{key}` and `local` names this container's hostname.
pub fn cluster_config(groups: u32, per_group: u32, local: &str) -> DispatchConfig {
    let mut nodes = Vec::new();
    for group in 0..groups {
        for i in 0..per_group {
            let key = group * per_group + i;
            nodes.push(NodeConfig::new(key, format!("node{key}"), 19100 + key as u16, group));
        }
    }
    let mut config = DispatchConfig::with_nodes("test-cluster", nodes);
    config.local_hostname = Some(local.to_string());
    config
}

/// Data pointer of a connection, for identity comparisons.
pub fn conn_id(connection: &Arc<dyn NodeConnection>) -> usize {
    Arc::as_ptr(connection) as *const () as usize
}

pub fn fake_conn_id(connection: &Arc<FakeConnection>) -> usize {
    Arc::as_ptr(connection) as *const () as usize
}
