//! Routing decisions and invoker construction
//!
//! The factory owns the bridge between the cluster model and the connection
//! pool: it decides between direct and group dispatch, creates one invoker
//! per target node, and picks the docsum encoding for fills.

use super::invoker::{FillInvoker, SearchInvoker};
use super::pool::RpcResourcePool;
use super::protocol::{Hit, MonitorReply, MonitorRequest, SummaryEncoding, METHOD_PING};
use super::compression::CompressionType;
use super::transport::RpcRequest;
use crate::cluster::{Node, Pinger, Pong, SearchCluster};
use crate::query::{Query, DISPATCH_PROTOBUF, DISPATCH_SUMMARIES};
use crate::telemetry::DISPATCH_ROUTE;
use crate::{Error, Result};
use async_trait::async_trait;
use prost::Message;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Where a query goes.
#[derive(Debug, Clone)]
pub enum DispatchPlan {
    /// Straight to the local node, no other node is contacted
    Direct(Arc<Node>),
    /// Fan out to every node of one group
    Group { group_id: u32, nodes: Vec<Arc<Node>> },
}

impl DispatchPlan {
    pub fn is_direct(&self) -> bool {
        matches!(self, DispatchPlan::Direct(_))
    }

    pub fn group_id(&self) -> Option<u32> {
        match self {
            DispatchPlan::Direct(_) => None,
            DispatchPlan::Group { group_id, .. } => Some(*group_id),
        }
    }

    pub fn nodes(&self) -> Vec<Arc<Node>> {
        match self {
            DispatchPlan::Direct(node) => vec![node.clone()],
            DispatchPlan::Group { nodes, .. } => nodes.clone(),
        }
    }
}

/// Search invokers for the working part of a group.
#[derive(Debug)]
pub struct SearchInvokers {
    pub invokers: Vec<SearchInvoker>,
    /// Distribution keys of nodes skipped because they are down
    pub failed: Vec<u32>,
}

impl SearchInvokers {
    /// Message describing the skipped nodes, if any.
    pub fn failure_message(&self) -> Option<String> {
        failure_message(&self.failed)
    }
}

/// Text reported for nodes that were down when the query was dispatched.
pub fn failure_message(failed: &[u32]) -> Option<String> {
    if failed.is_empty() {
        return None;
    }
    let keys: Vec<String> = failed.iter().map(u32::to_string).collect();
    Some(format!(
        "Connection failure on nodes with distribution-keys: {}",
        keys.join(", ")
    ))
}

pub struct InvokerFactory {
    cluster: Arc<SearchCluster>,
    pool: Arc<RpcResourcePool>,
}

impl InvokerFactory {
    pub fn new(cluster: Arc<SearchCluster>, pool: Arc<RpcResourcePool>) -> Self {
        Self { cluster, pool }
    }

    pub fn cluster(&self) -> &Arc<SearchCluster> {
        &self.cluster
    }

    pub fn pool(&self) -> &Arc<RpcResourcePool> {
        &self.pool
    }

    /// Choose direct dispatch when the local node is eligible, otherwise the
    /// next usable group not in `skip_groups`.
    pub fn plan(&self, query: &Query, skip_groups: &[u32]) -> Result<DispatchPlan> {
        if let Some(node) = self.cluster.direct_dispatch_target(query) {
            debug!(node = %node, "Dispatching directly");
            metrics::counter!(DISPATCH_ROUTE, "route" => "direct").increment(1);
            return Ok(DispatchPlan::Direct(node));
        }

        let group = self.cluster.select_group(skip_groups).ok_or_else(|| {
            Error::Routing(format!(
                "no usable group in search cluster '{}'",
                self.cluster.name()
            ))
        })?;
        metrics::counter!(DISPATCH_ROUTE, "route" => "group").increment(1);
        Ok(DispatchPlan::Group {
            group_id: group.id(),
            nodes: group.nodes().to_vec(),
        })
    }

    pub fn create_search_invoker(&self, node_key: u32) -> Result<SearchInvoker> {
        let node = self.node(node_key)?;
        Ok(SearchInvoker::new(node, self.pool.clone()))
    }

    /// One invoker per working node in `nodes`.
    ///
    /// Returns `None` when down nodes leave the rest of the group with too
    /// little coverage and `accept_incomplete_coverage` is false. An accepted
    /// group with every node down has no invokers and names all nodes as failed.
    pub fn create_search_invokers(
        &self,
        group_id: Option<u32>,
        nodes: &[Arc<Node>],
        accept_incomplete_coverage: bool,
    ) -> Option<SearchInvokers> {
        let (working, down): (Vec<Arc<Node>>, Vec<Arc<Node>>) =
            nodes.iter().cloned().partition(|n| n.is_working());

        if !down.is_empty()
            && !accept_incomplete_coverage
            && !self.cluster.is_partial_group_coverage_sufficient(group_id, &working)
        {
            debug!(
                group = ?group_id,
                down = down.len(),
                "Too few working nodes in group for sufficient coverage"
            );
            return None;
        }

        Some(SearchInvokers {
            invokers: working
                .into_iter()
                .map(|node| SearchInvoker::new(node, self.pool.clone()))
                .collect(),
            failed: down.iter().map(|n| n.key()).collect(),
        })
    }

    /// Fill invoker for the node with `node_key`, with the docsum encoding
    /// the query asks for.
    pub fn create_fill_invoker(&self, query: &Query, node_key: u32) -> Result<FillInvoker> {
        let node = self.node(node_key)?;
        Ok(FillInvoker::new(node, self.pool.clone(), summary_encoding(query)))
    }

    /// Group hits by the node that produced them.
    pub fn hits_by_node(hits: &[Hit]) -> BTreeMap<u32, Vec<Hit>> {
        let mut grouped: BTreeMap<u32, Vec<Hit>> = BTreeMap::new();
        for hit in hits {
            grouped.entry(hit.distribution_key).or_default().push(hit.clone());
        }
        grouped
    }

    pub fn create_pinger(&self) -> Arc<dyn Pinger> {
        Arc::new(RpcPinger::new(self.pool.clone()))
    }

    pub fn release(&self) {
        self.pool.release();
    }

    fn node(&self, key: u32) -> Result<Arc<Node>> {
        self.cluster.node(key).cloned().ok_or(Error::UnknownNode(key))
    }
}

/// Legacy docsums are used when asked for, unless the summary needs the
/// query tree, which only the protobuf request carries.
pub fn summary_encoding(query: &Query) -> SummaryEncoding {
    let properties = query.properties();
    let legacy = properties.get_bool(DISPATCH_SUMMARIES, false)
        || !properties.get_bool(DISPATCH_PROTOBUF, true);
    if legacy && !query.summary_needs_query() {
        SummaryEncoding::Legacy
    } else {
        SummaryEncoding::Protobuf
    }
}

/// Pings over the pooled RPC connections.
pub struct RpcPinger {
    pool: Arc<RpcResourcePool>,
}

impl RpcPinger {
    pub fn new(pool: Arc<RpcResourcePool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Pinger for RpcPinger {
    async fn ping(&self, node: &Node) -> Result<Pong> {
        let connection = self.pool.get_connection(node.key())?;
        let body = self
            .pool
            .compressor()
            .compress(CompressionType::None, &MonitorRequest {}.encode_to_vec())?;
        let response = connection.request(RpcRequest::new(METHOD_PING, body)).await?;
        let bytes = self.pool.compressor().decompress(
            response.compression,
            &response.payload,
            response.uncompressed_len,
        )?;
        let reply = MonitorReply::decode(bytes)?;
        Ok(Pong {
            active_documents: reply.active_docs,
            search_nodes_online: reply.online,
        })
    }
}
