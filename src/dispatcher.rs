//! Dispatch facade
//!
//! Wires one search cluster, its connection pool, the invoker factory and
//! the background monitor together, and runs whole searches and fills.

use crate::clock::{Clock, SystemClock};
use crate::cluster::{ClusterMonitor, Pinger, SearchCluster};
use crate::config::DispatchConfig;
use crate::dispatch::{
    collect_group, DispatchPlan, DocumentSummary, GroupOutcome, Hit, InvokerFactory, NodeOutcome,
    Outcome, RpcClient, RpcResourcePool,
};
use crate::query::Query;
use crate::{Error, Result};
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How a search was routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Direct(u32),
    Group(u32),
}

#[derive(Debug)]
pub struct SearchOutcome {
    pub route: Route,
    pub group: GroupOutcome,
}

pub struct Dispatcher {
    cluster: Arc<SearchCluster>,
    factory: InvokerFactory,
    monitor: Arc<ClusterMonitor>,
}

impl Dispatcher {
    pub fn new(config: DispatchConfig, client: &dyn RpcClient) -> Result<Self> {
        Self::with_clock(config, client, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: DispatchConfig,
        client: &dyn RpcClient,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let pool = Arc::new(RpcResourcePool::new(&config, client));
        let cluster = Arc::new(SearchCluster::with_clock(config, clock)?);
        let factory = InvokerFactory::new(cluster.clone(), pool);
        let pinger = factory.create_pinger();
        Ok(Self::assemble(cluster, factory, pinger))
    }

    /// Assemble from parts, pinging through `pinger` instead of the pool.
    pub fn from_parts(
        cluster: Arc<SearchCluster>,
        pool: Arc<RpcResourcePool>,
        pinger: Arc<dyn Pinger>,
    ) -> Self {
        let factory = InvokerFactory::new(cluster.clone(), pool);
        Self::assemble(cluster, factory, pinger)
    }

    fn assemble(
        cluster: Arc<SearchCluster>,
        factory: InvokerFactory,
        pinger: Arc<dyn Pinger>,
    ) -> Self {
        let monitor = ClusterMonitor::new(cluster.clone(), pinger, factory.pool().shutdown_token());
        Self {
            cluster,
            factory,
            monitor,
        }
    }

    pub fn cluster(&self) -> &Arc<SearchCluster> {
        &self.cluster
    }

    pub fn factory(&self) -> &InvokerFactory {
        &self.factory
    }

    pub fn monitor(&self) -> &Arc<ClusterMonitor> {
        &self.monitor
    }

    /// Start background pinging.
    pub fn start(&self) {
        self.monitor.start();
    }

    /// Route and run a search.
    ///
    /// Groups whose working nodes cover too little are skipped in favour of
    /// the next one; the last group tried is used whatever its coverage.
    pub async fn search(&self, query: &Query) -> Result<SearchOutcome> {
        if query.direct_dispatch_requested() {
            // Half the budget at most, the rest is for the search itself
            let wait = (query.time_left() / 2).min(self.cluster.config().ping_timeout());
            self.monitor.ensure_fresh(wait).await;
        }

        let config = self.cluster.config();
        let attempts = self.cluster.groups().len();
        let mut skip = Vec::new();

        for attempt in 0..attempts {
            let (group_id, nodes) = match self.factory.plan(query, &skip)? {
                DispatchPlan::Direct(node) => {
                    let mut invokers = vec![self.factory.create_search_invoker(node.key())?];
                    let group = collect_group(&mut invokers, &[], query, config).await;
                    return Ok(SearchOutcome {
                        route: Route::Direct(node.key()),
                        group,
                    });
                }
                DispatchPlan::Group { group_id, nodes } => (group_id, nodes),
            };

            let accept_incomplete = attempt + 1 == attempts;
            match self
                .factory
                .create_search_invokers(Some(group_id), &nodes, accept_incomplete)
            {
                Some(mut planned) => {
                    let group =
                        collect_group(&mut planned.invokers, &planned.failed, query, config).await;
                    return Ok(SearchOutcome {
                        route: Route::Group(group_id),
                        group,
                    });
                }
                None => {
                    debug!(group = group_id, "Skipping group with insufficient coverage");
                    skip.push(group_id);
                }
            }
        }

        Err(Error::Routing(format!(
            "could not find a usable group in search cluster '{}'",
            self.cluster.name()
        )))
    }

    /// Fetch summaries for `hits`, one concurrent fill per producing node.
    pub async fn fill(
        &self,
        query: &Query,
        hits: &[Hit],
    ) -> Vec<NodeOutcome<Vec<DocumentSummary>>> {
        let fills = InvokerFactory::hits_by_node(hits)
            .into_iter()
            .map(|(node_key, node_hits)| async move {
                let outcome = match self.factory.create_fill_invoker(query, node_key) {
                    Ok(mut invoker) => invoker.fill(query, &node_hits).await,
                    Err(e) => {
                        warn!(node_key, error = %e, "Cannot fill hits");
                        Outcome::Failed(e)
                    }
                };
                NodeOutcome { node_key, outcome }
            });
        join_all(fills).await
    }

    /// Stop pinging and close every connection.
    pub async fn shutdown(&self) {
        info!("Shutting down dispatcher for '{}'", self.cluster.name());
        self.monitor.shutdown().await;
        self.factory.release();
    }
}
