//! Search cluster model: groups, coverage and direct-dispatch eligibility
//!
//! Group membership is fixed at construction. Everything coverage-related is
//! derived from the nodes' current document counts and health on every call,
//! never cached across queries.

use super::node::Node;
use super::Pong;
use crate::clock::{Clock, SystemClock};
use crate::config::DispatchConfig;
use crate::query::Query;
use crate::telemetry::PING_TOTAL;
use crate::Result;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A set of nodes that together hold one complete replica of the corpus.
#[derive(Debug)]
pub struct Group {
    id: u32,
    nodes: Vec<Arc<Node>>,
}

impl Group {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    /// Active documents summed over the group's working nodes.
    pub fn active_documents(&self) -> u64 {
        self.nodes
            .iter()
            .filter(|n| n.is_working())
            .fold(0u64, |sum, n| sum.saturating_add(n.active_documents()))
    }

    pub fn working_nodes(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_working()).count()
    }

    pub fn is_fully_working(&self) -> bool {
        self.nodes.iter().all(|n| n.is_working())
    }
}

/// All groups and nodes of one search cluster.
pub struct SearchCluster {
    config: DispatchConfig,
    groups: Vec<Group>,
    nodes: Vec<Arc<Node>>,
    nodes_by_key: HashMap<u32, Arc<Node>>,
    local_corpus_dispatch_target: Option<Arc<Node>>,
    in_rotation: AtomicBool,
    next_group: AtomicUsize,
}

impl SearchCluster {
    pub fn new(config: DispatchConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Build the cluster with an explicit clock for the node monitors.
    pub fn with_clock(config: DispatchConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;

        let hysteresis = config.health_hysteresis();
        let nodes: Vec<Arc<Node>> = config
            .nodes
            .iter()
            .map(|nc| Arc::new(Node::new(nc, hysteresis, clock.clone())))
            .collect();

        let mut by_group: BTreeMap<u32, Vec<Arc<Node>>> = BTreeMap::new();
        for node in &nodes {
            by_group.entry(node.group()).or_default().push(node.clone());
        }
        let groups: Vec<Group> = by_group
            .into_iter()
            .map(|(id, nodes)| Group { id, nodes })
            .collect();

        let nodes_by_key = nodes.iter().map(|n| (n.key(), n.clone())).collect();
        let local_hostname = config.resolve_local_hostname();
        let local_corpus_dispatch_target =
            find_local_corpus_dispatch_target(&local_hostname, &groups, &nodes);

        info!(
            cluster = %config.cluster_name,
            groups = groups.len(),
            nodes = nodes.len(),
            local_target = ?local_corpus_dispatch_target.as_ref().map(|n| n.key()),
            "Created search cluster"
        );

        Ok(Self {
            config,
            groups,
            nodes,
            nodes_by_key,
            local_corpus_dispatch_target,
            in_rotation: AtomicBool::new(false),
            next_group: AtomicUsize::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.cluster_name
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    pub fn group(&self, id: u32) -> Option<&Group> {
        self.groups.iter().find(|g| g.id == id)
    }

    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    pub fn node(&self, key: u32) -> Option<&Arc<Node>> {
        self.nodes_by_key.get(&key)
    }

    /// The single local node holding a full corpus replica, if this container
    /// is co-located with one.
    pub fn local_corpus_dispatch_target(&self) -> Option<&Arc<Node>> {
        self.local_corpus_dispatch_target.as_ref()
    }

    /// Whether every group consists of exactly one node.
    pub fn has_single_node_groups(&self) -> bool {
        self.groups.iter().all(|g| g.nodes.len() == 1)
    }

    /// Apply the outcome of a ping to `node`. Returns whether it succeeded.
    pub fn handle_pong(&self, node: &Node, result: Result<Pong>) -> bool {
        match result {
            Ok(pong) => {
                node.set_active_documents(pong.active_documents);
                node.monitor().responded(pong.search_nodes_online);
                metrics::counter!(PING_TOTAL, "outcome" => "ok").increment(1);
                true
            }
            Err(e) => {
                debug!(node = %node, error = %e, "Ping failed");
                node.monitor().failed(e.kind());
                metrics::counter!(PING_TOTAL, "outcome" => e.kind().as_str()).increment(1);
                false
            }
        }
    }

    /// Recompute whether this container should be in rotation.
    ///
    /// With a local corpus dispatch target that node alone decides; otherwise
    /// any working node that has answered at least once is enough.
    pub fn update_rotation(&self) -> bool {
        let serving = |n: &Arc<Node>| n.is_working() && n.monitor().has_responded();
        let in_rotation = match &self.local_corpus_dispatch_target {
            Some(local) => serving(local),
            None => self.nodes.iter().any(serving),
        };

        let previous = self.in_rotation.swap(in_rotation, Ordering::AcqRel);
        if previous != in_rotation {
            if in_rotation {
                info!("Search cluster '{}' is now in rotation", self.name());
            } else {
                warn!("Search cluster '{}' is out of rotation", self.name());
            }
        }
        in_rotation
    }

    pub fn in_rotation(&self) -> bool {
        self.in_rotation.load(Ordering::Acquire)
    }

    /// Coverage of `group` relative to the best group in the cluster.
    pub fn group_coverage(&self, group: &Group) -> f64 {
        let best = self
            .groups
            .iter()
            .map(Group::active_documents)
            .max()
            .unwrap_or(0);
        if best == 0 {
            return 0.0;
        }
        group.active_documents() as f64 / best as f64
    }

    /// Decide whether `query` may be sent straight to `local_node`.
    ///
    /// Returns the node to dispatch to, or `None` to fall back to a full
    /// group dispatch. Never an error.
    pub fn is_eligible_for_direct_dispatch(
        &self,
        query: &Query,
        local_node: &Node,
    ) -> Option<Arc<Node>> {
        if !query.direct_dispatch_requested() {
            return None;
        }
        if !self.has_single_node_groups() {
            debug!("Direct dispatch rejected: groups hold more than one node");
            return None;
        }
        let node = self.nodes_by_key.get(&local_node.key())?;
        if !node.is_working() {
            debug!(node = %node, "Direct dispatch rejected: local node is not working");
            return None;
        }

        let Some(coverage) = self.direct_dispatch_coverage(node) else {
            debug!(node = %node, "Direct dispatch rejected: coverage is undefined");
            return None;
        };
        if coverage >= self.config.min_activedocs_coverage {
            Some(node.clone())
        } else {
            debug!(
                node = %node,
                coverage,
                threshold = self.config.min_activedocs_coverage,
                "Direct dispatch rejected: insufficient coverage"
            );
            None
        }
    }

    /// Direct-dispatch target for `query`, if there is a local node and it is
    /// eligible right now.
    pub fn direct_dispatch_target(&self, query: &Query) -> Option<Arc<Node>> {
        let local = self.local_corpus_dispatch_target.as_ref()?;
        self.is_eligible_for_direct_dispatch(query, local)
    }

    fn direct_dispatch_coverage(&self, node: &Node) -> Option<f64> {
        let documents = node.active_documents() as f64;
        let reference = if self.groups.len() == 1 {
            documents
        } else {
            self.average_documents_in_other_groups(node.group())?
        };
        if reference <= 0.0 {
            return None;
        }
        Some(documents / reference)
    }

    fn average_documents_in_other_groups(&self, group_id: u32) -> Option<f64> {
        let (sum, count) = self
            .groups
            .iter()
            .filter(|g| g.id != group_id)
            .fold((0u128, 0usize), |(sum, count), g| {
                (sum + g.active_documents() as u128, count + 1)
            });
        if count == 0 {
            return None;
        }
        Some(sum as f64 / count as f64)
    }

    /// Whether the given subset of a group's nodes still covers enough of
    /// the corpus compared to the other groups.
    pub fn is_partial_group_coverage_sufficient(
        &self,
        group_id: Option<u32>,
        nodes: &[Arc<Node>],
    ) -> bool {
        if self.groups.len() == 1 {
            return true;
        }
        let Some(group_id) = group_id else {
            return false;
        };
        if self.group(group_id).is_none() {
            return false;
        }
        let documents: u128 = nodes.iter().map(|n| n.active_documents() as u128).sum();
        match self.average_documents_in_other_groups(group_id) {
            Some(average) if average > 0.0 => {
                documents as f64 / average >= self.config.min_activedocs_coverage
            }
            _ => false,
        }
    }

    /// Whether a group's coverage is in line with the other groups. Groups
    /// are given the benefit of the doubt while nothing has been reported.
    pub fn has_sufficient_coverage(&self, group: &Group) -> bool {
        match self.average_documents_in_other_groups(group.id) {
            Some(average) if average > 0.0 => {
                group.active_documents() as f64 / average >= self.config.min_activedocs_coverage
            }
            _ => true,
        }
    }

    /// Pick the next group for a full dispatch, round-robin, skipping the
    /// ids in `skip`. Fully working groups with sufficient coverage are
    /// preferred, then groups with any working node, then anything left.
    pub fn select_group(&self, skip: &[u32]) -> Option<&Group> {
        let n = self.groups.len();
        if n == 0 {
            return None;
        }
        let start = self.next_group.fetch_add(1, Ordering::Relaxed) % n;
        let candidates: Vec<&Group> = (0..n)
            .map(|i| &self.groups[(start + i) % n])
            .filter(|g| !skip.contains(&g.id))
            .collect();

        candidates
            .iter()
            .find(|g| g.is_fully_working() && self.has_sufficient_coverage(g))
            .or_else(|| candidates.iter().find(|g| g.working_nodes() > 0))
            .or_else(|| candidates.first())
            .copied()
    }
}

fn find_local_corpus_dispatch_target(
    local_hostname: &str,
    groups: &[Group],
    nodes: &[Arc<Node>],
) -> Option<Arc<Node>> {
    if groups.iter().any(|g| g.nodes.len() != 1) {
        return None;
    }
    let mut local = nodes
        .iter()
        .filter(|n| n.hostname().eq_ignore_ascii_case(local_hostname));
    match (local.next(), local.next()) {
        (Some(node), None) => Some(node.clone()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::NodeConfig;
    use crate::query::DISPATCH_DIRECT;
    use crate::Error;
    use std::time::Duration;

    fn cluster(nodes_per_group: u32, groups: u32, local: Option<&str>) -> SearchCluster {
        let mut nodes = Vec::new();
        for g in 0..groups {
            for i in 0..nodes_per_group {
                let key = g * nodes_per_group + i;
                nodes.push(NodeConfig::new(key, format!("node.{g}.{i}"), 19106, g));
            }
        }
        let mut config = DispatchConfig::with_nodes("test", nodes);
        config.local_hostname = Some(local.unwrap_or("container").to_string());
        SearchCluster::with_clock(config, Arc::new(ManualClock::new())).unwrap()
    }

    fn report(cluster: &SearchCluster, key: u32, docs: u64) {
        let node = cluster.node(key).unwrap().clone();
        cluster.handle_pong(
            &node,
            Ok(Pong {
                active_documents: docs,
                search_nodes_online: true,
            }),
        );
    }

    fn direct_query() -> Query {
        Query::new(Duration::from_secs(1)).with_property(DISPATCH_DIRECT, "true")
    }

    #[test]
    fn test_groups_are_ordered_and_immutable() {
        let cluster = cluster(2, 3, None);
        let ids: Vec<u32> = cluster.groups().iter().map(Group::id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(cluster.group(1).unwrap().nodes().len(), 2);
        assert!(!cluster.has_single_node_groups());
    }

    #[test]
    fn test_local_target_requires_single_node_groups() {
        let c = cluster(1, 2, Some("node.1.0"));
        assert_eq!(c.local_corpus_dispatch_target().unwrap().key(), 1);

        let c = cluster(2, 2, Some("node.1.0"));
        assert!(c.local_corpus_dispatch_target().is_none());

        let c = cluster(1, 2, Some("elsewhere"));
        assert!(c.local_corpus_dispatch_target().is_none());
    }

    #[test]
    fn test_coverage_threshold_both_directions() {
        // Local group 0 with 99, others 104 and 100: 99/102 passes
        let c = cluster(1, 3, Some("node.0.0"));
        report(&c, 0, 99);
        report(&c, 1, 104);
        report(&c, 2, 100);
        let local = c.node(0).unwrap().clone();
        assert!(c.is_eligible_for_direct_dispatch(&direct_query(), &local).is_some());

        // 96 against 100: fails
        report(&c, 0, 96);
        report(&c, 1, 100);
        assert!(c.is_eligible_for_direct_dispatch(&direct_query(), &local).is_none());
    }

    #[test]
    fn test_zero_reference_fails_closed() {
        let c = cluster(1, 2, Some("node.0.0"));
        let local = c.node(0).unwrap().clone();
        report(&c, 0, 100);
        report(&c, 1, 0);
        assert!(c.is_eligible_for_direct_dispatch(&direct_query(), &local).is_none());

        let single = cluster(1, 1, Some("node.0.0"));
        let local = single.node(0).unwrap().clone();
        assert!(single.is_eligible_for_direct_dispatch(&direct_query(), &local).is_none());
        report(&single, 0, 1);
        assert!(single.is_eligible_for_direct_dispatch(&direct_query(), &local).is_some());
    }

    #[test]
    fn test_group_coverage_against_best_group() {
        let c = cluster(2, 2, None);
        assert_eq!(c.group_coverage(c.group(0).unwrap()), 0.0);
        report(&c, 0, 50);
        report(&c, 1, 50);
        report(&c, 2, 50);
        report(&c, 3, 30);
        assert_eq!(c.group_coverage(c.group(0).unwrap()), 1.0);
        assert!((c.group_coverage(c.group(1).unwrap()) - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_partial_group_coverage() {
        let c = cluster(2, 2, None);
        for key in 0..4 {
            report(&c, key, 100);
        }
        let group0 = c.group(0).unwrap().nodes().to_vec();
        assert!(c.is_partial_group_coverage_sufficient(Some(0), &group0));
        assert!(!c.is_partial_group_coverage_sufficient(Some(0), &group0[..1]));
        assert!(!c.is_partial_group_coverage_sufficient(None, &group0));
        assert!(!c.is_partial_group_coverage_sufficient(Some(9), &group0));

        let single = cluster(2, 1, None);
        assert!(single.is_partial_group_coverage_sufficient(None, &[]));
    }

    #[test]
    fn test_select_group_round_robins_and_skips() {
        let c = cluster(1, 3, None);
        let first = c.select_group(&[]).unwrap().id();
        let second = c.select_group(&[]).unwrap().id();
        assert_ne!(first, second);

        let picked = c.select_group(&[0, 1]).unwrap().id();
        assert_eq!(picked, 2);
        assert!(c.select_group(&[0, 1, 2]).is_none());
    }

    #[test]
    fn test_select_group_prefers_working_groups() {
        let c = cluster(1, 2, None);
        report(&c, 0, 100);
        // Never answered, so the first connectivity error takes it out
        let down = c.node(1).unwrap().clone();
        c.handle_pong(&down, Err(Error::Connectivity("refused".into())));
        assert!(!down.is_working());

        for _ in 0..4 {
            assert_eq!(c.select_group(&[]).unwrap().id(), 0);
        }
        // With nothing better left, a down group is still returned
        assert_eq!(c.select_group(&[0]).unwrap().id(), 1);
    }

    #[test]
    fn test_rotation_follows_local_node() {
        let c = cluster(1, 2, Some("node.0.0"));
        assert!(!c.update_rotation());

        report(&c, 1, 10);
        assert!(!c.update_rotation(), "only the local node counts");

        report(&c, 0, 0);
        assert!(c.update_rotation(), "zero documents is fine");
        assert!(c.in_rotation());
    }

    #[test]
    fn test_rotation_without_local_node() {
        let c = cluster(2, 2, None);
        assert!(!c.update_rotation());
        report(&c, 3, 1);
        assert!(c.update_rotation());
    }
}
