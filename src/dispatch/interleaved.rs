//! Concurrent collection of one group's search responses
//!
//! All invokers run at once. Every node gets until the query deadline,
//! except that once `min_search_coverage` of the nodes have answered the
//! rest only get an adaptive window, sloped by how many are still
//! outstanding. Invokers still running when collection stops are dropped,
//! and dropping them leaves node health alone.

use super::factory::failure_message;
use super::invoker::{NodeOutcome, Outcome, SearchInvoker};
use super::protocol::SearchResult;
use crate::config::DispatchConfig;
use crate::query::Query;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Coverage of one group dispatch as seen by the collector.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoverageSummary {
    pub nodes_asked: u32,
    pub nodes_answered: u32,
    /// Nodes whose reply counted towards coverage
    pub nodes_participated: u32,
    pub docs: u64,
    pub active_docs: u64,
    pub soon_active_docs: u64,
    pub degraded_by_match_phase: bool,
    pub timed_out: bool,
    /// Whether collection switched to the adaptive window
    pub adaptive_timeout: bool,
}

impl CoverageSummary {
    pub fn degraded_by_timeout(&self) -> bool {
        self.timed_out && !self.adaptive_timeout
    }

    pub fn degraded_by_adaptive_timeout(&self) -> bool {
        self.timed_out && self.adaptive_timeout
    }

    pub fn is_degraded(&self) -> bool {
        self.timed_out || self.degraded_by_match_phase
    }
}

/// Everything one group dispatch produced.
#[derive(Debug)]
pub struct GroupOutcome {
    /// One entry per invoker; abandoned invokers are reported as timed out
    pub outcomes: Vec<NodeOutcome<SearchResult>>,
    pub coverage: CoverageSummary,
    /// Set when no node answered at all
    pub errors: Vec<String>,
    /// Informational messages about partial failures
    pub trace: Vec<String>,
}

impl GroupOutcome {
    pub fn results(&self) -> impl Iterator<Item = &SearchResult> {
        self.outcomes.iter().filter_map(|o| match &o.outcome {
            Outcome::Completed(result) => Some(result),
            _ => None,
        })
    }

    pub fn total_hit_count(&self) -> u64 {
        self.results().map(|r| r.total_hit_count).sum()
    }
}

struct Collector<'a> {
    config: &'a DispatchConfig,
    asked: u32,
    answered: u32,
    coverage: CoverageSummary,
    adaptive: Option<(Duration, Duration)>,
}

impl<'a> Collector<'a> {
    fn new(config: &'a DispatchConfig, asked: u32) -> Self {
        Self {
            config,
            asked,
            answered: 0,
            coverage: CoverageSummary::default(),
            adaptive: None,
        }
    }

    fn collect(&mut self, outcome: &Outcome<SearchResult>) {
        match outcome {
            Outcome::Completed(result) => {
                let c = &result.coverage;
                self.answered += 1;
                self.coverage.nodes_participated += 1;
                self.coverage.docs = self.coverage.docs.saturating_add(c.docs);
                self.coverage.active_docs = self.coverage.active_docs.saturating_add(c.active_docs);
                self.coverage.soon_active_docs =
                    self.coverage.soon_active_docs.saturating_add(c.soon_active_docs);
                self.coverage.degraded_by_match_phase |= c.degraded_by_match_phase;
                self.coverage.timed_out |= c.degraded_by_soft_timeout;
            }
            Outcome::Failed(_) => self.answered += 1,
            Outcome::TimedOut => {}
        }
    }

    /// Deadline for the next response. Only ever moves earlier.
    fn next_deadline(&mut self, query: &Query, current: Instant) -> Instant {
        let min_coverage = self.config.min_search_coverage;
        if self.asked == self.answered || min_coverage >= 1.0 {
            return current;
        }
        let minimum_responses = (f64::from(self.asked) * min_coverage).ceil() as u32;
        if self.answered < minimum_responses {
            return current;
        }

        let time_left = query.time_left();
        let config = self.config;
        let (wait_min, wait_max) = *self.adaptive.get_or_insert_with(|| {
            (
                scale(time_left, config.min_wait_after_coverage_factor),
                scale(time_left, config.max_wait_after_coverage_factor),
            )
        });

        let pending = self.asked - self.answered;
        let miss_width = (1.0 - min_coverage) * f64::from(self.asked) - 1.0;
        let mut sloped = wait_min.as_secs_f64();
        if pending > 1 && miss_width > 0.0 {
            sloped += wait_max.saturating_sub(wait_min).as_secs_f64() * f64::from(pending - 1)
                / miss_width;
        }
        let wait = Duration::try_from_secs_f64(sloped).unwrap_or(time_left);
        (Instant::now() + wait).min(current)
    }

    /// Extrapolate active documents over nodes that did not answer.
    fn adjust_degraded_coverage(&mut self) {
        let participated = self.coverage.nodes_participated;
        if self.asked == participated || participated == 0 {
            return;
        }
        let not_answered = i128::from(self.asked) - i128::from(participated);
        let missing = if self.adaptive.is_some() {
            not_answered
        } else {
            self.coverage.timed_out = true;
            not_answered - (i128::from(self.config.searchable_copies) - 1)
        };
        let extrapolate = |docs: u64| -> u64 {
            let extra = missing * i128::from(docs) / i128::from(participated);
            (i128::from(docs) + extra).clamp(0, i128::from(u64::MAX)) as u64
        };
        self.coverage.active_docs = extrapolate(self.coverage.active_docs);
        self.coverage.soon_active_docs = extrapolate(self.coverage.soon_active_docs);
    }
}

fn scale(duration: Duration, factor: f64) -> Duration {
    Duration::try_from_secs_f64(duration.as_secs_f64() * factor).unwrap_or(Duration::ZERO)
}

/// Run `invokers` concurrently and gather their outcomes and coverage.
///
/// `already_failed` names nodes of the same group that were down and never
/// asked; they count as asked and answered but not as participating.
pub async fn collect_group(
    invokers: &mut [SearchInvoker],
    already_failed: &[u32],
    query: &Query,
    config: &DispatchConfig,
) -> GroupOutcome {
    let keys: Vec<u32> = invokers.iter().map(|i| i.node().key()).collect();
    let mut collector = Collector::new(config, keys.len() as u32);
    let mut outcomes: Vec<NodeOutcome<SearchResult>> = Vec::with_capacity(keys.len());

    let mut pending: FuturesUnordered<_> = invokers
        .iter_mut()
        .map(|invoker| async move {
            let node_key = invoker.node().key();
            let outcome = invoker.search(query).await;
            NodeOutcome { node_key, outcome }
        })
        .collect();

    let mut deadline = query.deadline();
    while !pending.is_empty() {
        // Up to the query deadline the invokers time themselves out
        let next = if deadline < query.deadline() {
            match tokio::time::timeout_at(deadline, pending.next()).await {
                Ok(next) => next,
                Err(_) => break,
            }
        } else {
            pending.next().await
        };
        let Some(node_outcome) = next else { break };
        collector.collect(&node_outcome.outcome);
        outcomes.push(node_outcome);
        deadline = collector.next_deadline(query, deadline);
    }
    drop(pending);

    let answered: HashSet<u32> = outcomes
        .iter()
        .filter(|o| !o.outcome.is_timed_out())
        .map(|o| o.node_key)
        .collect();
    let finished: HashSet<u32> = outcomes.iter().map(|o| o.node_key).collect();
    for key in &keys {
        if !finished.contains(key) {
            outcomes.push(NodeOutcome {
                node_key: *key,
                outcome: Outcome::TimedOut,
            });
        }
    }

    let mut errors = Vec::new();
    let mut trace = Vec::new();
    let as_errors = collector.answered == 0;

    let unanswered: Vec<String> = keys
        .iter()
        .filter(|k| !answered.contains(*k))
        .map(u32::to_string)
        .collect();
    if !unanswered.is_empty() {
        debug!(
            asked = collector.asked,
            answered = collector.answered,
            "Search timed out before every node answered"
        );
        if as_errors {
            errors.push(format!(
                "Backend communication timeout on all nodes in group (distribution-keys: {})",
                unanswered.join(", ")
            ));
        } else {
            trace.push(format!(
                "Backend communication timeout on nodes with distribution-keys: {}",
                unanswered.join(", ")
            ));
        }
        collector.coverage.timed_out = true;
    }
    if let Some(message) = failure_message(already_failed) {
        if as_errors {
            errors.push(message);
        } else {
            trace.push(message);
        }
        collector.asked += already_failed.len() as u32;
        collector.answered += already_failed.len() as u32;
    }

    collector.adjust_degraded_coverage();
    let mut coverage = collector.coverage.clone();
    coverage.nodes_asked = collector.asked;
    coverage.nodes_answered = collector.answered;
    coverage.adaptive_timeout = collector.adaptive.is_some();

    GroupOutcome {
        outcomes,
        coverage,
        errors,
        trace,
    }
}
