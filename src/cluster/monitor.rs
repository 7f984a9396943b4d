//! Background liveness probing
//!
//! A [`ClusterMonitor`] pings every node of a [`SearchCluster`] on a fixed
//! interval and feeds the outcomes into the nodes' health monitors. It can
//! also be asked to run a round on demand when its last one is stale.

use super::search_cluster::SearchCluster;
use super::node::Node;
use super::Pong;
use crate::{Error, Result};
use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Issues one liveness probe to a node.
#[async_trait]
pub trait Pinger: Send + Sync {
    async fn ping(&self, node: &Node) -> Result<Pong>;
}

/// Result of one ping round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PingRound {
    pub responded: usize,
    pub failed: usize,
}

/// Periodic pinger for one search cluster.
pub struct ClusterMonitor {
    cluster: Arc<SearchCluster>,
    pinger: Arc<dyn Pinger>,
    /// Cancelled on shutdown or when the connection pool is released
    shutdown: CancellationToken,
    last_round: Mutex<Option<Instant>>,
    /// Completion signal of the on-demand round in flight, if any
    refresh: Mutex<Option<watch::Receiver<bool>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ClusterMonitor {
    pub fn new(
        cluster: Arc<SearchCluster>,
        pinger: Arc<dyn Pinger>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            cluster,
            pinger,
            shutdown,
            last_round: Mutex::new(None),
            refresh: Mutex::new(None),
            task: Mutex::new(None),
        })
    }

    pub fn cluster(&self) -> &Arc<SearchCluster> {
        &self.cluster
    }

    /// Start the background ping loop. Calling this twice is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }
        let monitor = Arc::clone(self);
        *task = Some(tokio::spawn(async move { monitor.run().await }));
    }

    async fn run(&self) {
        let mut interval = tokio::time::interval(self.cluster.config().ping_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            "Starting cluster monitor for '{}' ({} nodes, every {:?})",
            self.cluster.name(),
            self.cluster.nodes().len(),
            self.cluster.config().ping_interval()
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    tokio::select! {
                        _ = self.ping_round() => {}
                        _ = self.shutdown.cancelled() => break,
                    }
                }
                _ = self.shutdown.cancelled() => break,
            }
        }
        info!("Cluster monitor for '{}' stopped", self.cluster.name());
    }

    /// Ping every node once, concurrently, each bounded by the ping timeout.
    pub async fn ping_round(&self) -> PingRound {
        let timeout = self.cluster.config().ping_timeout();
        let pings = self.cluster.nodes().iter().map(|node| async move {
            let result = match tokio::time::timeout(timeout, self.pinger.ping(node)).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout(format!(
                    "no answer when pinging {} within {:?}",
                    node, timeout
                ))),
            };
            self.cluster.handle_pong(node, result)
        });

        let outcomes = join_all(pings).await;
        let responded = outcomes.iter().filter(|ok| **ok).count();
        let round = PingRound {
            responded,
            failed: outcomes.len() - responded,
        };

        *self.last_round.lock() = Some(Instant::now());
        self.cluster.update_rotation();

        if round.failed > 0 {
            warn!(
                cluster = %self.cluster.name(),
                responded = round.responded,
                failed = round.failed,
                "Ping round completed with failures"
            );
        } else {
            debug!(cluster = %self.cluster.name(), responded = round.responded, "Ping round completed");
        }
        round
    }

    /// Completion time of the most recent ping round.
    pub fn last_ping_round(&self) -> Option<Instant> {
        *self.last_round.lock()
    }

    fn is_stale(&self) -> bool {
        match self.last_ping_round() {
            Some(at) => at.elapsed() > self.cluster.config().ping_interval(),
            None => true,
        }
    }

    /// Refresh health if the last round is older than one ping interval.
    ///
    /// Concurrent callers share a single round, which runs in the background
    /// and is bounded by the ping timeout as usual. Each caller waits for it
    /// at most `wait`. Returns whether a fresh round completed in that time.
    pub async fn ensure_fresh(self: &Arc<Self>, wait: Duration) -> bool {
        if !self.is_stale() || self.shutdown.is_cancelled() {
            return false;
        }

        let mut done = {
            let mut refresh = self.refresh.lock();
            let in_flight = refresh.as_ref().filter(|rx| {
                let finished = *rx.borrow();
                !finished && rx.has_changed().is_ok()
            });
            match in_flight {
                Some(rx) => rx.clone(),
                None => {
                    let (tx, rx) = watch::channel(false);
                    let monitor = Arc::clone(self);
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = monitor.ping_round() => {
                                let _ = tx.send(true);
                            }
                            _ = monitor.shutdown.cancelled() => {}
                        }
                    });
                    debug!(cluster = %self.cluster.name(), "Started on-demand ping round");
                    *refresh = Some(rx.clone());
                    rx
                }
            }
        };

        let finished = async {
            loop {
                if *done.borrow_and_update() {
                    return true;
                }
                if done.changed().await.is_err() {
                    return false;
                }
            }
        };
        tokio::time::timeout(wait, finished).await.unwrap_or(false)
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .map(|t| !t.is_finished())
            .unwrap_or(false)
    }

    /// Stop the loop and wait for it to drain.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Cluster monitor task ended abnormally: {}", e);
            }
        }
    }
}
