//! Single-use RPC invokers
//!
//! An invoker runs exactly one request/response exchange against one node:
//!
//! ```text
//! Created -> Sent -> AwaitingResponse -> Completed | Failed | TimedOut
//! ```
//!
//! The wait is bounded by the query deadline. A timeout or transport error
//! is reported to the node's health monitor; errors raised before anything
//! is sent (unknown node, encode failure) never are. Dropping an invoker's
//! future abandons it without touching health state.

use super::pool::RpcResourcePool;
use super::protocol::{
    DocumentSummary, Hit, SearchReply, SearchRequest, SearchResult, SummaryEncoding, METHOD_SEARCH,
};
use super::transport::RpcRequest;
use crate::cluster::Node;
use crate::error::ErrorKind;
use crate::query::Query;
use crate::telemetry::{INVOKER_LATENCY, INVOKER_OUTCOME};
use crate::{Error, Result};
use bytes::Bytes;
use prost::Message;
use std::fmt;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvokerState {
    Created,
    Sent,
    AwaitingResponse,
    Completed,
    Failed,
    TimedOut,
}

impl InvokerState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InvokerState::Completed | InvokerState::Failed | InvokerState::TimedOut
        )
    }
}

/// What one node produced for one request.
#[derive(Debug)]
pub enum Outcome<T> {
    Completed(T),
    TimedOut,
    Failed(Error),
}

impl<T> Outcome<T> {
    pub fn is_completed(&self) -> bool {
        matches!(self, Outcome::Completed(_))
    }

    pub fn is_timed_out(&self) -> bool {
        matches!(self, Outcome::TimedOut)
    }

    pub fn ok(self) -> Option<T> {
        match self {
            Outcome::Completed(value) => Some(value),
            _ => None,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Outcome::Completed(_) => "completed",
            Outcome::TimedOut => "timed_out",
            Outcome::Failed(e) => e.kind().as_str(),
        }
    }
}

#[derive(Debug)]
pub struct NodeOutcome<T> {
    pub node_key: u32,
    pub outcome: Outcome<T>,
}

/// The state machine both invoker flavors share.
struct Exchange {
    kind: &'static str,
    node: Arc<Node>,
    pool: Arc<RpcResourcePool>,
    state: InvokerState,
}

impl fmt::Debug for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exchange")
            .field("kind", &self.kind)
            .field("node", &self.node.key())
            .field("state", &self.state)
            .finish()
    }
}

impl Exchange {
    fn new(kind: &'static str, node: Arc<Node>, pool: Arc<RpcResourcePool>) -> Self {
        Self {
            kind,
            node,
            pool,
            state: InvokerState::Created,
        }
    }

    /// Send `payload` and wait for the decompressed response body.
    ///
    /// A reply never calls `responded()`; only pings bring a node back.
    async fn call(&mut self, query: &Query, method: &str, payload: Vec<u8>) -> Outcome<Bytes> {
        if self.state != InvokerState::Created {
            return Outcome::Failed(Error::Internal(format!(
                "{} invoker for {} was already used",
                self.kind, self.node
            )));
        }

        let body = match self.pool.compress(query, &payload) {
            Ok(body) => body,
            Err(e) => return self.fail_before_send(e),
        };
        let connection = match self.pool.get_connection(self.node.key()) {
            Ok(connection) => connection,
            Err(e) => return self.fail_before_send(e),
        };
        self.state = InvokerState::Sent;

        let request = connection.request(RpcRequest::new(method, body));
        self.state = InvokerState::AwaitingResponse;

        match tokio::time::timeout_at(query.deadline(), request).await {
            Err(_) => self.time_out(query),
            Ok(Err(e)) if e.is_timeout() => self.time_out(query),
            Ok(Err(e)) => {
                debug!(node = %self.node, error = %e, "{} request failed", self.kind);
                self.node.monitor().failed(e.kind());
                self.state = InvokerState::Failed;
                Outcome::Failed(e)
            }
            Ok(Ok(response)) => {
                let decompressed = self.pool.compressor().decompress(
                    response.compression,
                    &response.payload,
                    response.uncompressed_len,
                );
                match decompressed {
                    Ok(bytes) => Outcome::Completed(bytes),
                    Err(e) => self.fail_decode(e),
                }
            }
        }
    }

    fn fail_before_send(&mut self, error: Error) -> Outcome<Bytes> {
        debug!(node = %self.node, error = %error, "{} request not sent", self.kind);
        self.state = InvokerState::Failed;
        Outcome::Failed(error)
    }

    fn fail_decode<T>(&mut self, error: Error) -> Outcome<T> {
        debug!(node = %self.node, error = %error, "Undecodable {} response", self.kind);
        self.node.monitor().failed(ErrorKind::Protocol);
        self.state = InvokerState::Failed;
        Outcome::Failed(error)
    }

    fn time_out<T>(&mut self, query: &Query) -> Outcome<T> {
        debug!(
            node = %self.node,
            timeout = ?query.timeout(),
            "{} request timed out",
            self.kind
        );
        self.node.monitor().failed(ErrorKind::Connectivity);
        self.state = InvokerState::TimedOut;
        Outcome::TimedOut
    }

    fn complete<T>(&mut self, value: T) -> Outcome<T> {
        self.state = InvokerState::Completed;
        Outcome::Completed(value)
    }

    fn record<T>(&self, outcome: &Outcome<T>, started: Instant) {
        metrics::counter!(INVOKER_OUTCOME, "kind" => self.kind, "outcome" => outcome.label())
            .increment(1);
        metrics::histogram!(INVOKER_LATENCY, "kind" => self.kind)
            .record(started.elapsed().as_secs_f64());
    }
}

fn timeout_ms(query: &Query) -> u32 {
    u32::try_from(query.time_left().as_millis()).unwrap_or(u32::MAX)
}

/// Issues the ranked-result request to one node.
#[derive(Debug)]
pub struct SearchInvoker {
    exchange: Exchange,
}

impl SearchInvoker {
    pub fn new(node: Arc<Node>, pool: Arc<RpcResourcePool>) -> Self {
        Self {
            exchange: Exchange::new("search", node, pool),
        }
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.exchange.node
    }

    pub fn state(&self) -> InvokerState {
        self.exchange.state
    }

    /// Run the search. Each node is asked for `offset + hits` hits from
    /// offset zero so the caller can merge and page across nodes.
    pub async fn search(&mut self, query: &Query) -> Outcome<SearchResult> {
        let started = Instant::now();
        let request = SearchRequest {
            offset: 0,
            hits: query.offset().saturating_add(query.hits()),
            timeout_ms: timeout_ms(query),
            ranking: query.ranking().to_string(),
            query_tree_blob: query.query_tree().to_vec(),
            trace_level: query.trace_level(),
        };

        let outcome = match self
            .exchange
            .call(query, METHOD_SEARCH, request.encode_to_vec())
            .await
        {
            Outcome::Completed(body) => match decode_search(&body, self.exchange.node.key()) {
                Ok(result) => self.exchange.complete(result),
                Err(e) => self.exchange.fail_decode(e),
            },
            Outcome::TimedOut => Outcome::TimedOut,
            Outcome::Failed(e) => Outcome::Failed(e),
        };
        self.exchange.record(&outcome, started);
        outcome
    }
}

fn decode_search(body: &[u8], key: u32) -> Result<SearchResult> {
    SearchResult::from_reply(SearchReply::decode(body)?, key)
}

/// Fetches document summaries for hits that one node produced.
#[derive(Debug)]
pub struct FillInvoker {
    exchange: Exchange,
    encoding: SummaryEncoding,
}

impl FillInvoker {
    pub fn new(node: Arc<Node>, pool: Arc<RpcResourcePool>, encoding: SummaryEncoding) -> Self {
        Self {
            exchange: Exchange::new("fill", node, pool),
            encoding,
        }
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.exchange.node
    }

    pub fn state(&self) -> InvokerState {
        self.exchange.state
    }

    pub fn encoding(&self) -> SummaryEncoding {
        self.encoding
    }

    /// Fetch one summary per hit, in hit order.
    pub async fn fill(&mut self, query: &Query, hits: &[Hit]) -> Outcome<Vec<DocumentSummary>> {
        let started = Instant::now();
        let query_tree: &[u8] = if query.summary_needs_query() {
            query.query_tree()
        } else {
            &[]
        };
        let payload = match self.encoding.encode_request(
            query.summary_class(),
            hits,
            query.ranking(),
            query_tree,
            timeout_ms(query),
        ) {
            Ok(payload) => payload,
            Err(e) => {
                self.exchange.state = InvokerState::Failed;
                return Outcome::Failed(e);
            }
        };

        let outcome = match self.exchange.call(query, self.encoding.method(), payload).await {
            Outcome::Completed(body) => match self.encoding.decode_reply(&body, hits.len()) {
                Ok(summaries) => self.exchange.complete(summaries),
                Err(e) => self.exchange.fail_decode(e),
            },
            Outcome::TimedOut => Outcome::TimedOut,
            Outcome::Failed(e) => Outcome::Failed(e),
        };
        self.exchange.record(&outcome, started);
        outcome
    }
}
