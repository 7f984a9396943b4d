//! The query as seen by the dispatch core
//!
//! Parsing and ranking happen upstream; dispatch only needs the time budget,
//! a few `dispatch.*` properties and the opaque serialized query tree.

use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Enables direct dispatch to the local content node
pub const DISPATCH_DIRECT: &str = "dispatch.direct";
/// Compression codec for outgoing payloads ("lz4" or "none")
pub const DISPATCH_COMPRESSION: &str = "dispatch.compression";
/// Fill summaries through the legacy docsum encoding
pub const DISPATCH_SUMMARIES: &str = "dispatch.summaries";
/// Use protobuf encoding for docsum requests (default on)
pub const DISPATCH_PROTOBUF: &str = "dispatch.protobuf";

/// Per-query string properties.
#[derive(Debug, Clone, Default)]
pub struct Properties {
    values: HashMap<String, String>,
}

impl Properties {
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    pub fn get_str<'a>(&'a self, name: &str, default: &'a str) -> &'a str {
        self.get(name).unwrap_or(default)
    }

    /// Boolean lookup; anything other than a recognised true/false spelling
    /// falls back to `default`.
    pub fn get_bool(&self, name: &str, default: bool) -> bool {
        match self.get(name).map(|v| v.trim().to_ascii_lowercase()) {
            Some(v) if matches!(v.as_str(), "true" | "1" | "yes" | "on") => true,
            Some(v) if matches!(v.as_str(), "false" | "0" | "no" | "off") => false,
            _ => default,
        }
    }
}

/// A fully-formed query ready for dispatch.
#[derive(Debug, Clone)]
pub struct Query {
    started: Instant,
    timeout: Duration,
    properties: Properties,
    offset: u32,
    hits: u32,
    ranking: String,
    query_tree: Vec<u8>,
    summary_class: Option<String>,
    summary_needs_query: bool,
    trace_level: u32,
}

impl Query {
    /// Create a query whose time budget starts now.
    pub fn new(timeout: Duration) -> Self {
        Self {
            started: Instant::now(),
            timeout,
            properties: Properties::default(),
            offset: 0,
            hits: 10,
            ranking: "default".to_string(),
            query_tree: Vec::new(),
            summary_class: None,
            summary_needs_query: false,
            trace_level: 0,
        }
    }

    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.set(name, value);
        self
    }

    pub fn with_hits(mut self, offset: u32, hits: u32) -> Self {
        self.offset = offset;
        self.hits = hits;
        self
    }

    pub fn with_ranking(mut self, ranking: impl Into<String>) -> Self {
        self.ranking = ranking.into();
        self
    }

    pub fn with_query_tree(mut self, blob: Vec<u8>) -> Self {
        self.query_tree = blob;
        self
    }

    pub fn with_summary_class(mut self, class: impl Into<String>) -> Self {
        self.summary_class = Some(class.into());
        self
    }

    /// Mark that summaries for this query depend on the query itself
    /// (e.g. dynamic snippets), which forces the protobuf docsum path.
    pub fn with_summary_needs_query(mut self, needs_query: bool) -> Self {
        self.summary_needs_query = needs_query;
        self
    }

    pub fn with_trace_level(mut self, level: u32) -> Self {
        self.trace_level = level;
        self
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn properties_mut(&mut self) -> &mut Properties {
        &mut self.properties
    }

    pub fn offset(&self) -> u32 {
        self.offset
    }

    pub fn hits(&self) -> u32 {
        self.hits
    }

    pub fn ranking(&self) -> &str {
        &self.ranking
    }

    pub fn query_tree(&self) -> &[u8] {
        &self.query_tree
    }

    pub fn summary_class(&self) -> Option<&str> {
        self.summary_class.as_deref()
    }

    pub fn summary_needs_query(&self) -> bool {
        self.summary_needs_query
    }

    pub fn trace_level(&self) -> u32 {
        self.trace_level
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Point in time at which the query's budget is spent.
    pub fn deadline(&self) -> Instant {
        self.started + self.timeout
    }

    pub fn time_left(&self) -> Duration {
        self.deadline().saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        self.time_left().is_zero()
    }

    pub fn direct_dispatch_requested(&self) -> bool {
        self.properties.get_bool(DISPATCH_DIRECT, false)
    }
}
