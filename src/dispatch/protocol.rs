//! Request and reply payloads exchanged with content nodes
//!
//! Search, ping and protobuf docsum calls use prost messages. The legacy
//! docsum call carries a JSON body instead. Both docsum replies decode to the
//! same `{"docsums": [{"docsum": {...}}, ...]}` document.

use crate::{Error, Result};
use prost::Message;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

pub const METHOD_SEARCH: &str = "vespa.searchprotocol.search";
pub const METHOD_PING: &str = "vespa.searchprotocol.ping";
pub const METHOD_DOCSUM: &str = "vespa.searchprotocol.getDocsums";
pub const METHOD_LEGACY_DOCSUM: &str = "proton.getDocsums";

const GLOBAL_ID_LEN: usize = 12;

#[derive(Clone, PartialEq, Message)]
pub struct SearchRequest {
    #[prost(uint32, tag = "1")]
    pub offset: u32,
    #[prost(uint32, tag = "2")]
    pub hits: u32,
    #[prost(uint32, tag = "3")]
    pub timeout_ms: u32,
    #[prost(string, tag = "4")]
    pub ranking: String,
    #[prost(bytes = "vec", tag = "5")]
    pub query_tree_blob: Vec<u8>,
    #[prost(uint32, tag = "6")]
    pub trace_level: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct SearchReply {
    #[prost(uint64, tag = "1")]
    pub total_hit_count: u64,
    #[prost(uint64, tag = "2")]
    pub coverage_docs: u64,
    #[prost(uint64, tag = "3")]
    pub active_docs: u64,
    #[prost(uint64, tag = "4")]
    pub soon_active_docs: u64,
    #[prost(bool, tag = "5")]
    pub degraded_by_match_phase: bool,
    #[prost(bool, tag = "6")]
    pub degraded_by_soft_timeout: bool,
    #[prost(message, repeated, tag = "7")]
    pub hits: Vec<ReplyHit>,
    #[prost(message, repeated, tag = "8")]
    pub errors: Vec<ReplyError>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ReplyHit {
    #[prost(bytes = "vec", tag = "1")]
    pub global_id: Vec<u8>,
    #[prost(double, tag = "2")]
    pub relevance: f64,
}

#[derive(Clone, PartialEq, Message)]
pub struct ReplyError {
    #[prost(string, tag = "1")]
    pub message: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct DocsumRequest {
    #[prost(uint32, tag = "1")]
    pub timeout_ms: u32,
    #[prost(string, tag = "2")]
    pub summary_class: String,
    #[prost(bytes = "vec", repeated, tag = "3")]
    pub global_ids: Vec<Vec<u8>>,
    #[prost(string, tag = "4")]
    pub ranking: String,
    #[prost(bytes = "vec", tag = "5")]
    pub query_tree_blob: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct DocsumReply {
    /// JSON document with a top-level `docsums` array
    #[prost(bytes = "vec", tag = "1")]
    pub summaries: Vec<u8>,
    #[prost(message, repeated, tag = "2")]
    pub errors: Vec<ReplyError>,
}

#[derive(Clone, PartialEq, Message)]
pub struct MonitorRequest {}

#[derive(Clone, PartialEq, Message)]
pub struct MonitorReply {
    #[prost(bool, tag = "1")]
    pub online: bool,
    #[prost(uint64, tag = "2")]
    pub active_docs: u64,
}

/// Document global id.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GlobalId(pub [u8; GLOBAL_ID_LEN]);

impl GlobalId {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl TryFrom<&[u8]> for GlobalId {
    type Error = Error;

    fn try_from(raw: &[u8]) -> Result<Self> {
        let bytes: [u8; GLOBAL_ID_LEN] = raw.try_into().map_err(|_| {
            Error::Protocol(format!(
                "global id must be {} bytes, got {}",
                GLOBAL_ID_LEN,
                raw.len()
            ))
        })?;
        Ok(GlobalId(bytes))
    }
}

impl fmt::Debug for GlobalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GlobalId(")?;
        for b in self.0 {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ")")
    }
}

/// A ranked hit as returned by one node.
#[derive(Debug, Clone, PartialEq)]
pub struct Hit {
    pub global_id: GlobalId,
    pub relevance: f64,
    /// Node that produced the hit, and the one its summary is fetched from
    pub distribution_key: u32,
}

/// Coverage reported by one node for one search.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeCoverage {
    pub docs: u64,
    pub active_docs: u64,
    pub soon_active_docs: u64,
    pub degraded_by_match_phase: bool,
    pub degraded_by_soft_timeout: bool,
}

/// Decoded answer to a search request from one node.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    pub total_hit_count: u64,
    pub hits: Vec<Hit>,
    pub coverage: NodeCoverage,
    /// Soft errors the node reported alongside its hits
    pub errors: Vec<String>,
}

impl SearchResult {
    pub fn from_reply(reply: SearchReply, distribution_key: u32) -> Result<Self> {
        let hits = reply
            .hits
            .iter()
            .map(|h| {
                Ok(Hit {
                    global_id: GlobalId::try_from(h.global_id.as_slice())?,
                    relevance: h.relevance,
                    distribution_key,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            total_hit_count: reply.total_hit_count,
            hits,
            coverage: NodeCoverage {
                docs: reply.coverage_docs,
                active_docs: reply.active_docs,
                soon_active_docs: reply.soon_active_docs,
                degraded_by_match_phase: reply.degraded_by_match_phase,
                degraded_by_soft_timeout: reply.degraded_by_soft_timeout,
            },
            errors: reply.errors.into_iter().map(|e| e.message).collect(),
        })
    }
}

/// Summary fields for one hit.
pub type DocumentSummary = Map<String, Value>;

#[derive(Debug, Serialize, Deserialize)]
struct LegacyDocsumRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    class: Option<String>,
    gids: Vec<Vec<u8>>,
}

/// How docsum requests are encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummaryEncoding {
    Protobuf,
    Legacy,
}

impl SummaryEncoding {
    pub fn method(&self) -> &'static str {
        match self {
            SummaryEncoding::Protobuf => METHOD_DOCSUM,
            SummaryEncoding::Legacy => METHOD_LEGACY_DOCSUM,
        }
    }

    pub fn encode_request(
        &self,
        summary_class: Option<&str>,
        hits: &[Hit],
        ranking: &str,
        query_tree: &[u8],
        timeout_ms: u32,
    ) -> Result<Vec<u8>> {
        match self {
            SummaryEncoding::Protobuf => {
                let request = DocsumRequest {
                    timeout_ms,
                    summary_class: summary_class.unwrap_or_default().to_string(),
                    global_ids: hits.iter().map(|h| h.global_id.as_bytes().to_vec()).collect(),
                    ranking: ranking.to_string(),
                    query_tree_blob: query_tree.to_vec(),
                };
                Ok(request.encode_to_vec())
            }
            SummaryEncoding::Legacy => {
                let request = LegacyDocsumRequest {
                    class: summary_class.map(str::to_string),
                    gids: hits.iter().map(|h| h.global_id.as_bytes().to_vec()).collect(),
                };
                serde_json::to_vec(&request).map_err(|e| Error::Encode(e.to_string()))
            }
        }
    }

    /// Decode a docsum reply, expecting one summary per requested hit.
    pub fn decode_reply(&self, body: &[u8], expected: usize) -> Result<Vec<DocumentSummary>> {
        match self {
            SummaryEncoding::Protobuf => {
                let reply = DocsumReply::decode(body)?;
                if let Some(error) = reply.errors.first() {
                    return Err(Error::Protocol(format!(
                        "node reported docsum error: {}",
                        error.message
                    )));
                }
                parse_docsums(&reply.summaries, expected)
            }
            SummaryEncoding::Legacy => parse_docsums(body, expected),
        }
    }
}

fn parse_docsums(body: &[u8], expected: usize) -> Result<Vec<DocumentSummary>> {
    let root: Value = serde_json::from_slice(body)?;
    let Some(entries) = root.get("docsums").and_then(Value::as_array) else {
        return Err(Error::Protocol(
            "expected a root object containing a 'docsums' array".to_string(),
        ));
    };
    if entries.len() != expected {
        return Err(Error::Protocol(format!(
            "expected {} docsums, got {}",
            expected,
            entries.len()
        )));
    }
    Ok(entries
        .iter()
        .map(|entry| {
            entry
                .get("docsum")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default()
        })
        .collect())
}
