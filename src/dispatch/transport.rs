//! RPC transport abstraction
//!
//! Dispatch talks to content nodes through [`NodeConnection`]s handed out by
//! an [`RpcClient`]. A connection is a long-lived multiplexed channel; many
//! requests may be in flight on one connection at a time. Deadlines are
//! enforced by the caller, not the transport.

use super::compression::{Compressed, CompressionType};
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;

/// An outgoing RPC call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcRequest {
    pub method: String,
    pub compression: CompressionType,
    pub uncompressed_len: u32,
    pub payload: Bytes,
}

impl RpcRequest {
    pub fn new(method: impl Into<String>, body: Compressed) -> Self {
        Self {
            method: method.into(),
            compression: body.compression,
            uncompressed_len: body.uncompressed_len,
            payload: body.data,
        }
    }
}

/// The answer to an [`RpcRequest`], still compressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcResponse {
    pub compression: CompressionType,
    pub uncompressed_len: u32,
    pub payload: Bytes,
}

impl RpcResponse {
    pub fn new(body: Compressed) -> Self {
        Self {
            compression: body.compression,
            uncompressed_len: body.uncompressed_len,
            payload: body.data,
        }
    }
}

/// One multiplexed channel to one content node.
#[async_trait]
pub trait NodeConnection: Send + Sync + fmt::Debug {
    /// `host:port` of the remote end
    fn endpoint(&self) -> &str;

    /// Send `request` and wait for its response.
    async fn request(&self, request: RpcRequest) -> Result<RpcResponse>;

    /// Close the channel. Pending and later requests fail with
    /// [`crate::Error::TransportClosed`].
    fn close(&self);
}

/// Factory for connections; one client corresponds to one transport
/// supervisor, and each client opens one connection per node.
pub trait RpcClient: Send + Sync {
    fn create_connection(&self, host: &str, port: u16) -> Arc<dyn NodeConnection>;
}
