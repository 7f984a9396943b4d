//! Multiplexed TCP transport
//!
//! Each [`TcpConnection`] lazily opens one socket and keeps it for the
//! lifetime of the connection, reconnecting on the next request after the
//! link drops. Frames are length-delimited; inside a frame:
//!
//! ```text
//! id: u64 | kind: u8 | method_len: u16 | method | compression: u8 | uncompressed_len: u32 | payload
//! ```
//!
//! Replies carry the id of the request they answer, so any number of
//! requests may be outstanding on one socket.

use super::compression::CompressionType;
use super::transport::{NodeConnection, RpcClient, RpcRequest, RpcResponse};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const KIND_REQUEST: u8 = 0;
const KIND_REPLY: u8 = 1;
const KIND_ERROR: u8 = 2;
const HEADER_LEN: usize = 8 + 1 + 2 + 1 + 4;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Frame {
    id: u64,
    kind: u8,
    method: String,
    compression: CompressionType,
    uncompressed_len: u32,
    payload: Bytes,
}

impl Frame {
    fn request(id: u64, request: RpcRequest) -> Self {
        Self {
            id,
            kind: KIND_REQUEST,
            method: request.method,
            compression: request.compression,
            uncompressed_len: request.uncompressed_len,
            payload: request.payload,
        }
    }

    fn reply(id: u64, response: RpcResponse) -> Self {
        Self {
            id,
            kind: KIND_REPLY,
            method: String::new(),
            compression: response.compression,
            uncompressed_len: response.uncompressed_len,
            payload: response.payload,
        }
    }

    fn error(id: u64, message: String) -> Self {
        let payload = Bytes::from(message.into_bytes());
        Self {
            id,
            kind: KIND_ERROR,
            method: String::new(),
            compression: CompressionType::None,
            uncompressed_len: payload.len() as u32,
            payload,
        }
    }

    fn encode(&self) -> Result<Bytes> {
        let method_len = u16::try_from(self.method.len())
            .map_err(|_| Error::Encode(format!("method name '{}' is too long", self.method)))?;
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.method.len() + self.payload.len());
        buf.put_u64(self.id);
        buf.put_u8(self.kind);
        buf.put_u16(method_len);
        buf.put_slice(self.method.as_bytes());
        buf.put_u8(self.compression.code());
        buf.put_u32(self.uncompressed_len);
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    fn decode(mut buf: Bytes) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(Error::Protocol(format!("frame of {} bytes is truncated", buf.len())));
        }
        let id = buf.get_u64();
        let kind = buf.get_u8();
        let method_len = buf.get_u16() as usize;
        if buf.len() < method_len + 5 {
            return Err(Error::Protocol("frame method overruns frame".to_string()));
        }
        let method = String::from_utf8(buf.split_to(method_len).to_vec())
            .map_err(|e| Error::Protocol(format!("method name is not utf-8: {e}")))?;
        let compression = CompressionType::from_code(buf.get_u8())?;
        let uncompressed_len = buf.get_u32();
        Ok(Self {
            id,
            kind,
            method,
            compression,
            uncompressed_len,
            payload: buf,
        })
    }
}

type PendingMap = DashMap<u64, (u64, oneshot::Sender<Result<RpcResponse>>)>;

/// Removes an outstanding request when its caller gives up.
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

struct Link {
    generation: u64,
    outbound: mpsc::UnboundedSender<Bytes>,
    alive: CancellationToken,
}

/// One logical channel to a content node over TCP.
pub struct TcpConnection {
    endpoint: String,
    next_id: AtomicU64,
    generation: AtomicU64,
    pending: Arc<PendingMap>,
    link: tokio::sync::Mutex<Option<Link>>,
    closed: CancellationToken,
}

impl fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConnection")
            .field("endpoint", &self.endpoint)
            .field("pending", &self.pending.len())
            .field("closed", &self.closed.is_cancelled())
            .finish()
    }
}

impl TcpConnection {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            endpoint: format!("{host}:{port}"),
            next_id: AtomicU64::new(1),
            generation: AtomicU64::new(0),
            pending: Arc::new(DashMap::new()),
            link: tokio::sync::Mutex::new(None),
            closed: CancellationToken::new(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Current outbound sender and link generation, connecting if needed.
    async fn outbound(&self) -> Result<(u64, mpsc::UnboundedSender<Bytes>)> {
        let mut link = self.link.lock().await;
        if let Some(current) = link.as_ref() {
            if !current.alive.is_cancelled() {
                return Ok((current.generation, current.outbound.clone()));
            }
        }

        let stream = TcpStream::connect(&self.endpoint)
            .await
            .map_err(|e| Error::Connectivity(format!("connect to {} failed: {}", self.endpoint, e)))?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(endpoint = %self.endpoint, error = %e, "Could not disable Nagle");
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::unbounded_channel();
        let alive = self.closed.child_token();
        tokio::spawn(drive_link(
            self.endpoint.clone(),
            generation,
            stream,
            rx,
            self.pending.clone(),
            alive.clone(),
        ));
        debug!(endpoint = %self.endpoint, generation, "Connected");

        *link = Some(Link {
            generation,
            outbound: tx.clone(),
            alive,
        });
        Ok((generation, tx))
    }
}

async fn drive_link(
    endpoint: String,
    generation: u64,
    stream: TcpStream,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
    pending: Arc<PendingMap>,
    alive: CancellationToken,
) {
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, LengthDelimitedCodec::new());
    let mut writer = FramedWrite::new(write_half, LengthDelimitedCodec::new());

    loop {
        tokio::select! {
            _ = alive.cancelled() => break,
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = writer.send(frame).await {
                    warn!(endpoint = %endpoint, error = %e, "Write failed, dropping link");
                    break;
                }
            }
            incoming = reader.next() => {
                let raw = match incoming {
                    Some(Ok(raw)) => raw.freeze(),
                    Some(Err(e)) => {
                        debug!(endpoint = %endpoint, error = %e, "Read failed, dropping link");
                        break;
                    }
                    None => {
                        debug!(endpoint = %endpoint, "Peer closed the connection");
                        break;
                    }
                };
                match Frame::decode(raw) {
                    Ok(frame) => complete(&pending, frame),
                    Err(e) => {
                        warn!(endpoint = %endpoint, error = %e, "Undecodable frame, dropping link");
                        break;
                    }
                }
            }
        }
    }

    alive.cancel();
    drop(outbound);
    // Dropping the senders wakes every request still waiting on this link
    pending.retain(|_, (g, _)| *g != generation);
}

fn complete(pending: &PendingMap, frame: Frame) {
    let Some((_, (_, tx))) = pending.remove(&frame.id) else {
        // Caller gave up already
        return;
    };
    let result = match frame.kind {
        KIND_REPLY => Ok(RpcResponse {
            compression: frame.compression,
            uncompressed_len: frame.uncompressed_len,
            payload: frame.payload,
        }),
        KIND_ERROR => Err(Error::Protocol(format!(
            "node reported: {}",
            String::from_utf8_lossy(&frame.payload)
        ))),
        other => Err(Error::Protocol(format!("unexpected frame kind {other}"))),
    };
    let _ = tx.send(result);
}

#[async_trait]
impl NodeConnection for TcpConnection {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn request(&self, request: RpcRequest) -> Result<RpcResponse> {
        if self.closed.is_cancelled() {
            return Err(Error::TransportClosed);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = Frame::request(id, request).encode()?;

        let (generation, outbound) = self.outbound().await?;
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, (generation, tx));
        let _guard = PendingGuard {
            pending: &self.pending,
            id,
        };

        outbound
            .send(frame)
            .map_err(|_| Error::Connectivity(format!("link to {} is down", self.endpoint)))?;

        tokio::select! {
            reply = rx => match reply {
                Ok(result) => result,
                Err(_) if self.closed.is_cancelled() => Err(Error::TransportClosed),
                Err(_) => Err(Error::Connectivity(format!("connection to {} lost", self.endpoint))),
            },
            _ = self.closed.cancelled() => Err(Error::TransportClosed),
        }
    }

    fn close(&self) {
        if !self.closed.is_cancelled() {
            debug!(endpoint = %self.endpoint, "Closing connection");
            self.closed.cancel();
        }
    }
}

/// Opens [`TcpConnection`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpRpcClient;

impl RpcClient for TcpRpcClient {
    fn create_connection(&self, host: &str, port: u16) -> Arc<dyn NodeConnection> {
        Arc::new(TcpConnection::new(host, port))
    }
}

/// Server side of the transport.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn handle(&self, request: RpcRequest) -> Result<RpcResponse>;
}

/// Accept connections on `listener` and answer every request with
/// `handler` until `shutdown` is cancelled.
pub async fn serve(
    listener: TcpListener,
    handler: Arc<dyn RpcHandler>,
    shutdown: CancellationToken,
) -> Result<()> {
    info!("Serving RPC on {}", listener.local_addr()?);
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                debug!(%peer, "Accepted connection");
                tokio::spawn(serve_connection(stream, handler.clone(), shutdown.child_token()));
            }
            _ = shutdown.cancelled() => break,
        }
    }
    Ok(())
}

async fn serve_connection(stream: TcpStream, handler: Arc<dyn RpcHandler>, shutdown: CancellationToken) {
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, LengthDelimitedCodec::new());
    let mut writer = FramedWrite::new(write_half, LengthDelimitedCodec::new());
    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            reply = rx.recv() => {
                let Some(reply) = reply else { break };
                let encoded = match reply.encode() {
                    Ok(encoded) => encoded,
                    Err(e) => {
                        warn!(error = %e, "Could not encode reply");
                        continue;
                    }
                };
                if writer.send(encoded).await.is_err() {
                    break;
                }
            }
            incoming = reader.next() => {
                let Some(Ok(raw)) = incoming else { break };
                let frame = match Frame::decode(raw.freeze()) {
                    Ok(frame) if frame.kind == KIND_REQUEST => frame,
                    Ok(frame) => {
                        debug!(kind = frame.kind, "Ignoring non-request frame");
                        continue;
                    }
                    Err(e) => {
                        warn!(error = %e, "Dropping connection after bad frame");
                        break;
                    }
                };
                let handler = handler.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let id = frame.id;
                    let request = RpcRequest {
                        method: frame.method,
                        compression: frame.compression,
                        uncompressed_len: frame.uncompressed_len,
                        payload: frame.payload,
                    };
                    let reply = match handler.handle(request).await {
                        Ok(response) => Frame::reply(id, response),
                        Err(e) => Frame::error(id, e.to_string()),
                    };
                    let _ = tx.send(reply);
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::compression::Compressed;
    use std::time::Duration;

    struct Echo;

    #[async_trait]
    impl RpcHandler for Echo {
        async fn handle(&self, request: RpcRequest) -> Result<RpcResponse> {
            match request.method.as_str() {
                "echo" => Ok(RpcResponse {
                    compression: request.compression,
                    uncompressed_len: request.uncompressed_len,
                    payload: request.payload,
                }),
                "slow" => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Err(Error::Internal("unreachable".into()))
                }
                other => Err(Error::Routing(format!("no method {other}"))),
            }
        }
    }

    fn body(data: &'static [u8]) -> Compressed {
        Compressed {
            compression: CompressionType::None,
            data: Bytes::from_static(data),
            uncompressed_len: data.len() as u32,
        }
    }

    async fn start_server() -> (String, u16, CancellationToken) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let shutdown = CancellationToken::new();
        tokio::spawn(serve(listener, Arc::new(Echo), shutdown.clone()));
        ("127.0.0.1".to_string(), port, shutdown)
    }

    #[test]
    fn test_frame_rejects_truncation() {
        let frame = Frame::request(7, RpcRequest::new("m", body(b"xyz")));
        let encoded = frame.encode().unwrap();
        assert_eq!(Frame::decode(encoded.clone()).unwrap(), frame);
        assert!(Frame::decode(encoded.slice(..5)).is_err());
    }

    #[tokio::test]
    async fn test_requests_are_multiplexed() {
        let (host, port, shutdown) = start_server().await;
        let conn = Arc::new(TcpConnection::new(&host, port));

        let calls = (0..8).map(|_| {
            let conn = conn.clone();
            async move { conn.request(RpcRequest::new("echo", body(b"payload"))).await }
        });
        for reply in futures::future::join_all(calls).await {
            assert_eq!(&reply.unwrap().payload[..], b"payload");
        }

        let err = conn
            .request(RpcRequest::new("missing", body(b"")))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_close_fails_pending_and_later_requests() {
        let (host, port, shutdown) = start_server().await;
        let conn = Arc::new(TcpConnection::new(&host, port));

        let waiting = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.request(RpcRequest::new("slow", body(b""))).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        conn.close();
        conn.close();

        assert!(matches!(waiting.await.unwrap(), Err(Error::TransportClosed)));
        let err = conn.request(RpcRequest::new("echo", body(b""))).await.unwrap_err();
        assert!(matches!(err, Error::TransportClosed));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_refused_connect_is_connectivity() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let conn = TcpConnection::new("127.0.0.1", port);
        let err = conn.request(RpcRequest::new("echo", body(b""))).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Connectivity);
    }
}
