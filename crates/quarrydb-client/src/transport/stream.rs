//! Single-endpoint binary multiplexed stream transport (spec §4.2
//! "C2: Transport", binary variant).
//!
//! Multiple in-flight requests share one TCP connection. Each outbound
//! message is tagged with a monotonically increasing id; a background
//! reader task demultiplexes inbound frames back to the caller awaiting
//! that id. Grounded on the `RwLock`-guarded shared-state pattern used by
//! `ModelPool` (`model_pool.rs`) for the dispatch table, and on
//! `circuit_breaker::state`'s atomic-flag style for the connection's
//! liveness flag.
//!
//! Wire framing differs by direction, since a request has no status code
//! and a response always does:
//!
//! - outbound (request): `[u64 id][u32 header_len][header bytes][u64 body_len][body bytes]`
//! - inbound (response): `[u64 id][u16 status][u32 header_len][header bytes][u64 body_len][body bytes]`
//!
//! Header bytes are a bincode-encoded `BTreeMap<String, String>` in both
//! directions.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use error_stack::Report;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::oneshot;
use tracing::{instrument, warn};

use crate::codec::ContentType;
use crate::context::RequestContext;
use crate::error::{ClientError, Result};
use crate::request::{Body, Request};
use crate::response::Response;

use super::Connection;

type PendingMap = Arc<Mutex<std::collections::HashMap<u64, oneshot::Sender<Result<Response>>>>>;

pub struct StreamTransportConfig {
    pub endpoint: String,
    pub content_type: ContentType,
}

/// A connection multiplexed over one TCP stream. Connecting is lazy: the
/// first call to `do_request` dials and spawns the reader task.
pub struct StreamTransport {
    endpoint: String,
    content_type: ContentType,
    next_id: AtomicU64,
    pending: PendingMap,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    alive: AtomicBool,
    connect_lock: tokio::sync::Mutex<()>,
}

impl StreamTransport {
    pub fn new(config: StreamTransportConfig) -> Self {
        Self {
            endpoint: config.endpoint,
            content_type: config.content_type,
            next_id: AtomicU64::new(1),
            pending: Arc::new(Mutex::new(std::collections::HashMap::new())),
            writer: tokio::sync::Mutex::new(None),
            alive: AtomicBool::new(false),
            connect_lock: tokio::sync::Mutex::new(()),
        }
    }

    async fn ensure_connected(&self) -> Result<()> {
        if self.alive.load(Ordering::Acquire) {
            return Ok(());
        }
        let _guard = self.connect_lock.lock().await;
        if self.alive.load(Ordering::Acquire) {
            return Ok(());
        }

        let stream = TcpStream::connect(&self.endpoint)
            .await
            .map_err(|e| Report::new(ClientError::Transport(format!("connecting to {}: {e}", self.endpoint))))?;
        let (mut read_half, write_half) = stream.into_split();

        *self.writer.lock().await = Some(write_half);
        self.alive.store(true, Ordering::Release);

        let pending = Arc::clone(&self.pending);
        let alive_flag_endpoint = self.endpoint.clone();
        tokio::spawn(async move {
            loop {
                match read_frame(&mut read_half).await {
                    Ok((id, response)) => {
                        if let Some(tx) = pending.lock().remove(&id) {
                            let _ = tx.send(Ok(response));
                        }
                    }
                    Err(_) => {
                        warn!(endpoint = %alive_flag_endpoint, "stream transport connection lost");
                        let mut waiting = pending.lock();
                        for (_, tx) in waiting.drain() {
                            let _ = tx.send(Err(Report::new(ClientError::ConnectionLost)));
                        }
                        break;
                    }
                }
            }
        });

        Ok(())
    }
}

#[async_trait]
impl Connection for StreamTransport {
    #[instrument(skip(self, ctx), fields(endpoint = %self.endpoint, path = %req.path()))]
    async fn do_request(&self, ctx: &RequestContext, req: Request) -> Result<Response> {
        self.ensure_connected().await?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let body_value = match req.body() {
            Body::None => serde_json::Value::Null,
            Body::Single(v) => (**v).clone(),
            Body::Array { items, .. } => serde_json::Value::Array(items.clone()),
            Body::ImportArray(items) => serde_json::Value::Array(items.clone()),
            Body::Raw { bytes, .. } => {
                serde_json::from_slice(bytes).unwrap_or(serde_json::Value::Null)
            }
        };
        let encoded_body = self.content_type.encode(&body_value)?;

        let mut headers: BTreeMap<String, String> = req.headers().clone();
        headers.insert("x-stream-method".into(), req.method().as_str().to_string());
        headers.insert("x-stream-path".into(), req.path().to_string());
        for (k, v) in req.query_params() {
            headers.insert(format!("x-stream-query-{k}"), v.clone());
        }
        let header_bytes = bincode::serialize(&headers)
            .map_err(|e| Report::new(ClientError::Transport(format!("encoding stream headers: {e}"))))?;

        let mut frame = Vec::with_capacity(8 + 2 + 4 + header_bytes.len() + 8 + encoded_body.len());
        frame.extend_from_slice(&id.to_be_bytes());
        frame.extend_from_slice(&(header_bytes.len() as u32).to_be_bytes());
        frame.extend_from_slice(&header_bytes);
        frame.extend_from_slice(&(encoded_body.len() as u64).to_be_bytes());
        frame.extend_from_slice(&encoded_body);

        {
            let mut writer_guard = self.writer.lock().await;
            let writer = writer_guard
                .as_mut()
                .ok_or_else(|| Report::new(ClientError::ConnectionLost))?;
            req.mark_written();
            writer
                .write_all(&frame)
                .await
                .map_err(|e| Report::new(ClientError::ResponseError(e.to_string())))?;
        }

        tokio::select! {
            biased;
            _ = ctx.cancel_token().cancelled() => {
                self.pending.lock().remove(&id);
                Err(Report::new(ClientError::Canceled))
            }
            _ = tokio::time::sleep(ctx.remaining()) => {
                self.pending.lock().remove(&id);
                Err(Report::new(ClientError::DeadlineExceeded))
            }
            result = rx => {
                result.map_err(|_| Report::new(ClientError::ConnectionLost))?
            }
        }
    }

    fn endpoints(&self) -> Vec<String> {
        vec![self.endpoint.clone()]
    }

    async fn update_endpoints(&self, endpoints: Vec<String>) -> Result<()> {
        if endpoints.len() == 1 && endpoints[0] == self.endpoint {
            return Ok(());
        }
        Err(Report::new(ClientError::InvalidArgument(
            "a single-endpoint stream transport cannot change its endpoint".into(),
        )))
    }

    fn protocols(&self) -> ContentType {
        self.content_type
    }
}

async fn read_frame(reader: &mut tokio::net::tcp::OwnedReadHalf) -> std::io::Result<(u64, Response)> {
    let mut id_buf = [0u8; 8];
    reader.read_exact(&mut id_buf).await?;
    let id = u64::from_be_bytes(id_buf);

    let mut status_buf = [0u8; 2];
    reader.read_exact(&mut status_buf).await?;
    let status = u16::from_be_bytes(status_buf);

    let mut header_len_buf = [0u8; 4];
    reader.read_exact(&mut header_len_buf).await?;
    let header_len = u32::from_be_bytes(header_len_buf) as usize;
    let mut header_bytes = vec![0u8; header_len];
    reader.read_exact(&mut header_bytes).await?;
    let headers: BTreeMap<String, String> = bincode::deserialize(&header_bytes).unwrap_or_default();

    let mut body_len_buf = [0u8; 8];
    reader.read_exact(&mut body_len_buf).await?;
    let body_len = u64::from_be_bytes(body_len_buf) as usize;
    let mut body = vec![0u8; body_len];
    reader.read_exact(&mut body).await?;

    let content_type = headers.get("content-type").cloned().unwrap_or_else(|| "application/x-velocypack".to_string());
    Ok((id, Response::new(status, headers, body.into(), content_type)))
}
