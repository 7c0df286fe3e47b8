//! Newline-delimited JSON transport to the coordinator.
//!
//! One TCP connection carries every topic. Outbound frames are
//! `{ref, topic, event, payload}`; the coordinator answers with
//! `{ref, status, response}`. A reader task resolves pending replies by
//! `ref`; frames without a `ref` are server-initiated (e.g. cancellation)
//! and surface on the subscription stream returned by [`Socket::connect`].
//!
//! A single writer task serialises all sends, which is what preserves the
//! per-channel ordering guarantee.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};

use super::{Channel, ChannelError, ChannelProvider, PushAck, ReplyStatus};

#[derive(Debug, Serialize)]
struct OutboundFrame {
    #[serde(rename = "ref")]
    reference: u64,
    topic: String,
    event: String,
    payload: Value,
}

#[derive(Debug, Deserialize)]
struct InboundFrame {
    #[serde(rename = "ref")]
    reference: Option<u64>,
    #[serde(default)]
    topic: Option<String>,
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    response: Value,
    #[serde(default)]
    payload: Value,
}

/// A server-initiated message (no `ref`), e.g. a cancellation order.
#[derive(Debug, Clone)]
pub struct ServerFrame {
    pub topic: String,
    pub event: String,
    pub payload: Value,
}

struct SocketInner {
    writer: mpsc::Sender<OutboundFrame>,
    pending: Mutex<HashMap<u64, oneshot::Sender<ReplyStatus>>>,
    next_ref: AtomicU64,
}

/// Shared connection to the coordinator.
#[derive(Clone)]
pub struct Socket {
    inner: Arc<SocketInner>,
}

impl Socket {
    /// Connect to the coordinator at `host:port`. Returns the socket and
    /// the stream of server-initiated frames.
    pub async fn connect(addr: &str) -> Result<(Self, mpsc::Receiver<ServerFrame>), ChannelError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|err| ChannelError::Transport(err.to_string()))?;
        let (read_half, mut write_half) = stream.into_split();

        let (writer_tx, mut writer_rx) = mpsc::channel::<OutboundFrame>(64);
        let (server_tx, server_rx) = mpsc::channel::<ServerFrame>(64);

        let inner = Arc::new(SocketInner {
            writer: writer_tx,
            pending: Mutex::new(HashMap::new()),
            next_ref: AtomicU64::new(1),
        });

        tokio::spawn(async move {
            while let Some(frame) = writer_rx.recv().await {
                let mut line = match serde_json::to_string(&frame) {
                    Ok(line) => line,
                    Err(err) => {
                        warn!(?err, event = %frame.event, "dropping unserialisable frame");
                        continue;
                    }
                };
                line.push('\n');
                if write_half.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
            }
        });

        let reader_inner = Arc::clone(&inner);
        tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let frame: InboundFrame = match serde_json::from_str(&line) {
                            Ok(frame) => frame,
                            Err(err) => {
                                warn!(?err, "malformed coordinator frame");
                                continue;
                            }
                        };
                        match frame.reference {
                            Some(reference) => {
                                let sender = {
                                    let mut pending = reader_inner.pending.lock().await;
                                    pending.remove(&reference)
                                };
                                let Some(sender) = sender else {
                                    debug!(reference, "reply with no pending push");
                                    continue;
                                };
                                let status = if frame.status.as_deref() == Some("ok") {
                                    ReplyStatus::Ok(frame.response)
                                } else {
                                    ReplyStatus::Error(frame.response)
                                };
                                let _ = sender.send(status);
                            }
                            None => {
                                let server_frame = ServerFrame {
                                    topic: frame.topic.unwrap_or_default(),
                                    event: frame.event.unwrap_or_default(),
                                    payload: frame.payload,
                                };
                                if server_tx.send(server_frame).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        warn!(?err, "coordinator stream receive error");
                        break;
                    }
                }
            }
            // Connection gone: orphaned pushes resolve as Timeout when
            // their senders drop here.
            reader_inner.pending.lock().await.clear();
        });

        Ok((Socket { inner }, server_rx))
    }

    /// A channel bound to `topic` on this connection.
    pub fn channel(&self, topic: impl Into<String>) -> SocketChannel {
        SocketChannel {
            inner: Arc::clone(&self.inner),
            topic: topic.into(),
        }
    }
}

impl ChannelProvider for Socket {
    fn open(&self, topic: &str) -> Arc<dyn Channel> {
        Arc::new(self.channel(topic))
    }
}

/// One topic on a [`Socket`].
#[derive(Clone)]
pub struct SocketChannel {
    inner: Arc<SocketInner>,
    topic: String,
}

impl SocketChannel {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    async fn send(&self, event: &str, payload: Value) -> Result<PushAck, ChannelError> {
        let reference = self.inner.next_ref.fetch_add(1, Ordering::SeqCst);
        let (tx, ack) = PushAck::pair();
        {
            let mut pending = self.inner.pending.lock().await;
            pending.insert(reference, tx);
        }
        let frame = OutboundFrame {
            reference,
            topic: self.topic.clone(),
            event: event.to_string(),
            payload,
        };
        if self.inner.writer.send(frame).await.is_err() {
            self.inner.pending.lock().await.remove(&reference);
            return Err(ChannelError::Closed);
        }
        Ok(ack)
    }
}

impl Channel for SocketChannel {
    fn join<'a>(&'a self, params: Value) -> BoxFuture<'a, Result<Value, ChannelError>> {
        Box::pin(async move {
            let ack = self.send("join", params).await?;
            match ack.wait().await {
                ReplyStatus::Ok(response) => Ok(response),
                ReplyStatus::Error(response) => Err(ChannelError::JoinRejected { reason: response }),
                ReplyStatus::Timeout => Err(ChannelError::ProtocolTimeout("join".to_string())),
            }
        })
    }

    fn push<'a>(
        &'a self,
        event: &'a str,
        payload: Value,
    ) -> BoxFuture<'a, Result<PushAck, ChannelError>> {
        Box::pin(self.send(event, payload))
    }
}
