//! Channel abstraction over the coordinator link.
//!
//! A [`Channel`] is bound to one topic and offers request/reply and push
//! semantics with server-side acknowledgement. Messages pushed on the same
//! channel arrive in send order; replies may interleave.

use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;

pub mod socket;

/// Bound on every request/reply exchange.
pub const PROTOCOL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ChannelError {
    /// The server refused the subscription. The reason payload is surfaced
    /// verbatim; the caller must not proceed on this channel.
    #[error("join rejected: {reason}")]
    JoinRejected { reason: Value },

    #[error("no reply to '{0}' within the protocol timeout")]
    ProtocolTimeout(String),

    #[error("coordinator rejected '{event}': {response}")]
    Rejected { event: String, response: Value },

    #[error("channel closed")]
    Closed,

    #[error("transport error: {0}")]
    Transport(String),
}

/// Server acknowledgement status for one pushed message.
#[derive(Debug)]
pub enum ReplyStatus {
    Ok(Value),
    Error(Value),
    Timeout,
}

/// Pending acknowledgement for a pushed message. Dropping it makes the
/// push fire-and-forget.
#[derive(Debug)]
pub struct PushAck {
    rx: oneshot::Receiver<ReplyStatus>,
}

impl PushAck {
    /// Build an ack and the sender half that resolves it.
    pub fn pair() -> (oneshot::Sender<ReplyStatus>, PushAck) {
        let (tx, rx) = oneshot::channel();
        (tx, PushAck { rx })
    }

    /// Await the server's reply, bounded by [`PROTOCOL_TIMEOUT`].
    pub async fn wait(self) -> ReplyStatus {
        match tokio::time::timeout(PROTOCOL_TIMEOUT, self.rx).await {
            Ok(Ok(status)) => status,
            // Sender dropped or deadline passed: either way no reply came.
            Ok(Err(_)) | Err(_) => ReplyStatus::Timeout,
        }
    }
}

/// A topic-bound bidirectional message channel to the coordinator.
pub trait Channel: Send + Sync {
    /// Subscribe to the topic. Blocks until the server accepts or rejects;
    /// on rejection the server's response payload is the error reason.
    fn join<'a>(&'a self, params: Value) -> BoxFuture<'a, Result<Value, ChannelError>>;

    /// Send a message. The returned ack is fire-and-forget unless awaited.
    fn push<'a>(&'a self, event: &'a str, payload: Value)
        -> BoxFuture<'a, Result<PushAck, ChannelError>>;

    /// Push and await the matching reply.
    fn get_with_reply<'a>(
        &'a self,
        event: &'a str,
        payload: Value,
    ) -> BoxFuture<'a, Result<Value, ChannelError>> {
        Box::pin(async move {
            let ack = self.push(event, payload).await?;
            match ack.wait().await {
                ReplyStatus::Ok(response) => Ok(response),
                ReplyStatus::Error(response) => Err(ChannelError::Rejected {
                    event: event.to_string(),
                    response,
                }),
                ReplyStatus::Timeout => Err(ChannelError::ProtocolTimeout(event.to_string())),
            }
        })
    }
}

/// Opens topic-bound channels on an underlying connection. The claim loop
/// uses this to open one channel per claimed attempt.
pub trait ChannelProvider: Send + Sync {
    fn open(&self, topic: &str) -> std::sync::Arc<dyn Channel>;
}
