//! Coordinator wire protocol: event names and payload shapes.
//!
//! All payloads travel as JSON. Dataclip bodies are raw UTF-8 JSON bytes,
//! base64-encoded for transport.

use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::runner::events::JsonLog;

// worker -> coordinator requests
pub const CLAIM: &str = "claim";
pub const GET_ATTEMPT: &str = "fetch:attempt";
pub const GET_CREDENTIAL: &str = "fetch:credential";
pub const GET_DATACLIP: &str = "fetch:dataclip";

// worker -> coordinator lifecycle events
pub const ATTEMPT_START: &str = "attempt:start";
pub const ATTEMPT_COMPLETE: &str = "attempt:complete";
pub const ATTEMPT_LOG: &str = "attempt:log";
pub const RUN_START: &str = "run:start";
pub const RUN_COMPLETE: &str = "run:complete";

// coordinator -> worker, unsolicited
pub const CANCEL: &str = "cancel";

/// Topic carrying claim requests for the whole worker.
pub const QUEUE_TOPIC: &str = "worker:queue";

/// Per-attempt channel topic.
pub fn attempt_topic(attempt_id: &str) -> String {
    format!("attempt:{attempt_id}")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimRequest {
    pub capacity: usize,
}

/// One claimed attempt: the id plus a signed token authorising the worker
/// to join its channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimedAttempt {
    #[serde(rename = "attemptId")]
    pub attempt_id: String,
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimReply {
    #[serde(default)]
    pub attempts: Vec<ClaimedAttempt>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetCredential {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetDataclip {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStart {
    pub run_id: Uuid,
    pub job_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunComplete {
    pub run_id: Uuid,
    pub job_id: String,
    pub output_dataclip_id: Uuid,
    /// Stringified state snapshot at the job boundary.
    pub output_dataclip: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptComplete {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_dataclip_id: Option<Uuid>,
    /// Failure reason code; absent on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// A user-code log line forwarded to the coordinator, augmented with the
/// attempt id and, when a run is active, the run id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptLog {
    #[serde(flatten)]
    pub log: JsonLog,
    pub attempt_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
}

/// Encode dataclip bytes for transport.
pub fn encode_dataclip(bytes: &[u8]) -> String {
    general_purpose::STANDARD.encode(bytes)
}

/// Decode a `fetch:dataclip` reply into a state value. The payload is the
/// base64 encoding of UTF-8 JSON.
pub fn decode_dataclip(reply: &Value) -> Result<Value, DataclipError> {
    let encoded = reply
        .as_str()
        .or_else(|| reply.get("data").and_then(Value::as_str))
        .ok_or(DataclipError::MissingPayload)?;
    let bytes = general_purpose::STANDARD
        .decode(encoded)
        .map_err(|err| DataclipError::Encoding(err.to_string()))?;
    let text = std::str::from_utf8(&bytes).map_err(|err| DataclipError::Encoding(err.to_string()))?;
    serde_json::from_str(text).map_err(|err| DataclipError::Parse(err.to_string()))
}

#[derive(Debug, thiserror::Error)]
pub enum DataclipError {
    #[error("dataclip reply carried no payload")]
    MissingPayload,
    #[error("dataclip payload is not valid base64/utf-8: {0}")]
    Encoding(String),
    #[error("dataclip payload is not valid JSON: {0}")]
    Parse(String),
}
