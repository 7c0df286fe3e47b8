//! Runner lifecycle events.
//!
//! Events are emitted in execution order on a per-attempt stream and, for
//! child runners, cross the process boundary as JSON lines.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AttemptFailure;

/// A structured log record produced by user code or the runner itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonLog {
    pub level: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub message: Vec<Value>,
    pub time: DateTime<Utc>,
}

impl JsonLog {
    pub fn new(level: impl Into<String>, name: Option<String>, message: Vec<Value>) -> Self {
        Self {
            level: level.into(),
            name,
            message,
            time: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RunnerEvent {
    WorkflowStart,
    JobStart {
        job_id: String,
    },
    JobComplete {
        job_id: String,
        state: Value,
        duration_ms: u64,
    },
    Log {
        log: JsonLog,
    },
    WorkflowComplete,
    #[serde(rename = "error")]
    Error {
        code: String,
        message: String,
    },
}

impl RunnerEvent {
    pub fn failure(failure: &AttemptFailure) -> Self {
        RunnerEvent::Error {
            code: failure.code().to_string(),
            message: failure.to_string(),
        }
    }
}
