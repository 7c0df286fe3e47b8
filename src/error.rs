//! Attempt failure taxonomy and process exit codes.
//!
//! Per-attempt errors never crash the worker: they terminate the attempt,
//! free its capacity slot, and the claim loop continues. Process-fatal
//! errors are limited to missing configuration at startup.

use thiserror::Error;

/// Terminal failure of a single attempt, reported to the coordinator as the
/// `reason` on the synthetic `attempt:complete` message.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AttemptFailure {
    /// Join rejection or malformed coordinator reply. The token is not
    /// retried.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Accumulated edge compilation failures.
    #[error("compilation failed: {0}")]
    Compile(String),

    /// Runner exceeded its wall-clock budget.
    #[error("run timed out: {0}")]
    Timeout(String),

    /// User code threw; the serialised error, never the raw value.
    #[error("runtime exception: {0}")]
    Runtime(String),

    /// Memory breach or runner crash.
    #[error("resource exhausted: {0}")]
    Resource(String),

    /// Internal bug (missing registry entry and the like). Propagated to
    /// the engine-wide emitter, never allowed to crash the process.
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// Coordinator-initiated teardown; not an error, but the attempt ends.
    #[error("cancelled: {0}")]
    Cancelled(String),
}

impl AttemptFailure {
    /// Stable reason code carried on the wire.
    pub fn code(&self) -> &'static str {
        match self {
            AttemptFailure::Protocol(_) => "ERR_PROTOCOL",
            AttemptFailure::Compile(_) => "ERR_COMPILE",
            AttemptFailure::Timeout(_) => "ERR_TIMEOUT",
            AttemptFailure::Runtime(_) => "ERR_RUNTIME_EXCEPTION",
            AttemptFailure::Resource(_) => "ERR_RESOURCE",
            AttemptFailure::Invariant(_) => "ERR_INVARIANT",
            AttemptFailure::Cancelled(_) => "CANCEL",
        }
    }

    /// Rebuild a failure from its wire code, e.g. off a child runner's
    /// terminal error event.
    pub fn from_wire(code: &str, message: String) -> Self {
        match code {
            "ERR_PROTOCOL" => AttemptFailure::Protocol(message),
            "ERR_COMPILE" => AttemptFailure::Compile(message),
            "ERR_TIMEOUT" => AttemptFailure::Timeout(message),
            "ERR_RESOURCE" => AttemptFailure::Resource(message),
            "ERR_INVARIANT" => AttemptFailure::Invariant(message),
            "CANCEL" => AttemptFailure::Cancelled(message),
            _ => AttemptFailure::Runtime(message),
        }
    }
}

/// Process exit codes for the worker binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Ok = 0,
    MissingSecret = 1,
    CoordinatorUnreachable = 2,
    EngineInit = 3,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_codes_are_stable() {
        assert_eq!(AttemptFailure::Timeout("5m".into()).code(), "ERR_TIMEOUT");
        assert_eq!(
            AttemptFailure::Runtime("boom".into()).code(),
            "ERR_RUNTIME_EXCEPTION"
        );
        assert_eq!(AttemptFailure::Compile("bad".into()).code(), "ERR_COMPILE");
    }

    #[test]
    fn wire_codes_round_trip() {
        for failure in [
            AttemptFailure::Protocol("p".into()),
            AttemptFailure::Compile("c".into()),
            AttemptFailure::Timeout("t".into()),
            AttemptFailure::Runtime("r".into()),
            AttemptFailure::Resource("m".into()),
            AttemptFailure::Invariant("i".into()),
            AttemptFailure::Cancelled("x".into()),
        ] {
            let rebuilt = AttemptFailure::from_wire(failure.code(), match &failure {
                AttemptFailure::Protocol(m)
                | AttemptFailure::Compile(m)
                | AttemptFailure::Timeout(m)
                | AttemptFailure::Runtime(m)
                | AttemptFailure::Resource(m)
                | AttemptFailure::Invariant(m)
                | AttemptFailure::Cancelled(m) => m.clone(),
            });
            assert_eq!(rebuilt, failure);
        }
    }
}
