//! Claim loop: requests work from the coordinator while capacity permits.
//!
//! A single cooperative task. When capacity is exhausted it parks until an
//! attempt completes; otherwise it pushes `claim {capacity}` on the queue
//! channel, joins each claimed attempt's channel with its token, fetches
//! the plan, and hands it to the engine. Empty replies sleep the current
//! backoff, doubling from `min` up to `max`; any successful claim resets
//! the backoff to `min`.

use std::sync::Arc;
use std::time::Duration;

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::channel::{Channel, ChannelError, ChannelProvider};
use crate::config::BackoffRange;
use crate::engine::Engine;
use crate::plan::ExecutionPlan;
use crate::protocol::{self, attempt_topic, ClaimRequest, ClaimedAttempt};

/// Consecutive claim transport failures tolerated before the worker gives
/// up on the coordinator.
const MAX_CLAIM_FAILURES: u32 = 5;

#[derive(Debug, Error)]
pub enum ClaimError {
    #[error("coordinator unreachable after repeated backoff: {0}")]
    CoordinatorUnreachable(String),
}

/// Why one claimed token was abandoned. The token is never retried.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClaimAbort {
    #[error("{0}")]
    TokenRejected(String),

    /// Join rejection; the server's reason, verbatim.
    #[error("{0}")]
    JoinRejected(String),

    #[error("{0}")]
    Protocol(String),
}

#[derive(Debug, Clone)]
pub struct ClaimOptions {
    pub backoff: BackoffRange,
    /// One-shot mode: terminate after the first iteration.
    pub no_loop: bool,
    /// How long shutdown waits for in-flight attempts before cancelling
    /// them.
    pub grace: Duration,
}

impl Default for ClaimOptions {
    fn default() -> Self {
        Self {
            backoff: BackoffRange {
                min: Duration::from_secs(1),
                max: Duration::from_secs(10),
            },
            no_loop: false,
            grace: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Deserialize)]
struct AttemptClaims {
    id: String,
}

/// Verifies attempt tokens against the coordinator's public key. With no
/// key configured every token passes.
pub struct TokenVerifier {
    key: Option<DecodingKey>,
}

impl TokenVerifier {
    pub fn none() -> Self {
        Self { key: None }
    }

    pub fn from_rsa_pem(pem: &str) -> anyhow::Result<Self> {
        let key = DecodingKey::from_rsa_pem(pem.as_bytes())
            .map_err(|err| anyhow::anyhow!("invalid run public key: {err}"))?;
        Ok(Self { key: Some(key) })
    }

    pub fn verify(&self, token: &str, attempt_id: &str) -> Result<(), String> {
        let Some(key) = &self.key else {
            return Ok(());
        };
        let mut validation = Validation::new(Algorithm::RS256);
        validation.validate_exp = false;
        validation.set_required_spec_claims::<&str>(&[]);
        let data = decode::<AttemptClaims>(token, key, &validation)
            .map_err(|err| format!("signature rejected: {err}"))?;
        if data.claims.id != attempt_id {
            return Err(format!(
                "token is for attempt '{}', not '{attempt_id}'",
                data.claims.id
            ));
        }
        Ok(())
    }
}

pub struct ClaimLoop {
    engine: Engine,
    queue: Arc<dyn Channel>,
    provider: Arc<dyn ChannelProvider>,
    verifier: TokenVerifier,
    options: ClaimOptions,
}

impl ClaimLoop {
    pub fn new(
        engine: Engine,
        queue: Arc<dyn Channel>,
        provider: Arc<dyn ChannelProvider>,
        verifier: TokenVerifier,
        options: ClaimOptions,
    ) -> Self {
        Self {
            engine,
            queue,
            provider,
            verifier,
            options,
        }
    }

    /// Drive the loop until shutdown flips. On shutdown, stop claiming,
    /// wait out in-flight attempts up to the grace period, then cancel
    /// whatever remains.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), ClaimError> {
        let mut backoff = self.options.backoff.min;
        let mut transport_failures = 0u32;

        info!(
            capacity = self.engine.capacity(),
            min_backoff_ms = self.options.backoff.min.as_millis(),
            max_backoff_ms = self.options.backoff.max.as_millis(),
            "starting claim loop",
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let available = self.engine.available_capacity();
            if available == 0 {
                tokio::select! {
                    _ = self.engine.wait_for_completion() => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            }

            match self
                .queue
                .get_with_reply(protocol::CLAIM, json!(ClaimRequest { capacity: available }))
                .await
            {
                Err(err) => {
                    transport_failures += 1;
                    warn!(%err, transport_failures, "claim request failed");
                    if transport_failures >= MAX_CLAIM_FAILURES {
                        return Err(ClaimError::CoordinatorUnreachable(err.to_string()));
                    }
                    tokio::select! {
                        _ = sleep(backoff) => {}
                        _ = shutdown.changed() => {}
                    }
                    backoff = next_backoff(backoff, &self.options.backoff);
                }
                Ok(reply) => {
                    transport_failures = 0;
                    metrics::counter!("belay_claims_total").increment(1);
                    let claimed = parse_claim_reply(reply);
                    if claimed.is_empty() {
                        metrics::counter!("belay_claim_empty_total").increment(1);
                        debug!(sleep_ms = backoff.as_millis(), "no work claimed");
                        tokio::select! {
                            _ = sleep(backoff) => {}
                            _ = shutdown.changed() => {}
                        }
                        backoff = next_backoff(backoff, &self.options.backoff);
                    } else {
                        backoff = self.options.backoff.min;
                        for attempt in claimed {
                            if let Err(abort) = self.claim_attempt(&attempt).await {
                                warn!(
                                    attempt_id = %attempt.attempt_id,
                                    reason = %abort,
                                    "attempt claim aborted",
                                );
                            }
                        }
                    }
                }
            }

            if self.options.no_loop {
                break;
            }
        }

        self.drain(shutdown).await;
        Ok(())
    }

    /// Claim one attempt: verify the token, join the attempt channel,
    /// fetch the plan and hand it to the engine. Any failure abandons the
    /// token without retry.
    pub async fn claim_attempt(&self, claimed: &ClaimedAttempt) -> Result<(), ClaimAbort> {
        self.verifier
            .verify(&claimed.token, &claimed.attempt_id)
            .map_err(ClaimAbort::TokenRejected)?;

        let channel = self.provider.open(&attempt_topic(&claimed.attempt_id));
        match channel
            .join(json!({
                "token": claimed.token,
                "worker_version": env!("CARGO_PKG_VERSION"),
            }))
            .await
        {
            Ok(_) => {}
            Err(ChannelError::JoinRejected { reason }) => {
                return Err(ClaimAbort::JoinRejected(reason_text(reason)));
            }
            Err(err) => return Err(ClaimAbort::Protocol(err.to_string())),
        }

        let reply = channel
            .get_with_reply(protocol::GET_ATTEMPT, json!({}))
            .await
            .map_err(|err| ClaimAbort::Protocol(err.to_string()))?;
        let mut plan: ExecutionPlan = serde_json::from_value(reply)
            .map_err(|err| ClaimAbort::Protocol(format!("malformed plan: {err}")))?;
        if plan.id.is_none() {
            plan.id = Some(claimed.attempt_id.clone());
        }

        info!(attempt_id = %claimed.attempt_id, "claimed attempt");
        self.engine
            .execute(plan, channel)
            .map_err(|err| ClaimAbort::Protocol(err.to_string()))?;
        Ok(())
    }

    async fn drain(&self, mut shutdown: watch::Receiver<bool>) {
        if self.engine.active_count() == 0 {
            return;
        }
        info!(
            in_flight = self.engine.active_count(),
            grace_ms = self.options.grace.as_millis(),
            "waiting for in-flight attempts",
        );
        let deadline = Instant::now() + self.options.grace;
        while self.engine.active_count() > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(
                    remaining = self.engine.active_count(),
                    "grace period expired; cancelling remaining attempts",
                );
                for workflow_id in self.engine.active_ids() {
                    self.engine.cancel(&workflow_id);
                }
                break;
            }
            tokio::select! {
                _ = self.engine.wait_for_completion() => {}
                _ = sleep(remaining) => {}
                _ = shutdown.changed() => {}
            }
        }
    }
}

/// Double up to the window's max.
fn next_backoff(current: Duration, range: &BackoffRange) -> Duration {
    (current * 2).min(range.max)
}

/// Accept `{attempts: [..]}` or a bare array; anything else is treated as
/// an empty reply.
fn parse_claim_reply(reply: Value) -> Vec<ClaimedAttempt> {
    if let Ok(parsed) = serde_json::from_value::<protocol::ClaimReply>(reply.clone()) {
        return parsed.attempts;
    }
    match serde_json::from_value::<Vec<ClaimedAttempt>>(reply) {
        Ok(attempts) => attempts,
        Err(err) => {
            warn!(%err, "malformed claim reply");
            Vec::new()
        }
    }
}

fn reason_text(reason: Value) -> String {
    match reason {
        Value::String(text) => text,
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(min_ms: u64, max_ms: u64) -> BackoffRange {
        BackoffRange {
            min: Duration::from_millis(min_ms),
            max: Duration::from_millis(max_ms),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let window = range(1000, 10_000);
        let mut current = window.min;
        let mut observed = Vec::new();
        for _ in 0..5 {
            observed.push(current.as_millis());
            current = next_backoff(current, &window);
        }
        assert_eq!(observed, vec![1000, 2000, 4000, 8000, 10_000]);
    }

    #[test]
    fn backoff_cap_is_sticky() {
        let window = range(1000, 4000);
        let capped = next_backoff(Duration::from_millis(4000), &window);
        assert_eq!(capped, Duration::from_millis(4000));
    }

    #[test]
    fn claim_reply_accepts_both_wire_shapes() {
        let wrapped = parse_claim_reply(json!({
            "attempts": [{"attemptId": "a-1", "token": "t"}]
        }));
        assert_eq!(wrapped.len(), 1);
        assert_eq!(wrapped[0].attempt_id, "a-1");

        let bare = parse_claim_reply(json!([{"attemptId": "a-2", "token": "t"}]));
        assert_eq!(bare.len(), 1);
        assert_eq!(bare[0].attempt_id, "a-2");

        assert!(parse_claim_reply(json!({"nope": true})).is_empty());
        assert!(parse_claim_reply(json!({})).is_empty());
    }

    #[test]
    fn unconfigured_verifier_accepts_anything() {
        let verifier = TokenVerifier::none();
        assert!(verifier.verify("not-even-a-jwt", "a-1").is_ok());
    }

    #[test]
    fn verifier_rejects_garbage_tokens_when_keyed() {
        // Any valid RSA public key will do; the token below is not signed
        // by it, so verification must fail.
        let pem = "-----BEGIN PUBLIC KEY-----\nMFwwDQYJKoZIhvcNAQEBBQADSwAwSAJBAKj34GkxFhD90vcNLYLInFEX6Ppy1tPf\n9Cnzj4p4WGeKLs1Pt8QuKUpRKfFLfRYC9AIKjbJTWit+CqvjWYzvQwECAwEAAQ==\n-----END PUBLIC KEY-----\n";
        let verifier = match TokenVerifier::from_rsa_pem(pem) {
            Ok(verifier) => verifier,
            Err(err) => {
                eprintln!("skipping test: sample key rejected: {err}");
                return;
            }
        };
        assert!(verifier.verify("garbage.token.here", "a-1").is_err());
        assert!(verifier.verify("not-even-a-jwt", "a-1").is_err());
    }
}
