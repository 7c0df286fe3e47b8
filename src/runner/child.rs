//! Child-process runner: one attempt per isolated process.
//!
//! The parent spawns the worker binary in `run-attempt` mode, writes a
//! single JSON payload line to its stdin, and reads lifecycle events back
//! as JSON lines on stdout. The supervisor enforces the wall-clock budget
//! and polls resident memory, killing the child on breach. The process
//! boundary is what gives memory accounting and kill-ability.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};

use crate::compiler;
use crate::error::AttemptFailure;
use crate::plan::{ExecutionPlan, InitialState};
use crate::runner::events::RunnerEvent;
use crate::runner::{DispatchRequest, Runner, RunnerDispatcher, RunnerHandle, RunnerOptions};

/// Slack on top of the child's own timeout before the supervisor kills it.
const SUPERVISOR_GRACE: Duration = Duration::from_secs(5);

/// How often resident memory is sampled.
const MEMORY_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct ChildRunnerConfig {
    /// Resolved path of the worker binary to re-enter in `run-attempt`
    /// mode.
    pub worker_entry: PathBuf,
}

impl ChildRunnerConfig {
    /// Point at the currently running binary.
    pub fn current_exe() -> anyhow::Result<Self> {
        Ok(Self {
            worker_entry: std::env::current_exe().context("failed to resolve worker binary")?,
        })
    }
}

/// The one payload line written to the child's stdin.
#[derive(Debug, Serialize, Deserialize)]
pub struct ChildPayload {
    pub plan: ExecutionPlan,
    pub timeout_ms: u64,
    pub immutable_state: bool,
    pub strict_state: bool,
}

/// Build the engine's default runner dispatcher over child processes.
pub fn dispatcher(config: ChildRunnerConfig) -> RunnerDispatcher {
    Arc::new(move |request: DispatchRequest| {
        let config = config.clone();
        Box::pin(async move { spawn(&config, &request).await })
    })
}

/// Spawn one child runner for the request and return its handle.
pub async fn spawn(
    config: &ChildRunnerConfig,
    request: &DispatchRequest,
) -> anyhow::Result<RunnerHandle> {
    let payload = ChildPayload {
        plan: request.plan.clone(),
        timeout_ms: request.timeout.as_millis() as u64,
        immutable_state: request.immutable_state,
        strict_state: request.strict_state,
    };
    let payload_line = serde_json::to_string(&payload).context("failed to encode child payload")?;

    let mut child = Command::new(&config.worker_entry)
        .arg("run-attempt")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .context("failed to spawn child runner")?;

    debug!(pid = child.id(), "spawned child runner");

    let mut stdin = child.stdin.take().context("child runner has no stdin")?;
    stdin
        .write_all(format!("{payload_line}\n").as_bytes())
        .await
        .context("failed to hand plan to child runner")?;
    drop(stdin);

    let stdout = child.stdout.take().context("child runner has no stdout")?;

    let (events_tx, events_rx) = mpsc::channel(256);
    let (cancel_tx, cancel_rx) = oneshot::channel();
    let budget = request.timeout + SUPERVISOR_GRACE;
    let memory_limit_mb = request.memory_limit_mb;
    tokio::spawn(async move {
        supervise(child, stdout, events_tx, cancel_rx, budget, memory_limit_mb).await;
    });

    Ok(RunnerHandle::new(events_rx, cancel_tx))
}

async fn supervise(
    mut child: Child,
    stdout: ChildStdout,
    events: mpsc::Sender<RunnerEvent>,
    mut cancel: oneshot::Receiver<()>,
    budget: Duration,
    memory_limit_mb: u64,
) {
    let pid = child.id();
    let mut lines = BufReader::new(stdout).lines();
    let deadline = tokio::time::sleep(budget);
    tokio::pin!(deadline);
    let mut memory_ticker = interval(MEMORY_POLL_INTERVAL);
    memory_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => match serde_json::from_str::<RunnerEvent>(&line) {
                    Ok(event) => {
                        if events.send(event).await.is_err() {
                            // Receiver gone: the attempt was torn down.
                            let _ = child.start_kill();
                            break;
                        }
                    }
                    Err(err) => warn!(?err, "malformed child runner event"),
                },
                Ok(None) => break,
                Err(err) => {
                    warn!(?err, "child runner stream receive error");
                    break;
                }
            },
            _ = &mut cancel => {
                let _ = child.start_kill();
                break;
            }
            _ = &mut deadline => {
                let _ = child.start_kill();
                let failure = AttemptFailure::Timeout(format!(
                    "runner exceeded its {}s budget",
                    budget.as_secs()
                ));
                let _ = events.send(RunnerEvent::failure(&failure)).await;
                break;
            }
            _ = memory_ticker.tick() => {
                let Some(rss_mb) = pid.and_then(resident_mb) else { continue };
                if rss_mb > memory_limit_mb {
                    let _ = child.start_kill();
                    let failure = AttemptFailure::Resource(format!(
                        "runner exceeded its {memory_limit_mb}mb budget ({rss_mb}mb resident)"
                    ));
                    let _ = events.send(RunnerEvent::failure(&failure)).await;
                    break;
                }
            }
        }
    }

    let _ = child.wait().await;
}

/// Resident set size in MB, read from procfs. Returns `None` where the
/// platform has no procfs or the process is gone.
fn resident_mb(pid: u32) -> Option<u64> {
    let statm = std::fs::read_to_string(format!("/proc/{pid}/statm")).ok()?;
    parse_statm_resident_mb(&statm, 4096)
}

fn parse_statm_resident_mb(statm: &str, page_size: u64) -> Option<u64> {
    let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(resident_pages * page_size / (1024 * 1024))
}

/// Child-side entrypoint: read the payload from stdin, run the attempt,
/// stream events to stdout. Returns the process exit code.
///
/// Precompiled operation lists cannot cross the process boundary, so the
/// sandbox is always forced here.
pub async fn run_from_stdio() -> anyhow::Result<i32> {
    let mut input = BufReader::new(tokio::io::stdin()).lines();
    let line = input
        .next_line()
        .await
        .context("failed to read child payload")?
        .context("child payload missing")?;
    let payload: ChildPayload =
        serde_json::from_str(&line).context("child payload is not valid JSON")?;

    let (events_tx, mut events_rx) = mpsc::channel::<RunnerEvent>(256);
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(event) = events_rx.recv().await {
            let Ok(mut line) = serde_json::to_string(&event) else {
                continue;
            };
            line.push('\n');
            if stdout.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    let exit_code = run_payload(payload, &events_tx).await;

    drop(events_tx);
    let _ = writer.await;
    Ok(exit_code)
}

async fn run_payload(payload: ChildPayload, events: &mpsc::Sender<RunnerEvent>) -> i32 {
    let compiled = match compiler::compile(&payload.plan) {
        Ok(compiled) => compiled,
        Err(err) => {
            let failure = AttemptFailure::Compile(err.to_string());
            let _ = events.send(RunnerEvent::failure(&failure)).await;
            return 1;
        }
    };
    let initial = match &compiled.initial_state {
        Some(InitialState::Inline(value)) => value.clone(),
        None => json!({}),
        Some(InitialState::Dataclip(id)) => {
            let failure = AttemptFailure::Invariant(format!(
                "dataclip '{id}' must be resolved before dispatch"
            ));
            let _ = events.send(RunnerEvent::failure(&failure)).await;
            return 1;
        }
    };
    let options = RunnerOptions {
        timeout: Duration::from_millis(payload.timeout_ms),
        immutable_state: payload.immutable_state,
        strict_state: payload.strict_state,
        force_sandbox: true,
    };
    match Runner::default().execute(&compiled, initial, &options, events).await {
        Ok(_) => 0,
        Err(_) => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{Expression, JobSpec};

    #[test]
    fn statm_resident_pages_convert_to_mb() {
        // 51200 pages * 4096 bytes = 200mb
        assert_eq!(parse_statm_resident_mb("99999 51200 300 1 0 500 0", 4096), Some(200));
        assert_eq!(parse_statm_resident_mb("bogus", 4096), None);
        assert_eq!(parse_statm_resident_mb("", 4096), None);
    }

    #[test]
    fn child_payload_round_trips() {
        let payload = ChildPayload {
            plan: ExecutionPlan {
                id: Some("wf".into()),
                initial_state: Some(InitialState::Inline(json!({"data": 1}))),
                jobs: vec![JobSpec::new(Expression::source("state"))],
                start: None,
            },
            timeout_ms: 1500,
            immutable_state: true,
            strict_state: false,
        };
        let line = serde_json::to_string(&payload).expect("encode");
        let decoded: ChildPayload = serde_json::from_str(&line).expect("decode");
        assert_eq!(decoded.timeout_ms, 1500);
        assert!(decoded.immutable_state);
        assert_eq!(decoded.plan.jobs.len(), 1);
    }
}
