//! Worker binary.
//!
//! Two modes: the default long-running worker, and a hidden `run-attempt`
//! mode the engine uses to host one attempt in an isolated child process.

use std::process::ExitCode as ProcessExitCode;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

use belay::channel::socket::Socket;
use belay::claim::{ClaimLoop, ClaimOptions, TokenVerifier};
use belay::config::Config;
use belay::context::AttemptOptions;
use belay::engine::{Engine, EngineOptions};
use belay::error::ExitCode;
use belay::protocol;
use belay::runner::child::{self, ChildRunnerConfig};
use belay::server::{self, ServerState};
use belay::Channel;

/// Connection attempts before the coordinator is declared unreachable.
const CONNECT_ATTEMPTS: u32 = 5;

fn exit(code: ExitCode) -> ProcessExitCode {
    ProcessExitCode::from(code as u8)
}

#[tokio::main]
async fn main() -> ProcessExitCode {
    if std::env::args().nth(1).as_deref() == Some("run-attempt") {
        return match child::run_from_stdio().await {
            Ok(code) => ProcessExitCode::from(code as u8),
            Err(err) => {
                eprintln!("run-attempt failed: {err}");
                ProcessExitCode::from(1)
            }
        };
    }
    run_worker().await
}

async fn run_worker() -> ProcessExitCode {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err}");
            return exit(ExitCode::MissingSecret);
        }
    };
    init_tracing(&config.log_level);
    info!(
        capacity = config.capacity,
        coordinator = %config.coordinator_url,
        "starting worker",
    );

    let dispatcher = match ChildRunnerConfig::current_exe() {
        Ok(runner_config) => child::dispatcher(runner_config),
        Err(err) => {
            error!(%err, "failed to resolve runner entry");
            return exit(ExitCode::EngineInit);
        }
    };
    let engine = Engine::new(
        dispatcher,
        EngineOptions {
            capacity: config.capacity,
            attempt: AttemptOptions {
                timeout: config.max_run_duration,
                memory_limit_mb: config.max_run_memory_mb,
                immutable_state: false,
                strict_state: false,
                state_props_to_remove: config.state_props_to_remove.clone(),
            },
        },
    );

    let verifier = match &config.run_public_key {
        Some(pem) => match TokenVerifier::from_rsa_pem(pem) {
            Ok(verifier) => verifier,
            Err(err) => {
                error!(%err, "failed to load run public key");
                return exit(ExitCode::EngineInit);
            }
        },
        None => TokenVerifier::none(),
    };

    let (socket, mut server_frames) = match connect_with_backoff(&config).await {
        Ok(connected) => connected,
        Err(err) => {
            error!(%err, "coordinator unreachable");
            return exit(ExitCode::CoordinatorUnreachable);
        }
    };

    let queue = socket.channel(protocol::QUEUE_TOPIC);
    if let Err(err) = queue
        .join(json!({
            "token": config.secret,
            "worker_version": env!("CARGO_PKG_VERSION"),
        }))
        .await
    {
        error!(%err, "failed to join the claim queue");
        return exit(ExitCode::CoordinatorUnreachable);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let listener = match TcpListener::bind(config.server_addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(%err, addr = %config.server_addr, "failed to bind liveness server");
            return exit(ExitCode::EngineInit);
        }
    };
    info!(addr = %config.server_addr, "liveness server up");
    tokio::spawn(server::run(
        listener,
        ServerState {
            engine: engine.clone(),
        },
        shutdown_rx.clone(),
    ));

    // Coordinator-initiated messages: route cancellations to the engine.
    let cancel_engine = engine.clone();
    tokio::spawn(async move {
        while let Some(frame) = server_frames.recv().await {
            if frame.event == protocol::CANCEL {
                if let Some(attempt_id) = frame.topic.strip_prefix("attempt:") {
                    cancel_engine.cancel(attempt_id);
                }
            }
        }
    });

    let claim_loop = ClaimLoop::new(
        engine,
        Arc::new(queue),
        Arc::new(socket),
        verifier,
        ClaimOptions {
            backoff: config.backoff,
            no_loop: false,
            grace: Duration::from_secs(30),
        },
    );
    let mut claim_handle = tokio::spawn(claim_loop.run(shutdown_rx));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
            match (&mut claim_handle).await {
                Ok(Ok(())) => exit(ExitCode::Ok),
                Ok(Err(err)) => {
                    error!(%err, "claim loop failed during shutdown");
                    exit(ExitCode::CoordinatorUnreachable)
                }
                Err(err) => {
                    error!(%err, "claim loop panicked");
                    exit(ExitCode::EngineInit)
                }
            }
        }
        result = &mut claim_handle => match result {
            Ok(Ok(())) => exit(ExitCode::Ok),
            Ok(Err(err)) => {
                error!(%err, "claim loop gave up");
                exit(ExitCode::CoordinatorUnreachable)
            }
            Err(err) => {
                error!(%err, "claim loop panicked");
                exit(ExitCode::EngineInit)
            }
        },
    }
}

fn init_tracing(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_new(level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn connect_with_backoff(
    config: &Config,
) -> Result<(Socket, tokio::sync::mpsc::Receiver<belay::ServerFrame>), belay::ChannelError> {
    let mut backoff = config.backoff.min;
    let mut last_err = belay::ChannelError::Closed;
    for attempt in 1..=CONNECT_ATTEMPTS {
        match Socket::connect(&config.coordinator_url).await {
            Ok(connected) => return Ok(connected),
            Err(err) => {
                info!(
                    attempt,
                    sleep_ms = backoff.as_millis(),
                    %err,
                    "coordinator connect failed",
                );
                last_err = err;
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(config.backoff.max);
            }
        }
    }
    Err(last_err)
}
