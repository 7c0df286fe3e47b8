//! Worker configuration loaded from environment variables.
//!
//! Every variable has a CLI counterpart upstream of this module; when both
//! are supplied the CLI value is written into the environment before
//! [`Config::from_env`] runs, so the CLI wins.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Claim backoff window, parsed from `min/max` seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffRange {
    pub min: Duration,
    pub max: Duration,
}

impl BackoffRange {
    /// Parse a `min/max` pair of seconds, e.g. `"1/10"`.
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let mut parts = raw.splitn(2, '/');
        let min: f64 = parts
            .next()
            .unwrap_or_default()
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid backoff spec: {raw}"))?;
        let max: f64 = parts
            .next()
            .ok_or_else(|| anyhow::anyhow!("backoff spec must be min/max: {raw}"))?
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid backoff spec: {raw}"))?;
        if min <= 0.0 || max < min {
            anyhow::bail!("backoff spec out of range: {raw}");
        }
        Ok(Self {
            min: Duration::from_millis((min * 1000.0) as u64),
            max: Duration::from_millis((max * 1000.0) as u64),
        })
    }
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP liveness server bind address (`WORKER_PORT`)
    pub server_addr: SocketAddr,

    /// Coordinator host:port (`WORKER_LIGHTNING_SERVICE_URL`)
    pub coordinator_url: String,

    /// Adaptor repo directory (`WORKER_REPO_DIR`)
    pub repo_dir: PathBuf,

    /// Shared secret presented when joining the claim queue (`WORKER_SECRET`)
    pub secret: String,

    /// PEM public key used to verify attempt tokens (`WORKER_LIGHTNING_PUBLIC_KEY`)
    pub run_public_key: Option<String>,

    /// Log filter (`WORKER_LOG_LEVEL`)
    pub log_level: String,

    /// Claim backoff window (`WORKER_BACKOFF`, `min/max` seconds)
    pub backoff: BackoffRange,

    /// Max attempts in flight (`WORKER_CAPACITY`)
    pub capacity: usize,

    /// Memory budget per child runner in MB (`WORKER_MAX_RUN_MEMORY_MB`)
    pub max_run_memory_mb: u64,

    /// Wall-clock budget per attempt (`WORKER_MAX_RUN_DURATION_SECONDS`)
    pub max_run_duration: Duration,

    /// State keys scrubbed before a dataclip leaves the worker
    /// (`WORKER_STATE_PROPS_TO_REMOVE`)
    pub state_props_to_remove: Vec<String>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// The only hard failure is a missing `WORKER_SECRET`; everything else
    /// has a default.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let secret = std::env::var("WORKER_SECRET")
            .map_err(|_| anyhow::anyhow!("WORKER_SECRET must be set"))?;

        let port: u16 = std::env::var("WORKER_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(2222);
        let server_addr: SocketAddr = ([0, 0, 0, 0], port).into();

        let coordinator_url = std::env::var("WORKER_LIGHTNING_SERVICE_URL")
            .unwrap_or_else(|_| "127.0.0.1:4337".to_string());

        let repo_dir = std::env::var("WORKER_REPO_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::temp_dir().join("belay-repo"));

        let run_public_key = std::env::var("WORKER_LIGHTNING_PUBLIC_KEY")
            .ok()
            .filter(|s| !s.is_empty());

        let log_level = std::env::var("WORKER_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let backoff = BackoffRange::parse(
            &std::env::var("WORKER_BACKOFF").unwrap_or_else(|_| "1/10".to_string()),
        )?;

        let capacity: usize = std::env::var("WORKER_CAPACITY")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5);

        let max_run_memory_mb: u64 = std::env::var("WORKER_MAX_RUN_MEMORY_MB")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(500);

        let max_run_duration_seconds: u64 = std::env::var("WORKER_MAX_RUN_DURATION_SECONDS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(300);

        let state_props_to_remove: Vec<String> = std::env::var("WORKER_STATE_PROPS_TO_REMOVE")
            .unwrap_or_else(|_| "configuration,response".to_string())
            .split(',')
            .filter(|s| !s.is_empty())
            .map(|s| s.trim().to_string())
            .collect();

        Ok(Config {
            server_addr,
            coordinator_url,
            repo_dir,
            secret,
            run_public_key,
            log_level,
            backoff,
            capacity,
            max_run_memory_mb,
            max_run_duration: Duration::from_secs(max_run_duration_seconds),
            state_props_to_remove,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_parses_min_max_seconds() {
        let range = BackoffRange::parse("1/10").expect("parse");
        assert_eq!(range.min, Duration::from_secs(1));
        assert_eq!(range.max, Duration::from_secs(10));
    }

    #[test]
    fn backoff_accepts_fractional_seconds() {
        let range = BackoffRange::parse("0.5/2").expect("parse");
        assert_eq!(range.min, Duration::from_millis(500));
        assert_eq!(range.max, Duration::from_secs(2));
    }

    #[test]
    fn backoff_rejects_inverted_and_malformed_specs() {
        assert!(BackoffRange::parse("10/1").is_err());
        assert!(BackoffRange::parse("fast").is_err());
        assert!(BackoffRange::parse("1").is_err());
    }
}
