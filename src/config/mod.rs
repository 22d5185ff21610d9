//! Typed configuration.
//!
//! Connection settings come from environment variables and are loaded once at
//! startup, failing fast if required vars are missing. Worker tuning lives in
//! `WorkerConfig`, which has sane defaults and can be overridden from a TOML
//! file. The database URL is wrapped in `secrecy::SecretString` so it never
//! ends up in logs.

use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::model::ClaimPolicy;
use crate::retry::RetryPolicy;
use secrecy::SecretString;
use serde::Deserialize;

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

/// Longest accepted `lease_timeout_secs`: one year.
pub const MAX_LEASE_SECS: u64 = 365 * 24 * 3600;

/// Tuning for a worker loop.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Idle time between iterations.
    pub poll_interval_ms: u64,
    /// Claims older than this may be taken over by another worker.
    /// `None` disables reclaim.
    pub lease_timeout_secs: Option<u64>,
    /// Cap on messages claimed per `claim_batch`. `None` means no cap.
    pub claim_limit: Option<i64>,
    /// Failed inserts of one payload before it is dead-lettered.
    pub max_insert_attempts: u32,
    /// Consecutive cycles with an unreachable store before the loop gives up.
    pub max_unavailable_cycles: u32,
    /// Payloads larger than this fail the Uploaded-stage check.
    pub max_payload_bytes: Option<usize>,
    /// Backoff for transient store failures within one step.
    pub store_retry: RetryPolicy,
    /// Backoff between local attempts at a failing stage handler.
    /// `max_attempts` failures in a row release the message.
    pub handler_retry: RetryPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            lease_timeout_secs: Some(300),
            claim_limit: None,
            max_insert_attempts: 5,
            max_unavailable_cycles: 30,
            max_payload_bytes: None,
            store_retry: RetryPolicy::default(),
            handler_retry: RetryPolicy {
                backoff_coefficient: 2,
                initial_interval_ms: 1_000,
                maximum_interval_ms: Some(60_000),
                max_attempts: 3,
            },
        }
    }
}

impl WorkerConfig {
    /// Load from a TOML file. Missing keys keep their defaults.
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read worker config {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
            .map_err(|e| Error::Config(format!("bad worker config {}: {e}", path.display())))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the stores cannot represent.
    pub fn validate(&self) -> Result<()> {
        if let Some(secs) = self.lease_timeout_secs
            && !(1..=MAX_LEASE_SECS).contains(&secs)
        {
            return Err(Error::Config(format!(
                "lease_timeout_secs must be between 1 and {MAX_LEASE_SECS}, got {secs}"
            )));
        }
        if let Some(limit) = self.claim_limit
            && limit < 1
        {
            return Err(Error::Config(format!(
                "claim_limit must be at least 1, got {limit}"
            )));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn claim_policy(&self) -> ClaimPolicy {
        ClaimPolicy {
            limit: self.claim_limit,
            lease: self.lease_timeout_secs.map(Duration::from_secs),
        }
    }
}
