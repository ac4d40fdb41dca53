use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const DEFAULT_REGISTRATION_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 5_000;
pub const DEFAULT_MAX_CONCURRENT_TRANSACTIONS: usize = 64;
pub const DEFAULT_PROTOCOL_VIOLATION_THRESHOLD: u64 = 100;
pub const DEFAULT_OUTBOUND_QUEUE_CAPACITY: usize = 1_024;
pub const DEFAULT_PEER_ADDRESS: &str = "127.0.0.1:7052";

/// Operational tuning for one shim session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShimConfig {
    pub chaincode_id: String,
    pub peer_address: String,
    pub registration_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub shutdown_grace_ms: u64,
    pub max_concurrent_transactions: usize,
    pub protocol_violation_threshold: u64,
    /// 0 disables periodic metrics logging.
    pub metrics_log_interval_secs: u64,
    pub outbound_queue_capacity: usize,
}

impl Default for ShimConfig {
    fn default() -> Self {
        Self {
            chaincode_id: String::new(),
            peer_address: DEFAULT_PEER_ADDRESS.to_string(),
            registration_timeout_ms: DEFAULT_REGISTRATION_TIMEOUT_MS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            shutdown_grace_ms: DEFAULT_SHUTDOWN_GRACE_MS,
            max_concurrent_transactions: DEFAULT_MAX_CONCURRENT_TRANSACTIONS,
            protocol_violation_threshold: DEFAULT_PROTOCOL_VIOLATION_THRESHOLD,
            metrics_log_interval_secs: 0,
            outbound_queue_capacity: DEFAULT_OUTBOUND_QUEUE_CAPACITY,
        }
    }
}

#[derive(Deserialize)]
struct RootConfig {
    #[serde(default)]
    shim: Option<ShimConfig>,
}

impl ShimConfig {
    pub fn new(chaincode_id: impl Into<String>) -> Self {
        Self {
            chaincode_id: chaincode_id.into(),
            ..Self::default()
        }
    }

    /// Reads the `[shim]` table from `path` when given, then applies
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read shim config from {}", path.display()))?;
        Self::from_toml_str(&contents)
            .with_context(|| format!("Failed to parse TOML config {}", path.display()))
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let parsed: RootConfig = toml::from_str(contents)?;
        Ok(parsed.shim.unwrap_or_default())
    }

    /// Applies `CORE_*` and `CHAINCODE_SHIM_*` variables through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |name: &str| {
            lookup(name)
                .map(|raw| raw.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        if let Some(id) = text("CORE_CHAINCODE_ID_NAME") {
            self.chaincode_id = id;
        }
        if let Some(address) = text("CORE_PEER_ADDRESS") {
            self.peer_address = address;
        }

        let number = |name: &str| parse_number::<u64>(name, text(name));

        if let Some(value) = number("CHAINCODE_SHIM_REGISTRATION_TIMEOUT_MS") {
            self.registration_timeout_ms = value;
        }
        if let Some(value) = number("CHAINCODE_SHIM_REQUEST_TIMEOUT_MS") {
            self.request_timeout_ms = value;
        }
        if let Some(value) = number("CHAINCODE_SHIM_SHUTDOWN_GRACE_MS") {
            self.shutdown_grace_ms = value;
        }
        let pool_var = "CHAINCODE_SHIM_MAX_CONCURRENT_TRANSACTIONS";
        if let Some(value) = parse_number::<usize>(pool_var, text(pool_var)) {
            self.max_concurrent_transactions = value;
        }
        if let Some(value) = number("CHAINCODE_SHIM_PROTOCOL_VIOLATION_THRESHOLD") {
            self.protocol_violation_threshold = value;
        }
        if let Some(value) = number("CHAINCODE_SHIM_METRICS_LOG_INTERVAL_SECS") {
            self.metrics_log_interval_secs = value;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.chaincode_id.trim().is_empty() {
            bail!("chaincode id must be set (CORE_CHAINCODE_ID_NAME)");
        }
        if self.registration_timeout_ms == 0 || self.request_timeout_ms == 0 {
            bail!("registration and request timeouts must be greater than zero");
        }
        if self.max_concurrent_transactions == 0 {
            bail!("max_concurrent_transactions must be greater than zero");
        }
        if self.outbound_queue_capacity == 0 {
            bail!("outbound_queue_capacity must be greater than zero");
        }
        Ok(())
    }

    pub fn registration_timeout(&self) -> Duration {
        Duration::from_millis(self.registration_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn metrics_log_interval(&self) -> Option<Duration> {
        match self.metrics_log_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

/// Parses an env value, logging and discarding anything out of range for `T`.
fn parse_number<T>(name: &str, raw: Option<String>) -> Option<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    let raw = raw?;
    match raw.parse::<T>() {
        Ok(value) => Some(value),
        Err(err) => {
            warn!("Invalid {} value '{}': {}", name, raw, err);
            None
        }
    }
}
