//! Monitor configuration.
//!
//! Every field has a documented default; JSON config files may set any subset.

use crate::abi::{event_topic, selector, Address, EventTopics};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Monitor configuration, scoped to one deployment (consumer + coordinator pair).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// HTTP RPC URL (eth_blockNumber, eth_call, eth_getLogs, eth_sendTransaction).
    pub http_url: String,
    /// Consumer contract: owns the subject state and emits request/reveal events.
    pub consumer_address: Address,
    /// Oracle coordinator contract: emits fulfillment events.
    pub coordinator_address: Address,
    pub entry_points: EntryPoints,
    /// Session deadline, measured from start (default 300).
    pub max_wait_secs: u64,
    /// Wait between state polls (default 3000).
    pub poll_interval_ms: u64,
    /// Per-call timeout for every ledger call (default 10000).
    pub call_timeout_ms: u64,
    /// Unresolved time after which the manual trigger is sent, if configured (default 120).
    pub manual_trigger_grace_secs: u64,
    /// How long an uncollected terminal session is kept (default 600).
    pub reap_grace_secs: u64,
    pub scan: ScanConfig,
    pub retry: RetryConfig,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            http_url: "http://127.0.0.1:8545".to_string(),
            consumer_address: Address::default(),
            coordinator_address: Address::default(),
            entry_points: EntryPoints::default(),
            max_wait_secs: 300,
            poll_interval_ms: 3_000,
            call_timeout_ms: 10_000,
            manual_trigger_grace_secs: 120,
            reap_grace_secs: 600,
            scan: ScanConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl MonitorConfig {
    /// Load from a JSON file and validate.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |m: &str| Err(ConfigError::Invalid(m.to_string()));
        if self.poll_interval_ms == 0 {
            return invalid("poll_interval_ms must be > 0");
        }
        if self.max_wait_secs == 0 {
            return invalid("max_wait_secs must be > 0");
        }
        if self.call_timeout_ms == 0 {
            return invalid("call_timeout_ms must be > 0");
        }
        if self.scan.window_size == 0 || self.scan.lookback_windows == 0 {
            return invalid("scan.window_size and scan.lookback_windows must be > 0");
        }
        if self.retry.factor == 0 {
            return invalid("retry.factor must be >= 1");
        }
        if self.entry_points.manual_trigger.is_some()
            && self.manual_trigger_grace_secs >= self.max_wait_secs
        {
            return invalid("manual_trigger_grace_secs must be shorter than max_wait_secs");
        }
        Ok(())
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn manual_trigger_grace(&self) -> Duration {
        Duration::from_secs(self.manual_trigger_grace_secs)
    }

    pub fn reap_grace(&self) -> Duration {
        Duration::from_secs(self.reap_grace_secs)
    }
}

/// The one correct entry point and event signature per deployment (no runtime probing).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EntryPoints {
    /// View returning `(bool resolved, uint256 attribute, uint256 requestId)`.
    pub state_view: String,
    /// Optional manual-resolution entry point taking the subject id.
    pub manual_trigger: Option<String>,
    /// Node-managed account used to send the manual trigger.
    pub trigger_from: Option<Address>,
    pub submitted_event: String,
    pub state_changed_event: String,
    pub fulfilled_event: String,
}

impl Default for EntryPoints {
    fn default() -> Self {
        Self {
            state_view: "revealState(uint256)".to_string(),
            manual_trigger: None,
            trigger_from: None,
            submitted_event: "RandomnessRequested(uint256,uint256)".to_string(),
            state_changed_event: "AttributeRevealed(uint256,uint256,uint256,uint256)".to_string(),
            fulfilled_event: "RandomWordsFulfilled(uint256,uint256,uint96,bool)".to_string(),
        }
    }
}

impl EntryPoints {
    pub fn topics(&self) -> EventTopics {
        EventTopics {
            submitted: event_topic(&self.submitted_event),
            fulfilled: event_topic(&self.fulfilled_event),
            state_changed: event_topic(&self.state_changed_event),
        }
    }

    pub fn state_selector(&self) -> [u8; 4] {
        selector(&self.state_view)
    }

    pub fn trigger_selector(&self) -> Option<[u8; 4]> {
        self.manual_trigger.as_deref().map(selector)
    }
}

/// Bounded log scanning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Max block range per eth_getLogs request.
    pub window_size: u64,
    /// Number of windows searched backward from the tip before giving up.
    pub lookback_windows: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            window_size: 2_000,
            lookback_windows: 25,
        }
    }
}

/// Capped exponential backoff for transient ledger failures.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub factor: u32,
    pub max_delay_ms: u64,
    /// Upper bound of random jitter added to each delay.
    pub jitter_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
            factor: 2,
            max_delay_ms: 8_000,
            jitter_ms: 0,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `retry` (0-based), without jitter.
    pub fn delay(&self, retry: u32) -> Duration {
        let mult = (self.factor as u64).saturating_pow(retry);
        let ms = self.base_delay_ms.saturating_mul(mult).min(self.max_delay_ms);
        Duration::from_millis(ms)
    }
}
