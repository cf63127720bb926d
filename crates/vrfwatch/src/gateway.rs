//! Ledger gateway: the three read primitives plus the optional manual trigger.
//!
//! [LedgerClient] is a single-attempt transport (JSON-RPC in production, scripted in tests).
//! [Gateway] wraps it with a per-call timeout and capped exponential backoff on transient
//! failures; `RangeTooLarge`, `NotFound` and `Invalid` are returned as-is.

use crate::abi::{Address, EventKind, EventRecord, SubjectId, SubjectState};
use crate::config::{MonitorConfig, RetryConfig};
use async_trait::async_trait;
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LedgerError {
    /// Network or provider hiccup; retried by the gateway.
    #[error("transient: {0}")]
    Transient(String),
    /// Provider refused the block range; callers narrow it.
    #[error("block range {from}..={to} too large for provider")]
    RangeTooLarge { from: u64, to: u64 },
    #[error("not found: {0}")]
    NotFound(String),
    /// Malformed or unexpected provider response.
    #[error("invalid response: {0}")]
    Invalid(String),
    #[error("ledger unavailable after {attempts} attempts: {last}")]
    Unavailable { attempts: u32, last: String },
    #[error("cancelled")]
    Cancelled,
}

impl LedgerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, LedgerError::Transient(_))
    }

    /// Errors that make further polling of the same subject pointless.
    pub fn is_fatal(&self) -> bool {
        matches!(self, LedgerError::NotFound(_) | LedgerError::Invalid(_))
    }
}

/// Log filter: emitting contract, event topic0, optional first indexed topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilter {
    pub address: Address,
    pub kind: EventKind,
    pub topic0: [u8; 32],
    pub topic1: Option<[u8; 32]>,
}

/// Single-attempt ledger transport. Implementations must tolerate concurrent calls.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    async fn current_height(&self) -> Result<u64, LedgerError>;

    async fn read_state(
        &self,
        contract: &Address,
        subject: &SubjectId,
    ) -> Result<SubjectState, LedgerError>;

    /// Logs matching `filter` in `from..=to`, decoded.
    async fn search_logs(
        &self,
        filter: &LogFilter,
        from: u64,
        to: u64,
    ) -> Result<Vec<EventRecord>, LedgerError>;

    /// Ask the consumer to resolve `subject` through its manual entry point.
    async fn manual_trigger(&self, contract: &Address, subject: &SubjectId) -> Result<(), LedgerError> {
        let _ = (contract, subject);
        Err(LedgerError::NotFound("manual trigger not supported".into()))
    }
}

/// Retrying, timeout-bounded front for a shared [LedgerClient].
pub struct Gateway {
    client: Arc<dyn LedgerClient>,
    retry: RetryConfig,
    call_timeout: Duration,
}

impl Gateway {
    pub fn new(client: Arc<dyn LedgerClient>, config: &MonitorConfig) -> Self {
        Self {
            client,
            retry: config.retry.clone(),
            call_timeout: config.call_timeout(),
        }
    }

    pub async fn current_height(&self, cancel: &CancellationToken) -> Result<u64, LedgerError> {
        self.with_retry("current_height", cancel, || self.client.current_height())
            .await
    }

    pub async fn read_state(
        &self,
        contract: &Address,
        subject: &SubjectId,
        cancel: &CancellationToken,
    ) -> Result<SubjectState, LedgerError> {
        self.with_retry("read_state", cancel, || {
            self.client.read_state(contract, subject)
        })
        .await
    }

    pub async fn search_logs(
        &self,
        filter: &LogFilter,
        from: u64,
        to: u64,
        cancel: &CancellationToken,
    ) -> Result<Vec<EventRecord>, LedgerError> {
        self.with_retry("search_logs", cancel, || {
            self.client.search_logs(filter, from, to)
        })
        .await
    }

    /// Mutating call: one attempt only, bounded by the per-call timeout.
    pub async fn manual_trigger(
        &self,
        contract: &Address,
        subject: &SubjectId,
    ) -> Result<(), LedgerError> {
        match timeout(self.call_timeout, self.client.manual_trigger(contract, subject)).await {
            Ok(r) => r,
            Err(_) => Err(LedgerError::Transient(format!(
                "manual_trigger timed out after {:?}",
                self.call_timeout
            ))),
        }
    }

    async fn with_retry<T, F, Fut>(
        &self,
        op: &'static str,
        cancel: &CancellationToken,
        mut call: F,
    ) -> Result<T, LedgerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, LedgerError>>,
    {
        let mut retry = 0u32;
        loop {
            let result = match timeout(self.call_timeout, call()).await {
                Ok(r) => r,
                Err(_) => Err(LedgerError::Transient(format!(
                    "{} timed out after {:?}",
                    op, self.call_timeout
                ))),
            };
            let err = match result {
                Err(e) if e.is_transient() => e,
                other => return other,
            };
            if retry >= self.retry.max_retries {
                tracing::warn!(op, attempts = retry + 1, reason = %err, "ledger retries exhausted");
                return Err(LedgerError::Unavailable {
                    attempts: retry + 1,
                    last: err.to_string(),
                });
            }
            let delay = self.backoff(retry);
            tracing::debug!(op, retry, delay_ms = delay.as_millis() as u64, reason = %err, "transient ledger error, backing off");
            tokio::select! {
                _ = cancel.cancelled() => return Err(LedgerError::Cancelled),
                _ = sleep(delay) => {}
            }
            retry += 1;
        }
    }

    fn backoff(&self, retry: u32) -> Duration {
        let base = self.retry.delay(retry);
        if self.retry.jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=self.retry.jitter_ms))
    }
}
