//! Lifecycle state machine: one polling task per outstanding request.
//!
//! `Pending -> Fulfilled | TimedOut | Failed`. The task polls the consumer's state view until
//! the subject resolves, the deadline passes, a non-transient ledger error occurs, or the
//! session is cancelled. On resolution it scans for corroborating events, correlates them and
//! classifies the result before publishing the terminal status. Status snapshots are
//! published on a `watch` channel; once terminal the sender is dropped and the last value
//! stays readable.

use crate::abi::{EventKind, EventRecord, EventTopics, RequestId, SubjectId, SubjectState};
use crate::classifier::{Classification, Classifier};
use crate::config::MonitorConfig;
use crate::correlation::{Anomaly, CorrelationIndex};
use crate::gateway::{Gateway, LedgerClient, LedgerError, LogFilter};
use crate::scanner::{Gap, LogScanner};
use serde::Serialize;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Pending,
    Fulfilled,
    TimedOut,
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionState::Pending)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    Cancelled,
    Ledger(String),
}

/// Outcome of the single best-effort manual trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerOutcome {
    NotAttempted,
    Sent,
    Failed,
}

/// Snapshot of one session, as returned by `status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub subject: SubjectId,
    pub request_id: Option<RequestId>,
    pub state: SessionState,
    pub poll_count: u64,
    pub started_at_unix_ms: u64,
    #[serde(skip)]
    pub started_at: Instant,
    #[serde(skip)]
    pub deadline: Instant,
    #[serde(skip)]
    pub finished_at: Option<Instant>,
    pub last_error: Option<String>,
    pub failure: Option<FailureReason>,
    pub manual_trigger: TriggerOutcome,
    pub classification: Option<Classification>,
    pub anomalies: Vec<Anomaly>,
    pub gaps: Vec<Gap>,
}

/// Everything sessions of one deployment share: config, gateway, scanner, classifier.
pub struct SessionContext {
    pub config: MonitorConfig,
    pub gateway: Arc<Gateway>,
    scanner: LogScanner,
    classifier: Classifier,
    topics: EventTopics,
}

impl SessionContext {
    pub fn new(client: Arc<dyn LedgerClient>, config: MonitorConfig) -> Self {
        let gateway = Arc::new(Gateway::new(client, &config));
        let scanner = LogScanner::new(Arc::clone(&gateway), &config.scan);
        let classifier = Classifier::new(config.coordinator_address);
        let topics = config.entry_points.topics();
        Self {
            config,
            gateway,
            scanner,
            classifier,
            topics,
        }
    }

    fn filter(&self, kind: EventKind, topic1: [u8; 32]) -> LogFilter {
        let address = match kind {
            EventKind::RequestFulfilled => self.config.coordinator_address,
            EventKind::RequestSubmitted | EventKind::SubjectStateChanged => {
                self.config.consumer_address
            }
        };
        LogFilter {
            address,
            kind,
            topic0: self.topics.topic_for(kind),
            topic1: Some(topic1),
        }
    }
}

/// One monitor session. Owned by its task; mutated only by [MonitorSession::run].
pub struct MonitorSession {
    ctx: Arc<SessionContext>,
    status: SessionStatus,
    index: CorrelationIndex,
    tx: watch::Sender<SessionStatus>,
    cancel: CancellationToken,
    trigger_attempted: bool,
}

impl MonitorSession {
    pub fn new(
        ctx: Arc<SessionContext>,
        subject: SubjectId,
        request_id: Option<RequestId>,
        cancel: CancellationToken,
    ) -> (Self, watch::Receiver<SessionStatus>) {
        let started_at = Instant::now();
        let mut index = CorrelationIndex::new();
        if let Some(r) = request_id {
            index.bind(subject, r, 0);
        }
        let status = SessionStatus {
            subject,
            request_id,
            state: SessionState::Pending,
            poll_count: 0,
            started_at_unix_ms: unix_ms(),
            started_at,
            deadline: started_at + ctx.config.max_wait(),
            finished_at: None,
            last_error: None,
            failure: None,
            manual_trigger: TriggerOutcome::NotAttempted,
            classification: None,
            anomalies: Vec::new(),
            gaps: Vec::new(),
        };
        let (tx, rx) = watch::channel(status.clone());
        (
            Self {
                ctx,
                status,
                index,
                tx,
                cancel,
                trigger_attempted: false,
            },
            rx,
        )
    }

    /// Drive the session to a terminal state and return it.
    pub async fn run(mut self) -> SessionStatus {
        let ctx = Arc::clone(&self.ctx);
        let cancel = self.cancel.clone();
        let subject = self.status.subject;
        let consumer = ctx.config.consumer_address;
        let deadline = self.status.deadline;
        tracing::info!(%subject, request_id = ?self.status.request_id.map(|r| r.to_string()), "session started");

        loop {
            if cancel.is_cancelled() {
                return self.fail(FailureReason::Cancelled);
            }
            self.status.poll_count += 1;
            // The read is raced against the deadline only; cancellation waits for the tick.
            let polled = tokio::select! {
                biased;
                r = ctx.gateway.read_state(&consumer, &subject, &cancel) => Some(r),
                _ = sleep_until(deadline) => None,
            };
            match polled {
                Some(Ok(state)) => {
                    self.status.last_error = None;
                    if let Some(r) = state.request_id {
                        self.learn_request_id(r, 0);
                    }
                    if state.resolved {
                        return self.finalize(state).await;
                    }
                    tracing::debug!(%subject, poll = self.status.poll_count, "subject still pending");
                }
                Some(Err(LedgerError::Cancelled)) => return self.fail(FailureReason::Cancelled),
                Some(Err(e)) if e.is_fatal() => {
                    return self.fail(FailureReason::Ledger(e.to_string()));
                }
                Some(Err(e)) => {
                    tracing::warn!(%subject, poll = self.status.poll_count, reason = %e, "state poll failed");
                    self.status.last_error = Some(e.to_string());
                }
                None => {}
            }

            if cancel.is_cancelled() {
                return self.fail(FailureReason::Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                return self.finish(SessionState::TimedOut);
            }
            if self.maybe_trigger(now).await {
                // The trigger may have been cut short by cancellation or the deadline.
                if cancel.is_cancelled() {
                    return self.fail(FailureReason::Cancelled);
                }
                if Instant::now() >= deadline {
                    return self.finish(SessionState::TimedOut);
                }
            }
            self.publish();

            let next = (now + ctx.config.poll_interval()).min(deadline);
            tokio::select! {
                _ = cancel.cancelled() => return self.fail(FailureReason::Cancelled),
                _ = sleep_until(next) => {}
            }
        }
    }

    fn learn_request_id(&mut self, request_id: RequestId, block_height: u64) {
        self.index.bind(self.status.subject, request_id, block_height);
        self.status.request_id = self.index.request_id_for(&self.status.subject);
    }

    /// Sends the manual trigger once the subject has been pending past the grace threshold.
    /// At most one attempt per session; failures only change the reported outcome. The call
    /// is abandoned at the session deadline or on cancellation. Returns whether it was tried.
    async fn maybe_trigger(&mut self, now: Instant) -> bool {
        if self.trigger_attempted || self.ctx.config.entry_points.manual_trigger.is_none() {
            return false;
        }
        if now.duration_since(self.status.started_at) < self.ctx.config.manual_trigger_grace() {
            return false;
        }
        if self.cancel.is_cancelled() {
            return false;
        }
        self.trigger_attempted = true;
        let ctx = Arc::clone(&self.ctx);
        let cancel = self.cancel.clone();
        let subject = self.status.subject;
        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err("cancelled".to_string()),
            _ = sleep_until(self.status.deadline) => Err("deadline reached".to_string()),
            r = ctx.gateway.manual_trigger(&ctx.config.consumer_address, &subject) => {
                r.map_err(|e| e.to_string())
            }
        };
        match sent {
            Ok(()) => {
                tracing::info!(%subject, "manual trigger accepted");
                self.status.manual_trigger = TriggerOutcome::Sent;
            }
            Err(reason) => {
                tracing::warn!(%subject, %reason, "manual trigger failed");
                self.status.manual_trigger = TriggerOutcome::Failed;
            }
        }
        true
    }

    /// Subject resolved: discover, correlate, classify. Always ends `Fulfilled`; missing or
    /// partial evidence only weakens the classification.
    async fn finalize(mut self, state: SubjectState) -> SessionStatus {
        let ctx = Arc::clone(&self.ctx);
        let subject = self.status.subject;
        let mut conclusive = true;

        if self.index.request_id_for(&subject).is_none() {
            let filter = ctx.filter(EventKind::RequestSubmitted, subject.word());
            conclusive &= self
                .ingest_scan(&filter, move |e| e.subject == Some(subject))
                .await;
        }

        let filter = ctx.filter(EventKind::SubjectStateChanged, subject.word());
        conclusive &= self
            .ingest_scan(&filter, move |e| e.subject == Some(subject))
            .await;

        let request_id = self.index.request_id_for(&subject);
        if let Some(r) = request_id {
            let filter = ctx.filter(EventKind::RequestFulfilled, r.0);
            conclusive &= self
                .ingest_scan(&filter, move |e| e.request_id == Some(r))
                .await;
        } else {
            tracing::info!(%subject, "no request id discovered; fulfillment not searched");
        }

        let classification =
            ctx.classifier
                .classify(&self.index, &subject, request_id, &state, conclusive);
        tracing::info!(
            %subject,
            authentic = classification.is_authentic,
            provenance = ?classification.provenance,
            conclusive,
            "subject resolved"
        );
        self.status.request_id = request_id;
        self.status.classification = Some(classification);
        self.finish(SessionState::Fulfilled)
    }

    /// Run one backward scan and ingest its match. Returns whether the scan was conclusive.
    async fn ingest_scan<F>(&mut self, filter: &LogFilter, matches: F) -> bool
    where
        F: Fn(&EventRecord) -> bool,
    {
        let ctx = Arc::clone(&self.ctx);
        let cancel = self.cancel.clone();
        match ctx.scanner.scan_latest(filter, matches, &cancel).await {
            Ok(outcome) => {
                let conclusive = outcome.is_conclusive();
                self.status.gaps.extend(outcome.gaps);
                if let Some(ev) = outcome.found {
                    self.index.insert(ev);
                }
                conclusive
            }
            Err(e) => {
                tracing::warn!(subject = %self.status.subject, kind = ?filter.kind, reason = %e, "scan aborted");
                self.status.last_error = Some(e.to_string());
                false
            }
        }
    }

    fn fail(mut self, reason: FailureReason) -> SessionStatus {
        tracing::warn!(subject = %self.status.subject, reason = ?reason, "session failed");
        self.status.failure = Some(reason);
        self.finish(SessionState::Failed)
    }

    fn finish(mut self, state: SessionState) -> SessionStatus {
        self.status.state = state;
        self.status.finished_at = Some(Instant::now());
        self.status.anomalies = self.index.anomalies().to_vec();
        tracing::info!(
            subject = %self.status.subject,
            state = ?state,
            polls = self.status.poll_count,
            "session finished"
        );
        self.publish();
        self.status
    }

    fn publish(&self) {
        self.tx.send_replace(self.status.clone());
    }
}

fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_pending_is_non_terminal() {
        assert!(!SessionState::Pending.is_terminal());
        assert!(SessionState::Fulfilled.is_terminal());
        assert!(SessionState::TimedOut.is_terminal());
        assert!(SessionState::Failed.is_terminal());
    }

    #[test]
    fn failure_reason_serializes_tagged() {
        let v = serde_json::to_value(FailureReason::Ledger("not found: x".into())).unwrap();
        assert_eq!(v["reason"], "ledger");
        assert_eq!(v["detail"], "not found: x");
        let v = serde_json::to_value(FailureReason::Cancelled).unwrap();
        assert_eq!(v["reason"], "cancelled");
    }
}
