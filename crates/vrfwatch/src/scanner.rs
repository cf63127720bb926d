//! Batched log scanner: backward search from the tip in bounded windows.
//!
//! Providers cap eth_getLogs by block range or result count, so the lookback is split into
//! windows of at most `window_size` blocks, newest first. The first window holding a match
//! wins. A window refused as too large is bisected; a window that stays unavailable after
//! gateway retries is recorded as a gap and skipped.

use crate::abi::EventRecord;
use crate::config::ScanConfig;
use crate::gateway::{Gateway, LedgerError, LogFilter};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Result of one backward scan.
#[derive(Debug, Clone, Default)]
pub struct ScanOutcome {
    /// Most recent matching event, if any.
    pub found: Option<EventRecord>,
    /// search_logs calls issued through the gateway (retries not counted).
    pub calls: u32,
    pub windows_scanned: u64,
    /// Block ranges that could not be searched.
    pub gaps: Vec<Gap>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Gap {
    pub from: u64,
    pub to: u64,
}

impl ScanOutcome {
    /// An empty result is only definitive if every block in the lookback was searched.
    pub fn is_conclusive(&self) -> bool {
        self.gaps.is_empty()
    }
}

pub struct LogScanner {
    gateway: Arc<Gateway>,
    window_size: u64,
    lookback_windows: u64,
}

impl LogScanner {
    pub fn new(gateway: Arc<Gateway>, config: &ScanConfig) -> Self {
        Self {
            gateway,
            window_size: config.window_size.max(1),
            lookback_windows: config.lookback_windows,
        }
    }

    /// Scan backward from the current tip. Errors only if the tip cannot be read or the
    /// scan is cancelled.
    pub async fn scan_latest<F>(
        &self,
        filter: &LogFilter,
        matches: F,
        cancel: &CancellationToken,
    ) -> Result<ScanOutcome, LedgerError>
    where
        F: Fn(&EventRecord) -> bool,
    {
        let tip = self.gateway.current_height(cancel).await?;
        self.scan_from(tip, filter, matches, cancel).await
    }

    /// Scan backward from `tip` (inclusive).
    pub async fn scan_from<F>(
        &self,
        tip: u64,
        filter: &LogFilter,
        matches: F,
        cancel: &CancellationToken,
    ) -> Result<ScanOutcome, LedgerError>
    where
        F: Fn(&EventRecord) -> bool,
    {
        let mut outcome = ScanOutcome::default();
        let mut to = tip;
        for _ in 0..self.lookback_windows {
            let from = to.saturating_sub(self.window_size - 1);
            outcome.windows_scanned += 1;
            if let Some(best) = self
                .search_window(filter, from, to, &matches, cancel, &mut outcome)
                .await?
            {
                tracing::debug!(
                    kind = ?filter.kind,
                    block = best.block_height,
                    log_index = best.log_index,
                    windows = outcome.windows_scanned,
                    "scan: match found"
                );
                outcome.found = Some(best);
                return Ok(outcome);
            }
            if from == 0 {
                break;
            }
            to = from - 1;
        }
        tracing::debug!(
            kind = ?filter.kind,
            windows = outcome.windows_scanned,
            gaps = outcome.gaps.len(),
            "scan: lookback exhausted"
        );
        Ok(outcome)
    }

    /// Search `from..=to`, bisecting on `RangeTooLarge`. Sub-ranges are visited newest first,
    /// so the first one with a match holds the window's best match.
    async fn search_window<F>(
        &self,
        filter: &LogFilter,
        from: u64,
        to: u64,
        matches: &F,
        cancel: &CancellationToken,
        outcome: &mut ScanOutcome,
    ) -> Result<Option<EventRecord>, LedgerError>
    where
        F: Fn(&EventRecord) -> bool,
    {
        let mut stack = vec![(from, to)];
        while let Some((f, t)) = stack.pop() {
            outcome.calls += 1;
            match self.gateway.search_logs(filter, f, t, cancel).await {
                Ok(events) => {
                    let best = events
                        .into_iter()
                        .filter(|ev| matches(ev))
                        .max_by_key(|ev| ev.position());
                    if best.is_some() {
                        return Ok(best);
                    }
                }
                Err(LedgerError::RangeTooLarge { .. }) if f < t => {
                    let mid = f + (t - f) / 2;
                    tracing::debug!(from = f, to = t, "scan: range too large, narrowing");
                    stack.push((f, mid));
                    stack.push((mid + 1, t));
                }
                Err(LedgerError::Cancelled) => return Err(LedgerError::Cancelled),
                Err(e) => {
                    tracing::warn!(from = f, to = t, reason = %e, "scan: window skipped");
                    outcome.gaps.push(Gap { from: f, to: t });
                }
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::{Address, EventKind, Payload, RequestId, SubjectId, SubjectState};
    use crate::config::MonitorConfig;
    use crate::gateway::LedgerClient;
    use alloy::primitives::U256;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Serves a fixed event list; records every requested range.
    struct Logs {
        tip: u64,
        events: Vec<EventRecord>,
        max_range: u64,
        down: Vec<(u64, u64)>,
        calls: Mutex<Vec<(u64, u64)>>,
    }

    #[async_trait]
    impl LedgerClient for Logs {
        async fn current_height(&self) -> Result<u64, LedgerError> {
            Ok(self.tip)
        }

        async fn read_state(&self, _: &Address, _: &SubjectId) -> Result<SubjectState, LedgerError> {
            Ok(SubjectState::default())
        }

        async fn search_logs(&self, _: &LogFilter, from: u64, to: u64) -> Result<Vec<EventRecord>, LedgerError> {
            self.calls.lock().unwrap().push((from, to));
            if to - from + 1 > self.max_range {
                return Err(LedgerError::RangeTooLarge { from, to });
            }
            if self.down.contains(&(from, to)) {
                return Err(LedgerError::Invalid("window unavailable".into()));
            }
            Ok(self
                .events
                .iter()
                .filter(|e| e.block_height >= from && e.block_height <= to)
                .cloned()
                .collect())
        }
    }

    fn fulfilled(block: u64, log_index: u64, value: u64) -> EventRecord {
        EventRecord {
            request_id: Some(RequestId::from(U256::from(1u64))),
            subject: None,
            emitter: Address::default(),
            block_height: block,
            tx_hash: [block as u8; 32],
            log_index,
            payload: Payload::Fulfilled {
                random_value: U256::from(value),
                success: true,
            },
        }
    }

    fn filter() -> LogFilter {
        LogFilter {
            address: Address::default(),
            kind: EventKind::RequestFulfilled,
            topic0: [0u8; 32],
            topic1: None,
        }
    }

    fn scanner(client: Arc<Logs>, window_size: u64, lookback_windows: u64) -> LogScanner {
        let gateway = Arc::new(Gateway::new(client, &MonitorConfig::default()));
        LogScanner::new(
            gateway,
            &ScanConfig {
                window_size,
                lookback_windows,
            },
        )
    }

    fn logs(tip: u64, events: Vec<EventRecord>) -> Logs {
        Logs {
            tip,
            events,
            max_range: u64::MAX,
            down: vec![],
            calls: Mutex::new(vec![]),
        }
    }

    #[tokio::test]
    async fn empty_scan_is_bounded_by_lookback() {
        let client = Arc::new(logs(10_000, vec![]));
        let s = scanner(Arc::clone(&client), 100, 5);
        let out = s.scan_latest(&filter(), |_| true, &CancellationToken::new()).await.unwrap();
        assert!(out.found.is_none());
        assert!(out.is_conclusive());
        assert_eq!(out.calls, 5);
        assert_eq!(
            *client.calls.lock().unwrap(),
            vec![(9_901, 10_000), (9_801, 9_900), (9_701, 9_800), (9_601, 9_700), (9_501, 9_600)]
        );
    }

    #[tokio::test]
    async fn stops_at_genesis() {
        let client = Arc::new(logs(150, vec![]));
        let s = scanner(Arc::clone(&client), 100, 10);
        let out = s.scan_latest(&filter(), |_| true, &CancellationToken::new()).await.unwrap();
        assert_eq!(out.windows_scanned, 2);
        assert_eq!(*client.calls.lock().unwrap(), vec![(51, 150), (0, 50)]);
    }

    #[tokio::test]
    async fn most_recent_match_wins_within_window() {
        let client = Arc::new(logs(
            1_000,
            vec![fulfilled(950, 9, 1), fulfilled(980, 0, 2), fulfilled(980, 4, 3), fulfilled(700, 0, 4)],
        ));
        let s = scanner(client, 100, 10);
        let out = s.scan_latest(&filter(), |_| true, &CancellationToken::new()).await.unwrap();
        let found = out.found.as_ref().unwrap();
        assert_eq!(found.position(), (980, 4));
        assert_eq!(out.calls, 1);
    }

    #[tokio::test]
    async fn matcher_filters_candidates() {
        let client = Arc::new(logs(1_000, vec![fulfilled(990, 0, 1), fulfilled(850, 0, 2)]));
        let s = scanner(client, 100, 10);
        let out = s
            .scan_latest(&filter(), |e| e.block_height < 900, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.found.as_ref().unwrap().block_height, 850);
        assert_eq!(out.windows_scanned, 2);
    }

    #[tokio::test]
    async fn narrows_range_too_large() {
        let mut l = logs(1_000, vec![fulfilled(930, 0, 7)]);
        l.max_range = 30;
        let client = Arc::new(l);
        let s = scanner(Arc::clone(&client), 100, 3);
        let out = s.scan_latest(&filter(), |_| true, &CancellationToken::new()).await.unwrap();
        assert_eq!(out.found.as_ref().unwrap().block_height, 930);
        assert!(out.is_conclusive());
        let calls = client.calls.lock().unwrap().clone();
        // 901..=1000 -> 951..=1000 -> 976..=1000 (ok), 951..=975 (ok), then 901..=950 -> ...
        assert_eq!(calls[0], (901, 1_000));
        assert_eq!(calls[1], (951, 1_000));
        assert_eq!(calls[2], (976, 1_000));
        assert!(calls.iter().all(|(f, t)| *f >= 901 && *t <= 1_000));
    }

    #[tokio::test]
    async fn unavailable_window_is_recorded_as_gap() {
        let mut l = logs(1_000, vec![fulfilled(850, 0, 5)]);
        l.down = vec![(901, 1_000)];
        let client = Arc::new(l);
        let s = scanner(client, 100, 5);
        let out = s.scan_latest(&filter(), |_| true, &CancellationToken::new()).await.unwrap();
        assert_eq!(out.found.as_ref().unwrap().block_height, 850);
        assert_eq!(out.gaps, vec![Gap { from: 901, to: 1_000 }]);
        assert!(!out.is_conclusive());
    }
}
