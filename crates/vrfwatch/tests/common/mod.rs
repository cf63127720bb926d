//! Common helpers for integration tests: a scripted in-memory ledger.
//! Some helpers are only used by specific test binaries; allow dead_code to avoid per-binary warnings.
#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use vrfwatch::{
    Address, EventKind, EventRecord, LedgerClient, LedgerError, LogFilter, MonitorConfig, Payload,
    RequestId, SubjectId, SubjectState, U256,
};

pub const CONSUMER: Address = Address([0xaa; 20]);
pub const COORDINATOR: Address = Address([0xc0; 20]);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("vrfwatch=debug".parse().unwrap()))
        .with_test_writer()
        .try_init();
}

/// Short timings so paused-clock tests stay readable.
pub fn test_config() -> MonitorConfig {
    let mut c = MonitorConfig::default();
    c.consumer_address = CONSUMER;
    c.coordinator_address = COORDINATOR;
    c.max_wait_secs = 60;
    c.poll_interval_ms = 1_000;
    c.call_timeout_ms = 2_000;
    c.reap_grace_secs = 30;
    c.scan.window_size = 100;
    c.scan.lookback_windows = 5;
    c
}

pub fn rid(n: u64) -> RequestId {
    RequestId::from(U256::from(n))
}

/// How a subject's state view behaves.
#[derive(Debug, Clone)]
pub enum Script {
    /// Unresolved for `after` reads, then resolved.
    ResolveAfter {
        after: u32,
        attribute: u64,
        request_id: Option<RequestId>,
    },
    Never,
    Missing,
}

/// In-memory ledger: scripted state views, a fixed log set, call counters.
pub struct ScriptedLedger {
    pub tip: u64,
    scripts: Mutex<HashMap<SubjectId, Script>>,
    reads: Mutex<HashMap<SubjectId, u32>>,
    events: Mutex<Vec<EventRecord>>,
    /// Upcoming state reads that fail transiently.
    pub failing_reads: AtomicU32,
    /// Upcoming log searches that fail transiently.
    pub failing_searches: AtomicU32,
    /// Latency of every state read.
    pub read_delay: Option<Duration>,
    pub search_calls: AtomicU32,
    pub trigger_calls: AtomicU32,
    pub trigger_ok: bool,
    /// The manual trigger never returns.
    pub trigger_hangs: bool,
}

impl ScriptedLedger {
    pub fn new(tip: u64) -> Self {
        Self {
            tip,
            scripts: Mutex::new(HashMap::new()),
            reads: Mutex::new(HashMap::new()),
            events: Mutex::new(Vec::new()),
            failing_reads: AtomicU32::new(0),
            failing_searches: AtomicU32::new(0),
            read_delay: None,
            search_calls: AtomicU32::new(0),
            trigger_calls: AtomicU32::new(0),
            trigger_ok: false,
            trigger_hangs: false,
        }
    }

    pub fn script(&self, subject: u64, script: Script) {
        self.scripts
            .lock()
            .unwrap()
            .insert(SubjectId::from(subject), script);
    }

    pub fn push(&self, ev: EventRecord) {
        self.events.lock().unwrap().push(ev);
    }

    pub fn reads(&self, subject: u64) -> u32 {
        self.reads
            .lock()
            .unwrap()
            .get(&SubjectId::from(subject))
            .copied()
            .unwrap_or(0)
    }
}

fn matches_filter(ev: &EventRecord, filter: &LogFilter) -> bool {
    if ev.emitter != filter.address || ev.kind() != filter.kind {
        return false;
    }
    match filter.topic1 {
        None => true,
        Some(t) => match ev.kind() {
            EventKind::RequestFulfilled => ev.request_id.map(|r| r.0) == Some(t),
            _ => ev.subject.map(|s| s.word()) == Some(t),
        },
    }
}

#[async_trait]
impl LedgerClient for ScriptedLedger {
    async fn current_height(&self) -> Result<u64, LedgerError> {
        Ok(self.tip)
    }

    async fn read_state(
        &self,
        _contract: &Address,
        subject: &SubjectId,
    ) -> Result<SubjectState, LedgerError> {
        if let Some(delay) = self.read_delay {
            tokio::time::sleep(delay).await;
        }
        let failing = self.failing_reads.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_reads.store(failing - 1, Ordering::SeqCst);
            return Err(LedgerError::Transient("connection reset".into()));
        }
        let n = {
            let mut reads = self.reads.lock().unwrap();
            let n = reads.entry(*subject).or_insert(0);
            *n += 1;
            *n
        };
        let script = self.scripts.lock().unwrap().get(subject).cloned();
        match script {
            Some(Script::ResolveAfter {
                after,
                attribute,
                request_id,
            }) if n > after => Ok(SubjectState {
                resolved: true,
                attribute: Some(attribute),
                request_id,
            }),
            Some(Script::ResolveAfter { request_id, .. }) => Ok(SubjectState {
                resolved: false,
                attribute: None,
                request_id,
            }),
            Some(Script::Never) => Ok(SubjectState::default()),
            Some(Script::Missing) | None => Err(LedgerError::NotFound(format!(
                "execution reverted: subject {} does not exist",
                subject
            ))),
        }
    }

    async fn search_logs(
        &self,
        filter: &LogFilter,
        from: u64,
        to: u64,
    ) -> Result<Vec<EventRecord>, LedgerError> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self.failing_searches.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_searches.store(failing - 1, Ordering::SeqCst);
            return Err(LedgerError::Transient("upstream timeout".into()));
        }
        Ok(self
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.block_height >= from && e.block_height <= to && matches_filter(e, filter))
            .cloned()
            .collect())
    }

    async fn manual_trigger(&self, _contract: &Address, _subject: &SubjectId) -> Result<(), LedgerError> {
        self.trigger_calls.fetch_add(1, Ordering::SeqCst);
        if self.trigger_hangs {
            std::future::pending::<()>().await;
        }
        if self.trigger_ok {
            Ok(())
        } else {
            Err(LedgerError::Invalid("execution reverted: not owner".into()))
        }
    }
}

fn tx(block: u64, salt: u8) -> [u8; 32] {
    let mut h = [salt; 32];
    h[..8].copy_from_slice(&block.to_be_bytes());
    h
}

pub fn submitted(subject: u64, request: RequestId, block: u64) -> EventRecord {
    EventRecord {
        request_id: Some(request),
        subject: Some(SubjectId::from(subject)),
        emitter: CONSUMER,
        block_height: block,
        tx_hash: tx(block, 1),
        log_index: 0,
        payload: Payload::Submitted,
    }
}

pub fn fulfilled(request: RequestId, block: u64, random_value: u64) -> EventRecord {
    EventRecord {
        request_id: Some(request),
        subject: None,
        emitter: COORDINATOR,
        block_height: block,
        tx_hash: tx(block, 2),
        log_index: 0,
        payload: Payload::Fulfilled {
            random_value: U256::from(random_value),
            success: true,
        },
    }
}

pub fn revealed(
    subject: u64,
    request: Option<RequestId>,
    block: u64,
    attribute: u64,
    random_value: Option<u64>,
) -> EventRecord {
    EventRecord {
        request_id: request,
        subject: Some(SubjectId::from(subject)),
        emitter: CONSUMER,
        block_height: block,
        tx_hash: tx(block, 3),
        log_index: 1,
        payload: Payload::StateChanged {
            attribute,
            random_value: random_value.map(U256::from),
        },
    }
}
