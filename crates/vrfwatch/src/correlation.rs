//! Correlation index: request id -> observed events, subject -> request id.
//!
//! Ingestion is idempotent by `(kind, tx_hash, log_index)`. The subject's request id is set
//! once (first writer wins); conflicting observations are kept as [Anomaly] records and
//! logged, never applied. Records are never mutated; "latest" is a query
//! ([CorrelationIndex::canonical]) ordered by `(block_height, log_index)`.

use crate::abi::{EventKey, EventKind, EventRecord, RequestId, SubjectId};
use serde::Serialize;
use std::collections::{HashMap, HashSet};

/// A correlation observation that disagreed with the established mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Anomaly {
    pub subject: SubjectId,
    pub established: RequestId,
    pub observed: RequestId,
    pub block_height: u64,
}

#[derive(Debug, Default)]
pub struct CorrelationIndex {
    seen: HashSet<EventKey>,
    by_request: HashMap<RequestId, Vec<EventRecord>>,
    /// Subject-scoped events that carry no request id (fallback reveals).
    by_subject: HashMap<SubjectId, Vec<EventRecord>>,
    request_for_subject: HashMap<SubjectId, RequestId>,
    anomalies: Vec<Anomaly>,
}

impl CorrelationIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ingest one event. Returns false if its identity key was already present.
    pub fn insert(&mut self, ev: EventRecord) -> bool {
        if !self.seen.insert(ev.key()) {
            return false;
        }
        if let (Some(subject), Some(request_id)) = (ev.subject, ev.request_id) {
            if ev.kind() != EventKind::RequestFulfilled {
                self.bind(subject, request_id, ev.block_height);
            }
        }
        let bucket = match (ev.request_id, ev.subject) {
            (Some(request_id), _) => self.by_request.entry(request_id).or_default(),
            (None, Some(subject)) => self.by_subject.entry(subject).or_default(),
            (None, None) => {
                tracing::debug!(tx = %hex::encode(ev.tx_hash), "event without request or subject ignored");
                return true;
            }
        };
        let pos = bucket
            .binary_search_by_key(&ev.position(), |e| e.position())
            .unwrap_or_else(|p| p);
        bucket.insert(pos, ev);
        true
    }

    /// Record an externally known request id for `subject` (session start, state view).
    /// Subject to the same first-writer-wins rule as observed events.
    pub fn bind(&mut self, subject: SubjectId, request_id: RequestId, block_height: u64) {
        match self.request_for_subject.get(&subject) {
            None => {
                self.request_for_subject.insert(subject, request_id);
            }
            Some(established) if *established == request_id => {}
            Some(established) => {
                tracing::warn!(
                    %subject,
                    established = %established,
                    observed = %request_id,
                    block_height,
                    "anomalous correlation: conflicting request id ignored"
                );
                self.anomalies.push(Anomaly {
                    subject,
                    established: *established,
                    observed: request_id,
                    block_height,
                });
            }
        }
    }

    pub fn request_id_for(&self, subject: &SubjectId) -> Option<RequestId> {
        self.request_for_subject.get(subject).copied()
    }

    /// Events of `kind` correlated to `request_id`, ascending by ledger position.
    pub fn events_for<'a>(
        &'a self,
        request_id: &RequestId,
        kind: EventKind,
    ) -> impl Iterator<Item = &'a EventRecord> + 'a {
        self.by_request
            .get(request_id)
            .into_iter()
            .flatten()
            .filter(move |e| e.kind() == kind)
    }

    /// Events of `kind` for `subject`, with or without a request id, ascending by position.
    pub fn subject_events(&self, subject: &SubjectId, kind: EventKind) -> Vec<&EventRecord> {
        let mut out: Vec<&EventRecord> = self
            .by_request
            .values()
            .flatten()
            .chain(self.by_subject.get(subject).into_iter().flatten())
            .filter(|e| e.kind() == kind && e.subject.as_ref() == Some(subject))
            .collect();
        out.sort_by_key(|e| (e.position(), e.tx_hash));
        out
    }

    /// The canonical (highest-positioned) event of `kind` for `request_id`.
    pub fn canonical(&self, request_id: &RequestId, kind: EventKind) -> Option<&EventRecord> {
        self.events_for(request_id, kind)
            .max_by_key(|e| (e.position(), e.tx_hash))
    }

    pub fn anomalies(&self) -> &[Anomaly] {
        &self.anomalies
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
