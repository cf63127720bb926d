//! Fulfillment authenticity classifier.
//!
//! A resolution is authentic iff the configured oracle coordinator emitted a successful
//! fulfillment for the session's request id. Everything else (fallback reveal, local
//! resolution, nothing found in the lookback) is a definite, reportable non-authentic
//! classification rather than an error.

use crate::abi::{
    serialize_u256_opt, Address, EventKind, EventRecord, Payload, RequestId, SubjectId,
    SubjectState,
};
use crate::correlation::CorrelationIndex;
use alloy::primitives::U256;
use serde::Serialize;

/// Where the reported value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    OracleFulfillment,
    SubjectStateChange,
    Unproven,
}

/// Ledger location of the event a classification rests on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Evidence {
    pub block_height: u64,
    pub log_index: u64,
    #[serde(rename = "tx_hash")]
    pub tx_hash_hex: String,
}

impl Evidence {
    fn from_event(ev: &EventRecord) -> Self {
        Self {
            block_height: ev.block_height,
            log_index: ev.log_index,
            tx_hash_hex: hex::encode(ev.tx_hash),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Classification {
    pub is_authentic: bool,
    #[serde(serialize_with = "serialize_u256_opt")]
    pub random_value: Option<U256>,
    pub resolved_attribute: Option<u64>,
    pub request_id: Option<RequestId>,
    pub provenance: Provenance,
    pub evidence: Option<Evidence>,
    /// False when some part of the lookback could not be searched.
    pub conclusive: bool,
}

/// Classifies correlated events against the expected oracle coordinator.
#[derive(Debug, Clone)]
pub struct Classifier {
    oracle: Address,
}

impl Classifier {
    pub fn new(oracle: Address) -> Self {
        Self { oracle }
    }

    /// Deterministic in the index contents: candidates are ranked by
    /// `(block_height, log_index, tx_hash)`, never by insertion order.
    pub fn classify(
        &self,
        index: &CorrelationIndex,
        subject: &SubjectId,
        request_id: Option<RequestId>,
        state: &SubjectState,
        conclusive: bool,
    ) -> Classification {
        let reveal = index
            .subject_events(subject, EventKind::SubjectStateChanged)
            .into_iter()
            .next_back();
        let (reveal_attribute, reveal_value) = match reveal.map(|e| &e.payload) {
            Some(Payload::StateChanged {
                attribute,
                random_value,
            }) => (Some(*attribute), *random_value),
            _ => (None, None),
        };
        let resolved_attribute = reveal_attribute.or(state.attribute);

        if let Some(ev) = request_id.and_then(|r| self.authentic_fulfillment(index, &r)) {
            let random_value = match ev.payload {
                Payload::Fulfilled { random_value, .. } => Some(random_value),
                _ => None,
            };
            return Classification {
                is_authentic: true,
                random_value,
                resolved_attribute,
                request_id,
                provenance: Provenance::OracleFulfillment,
                evidence: Some(Evidence::from_event(ev)),
                conclusive,
            };
        }

        Classification {
            is_authentic: false,
            random_value: reveal_value,
            resolved_attribute,
            request_id,
            provenance: if reveal.is_some() {
                Provenance::SubjectStateChange
            } else {
                Provenance::Unproven
            },
            evidence: reveal.map(Evidence::from_event),
            conclusive,
        }
    }

    fn authentic_fulfillment<'a>(
        &self,
        index: &'a CorrelationIndex,
        request_id: &RequestId,
    ) -> Option<&'a EventRecord> {
        index
            .events_for(request_id, EventKind::RequestFulfilled)
            .filter(|e| {
                let from_oracle = e.emitter == self.oracle;
                if !from_oracle {
                    tracing::debug!(emitter = %e.emitter, request_id = %request_id, "fulfillment from unexpected emitter");
                }
                from_oracle && matches!(e.payload, Payload::Fulfilled { success: true, .. })
            })
            .max_by_key(|e| (e.position(), e.tx_hash))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ORACLE: Address = Address([0xc0; 20]);

    fn rid(n: u64) -> RequestId {
        RequestId::from(U256::from(n))
    }

    fn fulfillment(emitter: Address, request: u64, block: u64, value: u64, success: bool) -> EventRecord {
        EventRecord {
            request_id: Some(rid(request)),
            subject: None,
            emitter,
            block_height: block,
            tx_hash: [block as u8; 32],
            log_index: 0,
            payload: Payload::Fulfilled {
                random_value: U256::from(value),
                success,
            },
        }
    }

    fn reveal(subject: u64, request: Option<u64>, block: u64, attribute: u64, value: Option<u64>) -> EventRecord {
        EventRecord {
            request_id: request.map(rid),
            subject: Some(SubjectId::from(subject)),
            emitter: Address([0xaa; 20]),
            block_height: block,
            tx_hash: [block as u8; 32],
            log_index: 1,
            payload: Payload::StateChanged {
                attribute,
                random_value: value.map(U256::from),
            },
        }
    }

    fn resolved(attribute: u64) -> SubjectState {
        SubjectState {
            resolved: true,
            attribute: Some(attribute),
            request_id: None,
        }
    }

    #[test]
    fn oracle_fulfillment_is_authentic() {
        let mut idx = CorrelationIndex::new();
        idx.insert(fulfillment(ORACLE, 1, 100, 987_654_321, true));
        let c = Classifier::new(ORACLE).classify(&idx, &SubjectId::from(42), Some(rid(1)), &resolved(2), true);
        assert!(c.is_authentic);
        assert_eq!(c.random_value, Some(U256::from(987_654_321u64)));
        assert_eq!(c.resolved_attribute, Some(2));
        assert_eq!(c.provenance, Provenance::OracleFulfillment);
        assert_eq!(c.evidence.unwrap().block_height, 100);
    }

    #[test]
    fn nothing_found_is_unproven_not_error() {
        let idx = CorrelationIndex::new();
        let c = Classifier::new(ORACLE).classify(&idx, &SubjectId::from(7), None, &resolved(1), true);
        assert!(!c.is_authentic);
        assert_eq!(c.random_value, None);
        assert_eq!(c.resolved_attribute, Some(1));
        assert_eq!(c.provenance, Provenance::Unproven);
    }

    #[test]
    fn fallback_reveal_supplies_value() {
        let mut idx = CorrelationIndex::new();
        idx.insert(reveal(7, None, 50, 3, Some(12345)));
        let c = Classifier::new(ORACLE).classify(&idx, &SubjectId::from(7), None, &resolved(3), true);
        assert!(!c.is_authentic);
        assert_eq!(c.random_value, Some(U256::from(12345u64)));
        assert_eq!(c.provenance, Provenance::SubjectStateChange);
    }

    #[test]
    fn wrong_emitter_or_failed_callback_is_not_authentic() {
        let mut idx = CorrelationIndex::new();
        idx.insert(fulfillment(Address([0x01; 20]), 1, 100, 5, true));
        idx.insert(fulfillment(ORACLE, 1, 101, 6, false));
        let c = Classifier::new(ORACLE).classify(&idx, &SubjectId::from(42), Some(rid(1)), &resolved(2), true);
        assert!(!c.is_authentic);
        assert_eq!(c.random_value, None);
    }

    #[test]
    fn large_values_do_not_imply_authenticity() {
        let mut idx = CorrelationIndex::new();
        let huge = u64::MAX;
        idx.insert(reveal(7, Some(1), 50, 3, Some(huge)));
        let c = Classifier::new(ORACLE).classify(&idx, &SubjectId::from(7), Some(rid(1)), &resolved(3), true);
        assert!(!c.is_authentic);
    }

    #[test]
    fn classification_is_order_independent() {
        let events = vec![
            fulfillment(ORACLE, 1, 100, 10, true),
            fulfillment(ORACLE, 1, 120, 20, true),
            reveal(42, Some(1), 121, 4, Some(20)),
            fulfillment(ORACLE, 2, 130, 30, true),
        ];
        let mut forward = CorrelationIndex::new();
        let mut backward = CorrelationIndex::new();
        for e in events.iter().cloned() {
            forward.insert(e);
        }
        for e in events.iter().rev().cloned() {
            backward.insert(e);
        }
        let cl = Classifier::new(ORACLE);
        let a = cl.classify(&forward, &SubjectId::from(42), Some(rid(1)), &resolved(4), true);
        let b = cl.classify(&backward, &SubjectId::from(42), Some(rid(1)), &resolved(4), true);
        assert_eq!(a, b);
        assert_eq!(a.random_value, Some(U256::from(20u64)));
        assert_eq!(a.resolved_attribute, Some(4));
    }
}
