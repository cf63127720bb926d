//! ABI types and decoding for the consumer and coordinator contracts.
//!
//! Identifiers, keccak-256 topics and selectors, and decoding of JSON-RPC log objects
//! (`eth_getLogs` result) and `eth_call` return data into [EventRecord] / [SubjectState].

use alloy::primitives::U256;
use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use sha3::{Digest, Keccak256};
use std::fmt;
use std::str::FromStr;

/// 20-byte contract or account address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Address(pub [u8; 20]);

impl FromStr for Address {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        parse_hex_bytes_20(s).map(Address)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Opaque identifier of the entity being resolved (e.g. a token id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct SubjectId(pub U256);

impl SubjectId {
    /// Subject as an indexed-topic / calldata word.
    pub fn word(&self) -> [u8; 32] {
        self.0.to_be_bytes::<32>()
    }
}

impl From<u64> for SubjectId {
    fn from(n: u64) -> Self {
        Self(U256::from(n))
    }
}

impl FromStr for SubjectId {
    type Err = anyhow::Error;

    /// Accepts decimal or `0x`-prefixed hex.
    fn from_str(s: &str) -> Result<Self> {
        U256::from_str(s.trim())
            .map(SubjectId)
            .with_context(|| format!("invalid subject id {s:?}"))
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for SubjectId {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

/// Opaque correlation key linking a submitted request to its fulfillment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub [u8; 32]);

impl RequestId {
    /// A zero word means "no request id" in both the state view and the reveal event.
    pub fn from_word(word: [u8; 32]) -> Option<Self> {
        if word == [0u8; 32] {
            None
        } else {
            Some(Self(word))
        }
    }
}

impl From<U256> for RequestId {
    fn from(n: U256) -> Self {
        Self(n.to_be_bytes::<32>())
    }
}

impl FromStr for RequestId {
    type Err = anyhow::Error;

    /// Accepts a `0x`-prefixed 32-byte hex word or a decimal integer.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.starts_with("0x") && s.len() == 66 {
            return parse_hex_bytes_32(s).map(RequestId);
        }
        U256::from_str(s)
            .map(RequestId::from)
            .with_context(|| format!("invalid request id {s:?}"))
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl Serialize for RequestId {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

/// Serialize a [U256] as a decimal string.
pub(crate) fn serialize_u256_opt<S: Serializer>(v: &Option<U256>, s: S) -> Result<S::Ok, S::Error> {
    match v {
        Some(n) => s.collect_str(n),
        None => s.serialize_none(),
    }
}

/// keccak256 of an event signature, e.g. `"RandomWordsFulfilled(uint256,uint256,uint96,bool)"`.
pub fn event_topic(signature: &str) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Keccak256::digest(signature.as_bytes()));
    out
}

/// First 4 bytes of keccak256 of a function signature.
pub fn selector(signature: &str) -> [u8; 4] {
    let h = event_topic(signature);
    [h[0], h[1], h[2], h[3]]
}

/// Event kinds the monitor correlates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum EventKind {
    RequestSubmitted,
    RequestFulfilled,
    SubjectStateChanged,
}

/// Kind-specific event data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Submitted,
    Fulfilled { random_value: U256, success: bool },
    StateChanged { attribute: u64, random_value: Option<U256> },
}

/// Immutable fact observed on the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    pub request_id: Option<RequestId>,
    pub subject: Option<SubjectId>,
    /// Contract that emitted the log.
    pub emitter: Address,
    pub block_height: u64,
    pub tx_hash: [u8; 32],
    pub log_index: u64,
    pub payload: Payload,
}

/// Identity of an [EventRecord]: `(kind, tx_hash, log_index)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventKey {
    pub kind: EventKind,
    pub tx_hash: [u8; 32],
    pub log_index: u64,
}

impl EventRecord {
    pub fn kind(&self) -> EventKind {
        match self.payload {
            Payload::Submitted => EventKind::RequestSubmitted,
            Payload::Fulfilled { .. } => EventKind::RequestFulfilled,
            Payload::StateChanged { .. } => EventKind::SubjectStateChanged,
        }
    }

    pub fn key(&self) -> EventKey {
        EventKey {
            kind: self.kind(),
            tx_hash: self.tx_hash,
            log_index: self.log_index,
        }
    }

    /// Ledger ordering key: later blocks (then later logs) sort higher.
    pub fn position(&self) -> (u64, u64) {
        (self.block_height, self.log_index)
    }
}

/// Resolution state of a subject as reported by the consumer's state view.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SubjectState {
    pub resolved: bool,
    pub attribute: Option<u64>,
    pub request_id: Option<RequestId>,
}

/// Precomputed topic0 values for the three correlated events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventTopics {
    pub submitted: [u8; 32],
    pub fulfilled: [u8; 32],
    pub state_changed: [u8; 32],
}

impl EventTopics {
    pub fn topic_for(&self, kind: EventKind) -> [u8; 32] {
        match kind {
            EventKind::RequestSubmitted => self.submitted,
            EventKind::RequestFulfilled => self.fulfilled,
            EventKind::SubjectStateChanged => self.state_changed,
        }
    }

    fn kind_of(&self, topic0: &[u8; 32]) -> Option<EventKind> {
        if *topic0 == self.submitted {
            Some(EventKind::RequestSubmitted)
        } else if *topic0 == self.fulfilled {
            Some(EventKind::RequestFulfilled)
        } else if *topic0 == self.state_changed {
            Some(EventKind::SubjectStateChanged)
        } else {
            None
        }
    }
}

/// Calldata for a single-`uint256` view or entry point: `selector ++ subject`.
pub fn encode_subject_call(selector: [u8; 4], subject: &SubjectId) -> Vec<u8> {
    let mut out = Vec::with_capacity(36);
    out.extend_from_slice(&selector);
    out.extend_from_slice(&subject.word());
    out
}

/// Decode a JSON-RPC log into an [EventRecord].
///
/// Layouts:
/// - RequestSubmitted: `topics = [t0, subjectId, requestId]`
/// - RequestFulfilled: `topics = [t0, requestId]`, `data = (outputSeed, payment, success)`
/// - SubjectStateChanged: `topics = [t0, subjectId]`, `data = (requestId, attribute, randomValue)`
pub fn decode_log(log_value: &Value, topics: &EventTopics) -> Result<EventRecord> {
    let emitter = Address(parse_hex_bytes_20(
        log_value
            .get("address")
            .and_then(|a| a.as_str())
            .ok_or_else(|| anyhow::anyhow!("Missing address"))?,
    )?);
    let block_height = parse_hex_u64(
        log_value
            .get("blockNumber")
            .and_then(|n| n.as_str())
            .ok_or_else(|| anyhow::anyhow!("Missing blockNumber"))?,
    )?;
    let log_index = parse_hex_u64(
        log_value
            .get("logIndex")
            .and_then(|n| n.as_str())
            .ok_or_else(|| anyhow::anyhow!("Missing logIndex"))?,
    )?;
    let tx_hash = parse_hex_bytes_32(
        log_value
            .get("transactionHash")
            .and_then(|h| h.as_str())
            .ok_or_else(|| anyhow::anyhow!("Missing transactionHash"))?,
    )?;
    let data = parse_hex_bytes(
        log_value
            .get("data")
            .and_then(|d| d.as_str())
            .unwrap_or("0x"),
    )?;
    let raw_topics = log_value
        .get("topics")
        .and_then(|t| t.as_array())
        .ok_or_else(|| anyhow::anyhow!("Missing topics"))?;
    let log_topics = raw_topics
        .iter()
        .map(|t| {
            t.as_str()
                .ok_or_else(|| anyhow::anyhow!("topic not str"))
                .and_then(parse_hex_bytes_32)
        })
        .collect::<Result<Vec<_>>>()?;
    let topic0 = log_topics
        .first()
        .ok_or_else(|| anyhow::anyhow!("Log has no topics"))?;
    let kind = topics
        .kind_of(topic0)
        .ok_or_else(|| anyhow::anyhow!("Unknown topic0 0x{}", hex::encode(topic0)))?;

    let topic = |i: usize| -> Result<[u8; 32]> {
        log_topics
            .get(i)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("{:?}: expected topic {}, got {}", kind, i, log_topics.len()))
    };

    let (subject, request_id, payload) = match kind {
        EventKind::RequestSubmitted => (
            Some(SubjectId(U256::from_be_bytes(topic(1)?))),
            RequestId::from_word(topic(2)?),
            Payload::Submitted,
        ),
        EventKind::RequestFulfilled => {
            let random_value = U256::from_be_bytes(word(&data, 0)?);
            let success = word_to_bool(&word(&data, 2)?)?;
            (
                None,
                RequestId::from_word(topic(1)?),
                Payload::Fulfilled {
                    random_value,
                    success,
                },
            )
        }
        EventKind::SubjectStateChanged => {
            let request_id = RequestId::from_word(word(&data, 0)?);
            let attribute = word_to_u64(&word(&data, 1)?)?;
            let random_value = U256::from_be_bytes(word(&data, 2)?);
            (
                Some(SubjectId(U256::from_be_bytes(topic(1)?))),
                request_id,
                Payload::StateChanged {
                    attribute,
                    random_value: (!random_value.is_zero()).then_some(random_value),
                },
            )
        }
    };

    Ok(EventRecord {
        request_id,
        subject,
        emitter,
        block_height,
        tx_hash,
        log_index,
        payload,
    })
}

/// Decode the state view's return data: `(bool resolved, uint256 attribute, uint256 requestId)`.
pub fn decode_state_return(data: &[u8]) -> Result<SubjectState> {
    if data.len() < 96 {
        anyhow::bail!("state view return too short ({} bytes)", data.len());
    }
    let resolved = word_to_bool(&word(data, 0)?)?;
    let attribute = word_to_u64(&word(data, 1)?)?;
    let request_id = RequestId::from_word(word(data, 2)?);
    Ok(SubjectState {
        resolved,
        attribute: resolved.then_some(attribute),
        request_id,
    })
}

fn word(data: &[u8], i: usize) -> Result<[u8; 32]> {
    let start = i * 32;
    let slice = data
        .get(start..start + 32)
        .ok_or_else(|| anyhow::anyhow!("Data too short for word {} ({} bytes)", i, data.len()))?;
    let mut out = [0u8; 32];
    out.copy_from_slice(slice);
    Ok(out)
}

fn word_to_u64(w: &[u8; 32]) -> Result<u64> {
    if w[..24].iter().any(|b| *b != 0) {
        anyhow::bail!("word does not fit in u64");
    }
    let mut be = [0u8; 8];
    be.copy_from_slice(&w[24..]);
    Ok(u64::from_be_bytes(be))
}

fn word_to_bool(w: &[u8; 32]) -> Result<bool> {
    match word_to_u64(w)? {
        0 => Ok(false),
        1 => Ok(true),
        n => anyhow::bail!("invalid bool word {}", n),
    }
}

pub(crate) fn parse_hex_u64(s: &str) -> Result<u64> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(s, 16).context("parse hex u64")
}

pub(crate) fn parse_hex_bytes(s: &str) -> Result<Vec<u8>> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    hex::decode(s).context("parse hex bytes")
}

fn parse_hex_bytes_32(s: &str) -> Result<[u8; 32]> {
    let bytes = parse_hex_bytes(s)?;
    if bytes.len() != 32 {
        anyhow::bail!("Expected 32 bytes, got {}", bytes.len());
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}

fn parse_hex_bytes_20(s: &str) -> Result<[u8; 20]> {
    let bytes = parse_hex_bytes(s)?;
    if bytes.len() == 20 {
        let mut out = [0u8; 20];
        out.copy_from_slice(&bytes);
        Ok(out)
    } else if bytes.len() == 32 {
        // Indexed address in EVM is 32 bytes (left-padded); take last 20.
        let mut out = [0u8; 20];
        out.copy_from_slice(&bytes[12..32]);
        Ok(out)
    } else {
        anyhow::bail!("Expected 20 or 32 bytes for address, got {}", bytes.len());
    }
}
