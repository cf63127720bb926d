//! Off-chain randomness-request monitor: polling, bounded log scanning, correlation and
//! authenticity classification for asynchronously resolved subjects.
//!
//! - **Gateway**: retrying, timeout-bounded access to the ledger's read primitives over a
//!   pluggable [LedgerClient] ([RpcLedger] for EVM JSON-RPC).
//! - **LogScanner**: backward search from the tip in bounded windows (providers cap
//!   eth_getLogs ranges), most recent match first.
//! - **CorrelationIndex**: idempotent event store keyed by request id, first-writer-wins
//!   subject -> request id mapping.
//! - **Classifier**: authentic oracle fulfillment vs. fallback/local resolution.
//! - **MonitorSession** / **SessionRegistry**: one polling task per subject with deadline,
//!   manual-trigger nudge and cooperative cancellation.

pub mod abi;
pub mod classifier;
pub mod config;
pub mod correlation;
pub mod gateway;
pub mod registry;
pub mod rpc;
pub mod scanner;
pub mod session;

pub use abi::{Address, EventKind, EventRecord, Payload, RequestId, SubjectId, SubjectState};
pub use classifier::{Classification, Classifier, Provenance};
pub use config::{ConfigError, EntryPoints, MonitorConfig, RetryConfig, ScanConfig};
pub use correlation::{Anomaly, CorrelationIndex};
pub use gateway::{Gateway, LedgerClient, LedgerError, LogFilter};
pub use registry::{RegistryError, SessionHandle, SessionRegistry};
pub use rpc::RpcLedger;
pub use scanner::{Gap, LogScanner, ScanOutcome};
pub use session::{FailureReason, SessionState, SessionStatus, TriggerOutcome};

/// 256-bit unsigned integer used for subject ids and random values.
pub use alloy::primitives::U256;
