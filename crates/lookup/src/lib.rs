//! IntelForge lookup engine
//!
//! Correlates free-form lookup values with replies from external chat bots
//! over a single shared messaging session:
//!
//! - `classifier`: decides what kind of value was submitted
//! - `session`: owns the messaging session and serializes its use
//! - `collector`: gathers one bot reply under inactivity and ceiling timers
//! - `materializer`: stores reply artifacts and derives result summaries
//! - `ledger`: durable record of every lookup
//! - `engine`: drives a lookup through all of the above

pub mod bots;
pub mod classifier;
pub mod collector;
pub mod engine;
pub mod errors;
pub mod ledger;
pub mod materializer;
pub mod session;

pub use bots::{BotProfile, BotRegistry, BotSummary};
pub use classifier::{classify, Classification};
pub use engine::{Artifact, CorrelationEngine, LookupRequest, Submission};
pub use errors::{GatewayError, LookupError, Result};
pub use ledger::{open_ledger, MemoryLedger, PgLedger, QueryLedger};
pub use materializer::{ArtifactKind, ArtifactStore, FsArtifactStore, ResultMaterializer};
pub use session::{
    GatewayState, MessengerTransport, RelayTransport, ScriptedTransport, SessionGateway,
    SessionLease,
};
