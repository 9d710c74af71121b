//! Session correlation and audit persistence for the portcullis firewall.
//!
//! The [`FlowLedger`] groups TCP connections from the same client IP into
//! logical sessions within an activity window, tracks each connection's
//! lifecycle, records every reconstructed message with its verdict tags, and
//! maintains a monotonically non-decreasing alert level per session
//! (none → marked → blocked).
//!
//! Correlation state lives in memory; every mutation is mirrored as a JSON
//! line into an append-only journal drained by a background writer task. A
//! relational store is an external consumer of that journal, not a concern of
//! this crate. Nothing here ever fails into the caller: audit problems are
//! logged and swallowed, because audit must not compromise proxying.

pub mod journal;
pub mod ledger;
pub mod record;

// Re-export primary public types at the crate root for convenience.
pub use journal::{JournalError, JournalSink};
pub use ledger::{DEFAULT_SESSION_WINDOW, FlowLedger, SessionRecord, StreamRecord};
pub use record::{AlertLevel, JournalRecord, RecordKind, SessionId, StreamId};
