//! Incremental HTTP message reconstruction for the portcullis firewall.
//!
//! This crate turns the raw bytes of one TCP direction back into complete,
//! structured HTTP messages. The [`StreamAssembler`] is stateful across
//! calls: it survives arbitrary fragmentation (a message split at any byte
//! boundary reconstructs identically) and pipelining (one call can complete
//! several back-to-back messages, returned in arrival order). Chunked
//! transfer framing is decoded transparently; produced bodies are the
//! reassembled payloads.
//!
//! The assembler knows nothing about policy or transport. Each produced
//! message records the exact wire span it occupied so the relay can forward
//! approved messages byte-for-byte while holding back bytes that belong to
//! messages still awaiting a verdict.

pub mod assembler;
pub mod message;

// Re-export primary public types at the crate root for convenience.
pub use assembler::{AssembleError, Mode, StreamAssembler};
pub use message::{Message, Request, Response};
