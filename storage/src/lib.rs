//! Persist and enumerate key/value batches in a single append-only stream.
//!
//! Keys are short (1 to 254 bytes) and indexed; values are arbitrary and only read on demand. The
//! crate is layered:
//!
//! - [device]: encode and decode single records (index, jump, value) against a seekable stream.
//! - [orchestrator]: append whole batches and scan keys, following jumps over value regions.
//! - [database]: a thread-safe handle that yields keys with lazily loaded values.
//!
//! # Status
//!
//! `keystream-storage` is **ALPHA** software and is not yet recommended for production use.
//! Developers should expect breaking changes and occasional instability.

pub mod database;
pub mod device;
pub mod orchestrator;
pub mod varint;

pub use database::{Database, Entries, Entry, Lazy};
pub use device::{Config, Device, Peek};
pub use orchestrator::{Item, Orchestrator};

use thiserror::Error;

/// Errors that can occur when interacting with a stream.
#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("varint error: {0}")]
    Varint(#[from] varint::Error),
    #[error("unexpected end of stream at {0}")]
    UnexpectedEof(u64),
    #[error("index record at {0} has an empty key")]
    EmptyIndex(u64),
    #[error("value too large: {0}")]
    ValueTooLarge(u64),
    #[error("invalid key length: {0}")]
    InvalidKeyLength(usize),
    #[error("offset from {position} to {target} does not fit in an i32")]
    OffsetOutOfRange { position: u64, target: u64 },
    #[error("invalid target: offset {offset} at {position}")]
    InvalidTarget { position: u64, offset: i32 },
    #[error("device closed")]
    Closed,
}
