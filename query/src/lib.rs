//! Share one scan of a keystream database across many concurrent consumers.
//!
//! - [signal]: one-shot cancellation signals that can be linked together.
//! - [train]: a cache that lets many riders replay one sequence while producing each item once.
//! - [client]: message queues that can be received from with cancellation.
//! - [managed]: a client whose worker task is tied to the client's lifetime.
//! - [iteration]: fan out a database scan to many subscribers through one train.
//!
//! # Status
//!
//! `keystream-query` is **ALPHA** software and is not yet recommended for production use.
//! Developers should expect breaking changes and occasional instability.

pub mod client;
pub mod iteration;
pub mod managed;
pub mod signal;
pub mod train;

pub use client::{Client, Lightweight, Receipt};
pub use iteration::{Event, IterationManager};
pub use managed::Managed;
pub use signal::{Signal, Signaler};
pub use train::{Rider, Train, TrainCache};

use std::{sync::Arc, time::Duration};
use thiserror::Error;

/// Errors that can occur when coordinating consumers.
#[derive(Debug, Error)]
pub enum Error {
    #[error("worker did not stop within {0:?}")]
    Timeout(Duration),
    #[error("worker failed: {0}")]
    Worker(Box<dyn std::error::Error + Send + Sync>),
    #[error("worker panicked")]
    Panicked,
    #[error("worker aborted")]
    Aborted,
    #[error("storage error: {0}")]
    Storage(Arc<keystream_storage::Error>),
}
