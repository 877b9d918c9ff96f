//! Sequence [Device] calls into whole-database operations.
//!
//! # Batches
//!
//! [Orchestrator::insert] appends one batch at the end of the stream in three phases:
//!
//! 1. Plan: sum the encoded size of every index record plus one jump slot to learn where the
//!    first value will land.
//! 2. Write every index record, each embedding the (not yet written) position of its value.
//! 3. Write the jump slot, targeting the end of the batch, then every value in insertion order.
//!
//! ```text
//! | index 0 | index 1 | ... | jump -> end | value 0 | value 1 | ... | (next batch)
//! ```
//!
//! The jump lets a scan of keys skip straight over the values and land on the next batch (or the
//! end of the stream). [Orchestrator::read_next] follows any run of jumps transparently.

use crate::{
    device::{Device, Peek, JUMP_SIZE, MAX_KEY_LEN},
    Error,
};
use bytes::Bytes;
use std::io::{Read, Seek, Write};
use tracing::{debug, trace};

/// One decoded index record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Item {
    /// The key, as stored.
    pub key: Bytes,
    /// Absolute position of the value record.
    pub position: u64,
}

/// Turns raw records into items and batches into records.
pub struct Orchestrator<S: Read + Write + Seek> {
    device: Device<S>,
}

impl<S: Read + Write + Seek> Orchestrator<S> {
    pub fn new(device: Device<S>) -> Self {
        Self { device }
    }

    /// Read the next index record, following jumps. Returns `None` at the end of the stream.
    pub fn read_next(&mut self) -> Result<Option<Item>, Error> {
        loop {
            match self.device.peek()? {
                Peek::Jump => {
                    // A terminator is consumed and the scan continues with the next record
                    let target = self.device.read_jump()?;
                    if target != 0 {
                        trace!(from = self.device.position(), target, "following jump");
                        self.device.seek(target)?;
                    }
                }
                Peek::Index(len) => {
                    let (key, position) = self.device.read_index(len)?;
                    return Ok(Some(Item { key, position }));
                }
                Peek::Eof => return Ok(None),
            }
        }
    }

    /// Append a batch of key/value pairs at the end of the stream.
    ///
    /// The batch is validated before anything is written: a rejected key (or a batch too large
    /// for its offsets to be encoded) leaves the stream untouched.
    pub fn insert<K, V>(&mut self, items: &[(K, V)]) -> Result<(), Error>
    where
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        if items.is_empty() {
            return Ok(());
        }
        let start = self.device.seek_end()?;

        // Phase 1: find where the first value lands
        let mut offset = start;
        for (key, _) in items {
            let key = key.as_ref();
            if key.is_empty() || key.len() > MAX_KEY_LEN {
                return Err(Error::InvalidKeyLength(key.len()));
            }
            offset += Device::<S>::calculate_index_offset(key) as u64;
        }
        offset += JUMP_SIZE as u64;

        // Ensure every offset we are about to write is representable
        let mut end = offset;
        for (_, value) in items {
            let value = value.as_ref();
            if u32::try_from(value.len()).is_err() {
                return Err(Error::ValueTooLarge(value.len() as u64));
            }
            end += Device::<S>::calculate_value_offset(value) as u64;
        }
        if end - start > i32::MAX as u64 {
            return Err(Error::OffsetOutOfRange {
                position: start,
                target: end,
            });
        }

        // Phase 2: write each key, advancing the planned offset by each value
        for (key, value) in items {
            self.device.write_index(key.as_ref(), offset)?;
            offset += Device::<S>::calculate_value_offset(value.as_ref()) as u64;
        }
        debug_assert_eq!(offset, end);

        // Phase 3: skip the values on the next scan, then write them sequentially
        self.device.write_jump(end)?;
        for (_, value) in items {
            self.device.write_value(value.as_ref())?;
        }
        debug!(items = items.len(), start, end, "inserted batch");
        Ok(())
    }

    pub fn read_value(&mut self, position: u64) -> Result<Bytes, Error> {
        self.device.read_value(position)
    }

    pub fn reset(&mut self) -> Result<(), Error> {
        self.device.reset()
    }

    pub fn position(&self) -> u64 {
        self.device.position()
    }

    pub fn seek(&mut self, position: u64) -> Result<(), Error> {
        self.device.seek(position)
    }

    pub fn flush(&mut self) -> Result<(), Error> {
        self.device.flush()
    }

    pub fn close(&mut self) -> Result<(), Error> {
        self.device.close()
    }

    pub fn device(&self) -> &Device<S> {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut Device<S> {
        &mut self.device
    }

    /// Close the orchestrator and return the underlying stream if the device leaves it open.
    pub fn into_inner(self) -> Result<Option<S>, Error> {
        self.device.into_inner()
    }
}
