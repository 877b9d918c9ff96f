//! Encode and decode individual records against a byte stream.
//!
//! # Format
//!
//! The stream begins with an 8-byte little-endian `i64` header (the "tail pointer"), followed by a
//! sequence of records:
//!
//! ```text
//! +---------+------------------+------------------+
//! | len: u8 | rel_offset: i32  | key: [u8; len]   |   index (len in [1, 254])
//! +---------+------------------+------------------+
//! | 0xFF    | rel_offset: i32  |                      jump
//! +---------+------------------+
//! | varint length | bytes      |                      value
//! +---------------+------------+
//! ```
//!
//! Integers are little-endian. A relative offset is measured from the first byte of the offset
//! field itself, so a record starting at `p` that targets `t` stores `t - (p + 1)`. A jump whose
//! relative offset is `0` is a terminator and decodes to target `0`. Values are never read by a
//! linear scan: index records point at them.
//!
//! There is no explicit end marker: the scan ends when the cursor reaches the end of the stream.
//!
//! # Sizing before writing
//!
//! [Device::calculate_index_offset] and [Device::calculate_value_offset] report the encoded size
//! of a record without writing it. Callers use them to plan the absolute position of every value
//! in a batch before the first index (which must embed that position) is written.

use crate::{varint, Error};
use bytes::{BufMut, Bytes, BytesMut};
use std::{
    fs::{File, OpenOptions},
    io::{ErrorKind, Read, Seek, Write},
    path::Path,
};
use tracing::{debug, trace, warn};

mod tracked;
use tracked::Tracked;

/// Size of the tail pointer stored at the start of the stream.
pub const HEADER_SIZE: u64 = 8;

/// First byte of a jump record. Never a valid key length.
pub const JUMP_MARKER: u8 = 0xFF;

/// Largest key that can be indexed.
pub const MAX_KEY_LEN: usize = JUMP_MARKER as usize - 1;

/// Size of the relative offset field in index and jump records.
pub const OFFSET_SIZE: usize = 4;

/// Size of an encoded jump record.
pub const JUMP_SIZE: usize = 1 + OFFSET_SIZE;

/// What the next record in the stream is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Peek {
    /// The cursor is at (or past) the end of the stream.
    Eof,
    /// A jump record. Its marker byte has been consumed.
    Jump,
    /// An index record with the given key length. Its length byte has been consumed.
    Index(u8),
}

/// Configuration for a [Device].
#[derive(Clone, Debug, Default)]
pub struct Config {
    /// If set, closing the device flushes and persists the header but keeps the stream alive so
    /// it can be recovered with [Device::into_inner].
    pub leave_open: bool,
}

/// Reads and writes single records. Knows nothing about batches.
///
/// The device has exactly one cursor. It must not be shared between threads without external
/// serialization.
pub struct Device<S: Read + Write + Seek> {
    stream: Option<Tracked<S>>,
    cfg: Config,

    tail: i64,
    closed: bool,

    // Scratch space for assembling a record before a single write
    scratch: BytesMut,
}

impl Device<File> {
    /// Open (or create) the file at `path` as a device.
    pub fn open(path: impl AsRef<Path>, cfg: Config) -> Result<Self, Error> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Self::init(file, cfg)
    }
}

impl<S: Read + Write + Seek> Device<S> {
    /// Initialize a device over `stream`, restoring the tail pointer (or writing a zeroed header
    /// if the stream is too short to hold one).
    pub fn init(stream: S, cfg: Config) -> Result<Self, Error> {
        let mut stream = Tracked::new(stream)?;
        let tail = if stream.len() >= HEADER_SIZE {
            let mut header = [0u8; HEADER_SIZE as usize];
            stream.read_exact(&mut header)?;
            i64::from_le_bytes(header)
        } else {
            stream.write_all(&0i64.to_le_bytes())?;
            0
        };
        debug!(tail, len = stream.len(), "opened device");

        Ok(Self {
            stream: Some(stream),
            cfg,
            tail,
            closed: false,
            scratch: BytesMut::with_capacity(JUMP_SIZE + MAX_KEY_LEN),
        })
    }

    fn stream(&mut self) -> Result<&mut Tracked<S>, Error> {
        if self.closed {
            return Err(Error::Closed);
        }
        self.stream.as_mut().ok_or(Error::Closed)
    }

    /// The header value restored at init (or last set). Persisted at close.
    pub fn tail(&self) -> i64 {
        self.tail
    }

    /// Update the header value persisted at close.
    pub fn set_tail(&mut self, tail: i64) {
        self.tail = tail;
    }

    /// Classify the next record, consuming its first byte unless at the end of the stream.
    pub fn peek(&mut self) -> Result<Peek, Error> {
        let stream = self.stream()?;
        if stream.is_eof() {
            return Ok(Peek::Eof);
        }
        match stream.read_u8()? {
            JUMP_MARKER => Ok(Peek::Jump),
            len => Ok(Peek::Index(len)),
        }
    }

    /// Read the remainder of an index record whose length byte was returned by [Device::peek].
    ///
    /// Returns the key and the absolute position of its value.
    pub fn read_index(&mut self, len: u8) -> Result<(Bytes, u64), Error> {
        let stream = self.stream()?;
        let field = stream.position();
        if len == 0 {
            return Err(Error::EmptyIndex(field.saturating_sub(1)));
        }
        if stream.is_eof() {
            return Err(Error::UnexpectedEof(field));
        }

        let position = self.read_offset()?.ok_or(Error::InvalidTarget {
            position: field,
            offset: 0,
        })?;
        let mut key = vec![0u8; len as usize];
        self.read_exact(&mut key)?;
        trace!(position = field, len, target = position, "read index");

        Ok((Bytes::from(key), position))
    }

    /// Read the remainder of a jump record whose marker was returned by [Device::peek].
    ///
    /// Returns the absolute target, or `0` for a terminator.
    pub fn read_jump(&mut self) -> Result<u64, Error> {
        Ok(self.read_offset()?.unwrap_or(0))
    }

    /// Read the value stored at `position`.
    pub fn read_value(&mut self, position: u64) -> Result<Bytes, Error> {
        self.stream()?.seek(position)?;

        // Collect the length prefix (never more than a sixth byte, which the decoder rejects)
        let mut prefix = [0u8; varint::MAX_SIZE];
        let mut used = 0;
        loop {
            let byte = self.read_u8()?;
            prefix[used] = byte;
            used += 1;
            if !varint::continues(byte) || used == varint::MAX_SIZE {
                break;
            }
        }
        let len = varint::read(&mut &prefix[..used])?;
        let len = usize::try_from(len)
            .ok()
            .filter(|len| *len <= isize::MAX as usize)
            .ok_or(Error::ValueTooLarge(len as u64))?;

        let mut value = vec![0u8; len];
        self.read_exact(&mut value)?;
        Ok(Bytes::from(value))
    }

    /// The encoded size of an index record for `key`.
    #[inline]
    pub fn calculate_index_offset(key: &[u8]) -> usize {
        1 + OFFSET_SIZE + key.len()
    }

    /// The encoded size of a value record for `value`.
    #[inline]
    pub fn calculate_value_offset(value: &[u8]) -> usize {
        let len = u32::try_from(value.len()).unwrap_or(u32::MAX);
        varint::size(len) + value.len()
    }

    /// Write an index record for `key` whose value will live at `position`.
    ///
    /// Nothing is written if the key length or offset is rejected.
    pub fn write_index(&mut self, key: &[u8], position: u64) -> Result<(), Error> {
        if key.is_empty() || key.len() > MAX_KEY_LEN {
            return Err(Error::InvalidKeyLength(key.len()));
        }
        let start = self.stream()?.position();
        let offset = Self::relative(start, position)?;

        self.scratch.clear();
        self.scratch.put_u8(key.len() as u8);
        self.scratch.put_i32_le(offset);
        self.scratch.put_slice(key);
        self.flush_scratch()
    }

    /// Write a jump record to `target`, or a terminator if `target` is `0`.
    pub fn write_jump(&mut self, target: u64) -> Result<(), Error> {
        let start = self.stream()?.position();
        let offset = match target {
            0 => 0,
            target => Self::relative(start, target)?,
        };

        self.scratch.clear();
        self.scratch.put_u8(JUMP_MARKER);
        self.scratch.put_i32_le(offset);
        self.flush_scratch()
    }

    /// Write a value record.
    pub fn write_value(&mut self, value: &[u8]) -> Result<(), Error> {
        let len = u32::try_from(value.len()).map_err(|_| Error::ValueTooLarge(value.len() as u64))?;

        self.scratch.clear();
        varint::write(len, &mut self.scratch);
        self.flush_scratch()?;
        self.stream()?.write_all(value)?;
        Ok(())
    }

    /// The current cursor position.
    pub fn position(&self) -> u64 {
        self.stream.as_ref().map_or(0, Tracked::position)
    }

    /// The length of the stream as last observed.
    pub fn len(&self) -> u64 {
        self.stream.as_ref().map_or(0, Tracked::len)
    }

    /// Returns true if nothing follows the header.
    pub fn is_empty(&self) -> bool {
        self.len() <= HEADER_SIZE
    }

    pub fn seek(&mut self, position: u64) -> Result<(), Error> {
        self.stream()?.seek(position)?;
        Ok(())
    }

    /// Move the cursor to the end of the stream, returning the new position.
    pub fn seek_end(&mut self) -> Result<u64, Error> {
        Ok(self.stream()?.seek_end()?)
    }

    /// Refresh the cached stream length and move the cursor to the first record.
    pub fn reset(&mut self) -> Result<(), Error> {
        let stream = self.stream()?;
        stream.refresh()?;
        stream.seek(HEADER_SIZE)?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), Error> {
        self.stream()?.flush()?;
        Ok(())
    }

    /// Flush, persist the tail pointer, and release the stream (unless `leave_open` is set).
    ///
    /// Only the first call does any work.
    pub fn close(&mut self) -> Result<(), Error> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let Some(stream) = self.stream.as_mut() else {
            return Ok(());
        };

        // Persist the tail pointer
        stream.seek(0)?;
        stream.write_all(&self.tail.to_le_bytes())?;
        stream.flush()?;
        debug!(tail = self.tail, len = stream.len(), "closed device");

        if !self.cfg.leave_open {
            self.stream = None;
        }
        Ok(())
    }

    /// Close the device and return the underlying stream if `leave_open` is set.
    pub fn into_inner(mut self) -> Result<Option<S>, Error> {
        self.close()?;
        Ok(self.stream.take().map(Tracked::into_inner))
    }

    /// Read a relative offset field, returning `None` if it is the `0` terminator.
    fn read_offset(&mut self) -> Result<Option<u64>, Error> {
        let field = self.stream()?.position();
        let mut buf = [0u8; OFFSET_SIZE];
        self.read_exact(&mut buf)?;
        let offset = i32::from_le_bytes(buf);
        if offset == 0 {
            return Ok(None);
        }
        let target = field as i64 + offset as i64;
        if target < 0 {
            return Err(Error::InvalidTarget {
                position: field,
                offset,
            });
        }
        Ok(Some(target as u64))
    }

    /// Compute the offset stored by a record starting at `start` that targets `target`.
    fn relative(start: u64, target: u64) -> Result<i32, Error> {
        let offset = target as i128 - (start as i128 + 1);
        i32::try_from(offset).map_err(|_| Error::OffsetOutOfRange {
            position: start,
            target,
        })
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        let stream = self.stream()?;
        let position = stream.position();
        stream.read_exact(buf).map_err(|err| match err.kind() {
            ErrorKind::UnexpectedEof => Error::UnexpectedEof(position),
            _ => Error::Io(err),
        })
    }

    fn read_u8(&mut self) -> Result<u8, Error> {
        let mut byte = [0u8; 1];
        self.read_exact(&mut byte)?;
        Ok(byte[0])
    }

    fn flush_scratch(&mut self) -> Result<(), Error> {
        let Some(stream) = self.stream.as_mut().filter(|_| !self.closed) else {
            return Err(Error::Closed);
        };
        stream.write_all(&self.scratch)?;
        Ok(())
    }
}

impl<S: Read + Write + Seek> Drop for Device<S> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(err) = self.close() {
            warn!(?err, "failed to close device on drop");
        }
    }
}
