//! A stream wrapper that remembers its own position and length.
//!
//! Asking a file for its length (or even its position) is a system call. The device checks for
//! end-of-stream before every record, so both are cached here and kept current on every read,
//! write, and seek. The cached length only goes stale if something else writes to the stream;
//! [Tracked::refresh] re-reads it.

use std::io::{self, Read, Seek, SeekFrom, Write};

pub(crate) struct Tracked<S> {
    inner: S,
    position: u64,
    len: u64,
}

impl<S: Read + Write + Seek> Tracked<S> {
    pub fn new(mut inner: S) -> io::Result<Self> {
        let len = inner.seek(SeekFrom::End(0))?;
        let position = inner.seek(SeekFrom::Start(0))?;
        Ok(Self {
            inner,
            position,
            len,
        })
    }

    #[inline]
    pub fn position(&self) -> u64 {
        self.position
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.len
    }

    #[inline]
    pub fn is_eof(&self) -> bool {
        self.position >= self.len
    }

    /// Re-read the length of the underlying stream.
    pub fn refresh(&mut self) -> io::Result<()> {
        self.len = self.inner.seek(SeekFrom::End(0))?;
        self.inner.seek(SeekFrom::Start(self.position))?;
        Ok(())
    }

    pub fn seek(&mut self, position: u64) -> io::Result<()> {
        if position != self.position {
            self.position = self.inner.seek(SeekFrom::Start(position))?;
        }
        Ok(())
    }

    pub fn seek_end(&mut self) -> io::Result<u64> {
        self.position = self.inner.seek(SeekFrom::End(0))?;
        self.len = self.position;
        Ok(self.position)
    }

    pub fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        match self.inner.read_exact(buf) {
            Ok(()) => {
                self.position += buf.len() as u64;
                Ok(())
            }
            Err(err) => {
                // A partial read leaves the cursor somewhere unknown
                self.resync();
                Err(err)
            }
        }
    }

    pub fn read_u8(&mut self) -> io::Result<u8> {
        let mut byte = [0u8; 1];
        self.read_exact(&mut byte)?;
        Ok(byte[0])
    }

    pub fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        match self.inner.write_all(buf) {
            Ok(()) => {
                self.position += buf.len() as u64;
                self.len = self.len.max(self.position);
                Ok(())
            }
            Err(err) => {
                self.resync();
                Err(err)
            }
        }
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    fn resync(&mut self) {
        if let Ok(position) = self.inner.stream_position() {
            self.position = position;
        }
        if let Ok(len) = self.inner.seek(SeekFrom::End(0)) {
            self.len = len;
        }
        let _ = self.inner.seek(SeekFrom::Start(self.position));
    }
}
