//! A key/value database whose values are only read when asked for.
//!
//! [Database::entries] scans index records from the start of the stream and yields each key with
//! a [Lazy] handle to its value. Listing keys therefore never touches value bytes. Every call to
//! [Database::entries] starts a fresh scan; an [Entries] iterator cannot be rewound.
//!
//! The database, its iterators, and its handles share one [Orchestrator] behind a mutex, so they
//! can be sent across threads. Each iterator remembers its own cursor, so forcing a handle in the
//! middle of a scan does not disturb the scan.
//!
//! # Example
//!
//! ```rust
//! use keystream_storage::{Config, Database};
//! use std::io::Cursor;
//!
//! let database = Database::init(Cursor::new(Vec::new()), Config::default()).unwrap();
//! database.insert_range(&[("a", "1"), ("bb", "22")]).unwrap();
//!
//! for entry in database.entries().unwrap() {
//!     let (key, value) = entry.unwrap();
//!     println!("{:?} => {:?}", key, value.load().unwrap());
//! }
//! database.close().unwrap();
//! ```

use crate::{
    device::{Config, Device, HEADER_SIZE},
    orchestrator::Orchestrator,
    Error,
};
use bytes::Bytes;
use std::{
    fmt,
    fs::File,
    io::{Read, Seek, Write},
    path::Path,
    sync::{Arc, Mutex},
};

/// A key paired with a handle to its value.
pub type Entry<S> = (Bytes, Lazy<S>);

/// A handle to a value that has not been read yet.
pub struct Lazy<S: Read + Write + Seek> {
    io: Arc<Mutex<Orchestrator<S>>>,
    position: u64,
}

impl<S: Read + Write + Seek> Lazy<S> {
    /// Read the value from the stream.
    ///
    /// Every call performs one seek and read; nothing is memoized.
    pub fn load(&self) -> Result<Bytes, Error> {
        self.io.lock().unwrap().read_value(self.position)
    }

    /// Absolute position of the value record.
    pub fn position(&self) -> u64 {
        self.position
    }
}

impl<S: Read + Write + Seek> Clone for Lazy<S> {
    fn clone(&self) -> Self {
        Self {
            io: self.io.clone(),
            position: self.position,
        }
    }
}

impl<S: Read + Write + Seek> fmt::Debug for Lazy<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lazy")
            .field("position", &self.position)
            .finish()
    }
}

/// One pass over every entry in a [Database].
///
/// Yields `Some(Err(_))` at most once: after a format error the stream is not trusted and the
/// iterator ends.
pub struct Entries<S: Read + Write + Seek> {
    io: Arc<Mutex<Orchestrator<S>>>,
    cursor: u64,
    done: bool,
}

impl<S: Read + Write + Seek> Iterator for Entries<S> {
    type Item = Result<Entry<S>, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut io = self.io.lock().unwrap();
        let next = io.seek(self.cursor).and_then(|_| io.read_next());
        match next {
            Ok(Some(item)) => {
                self.cursor = io.position();
                let value = Lazy {
                    io: self.io.clone(),
                    position: item.position,
                };
                Some(Ok((item.key, value)))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

/// A key/value database over a single stream.
pub struct Database<S: Read + Write + Seek> {
    io: Arc<Mutex<Orchestrator<S>>>,
}

impl Database<File> {
    /// Open (or create) a database stored in the file at `path`.
    pub fn open(path: impl AsRef<Path>, cfg: Config) -> Result<Self, Error> {
        Ok(Self::new(Orchestrator::new(Device::open(path, cfg)?)))
    }
}

impl<S: Read + Write + Seek> Database<S> {
    pub fn new(orchestrator: Orchestrator<S>) -> Self {
        Self {
            io: Arc::new(Mutex::new(orchestrator)),
        }
    }

    /// Initialize a database over `stream`.
    pub fn init(stream: S, cfg: Config) -> Result<Self, Error> {
        Ok(Self::new(Orchestrator::new(Device::init(stream, cfg)?)))
    }

    /// Append a batch of key/value pairs.
    pub fn insert_range<K, V>(&self, items: &[(K, V)]) -> Result<(), Error>
    where
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        self.io.lock().unwrap().insert(items)
    }

    /// Append a single key/value pair (a batch of one).
    pub fn insert(&self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Result<(), Error> {
        self.insert_range(&[(key.as_ref(), value.as_ref())])
    }

    /// Start a new scan from the first record.
    pub fn entries(&self) -> Result<Entries<S>, Error> {
        self.io.lock().unwrap().reset()?;
        Ok(Entries {
            io: self.io.clone(),
            cursor: HEADER_SIZE,
            done: false,
        })
    }

    /// The value of the first entry stored under `key`, if any.
    pub fn get(&self, key: impl AsRef<[u8]>) -> Result<Option<Lazy<S>>, Error> {
        let key = key.as_ref();
        for entry in self.entries()? {
            let (stored, value) = entry?;
            if stored == key {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    /// The values of every entry stored under `key`, in insertion order.
    pub fn get_all(&self, key: impl AsRef<[u8]>) -> Result<Vec<Lazy<S>>, Error> {
        let key = key.as_ref();
        let mut values = Vec::new();
        for entry in self.entries()? {
            let (stored, value) = entry?;
            if stored == key {
                values.push(value);
            }
        }
        Ok(values)
    }

    pub fn flush(&self) -> Result<(), Error> {
        self.io.lock().unwrap().flush()
    }

    /// Flush and persist the header. Outstanding iterators and handles fail afterwards.
    pub fn close(&self) -> Result<(), Error> {
        self.io.lock().unwrap().close()
    }
}

impl<S: Read + Write + Seek> Clone for Database<S> {
    fn clone(&self) -> Self {
        Self {
            io: self.io.clone(),
        }
    }
}
