//! Let many consumers replay one sequence while producing each item only once.
//!
//! A [TrainCache] holds produced items by index. Consumers (participants) read items by index;
//! once as many reads as there are participants have hit an entry, it is evicted. Production is
//! driven by readers: [TrainCache::get] produces every missing item up to the requested index.
//!
//! # Locking
//!
//! Production is serialized by a single production lock, and each entry has its own lock for
//! counting reads. The two are never held at the same time. Eviction takes the entry lock and then
//! the map lock; nothing takes them in the opposite order.
//!
//! Joining and evicting both happen under the map write lock, so a participant that joins is
//! either counted before an entry's eviction is decided or starts after that entry.
//!
//! # Participant changes
//!
//! Eviction is decided when an entry is read, against the participant count at that moment. If
//! the count drops after an entry has been read by everyone who remains, that entry stays cached
//! until it is read again. Held entries are therefore not always contiguous: a newer entry may be
//! evicted while an older one is still held.
//!
//! A participant that joins with [TrainCache::join] starts at the oldest entry still held. Every
//! entry at or after the returned range's end is read by it before it is evicted. Entries inside
//! the range that were already evicted are gone for it.
//!
//! A [Rider] leaves with [TrainCache::withdraw_participant] rather than
//! [TrainCache::exit_participant]: its own reads are discounted as it leaves, so an entry it read
//! is not evicted before the remaining riders reach it.
//!
//! # Example
//!
//! ```rust
//! use keystream_query::Train;
//!
//! let train = Train::new(0..3);
//! let first = train.rider();
//! let second = train.rider();
//! assert_eq!(first.collect::<Vec<_>>(), vec![0, 1, 2]);
//! assert_eq!(second.collect::<Vec<_>>(), vec![0, 1, 2]);
//! ```

use std::{
    collections::HashMap,
    iter::Fuse,
    ops::Range,
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Arc, Mutex, RwLock,
    },
};
use tracing::{debug, error, trace};

struct Slot<T> {
    item: T,
    reads: i64,
}

/// A cache of produced items, evicted once every participant has read them.
pub struct TrainCache<T: Clone> {
    entries: RwLock<HashMap<u64, Arc<Mutex<Slot<T>>>>>,
    top: AtomicU64,
    last: AtomicU64,
    frontier: AtomicU64,
    participants: AtomicI64,
    production: Mutex<()>,
}

impl<T: Clone> TrainCache<T> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            top: AtomicU64::new(0),
            last: AtomicU64::new(0),
            frontier: AtomicU64::new(0),
            participants: AtomicI64::new(0),
            production: Mutex::new(()),
        }
    }

    /// The number of items produced so far (the next index to be assigned).
    pub fn top(&self) -> u64 {
        self.top.load(Ordering::Acquire)
    }

    /// The number of entries evicted so far.
    pub fn last(&self) -> u64 {
        self.last.load(Ordering::Acquire)
    }

    pub fn participants(&self) -> i64 {
        self.participants.load(Ordering::Acquire)
    }

    /// The number of entries currently held.
    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// One past the highest index evicted so far.
    pub fn frontier(&self) -> u64 {
        self.frontier.load(Ordering::Acquire)
    }

    /// Register a consumer, returning the new participant count.
    pub fn invite_participant(&self) -> i64 {
        let _entries = self.entries.write().unwrap();
        self.invite()
    }

    /// Register a consumer and return where it should start reading.
    ///
    /// The range starts at the oldest entry still held (or [TrainCache::top] if none are) and
    /// ends at [TrainCache::frontier]. Entries inside it may already be evicted. Entries at or
    /// after its end are held until this consumer reads them or leaves.
    pub fn join(&self) -> Range<u64> {
        let entries = self.entries.write().unwrap();
        self.invite();
        let frontier = self.frontier();
        let start = entries
            .keys()
            .min()
            .copied()
            .unwrap_or_else(|| self.top())
            .min(frontier);
        debug!(start, frontier, "participant boarded");
        start..frontier
    }

    fn invite(&self) -> i64 {
        let participants = self.participants.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(participants, "participant joined");
        participants
    }

    /// Unregister a consumer, returning the new participant count.
    pub fn exit_participant(&self) -> i64 {
        let participants = self.participants.fetch_sub(1, Ordering::AcqRel) - 1;
        debug!(participants, "participant left");
        participants
    }

    /// Unregister a consumer that read every entry in `range`, returning the new participant count.
    ///
    /// The consumer's reads of entries still held are discounted first, so those entries keep
    /// waiting for every remaining participant.
    pub fn withdraw_participant(&self, range: Range<u64>) -> i64 {
        let slots: Vec<_> = self
            .entries
            .read()
            .unwrap()
            .iter()
            .filter(|(index, _)| range.contains(index))
            .map(|(_, slot)| slot.clone())
            .collect();
        for slot in slots {
            slot.lock().unwrap().reads -= 1;
        }
        self.exit_participant()
    }

    /// Store `item` at the next index, returning that index.
    pub fn append(&self, item: T) -> u64 {
        let mut entries = self.entries.write().unwrap();
        let index = self.top.load(Ordering::Acquire);
        entries.insert(index, Arc::new(Mutex::new(Slot { item, reads: 0 })));

        // Only advance once the entry can be found
        self.top.store(index + 1, Ordering::Release);
        index
    }

    /// Return the item at `index`, first producing every missing item up to it with `factory`.
    ///
    /// Concurrent callers never produce the same index twice. Returns `None` if the entry has
    /// already been evicted.
    pub fn get(&self, index: u64, mut factory: impl FnMut() -> T) -> Option<T> {
        if index >= self.top() {
            let _guard = self.production.lock().unwrap();

            // Another caller may have produced it while we waited
            while index >= self.top() {
                self.append(factory());
            }
        }
        self.read(index)
    }

    /// Read the entry at `index`, counting the read and evicting the entry if every participant
    /// has now read it. Returns `None` if the entry is not held.
    pub fn read(&self, index: u64) -> Option<T> {
        let slot = self.entries.read().unwrap().get(&index).cloned()?;
        let mut slot = slot.lock().unwrap();
        slot.reads += 1;
        if slot.reads >= self.participants() {
            // Joins take this lock, so the count cannot grow before the entry is removed
            let mut entries = self.entries.write().unwrap();
            if slot.reads >= self.participants() && entries.remove(&index).is_some() {
                self.last.fetch_add(1, Ordering::AcqRel);
                self.frontier.fetch_max(index + 1, Ordering::AcqRel);
                trace!(index, reads = slot.reads, "evicted entry");
            }
        }
        Some(slot.item.clone())
    }
}

impl<T: Clone> Default for TrainCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A sequence shared by many [Rider]s.
///
/// The source is pulled lazily by whichever rider first needs an item. A `None` entry marks the
/// end of the source.
pub struct Train<T: Clone> {
    source: Mutex<Fuse<Box<dyn Iterator<Item = T> + Send>>>,
    cache: TrainCache<Option<T>>,
}

impl<T: Clone> Train<T> {
    pub fn new<I>(source: I) -> Arc<Self>
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        let source: Box<dyn Iterator<Item = T> + Send> = Box::new(source.into_iter());
        Arc::new(Self {
            source: Mutex::new(source.fuse()),
            cache: TrainCache::new(),
        })
    }

    /// Start a new traversal at the oldest entry still held.
    pub fn rider(self: &Arc<Self>) -> Rider<T> {
        let boarded = self.cache.join();
        Rider {
            train: self.clone(),
            start: boarded.start,
            index: boarded.start,
            frontier: boarded.end,
            riding: true,
        }
    }

    pub fn cache(&self) -> &TrainCache<Option<T>> {
        &self.cache
    }

    fn produce(&self) -> Option<T> {
        self.source.lock().unwrap().next()
    }
}

/// A participant's traversal of a [Train].
pub struct Rider<T: Clone> {
    train: Arc<Train<T>>,
    start: u64,
    index: u64,
    frontier: u64,
    riding: bool,
}

impl<T: Clone> Rider<T> {
    /// The index of the next entry this rider will read.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Returns true if nothing had been evicted when this rider boarded, so it sees every item.
    pub fn is_complete(&self) -> bool {
        self.frontier == 0
    }

    fn exit(&mut self) {
        if self.riding {
            self.riding = false;
            self.train.cache.withdraw_participant(self.start..self.index);
        }
    }
}

impl<T: Clone> Iterator for Rider<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        while self.riding {
            let index = self.index;
            let train = &self.train;
            let entry = train.cache.get(index, || train.produce());
            self.index += 1;
            match entry {
                Some(Some(item)) => return Some(item),
                Some(None) => self.exit(),
                // Evicted before this rider boarded
                None if index < self.frontier => {}
                None => error!(index, "entry evicted before this rider read it"),
            }
        }
        None
    }
}

impl<T: Clone> Drop for Rider<T> {
    fn drop(&mut self) {
        self.exit();
    }
}
