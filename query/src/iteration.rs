//! Fan out one scan of a database to many subscribers.
//!
//! Each subscriber is a [Managed] client whose worker rides a [Train] over the database's entries
//! and queues every entry as an [Event]. Subscribers that join while a scan is still at its start
//! share it; a subscriber that would miss entries already evicted starts a new scan instead.

use crate::{
    client::Client,
    managed::{self, Managed},
    signal::Signal,
    train::{Rider, Train},
    Error,
};
use bytes::Bytes;
use keystream_storage::{Database, Lazy};
use std::{
    io::{Read, Seek, Write},
    sync::{Arc, Mutex},
};
use tracing::debug;

/// An entry produced by a shared scan. Storage errors are shared between every rider.
pub type Entry<S> = Result<(Bytes, Lazy<S>), Arc<keystream_storage::Error>>;

/// A message delivered to a subscriber.
#[derive(Debug)]
pub enum Event<S: Read + Write + Seek> {
    /// The next entry of the scan.
    Entry(Bytes, Lazy<S>),
    /// The scan failed. No more entries follow.
    Failed(Arc<keystream_storage::Error>),
    /// The scan reached the end of the database.
    Finished,
}

/// Hands out subscriptions to shared scans of one database.
pub struct IterationManager<S: Read + Write + Seek> {
    database: Database<S>,
    train: Mutex<Option<Arc<Train<Entry<S>>>>>,
    cfg: managed::Config,
}

impl<S: Read + Write + Seek + Send + 'static> IterationManager<S> {
    pub fn new(database: Database<S>, cfg: managed::Config) -> Self {
        Self {
            database,
            train: Mutex::new(None),
            cfg,
        }
    }

    /// Join the current scan (if nothing has been evicted from it yet) or start a new one.
    fn board(&self) -> Result<Rider<Entry<S>>, Error> {
        let mut train = self.train.lock().unwrap();
        if let Some(current) = train.as_ref() {
            let rider = current.rider();
            if rider.is_complete() {
                return Ok(rider);
            }
        }

        let entries = self
            .database
            .entries()
            .map_err(|err| Error::Storage(Arc::new(err)))?
            .map(|entry| entry.map_err(Arc::new));
        let next = Train::new(entries);
        let rider = next.rider();
        *train = Some(next);
        debug!("started scan");
        Ok(rider)
    }

    /// Queue every entry of a scan into `target`, followed by [Event::Finished].
    ///
    /// Stops early (without queueing [Event::Finished]) if `cancel` fires.
    pub async fn iterate_to<C: Client<Event<S>>>(
        &self,
        target: &C,
        cancel: &Signal,
    ) -> Result<(), Error> {
        let rider = self.board()?;
        ride(rider, target, cancel).await
    }

    /// Subscribe to a scan. The returned client receives every entry, then [Event::Finished].
    ///
    /// The subscriber is registered before this returns, so it will not miss the start of a scan
    /// it joins.
    pub fn subscribe(&self, cancel: Signal) -> Result<Managed<Event<S>>, Error> {
        let rider = self.board()?;
        Ok(Managed::spawn(
            self.cfg.clone(),
            cancel,
            move |client, cancel| async move { ride(rider, &client, &cancel).await },
        ))
    }
}

/// Queue entries from `rider` into `target` until the scan ends or `cancel` fires.
///
/// Pulling an entry may read from storage and wait on the scan's locks, so each pull runs on the
/// blocking pool.
async fn ride<S, C>(mut rider: Rider<Entry<S>>, target: &C, cancel: &Signal) -> Result<(), Error>
where
    S: Read + Write + Seek + Send + 'static,
    C: Client<Event<S>>,
{
    loop {
        if cancel.is_raised() {
            return Ok(());
        }
        let (returned, entry) = tokio::task::spawn_blocking(move || {
            let entry = rider.next();
            (rider, entry)
        })
        .await
        .map_err(|err| {
            if err.is_panic() {
                Error::Panicked
            } else {
                Error::Aborted
            }
        })?;
        rider = returned;
        match entry {
            Some(Ok((key, value))) => target.queue(Event::Entry(key, value)),
            Some(Err(err)) => {
                target.queue(Event::Failed(err.clone()));
                return Err(Error::Storage(err));
            }
            None => {
                target.queue(Event::Finished);
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{client::Receipt, signal::Signaler};
    use keystream_macros::test_traced;
    use keystream_storage::Config;
    use std::{io::Cursor, sync::mpsc, time::Duration};

    type Memory = Cursor<Vec<u8>>;

    fn manager(items: &[(&str, &str)]) -> IterationManager<Memory> {
        let database = Database::init(Cursor::new(Vec::new()), Config::default()).unwrap();
        database.insert_range(items).unwrap();
        IterationManager::new(database, managed::Config::default())
    }

    async fn drain(subscription: &Managed<Event<Memory>>) -> Vec<(Bytes, Bytes)> {
        let never = Signal::never();
        let mut entries = Vec::new();
        loop {
            match subscription.receive(&never).await {
                Receipt::Delivered(Event::Entry(key, value)) => {
                    entries.push((key, value.load().unwrap()))
                }
                Receipt::Delivered(Event::Finished) => return entries,
                Receipt::Delivered(Event::Failed(err)) => panic!("scan failed: {err}"),
                Receipt::Cancelled => panic!("receive cancelled"),
            }
        }
    }

    #[test_traced]
    async fn test_subscribe() {
        let manager = manager(&[("a", "1"), ("bb", "22")]);
        let subscription = manager.subscribe(Signal::never()).unwrap();
        let entries = drain(&subscription).await;
        assert_eq!(
            entries,
            vec![
                (Bytes::from_static(b"a"), Bytes::from_static(b"1")),
                (Bytes::from_static(b"bb"), Bytes::from_static(b"22")),
            ]
        );
        subscription.close().await.unwrap();
    }

    #[test_traced]
    async fn test_fan_out() {
        let items: Vec<(String, String)> = (0..50)
            .map(|i| (format!("key-{i}"), format!("value-{i}")))
            .collect();
        let database = Database::init(Cursor::new(Vec::new()), Config::default()).unwrap();
        database.insert_range(&items).unwrap();
        let manager = IterationManager::new(database, managed::Config::default());

        let subscriptions: Vec<_> = (0..4)
            .map(|_| manager.subscribe(Signal::never()).unwrap())
            .collect();
        for subscription in subscriptions {
            let entries = drain(&subscription).await;
            assert_eq!(entries.len(), items.len());
            for ((key, value), (expected_key, expected_value)) in entries.iter().zip(&items) {
                assert_eq!(&key[..], expected_key.as_bytes());
                assert_eq!(&value[..], expected_value.as_bytes());
            }
            subscription.close().await.unwrap();
        }
    }

    #[test_traced]
    async fn test_late_subscriber_starts_new_scan() {
        let manager = manager(&[("a", "1"), ("b", "2")]);
        let first = manager.subscribe(Signal::never()).unwrap();
        assert_eq!(drain(&first).await.len(), 2);
        first.close().await.unwrap();

        let second = manager.subscribe(Signal::never()).unwrap();
        assert_eq!(drain(&second).await.len(), 2);
        second.close().await.unwrap();
    }

    #[test_traced]
    async fn test_iterate_to_client() {
        let manager = manager(&[("x", "1")]);
        let target = crate::client::Lightweight::new();
        manager.iterate_to(&target, &Signal::never()).await.unwrap();

        let never = Signal::never();
        assert!(matches!(
            target.receive(&never).await,
            Receipt::Delivered(Event::Entry(key, _)) if &key[..] == b"x"
        ));
        assert!(matches!(
            target.receive(&never).await,
            Receipt::Delivered(Event::Finished)
        ));
    }

    #[test_traced]
    async fn test_cancelled_iteration_stops() {
        let manager = manager(&[("x", "1"), ("y", "2")]);
        let (mut signaler, signal) = Signaler::new();
        signaler.signal();

        let target = crate::client::Lightweight::new();
        manager.iterate_to(&target, &signal).await.unwrap();
        assert!(matches!(target.receive(&signal).await, Receipt::Cancelled));
    }

    #[test_traced]
    fn test_scan_does_not_block_runtime() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        // The source waits for a task on the same single-threaded runtime
        let (open, gate) = mpsc::channel::<()>();
        let source = std::iter::from_fn(move || {
            gate.recv_timeout(Duration::from_secs(5)).expect("gate was never opened");
            None::<Entry<Memory>>
        });
        let train = Train::new(source);
        let target = crate::client::Lightweight::new();

        runtime.block_on(async {
            tokio::spawn(async move { open.send(()).unwrap() });
            ride(train.rider(), &target, &Signal::never()).await.unwrap();
            assert!(matches!(
                target.receive(&Signal::never()).await,
                Receipt::Delivered(Event::Finished)
            ));
        });
    }

    #[test_traced]
    async fn test_failed_scan() {
        let mut bytes = vec![0u8; 8];
        bytes.extend_from_slice(&[3, 1, 0]);
        let database = Database::init(Cursor::new(bytes), Config::default()).unwrap();
        let manager = IterationManager::new(database, managed::Config::default());

        let subscription = manager.subscribe(Signal::never()).unwrap();
        let receipt = subscription.receive(&Signal::never()).await;
        assert!(matches!(receipt, Receipt::Delivered(Event::Failed(_))));
        assert!(matches!(subscription.close().await, Err(Error::Worker(_))));
    }
}
