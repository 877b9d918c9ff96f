//! A client whose worker task lives and dies with it.
//!
//! [Managed::spawn] starts one background task running the supplied worker. The worker receives a
//! clone of the client and a [Signal] that fires when either the caller's cancellation fires or
//! the client is closed. [Managed::close] fires the internal signal and waits (up to
//! [Config::grace_period]) for the worker to return. A worker that overruns the grace period is
//! reported as [Error::Timeout]; the task is left running.

use crate::{
    client::{Client, Lightweight, Receipt},
    signal::{Signal, Signaler},
    Error,
};
use std::{future::Future, time::Duration};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Boxed error returned by a worker.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Configuration for a [Managed] client.
#[derive(Clone, Debug)]
pub struct Config {
    /// How long [Managed::close] waits for the worker to stop.
    pub grace_period: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(10),
        }
    }
}

/// A [Client] with a background worker tied to its lifetime.
///
/// Dropping a [Managed] client without calling [Managed::close] cancels the worker but does not
/// wait for it.
pub struct Managed<M> {
    client: Lightweight<M>,
    signaler: Signaler,
    handle: Option<JoinHandle<Result<(), BoxError>>>,
    cfg: Config,
}

impl<M: Send + 'static> Managed<M> {
    /// Spawn `worker` on the current tokio runtime.
    ///
    /// The worker is stopped by `cancel` or by closing the returned client, whichever comes first.
    pub fn spawn<F, Fut, E>(cfg: Config, cancel: Signal, worker: F) -> Self
    where
        F: FnOnce(Lightweight<M>, Signal) -> Fut,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<BoxError>,
    {
        let client = Lightweight::new();
        let (signaler, internal) = Signaler::new();
        let work = worker(client.clone(), cancel.link(internal));
        let handle = tokio::spawn(async move {
            let result = work.await.map_err(Into::into);
            debug!(ok = result.is_ok(), "worker stopped");
            result
        });
        debug!("worker started");

        Self {
            client,
            signaler,
            handle: Some(handle),
            cfg,
        }
    }

    /// The client shared with the worker.
    pub fn client(&self) -> &Lightweight<M> {
        &self.client
    }

    /// Returns true if the worker has returned.
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Cancel the worker and wait for it to stop.
    pub async fn close(mut self) -> Result<(), Error> {
        self.signaler.signal();
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        let grace_period = self.cfg.grace_period;
        match tokio::time::timeout(grace_period, handle).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(err))) => Err(Error::Worker(err)),
            Ok(Err(err)) if err.is_panic() => Err(Error::Panicked),
            Ok(Err(_)) => Err(Error::Aborted),
            Err(_) => {
                warn!(?grace_period, "worker did not stop in time");
                Err(Error::Timeout(grace_period))
            }
        }
    }
}

impl<M: Send> Client<M> for Managed<M> {
    fn queue(&self, message: M) {
        self.client.queue(message);
    }

    async fn receive(&self, cancel: &Signal) -> Receipt<M> {
        self.client.receive(cancel).await
    }
}

impl<M> Drop for Managed<M> {
    fn drop(&mut self) {
        self.signaler.signal();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keystream_macros::test_traced;
    use std::{
        io,
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
    };

    fn quick() -> Config {
        Config {
            grace_period: Duration::from_millis(100),
        }
    }

    #[test_traced]
    async fn test_prompt_worker_closes() {
        let managed: Managed<u32> =
            Managed::spawn(quick(), Signal::never(), |client, cancel| async move {
                while let Receipt::Delivered(_) = client.receive(&cancel).await {}
                Ok::<_, io::Error>(())
            });
        managed.queue(1);
        managed.close().await.unwrap();
    }

    #[test_traced]
    async fn test_close_times_out() {
        let stopped = Arc::new(AtomicBool::new(false));
        let flag = stopped.clone();
        let managed: Managed<()> = Managed::spawn(quick(), Signal::never(), |_, _| async move {
            // Ignores cancellation
            tokio::time::sleep(Duration::from_secs(1)).await;
            flag.store(true, Ordering::SeqCst);
            Ok::<_, io::Error>(())
        });

        let result = managed.close().await;
        assert!(matches!(result, Err(Error::Timeout(d)) if d == Duration::from_millis(100)));
        assert!(!stopped.load(Ordering::SeqCst));
    }

    #[test_traced]
    async fn test_external_cancel_stops_worker() {
        let (mut signaler, signal) = Signaler::new();
        let managed: Managed<()> = Managed::spawn(quick(), signal, |_, cancel| async move {
            cancel.await;
            Ok::<_, io::Error>(())
        });

        signaler.signal();
        while !managed.is_finished() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        managed.close().await.unwrap();
    }

    #[test_traced]
    async fn test_worker_error_reported() {
        let managed: Managed<()> = Managed::spawn(quick(), Signal::never(), |_, _| async move {
            Err(io::Error::new(io::ErrorKind::Other, "boom"))
        });
        assert!(matches!(managed.close().await, Err(Error::Worker(_))));
    }

    #[test_traced]
    async fn test_worker_panic_reported() {
        let managed: Managed<()> = Managed::spawn(quick(), Signal::never(), |_, _| async move {
            if true {
                panic!("worker panicked");
            }
            Ok::<_, io::Error>(())
        });
        assert!(matches!(managed.close().await, Err(Error::Panicked)));
    }

    #[test_traced]
    async fn test_drop_cancels_worker() {
        let stopped = Arc::new(AtomicBool::new(false));
        let flag = stopped.clone();
        let managed: Managed<()> =
            Managed::spawn(quick(), Signal::never(), |_, cancel| async move {
                cancel.await;
                flag.store(true, Ordering::SeqCst);
                Ok::<_, io::Error>(())
            });
        drop(managed);

        for _ in 0..100 {
            if stopped.load(Ordering::SeqCst) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("worker was not cancelled");
    }

    #[test_traced]
    async fn test_worker_sees_queued_messages() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let managed: Managed<u32> =
            Managed::spawn(quick(), Signal::never(), |client, cancel| async move {
                let mut total = 0;
                while let Receipt::Delivered(value) = client.receive(&cancel).await {
                    total += value;
                    if total >= 6 {
                        break;
                    }
                }
                let _ = tx.send(total);
                Ok::<_, io::Error>(())
            });
        for value in [1u32, 2, 3] {
            managed.queue(value);
        }
        assert_eq!(rx.await.unwrap(), 6);
        managed.close().await.unwrap();
    }
}
