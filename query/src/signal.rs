//! One-shot cancellation signals.

use futures::{channel::oneshot, future::Shared, FutureExt};
use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    task::{Context, Poll},
};

/// A one-time broadcast that can be awaited by many tasks. It is used to request cooperative
/// cancellation of a receive or a worker.
///
/// A [Signal] resolves once its [Signaler] calls [Signaler::signal]. If the [Signaler] is dropped
/// without signalling, the [Signal] never resolves. Two signals can be combined with
/// [Signal::link] into one that resolves when either does.
///
/// Unlike a bare shared receiver, a resolved [Signal] can be polled again (it stays resolved), so
/// it is safe to wait on `&mut signal` in a loop.
///
/// # Example
///
/// ```rust
/// use keystream_query::signal::Signaler;
///
/// # futures::executor::block_on(async {
/// let (mut signaler, signal) = Signaler::new();
/// assert!(!signal.is_raised());
///
/// signaler.signal();
/// signal.clone().await;
/// assert!(signal.is_raised());
/// # });
/// ```
#[derive(Clone)]
pub enum Signal {
    /// A signal that will resolve when its signaler fires.
    Open(Receiver),
    /// A signal that has resolved.
    Closed,
    /// A signal that will never resolve.
    Never,
    /// A signal that resolves when either of two signals does.
    Linked(Box<(Signal, Signal)>),
}

/// An open [Signal].
#[derive(Clone)]
pub struct Receiver {
    inner: Shared<oneshot::Receiver<()>>,
    raised: Arc<AtomicBool>,
}

impl Signal {
    /// A signal that never resolves.
    pub fn never() -> Self {
        Self::Never
    }

    /// Combine with `other`: the result resolves as soon as either signal does.
    pub fn link(self, other: Signal) -> Self {
        match (self, other) {
            (Self::Closed, _) | (_, Self::Closed) => Self::Closed,
            (Self::Never, signal) | (signal, Self::Never) => signal,
            (a, b) => Self::Linked(Box::new((a, b))),
        }
    }

    /// Returns true if the signal has fired, without waiting.
    pub fn is_raised(&self) -> bool {
        match self {
            Self::Open(receiver) => receiver.raised.load(Ordering::Acquire),
            Self::Closed => true,
            Self::Never => false,
            Self::Linked(pair) => pair.0.is_raised() || pair.1.is_raised(),
        }
    }
}

impl Future for Signal {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let next = match &mut *self {
            Self::Open(receiver) => match Pin::new(&mut receiver.inner).poll(cx) {
                Poll::Ready(Ok(())) => Self::Closed,
                // The signaler was dropped without firing
                Poll::Ready(Err(_)) => Self::Never,
                Poll::Pending => return Poll::Pending,
            },
            Self::Closed => return Poll::Ready(()),
            Self::Never => return Poll::Pending,
            Self::Linked(pair) => {
                let (a, b) = &mut **pair;
                let a = Pin::new(a).poll(cx).is_ready();
                let b = Pin::new(b).poll(cx).is_ready();
                if a || b {
                    Self::Closed
                } else if matches!(&**pair, (Self::Never, Self::Never)) {
                    Self::Never
                } else {
                    return Poll::Pending;
                }
            }
        };
        *self = next;
        match *self {
            Self::Closed => Poll::Ready(()),
            _ => Poll::Pending,
        }
    }
}

/// Fires a [Signal] (and every clone of it).
pub struct Signaler {
    tx: Option<oneshot::Sender<()>>,
    raised: Arc<AtomicBool>,
}

impl Signaler {
    /// Create a new [Signaler].
    ///
    /// Returns a [Signaler] and a [Signal] that will resolve when [Signaler::signal] is called.
    pub fn new() -> (Self, Signal) {
        let (tx, rx) = oneshot::channel();
        let raised = Arc::new(AtomicBool::new(false));
        let signaler = Self {
            tx: Some(tx),
            raised: raised.clone(),
        };
        let signal = Signal::Open(Receiver {
            inner: rx.shared(),
            raised,
        });
        (signaler, signal)
    }

    /// Resolve all [Signal]s associated with this [Signaler]. Only the first call has an effect.
    pub fn signal(&mut self) {
        if let Some(tx) = self.tx.take() {
            self.raised.store(true, Ordering::Release);
            let _ = tx.send(());
        }
    }

    /// Returns true if [Signaler::signal] has been called.
    pub fn is_signalled(&self) -> bool {
        self.tx.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{executor::block_on, FutureExt};
    use keystream_macros::test_traced;
    use std::time::Duration;

    #[test_traced]
    fn test_signal_resolves_every_clone() {
        let (mut signaler, signal) = Signaler::new();
        let clone = signal.clone();
        assert!(!signal.is_raised());
        assert!(signal.clone().now_or_never().is_none());

        signaler.signal();
        assert!(signaler.is_signalled());
        assert!(signal.is_raised());
        block_on(signal);
        block_on(clone);
    }

    #[test_traced]
    fn test_signal_polled_after_resolution() {
        let (mut signaler, mut signal) = Signaler::new();
        signaler.signal();
        block_on(&mut signal);
        block_on(&mut signal);
        assert!(matches!(signal, Signal::Closed));
    }

    #[test_traced]
    fn test_dropped_signaler_never_fires() {
        let (signaler, mut signal) = Signaler::new();
        drop(signaler);
        assert!((&mut signal).now_or_never().is_none());
        assert!(matches!(signal, Signal::Never));
        assert!(!signal.is_raised());
    }

    #[test_traced]
    fn test_signal_twice() {
        let (mut signaler, signal) = Signaler::new();
        signaler.signal();
        signaler.signal();
        block_on(signal);
    }

    #[test_traced]
    fn test_link() {
        let (mut first, a) = Signaler::new();
        let (_second, b) = Signaler::new();
        let linked = a.link(b);
        assert!(matches!(linked, Signal::Linked(_)));
        assert!(!linked.is_raised());
        assert!(linked.clone().now_or_never().is_none());

        first.signal();
        assert!(linked.is_raised());
        block_on(linked);
    }

    #[test_traced]
    fn test_link_shortcuts() {
        let (_signaler, open) = Signaler::new();
        assert!(matches!(open.clone().link(Signal::never()), Signal::Open(_)));
        assert!(matches!(Signal::never().link(Signal::Closed), Signal::Closed));
        assert!(matches!(
            Signal::never().link(Signal::never()),
            Signal::Never
        ));
    }

    #[test_traced]
    fn test_linked_never_collapses() {
        let (a, first) = Signaler::new();
        let (b, second) = Signaler::new();
        let mut linked = first.link(second);
        drop(a);
        drop(b);
        assert!((&mut linked).now_or_never().is_none());
        assert!(matches!(linked, Signal::Never));
    }

    #[test_traced]
    async fn test_signal_across_tasks() {
        let (mut signaler, signal) = Signaler::new();
        let waiter = tokio::spawn(signal);
        tokio::time::sleep(Duration::from_millis(10)).await;
        signaler.signal();
        waiter.await.unwrap();
    }
}
