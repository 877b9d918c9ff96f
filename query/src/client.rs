//! Queue messages and receive them with cancellation.

use crate::signal::Signal;
use async_lock::Mutex;
use futures::{channel::mpsc, StreamExt};
use std::{future::Future, sync::Arc};

/// The outcome of [Client::receive].
#[derive(Debug, PartialEq, Eq)]
pub enum Receipt<M> {
    /// A message was taken from the queue.
    Delivered(M),
    /// The wait was cancelled before a message arrived. No message was consumed.
    Cancelled,
}

impl<M> Receipt<M> {
    /// Returns the delivered message, if any.
    pub fn into_message(self) -> Option<M> {
        match self {
            Self::Delivered(message) => Some(message),
            Self::Cancelled => None,
        }
    }
}

/// A queue of messages that can be waited on.
pub trait Client<M>: Send + Sync {
    /// Append a message to the queue.
    ///
    /// Messages queued by one caller are received in the order they were queued.
    fn queue(&self, message: M);

    /// Wait for the next message, or until `cancel` fires.
    fn receive(&self, cancel: &Signal) -> impl Future<Output = Receipt<M>> + Send;
}

/// A [Client] backed by an unbounded channel.
///
/// Clones share the same queue.
pub struct Lightweight<M> {
    sender: mpsc::UnboundedSender<M>,
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<M>>>,
}

impl<M> Lightweight<M> {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded();
        Self {
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
        }
    }
}

impl<M> Default for Lightweight<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> Clone for Lightweight<M> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            receiver: self.receiver.clone(),
        }
    }
}

impl<M: Send> Client<M> for Lightweight<M> {
    fn queue(&self, message: M) {
        // The receiver lives as long as this client, so the channel is never closed
        let _ = self.sender.unbounded_send(message);
    }

    async fn receive(&self, cancel: &Signal) -> Receipt<M> {
        if cancel.is_raised() {
            return Receipt::Cancelled;
        }
        let mut cancel = cancel.clone();

        // Concurrent receivers wait their turn for the queue
        let mut receiver = tokio::select! {
            receiver = self.receiver.lock() => receiver,
            _ = &mut cancel => return Receipt::Cancelled,
        };
        tokio::select! {
            message = receiver.next() => match message {
                Some(message) => Receipt::Delivered(message),
                None => Receipt::Cancelled,
            },
            _ = &mut cancel => Receipt::Cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::Signaler;
    use keystream_macros::test_traced;
    use std::time::Duration;

    #[test_traced]
    async fn test_queue_then_receive() {
        let client = Lightweight::new();
        client.queue(1);
        client.queue(2);
        let never = Signal::never();
        assert_eq!(client.receive(&never).await, Receipt::Delivered(1));
        assert_eq!(client.receive(&never).await, Receipt::Delivered(2));
    }

    #[test_traced]
    async fn test_receive_waits_for_message() {
        let client = Lightweight::new();
        let sender = client.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            sender.queue("hello");
        });
        let receipt = client.receive(&Signal::never()).await;
        assert_eq!(receipt.into_message(), Some("hello"));
    }

    #[test_traced]
    async fn test_cancel_does_not_consume() {
        let client = Lightweight::<u32>::new();
        let (mut signaler, signal) = Signaler::new();

        let waiter = {
            let client = client.clone();
            let signal = signal.clone();
            tokio::spawn(async move { client.receive(&signal).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        signaler.signal();
        assert_eq!(waiter.await.unwrap(), Receipt::Cancelled);

        // A raised signal cancels immediately, even with a message waiting
        client.queue(7);
        assert_eq!(client.receive(&signal).await, Receipt::Cancelled);
        assert_eq!(client.receive(&Signal::never()).await, Receipt::Delivered(7));
    }

    #[test_traced]
    async fn test_concurrent_receivers() {
        let client = Lightweight::<u32>::new();
        let mut handles = Vec::new();
        for _ in 0..4 {
            let client = client.clone();
            handles.push(tokio::spawn(async move {
                let never = Signal::never();
                let mut received = Vec::new();
                for _ in 0..25 {
                    received.push(client.receive(&never).await.into_message().unwrap());
                }
                received
            }));
        }
        for i in 0..100 {
            client.queue(i);
        }

        let mut all = Vec::new();
        for handle in handles {
            let received = handle.await.unwrap();
            // Each receiver observes messages in queue order
            assert!(received.windows(2).all(|w| w[0] < w[1]));
            all.extend(received);
        }
        all.sort();
        assert_eq!(all, (0..100).collect::<Vec<_>>());
    }
}
