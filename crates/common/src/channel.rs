//! Bounded FIFO with an explicit open/closed lifecycle
//!
//! A [`Channel`] is shared by one producer and one consumer (both hold a
//! clone of the same handle). Writers suspend while the buffer is full,
//! readers suspend while it is empty. Closing is a one-way transition:
//! further writes are rejected, while readers keep draining whatever is
//! still buffered before they observe end-of-stream.
//!
//! Either side may close. A producer closing means "no more items"; a
//! consumer closing means "stop producing", which is how a range scan is
//! cancelled.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::Stream;
use tokio::sync::{watch, Semaphore};

/// Lifecycle state of a [`Channel`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Open,
    Closed,
}

/// Why a channel was closed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed normally, by either side
    Closed,
    /// The producer gave up before finishing
    Aborted(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError<T> {
    /// The item could not be written; it is handed back to the caller
    #[error("channel is closed")]
    Closed(T),
}

impl<T> ChannelError<T> {
    pub fn into_inner(self) -> T {
        match self {
            ChannelError::Closed(item) => item,
        }
    }
}

struct Shared {
    /// Set once, by whoever closes first
    reason: watch::Sender<Option<CloseReason>>,
    /// Free buffer slots; closed together with the channel
    slots: Semaphore,
    handles: AtomicUsize,
    capacity: usize,
}

/// Bounded, closable, in-order queue
///
/// Cloning yields another handle to the same queue. Dropping every
/// handle but one closes the channel, so a lone producer or consumer is
/// never left waiting on a peer that no longer exists.
pub struct Channel<T> {
    tx: flume::Sender<T>,
    rx: flume::Receiver<T>,
    shared: Arc<Shared>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        self.shared.handles.fetch_add(1, Ordering::Relaxed);
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
            shared: self.shared.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("capacity", &self.shared.capacity)
            .field("buffered", &self.rx.len())
            .field("reason", &*self.shared.reason.borrow())
            .finish()
    }
}

impl<T> Channel<T> {
    /// Create an open channel holding at most `capacity` items.
    ///  A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, Semaphore::MAX_PERMITS);
        let (tx, rx) = flume::bounded(capacity);
        let (reason, _) = watch::channel(None);
        Self {
            tx,
            rx,
            shared: Arc::new(Shared {
                reason,
                slots: Semaphore::new(capacity),
                handles: AtomicUsize::new(1),
                capacity,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Number of items currently buffered
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn state(&self) -> ChannelState {
        if self.shared.reason.borrow().is_some() {
            ChannelState::Closed
        } else {
            ChannelState::Open
        }
    }

    pub fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }

    /// The reason recorded by whoever closed the channel first
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.shared.reason.borrow().clone()
    }

    /// Append an item, waiting for capacity if the buffer is full.
    ///
    /// Fails with [`ChannelError::Closed`] (returning the item) once the
    /// channel is closed, including when it closes while we wait.
    pub async fn send(&self, item: T) -> Result<(), ChannelError<T>> {
        match self.shared.slots.acquire().await {
            Ok(permit) => permit.forget(),
            Err(_) => return Err(ChannelError::Closed(item)),
        }
        // closing takes the write side of this lock, so nothing lands after it
        let reason = self.shared.reason.borrow();
        if reason.is_some() {
            return Err(ChannelError::Closed(item));
        }
        self.tx
            .try_send(item)
            .map_err(|err| ChannelError::Closed(err.into_inner()))
    }

    /// Take the next item, waiting while the channel is open and empty.
    ///
    /// Returns `None` only once the channel is closed and fully drained.
    pub async fn recv(&self) -> Option<T> {
        tokio::select! {
            biased;
            item = self.rx.recv_async() => item.ok().map(|item| self.taken(item)),
            _ = self.closed() => self.try_recv(),
        }
    }

    /// Take the next buffered item without waiting
    pub fn try_recv(&self) -> Option<T> {
        self.rx.try_recv().ok().map(|item| self.taken(item))
    }

    fn taken(&self, item: T) -> T {
        self.shared.slots.add_permits(1);
        item
    }

    /// Resolves once the channel is closed
    pub async fn closed(&self) {
        let mut reason = self.shared.reason.subscribe();
        // the sender lives in `shared`, so this cannot fail while we hold it
        let _ = reason.wait_for(Option::is_some).await;
    }

    /// Close the channel. Returns `false` if it was already closed.
    pub fn close(&self) -> bool {
        self.close_with(CloseReason::Closed)
    }

    /// Close the channel, recording that the producer failed
    pub fn abort(&self, message: impl Into<String>) -> bool {
        self.close_with(CloseReason::Aborted(message.into()))
    }

    fn close_with(&self, reason: CloseReason) -> bool {
        let first = self.shared.reason.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        });
        if first {
            self.shared.slots.close();
        }
        first
    }

    /// Consume the handle as a stream of items ending at end-of-stream
    pub fn into_stream(self) -> impl Stream<Item = T>
    where
        T: Send + 'static,
    {
        futures::stream::unfold(self, |chan| async move {
            let item = chan.recv().await?;
            Some((item, chan))
        })
    }
}

impl<T> Drop for Channel<T> {
    fn drop(&mut self) {
        // exactly one drop sees the count fall to a single handle
        if self.shared.handles.fetch_sub(1, Ordering::AcqRel) == 2 {
            self.close();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use futures::{FutureExt, StreamExt};
    use std::time::Duration;

    #[tokio::test]
    async fn test_delivers_in_insertion_order() {
        let chan = Channel::new(8);
        for i in 0..5 {
            chan.send(i).await.unwrap();
        }
        chan.close();

        let mut got = Vec::new();
        while let Some(item) = chan.recv().await {
            got.push(item);
        }
        assert_eq!(got, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_full_channel_suspends_writer() {
        let chan = Channel::new(2);
        chan.send(1).await.unwrap();
        chan.send(2).await.unwrap();

        assert!(chan.send(3).now_or_never().is_none());
        assert_eq!(chan.len(), 2);

        assert_eq!(chan.recv().await, Some(1));
        chan.send(3).await.unwrap();
        assert_eq!(chan.recv().await, Some(2));
        assert_eq!(chan.recv().await, Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocked_writer_resumes_when_reader_takes() {
        let chan = Channel::new(1);
        let producer = chan.clone();
        let task = tokio::spawn(async move {
            for i in 0..3 {
                producer.send(i).await.unwrap();
            }
            producer.close();
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(chan.len(), 1);
        assert!(!task.is_finished());

        let collected: Vec<_> = chan.clone().into_stream().collect().await;
        assert_eq!(collected, vec![0, 1, 2]);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_close_unblocks_waiting_reader() {
        let chan: Channel<u32> = Channel::new(4);
        let reader = chan.clone();
        let task = tokio::spawn(async move { reader.recv().await });

        tokio::task::yield_now().await;
        assert!(chan.close());
        assert_eq!(task.await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_close_rejects_writes_and_drains_buffer() {
        let chan = Channel::new(4);
        chan.send("a").await.unwrap();
        chan.send("b").await.unwrap();
        chan.close();

        let err = chan.send("c").await.unwrap_err();
        assert_eq!(err.into_inner(), "c");
        assert_eq!(chan.state(), ChannelState::Closed);

        assert_eq!(chan.recv().await, Some("a"));
        assert_eq!(chan.recv().await, Some("b"));
        assert_eq!(chan.recv().await, None);
    }

    #[tokio::test]
    async fn test_close_unblocks_waiting_writer() {
        let chan = Channel::new(1);
        chan.send(1).await.unwrap();
        let writer = chan.clone();
        let task = tokio::spawn(async move { writer.send(2).await });

        tokio::task::yield_now().await;
        chan.close();
        assert!(matches!(task.await.unwrap(), Err(ChannelError::Closed(2))));
    }

    #[tokio::test]
    async fn test_first_close_reason_wins() {
        let chan: Channel<()> = Channel::new(1);
        assert!(chan.abort("boom"));
        assert!(!chan.close());
        assert_eq!(
            chan.close_reason(),
            Some(CloseReason::Aborted("boom".to_string()))
        );
    }

    #[tokio::test]
    async fn test_dropping_peer_closes_channel() {
        let chan: Channel<u8> = Channel::new(1);
        let other = chan.clone();
        drop(other);
        assert_eq!(chan.state(), ChannelState::Closed);
    }

    #[test]
    fn test_concurrent_peer_drops_close_the_survivor() {
        for _ in 0..1_000 {
            let chan: Channel<u8> = Channel::new(1);
            let barrier = Arc::new(std::sync::Barrier::new(2));
            let threads: Vec<_> = [chan.clone(), chan.clone()]
                .into_iter()
                .map(|peer| {
                    let barrier = barrier.clone();
                    std::thread::spawn(move || {
                        barrier.wait();
                        drop(peer);
                    })
                })
                .collect();
            for thread in threads {
                thread.join().unwrap();
            }
            assert_eq!(chan.state(), ChannelState::Closed);
        }
    }

    #[tokio::test]
    async fn test_slots_are_returned_by_try_recv() {
        let chan = Channel::new(1);
        chan.send(1).await.unwrap();
        assert_eq!(chan.try_recv(), Some(1));
        assert_eq!(chan.try_recv(), None);
        chan.send(2).await.unwrap();
        assert_eq!(chan.len(), 1);
    }

    #[test]
    fn test_zero_capacity_is_one() {
        let chan: Channel<u8> = Channel::new(0);
        assert_eq!(chan.capacity(), 1);
        assert!(chan.is_empty());
    }
}
