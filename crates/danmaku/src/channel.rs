//! Bounded, drop-oldest broadcast channel.
//!
//! Every subscriber owns a ring of at most `capacity` items. Publishing never
//! blocks: when a subscriber's ring is full its oldest item is discarded to
//! admit the newest one. Late subscribers only see items published after
//! they subscribed.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

/// Default number of buffered items per subscriber.
pub const DEFAULT_CAPACITY: usize = 200;

struct Inbox<T> {
    queue: Mutex<VecDeque<T>>,
    notify: Notify,
    dropped: AtomicU64,
}

impl<T> Inbox<T> {
    fn push(&self, item: T, capacity: usize) {
        {
            let mut queue = self.queue.lock();
            if queue.len() >= capacity {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(item);
        }
        self.notify.notify_one();
    }
}

struct Shared<T> {
    capacity: usize,
    subscribers: Mutex<Vec<Weak<Inbox<T>>>>,
    senders: AtomicUsize,
    closed: AtomicBool,
}

impl<T> Shared<T> {
    /// Snapshot live subscribers, pruning dropped ones.
    fn live_inboxes(&self) -> Vec<Arc<Inbox<T>>> {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|weak| weak.strong_count() > 0);
        subscribers.iter().filter_map(Weak::upgrade).collect()
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            for inbox in self.live_inboxes() {
                inbox.notify.notify_one();
            }
        }
    }
}

/// Producer side of the channel.
pub struct FanOut<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Clone> FanOut<T> {
    /// Create a channel with [`DEFAULT_CAPACITY`].
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a channel buffering up to `capacity` items per subscriber.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                capacity: capacity.max(1),
                subscribers: Mutex::new(Vec::new()),
                senders: AtomicUsize::new(1),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Subscribe to items published from now on.
    pub fn subscribe(&self) -> Subscription<T> {
        let inbox = Arc::new(Inbox {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        });
        self.shared.subscribers.lock().push(Arc::downgrade(&inbox));

        Subscription {
            inbox,
            shared: self.shared.clone(),
            reported_drops: 0,
        }
    }

    /// Publish an item to every current subscriber.
    ///
    /// Returns the number of subscribers that received it; 0 when nobody is
    /// listening.
    pub fn publish(&self, item: T) -> usize {
        let inboxes = self.shared.live_inboxes();
        for inbox in &inboxes {
            inbox.push(item.clone(), self.shared.capacity);
        }
        inboxes.len()
    }

    /// Get the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.shared.live_inboxes().len()
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Close the channel. Subscribers drain what is buffered, then end.
    pub fn close(&self) {
        self.shared.close();
    }
}

impl<T: Clone> Default for FanOut<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for FanOut<T> {
    fn clone(&self) -> Self {
        self.shared.senders.fetch_add(1, Ordering::Relaxed);
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Drop for FanOut<T> {
    fn drop(&mut self) {
        if self.shared.senders.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.shared.close();
        }
    }
}

/// Consumer side of the channel.
pub struct Subscription<T> {
    inbox: Arc<Inbox<T>>,
    shared: Arc<Shared<T>>,
    reported_drops: u64,
}

impl<T> Subscription<T> {
    /// Take the oldest buffered item without waiting.
    pub fn try_recv(&mut self) -> Option<T> {
        let item = self.inbox.queue.lock().pop_front();
        self.report_drops();
        item
    }

    /// Wait for the next item. Returns `None` once the channel is closed and
    /// the buffer is drained.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            if let Some(item) = self.try_recv() {
                return Some(item);
            }
            if self.shared.closed.load(Ordering::Acquire) {
                // A publish may have raced with close
                return self.try_recv();
            }
            self.inbox.notify.notified().await;
        }
    }

    /// Number of items discarded for this subscriber because it fell behind.
    pub fn dropped(&self) -> u64 {
        self.inbox.dropped.load(Ordering::Relaxed)
    }

    /// Number of items currently buffered.
    pub fn len(&self) -> usize {
        self.inbox.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Convert into a stream of items.
    pub fn into_stream(self) -> impl Stream<Item = T>
    where
        T: Send,
    {
        futures::stream::unfold(self, |mut sub| async move {
            sub.recv().await.map(|item| (item, sub))
        })
    }

    fn report_drops(&mut self) {
        let dropped = self.dropped();
        if dropped > self.reported_drops {
            debug!(
                dropped = dropped - self.reported_drops,
                "subscriber lagged, oldest items discarded"
            );
            self.reported_drops = dropped;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::time::Duration;

    #[test]
    fn test_overflow_keeps_most_recent() {
        let channel = FanOut::with_capacity(200);
        let mut sub = channel.subscribe();

        for i in 0..250 {
            channel.publish(i);
        }

        assert_eq!(sub.len(), 200);
        assert_eq!(sub.dropped(), 50);

        let drained: Vec<i32> = std::iter::from_fn(|| sub.try_recv()).collect();
        assert_eq!(drained, (50..250).collect::<Vec<_>>());
    }

    #[test]
    fn test_no_replay_for_late_subscriber() {
        let channel = FanOut::new();
        channel.publish("early");

        let mut late = channel.subscribe();
        assert!(late.try_recv().is_none());

        channel.publish("late");
        assert_eq!(late.try_recv(), Some("late"));
    }

    #[test]
    fn test_every_subscriber_gets_every_item() {
        let channel = FanOut::new();
        let mut a = channel.subscribe();
        let mut b = channel.subscribe();

        assert_eq!(channel.publish(1), 2);
        assert_eq!(a.try_recv(), Some(1));
        assert_eq!(b.try_recv(), Some(1));
    }

    #[test]
    fn test_slow_subscriber_does_not_affect_fast_one() {
        let channel = FanOut::with_capacity(2);
        let mut slow = channel.subscribe();
        let mut fast = channel.subscribe();

        for i in 0..5 {
            channel.publish(i);
            assert_eq!(fast.try_recv(), Some(i));
        }

        assert_eq!(fast.dropped(), 0);
        assert_eq!(slow.dropped(), 3);
        assert_eq!(slow.try_recv(), Some(3));
    }

    #[test]
    fn test_dropped_subscriber_is_pruned() {
        let channel = FanOut::<u8>::new();
        let sub = channel.subscribe();
        assert_eq!(channel.subscriber_count(), 1);

        drop(sub);
        assert_eq!(channel.subscriber_count(), 0);
        assert_eq!(channel.publish(1), 0);
    }

    #[tokio::test]
    async fn test_recv_wakes_on_publish() {
        let channel = FanOut::new();
        let mut sub = channel.subscribe();

        let producer = channel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            producer.publish("hello");
        });

        let item = tokio::time::timeout(Duration::from_secs(1), sub.recv()).await;
        assert_eq!(item.unwrap(), Some("hello"));
    }

    #[tokio::test]
    async fn test_stream_ends_when_all_senders_dropped() {
        let channel = FanOut::new();
        let sub = channel.subscribe();

        channel.publish(1);
        channel.publish(2);
        drop(channel);

        let items: Vec<i32> = sub.into_stream().collect().await;
        assert_eq!(items, vec![1, 2]);
    }
}
