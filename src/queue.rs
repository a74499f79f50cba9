//! # Prefetch Queue
//!
//! Bounded FIFO of songs that are downloaded and ready to play.
//!
//! The queue is the only flow control between the prefetch worker and the
//! player: when it is full, [`PrefetchQueue::offer`] blocks the worker until
//! the player takes something out with [`PrefetchQueue::poll`].
//!
//! ## Locking
//!
//! Everything sits behind one `Mutex`; a `Condvar` wakes blocked producers.
//! Every mutation publishes a snapshot taken under that lock, so observers
//! never see a half-applied change. Publishing is a channel send and never
//! blocks the caller.

use crate::song::PlayListEntry;
use std::collections::VecDeque;
use std::fmt;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Returned by `offer` once the queue has been closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueClosed(pub PlayListEntry);

impl fmt::Display for QueueClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "prefetch queue closed, dropped {}", self.0)
    }
}

impl std::error::Error for QueueClosed {}

/// Outcome of a non-blocking or bounded offer that did not go through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OfferRejected {
    Full(PlayListEntry),
    Closed(PlayListEntry),
}

#[derive(Debug, Default)]
struct QueueState {
    entries: VecDeque<PlayListEntry>,
    subscribers: Vec<Sender<Vec<PlayListEntry>>>,
    closed: bool,
}

impl QueueState {
    /// Send the current contents to every live subscriber.
    fn publish(&mut self) {
        if self.subscribers.is_empty() {
            return;
        }
        let snapshot: Vec<PlayListEntry> = self.entries.iter().cloned().collect();
        self.subscribers.retain(|tx| tx.send(snapshot.clone()).is_ok());
    }
}

/// Bounded blocking queue of ready-to-play entries.
#[derive(Debug)]
pub struct PrefetchQueue {
    capacity: usize,
    state: Mutex<QueueState>,
    not_full: Condvar,
}

impl PrefetchQueue {
    /// Queue holding at most `capacity` entries (at least one).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(QueueState::default()),
            not_full: Condvar::new(),
        }
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append `entry`, waiting as long as the queue is full.
    ///
    /// # Errors
    ///
    /// Returns the entry inside [`QueueClosed`] if the queue is closed before
    /// space becomes available.
    pub fn offer(&self, entry: PlayListEntry) -> Result<(), QueueClosed> {
        let mut state = self.lock();
        while state.entries.len() >= self.capacity && !state.closed {
            state = self.not_full.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
        if state.closed {
            return Err(QueueClosed(entry));
        }

        log::debug!("Queued {entry}");
        state.entries.push_back(entry);
        state.publish();
        Ok(())
    }

    /// Like [`offer`](Self::offer) but gives up after `timeout`.
    ///
    /// # Errors
    ///
    /// `Full` when no space appeared in time, `Closed` when the queue was closed.
    pub fn offer_timeout(&self, entry: PlayListEntry, timeout: Duration) -> Result<(), OfferRejected> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        while state.entries.len() >= self.capacity && !state.closed {
            let now = Instant::now();
            if now >= deadline {
                return Err(OfferRejected::Full(entry));
            }
            state = self
                .not_full
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        if state.closed {
            return Err(OfferRejected::Closed(entry));
        }

        state.entries.push_back(entry);
        state.publish();
        Ok(())
    }

    /// Append without waiting.
    ///
    /// # Errors
    ///
    /// Hands the entry back when the queue is full or closed.
    pub fn try_offer(&self, entry: PlayListEntry) -> Result<(), OfferRejected> {
        self.offer_timeout(entry, Duration::ZERO)
    }

    /// Take the head entry. Never blocks.
    pub fn poll(&self) -> Option<PlayListEntry> {
        let mut state = self.lock();
        let entry = state.entries.pop_front()?;
        state.publish();
        drop(state);

        self.not_full.notify_one();
        Some(entry)
    }

    /// Drop every entry and publish an empty snapshot.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.entries.clear();
        state.publish();
        drop(state);

        self.not_full.notify_all();
    }

    /// Ordered copy of the current contents.
    #[must_use]
    pub fn snapshot(&self) -> Vec<PlayListEntry> {
        self.lock().entries.iter().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Receive a snapshot after every change.
    #[must_use]
    pub fn subscribe(&self) -> Receiver<Vec<PlayListEntry>> {
        let (tx, rx) = mpsc::channel();
        self.lock().subscribers.push(tx);
        rx
    }

    /// Wake every blocked producer and refuse further offers. Entries already
    /// queued can still be polled. Dropping the subscriber senders ends any
    /// observer loop reading from them.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.subscribers.clear();
        drop(state);

        self.not_full.notify_all();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::song::Song;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::thread;

    fn entry(title: &str) -> PlayListEntry {
        PlayListEntry::new(Song::new(title, "Artist", "Genre"), PathBuf::from(format!("/tmp/{title}.mp3")), "local")
    }

    fn titles(entries: &[PlayListEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.song.title()).collect()
    }

    #[test]
    fn test_fifo_order() {
        let queue = PrefetchQueue::new(5);
        for title in ["A", "B", "C"] {
            queue.offer(entry(title)).unwrap();
        }

        assert_eq!(queue.poll().unwrap().song.title(), "A");
        assert_eq!(queue.poll().unwrap().song.title(), "B");
        assert_eq!(queue.poll().unwrap().song.title(), "C");
        assert!(queue.poll().is_none());
    }

    #[test]
    fn test_never_exceeds_capacity() {
        for capacity in 1..=4 {
            let queue = PrefetchQueue::new(capacity);
            for i in 0..capacity {
                queue.try_offer(entry(&i.to_string())).unwrap();
            }
            assert!(matches!(queue.try_offer(entry("extra")), Err(OfferRejected::Full(_))));
            assert_eq!(queue.len(), capacity);
        }
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let queue = PrefetchQueue::new(0);
        assert_eq!(queue.capacity(), 1);
    }

    #[test]
    fn test_blocked_offer_released_by_poll() {
        let queue = Arc::new(PrefetchQueue::new(3));
        for title in ["A", "B", "C"] {
            queue.offer(entry(title)).unwrap();
        }

        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.offer(entry("D")))
        };

        thread::sleep(Duration::from_millis(100));
        assert!(!producer.is_finished(), "4th offer must block on a full queue");
        assert_eq!(queue.len(), 3);

        assert_eq!(queue.poll().unwrap().song.title(), "A");
        producer.join().unwrap().unwrap();
        assert_eq!(titles(&queue.snapshot()), vec!["B", "C", "D"]);
    }

    #[test]
    fn test_offer_timeout_gives_up() {
        let queue = PrefetchQueue::new(1);
        queue.offer(entry("A")).unwrap();

        let started = Instant::now();
        let result = queue.offer_timeout(entry("B"), Duration::from_millis(50));
        assert!(matches!(result, Err(OfferRejected::Full(_))));
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_clear_publishes_empty_snapshot() {
        let queue = PrefetchQueue::new(3);
        let rx = queue.subscribe();
        queue.offer(entry("A")).unwrap();
        queue.offer(entry("B")).unwrap();
        queue.clear();

        assert!(queue.poll().is_none());

        let snapshots: Vec<_> = rx.try_iter().collect();
        assert_eq!(snapshots.len(), 3);
        assert_eq!(titles(&snapshots[1]), vec!["A", "B"]);
        assert!(snapshots[2].is_empty());
    }

    #[test]
    fn test_empty_poll_publishes_nothing() {
        let queue = PrefetchQueue::new(2);
        let rx = queue.subscribe();
        assert!(queue.poll().is_none());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_close_wakes_blocked_producer() {
        let queue = Arc::new(PrefetchQueue::new(1));
        queue.offer(entry("A")).unwrap();

        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.offer(entry("B")))
        };
        thread::sleep(Duration::from_millis(50));
        queue.close();

        let rejected = producer.join().unwrap().unwrap_err();
        assert_eq!(rejected.0.song.title(), "B");
        assert!(queue.is_closed());
        // Already queued entries survive the close.
        assert_eq!(queue.poll().unwrap().song.title(), "A");
    }

    #[test]
    fn test_dropped_subscriber_is_forgotten() {
        let queue = PrefetchQueue::new(2);
        drop(queue.subscribe());
        queue.offer(entry("A")).unwrap();
        assert!(queue.lock().subscribers.is_empty());
    }
}
