//! Expiring queue of idle event subscriptions.
//!
//! Each entry becomes due a fixed delay after it was added. Adding an entry
//! that is already queued restarts its delay. Removal is O(1): the key is
//! dropped from the live map and its stale queue slot is skipped later.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

struct Entry {
    key: String,
    seq: u64,
    due: Instant,
}

#[derive(Default)]
struct QueueState {
    next_seq: u64,
    /// Live keys and the sequence number of their current slot
    live: HashMap<String, u64>,
    /// Slots in due order, possibly stale
    slots: VecDeque<Entry>,
}

impl QueueState {
    fn drop_stale_front(&mut self) {
        while let Some(front) = self.slots.front() {
            if self.live.get(&front.key) == Some(&front.seq) {
                break;
            }
            self.slots.pop_front();
        }
    }
}

/// FIFO of keys, each expiring `delay` after insertion
pub struct UnsubscribeQueue {
    delay: Duration,
    state: Mutex<QueueState>,
    changed: Notify,
}

impl UnsubscribeQueue {
    /// Create an empty queue
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            state: Mutex::new(QueueState::default()),
            changed: Notify::new(),
        }
    }

    /// Add a key, restarting its delay if already queued
    pub fn add(&self, key: &str) {
        let mut state = self.state.lock();
        state.next_seq += 1;
        let seq = state.next_seq;
        state.live.insert(key.to_string(), seq);
        state.slots.push_back(Entry {
            key: key.to_string(),
            seq,
            due: Instant::now() + self.delay,
        });
        drop(state);
        self.changed.notify_one();
    }

    /// Remove a key. Returns false if it was not queued.
    pub fn remove(&self, key: &str) -> bool {
        let mut state = self.state.lock();
        let removed = state.live.remove(key).is_some();
        if state.live.is_empty() {
            state.slots.clear();
        }
        removed
    }

    /// Check whether a key is queued
    pub fn contains(&self, key: &str) -> bool {
        self.state.lock().live.contains_key(key)
    }

    /// Number of queued keys
    pub fn len(&self) -> usize {
        self.state.lock().live.len()
    }

    /// Check whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every queued key
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.live.clear();
        state.slots.clear();
    }

    /// Wait for the oldest key to become due and take it.
    pub async fn next_expired(&self) -> String {
        loop {
            let due = {
                let mut state = self.state.lock();
                state.drop_stale_front();
                match state.slots.front() {
                    Some(front) if front.due <= Instant::now() => {
                        if let Some(entry) = state.slots.pop_front() {
                            state.live.remove(&entry.key);
                            return entry.key;
                        }
                        None
                    }
                    Some(front) => Some(front.due),
                    None => None,
                }
            };

            let notified = self.changed.notified();
            match due {
                Some(due) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(due) => {}
                        _ = notified => {}
                    }
                }
                None => notified.await,
            }
        }
    }
}
