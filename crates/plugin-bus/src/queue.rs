//! # Subscriber Queues
//!
//! One bounded FIFO per subscription. Capacity and overflow policy are fixed
//! when the subscription is created and never change afterwards.
//!
//! The queue also carries the scheduling flag used by the worker pool: a
//! queue is handed to at most one worker at a time, which is what keeps
//! deliveries to one subscriber in publish order.

use crate::config::OverflowPolicy;
use bus_types::Envelope;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Notify};

/// Final state of one queued delivery, reported to synchronous publishers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    Failed,
    Expired,
}

/// An envelope queued for one subscriber.
#[derive(Debug)]
pub struct QueueEntry {
    pub(crate) envelope: Envelope,
    pub(crate) enqueued_at: Instant,
    ack: Option<oneshot::Sender<DeliveryOutcome>>,
}

impl QueueEntry {
    pub(crate) fn new(envelope: Envelope, ack: Option<oneshot::Sender<DeliveryOutcome>>) -> Self {
        Self {
            envelope,
            enqueued_at: Instant::now(),
            ack,
        }
    }

    /// Report the outcome to a waiting publisher, if any.
    pub(crate) fn acknowledge(&mut self, outcome: DeliveryOutcome) {
        if let Some(ack) = self.ack.take() {
            let _ = ack.send(outcome);
        }
    }

    /// Time spent waiting in the queue.
    pub fn queued_for(&self) -> Duration {
        self.enqueued_at.elapsed()
    }
}

/// Result of offering an entry to a queue.
#[derive(Debug)]
pub(crate) enum PushOutcome {
    /// Entry accepted. `schedule` is true when the queue became runnable and
    /// must be handed to the worker pool.
    Queued { schedule: bool },
    /// Entry accepted after evicting the oldest one.
    QueuedEvicting {
        evicted: Box<QueueEntry>,
        schedule: bool,
    },
    /// The new entry was discarded (`DropNewest`).
    Dropped(Box<QueueEntry>),
    /// The new entry was refused (`Reject`, or `Block` after the timeout).
    Rejected(Box<QueueEntry>),
}

#[derive(Debug, Default)]
struct QueueState {
    entries: VecDeque<QueueEntry>,
    scheduled: bool,
}

/// Bounded FIFO for one subscription.
#[derive(Debug)]
pub struct SubscriberQueue {
    capacity: usize,
    policy: OverflowPolicy,
    state: Mutex<QueueState>,
    space: Notify,
}

impl SubscriberQueue {
    pub(crate) fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            capacity,
            policy,
            state: Mutex::new(QueueState {
                entries: VecDeque::with_capacity(capacity.min(64)),
                scheduled: false,
            }),
            space: Notify::new(),
        }
    }

    /// Fixed capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Entries currently waiting.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Whether no entry is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Offer an entry, applying the overflow policy when full.
    ///
    /// Only `Block` awaits; every other policy decides immediately.
    pub(crate) async fn push(&self, entry: QueueEntry, block_timeout: Duration) -> PushOutcome {
        match self.policy {
            OverflowPolicy::Block => self.push_blocking(entry, block_timeout).await,
            _ => self.try_push(entry),
        }
    }

    fn try_push(&self, entry: QueueEntry) -> PushOutcome {
        let mut state = self.state.lock();
        if state.entries.len() < self.capacity {
            state.entries.push_back(entry);
            return PushOutcome::Queued {
                schedule: Self::mark_scheduled(&mut state),
            };
        }

        match self.policy {
            OverflowPolicy::DropOldest => {
                let evicted = state.entries.pop_front();
                state.entries.push_back(entry);
                let schedule = Self::mark_scheduled(&mut state);
                match evicted {
                    Some(evicted) => PushOutcome::QueuedEvicting {
                        evicted: Box::new(evicted),
                        schedule,
                    },
                    None => PushOutcome::Queued { schedule },
                }
            }
            OverflowPolicy::DropNewest => PushOutcome::Dropped(Box::new(entry)),
            OverflowPolicy::Reject | OverflowPolicy::Block => {
                PushOutcome::Rejected(Box::new(entry))
            }
        }
    }

    async fn push_blocking(&self, entry: QueueEntry, timeout: Duration) -> PushOutcome {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.space.notified();
            {
                let mut state = self.state.lock();
                if state.entries.len() < self.capacity {
                    state.entries.push_back(entry);
                    return PushOutcome::Queued {
                        schedule: Self::mark_scheduled(&mut state),
                    };
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return PushOutcome::Rejected(Box::new(entry));
            }
        }
    }

    fn mark_scheduled(state: &mut QueueState) -> bool {
        !std::mem::replace(&mut state.scheduled, true)
    }

    /// Take the head entry. Called only by the worker owning the queue.
    pub(crate) fn pop(&self) -> Option<QueueEntry> {
        let entry = self.state.lock().entries.pop_front();
        if entry.is_some() {
            self.space.notify_one();
        }
        entry
    }

    /// Called by the owning worker after it finished an entry.
    ///
    /// Returns true when more entries are waiting and the queue must be
    /// rescheduled; otherwise the queue goes idle and the next push
    /// schedules it again.
    pub(crate) fn finish_turn(&self) -> bool {
        let mut state = self.state.lock();
        if state.entries.is_empty() {
            state.scheduled = false;
            false
        } else {
            true
        }
    }

    /// Whether the queue is currently handed to the worker pool.
    pub(crate) fn is_scheduled(&self) -> bool {
        self.state.lock().scheduled
    }

    /// Remove every waiting entry (forced shutdown).
    pub(crate) fn drain(&self) -> Vec<QueueEntry> {
        let mut state = self.state.lock();
        state.scheduled = false;
        let drained: Vec<QueueEntry> = state.entries.drain(..).collect();
        drop(state);
        self.space.notify_waiters();
        drained
    }
}
