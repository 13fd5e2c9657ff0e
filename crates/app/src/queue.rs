//! Bounded in-process queue between the HTTP endpoint and the dispatcher.
//!
//! Ready entries are served FIFO. Retries sit in a delay heap until their
//! time comes and then join the back of the ready list. Each entry is handed
//! to exactly one `dequeue` caller and keeps its slot while claimed, until the
//! caller either requeues it or calls [`InboundQueue::complete`].

use std::{
    cmp::Ordering,
    collections::{BinaryHeap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use metrics::gauge;
use thiserror::Error;
use tokio::{sync::Notify, time::Instant};

use hookrelay_core::types::{InboundEvent, QueueEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EnqueueError {
    #[error("inbound queue is at capacity ({capacity})")]
    Full { capacity: usize },
    #[error("inbound queue is closed")]
    Closed,
}

#[derive(Clone)]
pub struct InboundQueue {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<QueueEntry>,
    delayed: BinaryHeap<Delayed>,
    /// Entries handed out by `dequeue` and not yet requeued or completed.
    claimed: usize,
    closed: bool,
    seq: u64,
}

impl QueueState {
    fn len(&self) -> usize {
        self.ready.len() + self.delayed.len()
    }

    fn occupied(&self) -> usize {
        self.len() + self.claimed
    }

    fn promote_due(&mut self, now: Instant) {
        while self
            .delayed
            .peek()
            .is_some_and(|delayed| delayed.ready_at <= now)
        {
            if let Some(delayed) = self.delayed.pop() {
                self.ready.push_back(delayed.entry);
            }
        }
    }
}

struct Delayed {
    ready_at: Instant,
    seq: u64,
    entry: QueueEntry,
}

// Reversed so the max-heap yields the earliest deadline first.
impl Ord for Delayed {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .ready_at
            .cmp(&self.ready_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Delayed {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at && self.seq == other.seq
    }
}

impl Eq for Delayed {}

impl InboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState::default()),
                notify: Notify::new(),
                capacity: capacity.max(1),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // Every critical section leaves the state consistent, so a poisoned lock is still usable.
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of entries waiting, ready or delayed. Claimed entries are not included.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn claimed(&self) -> usize {
        self.lock().claimed
    }

    /// Admits a freshly accepted event. Returns the depth after insertion.
    pub fn enqueue(&self, event: InboundEvent) -> Result<usize, EnqueueError> {
        let depth = {
            let mut state = self.lock();
            if state.closed {
                return Err(EnqueueError::Closed);
            }
            if state.occupied() >= self.inner.capacity {
                return Err(EnqueueError::Full {
                    capacity: self.inner.capacity,
                });
            }
            state.ready.push_back(QueueEntry::new(event));
            state.len()
        };
        gauge!("inbound_queue_depth").set(depth as f64);
        self.inner.notify.notify_one();
        Ok(depth)
    }

    /// Puts a claimed entry back to become ready after `delay`.
    ///
    /// The entry moves from its claimed slot into the delay heap, so capacity
    /// is unchanged. Returns the entry back when the queue has been closed so
    /// the caller can log it; the claim is released either way.
    pub fn requeue(&self, entry: QueueEntry, delay: Duration) -> Result<(), QueueEntry> {
        let depth = {
            let mut state = self.lock();
            state.claimed = state.claimed.saturating_sub(1);
            if state.closed {
                return Err(entry);
            }
            state.seq += 1;
            let seq = state.seq;
            state.delayed.push(Delayed {
                ready_at: Instant::now() + delay,
                seq,
                entry,
            });
            state.len()
        };
        gauge!("inbound_queue_depth").set(depth as f64);
        self.inner.notify.notify_one();
        Ok(())
    }

    /// Waits for the next ready entry. Returns `None` once the queue is closed,
    /// even if entries remain; those are collected with [`Self::drain_remaining`].
    pub async fn dequeue(&self) -> Option<QueueEntry> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_deadline = {
                let mut state = self.lock();
                if state.closed {
                    return None;
                }
                state.promote_due(Instant::now());
                if let Some(entry) = state.ready.pop_front() {
                    state.claimed += 1;
                    let depth = state.len();
                    let more_ready = !state.ready.is_empty();
                    drop(state);
                    gauge!("inbound_queue_depth").set(depth as f64);
                    if more_ready {
                        self.inner.notify.notify_one();
                    }
                    return Some(entry);
                }
                state.delayed.peek().map(|delayed| delayed.ready_at)
            };

            match next_deadline {
                Some(deadline) => {
                    let _ = tokio::time::timeout_at(deadline, notified).await;
                }
                None => notified.await,
            }
        }
    }

    /// Releases the slot of a claimed entry that reached a terminal outcome.
    pub fn complete(&self) {
        let mut state = self.lock();
        state.claimed = state.claimed.saturating_sub(1);
    }

    /// Stops admitting work and wakes every waiting consumer.
    pub fn close(&self) {
        self.lock().closed = true;
        self.inner.notify.notify_waiters();
    }

    /// Removes everything still held, ready entries first, then delayed ones by deadline.
    pub fn drain_remaining(&self) -> Vec<QueueEntry> {
        let mut state = self.lock();
        let mut drained: Vec<QueueEntry> = state.ready.drain(..).collect();
        let mut delayed = std::mem::take(&mut state.delayed).into_sorted_vec();
        // into_sorted_vec is ascending by Ord, which is latest deadline first here.
        delayed.reverse();
        drained.extend(delayed.into_iter().map(|delayed| delayed.entry));
        drop(state);
        gauge!("inbound_queue_depth").set(0.0);
        drained
    }
}
