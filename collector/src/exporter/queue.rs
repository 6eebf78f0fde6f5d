//! Bounded pending-batch queue of one exporter.

use crate::batcher::Batch;
use std::collections::VecDeque;
use std::pin::pin;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

/// Why a batch left the queue without being delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Memory usage is above the soft limit.
    Memory,
    /// The queue was full.
    Overflow,
    /// The queue no longer accepts batches.
    Closed,
}

impl DropReason {
    /// Short description for log lines.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory pressure",
            Self::Overflow => "queue overflow",
            Self::Closed => "queue closed",
        }
    }
}

#[derive(Debug)]
struct State<T> {
    batches: VecDeque<Batch<T>>,
    closed: bool,
}

/// FIFO of batches waiting for delivery, dropping the oldest when full.
#[derive(Debug)]
pub struct BatchQueue<T> {
    state: Mutex<State<T>>,
    notify: Notify,
    capacity: usize,
}

impl<T> BatchQueue<T> {
    /// Creates a queue holding at most `capacity` batches.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(State {
                batches: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Batches waiting.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().batches.len()
    }

    /// Returns true when nothing is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enqueues a batch, returning every batch dropped to make room.
    ///
    /// With `shed` set, the oldest waiting batch is dropped first.
    pub fn push(&self, batch: Batch<T>, shed: bool) -> Vec<(Batch<T>, DropReason)> {
        let mut dropped = Vec::new();
        {
            let mut state = self.lock();
            if state.closed {
                dropped.push((batch, DropReason::Closed));
                return dropped;
            }
            if shed {
                if let Some(oldest) = state.batches.pop_front() {
                    dropped.push((oldest, DropReason::Memory));
                }
            }
            while state.batches.len() >= self.capacity {
                match state.batches.pop_front() {
                    Some(oldest) => dropped.push((oldest, DropReason::Overflow)),
                    None => break,
                }
            }
            state.batches.push_back(batch);
        }
        self.notify.notify_one();
        dropped
    }

    /// Waits for the next batch; `None` once closed and empty.
    pub async fn next(&self) -> Option<Batch<T>> {
        loop {
            let mut notified = pin!(self.notify.notified());
            notified.as_mut().enable();
            {
                let mut state = self.lock();
                if let Some(batch) = state.batches.pop_front() {
                    return Some(batch);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Stops accepting batches; waiting ones stay until taken.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
    }

    /// Removes every waiting batch.
    pub fn drain(&self) -> Vec<Batch<T>> {
        self.lock().batches.drain(..).collect()
    }
}
