//! FIFO work queue with a live "in flight" set.
//!
//! ```text
//!  enqueue ──► [ queued ... ] ──try_dequeue──► [ processing ] ──on_processed──► done
//!     │
//!     └─ count was 0 ─► start()
//! ```
//!
//! `count` covers queued and processing items, so an item that has been
//! dequeued but not yet finished still counts as outstanding work. The
//! `start` callback fires on every empty → non-empty transition and lets the
//! owner wake its single worker instead of spawning one per item.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

/// Queue bookkeeping errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// `on_processed` was called for an item that is not being processed.
    NotProcessing,
}

impl std::fmt::Display for QueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueError::NotProcessing => {
                write!(f, "Invalid operation: the item is not currently being processed")
            }
        }
    }
}

impl std::error::Error for QueueError {}

/// Lifetime counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub enqueued: u64,
    pub processed: u64,
    pub starts: u64,
}

struct QueueState<T> {
    queued: VecDeque<T>,
    processing: Vec<T>,
}

impl<T> QueueState<T> {
    fn count(&self) -> usize {
        self.queued.len() + self.processing.len()
    }
}

pub struct ProcessingQueue<T> {
    state: Mutex<QueueState<T>>,
    start: Box<dyn Fn() + Send + Sync>,
    enqueued: AtomicU64,
    processed: AtomicU64,
    starts: AtomicU64,
}

impl<T> std::fmt::Debug for ProcessingQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("ProcessingQueue")
            .field("queued", &state.queued.len())
            .field("processing", &state.processing.len())
            .finish()
    }
}

impl<T: Clone + PartialEq> ProcessingQueue<T> {
    /// Create a queue that calls `start` whenever it becomes non-empty.
    pub fn new(start: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            state: Mutex::new(QueueState {
                queued: VecDeque::new(),
                processing: Vec::new(),
            }),
            start: Box::new(start),
            enqueued: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            starts: AtomicU64::new(0),
        }
    }

    pub fn enqueue(&self, item: T) {
        let was_empty = {
            let mut state = self.lock();
            let was_empty = state.count() == 0;
            state.queued.push_back(item);
            was_empty
        };
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        // Outside the lock: the callback may dequeue synchronously.
        if was_empty {
            self.starts.fetch_add(1, Ordering::Relaxed);
            (self.start)();
        }
    }

    /// Pop the head of the queue and mark it as processing.
    pub fn try_dequeue(&self) -> Option<T> {
        let mut state = self.lock();
        let item = state.queued.pop_front()?;
        state.processing.push(item.clone());
        Some(item)
    }

    /// Mark a dequeued item as finished.
    pub fn on_processed(&self, item: &T) -> Result<(), QueueError> {
        let mut state = self.lock();
        let position = state
            .processing
            .iter()
            .position(|p| p == item)
            .ok_or(QueueError::NotProcessing)?;
        state.processing.remove(position);
        self.processed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Queued plus processing items.
    pub fn count(&self) -> usize {
        self.lock().count()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    pub fn is_processing(&self, item: &T) -> bool {
        self.lock().processing.contains(item)
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            starts: self.starts.load(Ordering::Relaxed),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
