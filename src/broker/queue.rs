//! Serial dispatch queues with an implicit worker
//!
//! Both the per-broker request queue and the per-connection response
//! queue share the same contract: the push that finds the queue idle gets
//! the item handed straight back and must start a worker for it; the
//! worker then pulls items one at a time until the queue is drained or
//! declared dead. A dead queue hands queued items back so the caller can
//! fail their promises.

use parking_lot::Mutex;
use std::collections::VecDeque;

/// Result of pushing an item.
pub(crate) enum PushOutcome<T> {
    /// The queue was idle; the caller must start a worker for this item.
    Started(T),
    /// A worker is already running; the item waits its turn.
    Enqueued,
    /// The queue is dead; the caller must fail the item.
    Dead(T),
}

/// Result of a worker asking for its next item.
pub(crate) enum NextOutcome<T> {
    /// Process this item next.
    Item(T),
    /// Queue drained; the worker exits and the next push starts a new one.
    Idle,
    /// The queue died; any drained items must be failed by the worker.
    Dead(Vec<T>),
}

#[derive(Debug)]
struct Inner<T> {
    items: VecDeque<T>,
    busy: bool,
    dead: bool,
}

/// Unbounded FIFO with spawn-on-first-push semantics.
#[derive(Debug)]
pub(crate) struct DispatchQueue<T> {
    inner: Mutex<Inner<T>>,
}

impl<T> Default for DispatchQueue<T> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                busy: false,
                dead: false,
            }),
        }
    }
}

impl<T> DispatchQueue<T> {
    pub(crate) fn push(&self, item: T) -> PushOutcome<T> {
        let mut q = self.inner.lock();
        if q.dead {
            return PushOutcome::Dead(item);
        }
        if q.busy {
            q.items.push_back(item);
            return PushOutcome::Enqueued;
        }
        q.busy = true;
        PushOutcome::Started(item)
    }

    pub(crate) fn next(&self) -> NextOutcome<T> {
        let mut q = self.inner.lock();
        if q.dead {
            q.busy = false;
            return NextOutcome::Dead(q.items.drain(..).collect());
        }
        match q.items.pop_front() {
            Some(item) => NextOutcome::Item(item),
            None => {
                q.busy = false;
                NextOutcome::Idle
            }
        }
    }

    /// Mark the queue dead, returning everything still waiting so the
    /// caller can fail it. Idempotent.
    pub(crate) fn die(&self) -> Vec<T> {
        let mut q = self.inner.lock();
        q.dead = true;
        q.items.drain(..).collect()
    }
}
