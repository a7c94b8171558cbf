//! Blocking inter-stage queue with a join barrier.
//!
//! `StageQueue` is the channel between two pipeline stages. It supports:
//!
//! - Blocking `put` with optional capacity (backpressure)
//! - Blocking `get` returning either an item or a shutdown sentinel
//! - A `task_done`/`join` barrier so a controller can wait until every item
//!   ever put has been fully processed, not merely dequeued
//!
//! # Backpressure
//!
//! The queue between download and assembly is bounded: once it holds
//! `capacity` unprocessed items, downloaders block in `put` until an
//! assembler takes one. This bounds the amount of downloaded-but-unassembled
//! data sitting in scratch space. Queues further down the pipeline are
//! unbounded because their inflow is already limited by the bounded queue.
//!
//! # Shutdown
//!
//! Shutdown sentinels are injected by the controller after `join` confirms
//! the stage has drained, exactly one per attached worker. A sentinel is
//! not a task: it does not count against capacity or the join barrier, and
//! each worker consumes exactly one before exiting.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// A message delivered to a stage worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message<T> {
    /// One unit of work.
    Item(T),
    /// Shutdown sentinel: the receiving worker exits its loop.
    Shutdown,
}

struct Inner<T> {
    deque: VecDeque<Message<T>>,
    /// Items currently enqueued (sentinels excluded); bounded `put` blocks
    /// while this is at capacity.
    queued_items: usize,
    /// Items put but not yet marked done; `join` blocks while nonzero.
    in_flight: usize,
}

/// Blocking FIFO channel between two pipeline stages.
pub struct StageQueue<T> {
    inner: Mutex<Inner<T>>,
    capacity: Option<usize>,
    not_empty: Condvar,
    not_full: Condvar,
    all_done: Condvar,
}

impl<T> StageQueue<T> {
    /// Creates an unbounded queue.
    pub fn unbounded() -> Self {
        Self::with_capacity(None)
    }

    /// Creates a queue that holds at most `capacity` unprocessed items.
    pub fn bounded(capacity: usize) -> Self {
        Self::with_capacity(Some(capacity))
    }

    fn with_capacity(capacity: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                deque: VecDeque::new(),
                queued_items: 0,
                in_flight: 0,
            }),
            capacity,
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            all_done: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueues one item, blocking while a bounded queue is at capacity.
    pub fn put(&self, item: T) {
        let mut inner = self.lock();
        if let Some(cap) = self.capacity {
            while inner.queued_items >= cap {
                inner = self
                    .not_full
                    .wait(inner)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        }
        inner.deque.push_back(Message::Item(item));
        inner.queued_items += 1;
        inner.in_flight += 1;
        drop(inner);
        self.not_empty.notify_one();
    }

    /// Enqueues one shutdown sentinel.
    ///
    /// Sentinels bypass the capacity limit; they are only injected after the
    /// stage has drained, when the queue is empty anyway, and must never be
    /// able to deadlock shutdown.
    pub fn put_shutdown(&self) {
        let mut inner = self.lock();
        inner.deque.push_back(Message::Shutdown);
        drop(inner);
        self.not_empty.notify_one();
    }

    /// Dequeues the next message, blocking until one is available.
    pub fn get(&self) -> Message<T> {
        let mut inner = self.lock();
        loop {
            if let Some(msg) = inner.deque.pop_front() {
                if matches!(msg, Message::Item(_)) {
                    inner.queued_items -= 1;
                    drop(inner);
                    self.not_full.notify_one();
                }
                return msg;
            }
            inner = self
                .not_empty
                .wait(inner)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Marks one previously dequeued item as fully processed.
    ///
    /// # Panics
    ///
    /// Panics if called more times than items were put; that is a caller
    /// bug that would otherwise wedge `join` callers forever.
    pub fn task_done(&self) {
        let mut inner = self.lock();
        assert!(
            inner.in_flight > 0,
            "task_done called with no outstanding items"
        );
        inner.in_flight -= 1;
        if inner.in_flight == 0 {
            drop(inner);
            self.all_done.notify_all();
        }
    }

    /// Blocks until every item ever put has been marked done.
    ///
    /// This is a barrier on processing, not on queue emptiness: an item
    /// counts until its worker calls [`task_done`](Self::task_done), which
    /// happens after the item has been forwarded downstream.
    pub fn join(&self) {
        let mut inner = self.lock();
        while inner.in_flight > 0 {
            inner = self
                .all_done
                .wait(inner)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Number of unprocessed items currently enqueued (sentinels excluded).
    pub fn len(&self) -> usize {
        self.lock().queued_items
    }

    /// Whether no items are currently enqueued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
