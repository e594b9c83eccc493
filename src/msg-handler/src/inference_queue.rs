//! Bounded FIFO of inference requests waiting for the worker.
use std::collections::VecDeque;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender};
use spin::Mutex;

pub const DEFAULT_CAPACITY: usize = 5;

/// The list is guarded by a lock; a token channel counts the items that
/// are free to be popped. There is never more than one token per item in
/// the list, so a consumer holding a token always finds an item.
pub struct InferenceQueue<T> {
    list: Mutex<VecDeque<T>>,
    capacity: usize,
    available_tx: Sender<()>,
    available_rx: Receiver<()>,
}

impl<T> Default for InferenceQueue<T> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl<T> InferenceQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let (available_tx, available_rx) = channel::bounded(capacity);
        InferenceQueue {
            list: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            available_tx,
            available_rx,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.list.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.lock().is_empty()
    }

    fn give(&self) {
        // one token per listed item, the channel never fills up
        let _ = self.available_tx.try_send(());
    }

    /// Appends `item`, or hands it back if the queue is full. Never blocks.
    pub fn push(&self, item: T) -> Result<(), T> {
        let mut list = self.list.lock();
        if list.len() >= self.capacity {
            return Err(item);
        }
        list.push_back(item);
        drop(list);
        self.give();
        Ok(())
    }

    /// Removes the oldest item, blocking until there is one.
    pub fn pop(&self) -> T {
        loop {
            let _ = self.available_rx.recv();
            if let Some(item) = self.list.lock().pop_front() {
                return item;
            }
        }
    }

    /// Like [`pop`](Self::pop) but gives up after `timeout`.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        self.available_rx.recv_timeout(timeout).ok()?;
        self.list.lock().pop_front()
    }

    /// Removes the first item matching `pred`. Never blocks: if no item is
    /// free to be popped, nothing is erased.
    pub fn erase<F>(&self, pred: F) -> bool
    where
        F: FnMut(&T) -> bool,
    {
        if self.available_rx.try_recv().is_err() {
            return false;
        }

        let mut list = self.list.lock();
        let found = list.iter().position(pred);
        if let Some(index) = found {
            list.remove(index);
        }
        drop(list);

        if found.is_none() {
            self.give();
        }
        found.is_some()
    }
}
