//! FIFO queue whose takers block until an element satisfying a
//! caller-supplied predicate arrives.
//!
//! Elements live in a mutex-guarded deque; takers scan it under the lock
//! and park on a [`Notify`] when nothing matches. `add` wakes every parked
//! taker and each one re-scans. An element only ever leaves the deque under
//! a taker's lock, so a `take` future that is dropped mid-wait (a `poll`
//! timeout, an aborted task) can never strand an element.
//!
//! Lock poisoning surfaces as [`QueueError::Poisoned`] instead of a panic,
//! so one crashed lock holder cannot take every later caller down with it.
//!
//! Insertion order is preserved: among the elements matching one predicate,
//! `take` always removes the earliest-inserted. No ordering is promised
//! *between* takers; a taker whose predicate is satisfied first completes
//! first.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// A previous holder of the internal lock panicked.
    #[error("internal: queue lock poisoned")]
    Poisoned,
}

#[derive(Debug, Default)]
pub struct ConditionalQueue<T> {
    items: Mutex<VecDeque<T>>,
    added: Notify,
}

impl<T> ConditionalQueue<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            added: Notify::new(),
        }
    }

    /// Append an element and wake every parked taker.
    pub fn add(&self, item: T) -> Result<(), QueueError> {
        self.items
            .lock()
            .map_err(|_| QueueError::Poisoned)?
            .push_back(item);
        self.added.notify_waiters();
        Ok(())
    }

    /// Append an element after removing the earliest element satisfying
    /// `matches`. Returns the displaced element, if any. The swap is atomic
    /// with respect to concurrent takers.
    pub fn add_unique<F>(&self, mut matches: F, item: T) -> Result<Option<T>, QueueError>
    where
        F: FnMut(&T) -> bool,
    {
        let displaced = {
            let mut items = self.items.lock().map_err(|_| QueueError::Poisoned)?;
            let displaced = items
                .iter()
                .position(|existing| matches(existing))
                .and_then(|pos| items.remove(pos));
            items.push_back(item);
            displaced
        };
        self.added.notify_waiters();
        Ok(displaced)
    }

    /// Remove and return the earliest-inserted element satisfying
    /// `matches`, waiting for one to be added if necessary.
    pub async fn take<F>(&self, mut matches: F) -> Result<T, QueueError>
    where
        F: FnMut(&T) -> bool,
    {
        loop {
            // Register for wakeups before scanning, so an add that lands
            // between the scan and the await still wakes this taker.
            let notified = self.added.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(item) = self.try_take(&mut matches)? {
                return Ok(item);
            }
            notified.await;
        }
    }

    /// As [`take`](Self::take), bounded by `timeout`. Returns `Ok(None)`
    /// on expiry.
    pub async fn poll<F>(&self, timeout: Duration, matches: F) -> Result<Option<T>, QueueError>
    where
        F: FnMut(&T) -> bool,
    {
        match tokio::time::timeout(timeout, self.take(matches)).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Non-blocking variant: remove the earliest match, if one is present.
    pub fn try_take<F>(&self, mut matches: F) -> Result<Option<T>, QueueError>
    where
        F: FnMut(&T) -> bool,
    {
        let mut items = self.items.lock().map_err(|_| QueueError::Poisoned)?;
        Ok(items
            .iter()
            .position(|item| matches(item))
            .and_then(|pos| items.remove(pos)))
    }

    /// Remove the earliest element satisfying `matches` without waiting.
    pub fn remove_if<F>(&self, matches: F) -> Result<Option<T>, QueueError>
    where
        F: FnMut(&T) -> bool,
    {
        self.try_take(matches)
    }

    pub fn len(&self) -> Result<usize, QueueError> {
        Ok(self.items.lock().map_err(|_| QueueError::Poisoned)?.len())
    }

    pub fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.len()? == 0)
    }
}

impl<T: PartialEq> ConditionalQueue<T> {
    /// Remove the first element equal to `item`. Returns whether anything
    /// was removed.
    pub fn remove(&self, item: &T) -> Result<bool, QueueError> {
        Ok(self.remove_if(|existing| existing == item)?.is_some())
    }

    pub fn contains(&self, item: &T) -> Result<bool, QueueError> {
        Ok(self
            .items
            .lock()
            .map_err(|_| QueueError::Poisoned)?
            .iter()
            .any(|existing| existing == item))
    }
}

impl<T: Clone> ConditionalQueue<T> {
    /// Snapshot of the queue contents in insertion order.
    pub fn snapshot(&self) -> Result<Vec<T>, QueueError> {
        Ok(self
            .items
            .lock()
            .map_err(|_| QueueError::Poisoned)?
            .iter()
            .cloned()
            .collect())
    }
}

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
