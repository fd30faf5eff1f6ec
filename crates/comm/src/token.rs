//! Single-slot mailbox tokens.
//!
//! A [`QueueToken`] is what actually sits in the [`Publisher`](crate::Publisher)
//! queue. The producer keeps a reference to the token it enqueued and may
//! swap the pending item with [`QueueToken::replace`] until the publisher takes
//! it. Once taken, a token is permanently empty and every further `replace` is
//! a no-op; the producer must allocate a new token to be queued again.
//!
//! This lets a request that changes its message "steal" its existing place in
//! the queue rather than queueing a second copy:
//!
//! ```rust
//! use pap_comm::QueueToken;
//!
//! let token = QueueToken::new("v1");
//! assert_eq!(token.replace(Some("v2")), Some("v1")); // still queued: swapped
//! assert_eq!(token.take(), Some("v2"));              // publisher drains it
//! assert_eq!(token.replace(Some("v3")), None);       // too late: no-op
//! assert!(token.is_empty());
//! ```

use parking_lot::Mutex;

/// Overwrite-in-place cell holding at most one queued item.
#[derive(Debug)]
pub struct QueueToken<T> {
    item: Mutex<Option<T>>,
}

impl<T> QueueToken<T> {
    pub fn new(item: T) -> Self {
        Self {
            item: Mutex::new(Some(item)),
        }
    }

    /// An already-empty token; queueing it transmits nothing.
    pub fn empty() -> Self {
        Self {
            item: Mutex::new(None),
        }
    }

    /// Replaces the pending item, returning the previous one.
    ///
    /// If the token is already empty nothing is stored and `None` is returned.
    pub fn replace(&self, item: Option<T>) -> Option<T> {
        let mut slot = self.item.lock();
        if slot.is_none() {
            return None;
        }
        std::mem::replace(&mut *slot, item)
    }

    /// Takes the pending item, leaving the token permanently empty.
    pub fn take(&self) -> Option<T> {
        self.item.lock().take()
    }

    pub fn is_empty(&self) -> bool {
        self.item.lock().is_none()
    }
}

impl<T: Clone> QueueToken<T> {
    /// Returns a copy of the pending item.
    pub fn get(&self) -> Option<T> {
        self.item.lock().clone()
    }
}
