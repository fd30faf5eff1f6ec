//! Uniform-duration timers.
//!
//! A [`TimerManager`] serves one purpose (for example UPDATE response
//! timeouts) with one fixed wait. Because every timer in a manager has the same
//! duration, registration order is expiry order and the pending set is a
//! simple insertion-ordered queue:
//!
//! ```text
//!   register("a") register("b") register("a")
//!        │             │             │
//!        ▼             ▼             ▼
//!   [a@t0]  →  [a@t0, b@t1]  →  [b@t1, a@t2]     (re-registering moves to the back)
//! ```
//!
//! A single loop sleeps until the head expires, removes it, and only then runs
//! its callback. [`Timer::cancel`] removes a pending timer; when it races with
//! the loop, whichever removes the entry first wins and the other side sees
//! nothing to do.
//!
//! Callbacks run on the timer task without any manager lock held, so they may
//! register new timers.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

/// Callback run when a timer expires; receives the timer's name.
pub type TimerCallback = Box<dyn FnOnce(&str) + Send>;

struct TimerEntry {
    name: String,
    expires: Instant,
    callback: TimerCallback,
}

#[derive(Default)]
struct TimerQueue {
    /// Pending timers keyed by registration sequence.
    by_seq: BTreeMap<u64, TimerEntry>,
    /// Name to sequence of the pending timer with that name.
    by_name: HashMap<String, u64>,
    next_seq: u64,
}

impl TimerQueue {
    fn remove_seq(&mut self, seq: u64) -> Option<TimerEntry> {
        let entry = self.by_seq.remove(&seq)?;
        self.by_name.remove(&entry.name);
        Some(entry)
    }
}

/// Collection of same-duration timers served by one background loop.
pub struct TimerManager {
    name: String,
    wait: Duration,
    queue: Mutex<TimerQueue>,
    wakeup: Notify,
    shutdown: CancellationToken,
}

impl TimerManager {
    pub fn new(name: impl Into<String>, wait: Duration) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            wait,
            queue: Mutex::new(TimerQueue::default()),
            wakeup: Notify::new(),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn wait(&self) -> Duration {
        self.wait
    }

    /// Registers a timer, replacing any pending timer with the same name.
    pub fn register(self: &Arc<Self>, name: impl Into<String>, callback: TimerCallback) -> Timer {
        let name = name.into();
        let seq = {
            let mut queue = self.queue.lock();
            if let Some(old) = queue.by_name.get(&name).copied() {
                queue.remove_seq(old);
            }

            let seq = queue.next_seq;
            queue.next_seq += 1;
            queue.by_name.insert(name.clone(), seq);
            queue.by_seq.insert(
                seq,
                TimerEntry {
                    name: name.clone(),
                    expires: Instant::now() + self.wait,
                    callback,
                },
            );
            seq
        };

        trace!(manager = %self.name, timer = %name, "timer registered");
        self.wakeup.notify_one();

        Timer {
            manager: Arc::downgrade(self),
            name,
            seq,
        }
    }

    /// Number of pending timers.
    pub fn len(&self) -> usize {
        self.queue.lock().by_seq.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn cancel(&self, name: &str, seq: u64) -> bool {
        let mut queue = self.queue.lock();
        if queue.by_name.get(name) != Some(&seq) {
            return false;
        }
        queue.remove_seq(seq).is_some()
    }

    /// Spawns the expiry loop.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(self).run())
    }

    /// Stops the loop and discards pending timers. Idempotent.
    pub fn stop(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        info!(manager = %self.name, "stopping timer manager");
        self.shutdown.cancel();
        let mut queue = self.queue.lock();
        queue.by_seq.clear();
        queue.by_name.clear();
    }

    async fn run(self: Arc<Self>) {
        debug!(
            manager = %self.name,
            wait_ms = self.wait.as_millis() as u64,
            "timer manager started"
        );

        loop {
            let head = self.queue.lock().by_seq.values().next().map(|e| e.expires);

            match head {
                None => {
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = self.wakeup.notified() => continue,
                    }
                }
                Some(expires) => {
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = self.wakeup.notified() => continue,
                        _ = tokio::time::sleep_until(expires) => {}
                    }
                }
            }

            let expired = {
                let mut queue = self.queue.lock();
                let head = queue
                    .by_seq
                    .iter()
                    .next()
                    .filter(|(_, entry)| entry.expires <= Instant::now())
                    .map(|(seq, _)| *seq);
                head.and_then(|seq| queue.remove_seq(seq))
            };

            if let Some(entry) = expired {
                debug!(manager = %self.name, timer = %entry.name, "timer expired");
                (entry.callback)(&entry.name);
            }
        }

        debug!(manager = %self.name, "timer manager exited");
    }
}

/// Handle to a registered timer.
#[derive(Debug)]
pub struct Timer {
    manager: Weak<TimerManager>,
    name: String,
    seq: u64,
}

impl Timer {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cancels the timer if it is still pending.
    ///
    /// Returns false if it already fired, was replaced by a same-named
    /// registration, or was cancelled before.
    pub fn cancel(&self) -> bool {
        match self.manager.upgrade() {
            Some(manager) => manager.cancel(&self.name, self.seq),
            None => false,
        }
    }
}
