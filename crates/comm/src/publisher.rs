//! Queue-backed outbound publisher.
//!
//! A [`Publisher`] owns one outbound topic. Producers enqueue
//! [`QueueToken`]s without blocking; a single background task drains the queue
//! in FIFO order, empties each token, and transmits whatever it held:
//!
//! ```text
//!  Request ──enqueue(token)──►  [ t1 | t2 | t3 ]  ──► run loop ──► TopicSink
//!     │                                                  │
//!     └── token.replace(new msg) while still queued      └── token.take()
//! ```
//!
//! Tokens emptied by their producer are skipped, so withdrawing or replacing a
//! queued message never requires touching the queue itself.
//!
//! [`Publisher::stop`] enqueues an empty token so a parked loop always wakes
//! and exits; it is idempotent.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use pap_notification::{NotificationPublisher, PolicyNotification};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::error::{CommError, Result};
use crate::metrics::CommMetrics;
use crate::token::QueueToken;

/// Outbound transport for one topic.
///
/// Implemented by the message-bus front end. `send` is called from the
/// publisher task only, one message at a time.
pub trait TopicSink: Send + Sync {
    fn send(&self, topic: &str, message: &str) -> Result<()>;
}

/// A queued, replaceable reference to an outbound item.
pub type MessageToken<T> = Arc<QueueToken<Arc<T>>>;

/// Single-consumer publisher for one topic.
pub struct Publisher<T> {
    topic: String,
    sink: Arc<dyn TopicSink>,
    queue_tx: mpsc::UnboundedSender<MessageToken<T>>,
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<MessageToken<T>>>>,
    stopped: AtomicBool,
    metrics: Arc<CommMetrics>,
}

impl<T> Publisher<T>
where
    T: Serialize + Send + Sync + 'static,
{
    pub fn new(
        topic: impl Into<String>,
        sink: Arc<dyn TopicSink>,
        metrics: Arc<CommMetrics>,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Self {
            topic: topic.into(),
            sink,
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            stopped: AtomicBool::new(false),
            metrics,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Queues a token for transmission. Never blocks.
    pub fn enqueue(&self, token: MessageToken<T>) {
        if self.stopped.load(Ordering::Acquire) {
            debug!(topic = %self.topic, "publisher stopped, discarding message");
            return;
        }
        if self.queue_tx.send(token).is_err() {
            debug!(topic = %self.topic, "publisher queue closed, discarding message");
        }
    }

    /// Wraps `item` in a fresh token, queues it, and returns the token.
    pub fn enqueue_item(&self, item: T) -> MessageToken<T> {
        let token = Arc::new(QueueToken::new(Arc::new(item)));
        self.enqueue(token.clone());
        token
    }

    /// Spawns the drain loop.
    ///
    /// Fails if the loop was already started; only one consumer may ever run.
    pub fn start(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        let queue_rx = self
            .queue_rx
            .lock()
            .take()
            .ok_or_else(|| CommError::AlreadyStarted(format!("publisher {}", self.topic)))?;
        Ok(tokio::spawn(Arc::clone(self).run(queue_rx)))
    }

    /// Stops the drain loop. Tokens still queued are not transmitted.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(topic = %self.topic, "stopping publisher");
        // wake the loop if it is parked on an empty queue
        let _ = self.queue_tx.send(Arc::new(QueueToken::empty()));
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    async fn run(self: Arc<Self>, mut queue_rx: mpsc::UnboundedReceiver<MessageToken<T>>) {
        info!(topic = %self.topic, "publisher started");

        while let Some(token) = queue_rx.recv().await {
            if self.stopped.load(Ordering::Acquire) {
                break;
            }
            if let Some(item) = token.take() {
                self.transmit(&item);
            }
        }

        info!(topic = %self.topic, "publisher exited");
    }

    fn transmit(&self, item: &T) {
        let json = match serde_json::to_string(item) {
            Ok(json) => json,
            Err(e) => {
                warn!(topic = %self.topic, error = %e, "cannot encode message");
                self.metrics.publish_failures.inc();
                return;
            }
        };

        match self.sink.send(&self.topic, &json) {
            Ok(()) => {
                trace!(topic = %self.topic, message = %json, "published");
                self.metrics.messages_published.inc();
            }
            Err(e) => {
                warn!(topic = %self.topic, error = %e, "send failed");
                self.metrics.publish_failures.inc();
            }
        }
    }
}

impl NotificationPublisher for Publisher<PolicyNotification> {
    fn publish(&self, notification: PolicyNotification) {
        self.enqueue_item(notification);
    }
}
