//! Lifecycle of the PAP core.
//!
//! [`PapActivator`] builds every component from a [`PapConfig`] and the
//! collaborators supplied by the embedding service, then owns the background
//! tasks:
//!
//! | Task | Count |
//! |------|-------|
//! | PDP topic publisher | 1 |
//! | notification topic publisher | 1 |
//! | timer manager (update, state-change, health-check) | 3 |
//! | heartbeat tracker | 1 |

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pap_comm::{
    CommContext, CommMetrics, HeartbeatTracker, PdpRequestMap, PdpStatusHandler, Publisher,
    TopicSink,
};
use pap_common::{PolicyRepository, TopologyStore};
use pap_notification::{PolicyNotification, PolicyNotifier, StatusRepository};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::PapConfig;

/// External systems the core talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub sink: Arc<dyn TopicSink>,
    pub topology: Arc<dyn TopologyStore>,
    pub policies: Arc<dyn PolicyRepository>,
    pub status_repository: Arc<dyn StatusRepository>,
}

/// Owns the dispatch engine and its background tasks.
pub struct PapActivator {
    ctx: CommContext,
    notification_publisher: Arc<Publisher<PolicyNotification>>,
    requests: PdpRequestMap,
    tracker: Arc<HeartbeatTracker>,
    handler: PdpStatusHandler,
    grace: Duration,
    started: AtomicBool,
    stopped: AtomicBool,
    tasks: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl PapActivator {
    pub fn new(config: &PapConfig, collaborators: Collaborators) -> anyhow::Result<Self> {
        config.validate()?;

        let metrics = Arc::new(CommMetrics::new());
        let notification_publisher = Arc::new(Publisher::new(
            config.topics.notification_topic.clone(),
            Arc::clone(&collaborators.sink),
            Arc::clone(&metrics),
        ));
        let notifier = Arc::new(PolicyNotifier::new(
            collaborators.status_repository,
            notification_publisher.clone(),
        ));

        let ctx = CommContext::with_metrics(
            config.to_comm_config(),
            config.topics.pdp_topic.clone(),
            collaborators.sink,
            collaborators.topology,
            notifier,
            metrics,
        );
        let requests = PdpRequestMap::new(&ctx);
        let tracker = HeartbeatTracker::new(&ctx, requests.clone());
        let handler =
            PdpStatusHandler::new(&ctx, collaborators.policies, requests.clone(), tracker.clone());

        Ok(Self {
            ctx,
            notification_publisher,
            requests,
            tracker,
            handler,
            grace: config.shutdown_grace(),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Spawns every background task. Must be called from within a runtime.
    pub fn start(&self) -> anyhow::Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            anyhow::bail!("activator already started");
        }

        let mut tasks = self.tasks.lock();
        tasks.push((
            format!("publisher {}", self.ctx.publisher.topic()),
            self.ctx.publisher.start()?,
        ));
        tasks.push((
            format!("publisher {}", self.notification_publisher.topic()),
            self.notification_publisher.start()?,
        ));
        for timers in self.ctx.all_timers() {
            tasks.push((format!("timers {}", timers.name()), timers.start()));
        }
        tasks.push(("heartbeat".to_string(), self.tracker.start()));

        tracing::info!(tasks = tasks.len(), "PAP core started");
        Ok(())
    }

    /// Stops every task and waits up to the grace period for them to exit.
    ///
    /// Idempotent; tasks that overrun are logged and detached.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("Stopping PAP core");

        self.tracker.stop();
        for timers in self.ctx.all_timers() {
            timers.stop();
        }
        self.ctx.publisher.stop();
        self.notification_publisher.stop();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        let deadline = Instant::now() + self.grace;
        for (name, handle) in tasks {
            match tokio::time::timeout_at(deadline, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(task = %name, error = %e, "task ended abnormally"),
                Err(_) => tracing::warn!(
                    task = %name,
                    grace_ms = self.grace.as_millis() as u64,
                    "task did not exit within grace period"
                ),
            }
        }
        tracing::info!("PAP core stopped");
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::Acquire) && !self.stopped.load(Ordering::Acquire)
    }

    /// The fleet dispatch table, for submitting requests.
    pub fn requests(&self) -> &PdpRequestMap {
        &self.requests
    }

    /// Entry point for messages read from the PDP topic.
    pub fn status_handler(&self) -> &PdpStatusHandler {
        &self.handler
    }

    pub fn notifier(&self) -> &Arc<PolicyNotifier> {
        &self.ctx.notifier
    }

    pub fn context(&self) -> &CommContext {
        &self.ctx
    }
}
