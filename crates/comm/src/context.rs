//! Shared machinery of one dispatch engine.

use std::sync::Arc;

use pap_common::{MessageKind, PdpMessage, TopologyStore};
use pap_notification::PolicyNotifier;

use crate::config::{CommConfig, RequestKindConfig};
use crate::dispatcher::ResponseDispatcher;
use crate::metrics::CommMetrics;
use crate::publisher::{Publisher, TopicSink};
use crate::request::RequestParams;
use crate::timer::TimerManager;

/// Everything the fleet table, heartbeat tracker, and status handler share.
///
/// Built once at startup and passed to each component's constructor; the
/// background loops (publisher and timers) are started by the owner.
pub struct CommContext {
    pub config: CommConfig,
    pub publisher: Arc<Publisher<PdpMessage>>,
    pub dispatcher: Arc<ResponseDispatcher>,
    pub update_timers: Arc<TimerManager>,
    pub state_change_timers: Arc<TimerManager>,
    pub health_check_timers: Arc<TimerManager>,
    pub topology: Arc<dyn TopologyStore>,
    pub notifier: Arc<PolicyNotifier>,
    pub metrics: Arc<CommMetrics>,
}

impl CommContext {
    pub fn new(
        config: CommConfig,
        pdp_topic: impl Into<String>,
        sink: Arc<dyn TopicSink>,
        topology: Arc<dyn TopologyStore>,
        notifier: Arc<PolicyNotifier>,
    ) -> Self {
        Self::with_metrics(
            config,
            pdp_topic,
            sink,
            topology,
            notifier,
            Arc::new(CommMetrics::new()),
        )
    }

    /// Like [`CommContext::new`], counting into existing `metrics`.
    pub fn with_metrics(
        config: CommConfig,
        pdp_topic: impl Into<String>,
        sink: Arc<dyn TopicSink>,
        topology: Arc<dyn TopologyStore>,
        notifier: Arc<PolicyNotifier>,
        metrics: Arc<CommMetrics>,
    ) -> Self {
        Self {
            publisher: Arc::new(Publisher::new(pdp_topic, sink, Arc::clone(&metrics))),
            dispatcher: Arc::new(ResponseDispatcher::new(Arc::clone(&metrics))),
            update_timers: TimerManager::new("update", config.update.max_wait),
            state_change_timers: TimerManager::new("state-change", config.state_change.max_wait),
            health_check_timers: TimerManager::new("health-check", config.health_check.max_wait),
            topology,
            notifier,
            metrics,
            config,
        }
    }

    pub fn timers(&self, kind: MessageKind) -> &Arc<TimerManager> {
        match kind {
            MessageKind::Update => &self.update_timers,
            MessageKind::StateChange => &self.state_change_timers,
            MessageKind::HealthCheck => &self.health_check_timers,
        }
    }

    pub fn kind_config(&self, kind: MessageKind) -> RequestKindConfig {
        match kind {
            MessageKind::Update => self.config.update,
            MessageKind::StateChange => self.config.state_change,
            MessageKind::HealthCheck => self.config.health_check,
        }
    }

    pub(crate) fn request_params(&self, kind: MessageKind) -> RequestParams {
        RequestParams {
            publisher: Arc::clone(&self.publisher),
            dispatcher: Arc::clone(&self.dispatcher),
            timers: Arc::clone(self.timers(kind)),
            notifier: Arc::clone(&self.notifier),
            metrics: Arc::clone(&self.metrics),
            max_retry_count: self.kind_config(kind).max_retry_count,
        }
    }

    /// Every timer manager, in [`MessageKind::ALL`] order.
    pub fn all_timers(&self) -> [&Arc<TimerManager>; MessageKind::COUNT] {
        MessageKind::ALL.map(|kind| self.timers(kind))
    }
}
