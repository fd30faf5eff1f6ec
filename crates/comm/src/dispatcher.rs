//! Correlates PDP responses with the requests that produced them.
//!
//! Every published request registers a handler under its `requestId`. When a
//! status message arrives with `response.responseTo` set, the dispatcher looks
//! up the handler and invokes it. Responses naming an unknown id are dropped:
//! they usually answer a request that has since been superseded.

use std::sync::Arc;

use dashmap::DashMap;
use pap_common::PdpStatus;
use tracing::{debug, trace};

use crate::metrics::CommMetrics;

/// Handler invoked with a correlated response.
pub type ResponseHandler = Arc<dyn Fn(&PdpStatus) + Send + Sync>;

/// Registry of response handlers keyed by request id.
pub struct ResponseDispatcher {
    handlers: DashMap<String, ResponseHandler>,
    metrics: Arc<CommMetrics>,
}

impl ResponseDispatcher {
    pub fn new(metrics: Arc<CommMetrics>) -> Self {
        Self {
            handlers: DashMap::new(),
            metrics,
        }
    }

    /// Registers a handler, replacing any previous one for the same id.
    pub fn register(&self, request_id: impl Into<String>, handler: ResponseHandler) {
        let request_id = request_id.into();
        trace!(request_id = %request_id, "response handler registered");
        self.handlers.insert(request_id, handler);
    }

    /// Removes the handler for `request_id`; returns whether one existed.
    pub fn unregister(&self, request_id: &str) -> bool {
        self.handlers.remove(request_id).is_some()
    }

    pub fn is_registered(&self, request_id: &str) -> bool {
        self.handlers.contains_key(request_id)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Delivers a response to its handler.
    ///
    /// The handler runs after the registry entry is released, so it may
    /// register or unregister handlers itself. Returns true if a handler ran.
    pub fn dispatch(&self, status: &PdpStatus) -> bool {
        let Some(request_id) = status.response_to() else {
            return false;
        };

        let handler = self
            .handlers
            .get(request_id)
            .map(|entry| Arc::clone(entry.value()));

        match handler {
            Some(handler) => {
                self.metrics.responses_matched.inc();
                handler(status);
                true
            }
            None => {
                debug!(request_id, pdp = ?status.name, "ignoring response to unknown request");
                self.metrics.responses_ignored.inc();
                false
            }
        }
    }
}
