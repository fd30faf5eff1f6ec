//! Per-PDP request queue.
//!
//! Holds at most one [`Request`] per [`MessageKind`] for a single PDP and
//! guarantees that at most one of them is publishing. After every change the
//! queue is rebalanced: the highest-priority request runs, preempting a
//! lower-priority one by taking over its mailbox token.

use std::sync::{Arc, Weak};

use pap_common::{MessageKind, PdpMessage};
use tracing::debug;

use crate::error::{CommError, Result};
use crate::request::{Request, RequestEvents, RequestParams, RequestState};

/// Why a queue exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOrigin {
    /// Ordinary administrative requests.
    Normal,
    /// Created to push a failed PDP into PASSIVE; failures are not escalated again.
    Disable,
}

/// Point-in-time view of one request.
#[derive(Debug, Clone)]
pub struct RequestSnapshot {
    pub kind: MessageKind,
    pub request_id: String,
    pub state: RequestState,
    pub retry_count: u32,
    pub message: PdpMessage,
}

/// Point-in-time view of one PDP's queue, highest priority first.
#[derive(Debug, Clone)]
pub struct QueueSnapshot {
    pub pdp: String,
    pub origin: QueueOrigin,
    pub requests: Vec<RequestSnapshot>,
}

impl QueueSnapshot {
    /// The request currently publishing, if any.
    pub fn publishing(&self) -> Option<&RequestSnapshot> {
        self.requests
            .iter()
            .find(|r| r.state == RequestState::Publishing)
    }

    pub fn get(&self, kind: MessageKind) -> Option<&RequestSnapshot> {
        self.requests.iter().find(|r| r.kind == kind)
    }
}

/// The outstanding requests of one PDP.
pub struct PdpRequests {
    pdp: String,
    id: u64,
    origin: QueueOrigin,
    params: Arc<[RequestParams; MessageKind::COUNT]>,
    events: Weak<dyn RequestEvents>,
    slots: [Option<Request>; MessageKind::COUNT],
}

impl PdpRequests {
    pub(crate) fn new(
        pdp: String,
        id: u64,
        origin: QueueOrigin,
        params: Arc<[RequestParams; MessageKind::COUNT]>,
        events: Weak<dyn RequestEvents>,
    ) -> Self {
        Self {
            pdp,
            id,
            origin,
            params,
            events,
            slots: [None, None, None],
        }
    }

    pub fn pdp(&self) -> &str {
        &self.pdp
    }

    /// Identity of this queue; a replacement queue for the same PDP gets a new one.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn origin(&self) -> QueueOrigin {
        self.origin
    }

    pub(crate) fn promote(&mut self) {
        self.origin = QueueOrigin::Normal;
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    pub fn get(&self, kind: MessageKind) -> Option<&Request> {
        self.slots[kind.index()].as_ref()
    }

    pub(crate) fn get_mut(&mut self, kind: MessageKind) -> Option<&mut Request> {
        self.slots[kind.index()].as_mut()
    }

    /// Adds a request, or reconfigures the existing request of the same kind.
    pub(crate) fn add_singleton(&mut self, message: PdpMessage) -> Result<()> {
        if message.is_broadcast() {
            return Err(CommError::UnexpectedBroadcast(
                message.kind().type_name().to_string(),
            ));
        }
        if message.name() != Some(self.pdp.as_str()) {
            return Err(CommError::InvalidMessage(format!(
                "{} addressed to {:?} added to queue of {}",
                message.kind().type_name(),
                message.name(),
                self.pdp
            )));
        }

        let index = message.kind().index();
        if let Some(request) = self.slots[index].as_mut() {
            request.reconfigure(message);
        } else {
            self.slots[index] = Some(Request::new(
                self.params[index].clone(),
                self.pdp.clone(),
                self.id,
                self.events.clone(),
                message,
            ));
        }

        self.rebalance();
        Ok(())
    }

    /// Removes the finished request of `kind` and starts the next one.
    ///
    /// A message of the removed request that is still queued is withdrawn.
    /// Returns false once the queue is empty.
    pub(crate) fn start_next_request(&mut self, kind: MessageKind) -> bool {
        if let Some(mut done) = self.slots[kind.index()].take() {
            done.stop_publishing(true);
        }
        self.rebalance();
        !self.is_empty()
    }

    /// Ensures the highest-priority request is the one publishing.
    pub(crate) fn rebalance(&mut self) {
        let Some(top) = self.top_index() else {
            return;
        };
        let publishing = self
            .slots
            .iter()
            .position(|slot| slot.as_ref().is_some_and(Request::is_publishing));

        if publishing == Some(top) {
            return;
        }
        if self.slots[top].as_ref().map(Request::state) != Some(RequestState::Idle) {
            // awaiting the outcome of an undeploy
            return;
        }

        let token = match publishing {
            Some(index) => {
                let current = self.slots[index].as_mut().map(|r| {
                    debug!(request = %r.name(), "preempted");
                    r.stop_publishing(false)
                });
                current.flatten()
            }
            None => None,
        };
        if let Some(request) = self.slots[top].as_mut() {
            request.start_publishing(token);
        }
    }

    /// Stops and discards every request.
    pub(crate) fn stop_publishing(&mut self) {
        for slot in &mut self.slots {
            if let Some(mut request) = slot.take() {
                request.stop_publishing(true);
            }
        }
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let mut requests: Vec<&Request> = self.slots.iter().flatten().collect();
        requests.sort_by_key(|r| r.priority());
        QueueSnapshot {
            pdp: self.pdp.clone(),
            origin: self.origin,
            requests: requests
                .into_iter()
                .map(|r| RequestSnapshot {
                    kind: r.kind(),
                    request_id: r.message().request_id().to_string(),
                    state: r.state(),
                    retry_count: r.retry_count(),
                    message: (**r.message()).clone(),
                })
                .collect(),
        }
    }

    fn top_index(&self) -> Option<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|r| (index, r.priority())))
            .min_by_key(|(_, priority)| *priority)
            .map(|(index, _)| index)
    }
}

impl std::fmt::Debug for PdpRequests {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PdpRequests")
            .field("pdp", &self.pdp)
            .field("id", &self.id)
            .field("origin", &self.origin)
            .field("slots", &self.slots)
            .finish()
    }
}
