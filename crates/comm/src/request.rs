//! Request lifecycle.
//!
//! A [`Request`] wraps one outbound message for one PDP and drives it to an
//! outcome. It owns the message's mailbox token, its response timer, and its
//! response-handler registration.
//!
//! # State Machine
//!
//! ```text
//!                  start_publishing()
//!   ┌──────┐  ─────────────────────────►  ┌────────────┐
//!   │ Idle │                              │ Publishing │◄──┐ timeout: still queued
//!   └──────┘  ◄─────────────────────────  └────────────┘───┘ (retry count reset)
//!              stop_publishing() /              │   │
//!              reconfigure() while idle         │   └── timeout: retries left
//!                                               │       (re-publish, count + 1)
//!                     ┌─────────────────────────┼────────────────────┐
//!                     ▼                         ▼                    ▼
//!              ┌───────────┐            ┌────────────┐      ┌────────────────┐
//!              │ Completed │            │ Mismatched │      │ RetryExhausted │
//!              └───────────┘            └────────────┘      └────────────────┘
//!              response passes          response fails       timeout, no
//!              its check                its check            retries left
//! ```
//!
//! A request never decides what happens next; it reports an outcome to its
//! owner ([`crate::PdpRequestMap`]), which advances the PDP's queue or
//! escalates.
//!
//! # Staleness
//!
//! Every call to [`Request::start_publishing`] begins a new *publication*.
//! Timer and response callbacks carry the publication they were armed for, so a
//! callback that raced with a stop or reconfiguration is recognized and
//! dropped.

use std::fmt;
use std::sync::{Arc, Weak};

use pap_common::{
    MessageKind, PdpHealthCheck, PdpMessage, PdpState, PdpStateChange, PdpStatus, PdpUpdate,
    PolicyIdent, ToscaPolicy,
};
use pap_notification::PolicyNotifier;
use tracing::{debug, info};

use crate::dispatcher::ResponseDispatcher;
use crate::metrics::CommMetrics;
use crate::publisher::{MessageToken, Publisher};
use crate::timer::{Timer, TimerManager};
use crate::token::QueueToken;

/// Lifecycle state of a [`Request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestState {
    Idle,
    Publishing,
    Completed,
    Mismatched,
    RetryExhausted,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestState::Completed | RequestState::Mismatched | RequestState::RetryExhausted
        )
    }
}

/// Why a response failed its request's check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mismatch {
    pub reason: String,
    /// Policies the PDP failed to deploy; candidates for administrative undeploy.
    pub undeploy: Vec<PolicyIdent>,
}

impl Mismatch {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            undeploy: Vec::new(),
        }
    }
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason)
    }
}

/// Per-kind behavior shared by every request.
pub trait RequestBehavior {
    fn kind(&self) -> MessageKind;

    /// Publishing priority within one PDP's queue; lower values go first.
    fn priority(&self) -> u8;

    /// True if `other` would tell the PDP exactly the same thing.
    fn is_same_content(&self, other: &PdpMessage) -> bool;

    /// Validates a PDP's response.
    fn check_response(
        &self,
        response: &PdpStatus,
        notifier: &PolicyNotifier,
    ) -> Result<(), Mismatch>;
}

fn check_name(expected: Option<&str>, response: &PdpStatus) -> Result<(), Mismatch> {
    match response.name.as_deref() {
        None => Err(Mismatch::new("null PDP name")),
        Some(name) if Some(name) != expected => Err(Mismatch::new("PDP name does not match")),
        Some(_) => Ok(()),
    }
}

fn same_policies(a: &[ToscaPolicy], b: &[ToscaPolicy]) -> bool {
    a.len() == b.len() && a.iter().all(|policy| b.contains(policy))
}

impl RequestBehavior for PdpUpdate {
    fn kind(&self) -> MessageKind {
        MessageKind::Update
    }

    fn priority(&self) -> u8 {
        1
    }

    fn is_same_content(&self, other: &PdpMessage) -> bool {
        let PdpMessage::Update(other) = other else {
            return false;
        };
        self.name == other.name
            && self.pdp_group == other.pdp_group
            && self.pdp_subgroup == other.pdp_subgroup
            && same_policies(&self.policies_to_be_deployed, &other.policies_to_be_deployed)
            && self.undeploy_idents() == other.undeploy_idents()
    }

    fn check_response(
        &self,
        response: &PdpStatus,
        notifier: &PolicyNotifier,
    ) -> Result<(), Mismatch> {
        check_name(self.name.as_deref(), response)?;

        let expected = self.deploy_idents();
        let actual = response.policy_set();
        if let Some(name) = self.name.as_deref() {
            notifier.process_response(name, self.pdp_group.as_deref(), &expected, &actual);
        }

        if response.pdp_group != self.pdp_group {
            return Err(Mismatch::new("group does not match"));
        }
        if response.pdp_subgroup != self.pdp_subgroup {
            return Err(Mismatch::new("subgroup does not match"));
        }
        if self.pdp_subgroup.is_none() {
            // the PDP is being removed from its group; its policies no longer matter
            return Ok(());
        }

        let mut missing: Vec<PolicyIdent> = expected.difference(&actual).cloned().collect();
        let lingering = self
            .policies_to_be_undeployed
            .iter()
            .any(|policy| actual.contains(policy));
        if missing.is_empty() && !lingering {
            return Ok(());
        }

        missing.sort();
        Err(Mismatch {
            reason: "policies do not match".to_string(),
            undeploy: missing,
        })
    }
}

impl RequestBehavior for PdpStateChange {
    fn kind(&self) -> MessageKind {
        MessageKind::StateChange
    }

    fn priority(&self) -> u8 {
        // activate only after policies are in place; deactivate before touching them
        if self.state == PdpState::Active {
            2
        } else {
            0
        }
    }

    fn is_same_content(&self, other: &PdpMessage) -> bool {
        let PdpMessage::StateChange(other) = other else {
            return false;
        };
        self.name == other.name && self.state == other.state
    }

    fn check_response(
        &self,
        response: &PdpStatus,
        _notifier: &PolicyNotifier,
    ) -> Result<(), Mismatch> {
        check_name(self.name.as_deref(), response)?;
        if response.state != self.state {
            return Err(Mismatch::new(format!(
                "state is {}, but expected {}",
                response.state, self.state
            )));
        }
        Ok(())
    }
}

impl RequestBehavior for PdpHealthCheck {
    fn kind(&self) -> MessageKind {
        MessageKind::HealthCheck
    }

    fn priority(&self) -> u8 {
        3
    }

    fn is_same_content(&self, other: &PdpMessage) -> bool {
        matches!(other, PdpMessage::HealthCheck(other) if other.name == self.name)
    }

    fn check_response(
        &self,
        response: &PdpStatus,
        _notifier: &PolicyNotifier,
    ) -> Result<(), Mismatch> {
        check_name(self.name.as_deref(), response)
    }
}

impl RequestBehavior for PdpMessage {
    fn kind(&self) -> MessageKind {
        PdpMessage::kind(self)
    }

    fn priority(&self) -> u8 {
        match self {
            PdpMessage::Update(m) => m.priority(),
            PdpMessage::StateChange(m) => m.priority(),
            PdpMessage::HealthCheck(m) => m.priority(),
        }
    }

    fn is_same_content(&self, other: &PdpMessage) -> bool {
        match self {
            PdpMessage::Update(m) => m.is_same_content(other),
            PdpMessage::StateChange(m) => m.is_same_content(other),
            PdpMessage::HealthCheck(m) => m.is_same_content(other),
        }
    }

    fn check_response(
        &self,
        response: &PdpStatus,
        notifier: &PolicyNotifier,
    ) -> Result<(), Mismatch> {
        match self {
            PdpMessage::Update(m) => m.check_response(response, notifier),
            PdpMessage::StateChange(m) => m.check_response(response, notifier),
            PdpMessage::HealthCheck(m) => m.check_response(response, notifier),
        }
    }
}

/// Folds a pending UPDATE into its replacement so no delta is lost.
fn merge_updates(old: &PdpUpdate, mut new: PdpUpdate) -> PdpUpdate {
    let deploy = new.deploy_idents();
    let undeploy = new.undeploy_idents();

    for policy in &old.policies_to_be_deployed {
        let ident = policy.identifier();
        if !deploy.contains(&ident) && !undeploy.contains(&ident) {
            new.policies_to_be_deployed.push(policy.clone());
        }
    }
    for ident in &old.policies_to_be_undeployed {
        if !deploy.contains(ident) && !undeploy.contains(ident) {
            new.policies_to_be_undeployed.push(ident.clone());
        }
    }
    new
}

/// Shared machinery a request publishes through.
#[derive(Clone)]
pub(crate) struct RequestParams {
    pub publisher: Arc<Publisher<PdpMessage>>,
    pub dispatcher: Arc<ResponseDispatcher>,
    pub timers: Arc<TimerManager>,
    pub notifier: Arc<PolicyNotifier>,
    pub metrics: Arc<CommMetrics>,
    pub max_retry_count: u32,
}

/// Identifies one publication of one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RequestKey {
    pub pdp: String,
    pub queue_id: u64,
    pub kind: MessageKind,
    pub publication: u64,
}

/// Receiver of a request's timer and response callbacks.
pub(crate) trait RequestEvents: Send + Sync {
    fn response_received(&self, key: RequestKey, response: &PdpStatus);
    fn timer_expired(&self, key: RequestKey);
}

/// Outcome of delivering a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ResponseOutcome {
    /// The callback belongs to an earlier publication.
    Stale,
    Completed,
    Mismatched(Mismatch),
}

/// Outcome of a timer expiring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimeoutOutcome {
    Stale,
    /// The message had not even been sent; the timer was re-armed.
    StillQueued,
    Republished,
    Exhausted,
}

/// One outbound message to one PDP, with its retry state.
pub struct Request {
    name: String,
    params: RequestParams,
    pdp: String,
    queue_id: u64,
    events: Weak<dyn RequestEvents>,
    message: Arc<PdpMessage>,
    state: RequestState,
    retry_count: u32,
    publication: u64,
    token: Option<MessageToken<PdpMessage>>,
    timer: Option<Timer>,
    undeploy_policies: Vec<PolicyIdent>,
}

impl Request {
    pub(crate) fn new(
        params: RequestParams,
        pdp: String,
        queue_id: u64,
        events: Weak<dyn RequestEvents>,
        message: PdpMessage,
    ) -> Self {
        Self {
            name: format!("{} {}", pdp, message.kind().type_name()),
            params,
            pdp,
            queue_id,
            events,
            message: Arc::new(message),
            state: RequestState::Idle,
            retry_count: 0,
            publication: 0,
            token: None,
            timer: None,
            undeploy_policies: Vec::new(),
        }
    }

    /// Display name, e.g. `"pdp-1 PdpUpdate"`.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> MessageKind {
        self.message.kind()
    }

    pub fn priority(&self) -> u8 {
        self.message.priority()
    }

    pub fn message(&self) -> &Arc<PdpMessage> {
        &self.message
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    pub fn is_publishing(&self) -> bool {
        self.state == RequestState::Publishing
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Policies to undeploy after a failed UPDATE.
    pub fn undeploy_policies(&self) -> &[PolicyIdent] {
        &self.undeploy_policies
    }

    pub(crate) fn publication(&self) -> u64 {
        self.publication
    }

    #[cfg(test)]
    pub(crate) fn token(&self) -> Option<&MessageToken<PdpMessage>> {
        self.token.as_ref()
    }

    fn key(&self) -> RequestKey {
        RequestKey {
            pdp: self.pdp.clone(),
            queue_id: self.queue_id,
            kind: self.kind(),
            publication: self.publication,
        }
    }

    fn is_current(&self, publication: u64) -> bool {
        self.is_publishing() && self.publication == publication
    }

    /// True if the current message is still waiting in the publisher queue.
    fn is_in_queue(&self) -> bool {
        self.token
            .as_ref()
            .and_then(|token| token.get())
            .is_some_and(|queued| Arc::ptr_eq(&queued, &self.message))
    }

    /// Starts publishing, optionally taking over another request's token.
    ///
    /// A token handed over while this request already holds one is emptied,
    /// since only one of them may carry a message.
    pub(crate) fn start_publishing(&mut self, token: Option<MessageToken<PdpMessage>>) {
        if let Some(token) = token {
            match &self.token {
                None => self.token = Some(token),
                Some(own) if Arc::ptr_eq(own, &token) => {}
                Some(_) => {
                    token.replace(None);
                }
            }
        }

        if self.is_publishing() {
            debug!(request = %self.name, "already publishing");
            return;
        }

        self.publication += 1;
        self.retry_count = 0;
        self.undeploy_policies.clear();
        self.state = RequestState::Publishing;

        self.register_handler();
        self.start_timer();
        self.enqueue();
        debug!(request = %self.name, request_id = %self.message.request_id(), "publishing");
    }

    /// Stops publishing, returning the token for reuse unless it is withdrawn
    /// from the queue.
    pub(crate) fn stop_publishing(
        &mut self,
        remove_from_queue: bool,
    ) -> Option<MessageToken<PdpMessage>> {
        if self.is_publishing() {
            self.disarm();
            self.state = RequestState::Idle;
        }

        if remove_from_queue {
            if let Some(token) = self.token.take() {
                token.replace(None);
            }
            return None;
        }
        self.token.take()
    }

    /// Swaps in a new message of the same kind.
    ///
    /// Returns false if `message` is of a different kind. Identical content is
    /// a no-op; otherwise the retry count resets and, if the request was
    /// publishing, the new message takes the old one's place in the queue.
    pub(crate) fn reconfigure(&mut self, message: PdpMessage) -> bool {
        if message.kind() != self.kind() {
            return false;
        }
        if self.message.is_same_content(&message) {
            debug!(request = %self.name, "message content unchanged");
            return true;
        }

        let message = match (&*self.message, message) {
            (PdpMessage::Update(old), PdpMessage::Update(new)) => {
                PdpMessage::Update(merge_updates(old, new))
            }
            (_, message) => message,
        };

        let was_publishing = self.is_publishing();
        let token = self.stop_publishing(false);

        info!(request = %self.name, request_id = %message.request_id(), "reconfigured");
        self.message = Arc::new(message);
        self.retry_count = 0;
        self.undeploy_policies.clear();
        if self.state.is_terminal() {
            self.state = RequestState::Idle;
        }

        if was_publishing {
            self.start_publishing(token);
        } else {
            self.token = token;
        }
        true
    }

    pub(crate) fn handle_response(
        &mut self,
        publication: u64,
        response: &PdpStatus,
    ) -> ResponseOutcome {
        if !self.is_current(publication) {
            return ResponseOutcome::Stale;
        }

        self.disarm();
        match self.message.check_response(response, &self.params.notifier) {
            Ok(()) => {
                debug!(request = %self.name, "completed");
                self.state = RequestState::Completed;
                ResponseOutcome::Completed
            }
            Err(mismatch) => {
                info!(request = %self.name, reason = %mismatch, "response mismatch");
                self.params.metrics.mismatches.inc();
                self.state = RequestState::Mismatched;
                self.undeploy_policies = mismatch.undeploy.clone();
                ResponseOutcome::Mismatched(mismatch)
            }
        }
    }

    pub(crate) fn handle_timeout(&mut self, publication: u64) -> TimeoutOutcome {
        if !self.is_current(publication) {
            return TimeoutOutcome::Stale;
        }
        self.timer = None;

        if self.is_in_queue() {
            // the clock did not really run while the message sat in the queue
            info!(request = %self.name, "timeout - request still in the queue");
            self.retry_count = 0;
            self.start_timer();
            return TimeoutOutcome::StillQueued;
        }

        if self.retry_count >= self.params.max_retry_count {
            info!(
                request = %self.name,
                retries = self.retry_count,
                "timeout - retry count exhausted"
            );
            self.params.metrics.retries_exhausted.inc();
            self.stop_publishing(true);
            self.state = RequestState::RetryExhausted;
            return TimeoutOutcome::Exhausted;
        }

        self.retry_count += 1;
        info!(request = %self.name, retry = self.retry_count, "timeout - re-publish");
        self.params.metrics.retries.inc();
        self.start_timer();
        self.enqueue();
        TimeoutOutcome::Republished
    }

    fn register_handler(&self) {
        let key = self.key();
        let events = self.events.clone();
        self.params.dispatcher.register(
            self.message.request_id(),
            Arc::new(move |response: &PdpStatus| {
                if let Some(events) = events.upgrade() {
                    events.response_received(key.clone(), response);
                }
            }),
        );
    }

    fn start_timer(&mut self) {
        let key = self.key();
        let events = self.events.clone();
        self.timer = Some(self.params.timers.register(
            self.message.request_id(),
            Box::new(move |_: &str| {
                if let Some(events) = events.upgrade() {
                    events.timer_expired(key);
                }
            }),
        ));
    }

    fn disarm(&mut self) {
        self.params.dispatcher.unregister(self.message.request_id());
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }

    /// Queues the current message, reusing the held token if it is still queued.
    fn enqueue(&mut self) {
        if let Some(token) = &self.token {
            if token.replace(Some(Arc::clone(&self.message))).is_some() {
                return;
            }
            // already taken by the publisher, so the token has left its queue
            token.replace(None);
        }

        let token = Arc::new(QueueToken::new(Arc::clone(&self.message)));
        self.params.publisher.enqueue(Arc::clone(&token));
        self.token = Some(token);
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        if self.is_publishing() {
            self.disarm();
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("retry_count", &self.retry_count)
            .field("request_id", &self.message.request_id())
            .finish()
    }
}
