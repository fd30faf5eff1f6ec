//! Fleet dispatch table.
//!
//! [`PdpRequestMap`] maps each PDP name to its [`PdpRequests`] queue and is the
//! single place request outcomes are acted upon:
//!
//! | outcome                              | action                                    |
//! |--------------------------------------|-------------------------------------------|
//! | response passes its check            | start the PDP's next request              |
//! | UPDATE mismatch naming policies      | undeploy those policies, then continue    |
//! |                                      | (an undeploy failure is only logged)      |
//! | any other mismatch, retries run out  | disable the PDP                           |
//!
//! Disabling a PDP discards its queue, removes it from its ACTIVE group, and
//! submits a PASSIVE state change (plus an empty UPDATE when the group removal
//! succeeded). Failures of those disable requests are logged and the PDP is
//! dropped from the table rather than disabled again.
//!
//! # Locking
//!
//! One mutex guards the whole table. Timer and response callbacks take it on
//! entry; collaborator calls (topology store, undeployer) are made after it is
//! released and their results re-validated against the queue identity when it
//! is re-acquired.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use pap_common::{
    MessageKind, PdpHealthCheck, PdpMessage, PdpState, PdpStateChange, PdpStatus, PdpUpdate,
    PolicyIdent, TopologyStore,
};
use pap_notification::PolicyNotifier;
use tracing::{debug, info, warn};

use crate::context::CommContext;
use crate::error::{CommError, Result};
use crate::metrics::CommMetrics;
use crate::pdp_requests::{PdpRequests, QueueOrigin, QueueSnapshot};
use crate::request::{RequestEvents, RequestKey, RequestParams, ResponseOutcome, TimeoutOutcome};

/// Removes policies from the fleet after a PDP failed to deploy them.
///
/// Called without any table lock held; implementations may submit new
/// requests to the table.
pub trait PolicyUndeployer: Send + Sync {
    fn undeploy(&self, policies: &[PolicyIdent]) -> pap_common::Result<()>;
}

struct MapState {
    queues: HashMap<String, PdpRequests>,
    next_queue_id: u64,
}

/// Work decided under the lock and carried out after releasing it.
enum FollowUp {
    Undeploy {
        pdp: String,
        queue_id: u64,
        kind: MessageKind,
        message: Arc<PdpMessage>,
        policies: Vec<PolicyIdent>,
        undeployer: Arc<dyn PolicyUndeployer>,
    },
    Disable {
        pdp: String,
    },
}

struct MapShared {
    state: Mutex<MapState>,
    params: Arc<[RequestParams; MessageKind::COUNT]>,
    topology: Arc<dyn TopologyStore>,
    notifier: Arc<PolicyNotifier>,
    metrics: Arc<CommMetrics>,
    undeployer: RwLock<Option<Arc<dyn PolicyUndeployer>>>,
    self_ref: Weak<MapShared>,
}

/// Table of outstanding requests across the PDP fleet.
///
/// Cheap to clone; clones share the same table.
#[derive(Clone)]
pub struct PdpRequestMap {
    shared: Arc<MapShared>,
}

impl PdpRequestMap {
    pub fn new(ctx: &CommContext) -> Self {
        let params = Arc::new(MessageKind::ALL.map(|kind| ctx.request_params(kind)));
        let shared = Arc::new_cyclic(|self_ref| MapShared {
            state: Mutex::new(MapState {
                queues: HashMap::new(),
                next_queue_id: 1,
            }),
            params,
            topology: Arc::clone(&ctx.topology),
            notifier: Arc::clone(&ctx.notifier),
            metrics: Arc::clone(&ctx.metrics),
            undeployer: RwLock::new(None),
            self_ref: self_ref.clone(),
        });
        Self { shared }
    }

    /// Installs the handler for policies a PDP failed to deploy.
    pub fn set_undeployer(&self, undeployer: Arc<dyn PolicyUndeployer>) {
        *self.shared.undeployer.write() = Some(undeployer);
    }

    /// Submits an UPDATE and/or STATE-CHANGE for one PDP.
    ///
    /// Both messages are validated before either is added. When activating,
    /// the UPDATE is added first so policies are in place before the PDP goes
    /// ACTIVE; otherwise the STATE-CHANGE goes first.
    pub fn add_request(
        &self,
        update: Option<PdpUpdate>,
        state_change: Option<PdpStateChange>,
    ) -> Result<()> {
        let update = update.map(PdpMessage::from);
        let state_change = state_change.map(PdpMessage::from);
        for message in update.iter().chain(state_change.iter()) {
            validate(message)?;
        }

        let activating = matches!(
            &state_change,
            Some(PdpMessage::StateChange(sc)) if sc.state == PdpState::Active
        );
        let ordered = if activating {
            [update, state_change]
        } else {
            [state_change, update]
        };

        let mut state = self.shared.state.lock();
        for message in ordered.into_iter().flatten() {
            self.shared.add_locked(&mut state, message, QueueOrigin::Normal)?;
        }
        Ok(())
    }

    pub fn add_update(&self, update: PdpUpdate) -> Result<()> {
        self.add_request(Some(update), None)
    }

    pub fn add_state_change(&self, state_change: PdpStateChange) -> Result<()> {
        self.add_request(None, Some(state_change))
    }

    pub fn add_health_check(&self, health_check: PdpHealthCheck) -> Result<()> {
        let message = PdpMessage::from(health_check);
        validate(&message)?;
        let mut state = self.shared.state.lock();
        self.shared.add_locked(&mut state, message, QueueOrigin::Normal)
    }

    /// Discards every outstanding request of a PDP.
    pub fn stop_publishing(&self, pdp: &str) {
        let removed = self.shared.state.lock().queues.remove(pdp);
        if let Some(mut queue) = removed {
            info!(pdp, "stop publishing requests");
            queue.stop_publishing();
        }
    }

    /// Removes a PDP from whichever ACTIVE group holds it.
    ///
    /// Returns whether a group was changed.
    pub fn remove_from_groups(&self, pdp: &str) -> pap_common::Result<bool> {
        self.shared.remove_from_groups(pdp)
    }

    pub fn is_empty(&self) -> bool {
        self.shared.state.lock().queues.is_empty()
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().queues.len()
    }

    pub fn contains(&self, pdp: &str) -> bool {
        self.shared.state.lock().queues.contains_key(pdp)
    }

    pub fn snapshot_of(&self, pdp: &str) -> Option<QueueSnapshot> {
        self.shared.state.lock().queues.get(pdp).map(PdpRequests::snapshot)
    }

    /// Snapshot of every queue, ordered by PDP name.
    pub fn snapshot(&self) -> Vec<QueueSnapshot> {
        let mut snapshots: Vec<QueueSnapshot> = self
            .shared
            .state
            .lock()
            .queues
            .values()
            .map(PdpRequests::snapshot)
            .collect();
        snapshots.sort_by(|a, b| a.pdp.cmp(&b.pdp));
        snapshots
    }
}

fn validate(message: &PdpMessage) -> Result<()> {
    if message.is_broadcast() {
        return Err(CommError::UnexpectedBroadcast(
            message.kind().type_name().to_string(),
        ));
    }
    Ok(())
}

impl MapShared {
    fn add_locked(
        &self,
        state: &mut MapState,
        message: PdpMessage,
        origin: QueueOrigin,
    ) -> Result<()> {
        validate(&message)?;
        let Some(pdp) = message.name().map(str::to_string) else {
            return Err(CommError::InvalidMessage("message has no PDP name".to_string()));
        };

        let next_id = state.next_queue_id;
        let queue = match state.queues.entry(pdp) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                state.next_queue_id += 1;
                let events: Weak<dyn RequestEvents> = self.self_ref.clone();
                let pdp = entry.key().clone();
                entry.insert(PdpRequests::new(
                    pdp,
                    next_id,
                    origin,
                    Arc::clone(&self.params),
                    events,
                ))
            }
        };
        if origin == QueueOrigin::Normal {
            queue.promote();
        }
        queue.add_singleton(message)
    }

    /// Removes the finished request and advances the queue, dropping it when drained.
    fn complete_locked(&self, state: &mut MapState, pdp: &str, kind: MessageKind) {
        let drained = match state.queues.get_mut(pdp) {
            Some(queue) => !queue.start_next_request(kind),
            None => return,
        };
        if drained {
            debug!(pdp, "no more requests");
            state.queues.remove(pdp);
        }
    }

    /// Discards the PDP's queue if it is still `queue_id`.
    fn disable_locked(&self, state: &mut MapState, pdp: &str, queue_id: u64) -> Option<FollowUp> {
        if state.queues.get(pdp).map(PdpRequests::id) != Some(queue_id) {
            return None;
        }
        let mut queue = state.queues.remove(pdp)?;
        queue.stop_publishing();

        if queue.origin() == QueueOrigin::Disable {
            warn!(pdp, "PDP did not accept disable requests, dropping it");
            return None;
        }
        Some(FollowUp::Disable {
            pdp: pdp.to_string(),
        })
    }

    fn on_response(&self, key: &RequestKey, response: &PdpStatus) -> Option<FollowUp> {
        let mut state = self.state.lock();
        let queue = state
            .queues
            .get_mut(&key.pdp)
            .filter(|queue| queue.id() == key.queue_id)?;
        let origin = queue.origin();
        let request = queue.get_mut(key.kind)?;

        match request.handle_response(key.publication, response) {
            ResponseOutcome::Stale => None,
            ResponseOutcome::Completed => {
                self.complete_locked(&mut state, &key.pdp, key.kind);
                None
            }
            ResponseOutcome::Mismatched(mismatch) => {
                let undeployer = self.undeployer.read().clone();
                match undeployer {
                    Some(undeployer)
                        if !mismatch.undeploy.is_empty() && origin == QueueOrigin::Normal =>
                    {
                        Some(FollowUp::Undeploy {
                            pdp: key.pdp.clone(),
                            queue_id: key.queue_id,
                            kind: key.kind,
                            message: Arc::clone(request.message()),
                            policies: mismatch.undeploy,
                            undeployer,
                        })
                    }
                    _ => self.disable_locked(&mut state, &key.pdp, key.queue_id),
                }
            }
        }
    }

    fn on_timeout(&self, key: &RequestKey) -> Option<FollowUp> {
        let mut state = self.state.lock();
        let queue = state
            .queues
            .get_mut(&key.pdp)
            .filter(|queue| queue.id() == key.queue_id)?;
        let request = queue.get_mut(key.kind)?;

        match request.handle_timeout(key.publication) {
            TimeoutOutcome::Exhausted => self.disable_locked(&mut state, &key.pdp, key.queue_id),
            TimeoutOutcome::Stale
            | TimeoutOutcome::StillQueued
            | TimeoutOutcome::Republished => None,
        }
    }

    fn run(&self, mut follow_up: Option<FollowUp>) {
        while let Some(next) = follow_up.take() {
            follow_up = match next {
                FollowUp::Undeploy {
                    pdp,
                    queue_id,
                    kind,
                    message,
                    policies,
                    undeployer,
                } => self.undeploy(&pdp, queue_id, kind, &message, &policies, undeployer.as_ref()),
                FollowUp::Disable { pdp } => {
                    self.disable(&pdp);
                    None
                }
            };
        }
    }

    fn undeploy(
        &self,
        pdp: &str,
        queue_id: u64,
        kind: MessageKind,
        message: &Arc<PdpMessage>,
        policies: &[PolicyIdent],
        undeployer: &dyn PolicyUndeployer,
    ) -> Option<FollowUp> {
        info!(pdp, ?policies, "undeploying policies the PDP failed to deploy");
        if let Err(e) = undeployer.undeploy(policies) {
            warn!(pdp, error = %e, "cannot undeploy policies");
        }

        let mut state = self.state.lock();
        let queue = state
            .queues
            .get_mut(pdp)
            .filter(|queue| queue.id() == queue_id)?;
        let unchanged = queue
            .get(kind)
            .is_some_and(|request| Arc::ptr_eq(request.message(), message));
        if unchanged {
            self.complete_locked(&mut state, pdp, kind);
        } else {
            // the request was reconfigured while undeploying
            queue.rebalance();
        }
        None
    }

    fn disable(&self, pdp: &str) {
        warn!(pdp, "disabling PDP");
        self.metrics.pdps_disabled.inc();
        self.notifier.remove_pdp(pdp);

        let removed = match self.remove_from_groups(pdp) {
            Ok(removed) => removed,
            Err(e) => {
                warn!(pdp, error = %e, "cannot remove PDP from its group");
                false
            }
        };

        let mut messages = vec![PdpMessage::from(PdpStateChange::new(pdp, PdpState::Passive))];
        if removed {
            messages.push(PdpUpdate::new(pdp).into());
        }

        let mut state = self.state.lock();
        for message in messages {
            if let Err(e) = self.add_locked(&mut state, message, QueueOrigin::Disable) {
                warn!(pdp, error = %e, "cannot submit disable request");
            }
        }
    }

    fn remove_from_groups(&self, pdp: &str) -> pap_common::Result<bool> {
        let groups = self.topology.get_groups_in_state(PdpState::Active)?;
        for mut group in groups {
            if group.remove_pdp(pdp) {
                info!(pdp, group = %group.name, "removing PDP from its group");
                self.topology.update_groups(std::slice::from_ref(&group))?;
                return Ok(true);
            }
        }
        Ok(false)
    }
}

impl RequestEvents for MapShared {
    fn response_received(&self, key: RequestKey, response: &PdpStatus) {
        let follow_up = self.on_response(&key, response);
        self.run(follow_up);
    }

    fn timer_expired(&self, key: RequestKey) {
        let follow_up = self.on_timeout(&key);
        self.run(follow_up);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CommConfig, RequestKindConfig};
    use crate::publisher::TopicSink;
    use crate::request::tests::{NullPublisher, NullRepo, NullSink};
    use pap_common::{Pdp, PdpGroup, PdpSubGroup};
    use std::time::Duration;

    #[derive(Default)]
    struct Groups {
        groups: Mutex<Vec<PdpGroup>>,
        fail_updates: bool,
    }

    impl TopologyStore for Groups {
        fn get_groups(&self) -> pap_common::Result<Vec<PdpGroup>> {
            Ok(self.groups.lock().clone())
        }

        fn update_groups(&self, groups: &[PdpGroup]) -> pap_common::Result<()> {
            if self.fail_updates {
                return Err(pap_common::Error::Store("down".into()));
            }
            let mut stored = self.groups.lock();
            for group in groups {
                if let Some(existing) = stored.iter_mut().find(|g| g.name == group.name) {
                    *existing = group.clone();
                }
            }
            Ok(())
        }
    }

    fn context(topology: Arc<dyn TopologyStore>) -> CommContext {
        let config = CommConfig {
            update: RequestKindConfig::new(1, Duration::from_secs(60)),
            state_change: RequestKindConfig::new(1, Duration::from_secs(60)),
            ..CommConfig::default()
        };
        let sink: Arc<dyn TopicSink> = Arc::new(NullSink);
        CommContext::new(
            config,
            "pdp",
            sink,
            topology,
            Arc::new(PolicyNotifier::new(Arc::new(NullRepo), Arc::new(NullPublisher))),
        )
    }

    fn active_group(pdp: &str) -> PdpGroup {
        let mut sub = PdpSubGroup::new("xacml");
        sub.add_pdp(Pdp::new(pdp, PdpState::Active));
        PdpGroup::new("g1", PdpState::Active).with_subgroup(sub)
    }

    #[test]
    fn test_add_request_rejects_broadcast_before_adding() {
        let ctx = context(Arc::new(Groups::default()));
        let map = PdpRequestMap::new(&ctx);

        let err = map
            .add_request(
                Some(PdpUpdate::new("p1")),
                Some(PdpStateChange::broadcast(PdpState::Active)),
            )
            .unwrap_err();
        assert!(matches!(err, CommError::UnexpectedBroadcast(_)));
        assert!(map.is_empty());
    }

    #[test]
    fn test_add_request_publishes_by_priority() {
        let ctx = context(Arc::new(Groups::default()));
        let map = PdpRequestMap::new(&ctx);

        map.add_request(
            Some(PdpUpdate::new("p1")),
            Some(PdpStateChange::new("p1", PdpState::Active)),
        )
        .unwrap();
        let snapshot = map.snapshot_of("p1").unwrap();
        assert_eq!(snapshot.publishing().unwrap().kind, MessageKind::Update);

        map.add_state_change(PdpStateChange::new("p2", PdpState::Passive)).unwrap();
        map.add_update(PdpUpdate::new("p2")).unwrap();
        let snapshot = map.snapshot_of("p2").unwrap();
        assert_eq!(snapshot.publishing().unwrap().kind, MessageKind::StateChange);
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_response_advances_queue() {
        let ctx = context(Arc::new(Groups::default()));
        let map = PdpRequestMap::new(&ctx);
        map.add_request(
            Some(PdpUpdate::new("p1")),
            Some(PdpStateChange::new("p1", PdpState::Active)),
        )
        .unwrap();

        let update_id = map.snapshot_of("p1").unwrap().publishing().unwrap().request_id.clone();
        let response = PdpStatus::new("p1", PdpState::Passive).in_response_to(&update_id);
        assert!(ctx.dispatcher.dispatch(&response));

        let snapshot = map.snapshot_of("p1").unwrap();
        let current = snapshot.publishing().unwrap();
        assert_eq!(current.kind, MessageKind::StateChange);

        let response = PdpStatus::new("p1", PdpState::Active).in_response_to(&current.request_id);
        assert!(ctx.dispatcher.dispatch(&response));
        assert!(map.is_empty());
    }

    #[test]
    fn test_stop_publishing_forgets_pdp() {
        let ctx = context(Arc::new(Groups::default()));
        let map = PdpRequestMap::new(&ctx);
        map.add_update(PdpUpdate::new("p1")).unwrap();
        assert!(map.contains("p1"));

        map.stop_publishing("p1");
        assert!(!map.contains("p1"));
        assert!(ctx.dispatcher.is_empty());
    }

    #[test]
    fn test_remove_from_groups() {
        let groups = Arc::new(Groups::default());
        groups.groups.lock().push(active_group("p1"));
        let ctx = context(groups.clone());
        let map = PdpRequestMap::new(&ctx);

        assert!(map.remove_from_groups("p1").unwrap());
        assert!(groups.groups.lock()[0].find_pdp("p1").is_none());
        assert!(!map.remove_from_groups("p1").unwrap());
    }

    #[test]
    fn test_mismatch_disables_pdp() {
        let groups = Arc::new(Groups::default());
        groups.groups.lock().push(active_group("p1"));
        let ctx = context(groups.clone());
        let map = PdpRequestMap::new(&ctx);

        map.add_state_change(PdpStateChange::new("p1", PdpState::Active)).unwrap();
        let id = map.snapshot_of("p1").unwrap().publishing().unwrap().request_id.clone();
        let response = PdpStatus::new("p1", PdpState::Safe).in_response_to(&id);
        ctx.dispatcher.dispatch(&response);

        assert_eq!(ctx.metrics.pdps_disabled.get(), 1);
        assert!(groups.groups.lock()[0].find_pdp("p1").is_none());

        let snapshot = map.snapshot_of("p1").unwrap();
        assert_eq!(snapshot.origin, QueueOrigin::Disable);
        assert_eq!(snapshot.requests.len(), 2);
        let publishing = snapshot.publishing().unwrap();
        assert!(matches!(
            &publishing.message,
            PdpMessage::StateChange(sc) if sc.state == PdpState::Passive
        ));
        assert!(matches!(
            &snapshot.get(MessageKind::Update).unwrap().message,
            PdpMessage::Update(u) if u.pdp_group.is_none()
        ));
    }

    #[test]
    fn test_disable_without_group_removal_sends_only_state_change() {
        let groups = Arc::new(Groups {
            fail_updates: true,
            ..Groups::default()
        });
        groups.groups.lock().push(active_group("p1"));
        let ctx = context(groups);
        let map = PdpRequestMap::new(&ctx);

        map.add_health_check(PdpHealthCheck::new("p1")).unwrap();
        let id = map.snapshot_of("p1").unwrap().publishing().unwrap().request_id.clone();
        let mut response = PdpStatus::new("p1", PdpState::Active).in_response_to(&id);
        response.name = None;
        ctx.dispatcher.dispatch(&response);

        let snapshot = map.snapshot_of("p1").unwrap();
        assert_eq!(snapshot.requests.len(), 1);
        assert_eq!(snapshot.requests[0].kind, MessageKind::StateChange);
    }

    #[test]
    fn test_failed_disable_drops_pdp() {
        let ctx = context(Arc::new(Groups::default()));
        let map = PdpRequestMap::new(&ctx);

        map.add_state_change(PdpStateChange::new("p1", PdpState::Active)).unwrap();
        let id = map.snapshot_of("p1").unwrap().publishing().unwrap().request_id.clone();
        ctx.dispatcher
            .dispatch(&PdpStatus::new("p1", PdpState::Safe).in_response_to(&id));

        let id = map.snapshot_of("p1").unwrap().publishing().unwrap().request_id.clone();
        ctx.dispatcher
            .dispatch(&PdpStatus::new("p1", PdpState::Safe).in_response_to(&id));

        assert!(map.is_empty());
        assert_eq!(ctx.metrics.pdps_disabled.get(), 1);
    }

    #[test]
    fn test_normal_request_promotes_disable_queue() {
        let ctx = context(Arc::new(Groups::default()));
        let map = PdpRequestMap::new(&ctx);

        map.add_state_change(PdpStateChange::new("p1", PdpState::Active)).unwrap();
        let id = map.snapshot_of("p1").unwrap().publishing().unwrap().request_id.clone();
        ctx.dispatcher
            .dispatch(&PdpStatus::new("p1", PdpState::Safe).in_response_to(&id));
        assert_eq!(map.snapshot_of("p1").unwrap().origin, QueueOrigin::Disable);

        map.add_update(PdpUpdate::new("p1")).unwrap();
        assert_eq!(map.snapshot_of("p1").unwrap().origin, QueueOrigin::Normal);
    }
}
