//! End-to-end dispatch behavior with live publisher and timer loops.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use pap_comm::{
    CommConfig, CommContext, CommError, HeartbeatTracker, PdpRequestMap, PdpStatusHandler,
    PolicyUndeployer, QueueOrigin, RequestKindConfig, StatusDisposition, TopicSink,
};
use pap_common::{
    MessageKind, Pdp, PdpGroup, PdpHealthCheck, PdpMessage, PdpState, PdpStateChange, PdpStatus,
    PdpSubGroup, PdpUpdate, PolicyIdent, PolicyRepository, PolicyTypeIdent, ToscaPolicy,
    TopologyStore,
};
use pap_notification::{
    DeploymentRecord, NotificationPublisher, PolicyNotification, PolicyNotifier, StatusRepository,
};
use tokio::task::JoinHandle;

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RecordingSink {
    sent: Mutex<Vec<PdpMessage>>,
}

impl TopicSink for RecordingSink {
    fn send(&self, _topic: &str, message: &str) -> pap_comm::Result<()> {
        let message: PdpMessage = serde_json::from_str(message)?;
        self.sent.lock().push(message);
        Ok(())
    }
}

impl RecordingSink {
    fn sent(&self) -> Vec<PdpMessage> {
        self.sent.lock().clone()
    }

    fn len(&self) -> usize {
        self.sent.lock().len()
    }

    fn last(&self) -> PdpMessage {
        self.sent.lock().last().cloned().expect("nothing sent")
    }
}

#[derive(Default)]
struct Fleet {
    groups: Mutex<Vec<PdpGroup>>,
}

impl TopologyStore for Fleet {
    fn get_groups(&self) -> pap_common::Result<Vec<PdpGroup>> {
        Ok(self.groups.lock().clone())
    }

    fn update_groups(&self, groups: &[PdpGroup]) -> pap_common::Result<()> {
        let mut stored = self.groups.lock();
        for group in groups {
            if let Some(existing) = stored.iter_mut().find(|g| g.name == group.name) {
                *existing = group.clone();
            }
        }
        Ok(())
    }
}

struct Policies;

impl PolicyRepository for Policies {
    fn get_policies(&self, idents: &[PolicyIdent]) -> pap_common::Result<Vec<ToscaPolicy>> {
        Ok(idents.iter().map(|id| tosca(&id.name)).collect())
    }
}

struct EmptyRepo;

impl StatusRepository for EmptyRepo {
    fn get_group_status(
        &self,
        _pdp_group: &str,
    ) -> pap_notification::Result<Vec<DeploymentRecord>> {
        Ok(Vec::new())
    }

    fn cud(
        &self,
        _created: &[DeploymentRecord],
        _updated: &[DeploymentRecord],
        _deleted: &[DeploymentRecord],
    ) -> pap_notification::Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct Notifications(Mutex<Vec<PolicyNotification>>);

impl NotificationPublisher for Notifications {
    fn publish(&self, notification: PolicyNotification) {
        self.0.lock().push(notification);
    }
}

/// Records undeploy calls and optionally resubmits an UPDATE withdrawing them.
struct Undeployer {
    calls: Mutex<Vec<Vec<PolicyIdent>>>,
    resubmit: Option<PdpRequestMap>,
    fail: bool,
}

impl PolicyUndeployer for Undeployer {
    fn undeploy(&self, policies: &[PolicyIdent]) -> pap_common::Result<()> {
        self.calls.lock().push(policies.to_vec());
        if self.fail {
            return Err(pap_common::Error::Store("db down".into()));
        }
        if let Some(map) = &self.resubmit {
            map.add_update(
                PdpUpdate::new("p1")
                    .with_group("g1", "xacml")
                    .with_undeploy(policies.to_vec()),
            )
            .map_err(|e| pap_common::Error::Store(e.to_string()))?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Fixture
// ---------------------------------------------------------------------------

fn ident(name: &str) -> PolicyIdent {
    PolicyIdent::new(name, "1.0.0")
}

fn tosca(name: &str) -> ToscaPolicy {
    ToscaPolicy::new(ident(name), PolicyTypeIdent::new("onap.policies.Guard", "1.0.0"))
}

fn group_with(pdps: &[&str]) -> PdpGroup {
    let mut sub = PdpSubGroup::new("xacml");
    sub.policies.push(ident("guard"));
    for pdp in pdps {
        sub.add_pdp(Pdp::new(*pdp, PdpState::Active));
    }
    PdpGroup::new("g1", PdpState::Active).with_subgroup(sub)
}

struct Fixture {
    sink: Arc<RecordingSink>,
    fleet: Arc<Fleet>,
    notifications: Arc<Notifications>,
    notifier: Arc<PolicyNotifier>,
    ctx: CommContext,
    map: PdpRequestMap,
    tracker: Arc<HeartbeatTracker>,
    handler: PdpStatusHandler,
    handles: Vec<JoinHandle<()>>,
}

impl Fixture {
    fn new(config: CommConfig, groups: Vec<PdpGroup>) -> Self {
        let sink = Arc::new(RecordingSink::default());
        let fleet = Arc::new(Fleet {
            groups: Mutex::new(groups),
        });
        let notifications = Arc::new(Notifications::default());
        let notifier = Arc::new(PolicyNotifier::new(Arc::new(EmptyRepo), notifications.clone()));

        let ctx =
            CommContext::new(config, "pdp-pap", sink.clone(), fleet.clone(), notifier.clone());
        let map = PdpRequestMap::new(&ctx);
        let tracker = HeartbeatTracker::new(&ctx, map.clone());
        let handler = PdpStatusHandler::new(&ctx, Arc::new(Policies), map.clone(), tracker.clone());

        Self {
            sink,
            fleet,
            notifications,
            notifier,
            ctx,
            map,
            tracker,
            handler,
            handles: Vec::new(),
        }
    }

    fn start(&mut self) {
        self.handles.push(self.ctx.publisher.start().unwrap());
        for timers in self.ctx.all_timers() {
            self.handles.push(timers.start());
        }
    }

    async fn shutdown(self) {
        self.ctx.publisher.stop();
        for timers in self.ctx.all_timers() {
            timers.stop();
        }
        for handle in self.handles {
            tokio::time::timeout(Duration::from_secs(2), handle)
                .await
                .expect("task did not exit")
                .unwrap();
        }
    }

    async fn wait_sent(&self, count: usize) {
        assert!(
            wait_until(|| self.sink.len() >= count).await,
            "expected {count} messages, got {:?}",
            self.sink.sent()
        );
    }

    /// Answers `message` as a compliant PDP would.
    fn comply(&self, message: &PdpMessage) -> StatusDisposition {
        let status = compliant_response(message);
        self.handler.handle(&status).unwrap()
    }
}

fn compliant_response(message: &PdpMessage) -> PdpStatus {
    let name = message.name().unwrap();
    let status = match message {
        PdpMessage::Update(update) => {
            let mut status = PdpStatus::new(name, PdpState::Passive)
                .with_policies(update.deploy_idents().into_iter().collect());
            status.pdp_group = update.pdp_group.clone();
            status.pdp_subgroup = update.pdp_subgroup.clone();
            status
        }
        PdpMessage::StateChange(sc) => PdpStatus::new(name, sc.state),
        PdpMessage::HealthCheck(_) => PdpStatus::new(name, PdpState::Active),
    };
    status.in_response_to(message.request_id())
}

async fn wait_until(condition: impl Fn() -> bool) -> bool {
    for _ in 0..400 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

fn fast_config(max_retry_count: u32, max_wait: Duration) -> CommConfig {
    let kind = RequestKindConfig::new(max_retry_count, max_wait);
    CommConfig {
        update: kind,
        state_change: kind,
        health_check: kind,
        ..CommConfig::default()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_registration_runs_update_then_activation() {
    let mut fx = Fixture::new(CommConfig::default(), vec![group_with(&[])]);
    fx.notifier.deploy(
        &["p1".to_string()],
        &ident("guard"),
        &PolicyTypeIdent::new("onap.policies.Guard", "1.0.0"),
        "g1",
        "xacml",
        true,
    );
    fx.start();

    let registration = PdpStatus::new("p1", PdpState::Passive).with_type("xacml");
    assert_eq!(fx.handler.handle(&registration).unwrap(), StatusDisposition::Registered);

    fx.wait_sent(1).await;
    let update = fx.sink.last();
    let PdpMessage::Update(body) = &update else {
        panic!("expected UPDATE first, got {update:?}");
    };
    assert_eq!(body.pdp_group.as_deref(), Some("g1"));
    assert_eq!(body.pdp_subgroup.as_deref(), Some("xacml"));
    assert_eq!(body.policies_to_be_deployed, vec![tosca("guard")]);

    assert_eq!(fx.comply(&update), StatusDisposition::Response { matched: true });
    fx.wait_sent(2).await;
    let activate = fx.sink.last();
    assert!(matches!(&activate, PdpMessage::StateChange(sc) if sc.state == PdpState::Active));

    assert_eq!(fx.comply(&activate), StatusDisposition::Response { matched: true });
    assert!(fx.map.is_empty());
    assert_eq!(fx.sink.len(), 2);

    let notifications = fx.notifications.0.lock().clone();
    assert!(notifications
        .iter()
        .any(|n| n.added.iter().any(|s| s.policy() == ident("guard") && s.success_count == 1)));

    fx.shutdown().await;
}

#[tokio::test]
async fn test_retry_exhaustion_disables_then_drops_pdp() {
    let mut fx = Fixture::new(fast_config(2, Duration::from_millis(30)), Vec::new());
    fx.start();

    fx.map
        .add_state_change(PdpStateChange::new("p1", PdpState::Active))
        .unwrap();

    fx.wait_sent(4).await;
    let sent = fx.sink.sent();
    let first_id = sent[0].request_id().to_string();
    for message in &sent[..3] {
        assert_eq!(message.request_id(), first_id);
        assert!(matches!(message, PdpMessage::StateChange(sc) if sc.state == PdpState::Active));
    }
    assert!(matches!(&sent[3], PdpMessage::StateChange(sc) if sc.state == PdpState::Passive));

    let queue = fx.map.snapshot_of("p1").expect("disable queue");
    assert_eq!(queue.origin, QueueOrigin::Disable);
    assert_eq!(queue.requests.len(), 1);
    assert_eq!(queue.requests[0].kind, MessageKind::StateChange);

    assert!(wait_until(|| fx.map.is_empty()).await);
    let passive_sends = fx
        .sink
        .sent()
        .iter()
        .filter(|m| matches!(m, PdpMessage::StateChange(sc) if sc.state == PdpState::Passive))
        .count();
    assert_eq!(passive_sends, 3);
    assert_eq!(fx.ctx.metrics.pdps_disabled.get(), 1);
    assert_eq!(fx.ctx.metrics.retries_exhausted.get(), 2);

    fx.shutdown().await;
}

#[tokio::test]
async fn test_exhaustion_removes_pdp_from_group() {
    let mut fx = Fixture::new(fast_config(0, Duration::from_millis(20)), vec![group_with(&["p1"])]);
    fx.start();

    fx.map.add_health_check(PdpHealthCheck::new("p1")).unwrap();
    assert!(wait_until(|| fx.ctx.metrics.pdps_disabled.get() == 1).await);

    assert!(fx.fleet.groups.lock()[0].find_pdp("p1").is_none());
    fx.wait_sent(2).await;
    assert!(matches!(
        &fx.sink.sent()[1],
        PdpMessage::StateChange(sc) if sc.state == PdpState::Passive
    ));

    fx.shutdown().await;
}

#[tokio::test]
async fn test_highest_priority_goes_first_one_at_a_time() {
    let mut fx = Fixture::new(CommConfig::default(), Vec::new());

    fx.map.add_health_check(PdpHealthCheck::new("p1")).unwrap();
    fx.map.add_update(PdpUpdate::new("p1")).unwrap();
    fx.map
        .add_state_change(PdpStateChange::new("p1", PdpState::Passive))
        .unwrap();
    fx.start();

    let mut kinds = Vec::new();
    for expected in 1..=3 {
        fx.wait_sent(expected).await;
        // nothing else goes out while a request is in flight
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(fx.sink.len(), expected);

        let message = fx.sink.last();
        kinds.push(message.kind());
        assert_eq!(fx.comply(&message), StatusDisposition::Response { matched: true });
    }

    assert_eq!(
        kinds,
        vec![MessageKind::StateChange, MessageKind::Update, MessageKind::HealthCheck]
    );
    assert!(fx.map.is_empty());

    fx.shutdown().await;
}

#[tokio::test]
async fn test_pdps_progress_independently() {
    let mut fx = Fixture::new(CommConfig::default(), Vec::new());
    fx.start();

    fx.map.add_update(PdpUpdate::new("p1")).unwrap();
    fx.map.add_update(PdpUpdate::new("p2")).unwrap();
    fx.wait_sent(2).await;

    let names: Vec<_> = fx
        .sink
        .sent()
        .iter()
        .map(|m| m.name().unwrap().to_string())
        .collect();
    assert_eq!(names, vec!["p1", "p2"]);

    fx.shutdown().await;
}

#[tokio::test]
async fn test_superseded_response_is_ignored() {
    let mut fx = Fixture::new(CommConfig::default(), Vec::new());
    fx.start();

    fx.map
        .add_state_change(PdpStateChange::new("p1", PdpState::Active))
        .unwrap();
    fx.wait_sent(1).await;
    let old = fx.sink.last();

    fx.map
        .add_state_change(PdpStateChange::new("p1", PdpState::Passive))
        .unwrap();
    fx.wait_sent(2).await;
    let current = fx.sink.last();
    assert_ne!(old.request_id(), current.request_id());

    assert_eq!(fx.comply(&old), StatusDisposition::Response { matched: false });
    assert!(fx.map.contains("p1"));

    assert_eq!(fx.comply(&current), StatusDisposition::Response { matched: true });
    assert!(fx.map.is_empty());

    fx.shutdown().await;
}

#[tokio::test]
async fn test_broadcast_rejected() {
    let fx = Fixture::new(CommConfig::default(), Vec::new());
    let err = fx.map.add_update(PdpUpdate::broadcast()).unwrap_err();
    assert!(matches!(err, CommError::UnexpectedBroadcast(_)));
    assert!(fx.map.is_empty());
    assert_eq!(fx.sink.len(), 0);
}

#[tokio::test]
async fn test_missing_policies_are_undeployed() {
    let mut fx = Fixture::new(CommConfig::default(), vec![group_with(&["p1"])]);
    let undeployer = Arc::new(Undeployer {
        calls: Mutex::new(Vec::new()),
        resubmit: None,
        fail: false,
    });
    fx.map.set_undeployer(undeployer.clone());
    fx.start();

    fx.map
        .add_update(
            PdpUpdate::new("p1")
                .with_group("g1", "xacml")
                .with_deploy(vec![tosca("a"), tosca("b")]),
        )
        .unwrap();
    fx.wait_sent(1).await;
    let update = fx.sink.last();

    let partial = PdpStatus::new("p1", PdpState::Active)
        .with_group("g1", "xacml")
        .with_policies(vec![ident("a")])
        .in_response_to(update.request_id());
    fx.handler.handle(&partial).unwrap();

    assert_eq!(*undeployer.calls.lock(), vec![vec![ident("b")]]);
    assert!(fx.map.is_empty());
    assert_eq!(fx.ctx.metrics.pdps_disabled.get(), 0);

    fx.shutdown().await;
}

#[tokio::test]
async fn test_failed_undeploy_keeps_pdp_enabled() {
    let mut fx = Fixture::new(CommConfig::default(), vec![group_with(&["p1"])]);
    let undeployer = Arc::new(Undeployer {
        calls: Mutex::new(Vec::new()),
        resubmit: None,
        fail: true,
    });
    fx.map.set_undeployer(undeployer.clone());
    fx.start();

    fx.map
        .add_request(
            Some(
                PdpUpdate::new("p1")
                    .with_group("g1", "xacml")
                    .with_deploy(vec![tosca("a"), tosca("b")]),
            ),
            Some(PdpStateChange::new("p1", PdpState::Active)),
        )
        .unwrap();
    fx.wait_sent(1).await;
    let update = fx.sink.last();

    let partial = PdpStatus::new("p1", PdpState::Active)
        .with_group("g1", "xacml")
        .with_policies(vec![ident("a")])
        .in_response_to(update.request_id());
    fx.handler.handle(&partial).unwrap();

    assert_eq!(*undeployer.calls.lock(), vec![vec![ident("b")]]);
    assert_eq!(fx.ctx.metrics.pdps_disabled.get(), 0);
    assert!(fx.fleet.groups.lock()[0].find_pdp("p1").is_some());

    // the queue moves on to the activation instead of a disable cycle
    fx.wait_sent(2).await;
    assert!(matches!(
        fx.sink.last(),
        PdpMessage::StateChange(sc) if sc.state == PdpState::Active
    ));
    let snapshot = fx.map.snapshot_of("p1").unwrap();
    assert_eq!(snapshot.origin, QueueOrigin::Normal);
    assert!(snapshot.get(MessageKind::Update).is_none());

    fx.shutdown().await;
}

#[tokio::test]
async fn test_undeploy_may_resubmit_to_the_table() {
    let mut fx = Fixture::new(CommConfig::default(), vec![group_with(&["p1"])]);
    let undeployer = Arc::new(Undeployer {
        calls: Mutex::new(Vec::new()),
        resubmit: Some(fx.map.clone()),
        fail: false,
    });
    fx.map.set_undeployer(undeployer.clone());
    fx.start();

    fx.map
        .add_update(
            PdpUpdate::new("p1")
                .with_group("g1", "xacml")
                .with_deploy(vec![tosca("a"), tosca("b")]),
        )
        .unwrap();
    fx.wait_sent(1).await;
    let update = fx.sink.last();

    let partial = PdpStatus::new("p1", PdpState::Active)
        .with_group("g1", "xacml")
        .with_policies(vec![ident("a")])
        .in_response_to(update.request_id());
    fx.handler.handle(&partial).unwrap();

    fx.wait_sent(2).await;
    let PdpMessage::Update(merged) = fx.sink.last() else {
        panic!("expected a corrected UPDATE");
    };
    assert_eq!(merged.policies_to_be_deployed, vec![tosca("a")]);
    assert_eq!(merged.policies_to_be_undeployed, vec![ident("b")]);
    assert!(fx.map.contains("p1"));

    fx.shutdown().await;
}

#[tokio::test]
async fn test_silent_pdp_is_probed_once() {
    let mut fx = Fixture::new(CommConfig::default(), vec![group_with(&["p1"])]);
    fx.start();

    for _ in 0..3 {
        fx.tracker.evaluate();
    }
    fx.wait_sent(1).await;
    let probe = fx.sink.last();
    assert!(matches!(
        &probe,
        PdpMessage::StateChange(sc)
            if sc.state == PdpState::Active && sc.pdp_group.as_deref() == Some("g1")
    ));

    assert_eq!(fx.tracker.evaluate(), 0);
    assert_eq!(fx.comply(&probe), StatusDisposition::Response { matched: true });
    assert_eq!(fx.tracker.missed_count("p1"), Some(0));
    assert_eq!(fx.ctx.metrics.heartbeat_probes.get(), 1);

    fx.shutdown().await;
}
