//! Thread-safe front end to the deployment ledger.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use pap_common::{PolicyIdent, PolicyTypeIdent};
use tracing::{debug, warn};

use crate::model::PolicyNotification;
use crate::repository::StatusRepository;
use crate::status::DeploymentStatus;

/// Destination for fleet-wide policy notifications.
pub trait NotificationPublisher: Send + Sync {
    fn publish(&self, notification: PolicyNotification);
}

/// Owns the [`DeploymentStatus`] ledger and publishes the notifications its
/// flushes produce.
///
/// Every mutating operation ends with a flush, so each call persists its own
/// changes and publishes at most one notification. Repository failures are
/// logged and left for the next flush to retry.
pub struct PolicyNotifier {
    status: Mutex<DeploymentStatus>,
    repository: Arc<dyn StatusRepository>,
    publisher: Arc<dyn NotificationPublisher>,
}

impl PolicyNotifier {
    pub fn new(
        repository: Arc<dyn StatusRepository>,
        publisher: Arc<dyn NotificationPublisher>,
    ) -> Self {
        Self {
            status: Mutex::new(DeploymentStatus::new()),
            repository,
            publisher,
        }
    }

    /// Records desired deployments for a set of PDPs, then flushes.
    pub fn deploy(
        &self,
        pdp_ids: &[String],
        policy: &PolicyIdent,
        policy_type: &PolicyTypeIdent,
        pdp_group: &str,
        pdp_type: &str,
        deploy: bool,
    ) {
        let mut status = self.status.lock();
        self.load_group(&mut status, pdp_group);
        for pdp_id in pdp_ids {
            status.deploy(pdp_id, policy, policy_type, pdp_group, pdp_type, deploy);
        }
        self.flush_locked(&mut status);
    }

    /// Applies a PDP's response to an UPDATE.
    ///
    /// `expected` is the set of policies the UPDATE told the PDP to deploy,
    /// `actual` the set the PDP reports running.
    pub fn process_response(
        &self,
        pdp_id: &str,
        pdp_group: Option<&str>,
        expected: &HashSet<PolicyIdent>,
        actual: &HashSet<PolicyIdent>,
    ) {
        let mut status = self.status.lock();
        if let Some(group) = pdp_group {
            self.load_group(&mut status, group);
        }
        status.complete_deploy(pdp_id, expected, actual);
        self.flush_locked(&mut status);
    }

    /// Forgets every record of a PDP that left the fleet.
    pub fn remove_pdp(&self, pdp_id: &str) {
        let mut status = self.status.lock();
        status.delete_deployment_for_pdp(pdp_id);
        self.flush_locked(&mut status);
    }

    /// Forgets every deploy (or undeploy) record of a policy.
    pub fn remove_policy(&self, policy: &PolicyIdent, deploy: bool) {
        let mut status = self.status.lock();
        status.delete_deployment(policy, deploy);
        self.flush_locked(&mut status);
    }

    /// Retries any pending persistence.
    pub fn flush(&self) {
        let mut status = self.status.lock();
        self.flush_locked(&mut status);
    }

    /// Runs `f` against the ledger without flushing.
    pub fn with_status<R>(&self, f: impl FnOnce(&DeploymentStatus) -> R) -> R {
        f(&self.status.lock())
    }

    fn load_group(&self, status: &mut DeploymentStatus, pdp_group: &str) {
        if let Err(e) = status.load_by_group(pdp_group, self.repository.as_ref()) {
            warn!(group = pdp_group, error = %e, "cannot load deployment status");
        }
    }

    fn flush_locked(&self, status: &mut DeploymentStatus) {
        let mut notification = PolicyNotification::default();
        if let Err(e) = status.flush(&mut notification, self.repository.as_ref()) {
            warn!(error = %e, "cannot update deployment status");
            return;
        }

        if notification.is_empty() {
            return;
        }

        debug!(
            added = notification.added.len(),
            deleted = notification.deleted.len(),
            "publishing policy notification"
        );
        self.publisher.publish(notification);
    }
}
