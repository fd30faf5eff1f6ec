//! The deployment ledger.
//!
//! [`DeploymentStatus`] keeps one [`DeploymentRecord`] per (PDP, policy) of
//! current interest, together with a marker saying how the record differs from
//! what the [`StatusRepository`] holds:
//!
//! ```text
//!   deploy() ──► CREATED ─────────────┐
//!                                     │ flush()
//!   load ──► UNCHANGED ──change──► UPDATED ──► UNCHANGED
//!                 │
//!                 └──delete──► DELETED ──flush()──► (gone)
//! ```
//!
//! Records are created WAITING when a request is sent, settle into SUCCESS or
//! FAILURE as PDPs respond ([`DeploymentStatus::complete_deploy`]), and are
//! written out in one batch by [`DeploymentStatus::flush`], which is also where
//! fleet-wide notifications are produced.

use std::collections::{HashMap, HashSet};

use pap_common::{PolicyIdent, PolicyTypeIdent};
use tracing::debug;

use crate::error::Result;
use crate::model::{DeploymentRecord, DeploymentState, PolicyNotification, StatusKey};
use crate::repository::StatusRepository;
use crate::tracker::DeploymentTracker;

/// How a record differs from its persisted copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusAction {
    Unchanged,
    Created,
    Updated,
    Deleted,
}

#[derive(Debug, Clone)]
struct TrackedRecord {
    action: StatusAction,
    record: DeploymentRecord,
}

impl TrackedRecord {
    /// Notes a modification; a record that was never persisted stays CREATED.
    fn set_changed(&mut self) {
        if self.action != StatusAction::Created {
            self.action = StatusAction::Updated;
        }
    }
}

/// In-memory ledger of (PDP, policy) deployment records.
#[derive(Debug, Default)]
pub struct DeploymentStatus {
    groups_loaded: HashSet<String>,
    records: HashMap<StatusKey, TrackedRecord>,
    tracker: DeploymentTracker,
}

impl DeploymentStatus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the persisted records of a group, once per group.
    pub fn load_by_group(&mut self, pdp_group: &str, repo: &dyn StatusRepository) -> Result<()> {
        if self.groups_loaded.contains(pdp_group) {
            return Ok(());
        }

        let records = repo.get_group_status(pdp_group)?;
        self.groups_loaded.insert(pdp_group.to_string());
        debug!(group = pdp_group, count = records.len(), "loaded deployment records");

        for record in records {
            let key = StatusKey::of(&record);
            self.tracker.add(&record);
            self.records.insert(
                key,
                TrackedRecord {
                    action: StatusAction::Unchanged,
                    record,
                },
            );
        }
        Ok(())
    }

    /// Records that `policy` should be deployed (or undeployed) on `pdp_id`.
    ///
    /// A new record starts WAITING. An existing record is reset to WAITING only
    /// when its deploy flag flips; repeating the same request is a no-op.
    pub fn deploy(
        &mut self,
        pdp_id: &str,
        policy: &PolicyIdent,
        policy_type: &PolicyTypeIdent,
        pdp_group: &str,
        pdp_type: &str,
        deploy: bool,
    ) {
        let key = StatusKey::new(pdp_id, policy.clone());

        let Some(tracked) = self.records.get_mut(&key) else {
            self.records.insert(
                key,
                TrackedRecord {
                    action: StatusAction::Created,
                    record: DeploymentRecord {
                        pdp_id: pdp_id.to_string(),
                        policy: policy.clone(),
                        policy_type: policy_type.clone(),
                        pdp_group: pdp_group.to_string(),
                        pdp_type: pdp_type.to_string(),
                        deploy,
                        state: DeploymentState::Waiting,
                    },
                },
            );
            return;
        };

        if tracked.record.deploy != deploy {
            tracked.set_changed();
            tracked.record.deploy = deploy;
            tracked.record.state = DeploymentState::Waiting;
        } else if tracked.action == StatusAction::Deleted {
            // resurrected before the deletion was flushed
            tracked.action = StatusAction::Updated;
        }
    }

    /// Applies a PDP's report of the policies it actually runs.
    ///
    /// Only WAITING records of `pdp_id` whose deploy flag agrees with
    /// membership in `expected` are considered; each becomes SUCCESS when the
    /// policy's presence in `actual` matches the deploy flag, FAILURE otherwise.
    pub fn complete_deploy(
        &mut self,
        pdp_id: &str,
        expected: &HashSet<PolicyIdent>,
        actual: &HashSet<PolicyIdent>,
    ) {
        for tracked in self.records.values_mut() {
            let record = &tracked.record;
            if record.pdp_id != pdp_id
                || record.state != DeploymentState::Waiting
                || expected.contains(&record.policy) != record.deploy
            {
                continue;
            }

            let state = if actual.contains(&record.policy) == record.deploy {
                DeploymentState::Success
            } else {
                DeploymentState::Failure
            };

            tracked.set_changed();
            tracked.record.state = state;
        }
    }

    /// Drops every record of a PDP.
    pub fn delete_deployment_for_pdp(&mut self, pdp_id: &str) {
        self.delete_where(|key, _| key.pdp_id == pdp_id);
    }

    /// Drops every deploy (or undeploy) record of a policy.
    pub fn delete_deployment(&mut self, policy: &PolicyIdent, deploy: bool) {
        self.delete_where(|key, record| record.deploy == deploy && &key.policy == policy);
    }

    fn delete_where(&mut self, filter: impl Fn(&StatusKey, &DeploymentRecord) -> bool) {
        self.records.retain(|key, tracked| {
            if !filter(key, &tracked.record) {
                return true;
            }
            if tracked.action == StatusAction::Created {
                // never persisted: just forget it
                return false;
            }
            tracked.action = StatusAction::Deleted;
            true
        });
    }

    /// Computes notifications and persists every pending change.
    ///
    /// On repository failure the pending markers are kept so the next flush
    /// retries, and nothing is added to `notif`.
    pub fn flush(
        &mut self,
        notif: &mut PolicyNotification,
        repo: &dyn StatusRepository,
    ) -> Result<()> {
        // must snapshot before completed undeployments are deleted
        let newer = self.current_tracker();
        self.delete_undeployments();
        self.persist(repo)?;

        self.tracker.add_notifications(notif, &newer);
        self.tracker = newer;
        Ok(())
    }

    fn current_tracker(&self) -> DeploymentTracker {
        let mut tracker = DeploymentTracker::new();
        self.records
            .values()
            .filter(|tracked| tracked.action != StatusAction::Deleted)
            .for_each(|tracked| tracker.add(&tracked.record));
        tracker
    }

    /// Deletes undeploy records of policies that no PDP is still waiting on.
    fn delete_undeployments(&mut self) {
        let incomplete: HashSet<PolicyIdent> = self
            .records
            .values()
            .filter(|tracked| tracked.action != StatusAction::Deleted)
            .filter(|tracked| tracked.record.state == DeploymentState::Waiting)
            .map(|tracked| tracked.record.policy.clone())
            .collect();

        self.delete_where(|key, record| !record.deploy && !incomplete.contains(&key.policy));
    }

    fn persist(&mut self, repo: &dyn StatusRepository) -> Result<()> {
        let mut created = Vec::new();
        let mut updated = Vec::new();
        let mut deleted = Vec::new();

        for tracked in self.records.values() {
            match tracked.action {
                StatusAction::Created => created.push(tracked.record.clone()),
                StatusAction::Updated => updated.push(tracked.record.clone()),
                StatusAction::Deleted => deleted.push(tracked.record.clone()),
                StatusAction::Unchanged => {}
            }
        }

        if !created.is_empty() || !updated.is_empty() || !deleted.is_empty() {
            repo.cud(&created, &updated, &deleted)?;
        }

        self.records.retain(|_, tracked| tracked.action != StatusAction::Deleted);
        for tracked in self.records.values_mut() {
            tracked.action = StatusAction::Unchanged;
        }
        Ok(())
    }

    /// Returns the record for (PDP, policy), if tracked and not deleted.
    pub fn record(&self, pdp_id: &str, policy: &PolicyIdent) -> Option<&DeploymentRecord> {
        self.records
            .get(&StatusKey::new(pdp_id, policy.clone()))
            .filter(|tracked| tracked.action != StatusAction::Deleted)
            .map(|tracked| &tracked.record)
    }

    /// Returns the pending change marker for (PDP, policy).
    pub fn action(&self, pdp_id: &str, policy: &PolicyIdent) -> Option<StatusAction> {
        self.records
            .get(&StatusKey::new(pdp_id, policy.clone()))
            .map(|tracked| tracked.action)
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.records
            .values()
            .filter(|tracked| tracked.action != StatusAction::Deleted)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NotifyError;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct MemoryRepo {
        stored: Mutex<Vec<DeploymentRecord>>,
        batches: Mutex<Vec<(usize, usize, usize)>>,
        fail: Mutex<bool>,
    }

    impl StatusRepository for MemoryRepo {
        fn get_group_status(&self, pdp_group: &str) -> Result<Vec<DeploymentRecord>> {
            Ok(self
                .stored
                .lock()
                .iter()
                .filter(|r| r.pdp_group == pdp_group)
                .cloned()
                .collect())
        }

        fn cud(
            &self,
            created: &[DeploymentRecord],
            updated: &[DeploymentRecord],
            deleted: &[DeploymentRecord],
        ) -> Result<()> {
            if *self.fail.lock() {
                return Err(NotifyError::Repository("unavailable".to_string()));
            }
            self.batches
                .lock()
                .push((created.len(), updated.len(), deleted.len()));
            Ok(())
        }
    }

    fn policy(name: &str) -> PolicyIdent {
        PolicyIdent::new(name, "1.0.0")
    }

    fn policy_type() -> PolicyTypeIdent {
        PolicyTypeIdent::new("onap.Type", "1.0.0")
    }

    fn set(names: &[&str]) -> HashSet<PolicyIdent> {
        names.iter().map(|n| policy(n)).collect()
    }

    #[test]
    fn test_deploy_creates_waiting_record() {
        let mut status = DeploymentStatus::new();
        status.deploy("a", &policy("x"), &policy_type(), "g1", "xacml", true);

        let record = status.record("a", &policy("x")).unwrap();
        assert_eq!(record.state, DeploymentState::Waiting);
        assert!(record.deploy);
        assert_eq!(status.action("a", &policy("x")), Some(StatusAction::Created));
    }

    #[test]
    fn test_deploy_flag_flip_resets_to_waiting() {
        let repo = MemoryRepo::default();
        let mut status = DeploymentStatus::new();
        status.deploy("a", &policy("x"), &policy_type(), "g1", "xacml", true);
        status.complete_deploy("a", &set(&["x"]), &set(&["x"]));
        status.flush(&mut PolicyNotification::default(), &repo).unwrap();

        status.deploy("a", &policy("x"), &policy_type(), "g1", "xacml", false);
        let record = status.record("a", &policy("x")).unwrap();
        assert!(!record.deploy);
        assert_eq!(record.state, DeploymentState::Waiting);
        assert_eq!(status.action("a", &policy("x")), Some(StatusAction::Updated));
    }

    #[test]
    fn test_complete_deploy_scopes_by_pdp_and_flag() {
        let mut status = DeploymentStatus::new();
        status.deploy("a", &policy("x"), &policy_type(), "g1", "xacml", true);
        status.deploy("a", &policy("y"), &policy_type(), "g1", "xacml", false);
        status.deploy("b", &policy("x"), &policy_type(), "g1", "xacml", true);

        // "a" runs neither x nor y
        status.complete_deploy("a", &set(&["x"]), &HashSet::new());

        assert_eq!(
            status.record("a", &policy("x")).unwrap().state,
            DeploymentState::Failure
        );
        assert_eq!(
            status.record("a", &policy("y")).unwrap().state,
            DeploymentState::Success
        );
        assert_eq!(
            status.record("b", &policy("x")).unwrap().state,
            DeploymentState::Waiting
        );
    }

    #[test]
    fn test_complete_deploy_skips_out_of_scope_record() {
        let mut status = DeploymentStatus::new();
        status.deploy("a", &policy("x"), &policy_type(), "g1", "xacml", true);

        // x is not in this response's expected set, so the deploy record is untouched
        status.complete_deploy("a", &HashSet::new(), &HashSet::new());
        assert_eq!(
            status.record("a", &policy("x")).unwrap().state,
            DeploymentState::Waiting
        );
    }

    #[test]
    fn test_delete_created_record_is_forgotten() {
        let mut status = DeploymentStatus::new();
        status.deploy("a", &policy("x"), &policy_type(), "g1", "xacml", true);
        status.delete_deployment_for_pdp("a");
        assert!(status.is_empty());
        assert_eq!(status.action("a", &policy("x")), None);
    }

    #[test]
    fn test_delete_persisted_record_is_marked() {
        let repo = MemoryRepo::default();
        let mut status = DeploymentStatus::new();
        status.deploy("a", &policy("x"), &policy_type(), "g1", "xacml", true);
        status.flush(&mut PolicyNotification::default(), &repo).unwrap();

        status.delete_deployment(&policy("x"), true);
        assert_eq!(status.action("a", &policy("x")), Some(StatusAction::Deleted));

        // redeploying before the flush resurrects it
        status.deploy("a", &policy("x"), &policy_type(), "g1", "xacml", true);
        assert_eq!(status.action("a", &policy("x")), Some(StatusAction::Updated));
    }

    #[test]
    fn test_flush_deletes_completed_undeployments() {
        let repo = MemoryRepo::default();
        let mut status = DeploymentStatus::new();
        status.deploy("a", &policy("x"), &policy_type(), "g1", "xacml", false);
        status.flush(&mut PolicyNotification::default(), &repo).unwrap();

        status.complete_deploy("a", &HashSet::new(), &HashSet::new());
        let mut notif = PolicyNotification::default();
        status.flush(&mut notif, &repo).unwrap();

        assert_eq!(notif.deleted.len(), 1);
        assert_eq!(notif.deleted[0].success_count, 1);
        assert!(status.is_empty());
        assert_eq!(repo.batches.lock().last().copied(), Some((0, 0, 1)));
    }

    #[test]
    fn test_flush_failure_keeps_pending_changes() {
        let repo = MemoryRepo::default();
        let mut status = DeploymentStatus::new();
        status.deploy("a", &policy("x"), &policy_type(), "g1", "xacml", true);
        status.complete_deploy("a", &set(&["x"]), &set(&["x"]));

        *repo.fail.lock() = true;
        let mut notif = PolicyNotification::default();
        assert!(status.flush(&mut notif, &repo).is_err());
        assert!(notif.is_empty());
        assert_eq!(status.action("a", &policy("x")), Some(StatusAction::Created));

        *repo.fail.lock() = false;
        status.flush(&mut notif, &repo).unwrap();
        assert_eq!(notif.added.len(), 1);
        assert_eq!(status.action("a", &policy("x")), Some(StatusAction::Unchanged));
    }

    #[test]
    fn test_load_by_group_once() {
        let repo = MemoryRepo::default();
        repo.stored.lock().push(DeploymentRecord {
            pdp_id: "a".to_string(),
            policy: policy("x"),
            policy_type: policy_type(),
            pdp_group: "g1".to_string(),
            pdp_type: "xacml".to_string(),
            deploy: true,
            state: DeploymentState::Success,
        });

        let mut status = DeploymentStatus::new();
        status.load_by_group("g1", &repo).unwrap();
        assert_eq!(status.len(), 1);
        assert_eq!(status.action("a", &policy("x")), Some(StatusAction::Unchanged));

        // a loaded, already-complete policy produces no notification
        let mut notif = PolicyNotification::default();
        status.flush(&mut notif, &repo).unwrap();
        assert!(notif.is_empty());

        repo.stored.lock().clear();
        status.load_by_group("g1", &repo).unwrap();
        assert_eq!(status.len(), 1);
    }
}
