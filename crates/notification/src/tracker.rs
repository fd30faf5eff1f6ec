//! Per-policy acknowledgement counts and convergence detection.
//!
//! A [`DeploymentTracker`] is a snapshot of the ledger aggregated by policy:
//! for every policy it counts how many PDPs acknowledged successfully, how many
//! failed, and how many are still outstanding. Deploy and undeploy actions are
//! counted separately.
//!
//! Notifications come from comparing the previous snapshot with the current
//! one. A policy is reported when its convergence status changes:
//!
//! | previous | current | report? |
//! |----------|---------|---------|
//! | absent | complete | yes |
//! | absent | incomplete | no |
//! | incomplete | complete | yes |
//! | complete | complete, failure count changed | yes |
//! | complete | complete, same failures | no |
//! | complete | incomplete | yes |
//! | incomplete | incomplete | no |
//!
//! New successes on an already-complete policy are not reported, so PDPs can
//! join a group without generating noise.

use std::collections::HashMap;

use pap_common::PolicyIdent;

use crate::model::{DeploymentRecord, DeploymentState, PolicyNotification, PolicyStatus};

/// Aggregated counts by policy, split into deploy and undeploy actions.
#[derive(Debug, Clone, Default)]
pub struct DeploymentTracker {
    deploy: HashMap<PolicyIdent, PolicyStatus>,
    undeploy: HashMap<PolicyIdent, PolicyStatus>,
}

impl DeploymentTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one record.
    pub fn add(&mut self, record: &DeploymentRecord) {
        let map = if record.deploy {
            &mut self.deploy
        } else {
            &mut self.undeploy
        };

        let status = map
            .entry(record.policy.clone())
            .or_insert_with(|| PolicyStatus::new(&record.policy, &record.policy_type));

        match record.state {
            DeploymentState::Success => status.success_count += 1,
            DeploymentState::Failure => status.failure_count += 1,
            DeploymentState::Waiting => status.incomplete_count += 1,
        }
    }

    pub fn deployment_status(&self) -> impl Iterator<Item = &PolicyStatus> {
        self.deploy.values()
    }

    pub fn undeployment_status(&self) -> impl Iterator<Item = &PolicyStatus> {
        self.undeploy.values()
    }

    /// Adds to `notif` every policy whose status changed between `self` and
    /// `newer`.
    pub fn add_notifications(&self, notif: &mut PolicyNotification, newer: &DeploymentTracker) {
        merge(&mut notif.added, &self.deploy, &newer.deploy);
        merge(&mut notif.deleted, &self.undeploy, &newer.undeploy);
        self.add_missing(notif, newer);
    }

    /// Reports deployments that were complete and have since vanished, with
    /// all counts at zero.
    fn add_missing(&self, notif: &mut PolicyNotification, newer: &DeploymentTracker) {
        for (policy, status) in &self.deploy {
            if !status.is_complete() || newer.deploy.contains_key(policy) {
                // incomplete policies were never reported; present ones were merged
                continue;
            }

            notif.added.push(PolicyStatus {
                success_count: 0,
                failure_count: 0,
                incomplete_count: 0,
                ..status.clone()
            });
        }
    }
}

fn merge(
    list: &mut Vec<PolicyStatus>,
    original: &HashMap<PolicyIdent, PolicyStatus>,
    newer: &HashMap<PolicyIdent, PolicyStatus>,
) {
    for (policy, new_status) in newer {
        if need_notification(original.get(policy), new_status) {
            list.push(new_status.clone());
        }
    }
}

/// Decides whether the change from `old` to `new` must be reported.
pub fn need_notification(old: Option<&PolicyStatus>, new: &PolicyStatus) -> bool {
    let Some(old) = old else {
        return new.is_complete();
    };

    if new.is_complete() {
        return !old.is_complete() || new.failure_count != old.failure_count;
    }

    old.is_complete()
}
