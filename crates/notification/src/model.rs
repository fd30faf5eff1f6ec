//! Deployment records and the notifications built from them.

use std::fmt;

use pap_common::{PolicyIdent, PolicyTypeIdent};
use serde::{Deserialize, Serialize};

/// Acknowledgement state of one (PDP, policy) record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentState {
    /// Sent to the PDP, not yet acknowledged.
    Waiting,
    /// The PDP reports the desired state.
    Success,
    /// The PDP reports something other than the desired state.
    Failure,
}

/// Desired versus acknowledged state of one policy on one PDP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentRecord {
    pub pdp_id: String,
    pub policy: PolicyIdent,
    pub policy_type: PolicyTypeIdent,
    pub pdp_group: String,
    pub pdp_type: String,
    /// True if the policy should be deployed, false if undeployed.
    pub deploy: bool,
    pub state: DeploymentState,
}

/// Key of a deployment record: at most one record per (PDP, policy).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StatusKey {
    pub pdp_id: String,
    pub policy: PolicyIdent,
}

impl StatusKey {
    pub fn new(pdp_id: impl Into<String>, policy: PolicyIdent) -> Self {
        Self {
            pdp_id: pdp_id.into(),
            policy,
        }
    }

    pub fn of(record: &DeploymentRecord) -> Self {
        Self::new(record.pdp_id.clone(), record.policy.clone())
    }
}

impl fmt::Display for StatusKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.pdp_id, self.policy)
    }
}

/// Fleet-wide acknowledgement counts for one policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyStatus {
    pub policy_id: String,
    pub policy_version: String,
    pub policy_type_id: String,
    pub policy_type_version: String,
    pub success_count: u32,
    pub failure_count: u32,
    pub incomplete_count: u32,
}

impl PolicyStatus {
    /// A status with all counts at zero.
    pub fn new(policy: &PolicyIdent, policy_type: &PolicyTypeIdent) -> Self {
        Self {
            policy_id: policy.name.clone(),
            policy_version: policy.version.clone(),
            policy_type_id: policy_type.name.clone(),
            policy_type_version: policy_type.version.clone(),
            success_count: 0,
            failure_count: 0,
            incomplete_count: 0,
        }
    }

    pub fn policy(&self) -> PolicyIdent {
        PolicyIdent::new(&self.policy_id, &self.policy_version)
    }

    pub fn is_complete(&self) -> bool {
        self.incomplete_count == 0
    }
}

/// Summary of deployment and undeployment progress, published to observers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyNotification {
    #[serde(rename = "deployed-policies")]
    pub added: Vec<PolicyStatus>,
    #[serde(rename = "undeployed-policies")]
    pub deleted: Vec<PolicyStatus>,
}

impl PolicyNotification {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.deleted.is_empty()
    }
}
