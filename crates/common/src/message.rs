//! Messages exchanged with PDPs.
//!
//! Outbound messages ([`PdpMessage`]) are published on a topic every PDP
//! subscribes to; each PDP filters by its own name. Inbound [`PdpStatus`]
//! messages arrive on the same topic family, either unsolicited (registration
//! and heartbeats) or as a response naming the `requestId` they answer.
//!
//! # Wire format
//!
//! ```json
//! {
//!   "messageType": "UPDATE",
//!   "requestId": "5f0b1a4e-...",
//!   "source": "pap",
//!   "timestampMs": 1700000000000,
//!   "name": "xacml-1",
//!   "pdpGroup": "defaultGroup",
//!   "pdpSubgroup": "xacml",
//!   "policiesToBeDeployed": [],
//!   "policiesToBeUndeployed": [],
//!   "pdpHeartbeatIntervalMs": 60000
//! }
//! ```
//!
//! Every constructed message receives a fresh v4 UUID as its request id.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{PdpHealthStatus, PdpState, PolicyIdent, ToscaPolicy};
use crate::time::current_timestamp_ms;

/// Value of the `source` field on every outbound message.
pub const PAP_SOURCE: &str = "pap";

fn new_request_id() -> String {
    Uuid::new_v4().to_string()
}

/// The kinds of outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(usize)]
pub enum MessageKind {
    Update = 0,
    StateChange = 1,
    HealthCheck = 2,
}

impl MessageKind {
    /// Number of message kinds.
    pub const COUNT: usize = 3;

    /// All kinds, in index order.
    pub const ALL: [MessageKind; MessageKind::COUNT] = [
        MessageKind::Update,
        MessageKind::StateChange,
        MessageKind::HealthCheck,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Short type name used in log output.
    pub fn type_name(self) -> &'static str {
        match self {
            MessageKind::Update => "PdpUpdate",
            MessageKind::StateChange => "PdpStateChange",
            MessageKind::HealthCheck => "PdpHealthCheck",
        }
    }
}

/// Instructs a PDP which policies to deploy and undeploy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PdpUpdate {
    pub request_id: String,
    pub source: String,
    pub timestamp_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub pdp_group: Option<String>,
    #[serde(default)]
    pub pdp_subgroup: Option<String>,
    #[serde(default)]
    pub policies_to_be_deployed: Vec<ToscaPolicy>,
    #[serde(default)]
    pub policies_to_be_undeployed: Vec<PolicyIdent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pdp_heartbeat_interval_ms: Option<u64>,
}

impl PdpUpdate {
    /// Creates an empty UPDATE addressed to one PDP.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::broadcast()
        }
    }

    /// Creates an empty UPDATE with no target PDP.
    pub fn broadcast() -> Self {
        Self {
            request_id: new_request_id(),
            source: PAP_SOURCE.to_string(),
            timestamp_ms: current_timestamp_ms(),
            name: None,
            pdp_group: None,
            pdp_subgroup: None,
            policies_to_be_deployed: Vec::new(),
            policies_to_be_undeployed: Vec::new(),
            pdp_heartbeat_interval_ms: None,
        }
    }

    pub fn with_group(mut self, group: impl Into<String>, subgroup: impl Into<String>) -> Self {
        self.pdp_group = Some(group.into());
        self.pdp_subgroup = Some(subgroup.into());
        self
    }

    pub fn with_deploy(mut self, policies: Vec<ToscaPolicy>) -> Self {
        self.policies_to_be_deployed = policies;
        self
    }

    pub fn with_undeploy(mut self, policies: Vec<PolicyIdent>) -> Self {
        self.policies_to_be_undeployed = policies;
        self
    }

    pub fn with_heartbeat_interval_ms(mut self, interval_ms: u64) -> Self {
        self.pdp_heartbeat_interval_ms = Some(interval_ms);
        self
    }

    /// Identifiers of the policies to be deployed.
    pub fn deploy_idents(&self) -> HashSet<PolicyIdent> {
        self.policies_to_be_deployed
            .iter()
            .map(ToscaPolicy::identifier)
            .collect()
    }

    /// Identifiers of the policies to be undeployed.
    pub fn undeploy_idents(&self) -> HashSet<PolicyIdent> {
        self.policies_to_be_undeployed.iter().cloned().collect()
    }
}

/// Instructs a PDP to change its operational state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PdpStateChange {
    pub request_id: String,
    pub source: String,
    pub timestamp_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub pdp_group: Option<String>,
    #[serde(default)]
    pub pdp_subgroup: Option<String>,
    pub state: PdpState,
}

impl PdpStateChange {
    pub fn new(name: impl Into<String>, state: PdpState) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::broadcast(state)
        }
    }

    pub fn broadcast(state: PdpState) -> Self {
        Self {
            request_id: new_request_id(),
            source: PAP_SOURCE.to_string(),
            timestamp_ms: current_timestamp_ms(),
            name: None,
            pdp_group: None,
            pdp_subgroup: None,
            state,
        }
    }

    pub fn with_group(mut self, group: impl Into<String>, subgroup: impl Into<String>) -> Self {
        self.pdp_group = Some(group.into());
        self.pdp_subgroup = Some(subgroup.into());
        self
    }
}

/// Asks a PDP to report its status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PdpHealthCheck {
    pub request_id: String,
    pub source: String,
    pub timestamp_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub pdp_group: Option<String>,
    #[serde(default)]
    pub pdp_subgroup: Option<String>,
}

impl PdpHealthCheck {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            request_id: new_request_id(),
            source: PAP_SOURCE.to_string(),
            timestamp_ms: current_timestamp_ms(),
            name: Some(name.into()),
            pdp_group: None,
            pdp_subgroup: None,
        }
    }
}

/// An outbound message to a PDP.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "messageType")]
pub enum PdpMessage {
    #[serde(rename = "UPDATE")]
    Update(PdpUpdate),
    #[serde(rename = "STATE_CHANGE")]
    StateChange(PdpStateChange),
    #[serde(rename = "HEALTH_CHECK")]
    HealthCheck(PdpHealthCheck),
}

impl PdpMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            PdpMessage::Update(_) => MessageKind::Update,
            PdpMessage::StateChange(_) => MessageKind::StateChange,
            PdpMessage::HealthCheck(_) => MessageKind::HealthCheck,
        }
    }

    /// Target PDP, or `None` for a broadcast.
    pub fn name(&self) -> Option<&str> {
        match self {
            PdpMessage::Update(m) => m.name.as_deref(),
            PdpMessage::StateChange(m) => m.name.as_deref(),
            PdpMessage::HealthCheck(m) => m.name.as_deref(),
        }
    }

    pub fn request_id(&self) -> &str {
        match self {
            PdpMessage::Update(m) => &m.request_id,
            PdpMessage::StateChange(m) => &m.request_id,
            PdpMessage::HealthCheck(m) => &m.request_id,
        }
    }

    pub fn pdp_group(&self) -> Option<&str> {
        match self {
            PdpMessage::Update(m) => m.pdp_group.as_deref(),
            PdpMessage::StateChange(m) => m.pdp_group.as_deref(),
            PdpMessage::HealthCheck(m) => m.pdp_group.as_deref(),
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.name().is_none()
    }
}

impl From<PdpUpdate> for PdpMessage {
    fn from(msg: PdpUpdate) -> Self {
        PdpMessage::Update(msg)
    }
}

impl From<PdpStateChange> for PdpMessage {
    fn from(msg: PdpStateChange) -> Self {
        PdpMessage::StateChange(msg)
    }
}

impl From<PdpHealthCheck> for PdpMessage {
    fn from(msg: PdpHealthCheck) -> Self {
        PdpMessage::HealthCheck(msg)
    }
}

/// Outcome reported in a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PdpResponseStatus {
    Success,
    Fail,
}

/// Correlates a status message with the request it answers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PdpResponseDetails {
    pub response_to: String,
    pub response_status: PdpResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_message: Option<String>,
}

/// Status reported by a PDP.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PdpStatus {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub pdp_type: Option<String>,
    #[serde(default)]
    pub pdp_group: Option<String>,
    #[serde(default)]
    pub pdp_subgroup: Option<String>,
    pub state: PdpState,
    #[serde(default)]
    pub healthy: PdpHealthStatus,
    #[serde(default)]
    pub policies: Vec<PolicyIdent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<PdpResponseDetails>,
    pub timestamp_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statistics: Option<serde_json::Value>,
}

impl PdpStatus {
    /// Creates a status for `name`, stamped now.
    pub fn new(name: impl Into<String>, state: PdpState) -> Self {
        Self {
            name: Some(name.into()),
            pdp_type: None,
            pdp_group: None,
            pdp_subgroup: None,
            state,
            healthy: PdpHealthStatus::Healthy,
            policies: Vec::new(),
            response: None,
            timestamp_ms: current_timestamp_ms(),
            statistics: None,
        }
    }

    pub fn with_type(mut self, pdp_type: impl Into<String>) -> Self {
        self.pdp_type = Some(pdp_type.into());
        self
    }

    pub fn with_group(mut self, group: impl Into<String>, subgroup: impl Into<String>) -> Self {
        self.pdp_group = Some(group.into());
        self.pdp_subgroup = Some(subgroup.into());
        self
    }

    pub fn with_policies(mut self, policies: Vec<PolicyIdent>) -> Self {
        self.policies = policies;
        self
    }

    /// Marks this status as a successful response to `request_id`.
    pub fn in_response_to(mut self, request_id: impl Into<String>) -> Self {
        self.response = Some(PdpResponseDetails {
            response_to: request_id.into(),
            response_status: PdpResponseStatus::Success,
            response_message: None,
        });
        self
    }

    /// The request id this status answers, if any.
    pub fn response_to(&self) -> Option<&str> {
        self.response.as_ref().map(|r| r.response_to.as_str())
    }

    pub fn policy_set(&self) -> HashSet<PolicyIdent> {
        self.policies.iter().cloned().collect()
    }
}
