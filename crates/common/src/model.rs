//! Fleet topology and policy model.
//!
//! A fleet is organized as a list of [`PdpGroup`]s. Each group holds one
//! [`PdpSubGroup`] per PDP type, and each subgroup lists the policies its PDPs
//! should run together with the [`Pdp`] instances currently registered in it:
//!
//! ```text
//! PdpGroup "defaultGroup" (ACTIVE)
//!   ├── PdpSubGroup "xacml"  policies=[onap.restart:1.0.0]  pdps=[xacml-1, xacml-2]
//!   └── PdpSubGroup "apex"   policies=[]                    pdps=[apex-1]
//! ```
//!
//! The topology itself is persisted by an external store (see
//! [`crate::store::TopologyStore`]); these types are the in-memory view of it.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Operational state of a PDP or PDP group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PdpState {
    /// Registered but not enforcing policies.
    Passive,
    /// Enforcing policies.
    Active,
    /// Enforcing a restricted fallback policy set.
    Safe,
    /// Under test.
    Test,
    /// Shutting down.
    Terminated,
}

impl fmt::Display for PdpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PdpState::Passive => "PASSIVE",
            PdpState::Active => "ACTIVE",
            PdpState::Safe => "SAFE",
            PdpState::Test => "TEST",
            PdpState::Terminated => "TERMINATED",
        };
        f.write_str(s)
    }
}

/// Health reported by a PDP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PdpHealthStatus {
    Healthy,
    NotHealthy,
    TestInProgress,
    #[default]
    Unknown,
}

/// Identifies a policy by name and version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PolicyIdent {
    pub name: String,
    pub version: String,
}

impl PolicyIdent {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for PolicyIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.version)
    }
}

/// Identifies a policy type by name and version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PolicyTypeIdent {
    pub name: String,
    pub version: String,
}

impl PolicyTypeIdent {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for PolicyTypeIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.version)
    }
}

/// A policy payload as shipped to PDPs in an UPDATE message.
///
/// The body is opaque to the control plane and carried as raw JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToscaPolicy {
    pub name: String,
    pub version: String,
    #[serde(rename = "type")]
    pub type_name: String,
    pub type_version: String,
    #[serde(default)]
    pub properties: serde_json::Value,
}

impl ToscaPolicy {
    pub fn new(ident: PolicyIdent, policy_type: PolicyTypeIdent) -> Self {
        Self {
            name: ident.name,
            version: ident.version,
            type_name: policy_type.name,
            type_version: policy_type.version,
            properties: serde_json::Value::Null,
        }
    }

    pub fn identifier(&self) -> PolicyIdent {
        PolicyIdent::new(&self.name, &self.version)
    }

    pub fn type_identifier(&self) -> PolicyTypeIdent {
        PolicyTypeIdent::new(&self.type_name, &self.type_version)
    }
}

/// A registered PDP instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pdp {
    pub instance_id: String,
    pub pdp_state: PdpState,
    #[serde(default)]
    pub healthy: PdpHealthStatus,
}

impl Pdp {
    pub fn new(instance_id: impl Into<String>, pdp_state: PdpState) -> Self {
        Self {
            instance_id: instance_id.into(),
            pdp_state,
            healthy: PdpHealthStatus::Unknown,
        }
    }
}

/// The PDPs of one type within a group, and the policies they run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PdpSubGroup {
    pub pdp_type: String,
    #[serde(default)]
    pub policies: Vec<PolicyIdent>,
    #[serde(default)]
    pub pdp_instances: Vec<Pdp>,
    #[serde(default)]
    pub current_instance_count: usize,
}

impl PdpSubGroup {
    pub fn new(pdp_type: impl Into<String>) -> Self {
        Self {
            pdp_type: pdp_type.into(),
            policies: Vec::new(),
            pdp_instances: Vec::new(),
            current_instance_count: 0,
        }
    }

    pub fn find_pdp(&self, instance_id: &str) -> Option<&Pdp> {
        self.pdp_instances
            .iter()
            .find(|pdp| pdp.instance_id == instance_id)
    }

    pub fn find_pdp_mut(&mut self, instance_id: &str) -> Option<&mut Pdp> {
        self.pdp_instances
            .iter_mut()
            .find(|pdp| pdp.instance_id == instance_id)
    }

    /// Adds a PDP instance, keeping the instance count in sync.
    ///
    /// Returns false if the instance was already present.
    pub fn add_pdp(&mut self, pdp: Pdp) -> bool {
        if self.find_pdp(&pdp.instance_id).is_some() {
            return false;
        }
        self.pdp_instances.push(pdp);
        self.current_instance_count = self.pdp_instances.len();
        true
    }

    /// Removes a PDP instance, keeping the instance count in sync.
    pub fn remove_pdp(&mut self, instance_id: &str) -> bool {
        let before = self.pdp_instances.len();
        self.pdp_instances.retain(|pdp| pdp.instance_id != instance_id);
        self.current_instance_count = self.pdp_instances.len();
        self.pdp_instances.len() != before
    }
}

/// A named group of PDP subgroups sharing one operational state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PdpGroup {
    pub name: String,
    pub pdp_group_state: PdpState,
    #[serde(default)]
    pub pdp_subgroups: Vec<PdpSubGroup>,
}

impl PdpGroup {
    pub fn new(name: impl Into<String>, state: PdpState) -> Self {
        Self {
            name: name.into(),
            pdp_group_state: state,
            pdp_subgroups: Vec::new(),
        }
    }

    pub fn with_subgroup(mut self, subgroup: PdpSubGroup) -> Self {
        self.pdp_subgroups.push(subgroup);
        self
    }

    pub fn find_subgroup(&self, pdp_type: &str) -> Option<&PdpSubGroup> {
        self.pdp_subgroups.iter().find(|sub| sub.pdp_type == pdp_type)
    }

    pub fn find_subgroup_mut(&mut self, pdp_type: &str) -> Option<&mut PdpSubGroup> {
        self.pdp_subgroups
            .iter_mut()
            .find(|sub| sub.pdp_type == pdp_type)
    }

    /// Finds the subgroup holding the given PDP instance.
    pub fn find_pdp(&self, instance_id: &str) -> Option<(&PdpSubGroup, &Pdp)> {
        self.pdp_subgroups
            .iter()
            .find_map(|sub| sub.find_pdp(instance_id).map(|pdp| (sub, pdp)))
    }

    /// Removes the PDP from whichever subgroup holds it.
    ///
    /// A PDP belongs to at most one subgroup, so the search stops at the first hit.
    pub fn remove_pdp(&mut self, instance_id: &str) -> bool {
        self.pdp_subgroups
            .iter_mut()
            .any(|sub| sub.remove_pdp(instance_id))
    }

    /// Iterates over every PDP instance in the group with its subgroup type.
    pub fn pdps(&self) -> impl Iterator<Item = (&PdpSubGroup, &Pdp)> {
        self.pdp_subgroups
            .iter()
            .flat_map(|sub| sub.pdp_instances.iter().map(move |pdp| (sub, pdp)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_group() -> PdpGroup {
        let mut xacml = PdpSubGroup::new("xacml");
        xacml.add_pdp(Pdp::new("xacml-1", PdpState::Active));
        xacml.add_pdp(Pdp::new("xacml-2", PdpState::Active));
        let mut apex = PdpSubGroup::new("apex");
        apex.add_pdp(Pdp::new("apex-1", PdpState::Active));
        PdpGroup::new("defaultGroup", PdpState::Active)
            .with_subgroup(xacml)
            .with_subgroup(apex)
    }

    #[test]
    fn test_find_pdp() {
        let group = sample_group();
        let (sub, pdp) = group.find_pdp("apex-1").unwrap();
        assert_eq!(sub.pdp_type, "apex");
        assert_eq!(pdp.instance_id, "apex-1");
        assert!(group.find_pdp("missing").is_none());
    }

    #[test]
    fn test_remove_pdp_updates_count() {
        let mut group = sample_group();
        assert!(group.remove_pdp("xacml-1"));
        let sub = group.find_subgroup("xacml").unwrap();
        assert_eq!(sub.current_instance_count, 1);
        assert!(!group.remove_pdp("xacml-1"));
    }

    #[test]
    fn test_add_pdp_rejects_duplicate() {
        let mut sub = PdpSubGroup::new("xacml");
        assert!(sub.add_pdp(Pdp::new("a", PdpState::Passive)));
        assert!(!sub.add_pdp(Pdp::new("a", PdpState::Active)));
        assert_eq!(sub.current_instance_count, 1);
    }

    #[test]
    fn test_pdp_state_serde() {
        let json = serde_json::to_string(&PdpState::Terminated).unwrap();
        assert_eq!(json, "\"TERMINATED\"");
        let state: PdpState = serde_json::from_str("\"ACTIVE\"").unwrap();
        assert_eq!(state, PdpState::Active);
    }

    #[test]
    fn test_tosca_policy_identifiers() {
        let policy = ToscaPolicy::new(
            PolicyIdent::new("restart", "1.0.0"),
            PolicyTypeIdent::new("onap.policies.Restart", "1.0.0"),
        );
        assert_eq!(policy.identifier().to_string(), "restart:1.0.0");
        let json = serde_json::to_value(&policy).unwrap();
        assert_eq!(json["type"], "onap.policies.Restart");
    }
}
