//! Interfaces to the external stores the control plane consumes.
//!
//! The control plane never owns persistent state. Fleet topology and policy
//! payloads live behind these traits; implementations are supplied by the
//! embedding service (a database-backed DAO in production, in-memory fakes in
//! tests). Implementations must be safe to call from any thread, and calls are
//! made synchronously while no control-plane lock is held.

use crate::error::Result;
use crate::model::{PdpGroup, PdpState, PolicyIdent, ToscaPolicy};

/// Access to persisted PDP group/subgroup membership.
pub trait TopologyStore: Send + Sync {
    /// Returns every PDP group.
    fn get_groups(&self) -> Result<Vec<PdpGroup>>;

    /// Persists modified groups.
    ///
    /// Returns [`crate::Error::AlreadyExists`] if another coordinator replica
    /// registered the same PDP concurrently.
    fn update_groups(&self, groups: &[PdpGroup]) -> Result<()>;

    /// Returns the groups in the given state.
    fn get_groups_in_state(&self, state: PdpState) -> Result<Vec<PdpGroup>> {
        Ok(self
            .get_groups()?
            .into_iter()
            .filter(|group| group.pdp_group_state == state)
            .collect())
    }
}

/// Resolves policy identifiers to full policy payloads.
pub trait PolicyRepository: Send + Sync {
    /// Returns the policies named by `idents`.
    ///
    /// Unknown identifiers are an error; a PDP must never be told to deploy
    /// a subset of its subgroup's policies.
    fn get_policies(&self, idents: &[PolicyIdent]) -> Result<Vec<ToscaPolicy>>;
}
