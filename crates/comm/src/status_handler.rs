//! Inbound PDP status handling.
//!
//! Every status message from a PDP lands here. Depending on its content it is
//! one of:
//!
//! - a **response** (it names the request it answers): routed to that request
//! - a **registration** (the PDP reports no subgroup): the PDP is placed in an
//!   ACTIVE group with a subgroup for its type and sent its policies and state
//! - a **heartbeat**: checked against the topology, with corrective messages
//!   sent on any drift, or the PDP removed if it reports TERMINATED
//!
//! Stale messages are discarded unread; every accepted message counts as
//! proof of life for the heartbeat tracker.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use pap_common::time::is_expired;
use pap_common::{
    Pdp, PdpGroup, PdpState, PdpStateChange, PdpStatus, PdpUpdate, PolicyRepository,
    TopologyStore,
};
use tracing::{debug, info, warn};

use crate::context::CommContext;
use crate::dispatcher::ResponseDispatcher;
use crate::error::Result;
use crate::heartbeat::HeartbeatTracker;
use crate::metrics::CommMetrics;
use crate::request_map::PdpRequestMap;

/// What was done with a status message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusDisposition {
    /// Older than the configured maximum age.
    Expired,
    /// Unusable; the reason is logged.
    Rejected(String),
    /// A response; `matched` is false if no request was waiting for it.
    Response { matched: bool },
    /// The PDP was added to a group and sent its configuration.
    Registered,
    /// A routine heartbeat from a known PDP.
    Heartbeat,
    /// The PDP reported TERMINATED and was removed.
    Terminated,
}

/// Entry point for inbound status messages.
pub struct PdpStatusHandler {
    topology: Arc<dyn TopologyStore>,
    policies: Arc<dyn PolicyRepository>,
    requests: PdpRequestMap,
    dispatcher: Arc<ResponseDispatcher>,
    tracker: Arc<HeartbeatTracker>,
    metrics: Arc<CommMetrics>,
    heartbeat_interval: Duration,
    max_message_age: Duration,
}

impl PdpStatusHandler {
    pub fn new(
        ctx: &CommContext,
        policies: Arc<dyn PolicyRepository>,
        requests: PdpRequestMap,
        tracker: Arc<HeartbeatTracker>,
    ) -> Self {
        Self {
            topology: Arc::clone(&ctx.topology),
            policies,
            requests,
            dispatcher: Arc::clone(&ctx.dispatcher),
            tracker,
            metrics: Arc::clone(&ctx.metrics),
            heartbeat_interval: ctx.config.heartbeat_interval,
            max_message_age: ctx.config.max_message_age,
        }
    }

    /// Decodes and handles a JSON status message.
    pub fn handle_message(&self, json: &str) -> Result<StatusDisposition> {
        let status: PdpStatus = serde_json::from_str(json)?;
        self.handle(&status)
    }

    pub fn handle(&self, status: &PdpStatus) -> Result<StatusDisposition> {
        if is_expired(status.timestamp_ms, self.max_message_age) {
            debug!(
                pdp = ?status.name,
                timestamp_ms = status.timestamp_ms,
                "discarding expired status"
            );
            self.metrics.expired_messages.inc();
            return Ok(StatusDisposition::Expired);
        }

        let Some(name) = status.name.as_deref() else {
            warn!("discarding status without a PDP name");
            return Ok(StatusDisposition::Rejected("missing PDP name".to_string()));
        };
        self.tracker.mark_seen(name);

        if status.response.is_some() {
            let matched = self.dispatcher.dispatch(status);
            return Ok(StatusDisposition::Response { matched });
        }

        if status.pdp_subgroup.is_none() {
            self.handle_registration(name, status)
        } else {
            self.handle_heartbeat(name, status)
        }
    }

    fn handle_registration(&self, name: &str, status: &PdpStatus) -> Result<StatusDisposition> {
        let Some(pdp_type) = status.pdp_type.as_deref() else {
            warn!(pdp = name, "registration without a PDP type");
            return Ok(StatusDisposition::Rejected("missing PDP type".to_string()));
        };

        let mut groups = self.topology.get_groups_in_state(PdpState::Active)?;
        // the group the PDP asked for wins if it has room for this type
        groups.sort_by_key(|group| status.pdp_group.as_deref() != Some(group.name.as_str()));
        let Some(mut group) = groups
            .into_iter()
            .find(|group| group.find_subgroup(pdp_type).is_some())
        else {
            warn!(pdp = name, pdp_type, "no ACTIVE group has a subgroup for this PDP type");
            return Ok(StatusDisposition::Rejected(format!(
                "no group for PDP type {pdp_type}"
            )));
        };

        let state = group.pdp_group_state;
        if let Some(subgroup) = group.find_subgroup_mut(pdp_type) {
            let mut pdp = Pdp::new(name, state);
            pdp.healthy = status.healthy;
            subgroup.add_pdp(pdp);
        }

        match self.topology.update_groups(std::slice::from_ref(&group)) {
            Ok(()) => info!(pdp = name, group = %group.name, subgroup = pdp_type, "PDP registered"),
            Err(e) if e.is_duplicate() => {
                info!(pdp = name, group = %group.name, "PDP already registered")
            }
            Err(e) => return Err(e.into()),
        }

        self.send_pdp_messages(name, &group, pdp_type)?;
        Ok(StatusDisposition::Registered)
    }

    fn handle_heartbeat(&self, name: &str, status: &PdpStatus) -> Result<StatusDisposition> {
        let groups = self.topology.get_groups()?;
        let known = groups.into_iter().find(|group| {
            status.pdp_group.as_deref() == Some(group.name.as_str())
                && group.find_pdp(name).is_some()
        });
        let Some(mut group) = known else {
            debug!(pdp = name, "heartbeat from unknown PDP, registering");
            return self.handle_registration(name, status);
        };

        if status.state == PdpState::Terminated {
            group.remove_pdp(name);
            self.topology.update_groups(std::slice::from_ref(&group))?;
            self.requests.stop_publishing(name);
            info!(pdp = name, group = %group.name, "PDP terminated");
            return Ok(StatusDisposition::Terminated);
        }

        let Some((subgroup, pdp)) = group.find_pdp(name) else {
            return Ok(StatusDisposition::Heartbeat);
        };
        let pdp_type = subgroup.pdp_type.clone();
        let expected: HashSet<_> = subgroup.policies.iter().cloned().collect();
        let health_changed = pdp.healthy != status.healthy;

        let drifted = status.pdp_subgroup.as_deref() != Some(pdp_type.as_str())
            || status.state != group.pdp_group_state
            || status.policy_set() != expected;

        if health_changed {
            if let Some(pdp) = group
                .find_subgroup_mut(&pdp_type)
                .and_then(|sub| sub.find_pdp_mut(name))
            {
                pdp.healthy = status.healthy;
            }
            if let Err(e) = self.topology.update_groups(std::slice::from_ref(&group)) {
                warn!(pdp = name, error = %e, "cannot record PDP health");
            }
        }

        if drifted {
            info!(
                pdp = name,
                reported_state = %status.state,
                expected_state = %group.pdp_group_state,
                "PDP out of sync, resending configuration"
            );
            self.send_pdp_messages(name, &group, &pdp_type)?;
        }
        Ok(StatusDisposition::Heartbeat)
    }

    /// Sends the PDP its subgroup's full policy set and its group's state.
    fn send_pdp_messages(&self, name: &str, group: &PdpGroup, pdp_type: &str) -> Result<()> {
        let idents = group
            .find_subgroup(pdp_type)
            .map(|sub| sub.policies.clone())
            .unwrap_or_default();
        let policies = self.policies.get_policies(&idents)?;

        let update = PdpUpdate::new(name)
            .with_group(&group.name, pdp_type)
            .with_deploy(policies)
            .with_heartbeat_interval_ms(self.heartbeat_interval.as_millis() as u64);
        let state_change =
            PdpStateChange::new(name, group.pdp_group_state).with_group(&group.name, pdp_type);

        self.requests.add_request(Some(update), Some(state_change))
    }
}
