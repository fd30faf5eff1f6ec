//! Heartbeat tracker.
//!
//! PDPs are expected to report status every heartbeat interval. Once per
//! interval the tracker walks the fleet topology and counts, per PDP, the
//! passes during which nothing was heard from it:
//!
//! ```text
//!  pass:        1     2     3        4     5   (status)   6
//!  missed:      1     2     3 probe  3     3      →0      1 ...
//! ```
//!
//! Reaching the threshold sends exactly one liveness probe: a STATE-CHANGE to
//! the PDP's current group state. Further silent passes send nothing more, and
//! a probe that goes unanswered is escalated by the request machinery like any
//! other. Hearing from the PDP resets its count.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use pap_common::{PdpStateChange, TopologyStore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::CommContext;
use crate::metrics::CommMetrics;
use crate::request_map::PdpRequestMap;

#[derive(Debug, Default, Clone, Copy)]
struct Liveness {
    missed: u32,
    seen: bool,
}

/// Periodic liveness checker for every PDP in the topology.
pub struct HeartbeatTracker {
    topology: Arc<dyn TopologyStore>,
    requests: PdpRequestMap,
    interval: Duration,
    threshold: u32,
    probe_enabled: bool,
    metrics: Arc<CommMetrics>,
    pdps: Mutex<HashMap<String, Liveness>>,
    shutdown: CancellationToken,
}

impl HeartbeatTracker {
    pub fn new(ctx: &CommContext, requests: PdpRequestMap) -> Arc<Self> {
        Arc::new(Self {
            topology: Arc::clone(&ctx.topology),
            requests,
            interval: ctx.config.heartbeat_interval,
            threshold: ctx.config.missed_heartbeat_threshold,
            probe_enabled: ctx.config.heartbeat_probe_enabled,
            metrics: Arc::clone(&ctx.metrics),
            pdps: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Records that the PDP reported in.
    pub fn mark_seen(&self, pdp: &str) {
        let mut pdps = self.pdps.lock();
        let liveness = pdps.entry(pdp.to_string()).or_default();
        liveness.seen = true;
        liveness.missed = 0;
    }

    /// Silent passes counted for the PDP, if it is tracked.
    pub fn missed_count(&self, pdp: &str) -> Option<u32> {
        self.pdps.lock().get(pdp).map(|l| l.missed)
    }

    /// Runs one pass over the topology; returns the number of probes sent.
    pub fn evaluate(&self) -> usize {
        let groups = match self.topology.get_groups() {
            Ok(groups) => groups,
            Err(e) => {
                warn!(error = %e, "cannot read PDP groups, skipping heartbeat pass");
                return 0;
            }
        };

        let mut probes = Vec::new();
        {
            let mut pdps = self.pdps.lock();
            let mut present = HashSet::new();

            for group in &groups {
                for (subgroup, pdp) in group.pdps() {
                    present.insert(pdp.instance_id.clone());
                    let liveness = pdps.entry(pdp.instance_id.clone()).or_default();

                    if liveness.seen {
                        liveness.seen = false;
                        liveness.missed = 0;
                        continue;
                    }
                    if liveness.missed >= self.threshold {
                        continue;
                    }

                    liveness.missed += 1;
                    if liveness.missed == self.threshold {
                        probes.push(
                            PdpStateChange::new(&pdp.instance_id, group.pdp_group_state)
                                .with_group(&group.name, &subgroup.pdp_type),
                        );
                    }
                }
            }

            pdps.retain(|pdp, _| present.contains(pdp));
        }

        if !self.probe_enabled {
            return 0;
        }

        let count = probes.len();
        for probe in probes {
            let pdp = probe.name.clone().unwrap_or_default();
            info!(pdp = %pdp, missed = self.threshold, "PDP silent, sending probe");
            self.metrics.heartbeat_probes.inc();
            if let Err(e) = self.requests.add_state_change(probe) {
                warn!(pdp = %pdp, error = %e, "cannot submit probe");
            }
        }
        count
    }

    /// Spawns the periodic pass. The first pass runs one interval after start.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(this.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval.tick().await;

            debug!(interval_ms = this.interval.as_millis() as u64, "heartbeat tracker started");
            loop {
                tokio::select! {
                    _ = this.shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        this.evaluate();
                    }
                }
            }
            debug!("heartbeat tracker exited");
        })
    }

    /// Stops the periodic pass. Idempotent.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}
