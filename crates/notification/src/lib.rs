//! Deployment status tracking and fleet-wide policy notifications.
//!
//! PDPs acknowledge policy changes one at a time and in no particular order.
//! This crate consolidates those acknowledgements into a single notification
//! per policy once every PDP expected to act on it has answered.
//!
//! # Components
//!
//! - [`DeploymentStatus`]: the ledger of (PDP, policy) records, each WAITING,
//!   SUCCESS or FAILURE, with change markers for batched persistence
//! - [`DeploymentTracker`]: per-policy counts and the convergence rules that
//!   decide when a policy is worth reporting
//! - [`PolicyNotifier`]: a thread-safe wrapper that flushes after every change
//!   and hands non-empty [`PolicyNotification`]s to a [`NotificationPublisher`]
//! - [`StatusRepository`]: the persistence interface the ledger writes through
//!
//! # Example
//!
//! ```rust
//! use std::collections::HashSet;
//! use pap_common::{PolicyIdent, PolicyTypeIdent};
//! use pap_notification::DeploymentStatus;
//!
//! let policy = PolicyIdent::new("restart", "1.0.0");
//! let policy_type = PolicyTypeIdent::new("onap.policies.Restart", "1.0.0");
//!
//! let mut status = DeploymentStatus::new();
//! status.deploy("pdp-a", &policy, &policy_type, "defaultGroup", "xacml", true);
//!
//! let reported: HashSet<_> = [policy.clone()].into_iter().collect();
//! status.complete_deploy("pdp-a", &reported, &reported);
//! ```

pub mod error;
pub mod model;
pub mod notifier;
pub mod repository;
pub mod status;
pub mod tracker;

pub use error::{NotifyError, Result};
pub use model::{DeploymentRecord, DeploymentState, PolicyNotification, PolicyStatus, StatusKey};
pub use notifier::{NotificationPublisher, PolicyNotifier};
pub use repository::StatusRepository;
pub use status::{DeploymentStatus, StatusAction};
pub use tracker::DeploymentTracker;
