//! Shared types for the policy administration point (PAP) control plane.
//!
//! This crate holds everything the dispatch engine (`pap-comm`) and the
//! deployment status aggregator (`pap-notification`) agree on:
//!
//! - [`model`]: PDP states, policy identifiers, and the group/subgroup/instance
//!   topology of the fleet
//! - [`message`]: outbound [`PdpMessage`]s and inbound [`PdpStatus`] reports
//! - [`store`]: the [`TopologyStore`] and [`PolicyRepository`] collaborator
//!   interfaces
//! - [`time`]: millisecond timestamps and message-age checks
//! - [`error`]: the common [`Error`] type

pub mod error;
pub mod message;
pub mod model;
pub mod store;
pub mod time;

pub use error::{Error, Result};
pub use message::{
    MessageKind, PdpHealthCheck, PdpMessage, PdpResponseDetails, PdpResponseStatus,
    PdpStateChange, PdpStatus, PdpUpdate, PAP_SOURCE,
};
pub use model::{
    Pdp, PdpGroup, PdpHealthStatus, PdpState, PdpSubGroup, PolicyIdent, PolicyTypeIdent,
    ToscaPolicy,
};
pub use store::{PolicyRepository, TopologyStore};
