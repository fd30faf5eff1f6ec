//! PDP message dispatch for the policy administration point.
//!
//! This crate drives every message the PAP sends to its fleet of policy
//! decision points (PDPs) from submission to outcome:
//!
//! ```text
//!   add_request ──► PdpRequestMap ──► PdpRequests (per PDP) ──► Request
//!                        ▲                                        │ enqueue
//!                        │ outcome                                ▼
//!   status ──► PdpStatusHandler ──► ResponseDispatcher       Publisher ──► TopicSink
//!                  │                                              ▲
//!                  └──► HeartbeatTracker ──── probe ──────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`PdpRequestMap`]: the fleet dispatch table; all submissions go here
//! - [`Request`]: one outbound message with its retry state machine
//! - [`Publisher`] / [`QueueToken`]: the outbound queue and its replaceable slots
//! - [`TimerManager`]: response timeouts, one manager per message kind
//! - [`HeartbeatTracker`]: probes PDPs that stopped reporting
//! - [`PdpStatusHandler`]: entry point for inbound status messages
//! - [`CommContext`]: the shared pieces every component is built from
//!
//! # Guarantees
//!
//! - At most one request per PDP is in flight; the rest wait by priority.
//! - A replaced or withdrawn message is never transmitted after the fact.
//! - Timer and response callbacks that lost a race with a stop are dropped.

pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod heartbeat;
pub mod metrics;
pub mod pdp_requests;
pub mod publisher;
pub mod request;
pub mod request_map;
pub mod status_handler;
pub mod timer;
pub mod token;

pub use config::{CommConfig, RequestKindConfig};
pub use context::CommContext;
pub use dispatcher::{ResponseDispatcher, ResponseHandler};
pub use error::{CommError, Result};
pub use heartbeat::HeartbeatTracker;
pub use metrics::{CommMetrics, CommMetricsSnapshot, Counter};
pub use pdp_requests::{PdpRequests, QueueOrigin, QueueSnapshot, RequestSnapshot};
pub use publisher::{MessageToken, Publisher, TopicSink};
pub use request::{Mismatch, Request, RequestBehavior, RequestState};
pub use request_map::{PdpRequestMap, PolicyUndeployer};
pub use status_handler::{PdpStatusHandler, StatusDisposition};
pub use timer::{Timer, TimerCallback, TimerManager};
pub use token::QueueToken;
