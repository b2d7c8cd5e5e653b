//! Tether - pod mutation webhook for virtual-node multi-cluster scheduling
//!
//! Tether stretches a cluster across member clusters behind virtual nodes.
//! Pods scheduled onto a virtual node are really created again in a member
//! cluster by the syncer, so the scheduling constraints they carry mean
//! different things on each side. This webhook adapts pods at admission time:
//!
//! - On CREATE it strips member-cluster constraints from the live pod into a
//!   backup annotation (keeping an operator-supplied ignore list untouched),
//!   pins pods to the node their volume landed on, normalizes tolerations,
//!   and steers pods away from nodes already rejected for their owner.
//! - On UPDATE it records rejected nodes per workload owner, closing the
//!   feedback loop for the owner's next pod.
//!
//! # Modules
//!
//! - [`webhook`] - admission endpoints and the per-request decision engine
//! - [`rewrite`] - pure scheduling-constraint rewriting
//! - [`freeze`] - per-owner registry of rejected nodes
//! - [`volume`] - volume-locality pinning via the claim cache
//! - [`constants`] - interop label/annotation/taint keys
//! - [`error`] - error types for the webhook

#![deny(missing_docs)]

pub mod constants;
pub mod error;
pub mod freeze;
pub mod rewrite;
pub mod volume;
pub mod webhook;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Default port for the webhook HTTPS server
///
/// 8443 instead of 443 so the container does not need root privileges; the
/// fronting Service maps 443 to it.
pub const DEFAULT_WEBHOOK_PORT: u16 = 8443;
