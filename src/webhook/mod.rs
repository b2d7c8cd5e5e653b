//! Mutating admission webhook for Tether
//!
//! Pods bound for a virtual node pass through here on CREATE and UPDATE.
//! CREATE rewrites the pod's scheduling constraints for the overlay and
//! answers with a JSON patch; UPDATE feeds the frozen-node registry so
//! replacement pods avoid nodes their siblings were already bounced from.
//!
//! This module is the transport boundary only: it owns the router and the
//! shared handler state. The decision logic lives in [`pod`].

pub mod pod;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};

use crate::freeze::FrozenNodeRegistry;
use crate::volume::ClaimLookup;

/// Shared state for webhook handlers
pub struct WebhookState {
    /// Nodes previously rejected per workload owner
    pub registry: Arc<FrozenNodeRegistry>,
    /// Local persistent-volume-claim cache for volume-affinity resolution
    pub claims: Arc<dyn ClaimLookup>,
    /// Selector/affinity label keys the rewriter must leave on the live pod
    pub ignore_keys: Vec<String>,
}

impl WebhookState {
    /// Create webhook state with an empty frozen-node registry
    pub fn new(claims: Arc<dyn ClaimLookup>, ignore_keys: Vec<String>) -> Self {
        Self {
            registry: Arc::new(FrozenNodeRegistry::new()),
            claims,
            ignore_keys,
        }
    }
}

/// Create the webhook router with all mutation endpoints
///
/// - POST /mutate/pods - Mutate pods for virtual-node scheduling
/// - GET /healthz - liveness probe
pub fn webhook_router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/mutate/pods", post(pod::mutate_handler))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(state)
}
