//! API layer
//!
//! HTTP handlers for:
//! - ActivityPub (actor document and inboxes)
//! - Metrics (Prometheus)

mod activitypub;
pub mod metrics;

pub use activitypub::activitypub_router;
pub use metrics::metrics_router;
