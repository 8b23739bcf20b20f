//! API layer
//!
//! HTTP handlers for:
//! - ActivityPub (for federation)
//! - WebFinger discovery
//! - Board administration
//! - Metrics (Prometheus)

mod activitypub;
mod admin;
pub mod metrics;
mod wellknown;

pub use activitypub::{accepts_activity, activitypub_router};
pub use admin::{Admin, admin_router};
pub use metrics::metrics_router;
pub use wellknown::wellknown_router;
