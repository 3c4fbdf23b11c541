//! reviewbot-web: the Ingestor's HTTP surface (webhook), the admin API, and
//! the Prometheus metrics endpoint.

pub mod api;
pub mod metrics;
pub mod webhook;

pub use api::{create_router, AppState};
