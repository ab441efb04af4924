//! Observability for the supervisor daemon

mod metrics;

pub use metrics::*;
