//! streamward-agent library
//!
//! Supervises capture pipelines against a durable desired-state store and
//! exposes the HTTP control plane used by the daemon binary.

pub mod api;
pub mod config;
pub mod launcher;
pub mod monitor;
pub mod observability;
pub mod storage;
pub mod supervisor;
pub mod upstream;

pub use config::AgentConfig;
pub use storage::Storage;
pub use supervisor::{ControlError, Supervisor, SupervisorSettings};
