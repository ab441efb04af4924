//! Common types and traits for streamward
//!
//! This crate provides the monitor data model, the process-table platform
//! abstraction and the capture pipeline signature shared by the supervisor.

pub mod channel;
pub mod platform;
pub mod records;
pub mod signatures;

pub use channel::*;
pub use platform::*;
pub use records::*;
pub use signatures::*;
