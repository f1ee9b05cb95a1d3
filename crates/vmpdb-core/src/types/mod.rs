//! # Types
//!
//! Plain value types shared by the registry, the capability traits and the
//! display engine.

pub mod address;
pub mod process;

// Re-export all public types
pub use address::Address;
pub use process::{ProcessId, TargetInfo};
