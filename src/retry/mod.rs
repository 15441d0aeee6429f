//! Retry module
//! - policy.rs: bounded exponential backoff for transient tool failures

pub mod policy;

pub use policy::*;
