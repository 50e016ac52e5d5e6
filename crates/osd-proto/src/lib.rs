//! # osd-proto
//!
//! Types, constants and striping arithmetic shared by the object storage
//! daemon and its maintenance tooling.
//!
//! This crate defines the error taxonomy, the on-disk naming constants,
//! tunable defaults and the `StripingPolicy` that maps object numbers to
//! sizes, offsets and owning nodes.

pub mod constants;
pub mod defaults;
pub mod error;
pub mod hash;
pub mod striping;

// Re-export commonly used types at the crate root
pub use error::{OsdError, OsdResult};
pub use striping::StripingPolicy;
