//! Shared types, adapter traits, and error types for the replication engine.
//!
//! This crate contains the foundational types shared between the server-side
//! components and all adapter implementations. Extracting these into a
//! separate crate allows adapter crates to compile in parallel with the
//! components that consume them.

#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![forbid(unsafe_code)]

pub mod adapters;
pub mod error;
pub mod prelude;
pub mod types;
pub mod utils;
pub mod worker;

// vim: ts=4
