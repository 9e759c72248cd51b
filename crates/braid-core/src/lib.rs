//! Core infrastructure for the Braid replication engine: app state,
//! scheduler, and the extension map feature crates register state into.

#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![forbid(unsafe_code)]

pub mod app;
pub mod extensions;
pub mod scheduler;

pub use app::{Adapters, App, AppState, Config};
pub use extensions::Extensions;
pub use scheduler::Scheduler;

// vim: ts=4
