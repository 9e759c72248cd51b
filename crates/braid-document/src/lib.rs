//! Document store: registry of live CRDT document instances per
//! collection, plus the typed field variants documents are built from.

#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![forbid(unsafe_code)]

mod json;
mod store;
mod value;

pub use store::{DocumentHandle, DocumentStore};
pub use value::{CounterEntry, FieldKind, RegisterEntry, SetElement};

// vim: ts=4
