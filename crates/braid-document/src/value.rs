//! Typed CRDT field variants. Each field on a document statically
//! declares which of these it is; callers never need to duck-type a `yrs`
//! value to figure out what kind of thing they're holding.

use serde_json::Value as Json;

/// One named, timestamped write to a [`FieldKind::Register`] slot.
#[derive(Debug, Clone)]
pub struct RegisterEntry {
	pub client: Box<str>,
	pub timestamp: i64,
	pub value: Json,
}

/// One signed delta in a [`FieldKind::Counter`].
#[derive(Debug, Clone)]
pub struct CounterEntry {
	pub client: Box<str>,
	pub timestamp: i64,
	pub delta: i64,
}

impl CounterEntry {
	#[must_use]
	pub fn total(entries: &[CounterEntry]) -> i64 {
		entries.iter().map(|e| e.delta).sum()
	}
}

/// One element of an add-wins [`FieldKind::Set`].
#[derive(Debug, Clone)]
pub struct SetElement {
	pub added_by: Box<str>,
	pub added_at: i64,
}

/// Which CRDT shape a named field uses. A primitive field round-trips
/// through plain JSON; the others are backed by dedicated `yrs` types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
	Primitive,
	Fragment,
	Register,
	Counter,
	Set,
}

// vim: ts=4
