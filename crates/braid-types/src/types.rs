//! Shared identifiers and small value types used across the workspace.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;

pub type CollectionId = Box<str>;
pub type DocumentId = Box<str>;
pub type ClientId = Box<str>;

/// Position in a collection's delta log. Monotonic, strictly increasing,
/// allocated by the log store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Seq(pub u64);

impl Seq {
	pub const ZERO: Seq = Seq(0);

	#[must_use]
	pub fn next(self) -> Seq {
		Seq(self.0 + 1)
	}
}

impl fmt::Display for Seq {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Unix-epoch second timestamp, used for session/snapshot/job bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
	#[must_use]
	pub fn now() -> Self {
		Timestamp(Utc::now().timestamp())
	}

	#[must_use]
	pub fn from_now(seconds: i64) -> Self {
		Timestamp(Utc::now().timestamp() + seconds)
	}

	#[must_use]
	pub fn elapsed_secs(self, since: Timestamp) -> i64 {
		(self.0 - since.0).max(0)
	}
}

impl fmt::Display for Timestamp {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Origin tag distinguishing locally produced edits from updates applied
/// from the server, used only to route observer notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
	Local,
	Server,
}

impl Origin {
	#[must_use]
	pub fn as_tag(self) -> &'static str {
		match self {
			Origin::Local => "local",
			Origin::Server => "server",
		}
	}
}

/// Delta classification. Insert deltas always set `_created`, delete
/// deltas always set `_deleted`, update deltas touch only field contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeltaType {
	Insert,
	Update,
	Delete,
}

impl fmt::Display for DeltaType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			DeltaType::Insert => write!(f, "insert"),
			DeltaType::Update => write!(f, "update"),
			DeltaType::Delete => write!(f, "delete"),
		}
	}
}

/// Compaction job lifecycle. `pending -> running -> {done, failed}`,
/// with `running -> pending` on a retriable failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompactionStatus {
	Pending,
	Running,
	Done,
	Failed,
}

// vim: ts=4
