//! Shared error type for the replication engine.
//!
//! Every fallible operation across the crates in this workspace returns
//! [`BraidResult`]. The boundary error kinds (`Disparity`, `NonRetriable`,
//! `NotFound`, `AlreadyRunning`, `AlreadyPending`) are the categories
//! collaborators are expected to match on; everything else is detail.

use thiserror::Error;

pub type BraidResult<T> = Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
	/// A stream cursor is older than the oldest retained delta and no snapshot
	/// exists to replay from. Fatal for the requesting session.
	#[error("disparity: no snapshot or delta covers the requested cursor")]
	Disparity,

	/// Auth/validation-class failure. Never retried.
	#[error("non-retriable: {0}")]
	NonRetriable(String),

	#[error("not found: {0}")]
	NotFound(String),

	#[error("compaction already running for this document")]
	AlreadyRunning,

	#[error("compaction already pending for this document")]
	AlreadyPending,

	#[error("validation error: {0}")]
	ValidationError(String),

	#[error("codec error: {0}")]
	Codec(String),

	#[error("storage error: {0}")]
	Storage(String),

	#[error("io error: {0}")]
	Io(String),

	#[error("serialization error: {0}")]
	Serialization(String),

	#[error("internal error: {0}")]
	Internal(String),
}

impl Error {
	/// Transient-transport vs. terminal classification used by the sync queue's
	/// backoff policy. `NonRetriable` and `Disparity` never get a retry.
	#[must_use]
	pub fn is_retriable(&self) -> bool {
		!matches!(self, Error::NonRetriable(_) | Error::Disparity | Error::ValidationError(_))
	}
}

impl From<serde_json::Error> for Error {
	fn from(e: serde_json::Error) -> Self {
		Error::Serialization(e.to_string())
	}
}

impl From<std::io::Error> for Error {
	fn from(e: std::io::Error) -> Self {
		Error::Io(e.to_string())
	}
}

/// Recover a poisoned mutex/rwlock guard, logging once. Mirrors the rest of
/// the codebase's policy of surviving a panicking holder rather than
/// poisoning every subsequent caller.
#[macro_export]
macro_rules! lock {
	($mutex:expr) => {
		match $mutex.lock() {
			Ok(guard) => Ok::<_, $crate::error::Error>(guard),
			Err(poisoned) => {
				tracing::error!(target: stringify!($mutex), "mutex poisoned, recovering");
				Ok(poisoned.into_inner())
			}
		}
	};
	($mutex:expr, $name:expr) => {
		match $mutex.lock() {
			Ok(guard) => Ok::<_, $crate::error::Error>(guard),
			Err(poisoned) => {
				tracing::error!(name = $name, "mutex poisoned, recovering");
				Ok(poisoned.into_inner())
			}
		}
	};
}

// vim: ts=4
