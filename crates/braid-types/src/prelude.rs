//! Common imports re-exported for `use braid_types::prelude::*;`.

pub use crate::error::{BraidResult, Error};
pub use crate::types::{
	ClientId, CollectionId, CompactionStatus, DeltaType, DocumentId, Origin, Seq, Timestamp,
};
pub use tracing::{debug, error, info, trace, warn};

// vim: ts=4
