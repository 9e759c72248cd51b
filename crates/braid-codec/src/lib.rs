//! Binary CRDT delta codec.
//!
//! Updates and state vectors are opaque binary blobs everywhere else in the
//! workspace; this is the only crate permitted to inspect them. Wraps
//! `yrs`, which guarantees the merge operation is associative and
//! commutative: two peers applying the same set of updates in any order
//! converge to byte-identical state vectors.

#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![forbid(unsafe_code)]

use braid_types::prelude::*;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

/// A diff no longer than this is treated as "no missing data". Shorter than
/// any update carrying an actual struct, so it only matches a truly empty
/// encode_diff_v1 result.
pub const EMPTY_THRESHOLD: usize = 2;

/// Full update encoding the document's entire history, as if diffed
/// against an empty remote state vector.
pub fn encode_update(doc: &Doc) -> Vec<u8> {
	let txn = doc.transact();
	txn.encode_diff_v1(&StateVector::default())
}

pub fn encode_state_vector(doc: &Doc) -> Vec<u8> {
	let txn = doc.transact();
	txn.state_vector().encode_v1()
}

/// Diff of everything `doc` has that `remote_vector` does not.
pub fn encode_update_since(doc: &Doc, remote_vector: &[u8]) -> BraidResult<Vec<u8>> {
	let sv = decode_state_vector(remote_vector)?;
	let txn = doc.transact();
	Ok(txn.encode_diff_v1(&sv))
}

fn decode_state_vector(bytes: &[u8]) -> BraidResult<StateVector> {
	StateVector::decode_v1(bytes).map_err(|e| Error::Codec(format!("invalid state vector: {e}")))
}

fn decode_update(bytes: &[u8]) -> BraidResult<Update> {
	Update::decode_v1(bytes).map_err(|e| Error::Codec(format!("invalid update: {e}")))
}

/// Apply a binary update to `doc`. `origin_tag` is attached to the
/// transaction so observers (see the document store) can tell a locally
/// produced change from a server-applied one without inspecting the bytes.
pub fn apply_update(doc: &Doc, bytes: &[u8], origin_tag: Option<&str>) -> BraidResult<()> {
	let update = decode_update(bytes)?;
	let mut txn = match origin_tag {
		Some(tag) => doc.transact_mut_with(tag.to_owned()),
		None => doc.transact_mut(),
	};
	txn.apply_update(update).map_err(|e| Error::Codec(format!("apply_update failed: {e}")))?;
	Ok(())
}

/// Merge a set of updates into one, in any order, with an identical result.
pub fn merge_updates(updates: &[Vec<u8>]) -> BraidResult<Vec<u8>> {
	if updates.is_empty() {
		return Ok(Vec::new());
	}
	let refs: Vec<&[u8]> = updates.iter().map(Vec::as_slice).collect();
	yrs::merge_updates_v1(refs).map_err(|e| Error::Codec(format!("merge_updates failed: {e}")))
}

/// Diff of a standalone merged update blob (no live `Doc`) against a remote
/// state vector. Used by compaction and recovery, which only ever hold
/// merged bytes, not a live document instance.
pub fn diff(merged_bytes: &[u8], remote_vector: &[u8]) -> BraidResult<Vec<u8>> {
	let doc = Doc::new();
	apply_update(&doc, merged_bytes, None)?;
	encode_update_since(&doc, remote_vector)
}

/// State vector of a standalone merged update blob (no live `Doc`). Used by
/// compaction after merging a snapshot with its trailing deltas.
pub fn state_vector_of(merged_bytes: &[u8]) -> BraidResult<Vec<u8>> {
	let doc = Doc::new();
	apply_update(&doc, merged_bytes, None)?;
	Ok(encode_state_vector(&doc))
}

/// True when a diff carries no missing data, per the codec-defined
/// empty threshold.
#[must_use]
pub fn is_empty_diff(diff_bytes: &[u8]) -> bool {
	diff_bytes.len() <= EMPTY_THRESHOLD
}

#[cfg(test)]
mod tests {
	use super::*;
	use yrs::{Map, Transact};

	fn doc_with(key: &str, value: &str) -> Doc {
		let doc = Doc::new();
		{
			let mut txn = doc.transact_mut();
			let map = txn.get_or_insert_map("fields");
			map.insert(&mut txn, key, value);
		}
		doc
	}

	#[test]
	fn apply_then_state_vectors_converge() {
		let a = doc_with("title", "hello");
		let update = encode_update(&a);

		let b = Doc::new();
		apply_update(&b, &update, Some("server")).unwrap();

		assert_eq!(encode_state_vector(&a), encode_state_vector(&b));
	}

	#[test]
	fn update_since_is_empty_when_caught_up() {
		let a = doc_with("title", "hello");
		let sv = encode_state_vector(&a);
		let diff = encode_update_since(&a, &sv).unwrap();
		assert!(is_empty_diff(&diff));
	}

	#[test]
	fn merge_is_order_independent() {
		let a = doc_with("title", "hello");
		let update_a = encode_update(&a);

		let mut b = Doc::new();
		{
			let mut txn = b.transact_mut();
			let map = txn.get_or_insert_map("fields");
			map.insert(&mut txn, "body", "world");
		}
		let update_b = encode_update(&b);

		let merged_fwd = merge_updates(&[update_a.clone(), update_b.clone()]).unwrap();
		let merged_rev = merge_updates(&[update_b, update_a]).unwrap();

		let doc_fwd = Doc::new();
		apply_update(&doc_fwd, &merged_fwd, None).unwrap();
		let doc_rev = Doc::new();
		apply_update(&doc_rev, &merged_rev, None).unwrap();

		assert_eq!(encode_state_vector(&doc_fwd), encode_state_vector(&doc_rev));
	}

	#[test]
	fn state_vector_of_merged_matches_live_doc() {
		let a = doc_with("title", "hello");
		let merged = encode_update(&a);
		assert_eq!(state_vector_of(&merged).unwrap(), encode_state_vector(&a));
	}

	#[test]
	fn rejects_garbage_update_bytes() {
		let doc = Doc::new();
		assert!(apply_update(&doc, b"not a real update", None).is_err());
	}
}

// vim: ts=4
