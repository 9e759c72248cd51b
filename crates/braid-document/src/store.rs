//! Document store: in-process registry of live CRDT document
//! instances keyed by document id, one [`DocumentStore`] per collection.

use dashmap::DashMap;
use serde_json::{Map as JsonMap, Value as Json};
use std::sync::Arc;

use braid_types::prelude::*;
use yrs::{Doc, Map, MapRef, ReadTxn, Transact, TransactionMut, XmlFragmentRef};

use crate::json::{any_from_json, json_from_any};
use crate::value::{CounterEntry, RegisterEntry, SetElement};

const FIELDS_ROOT: &str = "fields";
const META_ROOT: &str = "meta";
const CREATED_KEY: &str = "_created";
const DELETED_KEY: &str = "_deleted";

/// One live document instance. Cheap to clone (wraps `Arc`-backed `yrs`
/// state); held behind `Arc` by the store so callers can keep a handle
/// across awaits without re-looking it up.
pub struct DocumentHandle {
	pub id: DocumentId,
	doc: Doc,
}

impl DocumentHandle {
	fn new(id: DocumentId) -> Self {
		Self { id, doc: Doc::new() }
	}

	#[must_use]
	pub fn doc(&self) -> &Doc {
		&self.doc
	}

	fn fields_map(txn: &TransactionMut) -> MapRef {
		txn.get_or_insert_map(FIELDS_ROOT)
	}

	fn meta_map(txn: &TransactionMut) -> MapRef {
		txn.get_or_insert_map(META_ROOT)
	}

	pub fn set_field(&self, txn: &mut TransactionMut, key: &str, value: &Json) {
		let fields = txn.get_or_insert_map(FIELDS_ROOT);
		fields.insert(txn, key, any_from_json(value));
	}

	#[must_use]
	pub fn get_field(&self, key: &str) -> Option<Json> {
		let txn = self.doc.transact();
		let fields = txn.get_map(FIELDS_ROOT)?;
		let value = fields.get(&txn, key)?;
		Some(json_from_any(&value.to_json(&txn)))
	}

	pub fn mark_created(&self, txn: &mut TransactionMut) {
		let meta = txn.get_or_insert_map(META_ROOT);
		meta.insert(txn, CREATED_KEY, true);
	}

	pub fn mark_deleted(&self, txn: &mut TransactionMut) {
		let meta = txn.get_or_insert_map(META_ROOT);
		meta.insert(txn, DELETED_KEY, true);
	}

	#[must_use]
	pub fn is_created(&self) -> bool {
		self.meta_flag(CREATED_KEY)
	}

	#[must_use]
	pub fn is_deleted(&self) -> bool {
		self.meta_flag(DELETED_KEY)
	}

	fn meta_flag(&self, key: &str) -> bool {
		let txn = self.doc.transact();
		let Some(meta) = txn.get_map(META_ROOT) else { return false };
		matches!(meta.get(&txn, key).map(|v| v.to_json(&txn)), Some(yrs::Any::Bool(true)))
	}

	/// Plain structured value fed to the main table. Purely a
	/// function of the CRDT state, never written to directly.
	#[must_use]
	pub fn serialize(&self) -> Json {
		let txn = self.doc.transact();
		let mut out = JsonMap::new();
		if let Some(fields) = txn.get_map(FIELDS_ROOT) {
			for (key, value) in fields.iter(&txn) {
				out.insert(key.to_string(), json_from_any(&value.to_json(&txn)));
			}
		}
		out.insert(CREATED_KEY.to_string(), Json::Bool(self.is_created()));
		out.insert(DELETED_KEY.to_string(), Json::Bool(self.is_deleted()));
		Json::Object(out)
	}

	fn register_root(field: &str) -> String {
		format!("register:{field}")
	}

	/// Record this client's write to a register field ("conflict-set of
	/// timestamped values per client"). Concurrent writers each keep their
	/// own slot; callers resolve the conflict set themselves.
	pub fn register_put(&self, txn: &mut TransactionMut, field: &str, client: &str, value: &Json, at: Timestamp) {
		let root = txn.get_or_insert_map(&Self::register_root(field));
		let mut entry = std::collections::HashMap::new();
		entry.insert("timestamp".to_string(), yrs::Any::BigInt(at.0));
		entry.insert("value".to_string(), any_from_json(value));
		root.insert(txn, client, yrs::Any::Map(Arc::new(entry)));
	}

	#[must_use]
	pub fn register_entries(&self, field: &str) -> Vec<RegisterEntry> {
		let txn = self.doc.transact();
		let Some(root) = txn.get_map(&Self::register_root(field)) else { return Vec::new() };
		root.iter(&txn)
			.filter_map(|(client, value)| {
				let yrs::Any::Map(entry) = value.to_json(&txn) else { return None };
				let timestamp = match entry.get("timestamp") {
					Some(yrs::Any::BigInt(i)) => *i,
					_ => return None,
				};
				let value = entry.get("value").map(json_from_any).unwrap_or(Json::Null);
				Some(RegisterEntry { client: client.into(), timestamp, value })
			})
			.collect()
	}

	fn counter_root(field: &str) -> String {
		format!("counter:{field}")
	}

	/// Append a signed delta ("append-only list of signed deltas").
	pub fn counter_add(&self, txn: &mut TransactionMut, field: &str, client: &str, delta: i64, at: Timestamp) {
		let root = txn.get_or_insert_array(&Self::counter_root(field));
		let mut entry = std::collections::HashMap::new();
		entry.insert("client".to_string(), yrs::Any::String(Arc::from(client)));
		entry.insert("timestamp".to_string(), yrs::Any::BigInt(at.0));
		entry.insert("delta".to_string(), yrs::Any::BigInt(delta));
		root.push_back(txn, yrs::Any::Map(Arc::new(entry)));
	}

	#[must_use]
	pub fn counter_entries(&self, field: &str) -> Vec<CounterEntry> {
		let txn = self.doc.transact();
		let Some(root) = txn.get_array(&Self::counter_root(field)) else { return Vec::new() };
		root.iter(&txn)
			.filter_map(|value| {
				let yrs::Any::Map(entry) = value.to_json(&txn) else { return None };
				let client = match entry.get("client") {
					Some(yrs::Any::String(s)) => s.to_string().into(),
					_ => return None,
				};
				let timestamp = match entry.get("timestamp") {
					Some(yrs::Any::BigInt(i)) => *i,
					_ => return None,
				};
				let delta = match entry.get("delta") {
					Some(yrs::Any::BigInt(i)) => *i,
					_ => return None,
				};
				Some(CounterEntry { client, timestamp, delta })
			})
			.collect()
	}

	#[must_use]
	pub fn counter_total(&self, field: &str) -> i64 {
		CounterEntry::total(&self.counter_entries(field))
	}

	fn set_root(field: &str) -> String {
		format!("set:{field}")
	}

	/// Add-wins set insert: once an element is added it survives any
	/// concurrent remove that doesn't causally follow it.
	pub fn set_add(&self, txn: &mut TransactionMut, field: &str, element: &str, added_by: &str, at: Timestamp) {
		let root = txn.get_or_insert_map(&Self::set_root(field));
		let mut entry = std::collections::HashMap::new();
		entry.insert("added_by".to_string(), yrs::Any::String(Arc::from(added_by)));
		entry.insert("added_at".to_string(), yrs::Any::BigInt(at.0));
		root.insert(txn, element, yrs::Any::Map(Arc::new(entry)));
	}

	pub fn set_remove(&self, txn: &mut TransactionMut, field: &str, element: &str) {
		let root = txn.get_or_insert_map(&Self::set_root(field));
		root.remove(txn, element);
	}

	#[must_use]
	pub fn set_elements(&self, field: &str) -> Vec<(Box<str>, SetElement)> {
		let txn = self.doc.transact();
		let Some(root) = txn.get_map(&Self::set_root(field)) else { return Vec::new() };
		root.iter(&txn)
			.filter_map(|(element, value)| {
				let yrs::Any::Map(entry) = value.to_json(&txn) else { return None };
				let added_by = match entry.get("added_by") {
					Some(yrs::Any::String(s)) => s.to_string().into(),
					_ => return None,
				};
				let added_at = match entry.get("added_at") {
					Some(yrs::Any::BigInt(i)) => *i,
					_ => return None,
				};
				Some((element.into(), SetElement { added_by, added_at }))
			})
			.collect()
	}

	/// Raw handle to a rich-text field, owned by the editor host.
	#[must_use]
	pub fn fragment(&self, field: &str) -> XmlFragmentRef {
		let mut txn = self.doc.transact_mut();
		txn.get_or_insert_xml_fragment(format!("fragment:{field}"))
	}
}

/// Per-collection registry of live document instances.
pub struct DocumentStore {
	collection: CollectionId,
	documents: DashMap<DocumentId, Arc<DocumentHandle>>,
}

impl DocumentStore {
	#[must_use]
	pub fn new(collection: impl Into<CollectionId>) -> Self {
		Self { collection: collection.into(), documents: DashMap::new() }
	}

	#[must_use]
	pub fn collection(&self) -> &str {
		&self.collection
	}

	#[must_use]
	pub fn get_or_create(&self, id: &str) -> Arc<DocumentHandle> {
		Arc::clone(
			self.documents
				.entry(id.into())
				.or_insert_with(|| Arc::new(DocumentHandle::new(id.into())))
				.value(),
		)
	}

	#[must_use]
	pub fn get(&self, id: &str) -> Option<Arc<DocumentHandle>> {
		self.documents.get(id).map(|e| Arc::clone(e.value()))
	}

	pub fn delete(&self, id: &str) {
		self.documents.remove(id);
	}

	#[must_use]
	pub fn documents(&self) -> Vec<DocumentId> {
		self.documents.iter().map(|e| e.key().clone()).collect()
	}

	/// Run `mutator` inside one CRDT transaction and return the delta
	/// computed against the state vector from just before the mutation.
	/// Fails with `NotFound` when `id` has no live handle.
	pub fn transact_with_delta<F>(&self, id: &str, origin: Origin, mutator: F) -> BraidResult<Vec<u8>>
	where
		F: FnOnce(&mut TransactionMut, &DocumentHandle),
	{
		let handle = self.get(id).ok_or_else(|| Error::NotFound(format!("document {id}")))?;
		let pre_vector = braid_codec::encode_state_vector(&handle.doc);
		{
			let mut txn = handle.doc.transact_mut_with(origin.as_tag().to_owned());
			mutator(&mut txn, &handle);
		}
		braid_codec::encode_update_since(&handle.doc, &pre_vector)
	}

	pub fn apply_update(&self, id: &str, bytes: &[u8], origin: Origin) -> BraidResult<()> {
		let handle = self.get_or_create(id);
		braid_codec::apply_update(&handle.doc, bytes, Some(origin.as_tag()))
	}

	pub fn encode_state_vector(&self, id: &str) -> BraidResult<Vec<u8>> {
		let handle = self.get(id).ok_or_else(|| Error::NotFound(format!("document {id}")))?;
		Ok(braid_codec::encode_state_vector(&handle.doc))
	}

	pub fn serialize(&self, id: &str) -> BraidResult<Json> {
		let handle = self.get(id).ok_or_else(|| Error::NotFound(format!("document {id}")))?;
		Ok(handle.serialize())
	}
}


// vim: ts=4
