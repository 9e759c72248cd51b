//! Conversions between `serde_json::Value` and `yrs::Any`, used to move
//! primitive field values in and out of the CRDT without ever hand-rolling
//! a JSON parser of our own.

use serde_json::{Map, Number, Value as Json};
use std::sync::Arc;
use yrs::Any;

#[must_use]
pub fn any_from_json(value: &Json) -> Any {
	match value {
		Json::Null => Any::Null,
		Json::Bool(b) => Any::Bool(*b),
		Json::Number(n) => n.as_i64().map_or_else(
			|| Any::Number(n.as_f64().unwrap_or(0.0)),
			|i| Any::BigInt(i),
		),
		Json::String(s) => Any::String(Arc::from(s.as_str())),
		Json::Array(items) => {
			let converted: Vec<Any> = items.iter().map(any_from_json).collect();
			Any::Array(Arc::from(converted))
		}
		Json::Object(map) => {
			let converted: std::collections::HashMap<String, Any> =
				map.iter().map(|(k, v)| (k.clone(), any_from_json(v))).collect();
			Any::Map(Arc::new(converted))
		}
	}
}

#[must_use]
pub fn json_from_any(value: &Any) -> Json {
	match value {
		Any::Null | Any::Undefined => Json::Null,
		Any::Bool(b) => Json::Bool(*b),
		Any::Number(n) => Number::from_f64(*n).map_or(Json::Null, Json::Number),
		Any::BigInt(i) => Json::Number(Number::from(*i)),
		Any::String(s) => Json::String(s.to_string()),
		Any::Buffer(bytes) => Json::Array(bytes.iter().map(|b| Json::Number(Number::from(*b))).collect()),
		Any::Array(items) => Json::Array(items.iter().map(json_from_any).collect()),
		Any::Map(map) => {
			let mut out = Map::new();
			for (k, v) in map.iter() {
				out.insert(k.clone(), json_from_any(v));
			}
			Json::Object(out)
		}
	}
}

// vim: ts=4
