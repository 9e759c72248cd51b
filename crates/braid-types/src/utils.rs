//! Small utility functions shared across the workspace.

use rand::RngExt;

use crate::prelude::*;

pub const ID_LENGTH: usize = 24;
pub const SAFE: [char; 62] = [
	'0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i',
	'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z', 'A', 'B',
	'C', 'D', 'E', 'F', 'G', 'H', 'I', 'J', 'K', 'L', 'M', 'N', 'O', 'P', 'Q', 'R', 'S', 'T', 'U',
	'V', 'W', 'X', 'Y', 'Z',
];

/// Random opaque identifier, used wherever a fresh id is needed (client ids,
/// sync-queue task ids, anonymous session handles).
pub fn random_id() -> BraidResult<String> {
	let mut rng = rand::rng();
	let mut result = String::with_capacity(ID_LENGTH);

	for _ in 0..ID_LENGTH {
		result.push(SAFE[rng.random_range(0..SAFE.len())]);
	}
	Ok(result)
}

/// 32-bit mixing hash used to derive a deterministic display identity from a
/// client id, per the `anonymous_presence.*` configuration option.
#[must_use]
pub fn mix32(input: &str) -> u32 {
	let mut h: u32 = 0x811c_9dc5;
	for b in input.bytes() {
		h ^= u32::from(b);
		h = h.wrapping_mul(0x0100_0193);
	}
	h
}

/// Derive a deterministic (adjective, noun, color) triple from a client id
/// for anonymous presence display, using the configured word lists.
#[must_use]
pub fn anonymous_identity<'a>(
	client_id: &str,
	adjectives: &'a [&'a str],
	nouns: &'a [&'a str],
	colors: &'a [&'a str],
) -> Option<(&'a str, &'a str, &'a str)> {
	if adjectives.is_empty() || nouns.is_empty() || colors.is_empty() {
		return None;
	}
	let h = mix32(client_id);
	let adjective = adjectives[(h as usize) % adjectives.len()];
	let noun = nouns[(h.rotate_left(8) as usize) % nouns.len()];
	let color = colors[(h.rotate_left(16) as usize) % colors.len()];
	Some((adjective, noun, color))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn random_id_has_expected_length() {
		let id = random_id().unwrap();
		assert_eq!(id.len(), ID_LENGTH);
	}

	#[test]
	fn random_id_uses_safe_alphabet() {
		let id = random_id().unwrap();
		assert!(id.chars().all(|c| SAFE.contains(&c)));
	}

	#[test]
	fn mix32_is_deterministic() {
		assert_eq!(mix32("client-1"), mix32("client-1"));
		assert_ne!(mix32("client-1"), mix32("client-2"));
	}

	#[test]
	fn anonymous_identity_is_stable_for_same_client() {
		let adjectives = ["Quiet", "Bright"];
		let nouns = ["Fox", "Owl"];
		let colors = ["Red", "Blue"];
		let a = anonymous_identity("client-1", &adjectives, &nouns, &colors);
		let b = anonymous_identity("client-1", &adjectives, &nouns, &colors);
		assert_eq!(a, b);
	}
}

// vim: ts=4
