//! Canonical JSON encoding used as the HMAC signing input.
//!
//! The canonical form of an envelope is its JSON object with `hmac` and
//! `nonce` removed, keys sorted lexicographically, and no insignificant
//! whitespace. `serde_json::Map` is a `BTreeMap` by default (the
//! `preserve_order` feature, which would switch it to insertion order, is
//! deliberately not enabled anywhere in this workspace), so any
//! `serde_json::Value::Object` already serializes with sorted keys —
//! canonicalisation only has to strip the excluded fields first.

use crate::envelope::Envelope;
use crate::error::Result;
use serde_json::Value;

/// Canonical bytes for signing: the envelope's JSON object, `hmac` and
/// `nonce` removed, keys sorted, UTF-8 without escaping non-ASCII.
pub fn canonical_envelope_bytes(env: &Envelope) -> Result<Vec<u8>> {
    let mut value = serde_json::to_value(env)?;
    if let Value::Object(map) = &mut value {
        map.remove("hmac");
        map.remove("nonce");
    }
    canonical_value_bytes(&value)
}

/// Serialize an already-built `Value` canonically (sorted keys, compact,
/// non-ASCII left unescaped). Used directly by tests and by callers that
/// build the signing payload from loose JSON rather than an `Envelope`.
pub fn canonical_value_bytes(value: &Value) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::CompactFormatter;
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
    serde::Serialize::serialize(value, &mut ser)?;
    Ok(buf)
}
