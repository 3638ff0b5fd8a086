//! Canonical JSON serialization and content hashing.
//!
//! `canonicalize` emits a byte sequence that is stable under any
//! semantics-preserving reordering of object keys: objects are written with
//! keys sorted bytewise, arrays in order, no whitespace. The content hash is
//! SHA-256 over exactly those bytes.

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::doc::model::NodeDoc;
use crate::error::Result;

/// Canonical bytes for an arbitrary JSON value.
pub fn canonical_json_bytes(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    write_canonical(value, &mut out);
    out
}

/// Canonical bytes for a document.
pub fn canonicalize(doc: &NodeDoc) -> Result<Vec<u8>> {
    let value = serde_json::to_value(doc)?;
    Ok(canonical_json_bytes(&value))
}

/// Hex SHA-256 of the doc's canonical bytes.
pub fn content_hash(doc: &NodeDoc) -> Result<String> {
    let bytes = canonicalize(doc)?;
    Ok(hex_sha256(&bytes))
}

/// Hex SHA-256 of `prompt_version | sorted chunk IDs`. Detects stale
/// generations when either the prompt or the grounding set changes.
pub fn sources_hash(prompt_version: &str, chunk_ids: &[String]) -> String {
    let mut sorted: Vec<&str> = chunk_ids.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    sorted.dedup();
    let mut input = prompt_version.to_owned();
    for id in sorted {
        input.push('|');
        input.push_str(id);
    }
    hex_sha256(input.as_bytes())
}

fn hex_sha256(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn write_canonical(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Object(map) => {
            out.push(b'{');
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            for (index, key) in keys.iter().enumerate() {
                if index > 0 {
                    out.push(b',');
                }
                // Keys and scalar leaves reuse serde_json's escaping.
                out.extend_from_slice(
                    serde_json::to_string(key).expect("string serialization").as_bytes(),
                );
                out.push(b':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push(b'}');
        }
        Value::Array(items) => {
            out.push(b'[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(b',');
                }
                write_canonical(item, out);
            }
            out.push(b']');
        }
        scalar => {
            out.extend_from_slice(
                serde_json::to_string(scalar).expect("scalar serialization").as_bytes(),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc::model::{Block, BlockKind};
    use serde_json::json;

    #[test]
    fn key_order_does_not_change_bytes() {
        let a = json!({ "b": 1, "a": { "z": [1, 2], "y": "text" } });
        let b: Value =
            serde_json::from_str(r#"{"a":{"y":"text","z":[1,2]},"b":1}"#).expect("parse");
        assert_eq!(canonical_json_bytes(&a), canonical_json_bytes(&b));
    }

    #[test]
    fn canonical_bytes_have_no_whitespace() {
        let value = json!({ "k": [1, 2, 3], "s": "a b" });
        let bytes = canonical_json_bytes(&value);
        assert_eq!(String::from_utf8(bytes).unwrap(), r#"{"k":[1,2,3],"s":"a b"}"#);
    }

    #[test]
    fn rebuilding_the_same_doc_is_byte_identical() {
        let build = || {
            let mut doc = NodeDoc::new("Ohm's Law");
            doc.summary = "V = IR".into();
            doc.blocks.push(
                Block::new(BlockKind::Paragraph)
                    .with_id("b1")
                    .with_text("Voltage equals current times resistance.")
                    .with_citation("11111111-1111-4111-8111-111111111111"),
            );
            doc
        };
        let first = canonicalize(&build()).expect("canonicalize");
        let second = canonicalize(&build()).expect("canonicalize");
        assert_eq!(first, second);
        assert_eq!(content_hash(&build()).unwrap(), content_hash(&build()).unwrap());
    }

    #[test]
    fn parse_and_reserialize_is_stable() {
        // A doc read back from its canonical bytes must canonicalize to the
        // same bytes. This is the dedup identity.
        let mut doc = NodeDoc::new("Stability");
        doc.blocks.push(
            Block::new(BlockKind::Callout)
                .with_id("b1")
                .with_field("title", json!("Note"))
                .with_text("stable")
                .with_citation("22222222-2222-4222-8222-222222222222"),
        );
        let bytes = canonicalize(&doc).expect("canonicalize");
        let reparsed: NodeDoc = serde_json::from_slice(&bytes).expect("reparse");
        assert_eq!(canonicalize(&reparsed).expect("canonicalize"), bytes);
    }

    #[test]
    fn sources_hash_ignores_chunk_order_and_duplicates() {
        let a = sources_hash("node_doc_v1", &["c2".into(), "c1".into()]);
        let b = sources_hash("node_doc_v1", &["c1".into(), "c2".into(), "c1".into()]);
        assert_eq!(a, b);

        let c = sources_hash("node_doc_v2", &["c1".into(), "c2".into()]);
        assert_ne!(a, c, "prompt version must change the hash");
    }
}
