//! Document body values.
//!
//! Bodies are schemaless JSON-like trees, represented as
//! [`serde_json::Value`] and stored as their canonical JSON encoding.
//! Attachments are referenced from within a body as
//! `{"@type": "blob", "digest": "sha1-...", "length": N}` dictionaries.

use bytes::Bytes;
use serde_json::Value;

use crate::blob::BlobKey;
use crate::error::{Error, Result};

/// Property marking a dictionary as a blob reference.
pub const TYPE_PROPERTY: &str = "@type";
/// `@type` value of a blob reference.
pub const BLOB_TYPE: &str = "blob";

/// Canonical byte encoding of a body, used for digests and storage.
///
/// `serde_json` maps are ordered by key, so encoding the same logical tree
/// always yields the same bytes.
pub fn canonical_encoding(body: &Value) -> Vec<u8> {
    serde_json::to_vec(body).expect("JSON value serialization is infallible")
}

/// Decode a stored body.
pub fn decode(data: &[u8]) -> Result<Value> {
    serde_json::from_slice(data).map_err(|err| Error::corrupt(format!("bad stored body: {err}")))
}

/// A blob reference found inside a body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobRef {
    pub key: BlobKey,
    pub length: u64,
    pub content_type: Option<String>,
}

/// Collect every blob reference in `body`, depth first.
pub fn blob_refs(body: &Value) -> Vec<BlobRef> {
    let mut refs = Vec::new();
    collect_refs(body, &mut refs);
    refs
}

/// Whether `body` contains at least one blob reference.
pub fn has_blob_refs(body: &Value) -> bool {
    match body {
        Value::Object(map) => as_blob_ref(map).is_some() || map.values().any(has_blob_refs),
        Value::Array(items) => items.iter().any(has_blob_refs),
        _ => false,
    }
}

fn collect_refs(value: &Value, out: &mut Vec<BlobRef>) {
    match value {
        Value::Object(map) => {
            if let Some(blob) = as_blob_ref(map) {
                out.push(blob);
            } else {
                for child in map.values() {
                    collect_refs(child, out);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_refs(item, out);
            }
        }
        _ => {}
    }
}

fn as_blob_ref(map: &serde_json::Map<String, Value>) -> Option<BlobRef> {
    if map.get(TYPE_PROPERTY)?.as_str()? != BLOB_TYPE {
        return None;
    }
    let digest = map.get("digest")?.as_str()?;
    let key: BlobKey = digest.parse().ok()?;
    Some(BlobRef {
        key,
        length: map.get("length").and_then(Value::as_u64).unwrap_or(0),
        content_type: map
            .get("content_type")
            .and_then(Value::as_str)
            .map(str::to_owned),
    })
}

/// Build the body dictionary for a blob reference.
pub fn blob_ref_value(key: &BlobKey, length: u64, content_type: Option<&str>) -> Value {
    let mut map = serde_json::Map::new();
    map.insert(TYPE_PROPERTY.into(), Value::String(BLOB_TYPE.into()));
    map.insert("digest".into(), Value::String(key.to_string()));
    map.insert("length".into(), Value::Number(length.into()));
    if let Some(ct) = content_type {
        map.insert("content_type".into(), Value::String(ct.into()));
    }
    Value::Object(map)
}

/// Navigate a dotted property path (`"foo.bar.2"`) through a value.
///
/// This is the same navigation the `fl_value` SQL function performs.
pub fn eval_path<'a>(body: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = body;
    if path.is_empty() {
        return Some(current);
    }
    for part in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Zero-copy view over an encoded body.
#[derive(Debug, Clone, Default)]
pub struct EncodedBody(pub Bytes);

impl EncodedBody {
    pub fn encode(body: &Value) -> Self {
        EncodedBody(canonical_encoding(body).into())
    }

    pub fn decode(&self) -> Result<Value> {
        decode(&self.0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_encoding_sorts_keys() {
        let a: Value = serde_json::from_str(r#"{"b":1,"a":2}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"a":2,"b":1}"#).unwrap();
        assert_eq!(canonical_encoding(&a), canonical_encoding(&b));
    }

    #[test]
    fn finds_nested_blob_refs() {
        let key = BlobKey::compute(b"attachment");
        let body = json!({
            "title": "report",
            "attachments": [blob_ref_value(&key, 10, Some("text/plain"))],
            "cover": blob_ref_value(&key, 10, None),
        });
        let refs = blob_refs(&body);
        assert_eq!(refs.len(), 2);
        assert!(refs.iter().all(|r| r.key == key));
        assert!(has_blob_refs(&body));
        assert!(!has_blob_refs(&json!({"x": 1})));
    }

    #[test]
    fn path_navigation() {
        let body = json!({"a": {"b": [10, {"c": true}]}});
        assert_eq!(eval_path(&body, "a.b.0"), Some(&json!(10)));
        assert_eq!(eval_path(&body, "a.b.1.c"), Some(&json!(true)));
        assert_eq!(eval_path(&body, "a.missing"), None);
        assert_eq!(eval_path(&body, ""), Some(&body));
    }
}
