//! Compiled dotted paths into JSON documents.
//!
//! A [`FieldPath`] is parsed once (for example when a collection is created)
//! and then used as a typed getter/setter for every write, instead of
//! re-splitting a path string on each access. The same type addresses
//! fields inside selectors and patches (`"address.city"`, `"tags.0"`).

use crate::{error::Result, schema::json_type_name, Error};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Largest gap a write may open past the end of an array.
pub const MAX_ARRAY_PADDING: usize = 1024;

/// A parsed, non-empty dotted path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FieldPath {
    raw: String,
    segments: Vec<String>,
}

impl FieldPath {
    /// Parse a dotted path. Empty paths and empty segments are rejected.
    pub fn parse(path: &str) -> Result<Self> {
        if path.is_empty() {
            return Err(Error::InvalidDocument("empty field path".into()));
        }
        let segments: Vec<String> = path.split('.').map(str::to_string).collect();
        if segments.iter().any(String::is_empty) {
            return Err(Error::InvalidDocument(format!(
                "field path '{}' has an empty segment",
                path
            )));
        }
        Ok(Self {
            raw: path.to_string(),
            segments,
        })
    }

    /// The path as written.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The individual segments.
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// The top-level field this path starts at.
    pub fn root(&self) -> &str {
        &self.segments[0]
    }

    /// Read the value at this path.
    pub fn get<'a>(&self, doc: &'a Value) -> Option<&'a Value> {
        self.segments
            .iter()
            .try_fold(doc, |current, segment| step(current, segment))
    }

    /// Mutable access to the value at this path, if it exists.
    pub fn get_mut<'a>(&self, doc: &'a mut Value) -> Option<&'a mut Value> {
        let mut current = doc;
        for segment in &self.segments {
            current = match current {
                Value::Object(map) => map.get_mut(segment)?,
                Value::Array(items) => items.get_mut(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Write `value` at this path, creating intermediate objects as needed.
    ///
    /// Writing past the end of an array pads it with nulls, by at most
    /// [`MAX_ARRAY_PADDING`] slots.
    pub fn set(&self, doc: &mut Value, value: Value) -> Result<()> {
        let Some((last, parents)) = self.segments.split_last() else {
            return Err(Error::InvalidDocument("empty field path".into()));
        };
        let mut current = doc;
        for segment in parents {
            current = self.child_or_insert(current, segment)?;
        }
        match current {
            Value::Object(map) => {
                map.insert(last.clone(), value);
                Ok(())
            }
            Value::Array(items) => {
                *self.slot(items, last)? = value;
                Ok(())
            }
            other => Err(self.traversal_error(other)),
        }
    }

    /// Remove and return the value at this path.
    ///
    /// Array elements are replaced by null rather than shifted, so sibling
    /// indices stay stable.
    pub fn remove(&self, doc: &mut Value) -> Option<Value> {
        let (last, parents) = self.segments.split_last()?;
        let mut current = doc;
        for segment in parents {
            current = match current {
                Value::Object(map) => map.get_mut(segment)?,
                Value::Array(items) => items.get_mut(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        match current {
            Value::Object(map) => map.remove(last),
            Value::Array(items) => {
                let slot = items.get_mut(last.parse::<usize>().ok()?)?;
                Some(std::mem::replace(slot, Value::Null))
            }
            _ => None,
        }
    }

    fn child_or_insert<'a>(&self, value: &'a mut Value, segment: &str) -> Result<&'a mut Value> {
        let child = match value {
            Value::Object(map) => map
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new())),
            Value::Array(items) => self.slot(items, segment)?,
            other => return Err(self.traversal_error(other)),
        };
        if child.is_null() {
            *child = Value::Object(Map::new());
        }
        Ok(child)
    }

    /// The array slot addressed by `segment`, padding the array with nulls
    /// when it is short.
    fn slot<'a>(&self, items: &'a mut Vec<Value>, segment: &str) -> Result<&'a mut Value> {
        let index = self.index(segment)?;
        let gap = index.saturating_sub(items.len());
        if gap > MAX_ARRAY_PADDING {
            return Err(Error::InvalidDocument(format!(
                "index {} of '{}' is too far past the end of a {}-element array",
                index,
                self.raw,
                items.len()
            )));
        }
        if index >= items.len() {
            items.resize(items.len() + gap + 1, Value::Null);
        }
        items.get_mut(index).ok_or_else(|| {
            Error::InvalidDocument(format!("index {} of '{}' is out of range", index, self.raw))
        })
    }

    fn index(&self, segment: &str) -> Result<usize> {
        segment.parse::<usize>().map_err(|_| {
            Error::InvalidDocument(format!(
                "segment '{}' of '{}' is not an array index",
                segment, self.raw
            ))
        })
    }

    fn traversal_error(&self, value: &Value) -> Error {
        Error::InvalidDocument(format!(
            "cannot traverse '{}' through a {} value",
            self.raw,
            json_type_name(value)
        ))
    }
}

fn step<'a>(value: &'a Value, segment: &str) -> Option<&'a Value> {
    match value {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl TryFrom<String> for FieldPath {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<FieldPath> for String {
    fn from(path: FieldPath) -> Self {
        path.raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_rejects_empty_segments() {
        assert!(FieldPath::parse("").is_err());
        assert!(FieldPath::parse("a..b").is_err());
        assert!(FieldPath::parse(".a").is_err());

        let path = FieldPath::parse("meta.crdts").unwrap();
        assert_eq!(path.segments(), &["meta".to_string(), "crdts".to_string()]);
        assert_eq!(path.root(), "meta");
    }

    #[test]
    fn get_nested_and_array() {
        let doc = json!({"a": {"b": [10, {"c": true}]}});
        assert_eq!(FieldPath::parse("a.b.0").unwrap().get(&doc), Some(&json!(10)));
        assert_eq!(
            FieldPath::parse("a.b.1.c").unwrap().get(&doc),
            Some(&json!(true))
        );
        assert_eq!(FieldPath::parse("a.x").unwrap().get(&doc), None);
        assert_eq!(FieldPath::parse("a.b.c").unwrap().get(&doc), None);
    }

    #[test]
    fn set_creates_intermediates() {
        let mut doc = json!({});
        FieldPath::parse("a.b.c")
            .unwrap()
            .set(&mut doc, json!(1))
            .unwrap();
        assert_eq!(doc, json!({"a": {"b": {"c": 1}}}));
    }

    #[test]
    fn set_pads_arrays() {
        let mut doc = json!({"list": [1]});
        FieldPath::parse("list.3")
            .unwrap()
            .set(&mut doc, json!("x"))
            .unwrap();
        assert_eq!(doc, json!({"list": [1, null, null, "x"]}));
    }

    #[test]
    fn set_rejects_far_out_of_range_index() {
        let mut doc = json!({"tags": ["a"]});
        for raw in ["tags.18446744073709551615", "tags.10000000000", "tags.1026"] {
            let result = FieldPath::parse(raw).unwrap().set(&mut doc, json!("x"));
            assert!(matches!(result, Err(Error::InvalidDocument(_))), "{}", raw);
        }
        let nested = FieldPath::parse("tags.18446744073709551615.name").unwrap();
        assert!(nested.set(&mut doc, json!("x")).is_err());
        assert_eq!(doc, json!({"tags": ["a"]}));
    }

    #[test]
    fn set_pads_up_to_the_limit() {
        let mut doc = json!({"tags": []});
        let raw = format!("tags.{}", MAX_ARRAY_PADDING);
        FieldPath::parse(&raw).unwrap().set(&mut doc, json!(1)).unwrap();
        let tags = doc["tags"].as_array().unwrap();
        assert_eq!(tags.len(), MAX_ARRAY_PADDING + 1);
        assert_eq!(tags[MAX_ARRAY_PADDING], json!(1));
    }

    #[test]
    fn set_through_scalar_fails() {
        let mut doc = json!({"a": 5});
        let result = FieldPath::parse("a.b").unwrap().set(&mut doc, json!(1));
        assert!(matches!(result, Err(Error::InvalidDocument(_))));
    }

    #[test]
    fn remove_field() {
        let mut doc = json!({"a": {"b": 1, "c": 2}});
        let removed = FieldPath::parse("a.b").unwrap().remove(&mut doc);
        assert_eq!(removed, Some(json!(1)));
        assert_eq!(doc, json!({"a": {"c": 2}}));
        assert_eq!(FieldPath::parse("zzz").unwrap().remove(&mut doc), None);
    }

    #[test]
    fn serde_as_string() {
        let path = FieldPath::parse("crdts").unwrap();
        assert_eq!(serde_json::to_string(&path).unwrap(), "\"crdts\"");
        let parsed: FieldPath = serde_json::from_str("\"x.y\"").unwrap();
        assert_eq!(parsed.as_str(), "x.y");
        assert!(serde_json::from_str::<FieldPath>("\"\"").is_err());
    }
}
