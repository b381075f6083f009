//! Dynamically-typed value tree used for [`crate::Record::data`].
//!
//! Source drivers hand the engine schemaless records; this is the typed
//! stand-in for `map[string]interface{}`. Processors read and write fields
//! through dotted paths (`"user.email"`) rather than indexing `data`
//! directly, so a processor never has to know whether an intermediate
//! segment is present.

use std::collections::BTreeMap;

/// A single node in the dynamically-typed data tree carried by a [`crate::Record`].
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Absence of a value.
    #[default]
    Null,
    /// Boolean scalar.
    Bool(bool),
    /// Numeric scalar. JSON has no integer/float distinction at the wire, so
    /// this mirrors `serde_json::Number` rather than splitting i64/f64.
    Number(serde_json::Number),
    /// Text scalar.
    String(String),
    /// Raw bytes, e.g. an undecoded message payload awaiting a decode processor.
    Bytes(Vec<u8>),
    /// Ordered list of values.
    List(Vec<Value>),
    /// String-keyed map of values. `BTreeMap` keeps field order deterministic
    /// for logging and test assertions.
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Builds an empty map value, the usual root for a freshly-read [`crate::Record`].
    pub fn map() -> Self {
        Value::Map(BTreeMap::new())
    }

    /// Returns the value at `path`, where `path` is a `.`-separated sequence
    /// of map keys. Returns `None` if any segment is missing or the tree
    /// diverges from a map at some segment.
    ///
    /// ```
    /// use weir::Value;
    /// let mut root = Value::map();
    /// root.set_path("user.email", Value::String("a@b.com".into())).unwrap();
    /// assert_eq!(root.get_path("user.email"), Some(&Value::String("a@b.com".into())));
    /// assert_eq!(root.get_path("user.missing"), None);
    /// ```
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut current = self;
        for segment in path.split('.') {
            match current {
                Value::Map(m) => current = m.get(segment)?,
                _ => return None,
            }
        }
        Some(current)
    }

    /// Sets the value at `path`, auto-creating intermediate maps as needed.
    ///
    /// Fails if an intermediate segment already holds a non-map value, since
    /// overwriting it would silently discard data the caller didn't ask to
    /// remove.
    pub fn set_path(&mut self, path: &str, value: Value) -> Result<(), crate::Error> {
        let mut segments = path.split('.').peekable();
        let mut current = self;

        while let Some(segment) = segments.next() {
            let is_last = segments.peek().is_none();

            if !matches!(current, Value::Map(_)) {
                *current = Value::map();
            }

            let Value::Map(map) = current else {
                unreachable!("just normalized to Value::Map above");
            };

            if is_last {
                map.insert(segment.to_string(), value);
                return Ok(());
            }

            current = map
                .entry(segment.to_string())
                .or_insert_with(Value::map);

            if !matches!(current, Value::Map(_)) {
                return Err(crate::Error::Processing(format!(
                    "path segment '{segment}' in '{path}' is not a map"
                )));
            }
        }

        Ok(())
    }

    /// Returns the value as a `&str`, if it is a [`Value::String`].
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Returns the value as an `f64`, if it is a [`Value::Number`] representable as one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => n.as_f64(),
            _ => None,
        }
    }

    /// Returns the value as a byte slice, if it is [`Value::Bytes`].
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b.as_slice()),
            _ => None,
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(a) => Value::List(a.into_iter().map(Value::from).collect()),
            serde_json::Value::Object(o) => {
                Value::Map(o.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_path_creates_intermediate_maps() {
        let mut root = Value::map();
        root.set_path("a.b.c", Value::Bool(true)).unwrap();
        assert_eq!(root.get_path("a.b.c"), Some(&Value::Bool(true)));
        assert!(root.get_path("a.b").is_some());
    }

    #[test]
    fn set_path_overwrites_leaf() {
        let mut root = Value::map();
        root.set_path("n", Value::String("one".into())).unwrap();
        root.set_path("n", Value::String("two".into())).unwrap();
        assert_eq!(root.get_path("n"), Some(&Value::String("two".into())));
    }

    #[test]
    fn set_path_rejects_non_map_intermediate() {
        let mut root = Value::map();
        root.set_path("n", Value::Bool(true)).unwrap();
        assert!(root.set_path("n.child", Value::Bool(false)).is_err());
    }

    #[test]
    fn get_path_missing_segment_is_none() {
        let root = Value::map();
        assert_eq!(root.get_path("missing"), None);
    }

    #[test]
    fn from_json_round_trips_object() {
        let json: serde_json::Value = serde_json::from_str(r#"{"a":1,"b":{"c":"x"}}"#).unwrap();
        let v = Value::from(json);
        assert_eq!(v.get_path("a").and_then(Value::as_f64), Some(1.0));
        assert_eq!(v.get_path("b.c").and_then(Value::as_str), Some("x"));
    }
}
