//! Reference processors mirroring the distilled spec's reference set:
//! JSON decoding, field renaming, regex masking, and field filtering.
use std::collections::BTreeMap;

use async_trait::async_trait;
use regex::Regex;

use crate::{Error, Processor, Record, Value};

/// Expands a raw JSON payload carried under `data["raw"]` (as [`Value::Bytes`]
/// or [`Value::String`]) into top-level keys of `data`.
///
/// Mirrors `JSONParser.Process` in the original implementation: `raw` is
/// parsed and merged into the root map, leaving `raw` itself in place.
#[derive(Debug, Default)]
pub struct JsonDecode;

#[async_trait]
impl Processor for JsonDecode {
    async fn process(&self, mut record: Record) -> Result<Record, Error> {
        let raw = record
            .data
            .get_path("raw")
            .ok_or_else(|| Error::Processing("field 'raw' not found in message data".into()))?;

        let bytes: Vec<u8> = match raw {
            Value::Bytes(b) => b.clone(),
            Value::String(s) => s.clone().into_bytes(),
            _ => {
                return Err(Error::Processing(
                    "field 'raw' is not bytes or a string".into(),
                ))
            }
        };

        let parsed: serde_json::Value = serde_json::from_slice(&bytes)?;
        let serde_json::Value::Object(fields) = parsed else {
            return Err(Error::Processing("parsed JSON payload is not an object".into()));
        };

        let Value::Map(root) = &mut record.data else {
            return Err(Error::Processing("record data is not a map".into()));
        };
        for (key, value) in fields {
            root.insert(key, Value::from(value));
        }

        Ok(record)
    }
}

/// Renames fields at the top level of `data`: each `(old, new)` pair moves
/// `data[old]` to `data[new]`, removing `old`. Missing old keys are skipped.
///
/// Mirrors `FieldMapper.Process`.
#[derive(Debug, Default)]
pub struct RenameField {
    mapping: BTreeMap<String, String>,
}

impl RenameField {
    /// Builds a renamer from an iterable of `(old_name, new_name)` pairs.
    pub fn new(mapping: impl IntoIterator<Item = (String, String)>) -> Self {
        RenameField {
            mapping: mapping.into_iter().collect(),
        }
    }
}

#[async_trait]
impl Processor for RenameField {
    async fn process(&self, mut record: Record) -> Result<Record, Error> {
        let Value::Map(root) = &mut record.data else {
            return Err(Error::Processing("record data is not a map".into()));
        };
        for (old_name, new_name) in &self.mapping {
            if let Some(value) = root.remove(old_name) {
                root.insert(new_name.clone(), value);
            }
        }
        Ok(record)
    }
}

/// Replaces every match of a regular expression in a string field, addressed
/// by dotted path, with a replacement template (`$1`, `$2`, ... capture
/// references are supported, matching [`regex::Regex::replace_all`]).
///
/// Mirrors `RegexReplacer.Process`. A missing field or a non-string value at
/// `field` is left untouched rather than treated as an error, matching the
/// original's `if val != nil { if strVal, ok := ... }` guard.
#[derive(Debug)]
pub struct RegexMask {
    field: String,
    pattern: Regex,
    replacement: String,
}

impl RegexMask {
    /// Compiles `pattern` and builds a masker over `field`.
    pub fn new(
        field: impl Into<String>,
        pattern: &str,
        replacement: impl Into<String>,
    ) -> Result<Self, Error> {
        let pattern = Regex::new(pattern)
            .map_err(|err| Error::Config(format!("invalid regex pattern: {err}")))?;
        Ok(RegexMask {
            field: field.into(),
            pattern,
            replacement: replacement.into(),
        })
    }
}

#[async_trait]
impl Processor for RegexMask {
    async fn process(&self, mut record: Record) -> Result<Record, Error> {
        if let Some(value) = record.data.get_path(&self.field) {
            if let Some(s) = value.as_str() {
                let masked = self
                    .pattern
                    .replace_all(s, self.replacement.as_str())
                    .into_owned();
                record.data.set_path(&self.field, Value::String(masked))?;
            }
        }
        Ok(record)
    }
}

/// The comparison operators [`Filter`] supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    /// Field equals a string value.
    Eq,
    /// Field, as a number, is strictly greater than a threshold.
    GreaterThan,
}

/// Drops a message unless a field satisfies a comparison.
///
/// Mirrors `Filter.Process`: a missing field always drops the message; `Eq`
/// compares strings; `GreaterThan` compares numbers, but — matching the
/// original's type-assertion fallthrough — passes the message through
/// untouched if the field isn't numeric, rather than dropping it.
#[derive(Debug)]
pub struct Filter {
    field: String,
    op: FilterOp,
    string_value: Option<String>,
    number_value: Option<f64>,
}

impl Filter {
    /// Builds an equality filter: keeps records where `data[field] == value`.
    pub fn equals(field: impl Into<String>, value: impl Into<String>) -> Self {
        Filter {
            field: field.into(),
            op: FilterOp::Eq,
            string_value: Some(value.into()),
            number_value: None,
        }
    }

    /// Builds a threshold filter: keeps records where `data[field] > value`.
    pub fn greater_than(field: impl Into<String>, value: f64) -> Self {
        Filter {
            field: field.into(),
            op: FilterOp::GreaterThan,
            string_value: None,
            number_value: Some(value),
        }
    }
}

#[async_trait]
impl Processor for Filter {
    async fn process(&self, record: Record) -> Result<Record, Error> {
        let value = record
            .data
            .get_path(&self.field)
            .ok_or_else(|| Error::Processing(format!("filter field '{}' missing", self.field)))?;

        match self.op {
            FilterOp::Eq => {
                let expected = self.string_value.as_deref().unwrap_or_default();
                if value.as_str() != Some(expected) {
                    return Err(Error::Processing(format!(
                        "filter condition failed: {:?} != {expected:?}",
                        value.as_str()
                    )));
                }
            }
            FilterOp::GreaterThan => {
                let threshold = self.number_value.unwrap_or_default();
                if let Some(actual) = value.as_f64() {
                    if !(actual > threshold) {
                        return Err(Error::Processing(format!(
                            "filter condition failed: {actual} <= {threshold}"
                        )));
                    }
                }
                // Non-numeric field: the original's type assertion fails
                // silently and the message passes through.
            }
        }

        Ok(record)
    }
}
