//! Purpose: Define the `Row` entity and its OData JSON representation.
//! Exports: `Row`, reserved column names, key validation.
//! Role: Shared by the client (encode writes, decode reads) and the emulator (storage).
//! Invariants: Reserved columns are modeled as fields, never as entries in `columns`.
//! Invariants: Every non-reserved column decodes through `ColumnValue::from_json`.
use std::collections::BTreeMap;

use serde_json::{Map, Value};
use time::OffsetDateTime;

use crate::core::error::{Error, ErrorKind};
use crate::core::value::{ColumnValue, format_datetime, parse_datetime};

pub const PARTITION_KEY: &str = "PartitionKey";
pub const ROW_KEY: &str = "RowKey";
pub const TIMESTAMP: &str = "Timestamp";
pub const RESERVED_COLUMNS: [&str; 3] = [PARTITION_KEY, ROW_KEY, TIMESTAMP];

const ETAG_FIELD: &str = "odata.etag";
const TYPE_SUFFIX: &str = "@odata.type";
const MAX_KEY_BYTES: usize = 1024;

#[derive(Clone, Debug, PartialEq)]
pub struct Row {
    partition_key: String,
    row_key: String,
    timestamp: Option<OffsetDateTime>,
    etag: Option<String>,
    columns: BTreeMap<String, ColumnValue>,
}

impl Row {
    pub fn new(partition_key: impl Into<String>, row_key: impl Into<String>) -> Self {
        Self {
            partition_key: partition_key.into(),
            row_key: row_key.into(),
            timestamp: None,
            etag: None,
            columns: BTreeMap::new(),
        }
    }

    pub fn with_column(mut self, name: impl Into<String>, value: impl Into<ColumnValue>) -> Self {
        self.set_column(name, value);
        self
    }

    pub fn set_column(&mut self, name: impl Into<String>, value: impl Into<ColumnValue>) {
        self.columns.insert(name.into(), value.into());
    }

    pub fn remove_column(&mut self, name: &str) -> Option<ColumnValue> {
        self.columns.remove(name)
    }

    pub fn column(&self, name: &str) -> Option<&ColumnValue> {
        self.columns.get(name)
    }

    /// Non-reserved columns, ordered by name.
    pub fn columns(&self) -> &BTreeMap<String, ColumnValue> {
        &self.columns
    }

    pub fn into_columns(self) -> BTreeMap<String, ColumnValue> {
        self.columns
    }

    pub fn partition_key(&self) -> &str {
        &self.partition_key
    }

    pub fn row_key(&self) -> &str {
        &self.row_key
    }

    /// Last-modified time assigned by the store; `None` for rows built locally.
    pub fn timestamp(&self) -> Option<OffsetDateTime> {
        self.timestamp
    }

    /// Concurrency token of the stored version this row was read from.
    pub fn etag(&self) -> Option<&str> {
        self.etag.as_deref()
    }

    pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = Some(etag.into());
        self
    }

    pub(crate) fn with_timestamp(mut self, timestamp: OffsetDateTime) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Checks keys and column names before a write leaves the process.
    pub fn validate_for_write(&self) -> Result<(), Error> {
        validate_key(PARTITION_KEY, &self.partition_key)?;
        validate_key(ROW_KEY, &self.row_key)?;
        for name in self.columns.keys() {
            validate_column_name(name)?;
        }
        Ok(())
    }

    /// Wire body for writes: keys plus every column, tagged where the kind is not inferable.
    pub fn to_entity_json(&self) -> Result<Value, Error> {
        let mut object = Map::new();
        object.insert(PARTITION_KEY.to_string(), Value::String(self.partition_key.clone()));
        object.insert(ROW_KEY.to_string(), Value::String(self.row_key.clone()));
        for (name, value) in &self.columns {
            let (payload, tag) = value.to_json()?;
            if let Some(tag) = tag {
                object.insert(format!("{name}{TYPE_SUFFIX}"), Value::String(tag.to_string()));
            }
            object.insert(name.clone(), payload);
        }
        Ok(Value::Object(object))
    }

    /// Full-metadata representation as the store returns it (used by the emulator).
    pub(crate) fn to_full_metadata_json(&self) -> Result<Value, Error> {
        let mut value = self.to_entity_json()?;
        if let Value::Object(object) = &mut value {
            if let Some(etag) = &self.etag {
                object.insert(ETAG_FIELD.to_string(), Value::String(etag.clone()));
            }
            if let Some(timestamp) = self.timestamp {
                object.insert(
                    format!("{TIMESTAMP}{TYPE_SUFFIX}"),
                    Value::String("Edm.DateTime".to_string()),
                );
                object.insert(TIMESTAMP.to_string(), Value::String(format_datetime(timestamp)?));
            }
        }
        Ok(value)
    }

    pub fn from_entity_json(value: &Value) -> Result<Self, Error> {
        let object = value
            .as_object()
            .ok_or_else(|| decode_error("entity payload is not a json object"))?;
        let partition_key = required_str(object, PARTITION_KEY)?;
        let row_key = required_str(object, ROW_KEY)?;
        let mut row = Row::new(partition_key, row_key);

        if let Some(raw) = object.get(TIMESTAMP).filter(|raw| !raw.is_null()) {
            let text = raw
                .as_str()
                .ok_or_else(|| decode_error("Timestamp is not a string"))?;
            let timestamp = parse_datetime(text)
                .map_err(|err| decode_error("Timestamp is not RFC 3339").with_source(err))?;
            row.timestamp = Some(timestamp);
        }
        if let Some(etag) = object.get(ETAG_FIELD).and_then(Value::as_str) {
            row.etag = Some(etag.to_string());
        }

        for (name, raw) in object {
            if is_reserved(name) || name.starts_with("odata.") || name.contains('@') {
                continue;
            }
            let tag = match object.get(&format!("{name}{TYPE_SUFFIX}")) {
                None => None,
                Some(Value::String(tag)) => Some(tag.as_str()),
                Some(_) => {
                    return Err(decode_error(format!("kind tag of column '{name}' is not a string")));
                }
            };
            let value = ColumnValue::from_json(tag, raw)
                .map_err(|err| err.with_key(row.partition_key.clone(), row.row_key.clone()))?;
            row.columns.insert(name.clone(), value);
        }
        Ok(row)
    }
}

pub fn is_reserved(name: &str) -> bool {
    RESERVED_COLUMNS.contains(&name)
}

pub fn validate_key(label: &str, key: &str) -> Result<(), Error> {
    if key.len() > MAX_KEY_BYTES {
        return Err(Error::config(format!("{label} exceeds {MAX_KEY_BYTES} bytes")));
    }
    if let Some(bad) = key.chars().find(|ch| is_disallowed_key_char(*ch)) {
        return Err(Error::config(format!(
            "{label} contains a disallowed character {bad:?}"
        )));
    }
    Ok(())
}

fn is_disallowed_key_char(ch: char) -> bool {
    matches!(ch, '/' | '\\' | '#' | '?') || ch.is_control()
}

fn validate_column_name(name: &str) -> Result<(), Error> {
    if name.trim().is_empty() {
        return Err(Error::config("column names must not be blank"));
    }
    if is_reserved(name) {
        return Err(Error::config(format!(
            "'{name}' is a reserved column and cannot be written"
        )));
    }
    if name.contains('@') || name.starts_with("odata.") {
        return Err(Error::config(format!(
            "column name '{name}' collides with wire metadata"
        )));
    }
    Ok(())
}

fn required_str(object: &Map<String, Value>, field: &str) -> Result<String, Error> {
    object
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| decode_error(format!("entity is missing {field}")))
}

fn decode_error(message: impl Into<String>) -> Error {
    Error::new(ErrorKind::Decode).with_message(message)
}
