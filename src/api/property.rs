//! Purpose: Expose a table as a read-only source of named configuration properties.
//! Exports: `PropertyStore`, `PropertyValue`, `PropertySource`, `normalize_property_name`.
//! Role: Reconstructs a scalar, list, or map from the columns of one row per property.
//! Invariants: A property lives at (normalized name, `propertyValue`).
//! Invariants: Columns named `_0`, `_1`, ... form a list ordered by index; other names form a map.
//! Invariants: A column with a kind tag this crate does not know fails the read with a Decode error.
#![allow(clippy::result_large_err)]

use std::collections::BTreeMap;

use super::connection::{ApiResult, Connection};
use super::query::RowQuery;
use crate::core::row::Row;
use crate::core::value::ColumnValue;

pub const PROPERTY_VALUE_ROW_KEY: &str = "propertyValue";
const NAME_SCAN_PAGE_SIZE: u32 = 100;

#[derive(Clone, Debug, PartialEq)]
pub enum PropertyValue {
    Scalar(ColumnValue),
    List(Vec<ColumnValue>),
    Map(BTreeMap<String, ColumnValue>),
}

impl PropertyValue {
    /// Rebuilds a property from a row's non-reserved columns; `None` for a lone null column.
    pub fn from_row(row: Row) -> Option<Self> {
        let mut columns = row.into_columns();
        if columns.len() == 1 {
            let (_, value) = columns.pop_first()?;
            return (!value.is_null()).then_some(PropertyValue::Scalar(value));
        }

        if !columns.keys().all(|name| list_index(name).is_some()) {
            return Some(PropertyValue::Map(columns));
        }
        let mut indexed: Vec<(i32, ColumnValue)> = columns
            .into_iter()
            .filter_map(|(name, value)| Some((list_index(&name)?, value)))
            .collect();
        indexed.sort_by_key(|(index, _)| *index);
        Some(PropertyValue::List(
            indexed.into_iter().map(|(_, value)| value).collect(),
        ))
    }

    pub fn as_scalar(&self) -> Option<&ColumnValue> {
        match self {
            PropertyValue::Scalar(value) => Some(value),
            _ => None,
        }
    }
}

/// `_<digits>` where the digits fit a non-negative i32.
fn list_index(name: &str) -> Option<i32> {
    let digits = name.strip_prefix('_')?;
    if digits.is_empty() || !digits.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    digits.parse::<i32>().ok()
}

/// Strips the characters a partition key cannot hold: `/ # ? \ \t \n \r`.
pub fn normalize_property_name(name: &str) -> String {
    name.chars()
        .filter(|ch| !matches!(ch, '/' | '#' | '?' | '\\' | '\t' | '\n' | '\r'))
        .collect()
}

/// The two calls a host configuration layer makes against a property backend.
pub trait PropertySource {
    fn property_names(&self) -> ApiResult<Vec<String>>;

    fn property(&self, name: &str) -> ApiResult<Option<PropertyValue>>;
}

#[derive(Clone, Debug)]
pub struct PropertyStore {
    connection: Connection,
}

impl PropertyStore {
    pub fn new(connection: Connection) -> Self {
        Self { connection }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn get_property(&self, name: &str) -> ApiResult<Option<PropertyValue>> {
        let key = normalize_property_name(name);
        let row = self
            .connection
            .crud()
            .find_by_id(&key, PROPERTY_VALUE_ROW_KEY)?;
        Ok(row.and_then(PropertyValue::from_row))
    }

    /// Partition keys of every stored row, in scan order.
    pub fn list_property_names(&self) -> ApiResult<Vec<String>> {
        self.connection
            .full_scan_query()
            .limit(NAME_SCAN_PAGE_SIZE)?
            .iter()?
            .map(|row| row.map(|row| row.partition_key().to_string()))
            .collect()
    }
}

impl PropertySource for PropertyStore {
    fn property_names(&self) -> ApiResult<Vec<String>> {
        self.list_property_names()
    }

    fn property(&self, name: &str) -> ApiResult<Option<PropertyValue>> {
        self.get_property(name)
    }
}
