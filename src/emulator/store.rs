// In-memory tables backing the emulator; rows are kept in (partition key, row key) order.
use std::collections::BTreeMap;
use std::ops::Bound;

use time::OffsetDateTime;

use super::expr::Expr;
use crate::core::row::Row;
use crate::core::value::ColumnValue;

pub(crate) const MAX_PAGE_SIZE: usize = 1000;

/// Service-level failure: HTTP status plus the store error code.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct StoreError {
    pub(crate) status: u16,
    pub(crate) code: &'static str,
    pub(crate) message: String,
}

impl StoreError {
    pub(crate) fn new(status: u16, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    fn table_not_found(table: &str) -> Self {
        Self::new(404, "TableNotFound", format!("table '{table}' does not exist"))
    }

    fn resource_not_found() -> Self {
        Self::new(404, "ResourceNotFound", "the specified resource does not exist")
    }
}

type Key = (String, String);

#[derive(Clone, Debug)]
struct StoredRow {
    columns: BTreeMap<String, ColumnValue>,
    timestamp: OffsetDateTime,
    generation: u64,
}

impl StoredRow {
    fn etag(&self) -> String {
        format!("W/\"{}\"", self.generation)
    }

    fn to_row(&self, key: &Key) -> Row {
        let mut row = Row::new(key.0.clone(), key.1.clone())
            .with_timestamp(self.timestamp)
            .with_etag(self.etag());
        for (name, value) in &self.columns {
            row.set_column(name.clone(), value.clone());
        }
        row
    }
}

/// How a write treats an existing row.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum WriteMode {
    Replace,
    Merge,
}

#[derive(Debug, Default)]
pub(crate) struct TableStore {
    tables: BTreeMap<String, BTreeMap<Key, StoredRow>>,
    generation: u64,
}

/// One page of query results and the key to resume from.
#[derive(Debug)]
pub(crate) struct QueryPage {
    pub(crate) rows: Vec<Row>,
    pub(crate) next: Option<Key>,
}

impl TableStore {
    pub(crate) fn create_table(&mut self, name: &str) -> Result<(), StoreError> {
        if self.find_table_name(name).is_some() {
            return Err(StoreError::new(
                409,
                "TableAlreadyExists",
                format!("table '{name}' already exists"),
            ));
        }
        self.tables.insert(name.to_string(), BTreeMap::new());
        Ok(())
    }

    pub(crate) fn delete_table(&mut self, name: &str) -> Result<(), StoreError> {
        let existing = self
            .find_table_name(name)
            .ok_or_else(StoreError::resource_not_found)?;
        self.tables.remove(&existing);
        Ok(())
    }

    pub(crate) fn insert(&mut self, table: &str, row: &Row) -> Result<String, StoreError> {
        let key = key_of(row);
        let generation = self.next_generation();
        let rows = self.table_mut(table)?;
        if rows.contains_key(&key) {
            return Err(StoreError::new(
                409,
                "EntityAlreadyExists",
                "the specified entity already exists",
            ));
        }
        let stored = stored_from(row, BTreeMap::new(), generation);
        let etag = stored.etag();
        rows.insert(key, stored);
        Ok(etag)
    }

    /// Upsert, or conditional update when `if_match` is given (`*` matches any version).
    pub(crate) fn write(
        &mut self,
        table: &str,
        row: &Row,
        mode: WriteMode,
        if_match: Option<&str>,
    ) -> Result<String, StoreError> {
        let key = key_of(row);
        let generation = self.next_generation();
        let rows = self.table_mut(table)?;
        let existing = rows.get(&key);
        if let Some(expected) = if_match {
            let current = existing.ok_or_else(StoreError::resource_not_found)?;
            if expected != "*" && expected != current.etag() {
                return Err(StoreError::new(
                    412,
                    "UpdateConditionNotSatisfied",
                    "the update condition specified in the request was not satisfied",
                ));
            }
        }
        let base = match (mode, existing) {
            (WriteMode::Merge, Some(current)) => current.columns.clone(),
            _ => BTreeMap::new(),
        };
        let stored = stored_from(row, base, generation);
        let etag = stored.etag();
        rows.insert(key, stored);
        Ok(etag)
    }

    pub(crate) fn delete(
        &mut self,
        table: &str,
        partition_key: &str,
        row_key: &str,
        if_match: &str,
    ) -> Result<(), StoreError> {
        let rows = self.table_mut(table)?;
        let key = (partition_key.to_string(), row_key.to_string());
        let current = rows.get(&key).ok_or_else(StoreError::resource_not_found)?;
        if if_match != "*" && if_match != current.etag() {
            return Err(StoreError::new(
                412,
                "UpdateConditionNotSatisfied",
                "the update condition specified in the request was not satisfied",
            ));
        }
        rows.remove(&key);
        Ok(())
    }

    pub(crate) fn get(&self, table: &str, partition_key: &str, row_key: &str) -> Result<Row, StoreError> {
        let rows = self.table(table)?;
        let key = (partition_key.to_string(), row_key.to_string());
        rows.get(&key)
            .map(|stored| stored.to_row(&key))
            .ok_or_else(StoreError::resource_not_found)
    }

    /// Scans from `resume` (inclusive) in key order; `next` is the first match past the page.
    pub(crate) fn query(
        &self,
        table: &str,
        filter: Option<&Expr>,
        top: usize,
        resume: Option<Key>,
    ) -> Result<QueryPage, StoreError> {
        let rows = self.table(table)?;
        let lower = match resume {
            Some(key) => Bound::Included(key),
            None => Bound::Unbounded,
        };
        let page_size = top.clamp(1, MAX_PAGE_SIZE);
        let mut matching = rows
            .range((lower, Bound::Unbounded))
            .map(|(key, stored)| stored.to_row(key))
            .filter(|row| filter.is_none_or(|expr| expr.matches(row)));
        let page: Vec<Row> = matching.by_ref().take(page_size).collect();
        let next = matching
            .next()
            .map(|row| (row.partition_key().to_string(), row.row_key().to_string()));
        Ok(QueryPage { rows: page, next })
    }

    pub(crate) fn row_count(&self, table: &str) -> usize {
        self.find_table_name(table)
            .and_then(|name| self.tables.get(&name))
            .map_or(0, BTreeMap::len)
    }

    fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    /// Table names are case-insensitive.
    fn find_table_name(&self, name: &str) -> Option<String> {
        self.tables
            .keys()
            .find(|existing| existing.eq_ignore_ascii_case(name))
            .cloned()
    }

    fn table(&self, name: &str) -> Result<&BTreeMap<Key, StoredRow>, StoreError> {
        self.find_table_name(name)
            .and_then(|existing| self.tables.get(&existing))
            .ok_or_else(|| StoreError::table_not_found(name))
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut BTreeMap<Key, StoredRow>, StoreError> {
        let existing = self
            .find_table_name(name)
            .ok_or_else(|| StoreError::table_not_found(name))?;
        self.tables
            .get_mut(&existing)
            .ok_or_else(|| StoreError::table_not_found(name))
    }
}

fn key_of(row: &Row) -> Key {
    (row.partition_key().to_string(), row.row_key().to_string())
}

/// Null columns are not persisted; on merge they leave the stored value untouched.
fn stored_from(row: &Row, mut base: BTreeMap<String, ColumnValue>, generation: u64) -> StoredRow {
    for (name, value) in row.columns() {
        if !value.is_null() {
            base.insert(name.clone(), value.clone());
        }
    }
    StoredRow {
        columns: base,
        timestamp: OffsetDateTime::now_utc(),
        generation,
    }
}

#[cfg(test)]
mod tests {
    use super::{TableStore, WriteMode};
    use crate::core::row::Row;
    use crate::core::value::ColumnValue;
    use crate::emulator::expr::Expr;

    fn store_with_table() -> TableStore {
        let mut store = TableStore::default();
        store.create_table("people").expect("create");
        store
    }

    #[test]
    fn table_names_are_case_insensitive() {
        let mut store = store_with_table();
        let err = store.create_table("People").expect_err("err");
        assert_eq!(err.code, "TableAlreadyExists");
        store.delete_table("PEOPLE").expect("delete");
        let err = store.delete_table("people").expect_err("err");
        assert_eq!(err.status, 404);
    }

    #[test]
    fn merge_keeps_unmentioned_columns_replace_drops_them() {
        let mut store = store_with_table();
        let row = Row::new("p", "r").with_column("A", 1).with_column("B", 2);
        store.write("people", &row, WriteMode::Replace, None).expect("write");

        let patch = Row::new("p", "r").with_column("B", 3).with_column("C", ColumnValue::Null);
        store.write("people", &patch, WriteMode::Merge, None).expect("merge");
        let merged = store.get("people", "p", "r").expect("get");
        assert_eq!(merged.column("A"), Some(&ColumnValue::Int32(1)));
        assert_eq!(merged.column("B"), Some(&ColumnValue::Int32(3)));
        assert_eq!(merged.column("C"), None);

        store.write("people", &patch, WriteMode::Replace, None).expect("replace");
        let replaced = store.get("people", "p", "r").expect("get");
        assert_eq!(replaced.columns().len(), 1);
    }

    #[test]
    fn conditional_write_checks_etag() {
        let mut store = store_with_table();
        let etag = store.insert("people", &Row::new("p", "r")).expect("insert");
        let row = Row::new("p", "r").with_column("A", 1);
        store
            .write("people", &row, WriteMode::Replace, Some(&etag))
            .expect("first update");
        let err = store
            .write("people", &row, WriteMode::Replace, Some(&etag))
            .expect_err("stale etag");
        assert_eq!(err.status, 412);
        assert_eq!(err.code, "UpdateConditionNotSatisfied");
    }

    #[test]
    fn query_pages_resume_at_next_match() {
        let mut store = store_with_table();
        for (pk, rk, age) in [("a", "1", 10), ("a", "2", 40), ("b", "1", 50), ("b", "2", 5)] {
            let row = Row::new(pk, rk).with_column("Age", age);
            store.insert("people", &row).expect("insert");
        }
        let filter = Expr::parse("Age gt 20").expect("parse");
        let first = store.query("people", Some(&filter), 1, None).expect("query");
        assert_eq!(first.rows.len(), 1);
        assert_eq!(first.rows[0].row_key(), "2");
        assert_eq!(first.next, Some(("b".to_string(), "1".to_string())));

        let second = store
            .query("people", Some(&filter), 1, first.next)
            .expect("query");
        assert_eq!(second.rows[0].partition_key(), "b");
        assert_eq!(second.next, None);
    }

    #[test]
    fn missing_table_is_not_found() {
        let store = TableStore::default();
        let err = store.query("ghost", None, 10, None).expect_err("err");
        assert_eq!(err.code, "TableNotFound");
    }
}
