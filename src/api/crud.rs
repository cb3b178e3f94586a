//! Purpose: Single-row reads and writes plus table create/drop.
//! Exports: `Crud`, `Ddl`.
//! Role: Maps row operations onto entity-path requests executed by `Connection`.
//! Invariants: Keys and column names are validated before any request is sent.
//! Invariants: Absence is `Ok(None)` for reads and a no-op for `delete_by_id`, never an error.
//! Invariants: A duplicate insert is a Duplicate error naming both keys; the stored row is untouched.
#![allow(clippy::result_large_err)]

use serde_json::json;
use tracing::debug;

use super::connection::{ApiResult, Connection, TableRequest};
use super::cursor::RowCursor;
use super::query::{DEFAULT_LIMIT, RowQuery};
use crate::core::error::{Error, ErrorKind};
use crate::core::row::{PARTITION_KEY, ROW_KEY, Row, validate_key};
use crate::core::value::quote;

const ENTITY_ALREADY_EXISTS: &str = "EntityAlreadyExists";
const TABLE_ALREADY_EXISTS: &str = "TableAlreadyExists";

#[derive(Clone, Debug)]
pub struct Crud {
    connection: Connection,
}

impl Crud {
    pub(crate) fn new(connection: Connection) -> Self {
        Self { connection }
    }

    /// Writes the row, overwriting any stored version entirely.
    pub fn insert_or_replace(&self, row: &Row) -> ApiResult<()> {
        self.write("PUT", row, None)
    }

    /// Writes the row, merging its columns into any stored version.
    pub fn insert_or_merge(&self, row: &Row) -> ApiResult<()> {
        self.write("MERGE", row, None)
    }

    pub fn insert_if_not_exists(&self, row: &Row) -> ApiResult<()> {
        row.validate_for_write()?;
        let request = TableRequest::write("POST", self.connection.table_name().to_string())
            .with_body(row.to_entity_json()?);
        match self.connection.execute(&request) {
            Ok(_) => Ok(()),
            Err(err) if is_conflict(&err, ENTITY_ALREADY_EXISTS) => Err(err
                .with_kind(ErrorKind::Duplicate)
                .with_message("a row with the same keys already exists")
                .with_key(row.partition_key(), row.row_key())),
            Err(err) => Err(err),
        }
    }

    /// Replaces the stored row only if it still carries the ETag this row was read with.
    pub fn atomic_update(&self, row: &Row) -> ApiResult<()> {
        let etag = row.etag().ok_or_else(|| {
            Error::config("atomic update requires a row read from the store (missing etag)")
                .with_key(row.partition_key(), row.row_key())
        })?;
        self.write("PUT", row, Some(etag))
            .map_err(|err| err.with_key(row.partition_key(), row.row_key()))
    }

    pub fn find_by_id(&self, partition_key: &str, row_key: &str) -> ApiResult<Option<Row>> {
        validate_key(PARTITION_KEY, partition_key)?;
        validate_key(ROW_KEY, row_key)?;
        let request = TableRequest::read(self.entity_resource(partition_key, row_key));
        match self.connection.execute(&request) {
            Ok(response) => {
                let body: serde_json::Value = response.json()?;
                Row::from_entity_json(&body).map(Some)
            }
            Err(err) if err.status() == Some(404) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Deletes the stored row, conditional on the row's ETag when it has one.
    pub fn delete(&self, row: &Row) -> ApiResult<()> {
        validate_key(PARTITION_KEY, row.partition_key())?;
        validate_key(ROW_KEY, row.row_key())?;
        let request = TableRequest::write(
            "DELETE",
            self.entity_resource(row.partition_key(), row.row_key()),
        )
        .with_if_match(row.etag().unwrap_or("*"));
        self.connection
            .execute(&request)
            .map(|_| ())
            .map_err(|err| err.with_key(row.partition_key(), row.row_key()))
    }

    /// Find then delete. Not atomic: a row removed by someone else in between is ignored.
    pub fn delete_by_id(&self, partition_key: &str, row_key: &str) -> ApiResult<()> {
        let Some(row) = self.find_by_id(partition_key, row_key)? else {
            return Ok(());
        };
        match self.delete(&row) {
            Err(err) if err.status() == Some(404) => {
                debug!(partition_key, row_key, "row vanished before delete");
                Ok(())
            }
            other => other,
        }
    }

    /// Every row in the table, fetched lazily in pages of the default size.
    pub fn find_all(&self) -> ApiResult<RowCursor> {
        self.connection
            .full_scan_query()
            .limit(DEFAULT_LIMIT)?
            .iter()
    }

    fn write(&self, method: &'static str, row: &Row, etag: Option<&str>) -> ApiResult<()> {
        row.validate_for_write()?;
        let mut request =
            TableRequest::write(method, self.entity_resource(row.partition_key(), row.row_key()))
                .with_body(row.to_entity_json()?);
        if let Some(etag) = etag {
            request = request.with_if_match(etag);
        }
        self.connection.execute(&request).map(|_| ())
    }

    fn entity_resource(&self, partition_key: &str, row_key: &str) -> String {
        entity_resource(self.connection.table_name(), partition_key, row_key)
    }
}

/// Table-level operations. Both are idempotent.
#[derive(Clone, Debug)]
pub struct Ddl {
    connection: Connection,
}

impl Ddl {
    pub(crate) fn new(connection: Connection) -> Self {
        Self { connection }
    }

    /// Returns true when this call created the table.
    pub fn create_table_if_not_exists(&self) -> ApiResult<bool> {
        let request = TableRequest::write("POST", "Tables".to_string())
            .with_body(json!({ "TableName": self.connection.table_name() }));
        match self.connection.execute(&request) {
            Ok(_) => Ok(true),
            Err(err) if is_conflict(&err, TABLE_ALREADY_EXISTS) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Returns true when this call dropped the table.
    pub fn drop_table_if_exists(&self) -> ApiResult<bool> {
        let resource = format!("Tables({})", quote(self.connection.table_name()));
        match self.connection.execute(&TableRequest::write("DELETE", resource)) {
            Ok(_) => Ok(true),
            Err(err) if err.status() == Some(404) => Ok(false),
            Err(err) => Err(err),
        }
    }
}

pub(crate) fn entity_resource(table: &str, partition_key: &str, row_key: &str) -> String {
    format!(
        "{table}({PARTITION_KEY}={},{ROW_KEY}={})",
        quote(partition_key),
        quote(row_key)
    )
}

fn is_conflict(err: &Error, code: &str) -> bool {
    err.status() == Some(409) && err.code().is_none_or(|actual| actual == code)
}

#[cfg(test)]
mod tests {
    use super::{entity_resource, is_conflict};
    use crate::api::Connection;
    use crate::core::error::{Error, ErrorKind};
    use crate::core::row::Row;

    fn connection() -> Connection {
        Connection::new("AccountName=myacct;AccountKey=a2V5", "people").expect("connection")
    }

    #[test]
    fn entity_resource_quotes_both_keys() {
        assert_eq!(
            entity_resource("people", "o'brien", "1"),
            "people(PartitionKey='o''brien',RowKey='1')"
        );
    }

    #[test]
    fn conflict_matches_status_and_code() {
        let err = Error::new(ErrorKind::Storage)
            .with_status(409)
            .with_code("EntityAlreadyExists");
        assert!(is_conflict(&err, "EntityAlreadyExists"));
        assert!(!is_conflict(&err, "TableAlreadyExists"));
        let bare = Error::new(ErrorKind::Storage).with_status(409);
        assert!(is_conflict(&bare, "EntityAlreadyExists"));
    }

    #[test]
    fn atomic_update_without_etag_fails_before_io() {
        let err = connection()
            .crud()
            .atomic_update(&Row::new("p", "r").with_column("Value", 1))
            .expect_err("err");
        assert_eq!(err.kind(), ErrorKind::Config);
        assert_eq!(err.key(), Some(("p", "r")));
    }

    #[test]
    fn invalid_keys_fail_before_io() {
        let crud = connection().crud();
        let err = crud
            .insert_or_replace(&Row::new("a/b", "r"))
            .expect_err("err");
        assert_eq!(err.kind(), ErrorKind::Config);
        let err = crud.find_by_id("p", "what?").expect_err("err");
        assert_eq!(err.kind(), ErrorKind::Config);
        let err = crud
            .insert_if_not_exists(&Row::new("p", "r").with_column("RowKey", "x"))
            .expect_err("err");
        assert_eq!(err.kind(), ErrorKind::Config);
    }
}
