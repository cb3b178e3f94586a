//! Purpose: Define the public client surface of tablekit.
//! Exports: Connection, query builders, cursor, CRUD/DDL, property reconstruction, core types.
//! Role: Public boundary; request plumbing stays private to `connection`.
//! Invariants: Every network call is made through `Connection`.
//! Invariants: Core value and row types are re-exported here so callers need one import path.

mod connection;
mod crud;
mod cursor;
mod property;
mod query;

pub use crate::core::account::StorageAccount;
pub use crate::core::auth::Credential;
pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::filter::{Comparator, Filter, and, and_all};
pub use crate::core::row::Row;
pub use crate::core::value::{ColumnKind, ColumnValue};
pub use connection::{
    API_VERSION, ApiResult, Connection, ConnectionOptions, FULL_METADATA_JSON, LocationMode,
    RetryPolicy,
};
pub use crud::{Crud, Ddl};
pub use cursor::RowCursor;
pub use property::{
    PROPERTY_VALUE_ROW_KEY, PropertySource, PropertyStore, PropertyValue, normalize_property_name,
};
pub use query::{
    ContinuationToken, DEFAULT_LIMIT, FilterQuery, FullScanQuery, Page, PartitionQuery, QuerySpec,
    RowKeyBound, RowQuery, RowRangeQuery,
};
