//! Purpose: Fluent query descriptors for partition, row-key range, predicate, and full scans.
//! Exports: `PartitionQuery`, `RowRangeQuery`, `FilterQuery`, `FullScanQuery`, `RowQuery`, `Page`.
//! Role: Renders descriptors into filter/top/select parameters and fetches pages via `Connection`.
//! Invariants: Every fluent step consumes the descriptor and returns a new one; nothing is shared.
//! Invariants: Limit and projection are validated when set, before any network I/O.
//! Invariants: Reserved columns are always part of the projection.
#![allow(clippy::result_large_err)]

use serde::Deserialize;
use serde_json::Value;

use super::connection::{ApiResult, Connection, TableRequest};
use super::cursor::RowCursor;
use crate::core::error::Error;
use crate::core::filter::{self, Comparator, Filter};
use crate::core::row::{RESERVED_COLUMNS, Row};

pub const DEFAULT_LIMIT: u32 = 1000;

/// Opaque resume point returned by a partial scan. Only valid with the query that produced it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ContinuationToken {
    next_partition_key: String,
    next_row_key: Option<String>,
}

#[derive(Clone, Debug)]
pub struct Page {
    pub rows: Vec<Row>,
    /// `None` once the scan has no further pages.
    pub continuation: Option<ContinuationToken>,
}

/// A fully rendered query: filter string, page size, projection.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct QuerySpec {
    filter: Option<String>,
    options: QueryOptions,
}

impl QuerySpec {
    pub fn filter(&self) -> Option<&str> {
        self.filter.as_deref()
    }

    pub fn limit(&self) -> u32 {
        self.options.limit
    }

    /// `$select` value including the reserved columns, or `None` to fetch every column.
    pub fn projection(&self) -> Option<String> {
        let columns = self.options.select.as_ref()?;
        let mut projection: Vec<&str> = RESERVED_COLUMNS.to_vec();
        for column in columns {
            if !projection.contains(&column.as_str()) {
                projection.push(column);
            }
        }
        Some(projection.join(","))
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
struct QueryOptions {
    limit: u32,
    select: Option<Vec<String>>,
}

impl QueryOptions {
    fn new() -> Self {
        Self {
            limit: DEFAULT_LIMIT,
            select: None,
        }
    }

    fn with_limit(mut self, limit: u32) -> ApiResult<Self> {
        if limit == 0 {
            return Err(Error::config("the provided limit should be strictly positive"));
        }
        self.limit = limit;
        Ok(self)
    }

    fn with_select<I, S>(mut self, columns: I) -> ApiResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let columns: Vec<String> = columns.into_iter().map(Into::into).collect();
        if columns.is_empty() {
            return Err(Error::config("provide at least one column to select"));
        }
        if columns.iter().any(|column| column.trim().is_empty()) {
            return Err(Error::config("the columns to select must not be blank"));
        }
        self.select = Some(columns);
        Ok(self)
    }
}

/// Terminal operations shared by every query shape.
pub trait RowQuery {
    fn connection(&self) -> &Connection;

    fn query_spec(&self) -> ApiResult<QuerySpec>;

    /// One request: at most `limit` rows, continuation discarded.
    fn list(&self) -> ApiResult<Vec<Row>> {
        Ok(self.list_first_page()?.rows)
    }

    /// First page's rows, for callers that never paginate.
    fn list_single_page(&self) -> ApiResult<Vec<Row>> {
        self.list()
    }

    fn list_first_page(&self) -> ApiResult<Page> {
        fetch_page(self.connection(), &self.query_spec()?, None)
    }

    fn list_next_page(&self, token: &ContinuationToken) -> ApiResult<Page> {
        fetch_page(self.connection(), &self.query_spec()?, Some(token))
    }

    /// Lazy iteration over every matching row; `limit` is the page size.
    fn iter(&self) -> ApiResult<RowCursor> {
        RowCursor::open(self.connection().clone(), self.query_spec()?)
    }
}

#[derive(Clone, Debug)]
pub struct PartitionQuery {
    connection: Connection,
    partition_key: String,
    options: QueryOptions,
}

impl PartitionQuery {
    pub(crate) fn new(connection: Connection, partition_key: String) -> Self {
        Self {
            connection,
            partition_key,
            options: QueryOptions::new(),
        }
    }

    pub fn limit(mut self, limit: u32) -> ApiResult<Self> {
        self.options = self.options.with_limit(limit)?;
        Ok(self)
    }

    pub fn select<I, S>(mut self, columns: I) -> ApiResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options = self.options.with_select(columns)?;
        Ok(self)
    }

    /// Lower row-key bound, inclusive unless followed by `exclusive()`.
    pub fn from(self, row_key: impl Into<String>) -> RowRangeQuery {
        RowRangeQuery {
            partition: self,
            lower: Some(RowKeyBound::inclusive(row_key)),
            upper: None,
            last: BoundSide::Lower,
        }
    }

    /// Upper row-key bound, inclusive unless followed by `exclusive()`.
    pub fn up_to(self, row_key: impl Into<String>) -> RowRangeQuery {
        RowRangeQuery {
            partition: self,
            lower: None,
            upper: Some(RowKeyBound::inclusive(row_key)),
            last: BoundSide::Upper,
        }
    }
}

impl RowQuery for PartitionQuery {
    fn connection(&self) -> &Connection {
        &self.connection
    }

    fn query_spec(&self) -> ApiResult<QuerySpec> {
        Ok(QuerySpec {
            filter: Some(filter::partition_filter(&self.partition_key)),
            options: self.options.clone(),
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RowKeyBound {
    pub row_key: String,
    pub inclusive: bool,
}

impl RowKeyBound {
    fn inclusive(row_key: impl Into<String>) -> Self {
        Self {
            row_key: row_key.into(),
            inclusive: true,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum BoundSide {
    Lower,
    Upper,
}

/// Partition scan restricted to a row-key range. `inclusive()`/`exclusive()` apply to the
/// bound set most recently.
#[derive(Clone, Debug)]
pub struct RowRangeQuery {
    partition: PartitionQuery,
    lower: Option<RowKeyBound>,
    upper: Option<RowKeyBound>,
    last: BoundSide,
}

impl RowRangeQuery {
    pub fn inclusive(self) -> Self {
        self.with_last_inclusive(true)
    }

    pub fn exclusive(self) -> Self {
        self.with_last_inclusive(false)
    }

    pub fn up_to(mut self, row_key: impl Into<String>) -> Self {
        self.upper = Some(RowKeyBound::inclusive(row_key));
        self.last = BoundSide::Upper;
        self
    }

    pub fn limit(mut self, limit: u32) -> ApiResult<Self> {
        self.partition = self.partition.limit(limit)?;
        Ok(self)
    }

    pub fn select<I, S>(mut self, columns: I) -> ApiResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.partition = self.partition.select(columns)?;
        Ok(self)
    }

    pub fn lower_bound(&self) -> Option<&RowKeyBound> {
        self.lower.as_ref()
    }

    pub fn upper_bound(&self) -> Option<&RowKeyBound> {
        self.upper.as_ref()
    }

    fn with_last_inclusive(mut self, inclusive: bool) -> Self {
        let bound = match self.last {
            BoundSide::Lower => self.lower.as_mut(),
            BoundSide::Upper => self.upper.as_mut(),
        };
        if let Some(bound) = bound {
            bound.inclusive = inclusive;
        }
        self
    }

    fn range_filter(&self) -> Option<String> {
        let lower = self.lower.as_ref().map(|bound| {
            let comparator = if bound.inclusive {
                Comparator::Ge
            } else {
                Comparator::Gt
            };
            filter::row_key_filter(comparator, &bound.row_key)
        });
        let upper = self.upper.as_ref().map(|bound| {
            let comparator = if bound.inclusive {
                Comparator::Le
            } else {
                Comparator::Lt
            };
            filter::row_key_filter(comparator, &bound.row_key)
        });
        match (lower, upper) {
            (Some(lower), Some(upper)) => Some(filter::and(&lower, &upper)),
            (Some(only), None) | (None, Some(only)) => Some(only),
            (None, None) => None,
        }
    }
}

impl RowQuery for RowRangeQuery {
    fn connection(&self) -> &Connection {
        &self.partition.connection
    }

    fn query_spec(&self) -> ApiResult<QuerySpec> {
        let partition = filter::partition_filter(&self.partition.partition_key);
        let filter = match self.range_filter() {
            Some(range) => filter::and(&partition, &range),
            None => partition,
        };
        Ok(QuerySpec {
            filter: Some(filter),
            options: self.partition.options.clone(),
        })
    }
}

/// Predicate scan over the whole table. The store has no index to prune with, so cost
/// grows with table size, not with the number of matches.
#[derive(Clone, Debug)]
pub struct FilterQuery {
    connection: Connection,
    filters: Vec<Filter>,
    options: QueryOptions,
}

impl FilterQuery {
    pub(crate) fn new(connection: Connection, filters: Vec<Filter>) -> ApiResult<Self> {
        if filters.is_empty() {
            return Err(Error::config(
                "provide at least one filter for a filter query",
            ));
        }
        Ok(Self {
            connection,
            filters,
            options: QueryOptions::new(),
        })
    }

    pub fn limit(mut self, limit: u32) -> ApiResult<Self> {
        self.options = self.options.with_limit(limit)?;
        Ok(self)
    }

    pub fn select<I, S>(mut self, columns: I) -> ApiResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options = self.options.with_select(columns)?;
        Ok(self)
    }
}

impl RowQuery for FilterQuery {
    fn connection(&self) -> &Connection {
        &self.connection
    }

    fn query_spec(&self) -> ApiResult<QuerySpec> {
        Ok(QuerySpec {
            filter: Some(filter::and_all(&self.filters)?),
            options: self.options.clone(),
        })
    }
}

/// Unfiltered scan of the whole table; `limit` is the page size.
#[derive(Clone, Debug)]
pub struct FullScanQuery {
    connection: Connection,
    options: QueryOptions,
}

impl FullScanQuery {
    pub(crate) fn new(connection: Connection) -> Self {
        Self {
            connection,
            options: QueryOptions::new(),
        }
    }

    pub fn limit(mut self, limit: u32) -> ApiResult<Self> {
        self.options = self.options.with_limit(limit)?;
        Ok(self)
    }

    pub fn select<I, S>(mut self, columns: I) -> ApiResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options = self.options.with_select(columns)?;
        Ok(self)
    }
}

impl RowQuery for FullScanQuery {
    fn connection(&self) -> &Connection {
        &self.connection
    }

    fn query_spec(&self) -> ApiResult<QuerySpec> {
        Ok(QuerySpec {
            filter: None,
            options: self.options.clone(),
        })
    }
}

#[derive(Deserialize)]
struct QueryEnvelope {
    #[serde(default)]
    value: Vec<Value>,
}

pub(crate) fn fetch_page(
    connection: &Connection,
    spec: &QuerySpec,
    token: Option<&ContinuationToken>,
) -> ApiResult<Page> {
    let mut request = TableRequest::read(format!("{}()", connection.table_name()))
        .with_query("$top", spec.limit().to_string());
    if let Some(filter) = spec.filter() {
        request = request.with_query("$filter", filter);
    }
    if let Some(projection) = spec.projection() {
        request = request.with_query("$select", projection);
    }
    if let Some(token) = token {
        request = request.with_query("NextPartitionKey", token.next_partition_key.clone());
        if let Some(row_key) = &token.next_row_key {
            request = request.with_query("NextRowKey", row_key.clone());
        }
    }

    let response = connection.execute(&request)?;
    let envelope: QueryEnvelope = response.json()?;
    let rows = envelope
        .value
        .iter()
        .map(Row::from_entity_json)
        .collect::<ApiResult<Vec<_>>>()?;
    let continuation = response
        .next_partition_key
        .map(|next_partition_key| ContinuationToken {
            next_partition_key,
            next_row_key: response.next_row_key,
        });
    Ok(Page { rows, continuation })
}
