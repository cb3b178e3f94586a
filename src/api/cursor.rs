//! Purpose: Lazy row iterator that follows continuation tokens page by page.
//! Exports: `RowCursor`.
//! Role: Returned by `RowQuery::iter`; owns a connection clone and the rendered query.
//! Invariants: At most one page is buffered; the next page is fetched only when the buffer drains.
//! Invariants: A fetch error is yielded once and ends the iteration.
#![allow(clippy::result_large_err)]

use std::vec;

use super::connection::{ApiResult, Connection};
use super::query::{ContinuationToken, QuerySpec, fetch_page};
use crate::core::row::Row;

pub struct RowCursor {
    connection: Connection,
    spec: QuerySpec,
    page: vec::IntoIter<Row>,
    continuation: Option<ContinuationToken>,
}

impl RowCursor {
    /// Fetches the first page eagerly so setup errors surface here, not on the first `next`.
    pub(crate) fn open(connection: Connection, spec: QuerySpec) -> ApiResult<Self> {
        let first = fetch_page(&connection, &spec, None)?;
        Ok(Self {
            connection,
            spec,
            page: first.rows.into_iter(),
            continuation: first.continuation,
        })
    }

    /// True while buffered rows remain or the store reported more pages. A trailing
    /// page may still turn out empty.
    pub fn has_next(&self) -> bool {
        !self.page.as_slice().is_empty() || self.continuation.is_some()
    }

    pub fn continuation(&self) -> Option<&ContinuationToken> {
        self.continuation.as_ref()
    }
}

impl Iterator for RowCursor {
    type Item = ApiResult<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(row) = self.page.next() {
                return Some(Ok(row));
            }
            let token = self.continuation.take()?;
            match fetch_page(&self.connection, &self.spec, Some(&token)) {
                Ok(page) => {
                    self.page = page.rows.into_iter();
                    self.continuation = page.continuation;
                }
                Err(err) => return Some(Err(err)),
            }
        }
    }
}

impl std::fmt::Debug for RowCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowCursor")
            .field("buffered", &self.page.as_slice().len())
            .field("continuation", &self.continuation)
            .finish()
    }
}
