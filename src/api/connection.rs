//! Purpose: Per-table handle that owns the HTTP agent and the fixed request policy.
//! Exports: `Connection`, `ConnectionOptions`, `RetryPolicy`, `LocationMode`.
//! Role: The only component that performs network I/O; every query and CRUD call goes through `execute`.
//! Invariants: Policy (location mode, full-metadata JSON, retry/backoff) is fixed at construction.
//! Invariants: Reads may fall back to the secondary endpoint on retry; writes always target primary.
//! Invariants: Non-2xx responses become Storage errors carrying status and store error code.
#![allow(clippy::result_large_err)]

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use time::OffsetDateTime;
use tracing::{debug, warn};
use url::Url;

use super::crud::{Crud, Ddl};
use super::query::{FilterQuery, FullScanQuery, PartitionQuery};
use crate::core::account::StorageAccount;
use crate::core::auth::http_date;
use crate::core::error::{Error, ErrorKind};
use crate::core::filter::Filter;

pub type ApiResult<T> = Result<T, Error>;

pub const API_VERSION: &str = "2019-02-02";
pub const FULL_METADATA_JSON: &str = "application/json;odata=fullmetadata";
const DATA_SERVICE_VERSION: &str = "3.0;NetFx";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LocationMode {
    PrimaryOnly,
    PrimaryThenSecondary,
}

/// Exponential backoff: retry `n` (0-based) waits `min(base * 2^n, max)`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    pub fn exponential(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
        }
    }

    pub fn none() -> Self {
        Self::exponential(0, Duration::ZERO, Duration::ZERO)
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(3, Duration::from_secs(3), Duration::from_secs(90))
    }
}

#[derive(Clone, Debug)]
pub struct ConnectionOptions {
    pub retry: RetryPolicy,
    pub request_timeout: Duration,
}

impl ConnectionOptions {
    pub fn new() -> Self {
        Self {
            retry: RetryPolicy::default(),
            request_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to one table. Cloning is cheap and clones share the agent; the agent's
/// pooled sockets are released when the last clone is dropped.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    account: StorageAccount,
    table: String,
    agent: ureq::Agent,
    retry: RetryPolicy,
    location_mode: LocationMode,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("table", &self.inner.table)
            .field("primary", &self.inner.account.primary_endpoint().as_str())
            .field("location_mode", &self.inner.location_mode)
            .finish()
    }
}

impl Connection {
    pub fn new(descriptor: &str, table: impl Into<String>) -> ApiResult<Self> {
        Self::with_options(descriptor, table, ConnectionOptions::default())
    }

    pub fn with_options(
        descriptor: &str,
        table: impl Into<String>,
        options: ConnectionOptions,
    ) -> ApiResult<Self> {
        let account = StorageAccount::parse(descriptor)?;
        let table = table.into();
        validate_table_name(&table)?;
        let agent = ureq::AgentBuilder::new()
            .timeout(options.request_timeout)
            .build();
        Ok(Self {
            inner: Arc::new(ConnectionInner {
                account,
                table,
                agent,
                retry: options.retry,
                location_mode: LocationMode::PrimaryThenSecondary,
            }),
        })
    }

    pub fn table_name(&self) -> &str {
        &self.inner.table
    }

    pub fn account(&self) -> &StorageAccount {
        &self.inner.account
    }

    pub fn location_mode(&self) -> LocationMode {
        self.inner.location_mode
    }

    pub fn payload_format(&self) -> &'static str {
        FULL_METADATA_JSON
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.inner.retry
    }

    pub fn crud(&self) -> Crud {
        Crud::new(self.clone())
    }

    pub fn ddl(&self) -> Ddl {
        Ddl::new(self.clone())
    }

    pub fn partition_query(&self, partition_key: impl Into<String>) -> PartitionQuery {
        PartitionQuery::new(self.clone(), partition_key.into())
    }

    /// Predicate scan. The store evaluates it over the whole table (no partition pruning).
    pub fn filter_query(&self, filters: Vec<Filter>) -> ApiResult<FilterQuery> {
        FilterQuery::new(self.clone(), filters)
    }

    pub fn full_scan_query(&self) -> FullScanQuery {
        FullScanQuery::new(self.clone())
    }

    pub(crate) fn execute(&self, request: &TableRequest) -> ApiResult<TableResponse> {
        let retry = &self.inner.retry;
        let mut attempt = 0u32;
        loop {
            let endpoint = self.endpoint_for(attempt, request.read);
            let url = self.build_url(endpoint, request)?;
            debug!(
                method = request.method,
                path = url.path(),
                attempt,
                "table request"
            );
            match self.send_once(request, &url) {
                Ok(response) => return Ok(response),
                Err(failure) => {
                    if !failure.retryable || attempt >= retry.max_retries() {
                        return Err(failure.error);
                    }
                    let delay = retry.delay_for(attempt);
                    warn!(
                        method = request.method,
                        status = failure.error.status(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "retrying table request"
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
            }
        }
    }

    fn endpoint_for(&self, attempt: u32, read: bool) -> &Url {
        let account = &self.inner.account;
        match (self.inner.location_mode, account.secondary_endpoint()) {
            (LocationMode::PrimaryThenSecondary, Some(secondary)) if read && attempt % 2 == 1 => {
                secondary
            }
            _ => account.primary_endpoint(),
        }
    }

    fn build_url(&self, endpoint: &Url, request: &TableRequest) -> ApiResult<Url> {
        let mut url = endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| Error::config("table endpoint cannot be a base"))?
            .pop_if_empty()
            .push(&request.resource);
        if !request.query.is_empty() {
            let query = request
                .query
                .iter()
                .map(|(name, value)| format!("{name}={}", encode_query_value(value)))
                .collect::<Vec<_>>()
                .join("&");
            url.set_query(Some(&query));
        }
        self.inner.account.credential().apply_to_url(&mut url);
        Ok(url)
    }

    fn send_once(&self, request: &TableRequest, url: &Url) -> Result<TableResponse, AttemptFailure> {
        let date = http_date(OffsetDateTime::now_utc()).map_err(AttemptFailure::fatal)?;
        let mut call = self
            .inner
            .agent
            .request(request.method, url.as_str())
            .set("Accept", FULL_METADATA_JSON)
            .set("x-ms-version", API_VERSION)
            .set("x-ms-date", &date)
            .set("DataServiceVersion", DATA_SERVICE_VERSION)
            .set("MaxDataServiceVersion", DATA_SERVICE_VERSION);
        if let Some(authorization) = self
            .inner
            .account
            .credential()
            .authorization(&date, url)
            .map_err(AttemptFailure::fatal)?
        {
            call = call.set("Authorization", &authorization);
        }
        if let Some(etag) = &request.if_match {
            call = call.set("If-Match", etag);
        }

        let result = match &request.body {
            Some(body) => {
                let payload = serde_json::to_string(body).map_err(|err| {
                    AttemptFailure::fatal(
                        Error::new(ErrorKind::Internal)
                            .with_message("failed to encode request json")
                            .with_source(err),
                    )
                })?;
                call.set("Content-Type", "application/json")
                    .set("Prefer", "return-no-content")
                    .send_string(&payload)
            }
            None => call.call(),
        };

        match result {
            Ok(response) => TableResponse::capture(response).map_err(AttemptFailure::fatal),
            Err(ureq::Error::Status(code, response)) => Err(AttemptFailure {
                retryable: is_retryable_status(code),
                error: parse_error_response(code, response),
            }),
            Err(ureq::Error::Transport(err)) => Err(AttemptFailure {
                retryable: true,
                error: Error::new(ErrorKind::Storage)
                    .with_message("request failed")
                    .with_source(err),
            }),
        }
    }
}

/// One logical call against the table service; re-sent unchanged on retry.
#[derive(Clone, Debug)]
pub(crate) struct TableRequest {
    method: &'static str,
    resource: String,
    query: Vec<(&'static str, String)>,
    if_match: Option<String>,
    body: Option<Value>,
    read: bool,
}

impl TableRequest {
    pub(crate) fn read(resource: String) -> Self {
        Self {
            method: "GET",
            resource,
            query: Vec::new(),
            if_match: None,
            body: None,
            read: true,
        }
    }

    pub(crate) fn write(method: &'static str, resource: String) -> Self {
        Self {
            method,
            resource,
            query: Vec::new(),
            if_match: None,
            body: None,
            read: false,
        }
    }

    pub(crate) fn with_query(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.query.push((name, value.into()));
        self
    }

    pub(crate) fn with_if_match(mut self, etag: impl Into<String>) -> Self {
        self.if_match = Some(etag.into());
        self
    }

    pub(crate) fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

#[derive(Debug)]
pub(crate) struct TableResponse {
    pub(crate) status: u16,
    pub(crate) body: String,
    pub(crate) next_partition_key: Option<String>,
    pub(crate) next_row_key: Option<String>,
}

impl TableResponse {
    fn capture(response: ureq::Response) -> ApiResult<Self> {
        let status = response.status();
        let header = |name: &str| response.header(name).map(str::to_string);
        let next_partition_key = header("x-ms-continuation-NextPartitionKey");
        let next_row_key = header("x-ms-continuation-NextRowKey");
        let body = response.into_string().map_err(|err| {
            Error::new(ErrorKind::Storage)
                .with_message("failed to read response body")
                .with_source(err)
        })?;
        Ok(Self {
            status,
            body,
            next_partition_key,
            next_row_key,
        })
    }

    pub(crate) fn json<R: DeserializeOwned>(&self) -> ApiResult<R> {
        serde_json::from_str(&self.body).map_err(|err| {
            Error::new(ErrorKind::Decode)
                .with_message("invalid response json")
                .with_source(err)
        })
    }
}

struct AttemptFailure {
    error: Error,
    retryable: bool,
}

impl AttemptFailure {
    fn fatal(error: Error) -> Self {
        Self {
            error,
            retryable: false,
        }
    }
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    #[serde(rename = "odata.error")]
    error: RemoteError,
}

#[derive(Deserialize)]
struct RemoteError {
    code: String,
    message: Option<RemoteMessage>,
}

#[derive(Deserialize)]
struct RemoteMessage {
    value: String,
}

fn parse_error_response(status: u16, response: ureq::Response) -> Error {
    let body = response.into_string().unwrap_or_default();
    let err = Error::new(ErrorKind::Storage).with_status(status);
    match serde_json::from_str::<ErrorEnvelope>(&body) {
        Ok(envelope) => {
            let message = envelope
                .error
                .message
                .map(|message| message.value)
                .unwrap_or_else(|| format!("store returned status {status}"));
            err.with_code(envelope.error.code).with_message(message)
        }
        Err(_) => err.with_message(format!("store returned status {status}")),
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 500 | 502 | 503 | 504)
}

/// Percent-encodes a query value; spaces become `%20` rather than `+`.
fn encode_query_value(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}

pub(crate) fn validate_table_name(table: &str) -> ApiResult<()> {
    let valid_shape = (3..=63).contains(&table.len())
        && table.starts_with(|ch: char| ch.is_ascii_alphabetic())
        && table.chars().all(|ch| ch.is_ascii_alphanumeric());
    if !valid_shape {
        return Err(Error::config(format!(
            "table name '{table}' must be 3-63 alphanumeric characters starting with a letter"
        )));
    }
    if table.eq_ignore_ascii_case("tables") {
        return Err(Error::config("'tables' is a reserved table name"));
    }
    Ok(())
}
