//! Purpose: Loopback HTTP emulator of the table service protocol subset used by this crate.
//! Exports: `Emulator`, `Location`.
//! Role: Backs integration tests; runs an axum server on its own tokio runtime thread.
//! Invariants: Binds 127.0.0.1 only; every request must carry a valid SharedKeyLite signature.
//! Invariants: The secondary location serves reads only, from the same data as the primary.
//! Invariants: Injected faults are consumed before the request is counted or routed.
//! Invariants: Dropping the handle shuts the server down and joins its thread.
#![allow(clippy::result_large_err)]

mod expr;
mod store;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path as AxumPath, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use serde_json::{Map, Value, json};
use tokio::sync::oneshot;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

use crate::core::account::{DEVELOPMENT_ACCOUNT, DEVELOPMENT_KEY};
use crate::core::auth::{canonical_resource, sign};
use crate::core::error::{Error, ErrorKind};
use crate::core::row::{RESERVED_COLUMNS, Row};
use expr::Expr;
use store::{MAX_PAGE_SIZE, StoreError, TableStore, WriteMode};

const TABLE_PAYLOAD: &str = "application/json;odata=fullmetadata;streaming=true;charset=utf-8";
const SERVICE_VERSION: &str = "2019-02-02";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Location {
    Primary,
    Secondary,
}

pub struct Emulator {
    addr: SocketAddr,
    state: Arc<EmulatorState>,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl std::fmt::Debug for Emulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emulator").field("addr", &self.addr).finish()
    }
}

impl Emulator {
    pub fn start() -> Result<Self, Error> {
        init_tracing();
        let listener = std::net::TcpListener::bind("127.0.0.1:0")
            .map_err(|err| startup_error("failed to bind emulator").with_source(err))?;
        listener
            .set_nonblocking(true)
            .map_err(|err| startup_error("failed to configure emulator socket").with_source(err))?;
        let addr = listener
            .local_addr()
            .map_err(|err| startup_error("failed to read emulator address").with_source(err))?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("tablekit-emulator-worker")
            .enable_all()
            .build()
            .map_err(|err| startup_error("failed to build emulator runtime").with_source(err))?;

        let state = Arc::new(EmulatorState::new()?);
        let app = Router::new()
            .route("/:account/:resource", any(handle_request))
            .layer(TraceLayer::new_for_http())
            .with_state(Arc::clone(&state));

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let thread = thread::Builder::new()
            .name("tablekit-emulator".to_string())
            .spawn(move || {
                runtime.block_on(async move {
                    let listener = match tokio::net::TcpListener::from_std(listener) {
                        Ok(listener) => listener,
                        Err(err) => {
                            warn!(error = %err, "emulator listener setup failed");
                            return;
                        }
                    };
                    let server = axum::serve(listener, app).with_graceful_shutdown(async {
                        let _ = shutdown_rx.await;
                    });
                    if let Err(err) = server.await {
                        warn!(error = %err, "emulator server failed");
                    }
                });
            })
            .map_err(|err| startup_error("failed to spawn emulator thread").with_source(err))?;

        info!(%addr, "table emulator listening");
        Ok(Self {
            addr,
            state,
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn endpoint(&self) -> String {
        format!("http://{}/{DEVELOPMENT_ACCOUNT}", self.addr)
    }

    pub fn secondary_endpoint(&self) -> String {
        format!("http://{}/{DEVELOPMENT_ACCOUNT}-secondary", self.addr)
    }

    /// Descriptor for the primary location only.
    pub fn connection_string(&self) -> String {
        format!(
            "DefaultEndpointsProtocol=http;AccountName={DEVELOPMENT_ACCOUNT};AccountKey={DEVELOPMENT_KEY};TableEndpoint={};",
            self.endpoint()
        )
    }

    /// Descriptor that also names the read-only secondary location.
    pub fn connection_string_with_secondary(&self) -> String {
        format!(
            "{}TableSecondaryEndpoint={};",
            self.connection_string(),
            self.secondary_endpoint()
        )
    }

    /// The next `count` requests, at either location, fail with 503 ServerBusy.
    pub fn fail_next(&self, count: u32) {
        self.state.faults().any += count;
    }

    /// The next `count` requests to the primary location fail with 503 ServerBusy.
    pub fn fail_primary(&self, count: u32) {
        self.state.faults().primary += count;
    }

    /// Requests routed at `location`, not counting injected failures.
    pub fn requests(&self, location: Location) -> usize {
        match location {
            Location::Primary => self.state.primary_requests.load(Ordering::SeqCst),
            Location::Secondary => self.state.secondary_requests.load(Ordering::SeqCst),
        }
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.state.store().row_count(table)
    }
}

impl Drop for Emulator {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Installs a fmt subscriber filtered by `RUST_LOG` (default `warn`). Safe to call twice.
fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_test_writer()
        .try_init();
}

fn startup_error(message: &str) -> Error {
    Error::new(ErrorKind::Internal).with_message(message)
}

#[derive(Debug, Default)]
struct FaultPlan {
    any: u32,
    primary: u32,
}

struct EmulatorState {
    store: Mutex<TableStore>,
    faults: Mutex<FaultPlan>,
    primary_requests: AtomicUsize,
    secondary_requests: AtomicUsize,
    key: Vec<u8>,
}

impl EmulatorState {
    fn new() -> Result<Self, Error> {
        let key = BASE64.decode(DEVELOPMENT_KEY).map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("development key is not base64")
                .with_source(err)
        })?;
        Ok(Self {
            store: Mutex::new(TableStore::default()),
            faults: Mutex::new(FaultPlan::default()),
            primary_requests: AtomicUsize::new(0),
            secondary_requests: AtomicUsize::new(0),
            key,
        })
    }

    fn store(&self) -> MutexGuard<'_, TableStore> {
        self.store.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    fn faults(&self) -> MutexGuard<'_, FaultPlan> {
        self.faults.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    fn take_fault(&self, location: Location) -> bool {
        let mut faults = self.faults();
        if faults.any > 0 {
            faults.any -= 1;
            return true;
        }
        if location == Location::Primary && faults.primary > 0 {
            faults.primary -= 1;
            return true;
        }
        false
    }

    fn count(&self, location: Location) {
        let counter = match location {
            Location::Primary => &self.primary_requests,
            Location::Secondary => &self.secondary_requests,
        };
        counter.fetch_add(1, Ordering::SeqCst);
    }
}

/// The pieces of one request the dispatcher needs.
struct Incoming<'a> {
    method: &'a Method,
    uri: &'a Uri,
    headers: &'a HeaderMap,
    body: &'a [u8],
}

impl Incoming<'_> {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    fn query_param(&self, name: &str) -> Option<String> {
        let query = self.uri.query()?;
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.into_owned())
    }

    fn json_body(&self) -> Result<Value, StoreError> {
        serde_json::from_slice(self.body)
            .map_err(|err| StoreError::new(400, "InvalidInput", format!("invalid json body: {err}")))
    }
}

async fn handle_request(
    State(state): State<Arc<EmulatorState>>,
    AxumPath((account, resource)): AxumPath<(String, String)>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let incoming = Incoming {
        method: &method,
        uri: &uri,
        headers: &headers,
        body: &body,
    };
    match dispatch(&state, &account, &resource, &incoming) {
        Ok(response) => response,
        Err(err) => error_response(err),
    }
}

fn dispatch(
    state: &EmulatorState,
    account: &str,
    resource: &str,
    incoming: &Incoming<'_>,
) -> Result<Response, StoreError> {
    let location = match account.strip_prefix(DEVELOPMENT_ACCOUNT) {
        Some("") => Location::Primary,
        Some("-secondary") => Location::Secondary,
        _ => return Err(StoreError::new(404, "ResourceNotFound", "unknown account")),
    };
    if state.take_fault(location) {
        debug!(?location, "injecting ServerBusy");
        return Err(StoreError::new(
            503,
            "ServerBusy",
            "the server is currently unable to receive requests",
        ));
    }
    state.count(location);
    authorize(state, incoming)?;
    if location == Location::Secondary && incoming.method != Method::GET {
        return Err(StoreError::new(
            403,
            "InvalidOperation",
            "writes are not allowed against the secondary location",
        ));
    }

    match (parse_resource(resource)?, incoming.method.as_str()) {
        (Resource::Tables, "POST") => create_table(state, incoming),
        (Resource::Table(name), "DELETE") => {
            state.store().delete_table(&name)?;
            Ok(no_content(None))
        }
        (Resource::Collection(table), "POST") => insert_entity(state, &table, incoming),
        (Resource::Query(table), "GET") => query_entities(state, &table, incoming),
        (Resource::Entity { table, pk, rk }, "GET") => {
            let row = state.store().get(&table, &pk, &rk)?;
            let etag = row.etag().map(str::to_string);
            let mut payload = entity_payload(&row)?;
            if let Value::Object(object) = &mut payload {
                object.insert(
                    "odata.metadata".to_string(),
                    Value::String(format!("$metadata#{table}/@Element")),
                );
            }
            let mut response = json_response(StatusCode::OK, &payload);
            set_header(&mut response, header::ETAG, etag.as_deref());
            Ok(response)
        }
        (Resource::Entity { table, pk, rk }, method @ ("PUT" | "MERGE")) => {
            let row = body_row(incoming, pk, rk)?;
            let mode = if method == "MERGE" {
                WriteMode::Merge
            } else {
                WriteMode::Replace
            };
            let etag = state
                .store()
                .write(&table, &row, mode, incoming.header("if-match"))?;
            Ok(no_content(Some(&etag)))
        }
        (Resource::Entity { table, pk, rk }, "DELETE") => {
            let if_match = incoming.header("if-match").unwrap_or("*");
            state.store().delete(&table, &pk, &rk, if_match)?;
            Ok(no_content(None))
        }
        _ => Err(StoreError::new(
            405,
            "UnsupportedHttpVerb",
            format!("{} is not supported on this resource", incoming.method),
        )),
    }
}

/// Recomputes the SharedKeyLite signature for the development account.
fn authorize(state: &EmulatorState, incoming: &Incoming<'_>) -> Result<(), StoreError> {
    let denied = |message: &str| StoreError::new(403, "AuthenticationFailed", message);
    let date = incoming
        .header("x-ms-date")
        .ok_or_else(|| denied("missing x-ms-date header"))?;
    let provided = incoming
        .header("authorization")
        .ok_or_else(|| denied("missing authorization header"))?;
    let url = Url::parse(&format!("http://emulator{}", incoming.uri))
        .map_err(|_| denied("unparseable request uri"))?;
    let string_to_sign = format!("{date}\n{}", canonical_resource(DEVELOPMENT_ACCOUNT, &url));
    let signature = sign(&state.key, &string_to_sign)
        .map_err(|_| StoreError::new(500, "InternalError", "signer unavailable"))?;
    if provided != format!("SharedKeyLite {DEVELOPMENT_ACCOUNT}:{signature}") {
        return Err(denied("signature mismatch"));
    }
    Ok(())
}

#[derive(Debug, Eq, PartialEq)]
enum Resource {
    Tables,
    Table(String),
    Collection(String),
    Query(String),
    Entity { table: String, pk: String, rk: String },
}

fn parse_resource(resource: &str) -> Result<Resource, StoreError> {
    let invalid = || StoreError::new(400, "InvalidUri", format!("invalid resource '{resource}'"));
    let Some((name, rest)) = resource.split_once('(') else {
        if resource == "Tables" {
            return Ok(Resource::Tables);
        }
        return Ok(Resource::Collection(resource.to_string()));
    };
    let inner = rest.strip_suffix(')').ok_or_else(invalid)?;
    if name == "Tables" {
        let (table, tail) = parse_quoted(inner).ok_or_else(invalid)?;
        return if tail.is_empty() {
            Ok(Resource::Table(table))
        } else {
            Err(invalid())
        };
    }
    if inner.is_empty() {
        return Ok(Resource::Query(name.to_string()));
    }
    let after_pk = inner.strip_prefix("PartitionKey=").ok_or_else(invalid)?;
    let (pk, tail) = parse_quoted(after_pk).ok_or_else(invalid)?;
    let after_rk = tail.strip_prefix(",RowKey=").ok_or_else(invalid)?;
    let (rk, tail) = parse_quoted(after_rk).ok_or_else(invalid)?;
    if !tail.is_empty() {
        return Err(invalid());
    }
    Ok(Resource::Entity {
        table: name.to_string(),
        pk,
        rk,
    })
}

/// Splits a leading `'...'` literal (with `''` escapes) from the rest of the input.
fn parse_quoted(input: &str) -> Option<(String, &str)> {
    let body = input.strip_prefix('\'')?;
    let mut text = String::new();
    let mut chars = body.char_indices().peekable();
    while let Some((idx, ch)) = chars.next() {
        if ch != '\'' {
            text.push(ch);
            continue;
        }
        if chars.peek().is_some_and(|(_, next)| *next == '\'') {
            chars.next();
            text.push('\'');
            continue;
        }
        return Some((text, &body[idx + 1..]));
    }
    None
}

fn create_table(state: &EmulatorState, incoming: &Incoming<'_>) -> Result<Response, StoreError> {
    let body = incoming.json_body()?;
    let name = body
        .get("TableName")
        .and_then(Value::as_str)
        .filter(|name| !name.is_empty())
        .ok_or_else(|| StoreError::new(400, "InvalidInput", "TableName is required"))?;
    state.store().create_table(name)?;
    Ok(json_response(
        StatusCode::CREATED,
        &json!({ "odata.metadata": "$metadata#Tables/@Element", "TableName": name }),
    ))
}

fn insert_entity(
    state: &EmulatorState,
    table: &str,
    incoming: &Incoming<'_>,
) -> Result<Response, StoreError> {
    let row = Row::from_entity_json(&incoming.json_body()?).map_err(invalid_entity)?;
    let etag = state.store().insert(table, &row)?;
    Ok(no_content(Some(&etag)))
}

fn body_row(incoming: &Incoming<'_>, pk: String, rk: String) -> Result<Row, StoreError> {
    let parsed = Row::from_entity_json(&incoming.json_body()?).map_err(invalid_entity)?;
    if parsed.partition_key() != pk || parsed.row_key() != rk {
        return Err(StoreError::new(
            400,
            "PropertiesNeedValue",
            "body keys do not match the request uri",
        ));
    }
    Ok(parsed)
}

fn query_entities(
    state: &EmulatorState,
    table: &str,
    incoming: &Incoming<'_>,
) -> Result<Response, StoreError> {
    let filter = incoming
        .query_param("$filter")
        .map(|raw| Expr::parse(&raw))
        .transpose()
        .map_err(|err| {
            StoreError::new(400, "InvalidInput", err.message().unwrap_or("invalid filter"))
        })?;
    let top = match incoming.query_param("$top") {
        Some(raw) => raw
            .parse::<usize>()
            .ok()
            .filter(|top| *top > 0)
            .ok_or_else(|| StoreError::new(400, "InvalidInput", "invalid $top"))?,
        None => MAX_PAGE_SIZE,
    };
    let select = incoming.query_param("$select").map(|raw| {
        raw.split(',')
            .map(|column| column.trim().to_string())
            .filter(|column| !column.is_empty())
            .collect::<Vec<_>>()
    });
    let resume = match incoming.query_param("NextPartitionKey") {
        Some(pk) => Some((
            decode_token(&pk)?,
            match incoming.query_param("NextRowKey") {
                Some(rk) => decode_token(&rk)?,
                None => String::new(),
            },
        )),
        None => None,
    };

    let page = state.store().query(table, filter.as_ref(), top, resume)?;
    let mut values = Vec::with_capacity(page.rows.len());
    for row in &page.rows {
        let payload = entity_payload(row)?;
        values.push(match &select {
            Some(columns) => project(payload, columns),
            None => payload,
        });
    }
    let mut response = json_response(
        StatusCode::OK,
        &json!({ "odata.metadata": format!("$metadata#{table}"), "value": values }),
    );
    if let Some((pk, rk)) = page.next {
        set_header(
            &mut response,
            HeaderName::from_static("x-ms-continuation-nextpartitionkey"),
            Some(&BASE64.encode(pk)),
        );
        set_header(
            &mut response,
            HeaderName::from_static("x-ms-continuation-nextrowkey"),
            Some(&BASE64.encode(rk)),
        );
    }
    Ok(response)
}

fn decode_token(raw: &str) -> Result<String, StoreError> {
    BASE64
        .decode(raw)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .ok_or_else(|| StoreError::new(400, "InvalidInput", "invalid continuation token"))
}

/// Keeps reserved columns, metadata, and the selected columns; selected-but-absent become null.
fn project(payload: Value, columns: &[String]) -> Value {
    let Value::Object(object) = payload else {
        return payload;
    };
    let keep = |name: &str| {
        let base = name.split_once('@').map_or(name, |(base, _)| base);
        name.starts_with("odata.")
            || RESERVED_COLUMNS.contains(&base)
            || columns.iter().any(|column| column == base)
    };
    let mut projected: Map<String, Value> = object
        .into_iter()
        .filter(|(name, _)| keep(name))
        .collect();
    for column in columns {
        projected.entry(column.clone()).or_insert(Value::Null);
    }
    Value::Object(projected)
}

fn entity_payload(row: &Row) -> Result<Value, StoreError> {
    row.to_full_metadata_json()
        .map_err(|err| StoreError::new(500, "InternalError", err.to_string()))
}

fn invalid_entity(err: Error) -> StoreError {
    StoreError::new(400, "InvalidInput", err.to_string())
}

fn json_response(status: StatusCode, payload: &Value) -> Response {
    let mut response = (status, payload.to_string()).into_response();
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(TABLE_PAYLOAD));
    response
        .headers_mut()
        .insert("x-ms-version", HeaderValue::from_static(SERVICE_VERSION));
    response
}

fn no_content(etag: Option<&str>) -> Response {
    let mut response = StatusCode::NO_CONTENT.into_response();
    response
        .headers_mut()
        .insert("x-ms-version", HeaderValue::from_static(SERVICE_VERSION));
    set_header(&mut response, header::ETAG, etag);
    response
}

fn set_header(response: &mut Response, name: HeaderName, value: Option<&str>) {
    if let Some(value) = value.and_then(|value| HeaderValue::from_str(value).ok()) {
        response.headers_mut().insert(name, value);
    }
}

fn error_response(err: StoreError) -> Response {
    let status = StatusCode::from_u16(err.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    json_response(
        status,
        &json!({
            "odata.error": {
                "code": err.code,
                "message": { "lang": "en-US", "value": err.message },
            }
        }),
    )
}
