//! Purpose: Parse `key=value;` connection descriptors into endpoints and credentials.
//! Exports: `StorageAccount`, development-storage constants.
//! Role: Fail-fast configuration boundary for `Connection`.
//! Invariants: Parse errors are Config errors and never echo the descriptor (it carries secrets).
//! Invariants: The secondary endpoint exists only when derivable or given explicitly.
use std::collections::HashMap;

use url::Url;

use crate::core::auth::Credential;
use crate::core::error::Error;

pub const DEVELOPMENT_ACCOUNT: &str = "devstoreaccount1";
pub const DEVELOPMENT_KEY: &str =
    "Eby8vdM02xNOcqFlqUwJPLlmEtlCDXJ1OUzFT50uSRZ6IFsuFq2UVErCz4I6tq/K1SZFPTOtr/KBHBeksoGMGw==";
const DEVELOPMENT_ENDPOINT: &str = "http://127.0.0.1:10002/devstoreaccount1";
const DEFAULT_SUFFIX: &str = "core.windows.net";

#[derive(Clone, Debug)]
pub struct StorageAccount {
    name: Option<String>,
    primary: Url,
    secondary: Option<Url>,
    credential: Credential,
}

impl StorageAccount {
    pub fn parse(descriptor: &str) -> Result<Self, Error> {
        let settings = parse_settings(descriptor)?;
        let get = |key: &str| settings.get(key).map(String::as_str);

        if get("usedevelopmentstorage").is_some_and(|flag| flag.eq_ignore_ascii_case("true")) {
            return Ok(Self {
                name: Some(DEVELOPMENT_ACCOUNT.to_string()),
                primary: parse_endpoint(DEVELOPMENT_ENDPOINT)?,
                secondary: None,
                credential: Credential::shared_key(DEVELOPMENT_ACCOUNT, DEVELOPMENT_KEY)?,
            });
        }

        let protocol = get("defaultendpointsprotocol").unwrap_or("https");
        if protocol != "http" && protocol != "https" {
            return Err(Error::config(
                "DefaultEndpointsProtocol must be http or https",
            ));
        }
        let name = get("accountname").map(str::to_string);
        let suffix = get("endpointsuffix").unwrap_or(DEFAULT_SUFFIX);

        let (primary, derived_secondary) = match (get("tableendpoint"), name.as_deref()) {
            (Some(endpoint), _) => (parse_endpoint(endpoint)?, None),
            (None, Some(account)) => (
                parse_endpoint(&format!("{protocol}://{account}.table.{suffix}"))?,
                Some(parse_endpoint(&format!(
                    "{protocol}://{account}-secondary.table.{suffix}"
                ))?),
            ),
            (None, None) => {
                return Err(Error::config(
                    "connection string must name an AccountName or a TableEndpoint",
                ));
            }
        };
        let secondary = match get("tablesecondaryendpoint") {
            Some(endpoint) => Some(parse_endpoint(endpoint)?),
            None => derived_secondary,
        };

        let credential = match (get("accountkey"), get("sharedaccesssignature")) {
            (Some(key), _) => {
                let account = name.as_deref().ok_or_else(|| {
                    Error::config("AccountKey requires AccountName in the connection string")
                })?;
                Credential::shared_key(account, key)?
            }
            (None, Some(token)) => Credential::sas(token),
            (None, None) => Credential::Anonymous,
        };

        Ok(Self {
            name,
            primary,
            secondary,
            credential,
        })
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn primary_endpoint(&self) -> &Url {
        &self.primary
    }

    pub fn secondary_endpoint(&self) -> Option<&Url> {
        self.secondary.as_ref()
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }
}

fn parse_settings(descriptor: &str) -> Result<HashMap<String, String>, Error> {
    let mut settings = HashMap::new();
    for segment in descriptor.split(';') {
        let segment = segment.trim();
        if segment.is_empty() {
            continue;
        }
        let (key, value) = segment
            .split_once('=')
            .ok_or_else(|| Error::config("invalid connection string: expected key=value pairs"))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(Error::config("invalid connection string: empty setting name"));
        }
        settings.insert(key.to_ascii_lowercase(), value.trim().to_string());
    }
    if settings.is_empty() {
        return Err(Error::config("connection string is empty"));
    }
    Ok(settings)
}

fn parse_endpoint(raw: &str) -> Result<Url, Error> {
    let mut url = Url::parse(raw)
        .map_err(|err| Error::config("invalid table endpoint url").with_source(err))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(Error::config("table endpoint must use http or https"));
    }
    if url.cannot_be_a_base() {
        return Err(Error::config("table endpoint cannot be a base url"));
    }
    let trimmed = url.path().trim_end_matches('/').to_string();
    url.set_path(&trimmed);
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}
