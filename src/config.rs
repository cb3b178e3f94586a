//! Purpose: Resolve host settings for the table-backed property source.
//! Exports: `TableSourceSettings`, `connection_secret_name`, `open_property_store`.
//! Role: Thin adapter between a host's key/value settings and `PropertyStore`.
//! Invariants: Settings are read once through a caller-supplied lookup; nothing is global.
//! Invariants: When the source is enabled, both the account and the table must be named.
#![allow(clippy::result_large_err)]

use tracing::info;

use crate::api::{ApiResult, Connection, ConnectionOptions, Error, PropertyStore};

/// Name under which a host registers this property layer.
pub const TABLE_SOURCE_NAME: &str = "azuretable";

pub const ENABLED_KEY: &str = "azure.table.enabled";
pub const ACCOUNT_NAME_KEY: &str = "azure.table.storage-account-name";
pub const TABLE_NAME_KEY: &str = "azure.table.table-name";

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TableSourceSettings {
    pub enabled: bool,
    pub storage_account_name: Option<String>,
    pub table_name: Option<String>,
}

impl TableSourceSettings {
    pub fn from_lookup<F>(lookup: F) -> ApiResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let enabled = match read(ENABLED_KEY) {
            None => true,
            Some(raw) => parse_flag(&raw).ok_or_else(|| {
                Error::config(format!("{ENABLED_KEY} must be true or false, got '{raw}'"))
            })?,
        };
        let settings = Self {
            enabled,
            storage_account_name: read(ACCOUNT_NAME_KEY),
            table_name: read(TABLE_NAME_KEY),
        };
        if settings.enabled {
            if settings.storage_account_name.is_none() {
                return Err(Error::config(format!("{ACCOUNT_NAME_KEY} is required")));
            }
            if settings.table_name.is_none() {
                return Err(Error::config(format!("{TABLE_NAME_KEY} is required")));
            }
        }
        Ok(settings)
    }

    /// Secret holding the connection string for the configured account.
    pub fn secret_name(&self) -> Option<String> {
        self.storage_account_name
            .as_deref()
            .map(connection_secret_name)
    }
}

/// `<resource>-connection-string`, the secret a host resolves to a descriptor.
pub fn connection_secret_name(resource: &str) -> String {
    format!("{resource}-connection-string")
}

/// Builds the property store, or `None` when the source is disabled.
pub fn open_property_store(
    settings: &TableSourceSettings,
    connection_string: &str,
    options: ConnectionOptions,
) -> ApiResult<Option<PropertyStore>> {
    if !settings.enabled {
        return Ok(None);
    }
    let table = settings
        .table_name
        .as_deref()
        .ok_or_else(|| Error::config(format!("{TABLE_NAME_KEY} is required")))?;
    let connection = Connection::with_options(connection_string, table, options)?;
    info!(
        source = TABLE_SOURCE_NAME,
        table,
        account = settings.storage_account_name.as_deref(),
        "opened table property source"
    );
    Ok(Some(PropertyStore::new(connection)))
}

fn parse_flag(raw: &str) -> Option<bool> {
    if raw.eq_ignore_ascii_case("true") {
        Some(true)
    } else if raw.eq_ignore_ascii_case("false") {
        Some(false)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::{ENABLED_KEY, TableSourceSettings, connection_secret_name, open_property_store};
    use crate::api::{ConnectionOptions, ErrorKind};
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn enabled_by_default_and_requires_names() {
        let err = TableSourceSettings::from_lookup(lookup(&[])).expect_err("err");
        assert_eq!(err.kind(), ErrorKind::Config);

        let err = TableSourceSettings::from_lookup(lookup(&[(
            "azure.table.storage-account-name",
            "acct",
        )]))
        .expect_err("err");
        assert!(err.to_string().contains("azure.table.table-name"));

        let settings = TableSourceSettings::from_lookup(lookup(&[
            ("azure.table.storage-account-name", "acct"),
            ("azure.table.table-name", "properties"),
        ]))
        .expect("settings");
        assert!(settings.enabled);
        assert_eq!(settings.secret_name().as_deref(), Some("acct-connection-string"));
    }

    #[test]
    fn disabled_source_needs_nothing_and_opens_nothing() {
        let settings =
            TableSourceSettings::from_lookup(lookup(&[("azure.table.enabled", "FALSE")])).expect("settings");
        assert!(!settings.enabled);
        let store = open_property_store(&settings, "garbage", ConnectionOptions::default())
            .expect("disabled");
        assert!(store.is_none());
    }

    #[test]
    fn bad_flag_is_config_error() {
        let err = TableSourceSettings::from_lookup(lookup(&[("azure.table.enabled", "yes")]))
            .expect_err("err");
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn keys_live_under_the_azure_table_prefix() {
        let err = TableSourceSettings::from_lookup(lookup(&[
            ("table.storage-account-name", "acct"),
            ("table.table-name", "properties"),
        ]))
        .expect_err("unprefixed keys are ignored");
        assert_eq!(err.kind(), ErrorKind::Config);
        assert_eq!(ENABLED_KEY, "azure.table.enabled");
    }

    #[test]
    fn secret_name_pattern() {
        assert_eq!(connection_secret_name("mystorage"), "mystorage-connection-string");
    }
}
