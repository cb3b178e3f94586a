//! Purpose: End-to-end tests for property reconstruction and the table source settings.
//! Exports: None (integration test module).
//! Role: Validate scalar/list/map shapes and name listing against the loopback emulator.
//! Invariants: Properties live at (normalized name, `propertyValue`).

use std::collections::HashMap;
use std::time::Duration;

use tablekit::api::{
    ColumnValue, Connection, ConnectionOptions, PROPERTY_VALUE_ROW_KEY, PropertySource,
    PropertyStore, PropertyValue, RetryPolicy, Row,
};
use tablekit::config::{TableSourceSettings, open_property_store};
use tablekit::emulator::Emulator;

type TestResult<T> = Result<T, Box<dyn std::error::Error>>;

fn fast_options() -> ConnectionOptions {
    ConnectionOptions::new().with_retry(RetryPolicy::exponential(
        1,
        Duration::from_millis(1),
        Duration::from_millis(2),
    ))
}

fn property_store(emulator: &Emulator) -> TestResult<PropertyStore> {
    let connection =
        Connection::with_options(&emulator.connection_string(), "properties", fast_options())?;
    connection.ddl().create_table_if_not_exists()?;
    Ok(PropertyStore::new(connection))
}

fn put(store: &PropertyStore, row: Row) -> TestResult<()> {
    store.connection().crud().insert_or_replace(&row)?;
    Ok(())
}

#[test]
fn shapes_follow_column_names() -> TestResult<()> {
    let emulator = Emulator::start()?;
    let store = property_store(&emulator)?;
    put(
        &store,
        Row::new("server.port", PROPERTY_VALUE_ROW_KEY).with_column("Value", 8080),
    )?;
    put(
        &store,
        Row::new("cluster.hosts", PROPERTY_VALUE_ROW_KEY)
            .with_column("_2", "gamma")
            .with_column("_0", "alpha")
            .with_column("_1", "beta"),
    )?;
    put(
        &store,
        Row::new("db", PROPERTY_VALUE_ROW_KEY)
            .with_column("host", "localhost")
            .with_column("port", 5432)
            .with_column("_0", "mixed"),
    )?;

    assert_eq!(
        store.get_property("server.port")?,
        Some(PropertyValue::Scalar(ColumnValue::Int32(8080)))
    );
    assert_eq!(
        store.get_property("cluster.hosts")?,
        Some(PropertyValue::List(vec![
            ColumnValue::from("alpha"),
            ColumnValue::from("beta"),
            ColumnValue::from("gamma"),
        ]))
    );
    let Some(PropertyValue::Map(map)) = store.get_property("db")? else {
        panic!("expected a map");
    };
    assert_eq!(map.len(), 3);
    assert_eq!(map.get("port"), Some(&ColumnValue::Int32(5432)));
    Ok(())
}

#[test]
fn absent_and_empty_properties() -> TestResult<()> {
    let emulator = Emulator::start()?;
    let store = property_store(&emulator)?;
    assert_eq!(store.get_property("missing")?, None);

    put(&store, Row::new("empty", PROPERTY_VALUE_ROW_KEY))?;
    assert_eq!(store.get_property("empty")?, Some(PropertyValue::List(Vec::new())));

    put(
        &store,
        Row::new("other-row", "notTheValueRow").with_column("Value", 1),
    )?;
    assert_eq!(store.get_property("other-row")?, None);
    Ok(())
}

#[test]
fn names_are_normalized_before_lookup() -> TestResult<()> {
    let emulator = Emulator::start()?;
    let store = property_store(&emulator)?;
    put(
        &store,
        Row::new("springdatasourceurl", PROPERTY_VALUE_ROW_KEY).with_column("Value", "jdbc:x"),
    )?;
    let value = store.property("spring/datasource#url?")?;
    assert_eq!(
        value.as_ref().and_then(PropertyValue::as_scalar),
        Some(&ColumnValue::from("jdbc:x"))
    );
    Ok(())
}

#[test]
fn property_names_span_every_page() -> TestResult<()> {
    let emulator = Emulator::start()?;
    let store = property_store(&emulator)?;
    for idx in 0..250 {
        put(
            &store,
            Row::new(format!("prop.{idx:03}"), PROPERTY_VALUE_ROW_KEY).with_column("Value", idx),
        )?;
    }
    let names = store.property_names()?;
    assert_eq!(names.len(), 250);
    assert_eq!(names.first().map(String::as_str), Some("prop.000"));
    assert_eq!(names.last().map(String::as_str), Some("prop.249"));
    Ok(())
}

#[test]
fn settings_open_a_working_store() -> TestResult<()> {
    let emulator = Emulator::start()?;
    let host: HashMap<&str, &str> = [
        ("azure.table.storage-account-name", "devstoreaccount1"),
        ("azure.table.table-name", "properties"),
    ]
    .into_iter()
    .collect();
    let settings =
        TableSourceSettings::from_lookup(|key| host.get(key).map(|value| value.to_string()))?;
    assert_eq!(
        settings.secret_name().as_deref(),
        Some("devstoreaccount1-connection-string")
    );

    let store = open_property_store(&settings, &emulator.connection_string(), fast_options())?
        .expect("enabled store");
    store.connection().ddl().create_table_if_not_exists()?;
    put(
        &store,
        Row::new("feature.flag", PROPERTY_VALUE_ROW_KEY).with_column("Value", true),
    )?;
    assert_eq!(
        store.property("feature.flag")?,
        Some(PropertyValue::Scalar(ColumnValue::Boolean(true)))
    );
    Ok(())
}
