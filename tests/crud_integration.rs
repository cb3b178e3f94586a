//! Purpose: End-to-end tests for single-row CRUD and table DDL against the loopback emulator.
//! Exports: None (integration test module).
//! Role: Validate write semantics, absence handling, and concurrency tokens over HTTP.
//! Invariants: Each test starts its own emulator; nothing is shared between tests.
//! Invariants: Retry delays are shortened so failures surface quickly.

use std::time::Duration;

use tablekit::api::{
    ColumnKind, ColumnValue, Connection, ConnectionOptions, ErrorKind, RetryPolicy, Row,
};
use tablekit::emulator::Emulator;
use time::macros::datetime;
use uuid::Uuid;

type TestResult<T> = Result<T, Box<dyn std::error::Error>>;

fn fast_options() -> ConnectionOptions {
    ConnectionOptions::new()
        .with_retry(RetryPolicy::exponential(
            2,
            Duration::from_millis(1),
            Duration::from_millis(5),
        ))
        .with_request_timeout(Duration::from_secs(5))
}

fn open_table(emulator: &Emulator, table: &str) -> TestResult<Connection> {
    let connection = Connection::with_options(&emulator.connection_string(), table, fast_options())?;
    connection.ddl().create_table_if_not_exists()?;
    Ok(connection)
}

#[test]
fn replace_overwrites_and_merge_combines() -> TestResult<()> {
    let emulator = Emulator::start()?;
    let connection = open_table(&emulator, "people")?;
    let crud = connection.crud();

    let original = Row::new("users", "john")
        .with_column("Name", "John")
        .with_column("Age", 32);
    crud.insert_or_replace(&original)?;

    crud.insert_or_merge(&Row::new("users", "john").with_column("City", "Paris"))?;
    let merged = crud.find_by_id("users", "john")?.expect("row after merge");
    assert_eq!(merged.column("Name"), Some(&ColumnValue::from("John")));
    assert_eq!(merged.column("City"), Some(&ColumnValue::from("Paris")));

    crud.insert_or_replace(&Row::new("users", "john").with_column("Age", 33))?;
    let replaced = crud.find_by_id("users", "john")?.expect("row after replace");
    assert_eq!(replaced.columns().len(), 1);
    assert_eq!(replaced.column("Age"), Some(&ColumnValue::Int32(33)));
    assert!(replaced.timestamp().is_some());
    assert!(replaced.etag().is_some());
    Ok(())
}

#[test]
fn merge_overwrites_present_columns_and_keeps_the_rest() -> TestResult<()> {
    let emulator = Emulator::start()?;
    let connection = open_table(&emulator, "people")?;
    let crud = connection.crud();

    crud.insert_or_replace(
        &Row::new("users", "john")
            .with_column("Name", "John")
            .with_column("Age", 31)
            .with_column("Country", "France"),
    )?;
    crud.insert_or_merge(
        &Row::new("users", "john")
            .with_column("Age", 32)
            .with_column("Country", "United States")
            .with_column("Job", "Developer"),
    )?;

    let merged = crud.find_by_id("users", "john")?.expect("row after merge");
    assert_eq!(merged.columns().len(), 4);
    assert_eq!(merged.column("Name"), Some(&ColumnValue::from("John")));
    assert_eq!(merged.column("Age"), Some(&ColumnValue::Int32(32)));
    assert_eq!(
        merged.column("Country"),
        Some(&ColumnValue::from("United States"))
    );
    assert_eq!(merged.column("Job"), Some(&ColumnValue::from("Developer")));
    Ok(())
}

#[test]
fn every_column_kind_survives_the_wire() -> TestResult<()> {
    let emulator = Emulator::start()?;
    let connection = open_table(&emulator, "kinds")?;
    let crud = connection.crud();
    let id = Uuid::from_u128(0x1234_5678_9abc_def0_1234_5678_9abc_def0);

    let row = Row::new("p", "r")
        .with_column("Blob", vec![0_u8, 1, 254, 255])
        .with_column("Flag", true)
        .with_column("When", datetime!(2021-06-01 08:30:00 UTC))
        .with_column("Ratio", 0.25)
        .with_column("NotANumber", f64::NAN)
        .with_column("Small", 7)
        .with_column("Large", 9_007_199_254_740_993_i64)
        .with_column("Text", "héllo 'quoted'")
        .with_column("Id", id)
        .with_column("Gone", ColumnValue::Null);
    crud.insert_or_replace(&row)?;

    let stored = crud.find_by_id("p", "r")?.expect("stored row");
    let kind = |name: &str| stored.column(name).map(ColumnValue::kind);
    assert_eq!(kind("Blob"), Some(ColumnKind::Binary));
    assert_eq!(kind("Flag"), Some(ColumnKind::Boolean));
    assert_eq!(kind("When"), Some(ColumnKind::DateTime));
    assert_eq!(kind("Ratio"), Some(ColumnKind::Double));
    assert_eq!(kind("Small"), Some(ColumnKind::Int32));
    assert_eq!(kind("Large"), Some(ColumnKind::Int64));
    assert_eq!(kind("Text"), Some(ColumnKind::String));
    assert_eq!(kind("Id"), Some(ColumnKind::Guid));
    assert_eq!(stored.column("Large"), Some(&ColumnValue::Int64(9_007_199_254_740_993)));
    assert_eq!(stored.column("Blob"), Some(&ColumnValue::Binary(vec![0, 1, 254, 255])));
    assert!(matches!(stored.column("NotANumber"), Some(ColumnValue::Double(value)) if value.is_nan()));
    assert_eq!(stored.column("Gone"), None);
    Ok(())
}

#[test]
fn insert_if_not_exists_reports_duplicates_and_keeps_original() -> TestResult<()> {
    let emulator = Emulator::start()?;
    let connection = open_table(&emulator, "people")?;
    let crud = connection.crud();

    crud.insert_if_not_exists(&Row::new("users", "john").with_column("Age", 32))?;
    let err = crud
        .insert_if_not_exists(&Row::new("users", "john").with_column("Age", 99))
        .expect_err("duplicate insert");
    assert_eq!(err.kind(), ErrorKind::Duplicate);
    assert_eq!(err.key(), Some(("users", "john")));
    assert!(err.to_string().contains("users"));

    let stored = crud.find_by_id("users", "john")?.expect("row");
    assert_eq!(stored.column("Age"), Some(&ColumnValue::Int32(32)));
    Ok(())
}

#[test]
fn atomic_update_detects_concurrent_writers() -> TestResult<()> {
    let emulator = Emulator::start()?;
    let connection = open_table(&emulator, "people")?;
    let crud = connection.crud();
    crud.insert_or_replace(&Row::new("users", "john").with_column("Age", 32))?;

    let first_reader = crud.find_by_id("users", "john")?.expect("row");
    let second_reader = crud.find_by_id("users", "john")?.expect("row");

    let mut update = first_reader.clone();
    update.set_column("Age", 33);
    crud.atomic_update(&update)?;

    let mut stale = second_reader;
    stale.set_column("Age", 40);
    let err = crud.atomic_update(&stale).expect_err("stale etag");
    assert_eq!(err.kind(), ErrorKind::Storage);
    assert_eq!(err.status(), Some(412));
    assert_eq!(err.code(), Some("UpdateConditionNotSatisfied"));
    assert_eq!(err.key(), Some(("users", "john")));

    let stored = crud.find_by_id("users", "john")?.expect("row");
    assert_eq!(stored.column("Age"), Some(&ColumnValue::Int32(33)));
    Ok(())
}

#[test]
fn absence_is_none_and_delete_by_id_is_idempotent() -> TestResult<()> {
    let emulator = Emulator::start()?;
    let connection = open_table(&emulator, "people")?;
    let crud = connection.crud();

    assert!(crud.find_by_id("users", "nobody")?.is_none());
    crud.delete_by_id("users", "nobody")?;

    crud.insert_or_replace(&Row::new("users", "john"))?;
    crud.delete_by_id("users", "john")?;
    assert!(crud.find_by_id("users", "john")?.is_none());
    crud.delete_by_id("users", "john")?;
    assert_eq!(emulator.row_count("people"), 0);
    Ok(())
}

#[test]
fn delete_honours_the_row_etag() -> TestResult<()> {
    let emulator = Emulator::start()?;
    let connection = open_table(&emulator, "people")?;
    let crud = connection.crud();
    crud.insert_or_replace(&Row::new("users", "john").with_column("Age", 1))?;
    let stale = crud.find_by_id("users", "john")?.expect("row");
    crud.insert_or_merge(&Row::new("users", "john").with_column("Age", 2))?;

    let err = crud.delete(&stale).expect_err("stale delete");
    assert_eq!(err.status(), Some(412));

    let fresh = crud.find_by_id("users", "john")?.expect("row");
    crud.delete(&fresh)?;
    crud.insert_or_replace(&Row::new("users", "jane"))?;
    crud.delete(&Row::new("users", "jane"))?;
    assert_eq!(emulator.row_count("people"), 0);
    Ok(())
}

#[test]
fn find_all_walks_past_the_default_page_size() -> TestResult<()> {
    let emulator = Emulator::start()?;
    let connection = open_table(&emulator, "bulk")?;
    let crud = connection.crud();
    for idx in 0..1005 {
        let row = Row::new(format!("p{}", idx % 3), format!("{idx:05}")).with_column("Idx", idx);
        crud.insert_or_replace(&row)?;
    }

    let rows = crud.find_all()?.collect::<Result<Vec<_>, _>>()?;
    assert_eq!(rows.len(), 1005);
    let mut keys: Vec<_> = rows
        .iter()
        .map(|row| (row.partition_key().to_string(), row.row_key().to_string()))
        .collect();
    let scanned = keys.clone();
    keys.sort();
    assert_eq!(keys, scanned);
    Ok(())
}

#[test]
fn ddl_is_idempotent() -> TestResult<()> {
    let emulator = Emulator::start()?;
    let connection = Connection::with_options(&emulator.connection_string(), "audit", fast_options())?;
    let ddl = connection.ddl();

    assert!(ddl.create_table_if_not_exists()?);
    assert!(!ddl.create_table_if_not_exists()?);
    connection.crud().insert_or_replace(&Row::new("p", "r"))?;

    assert!(ddl.drop_table_if_exists()?);
    assert!(!ddl.drop_table_if_exists()?);

    let err = connection
        .crud()
        .insert_or_replace(&Row::new("p", "r"))
        .expect_err("missing table");
    assert_eq!(err.kind(), ErrorKind::Storage);
    assert_eq!(err.status(), Some(404));
    assert_eq!(err.code(), Some("TableNotFound"));
    Ok(())
}

#[test]
fn keys_with_quotes_and_spaces_address_the_right_row() -> TestResult<()> {
    let emulator = Emulator::start()?;
    let connection = open_table(&emulator, "people")?;
    let crud = connection.crud();
    let row = Row::new("o'brien & co", "row (1), 50%").with_column("Ok", true);
    crud.insert_or_replace(&row)?;
    let stored = crud
        .find_by_id("o'brien & co", "row (1), 50%")?
        .expect("row");
    assert_eq!(stored.partition_key(), "o'brien & co");
    assert_eq!(stored.row_key(), "row (1), 50%");
    Ok(())
}
