//! Purpose: Kind-tagged column values and their OData JSON wire codec.
//! Exports: `ColumnValue`, `ColumnKind`.
//! Role: The single place where scalar kinds are mapped to and from the wire.
//! Invariants: A value's kind is fixed at construction and travels as an `@odata.type` tag.
//! Invariants: Decoding never defaults to Null; unknown tags and mismatched payloads are Decode errors.
use std::fmt;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use serde_json::{Number, Value};
use time::OffsetDateTime;
use time::UtcOffset;
use time::format_description::well_known::Rfc3339;
use uuid::Uuid;

use crate::core::error::{Error, ErrorKind};

const NANOS_PER_TICK: u32 = 100;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ColumnKind {
    Binary,
    Boolean,
    DateTime,
    Double,
    Int32,
    Int64,
    String,
    Guid,
    Null,
}

impl ColumnKind {
    pub fn edm_name(self) -> Option<&'static str> {
        match self {
            ColumnKind::Binary => Some("Edm.Binary"),
            ColumnKind::Boolean => Some("Edm.Boolean"),
            ColumnKind::DateTime => Some("Edm.DateTime"),
            ColumnKind::Double => Some("Edm.Double"),
            ColumnKind::Int32 => Some("Edm.Int32"),
            ColumnKind::Int64 => Some("Edm.Int64"),
            ColumnKind::String => Some("Edm.String"),
            ColumnKind::Guid => Some("Edm.Guid"),
            ColumnKind::Null => None,
        }
    }

    pub fn from_edm_name(name: &str) -> Option<Self> {
        match name {
            "Edm.Binary" => Some(ColumnKind::Binary),
            "Edm.Boolean" => Some(ColumnKind::Boolean),
            "Edm.DateTime" => Some(ColumnKind::DateTime),
            "Edm.Double" => Some(ColumnKind::Double),
            "Edm.Int32" => Some(ColumnKind::Int32),
            "Edm.Int64" => Some(ColumnKind::Int64),
            "Edm.String" => Some(ColumnKind::String),
            "Edm.Guid" => Some(ColumnKind::Guid),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ColumnValue {
    Binary(Vec<u8>),
    Boolean(bool),
    DateTime(OffsetDateTime),
    Double(f64),
    Int32(i32),
    Int64(i64),
    String(String),
    Guid(Uuid),
    Null,
}

impl ColumnValue {
    pub fn kind(&self) -> ColumnKind {
        match self {
            ColumnValue::Binary(_) => ColumnKind::Binary,
            ColumnValue::Boolean(_) => ColumnKind::Boolean,
            ColumnValue::DateTime(_) => ColumnKind::DateTime,
            ColumnValue::Double(_) => ColumnKind::Double,
            ColumnValue::Int32(_) => ColumnKind::Int32,
            ColumnValue::Int64(_) => ColumnKind::Int64,
            ColumnValue::String(_) => ColumnKind::String,
            ColumnValue::Guid(_) => ColumnKind::Guid,
            ColumnValue::Null => ColumnKind::Null,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ColumnValue::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ColumnValue::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ColumnValue::Int32(value) => Some(i64::from(*value)),
            ColumnValue::Int64(value) => Some(*value),
            _ => None,
        }
    }

    /// Encodes the value as a JSON payload plus the `@odata.type` tag to send with it.
    /// Int32, Boolean, String and Null are JSON-inferable and travel untagged.
    pub fn to_json(&self) -> Result<(Value, Option<&'static str>), Error> {
        let tag = self.kind().edm_name();
        let encoded = match self {
            ColumnValue::Binary(bytes) => (Value::String(BASE64.encode(bytes)), tag),
            ColumnValue::Boolean(value) => (Value::Bool(*value), None),
            ColumnValue::DateTime(value) => (Value::String(format_datetime(*value)?), tag),
            ColumnValue::Double(value) => match Number::from_f64(*value) {
                Some(number) => (Value::Number(number), tag),
                None => (Value::String(non_finite_name(*value).to_string()), tag),
            },
            ColumnValue::Int32(value) => (Value::Number((*value).into()), None),
            ColumnValue::Int64(value) => (Value::String(value.to_string()), tag),
            ColumnValue::String(value) => (Value::String(value.clone()), None),
            ColumnValue::Guid(value) => (Value::String(value.hyphenated().to_string()), tag),
            ColumnValue::Null => (Value::Null, None),
        };
        Ok(encoded)
    }

    /// Decodes one wire column. `tag` is the sibling `@odata.type` annotation, if any.
    pub fn from_json(tag: Option<&str>, raw: &Value) -> Result<Self, Error> {
        let Some(tag) = tag else {
            return infer_untagged(raw);
        };
        let kind = ColumnKind::from_edm_name(tag).ok_or_else(|| {
            Error::new(ErrorKind::Decode).with_message(format!("unsupported column kind tag '{tag}'"))
        })?;
        if raw.is_null() {
            return Ok(ColumnValue::Null);
        }
        let decoded = match (kind, raw) {
            (ColumnKind::Binary, Value::String(text)) => BASE64
                .decode(text)
                .map(ColumnValue::Binary)
                .map_err(|err| mismatch(tag).with_source(err))?,
            (ColumnKind::Boolean, Value::Bool(value)) => ColumnValue::Boolean(*value),
            (ColumnKind::DateTime, Value::String(text)) => parse_datetime(text)
                .map(ColumnValue::DateTime)
                .map_err(|err| mismatch(tag).with_source(err))?,
            (ColumnKind::Double, Value::Number(number)) => {
                ColumnValue::Double(number.as_f64().ok_or_else(|| mismatch(tag))?)
            }
            (ColumnKind::Double, Value::String(text)) => {
                ColumnValue::Double(parse_double(text).ok_or_else(|| mismatch(tag))?)
            }
            (ColumnKind::Int32, Value::Number(number)) => {
                let value = number.as_i64().ok_or_else(|| mismatch(tag))?;
                ColumnValue::Int32(i32::try_from(value).map_err(|err| mismatch(tag).with_source(err))?)
            }
            (ColumnKind::Int32, Value::String(text)) => ColumnValue::Int32(
                text.parse()
                    .map_err(|err| mismatch(tag).with_source(err))?,
            ),
            (ColumnKind::Int64, Value::String(text)) => ColumnValue::Int64(
                text.parse()
                    .map_err(|err| mismatch(tag).with_source(err))?,
            ),
            (ColumnKind::Int64, Value::Number(number)) => {
                ColumnValue::Int64(number.as_i64().ok_or_else(|| mismatch(tag))?)
            }
            (ColumnKind::String, Value::String(text)) => ColumnValue::String(text.clone()),
            (ColumnKind::Guid, Value::String(text)) => Uuid::parse_str(text)
                .map(ColumnValue::Guid)
                .map_err(|err| mismatch(tag).with_source(err))?,
            _ => return Err(mismatch(tag)),
        };
        Ok(decoded)
    }

    /// Renders the value as a literal of the store's filter grammar.
    pub fn filter_literal(&self) -> Result<String, Error> {
        let literal = match self {
            ColumnValue::Binary(bytes) => format!("X'{}'", hex_lower(bytes)),
            ColumnValue::Boolean(value) => value.to_string(),
            ColumnValue::DateTime(value) => format!("datetime'{}'", format_datetime(*value)?),
            ColumnValue::Double(value) => {
                if !value.is_finite() {
                    return Err(Error::config(format!(
                        "non-finite double {value} cannot be used in a filter"
                    )));
                }
                format!("{value:?}")
            }
            ColumnValue::Int32(value) => value.to_string(),
            ColumnValue::Int64(value) => format!("{value}L"),
            ColumnValue::String(value) => quote(value),
            ColumnValue::Guid(value) => format!("guid'{}'", value.hyphenated()),
            ColumnValue::Null => {
                return Err(Error::config("null values cannot be used in a filter"));
            }
        };
        Ok(literal)
    }
}

impl fmt::Display for ColumnValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnValue::Binary(bytes) => write!(f, "{}", BASE64.encode(bytes)),
            ColumnValue::Boolean(value) => write!(f, "{value}"),
            ColumnValue::DateTime(value) => match value.format(&Rfc3339) {
                Ok(text) => write!(f, "{text}"),
                Err(_) => write!(f, "{value}"),
            },
            ColumnValue::Double(value) => write!(f, "{value}"),
            ColumnValue::Int32(value) => write!(f, "{value}"),
            ColumnValue::Int64(value) => write!(f, "{value}"),
            ColumnValue::String(value) => write!(f, "{value}"),
            ColumnValue::Guid(value) => write!(f, "{value}"),
            ColumnValue::Null => write!(f, "null"),
        }
    }
}

impl From<Vec<u8>> for ColumnValue {
    fn from(value: Vec<u8>) -> Self {
        ColumnValue::Binary(value)
    }
}

impl From<&[u8]> for ColumnValue {
    fn from(value: &[u8]) -> Self {
        ColumnValue::Binary(value.to_vec())
    }
}

impl From<bool> for ColumnValue {
    fn from(value: bool) -> Self {
        ColumnValue::Boolean(value)
    }
}

impl From<OffsetDateTime> for ColumnValue {
    fn from(value: OffsetDateTime) -> Self {
        ColumnValue::DateTime(value)
    }
}

impl From<f64> for ColumnValue {
    fn from(value: f64) -> Self {
        ColumnValue::Double(value)
    }
}

impl From<i32> for ColumnValue {
    fn from(value: i32) -> Self {
        ColumnValue::Int32(value)
    }
}

impl From<i64> for ColumnValue {
    fn from(value: i64) -> Self {
        ColumnValue::Int64(value)
    }
}

impl From<String> for ColumnValue {
    fn from(value: String) -> Self {
        ColumnValue::String(value)
    }
}

impl From<&str> for ColumnValue {
    fn from(value: &str) -> Self {
        ColumnValue::String(value.to_string())
    }
}

impl From<Uuid> for ColumnValue {
    fn from(value: Uuid) -> Self {
        ColumnValue::Guid(value)
    }
}

/// RFC 3339 in UTC, truncated to the store's 100 ns tick.
pub(crate) fn format_datetime(value: OffsetDateTime) -> Result<String, Error> {
    let utc = value.to_offset(UtcOffset::UTC);
    let nanos = utc.nanosecond();
    utc.replace_nanosecond(nanos - nanos % NANOS_PER_TICK)
        .map_err(|err| Error::config("datetime value is out of range").with_source(err))?
        .format(&Rfc3339)
        .map_err(|err| {
            Error::config("datetime value cannot be rendered as RFC 3339").with_source(err)
        })
}

pub(crate) fn parse_datetime(text: &str) -> Result<OffsetDateTime, time::error::Parse> {
    OffsetDateTime::parse(text, &Rfc3339)
}

/// Single-quoted string literal with embedded quotes doubled.
pub(crate) fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn infer_untagged(raw: &Value) -> Result<ColumnValue, Error> {
    match raw {
        Value::Null => Ok(ColumnValue::Null),
        Value::Bool(value) => Ok(ColumnValue::Boolean(*value)),
        Value::String(text) => Ok(ColumnValue::String(text.clone())),
        Value::Number(number) => {
            if let Some(value) = number.as_i64() {
                return Ok(match i32::try_from(value) {
                    Ok(small) => ColumnValue::Int32(small),
                    Err(_) => ColumnValue::Int64(value),
                });
            }
            number
                .as_f64()
                .map(ColumnValue::Double)
                .ok_or_else(|| Error::new(ErrorKind::Decode).with_message("unrepresentable number"))
        }
        Value::Array(_) | Value::Object(_) => Err(Error::new(ErrorKind::Decode)
            .with_message("structured json is not a column value")),
    }
}

fn parse_double(text: &str) -> Option<f64> {
    match text {
        "NaN" => Some(f64::NAN),
        "Infinity" | "INF" => Some(f64::INFINITY),
        "-Infinity" | "-INF" => Some(f64::NEG_INFINITY),
        other => other.parse().ok(),
    }
}

fn non_finite_name(value: f64) -> &'static str {
    if value.is_nan() {
        "NaN"
    } else if value.is_sign_positive() {
        "Infinity"
    } else {
        "-Infinity"
    }
}

fn mismatch(tag: &str) -> Error {
    Error::new(ErrorKind::Decode).with_message(format!("column payload does not match kind {tag}"))
}

fn hex_lower(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, byte| {
        let _ = write!(out, "{byte:02x}");
        out
    })
}

#[cfg(test)]
mod tests {
    use super::{ColumnKind, ColumnValue};
    use crate::core::error::ErrorKind;
    use serde_json::{Value, json};
    use time::macros::datetime;
    use uuid::Uuid;

    #[test]
    fn int64_travels_as_tagged_string() {
        let (payload, tag) = ColumnValue::Int64(9_007_199_254_740_993).to_json().expect("encode");
        assert_eq!(payload, json!("9007199254740993"));
        assert_eq!(tag, Some("Edm.Int64"));
        let decoded = ColumnValue::from_json(tag, &payload).expect("decode");
        assert_eq!(decoded, ColumnValue::Int64(9_007_199_254_740_993));
    }

    #[test]
    fn untagged_numbers_infer_int32_then_double() {
        assert_eq!(
            ColumnValue::from_json(None, &json!(42)).expect("int"),
            ColumnValue::Int32(42)
        );
        assert_eq!(
            ColumnValue::from_json(None, &json!(2.5)).expect("double"),
            ColumnValue::Double(2.5)
        );
        assert_eq!(
            ColumnValue::from_json(None, &Value::Null).expect("null"),
            ColumnValue::Null
        );
    }

    #[test]
    fn tagged_double_accepts_non_finite_names() {
        let decoded = ColumnValue::from_json(Some("Edm.Double"), &json!("-Infinity")).expect("decode");
        assert_eq!(decoded, ColumnValue::Double(f64::NEG_INFINITY));
        let (payload, _) = ColumnValue::Double(f64::INFINITY).to_json().expect("encode");
        assert_eq!(payload, json!("Infinity"));
    }

    #[test]
    fn binary_guid_and_datetime_decode() {
        let binary = ColumnValue::from_json(Some("Edm.Binary"), &json!("AQID")).expect("binary");
        assert_eq!(binary, ColumnValue::Binary(vec![1, 2, 3]));

        let id = "c9da6455-213d-42c9-9a79-3e9149a57833";
        let guid = ColumnValue::from_json(Some("Edm.Guid"), &json!(id)).expect("guid");
        assert_eq!(guid, ColumnValue::Guid(Uuid::parse_str(id).expect("uuid")));

        let stamp = ColumnValue::from_json(Some("Edm.DateTime"), &json!("2024-03-01T10:20:30.1234567Z"))
            .expect("datetime");
        assert_eq!(stamp.kind(), ColumnKind::DateTime);
    }

    #[test]
    fn unknown_tag_is_decode_error() {
        let err = ColumnValue::from_json(Some("Edm.Decimal"), &json!("1.5")).expect_err("err");
        assert_eq!(err.kind(), ErrorKind::Decode);
        assert!(err.message().unwrap_or_default().contains("Edm.Decimal"));
    }

    #[test]
    fn mismatched_payload_is_decode_error() {
        let err = ColumnValue::from_json(Some("Edm.Boolean"), &json!("yes")).expect_err("err");
        assert_eq!(err.kind(), ErrorKind::Decode);
        let err = ColumnValue::from_json(Some("Edm.Int32"), &json!(4_000_000_000i64)).expect_err("err");
        assert_eq!(err.kind(), ErrorKind::Decode);
    }

    #[test]
    fn filter_literals_follow_store_grammar() {
        assert_eq!(ColumnValue::from("O'Brien").filter_literal().expect("s"), "'O''Brien'");
        assert_eq!(ColumnValue::from(true).filter_literal().expect("b"), "true");
        assert_eq!(ColumnValue::from(7i32).filter_literal().expect("i"), "7");
        assert_eq!(ColumnValue::from(7i64).filter_literal().expect("l"), "7L");
        assert_eq!(ColumnValue::from(1.0f64).filter_literal().expect("d"), "1.0");
        assert_eq!(ColumnValue::from(vec![0x0a, 0xff]).filter_literal().expect("x"), "X'0aff'");
        assert_eq!(
            ColumnValue::from(datetime!(2024-01-02 03:04:05 UTC))
                .filter_literal()
                .expect("dt"),
            "datetime'2024-01-02T03:04:05Z'"
        );
    }

    #[test]
    fn datetimes_are_truncated_to_100ns_ticks() {
        let value = ColumnValue::from(datetime!(2024-01-02 05:04:05.123456789 +02:00));
        let (payload, tag) = value.to_json().expect("encode");
        assert_eq!(payload, json!("2024-01-02T03:04:05.1234567Z"));
        assert_eq!(tag, Some("Edm.DateTime"));
        assert_eq!(
            value.filter_literal().expect("dt"),
            "datetime'2024-01-02T03:04:05.1234567Z'"
        );
    }

    #[test]
    fn null_and_nan_are_not_filterable() {
        let err = ColumnValue::Null.filter_literal().expect_err("err");
        assert_eq!(err.kind(), ErrorKind::Config);
        let err = ColumnValue::Double(f64::NAN).filter_literal().expect_err("err");
        assert_eq!(err.kind(), ErrorKind::Config);
    }
}
