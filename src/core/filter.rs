// Typed filter predicates rendered into the store's filter-string grammar.
use std::fmt;

use crate::core::error::Error;
use crate::core::row::{PARTITION_KEY, ROW_KEY};
use crate::core::value::{ColumnValue, quote};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Comparator {
    Eq,
    Gt,
    Lt,
    Ge,
    Le,
}

impl Comparator {
    pub fn as_str(self) -> &'static str {
        match self {
            Comparator::Eq => "eq",
            Comparator::Gt => "gt",
            Comparator::Lt => "lt",
            Comparator::Ge => "ge",
            Comparator::Le => "le",
        }
    }
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One `field comparator literal` predicate. The field is capitalized on construction
/// because stored column names always start upper-case.
#[derive(Clone, Debug, PartialEq)]
pub struct Filter {
    field: String,
    comparator: Comparator,
    value: ColumnValue,
}

impl Filter {
    pub fn new(field: &str, comparator: Comparator, value: impl Into<ColumnValue>) -> Self {
        Self {
            field: capitalize(field),
            comparator,
            value: value.into(),
        }
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn comparator(&self) -> Comparator {
        self.comparator
    }

    pub fn value(&self) -> &ColumnValue {
        &self.value
    }

    pub fn render(&self) -> Result<String, Error> {
        Ok(format!(
            "{} {} {}",
            self.field,
            self.comparator,
            self.value.filter_literal()?
        ))
    }
}

pub fn and(left: &str, right: &str) -> String {
    format!("({left}) and ({right})")
}

/// Renders and AND-chains every filter left to right.
pub fn and_all(filters: &[Filter]) -> Result<String, Error> {
    let mut rendered = filters.iter().map(Filter::render);
    let first = rendered
        .next()
        .ok_or_else(|| Error::config("at least one filter is required"))??;
    rendered.try_fold(first, |acc, next| -> Result<String, Error> {
        Ok(and(&acc, &next?))
    })
}

pub(crate) fn partition_filter(partition_key: &str) -> String {
    key_condition(PARTITION_KEY, Comparator::Eq, partition_key)
}

pub(crate) fn row_key_filter(comparator: Comparator, row_key: &str) -> String {
    key_condition(ROW_KEY, comparator, row_key)
}

fn key_condition(field: &str, comparator: Comparator, key: &str) -> String {
    format!("{field} {comparator} {}", quote(key))
}

fn capitalize(field: &str) -> String {
    let mut chars = field.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
