// Parser and evaluator for the table filter grammar accepted by the emulator.
use std::cmp::Ordering;

use uuid::Uuid;

use crate::core::error::{Error, ErrorKind};
use crate::core::row::{PARTITION_KEY, ROW_KEY, Row, TIMESTAMP};
use crate::core::value::{ColumnValue, parse_datetime};

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Expr {
    Compare {
        field: String,
        op: CompareOp,
        literal: ColumnValue,
    },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl CompareOp {
    fn parse(word: &str) -> Option<Self> {
        match word {
            "eq" => Some(CompareOp::Eq),
            "ne" => Some(CompareOp::Ne),
            "gt" => Some(CompareOp::Gt),
            "ge" => Some(CompareOp::Ge),
            "lt" => Some(CompareOp::Lt),
            "le" => Some(CompareOp::Le),
            _ => None,
        }
    }

    fn holds(self, ordering: Ordering) -> bool {
        match self {
            CompareOp::Eq => ordering == Ordering::Equal,
            CompareOp::Ne => ordering != Ordering::Equal,
            CompareOp::Gt => ordering == Ordering::Greater,
            CompareOp::Ge => ordering != Ordering::Less,
            CompareOp::Lt => ordering == Ordering::Less,
            CompareOp::Le => ordering != Ordering::Greater,
        }
    }
}

impl Expr {
    pub(crate) fn parse(input: &str) -> Result<Self, Error> {
        let tokens = tokenize(input)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_or()?;
        if parser.pos != parser.tokens.len() {
            return Err(syntax_error("unexpected trailing tokens"));
        }
        Ok(expr)
    }

    /// Missing fields and kind mismatches evaluate to false, never to an error.
    pub(crate) fn matches(&self, row: &Row) -> bool {
        match self {
            Expr::Compare { field, op, literal } => field_value(row, field)
                .and_then(|value| compare(&value, literal))
                .is_some_and(|ordering| op.holds(ordering)),
            Expr::And(left, right) => left.matches(row) && right.matches(row),
            Expr::Or(left, right) => left.matches(row) || right.matches(row),
            Expr::Not(inner) => !inner.matches(row),
        }
    }
}

fn field_value(row: &Row, field: &str) -> Option<ColumnValue> {
    match field {
        PARTITION_KEY => Some(ColumnValue::String(row.partition_key().to_string())),
        ROW_KEY => Some(ColumnValue::String(row.row_key().to_string())),
        TIMESTAMP => row.timestamp().map(ColumnValue::DateTime),
        _ => row.column(field).filter(|value| !value.is_null()).cloned(),
    }
}

fn compare(left: &ColumnValue, right: &ColumnValue) -> Option<Ordering> {
    use ColumnValue::*;
    match (left, right) {
        (String(a), String(b)) => Some(a.cmp(b)),
        (Boolean(a), Boolean(b)) => Some(a.cmp(b)),
        (DateTime(a), DateTime(b)) => Some(a.cmp(b)),
        (Guid(a), Guid(b)) => Some(a.cmp(b)),
        (Binary(a), Binary(b)) => Some(a.cmp(b)),
        (Double(_), _) | (_, Double(_)) => as_f64(left)?.partial_cmp(&as_f64(right)?),
        _ => Some(left.as_i64()?.cmp(&right.as_i64()?)),
    }
}

fn as_f64(value: &ColumnValue) -> Option<f64> {
    match value {
        ColumnValue::Double(value) => Some(*value),
        ColumnValue::Int32(value) => Some(f64::from(*value)),
        ColumnValue::Int64(value) => Some(*value as f64),
        _ => None,
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Token {
    LParen,
    RParen,
    Word(String),
    Literal(ColumnValue),
}

fn tokenize(input: &str) -> Result<Vec<Token>, Error> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let ch = chars[i];
        if ch.is_whitespace() {
            i += 1;
        } else if ch == '(' {
            tokens.push(Token::LParen);
            i += 1;
        } else if ch == ')' {
            tokens.push(Token::RParen);
            i += 1;
        } else if ch == '\'' {
            let (text, next) = read_quoted(&chars, i)?;
            tokens.push(Token::Literal(ColumnValue::String(text)));
            i = next;
        } else if ch.is_ascii_digit() || ch == '-' {
            let start = i;
            i += 1;
            while i < chars.len()
                && (chars[i].is_ascii_alphanumeric() || matches!(chars[i], '.' | '+' | '-'))
            {
                i += 1;
            }
            let raw: String = chars[start..i].iter().collect();
            tokens.push(Token::Literal(parse_number(&raw)?));
        } else if ch.is_alphabetic() || ch == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || matches!(chars[i], '_' | '.'))
            {
                i += 1;
            }
            let word: String = chars[start..i].iter().collect();
            if i < chars.len() && chars[i] == '\'' {
                let (text, next) = read_quoted(&chars, i)?;
                tokens.push(Token::Literal(typed_literal(&word, &text)?));
                i = next;
            } else {
                tokens.push(Token::Word(word));
            }
        } else {
            return Err(syntax_error(format!("unexpected character {ch:?}")));
        }
    }
    Ok(tokens)
}

/// Reads `'...'` starting at `start`, unescaping `''`. Returns the text and the index after it.
fn read_quoted(chars: &[char], start: usize) -> Result<(String, usize), Error> {
    let mut text = String::new();
    let mut i = start + 1;
    while i < chars.len() {
        if chars[i] == '\'' {
            if chars.get(i + 1) == Some(&'\'') {
                text.push('\'');
                i += 2;
                continue;
            }
            return Ok((text, i + 1));
        }
        text.push(chars[i]);
        i += 1;
    }
    Err(syntax_error("unterminated string literal"))
}

fn parse_number(raw: &str) -> Result<ColumnValue, Error> {
    if let Some(digits) = raw.strip_suffix('L') {
        return digits
            .parse::<i64>()
            .map(ColumnValue::Int64)
            .map_err(|_| syntax_error(format!("invalid Int64 literal '{raw}'")));
    }
    if raw.contains(['.', 'e', 'E']) {
        return raw
            .parse::<f64>()
            .map(ColumnValue::Double)
            .map_err(|_| syntax_error(format!("invalid Double literal '{raw}'")));
    }
    match raw.parse::<i32>() {
        Ok(value) => Ok(ColumnValue::Int32(value)),
        Err(_) => raw
            .parse::<i64>()
            .map(ColumnValue::Int64)
            .map_err(|_| syntax_error(format!("invalid numeric literal '{raw}'"))),
    }
}

fn typed_literal(prefix: &str, text: &str) -> Result<ColumnValue, Error> {
    match prefix {
        "datetime" => parse_datetime(text)
            .map(ColumnValue::DateTime)
            .map_err(|_| syntax_error(format!("invalid datetime literal '{text}'"))),
        "guid" => Uuid::parse_str(text)
            .map(ColumnValue::Guid)
            .map_err(|_| syntax_error(format!("invalid guid literal '{text}'"))),
        "X" | "binary" => decode_hex(text)
            .map(ColumnValue::Binary)
            .ok_or_else(|| syntax_error(format!("invalid binary literal '{text}'"))),
        other => Err(syntax_error(format!("unknown literal prefix '{other}'"))),
    }
}

fn decode_hex(text: &str) -> Option<Vec<u8>> {
    if text.len() % 2 != 0 {
        return None;
    }
    (0..text.len())
        .step_by(2)
        .map(|idx| u8::from_str_radix(text.get(idx..idx + 2)?, 16).ok())
        .collect()
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn parse_or(&mut self) -> Result<Expr, Error> {
        let mut left = self.parse_and()?;
        while self.eat_word("or") {
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, Error> {
        let mut left = self.parse_unary()?;
        while self.eat_word("and") {
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, Error> {
        if self.eat_word("not") {
            return Ok(Expr::Not(Box::new(self.parse_unary()?)));
        }
        if self.peek() == Some(&Token::LParen) {
            self.pos += 1;
            let inner = self.parse_or()?;
            if self.next() != Some(Token::RParen) {
                return Err(syntax_error("expected ')'"));
            }
            return Ok(inner);
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, Error> {
        let field = match self.next() {
            Some(Token::Word(field)) => field,
            _ => return Err(syntax_error("expected a property name")),
        };
        let op = match self.next() {
            Some(Token::Word(word)) => CompareOp::parse(&word)
                .ok_or_else(|| syntax_error(format!("unknown operator '{word}'")))?,
            _ => return Err(syntax_error("expected a comparison operator")),
        };
        let literal = match self.next() {
            Some(Token::Literal(value)) => value,
            Some(Token::Word(word)) if word == "true" => ColumnValue::Boolean(true),
            Some(Token::Word(word)) if word == "false" => ColumnValue::Boolean(false),
            _ => return Err(syntax_error("expected a literal")),
        };
        Ok(Expr::Compare { field, op, literal })
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn eat_word(&mut self, keyword: &str) -> bool {
        match self.peek() {
            Some(Token::Word(word)) if word == keyword => {
                self.pos += 1;
                true
            }
            _ => false,
        }
    }
}

fn syntax_error(message: impl Into<String>) -> Error {
    Error::new(ErrorKind::Config)
        .with_code("InvalidInput")
        .with_message(format!("invalid filter: {}", message.into()))
}
