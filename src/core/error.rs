// Error model shared by the client, the query layer, and the emulator.
use std::error::Error as StdError;
use std::fmt;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// Bad descriptor, table name, limit, projection, key, or filter. Raised before any I/O.
    Config,
    /// `insert_if_not_exists` hit an existing (partition key, row key).
    Duplicate,
    /// Transport or service failure, including failed conditional updates.
    Storage,
    /// A stored column carried a kind tag or payload this crate cannot decode.
    Decode,
    Internal,
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    status: Option<u16>,
    code: Option<String>,
    key: Option<(String, String)>,
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            status: None,
            code: None,
            key: None,
            source: None,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config).with_message(message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// HTTP status returned by the store, when the failure came from a response.
    pub fn status(&self) -> Option<u16> {
        self.status
    }

    /// Store error code such as `EntityAlreadyExists` or `UpdateConditionNotSatisfied`.
    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    pub fn key(&self) -> Option<(&str, &str)> {
        self.key
            .as_ref()
            .map(|(partition_key, row_key)| (partition_key.as_str(), row_key.as_str()))
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_key(mut self, partition_key: impl Into<String>, row_key: impl Into<String>) -> Self {
        self.key = Some((partition_key.into(), row_key.into()));
        self
    }

    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub(crate) fn with_kind(mut self, kind: ErrorKind) -> Self {
        self.kind = kind;
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        if let Some((partition_key, row_key)) = &self.key {
            write!(f, " (partition key: '{partition_key}', row key: '{row_key}')")?;
        }
        if let Some(status) = self.status {
            write!(f, " (status: {status})")?;
        }
        if let Some(code) = &self.code {
            write!(f, " (code: {code})")?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|source| source.as_ref() as &(dyn StdError + 'static))
    }
}
