//! Error type shared by every storage operation
//!
//! Engine failures of any shape are normalised into [`DbError`] before they
//! leave this crate. The error carries the operation context (store, key,
//! serialized value) because the engine's own errors rarely say which request
//! failed.

use std::fmt;

use thiserror::Error;

use crate::key::Key;

/// Result type for storage operations
pub type Result<T> = std::result::Result<T, DbError>;

/// Coarse classification of a [`DbError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The storage engine is not available in this environment
    NotAvailable,
    /// The database could not be opened or deleted
    Open,
    /// A schema upgrade step failed
    Upgrade,
    /// The transaction as a whole failed, or could not be started
    Transaction,
    /// A single get/put/delete/cursor request failed
    Request,
    /// An operation was attempted before `open`
    NotOpened,
    /// Active transactions did not drain within the configured retries
    Busy,
    /// A value could not be converted to or from its stored form
    Serialization,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotAvailable => "storage not available",
            ErrorKind::Open => "open error",
            ErrorKind::Upgrade => "upgrade error",
            ErrorKind::Transaction => "transaction error",
            ErrorKind::Request => "request error",
            ErrorKind::NotOpened => "database not opened",
            ErrorKind::Busy => "database busy",
            ErrorKind::Serialization => "serialization error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Diagnostic fields attached to an error
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    pub store: Option<String>,
    pub key: Option<String>,
    pub value: Option<String>,
    pub cause: Option<String>,
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(store) = &self.store {
            write!(f, " [store: {}]", store)?;
        }
        if let Some(key) = &self.key {
            write!(f, " [key: {}]", key)?;
        }
        if let Some(value) = &self.value {
            write!(f, " [value: {}]", value)?;
        }
        if let Some(cause) = &self.cause {
            write!(f, ": {}", cause)?;
        }
        Ok(())
    }
}

/// The single error surfaced by the facade and its transactions
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}{context}")]
pub struct DbError {
    kind: ErrorKind,
    message: String,
    context: ErrorContext,
}

impl DbError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: ErrorContext::default(),
        }
    }

    pub fn not_available(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotAvailable, message)
    }

    pub fn open(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Open, message)
    }

    pub fn upgrade(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Upgrade, message)
    }

    pub fn transaction(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transaction, message)
    }

    pub fn request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Request, message)
    }

    pub fn with_store(mut self, store: impl Into<String>) -> Self {
        self.context.store = Some(store.into());
        self
    }

    pub fn with_key(mut self, key: &Key) -> Self {
        self.context.key = Some(key.to_string());
        self
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.context.value = Some(value.into());
        self
    }

    pub fn with_cause(mut self, cause: impl fmt::Display) -> Self {
        self.context.cause = Some(cause.to_string());
        self
    }

    /// Re-tag an engine error with the operation that observed it, keeping
    /// the original message as the cause.
    pub fn wrap(self, kind: ErrorKind, message: impl Into<String>) -> Self {
        let cause = match self.context.cause {
            Some(inner) => format!("{}: {}", self.message, inner),
            None => self.message,
        };
        Self {
            kind,
            message: message.into(),
            context: ErrorContext {
                cause: Some(cause),
                ..self.context
            },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn context(&self) -> &ErrorContext {
        &self.context
    }

    pub fn store(&self) -> Option<&str> {
        self.context.store.as_deref()
    }

    pub fn key(&self) -> Option<&str> {
        self.context.key.as_deref()
    }

    pub fn cause(&self) -> Option<&str> {
        self.context.cause.as_deref()
    }
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        DbError::new(ErrorKind::Serialization, "JSON conversion failed").with_cause(err)
    }
}
