// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use std::fmt;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Exception>;

/// The value carried by every rejected completion and every usage error.
///
/// Streams never inspect a reason, they only store it and hand it back, so
/// any caller-supplied reason is accepted through [`Exception::Message`].
#[derive(Error, Debug, Clone, PartialEq, Default)]
pub enum Exception {
    /// No reason was supplied.
    #[default]
    #[error("undefined")]
    Undefined,
    #[error("TypeError: {0}")]
    Type(String),
    #[error("RangeError: {0}")]
    Range(String),
    #[error("{0}")]
    Dom(DOMException),
    #[error("{0}")]
    Message(String),
    /// Composite reason, e.g. the `[reason1, reason2]` handed to a teed source.
    #[error("[{}]", .0.iter().map(ToString::to_string).collect::<Vec<_>>().join(", "))]
    List(Vec<Exception>),
}

impl Exception {
    pub fn throw_type(message: impl Into<String>) -> Self {
        Self::Type(message.into())
    }

    pub fn throw_range(message: impl Into<String>) -> Self {
        Self::Range(message.into())
    }

    pub fn message(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }

    pub fn is_type_error(&self) -> bool {
        matches!(self, Self::Type(_))
    }

    pub fn is_range_error(&self) -> bool {
        matches!(self, Self::Range(_))
    }

    pub fn dom_name(&self) -> Option<&str> {
        match self {
            Self::Dom(ex) => Some(ex.name()),
            _ => None,
        }
    }
}

impl From<DOMException> for Exception {
    fn from(value: DOMException) -> Self {
        Self::Dom(value)
    }
}

impl From<Option<Exception>> for Exception {
    fn from(value: Option<Exception>) -> Self {
        value.unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DOMExceptionName {
    AbortError,
    TimeoutError,
    InvalidStateError,
    DataCloneError,
}

impl DOMExceptionName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AbortError => "AbortError",
            Self::TimeoutError => "TimeoutError",
            Self::InvalidStateError => "InvalidStateError",
            Self::DataCloneError => "DataCloneError",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DOMException {
    message: String,
    name: String,
}

impl DOMException {
    pub fn new(message: Option<String>, name: Option<String>) -> Self {
        let message = message.unwrap_or_default();
        let name = name.unwrap_or(String::from("Error"));

        Self { message, name }
    }

    pub fn with_name(name: DOMExceptionName, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            name: name.as_str().into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for DOMException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            return f.write_str(&self.name);
        }
        write!(f, "{}: {}", self.name, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dom_exception_to_string() {
        let ex = DOMException::with_name(DOMExceptionName::AbortError, "This operation was aborted");
        assert_eq!(ex.to_string(), "AbortError: This operation was aborted");

        let ex = DOMException::new(None, None);
        assert_eq!(ex.to_string(), "Error");
    }

    #[test]
    fn composite_reason_display() {
        let ex = Exception::List(vec![
            Exception::message("r1"),
            Exception::throw_type("r2"),
        ]);
        assert_eq!(ex.to_string(), "[r1, TypeError: r2]");
    }

    #[test]
    fn missing_reason_is_undefined() {
        assert_eq!(Exception::from(None), Exception::Undefined);
        assert_eq!(
            Exception::from(Some(Exception::message("x"))).to_string(),
            "x"
        );
    }
}
