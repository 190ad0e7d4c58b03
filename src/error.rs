use thiserror;

use std;
use std::fmt::{self, Display};
use std::io;

use serde::{de, ser};

pub type Result<T> = std::result::Result<T, Error>;

/// An error returned by a remote peer in an `Error` message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DBusError {
    pub name: String,
    pub message: String,
}

impl DBusError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        DBusError {
            name: name.into(),
            message: message.into(),
        }
    }
}

impl Display for DBusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}: {}", self.name, self.message)
        }
    }
}

/// Coarse classification of [`Error`], for callers that only need to
/// branch on the failure category.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    NotSupported,
    Cancelled,
    Closed,
    IoFailed,
    TimedOut,
    DBus,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Error serializing: {0}")]
    Serializing(String),
    #[error("Error deserializing: {0}")]
    Deserializing(String),
    #[error("Unexpected end of input")]
    EndOfInput,
    #[error("{0}")]
    InvalidArgument(String),
    #[error("Value nested too deeply")]
    NestingExceeded,
    #[error("Signature header `{header}` does not match body signature `{body}`")]
    SignatureBodyMismatch { header: String, body: String },
    #[error("Attempted to modify a locked message")]
    MessageLocked,
    #[error("{0}")]
    NotSupported(String),
    #[error("Operation was cancelled")]
    Cancelled,
    #[error("The connection is closed")]
    Closed,
    #[error("Timeout was reached")]
    TimedOut,
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("{0}")]
    DBus(DBusError),
}

impl Error {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Serializing(_)
            | Error::Deserializing(_)
            | Error::EndOfInput
            | Error::InvalidArgument(_)
            | Error::NestingExceeded
            | Error::SignatureBodyMismatch { .. }
            | Error::MessageLocked => ErrorKind::InvalidArgument,
            Error::NotSupported(_) => ErrorKind::NotSupported,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Closed => ErrorKind::Closed,
            Error::TimedOut => ErrorKind::TimedOut,
            Error::Io(_) => ErrorKind::IoFailed,
            Error::DBus(_) => ErrorKind::DBus,
        }
    }

    /// The remote error name, if this error came from an `Error` message.
    pub fn dbus_name(&self) -> Option<&str> {
        match self {
            Error::DBus(e) => Some(&e.name),
            _ => None,
        }
    }

    /// Errors are passed to every interested party of a reply, so they
    /// need to be duplicated. `io::Error` is not `Clone`; its kind and
    /// text survive the copy.
    pub fn duplicate(&self) -> Error {
        match self {
            Error::Serializing(s) => Error::Serializing(s.clone()),
            Error::Deserializing(s) => Error::Deserializing(s.clone()),
            Error::EndOfInput => Error::EndOfInput,
            Error::InvalidArgument(s) => Error::InvalidArgument(s.clone()),
            Error::NestingExceeded => Error::NestingExceeded,
            Error::SignatureBodyMismatch { header, body } => Error::SignatureBodyMismatch {
                header: header.clone(),
                body: body.clone(),
            },
            Error::MessageLocked => Error::MessageLocked,
            Error::NotSupported(s) => Error::NotSupported(s.clone()),
            Error::Cancelled => Error::Cancelled,
            Error::Closed => Error::Closed,
            Error::TimedOut => Error::TimedOut,
            Error::Io(e) => Error::Io(io::Error::new(e.kind(), e.to_string())),
            Error::DBus(e) => Error::DBus(e.clone()),
        }
    }
}

impl From<DBusError> for Error {
    fn from(e: DBusError) -> Self {
        Error::DBus(e)
    }
}

impl From<std::str::Utf8Error> for Error {
    fn from(e: std::str::Utf8Error) -> Self {
        Error::InvalidArgument(format!("Invalid UTF-8: {}", e))
    }
}

impl ser::Error for Error {
    fn custom<T: Display>(msg: T) -> Self {
        Error::Serializing(msg.to_string())
    }
}

impl de::Error for Error {
    fn custom<T: Display>(msg: T) -> Self {
        Error::Deserializing(msg.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds() {
        assert_eq!(Error::EndOfInput.kind(), ErrorKind::InvalidArgument);
        assert_eq!(Error::NestingExceeded.kind(), ErrorKind::InvalidArgument);
        assert_eq!(Error::Closed.kind(), ErrorKind::Closed);
        let e = Error::from(io::Error::new(io::ErrorKind::BrokenPipe, "pipe"));
        assert_eq!(e.kind(), ErrorKind::IoFailed);
        assert_eq!(e.duplicate().kind(), ErrorKind::IoFailed);
    }

    #[test]
    fn dbus_error_display() {
        let e = Error::from(DBusError::new("org.example.Failed", "no luck"));
        assert_eq!(e.to_string(), "org.example.Failed: no luck");
        assert_eq!(e.dbus_name(), Some("org.example.Failed"));
        assert_eq!(e.kind(), ErrorKind::DBus);
    }
}
