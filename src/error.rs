//! `postro` error types.
use std::{fmt, io};

use crate::{config::ParseError, postgres::ProtocolError};

/// A specialized [`Result`] for `postro`'s synchronous entry points.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors `postro`'s synchronous API (`Pool::init`, `Config::parse`, ...) can
/// return. Per-query failures never surface here — they're delivered through
/// the query callback's `error_msg` instead (see [`crate::pool::QueryCallback`]).
pub struct Error {
    kind: ErrorKind,
}

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }
}

/// The kind of error behind an [`Error`].
pub enum ErrorKind {
    /// The connection-info string could not be parsed.
    Config(ParseError),
    /// A malformed or unexpected wire message.
    Protocol(ProtocolError),
    /// A socket or multiplexer syscall failed.
    Io(io::Error),
}

macro_rules! from {
    (<$ty:ty> $pat:pat => $body:expr) => {
        impl From<$ty> for Error {
            fn from($pat: $ty) -> Self {
                Self { kind: $body }
            }
        }
    };
}

from!(<ErrorKind> e => e);
from!(<ParseError> e => ErrorKind::Config(e));
from!(<ProtocolError> e => ErrorKind::Protocol(e));
from!(<io::Error> e => ErrorKind::Io(e));

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.kind, f)
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl std::error::Error for ErrorKind {}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => e.fmt(f),
            Self::Protocol(e) => e.fmt(f),
            Self::Io(e) => e.fmt(f),
        }
    }
}

impl fmt::Debug for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}
