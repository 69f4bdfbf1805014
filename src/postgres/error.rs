use std::fmt;

/// An error while decoding a postgres wire message.
#[derive(Debug)]
pub enum ProtocolError {
    /// The message type byte did not match any known backend message.
    Unknown(u8),
    /// A message decoder expected a different message type than it received.
    Unexpected { expected: u8, got: u8 },
    /// A field expected to be UTF-8 was not.
    Utf8(std::str::Utf8Error),
}

impl ProtocolError {
    pub fn unknown(msgtype: u8) -> Self {
        Self::Unknown(msgtype)
    }

    pub fn unexpected(expected: u8, got: u8) -> Self {
        Self::Unexpected { expected, got }
    }
}

impl From<std::str::Utf8Error> for ProtocolError {
    fn from(value: std::str::Utf8Error) -> Self {
        Self::Utf8(value)
    }
}

impl std::error::Error for ProtocolError {}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(ty) => write!(f, "unknown backend message type {:?}", *ty as char),
            Self::Unexpected { expected, got } => write!(
                f,
                "expected backend message type {:?}, got {:?}",
                *expected as char, *got as char
            ),
            Self::Utf8(e) => write!(f, "invalid utf8 in backend message: {e}"),
        }
    }
}
