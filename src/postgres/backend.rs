//! Postgres backend messages.
//!
//! <https://www.postgresql.org/docs/current/protocol-message-formats.html>
use bytes::{Buf, Bytes};

use super::ProtocolError;
use crate::{common::ByteStr, ext::BytesExt};

/// A type that can be decoded from a postgres backend message body.
pub trait BackendProtocol: Sized + std::fmt::Debug {
    /// Decode `body` (excluding the message type byte and length prefix).
    fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError>;
}

/// Any backend message this driver understands.
pub enum BackendMessage {
    Authentication(Authentication),
    BackendKeyData(BackendKeyData),
    CommandComplete(CommandComplete),
    DataRow(DataRow),
    ErrorResponse(ErrorResponse),
    EmptyQueryResponse(EmptyQueryResponse),
    NoticeResponse(NoticeResponse),
    ParameterStatus(ParameterStatus),
    ReadyForQuery(ReadyForQuery),
    RowDescription(RowDescription),
}

macro_rules! match_backend {
    ($($name:ident,)*) => {
        impl BackendMessage {
            pub const fn msgtype(&self) -> u8 {
                match self {
                    $(Self::$name(_) => $name::MSGTYPE,)*
                }
            }

            pub const fn message_name(msgtype: u8) -> &'static str {
                match msgtype {
                    $($name::MSGTYPE => stringify!($name),)*
                    _ => "Unknown",
                }
            }
        }
        impl BackendProtocol for BackendMessage {
            fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
                let message = match msgtype {
                    $($name::MSGTYPE => Self::$name(<$name as BackendProtocol>::decode(msgtype, body)?),)*
                    _ => return Err(ProtocolError::unknown(msgtype)),
                };
                Ok(message)
            }
        }
        impl std::fmt::Debug for BackendMessage {
            fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                match self {
                    $(Self::$name(e) => std::fmt::Debug::fmt(e, f),)*
                }
            }
        }
    };
}

match_backend! {
    Authentication,
    BackendKeyData,
    CommandComplete,
    DataRow,
    ErrorResponse,
    EmptyQueryResponse,
    NoticeResponse,
    ParameterStatus,
    ReadyForQuery,
    RowDescription,
}

macro_rules! assert_msgtype {
    ($typ:ident) => {
        if Self::MSGTYPE != $typ {
            return Err(ProtocolError::unexpected(Self::MSGTYPE, $typ));
        }
    };
}

macro_rules! msgtype {
    ($me:ident, $ty:literal) => {
        impl $me {
            #[doc = concat!("`", stringify!($ty), "`")]
            pub const MSGTYPE: u8 = $ty;
        }
    };
}

/// Identifies the message as an authentication request.
#[derive(Debug)]
pub enum Authentication {
    /// Authentication was successful.
    Ok,
    /// The frontend must send a cleartext password.
    CleartextPassword,
    /// The frontend must send an MD5-hashed password, salted with `salt`.
    MD5Password { salt: [u8; 4] },
    /// Any other (unsupported) authentication method.
    Unsupported(u32),
}

msgtype!(Authentication, b'R');

impl BackendProtocol for Authentication {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        let auth = match body.get_u32() {
            0 => Self::Ok,
            3 => Self::CleartextPassword,
            5 => Self::MD5Password { salt: body.get_u32().to_be_bytes() },
            other => Self::Unsupported(other),
        };
        Ok(auth)
    }
}

/// Cancellation key data the frontend must save to later issue a cancel request.
pub struct BackendKeyData {
    pub process_id: u32,
    pub secret_key: u32,
}

msgtype!(BackendKeyData, b'K');

impl BackendProtocol for BackendKeyData {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        Ok(Self { process_id: body.get_u32(), secret_key: body.get_u32() })
    }
}

/// A run-time parameter status report.
#[derive(Debug)]
pub struct ParameterStatus {
    pub name: ByteStr,
    pub value: ByteStr,
}

msgtype!(ParameterStatus, b'S');

impl BackendProtocol for ParameterStatus {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        Ok(Self { name: body.get_nul_bytestr()?, value: body.get_nul_bytestr()? })
    }
}

/// A notice the backend sent outside the request/response flow.
pub struct NoticeResponse {
    pub body: Bytes,
}

msgtype!(NoticeResponse, b'N');

impl NoticeResponse {
    pub fn new(body: Bytes) -> Self {
        Self { body }
    }
}

impl BackendProtocol for NoticeResponse {
    fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        Ok(Self { body })
    }
}

/// An error response. Raw field body, see
/// <https://www.postgresql.org/docs/current/protocol-error-fields.html>.
pub struct ErrorResponse {
    pub body: Bytes,
}

msgtype!(ErrorResponse, b'E');

impl ErrorResponse {
    pub fn new(body: Bytes) -> Self {
        Self { body }
    }

    /// Best-effort human readable rendering of the error fields.
    ///
    /// Fields are `Byte1` code + nul-terminated string, terminated by a
    /// zero byte. The `M` (message) field is what most callers want; fall
    /// back to the raw bytes if it's missing or not UTF-8.
    pub fn message(&self) -> String {
        let mut body = self.body.clone();
        while body.has_remaining() {
            let code = body.get_u8();
            if code == 0 {
                break;
            }
            let Ok(field) = body.get_nul_bytestr() else { break };
            if code == b'M' {
                return field.as_str().to_owned();
            }
        }
        String::from("postgres error response")
    }
}

impl BackendProtocol for ErrorResponse {
    fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        Ok(Self { body })
    }
}

/// Column layout of the rows about to follow.
pub struct RowDescription {
    pub body: Bytes,
}

msgtype!(RowDescription, b'T');

impl BackendProtocol for RowDescription {
    fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        Ok(Self { body })
    }
}

/// One row of a result set.
pub struct DataRow {
    pub body: Bytes,
}

msgtype!(DataRow, b'D');

impl BackendProtocol for DataRow {
    fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        Ok(Self { body })
    }
}

/// A SQL command completed normally.
#[derive(Debug)]
pub struct CommandComplete {
    pub tag: ByteStr,
}

msgtype!(CommandComplete, b'C');

impl BackendProtocol for CommandComplete {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        Ok(Self { tag: body.get_nul_bytestr()? })
    }
}

/// The backend is ready for a new query cycle.
pub struct ReadyForQuery {
    pub tx_status: u8,
}

msgtype!(ReadyForQuery, b'Z');

impl BackendProtocol for ReadyForQuery {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        Ok(Self { tx_status: body.get_u8() })
    }
}

macro_rules! unit_msg {
    ($(
        $(#[$doc:meta])* struct $name:ident, $ty:literal;
    )*) => {$(
        $(#[$doc])*
        #[derive(Debug)]
        pub struct $name;

        msgtype!($name, $ty);

        impl BackendProtocol for $name {
            fn decode(msgtype: u8, _: Bytes) -> Result<Self, ProtocolError> {
                assert_msgtype!(msgtype);
                Ok(Self)
            }
        }
    )*};
}

unit_msg! {
    /// Response to an empty query string, substitutes for `CommandComplete`.
    struct EmptyQueryResponse, b'I';
}

// CUSTOM DEBUG

impl std::fmt::Debug for BackendKeyData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendKeyData")
            .field("process_id", &self.process_id)
            .field("secret_key", &"<REDACTED>")
            .finish()
    }
}

impl std::fmt::Debug for ReadyForQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadyForQuery")
            .field(
                "tx_status",
                &match self.tx_status {
                    b'I' => "Idle(I)",
                    b'T' => "Transaction(T)",
                    b'E' => "FailedTx(E)",
                    _ => "unknown",
                },
            )
            .finish()
    }
}

impl std::fmt::Debug for RowDescription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowDescription").field("body", &"<BINARY>").finish()
    }
}

impl std::fmt::Debug for DataRow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataRow").field("body", &"<BINARY>").finish()
    }
}

impl std::fmt::Debug for ErrorResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorResponse").field("message", &self.message()).finish()
    }
}

impl std::fmt::Debug for NoticeResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NoticeResponse").finish()
    }
}
