//! Postgres frontend messages.
//!
//! <https://www.postgresql.org/docs/current/protocol-message-formats.html>
use bytes::{BufMut, BytesMut};

use crate::ext::{BufMutExt, StrExt, UsizeExt};

/// Write a frontend message to `buf`.
pub fn write<F: FrontendProtocol>(msg: F, buf: &mut BytesMut) {
    const PREFIX: usize = 1 + 4; // msgtype + length

    let size_hint = msg.size_hint();
    buf.reserve(PREFIX + size_hint as usize);

    let offset = buf.len();
    buf.put_u8(F::MSGTYPE);
    buf.put_u32(4 + size_hint);

    msg.encode(&mut *buf);

    debug_assert_eq!(
        buf.len() - offset,
        PREFIX + size_hint as usize,
        "frontend message body size did not match its size hint"
    );
}

/// A type that can be encoded into a postgres frontend message.
pub trait FrontendProtocol {
    const MSGTYPE: u8;

    /// Size of the main body, not counting the type byte and length prefix.
    fn size_hint(&self) -> u32;

    /// Write the main body; must write exactly `size_hint()` bytes.
    fn encode(self, buf: impl BufMut);
}

/// The startup message. Has no type byte, so it cannot implement
/// [`FrontendProtocol`]; call [`Startup::write`] directly.
#[derive(Debug)]
pub struct Startup<'a> {
    /// The database user name to connect as. Required.
    pub user: &'a str,
    /// The database to connect to. Defaults to the user name.
    pub database: Option<&'a str>,
}

impl Startup<'_> {
    pub fn write(self, buf: &mut BytesMut) {
        let offset = buf.len();

        buf.put_u32(0); // length placeholder
        buf.put_u32(196_608); // protocol version 3.0

        buf.put_nul_string("user");
        buf.put_nul_string(self.user);

        if let Some(db) = self.database {
            buf.put_nul_string("database");
            buf.put_nul_string(db);
        }

        buf.put_u8(b'\0'); // terminator

        let mut written = &mut buf[offset..];
        written.put_u32(written.len().to_u32());
    }
}

/// A password response, in whatever form the server's auth request required.
pub struct PasswordMessage<'a> {
    pub password: &'a str,
}

impl FrontendProtocol for PasswordMessage<'_> {
    const MSGTYPE: u8 = b'p';

    fn size_hint(&self) -> u32 {
        self.password.nul_string_len()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_nul_string(self.password);
    }
}

/// A simple query: the backend parses, plans, and executes it in one step,
/// possibly returning multiple result sets (one per statement in `sql`).
pub struct Query<'a> {
    pub sql: &'a str,
}

impl FrontendProtocol for Query<'_> {
    const MSGTYPE: u8 = b'Q';

    fn size_hint(&self) -> u32 {
        self.sql.nul_string_len()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_nul_string(self.sql);
    }
}

/// Closes the connection politely.
pub struct Terminate;

impl FrontendProtocol for Terminate {
    const MSGTYPE: u8 = b'X';

    fn size_hint(&self) -> u32 {
        0
    }

    fn encode(self, _buf: impl BufMut) {}
}
