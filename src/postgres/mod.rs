//! Postgres frontend/backend wire messages.
//!
//! Only the messages the simple query protocol and the startup/auth
//! handshake need are modeled here — the extended query protocol (Parse/
//! Bind/Describe/Execute/portals) is out of scope, per the pool's
//! no-prepared-statements, no-result-streaming design.
//!
//! ```text
//! ┏━━━━┳━━━━━━━━━━━━━━━━━━━┳━━━━━━┓
//! ┃ Ty ┃       Length      ┃ Body ┃
//! ┣━━━━╋━━━━━━━━━━━━━━━━━━━╋━━━━━━┫
//! ┃ u8 ┃        u32        ┃ [u8] ┃
//! ┗━━━━┻━━━━━━━━━━━━━━━━━━━┻━━━━━━┛
//! ```
//!
//! For historical reasons the very first message a client sends (the
//! startup message) carries no leading type byte.
//!
//! <https://www.postgresql.org/docs/current/protocol-message-formats.html>

pub mod backend;
pub mod frontend;

mod error;

pub use backend::{BackendMessage, BackendProtocol, ErrorResponse, NoticeResponse};
pub use error::ProtocolError;
