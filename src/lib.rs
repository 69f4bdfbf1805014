//! A non-blocking connection pool for a PostgreSQL-compatible database.
//!
//! The pool fans a stream of SQL query requests across a fixed set of
//! backend connections, dispatches them without blocking the caller's
//! thread, and delivers results through callbacks. It does not own an
//! event loop: it exposes a single readiness file descriptor (via
//! [`Pool::get_info`]) and a [`Pool::run`] entry point, meant to be
//! invoked whenever that fd signals readable in the host's own loop.
//!
//! ```no_run
//! use postro::{Pool, QueryEvent};
//!
//! let mut pool = Pool::init("postgres://postgres@localhost/postgres", 4).unwrap();
//!
//! pool.query("select 1", |event| match event {
//!     QueryEvent::Result(result) => println!("got {} rows", result.ntuples()),
//!     QueryEvent::Error(message) => eprintln!("query failed: {message}"),
//!     QueryEvent::Terminal => eprintln!("query timed out"),
//! }).unwrap();
//!
//! loop {
//!     pool.run().unwrap();
//!     // host's own wait on `pool.get_info(InfoKind::EpollFd)` goes here
//!     # break;
//! }
//! ```
//!
//! # Scope
//!
//! Single-threaded and cooperative: nothing happens outside [`Pool::run`]
//! and [`Pool::query`]. No multi-thread safety, no prepared-statement
//! caching, no result streaming (results are delivered whole), no TLS, no
//! dynamic pool sizing, and a failed query is never retried on a different
//! connection — its callback fires with an error and the connection is
//! reset.
pub mod common;
pub mod config;
pub mod connection;
pub mod driver;
mod error;
mod ext;
mod fifo;
pub mod pool;
pub mod postgres;
pub mod result;

pub use config::Config;
pub use connection::QueryEvent;
pub use error::{Error, ErrorKind, Result};
pub use pool::{InfoKind, Pool, QueueFull};
pub use result::PgResult;
