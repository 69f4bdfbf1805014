//! A single backend session and its state machine.
//!
//! Grounded in `spec.md` §3/§4.2 for the state machine itself, and in
//! `examples/ariaandika-postro/qs/src/connection.rs`'s buffered I/O shape
//! for how driver calls are sequenced — translated from that file's async
//! `poll_fn`/`Future` style into explicit poll-step methods, since here the
//! pool (not a `Future` executor) owns the event loop and calls these
//! methods directly from `Pool::run`.
use std::time::Instant;

use mio::{Interest, Token};

use crate::{
    config::Config,
    driver::{Driver, FlushStatus, PollStep, QueryOutcome},
    pool::QueryRequest,
    result::PgResult,
};

/// The event a completed or failed query surfaces to its caller-supplied
/// callback. Exactly one of `Error`/`Timeout` ever fires per request, and
/// `Result` may fire zero or more times before either a further `Result`
/// or one of the two terminal shapes — mirroring `spec.md` §6's three
/// callback shapes, expressed here as an enum + closure rather than a
/// `(fn pointer, void*)` pair.
pub enum QueryEvent {
    /// One driver-yielded result set. May repeat for a multi-statement
    /// query; never follows a terminal `Error`/`Timeout` for the same
    /// request.
    Result(PgResult),
    /// A protocol or driver failure. Terminal.
    Error(String),
    /// The request exceeded `query_timeout` or the pending-queue timeout.
    Terminal,
}

/// Caller-supplied reaction to a query's events. Boxed so `Pool` can hold
/// a homogeneous collection of in-flight and queued requests regardless of
/// what the caller closed over.
pub type QueryCallback = Box<dyn FnMut(QueryEvent)>;

/// Readiness-bound edge-triggered registration phase, tracked only while
/// `action` is `Connecting`/`Reconnecting` — mirrors `spec.md §3`'s
/// `poll_phase`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollPhase {
    Init,
    Read,
    Write,
    Ok,
}

/// What a connection is presently doing. Doubles as which of the pool's
/// three intrusive lists (if any) it belongs to: `Connecting` while
/// `Connecting`/`Reconnecting`, `Querying` while `Flushing`/`Querying`,
/// `Idle` while `Idle`, and no list while `Cancelling` (a one-tick
/// transient state; see `spec.md` §4.3 "Cancellation").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Connecting,
    Reconnecting,
    Idle,
    Flushing,
    Querying,
    Cancelling,
}

/// The outcome of advancing a connection's state machine by one step,
/// reported back to `Pool::run` so it can perform list membership changes
/// (the pool owns the lists; the connection only owns its own state).
pub enum Transition {
    /// No membership change.
    None,
    /// Move from `connecting` to `idle`.
    BecameIdle,
    /// The connection failed and was reset; already removed from whatever
    /// list it was in and re-linked into `connecting`.
    Reset,
}

/// One backend session: owns a driver handle, tracks readiness, and
/// carries the currently bound request's callback, if any.
pub struct Connection<D: Driver> {
    driver: D,
    action: Action,
    poll_phase: PollPhase,
    writable: bool,
    readable: bool,
    last_activity: Instant,
    callback: Option<QueryCallback>,

    /// Shared link fields: a connection is a member of at most one of the
    /// pool's three lists at a time (derivable from `action`, per
    /// `spec.md` §9's design note), so one prev/next pair suffices rather
    /// than three.
    pub(crate) prev: Option<usize>,
    pub(crate) next: Option<usize>,

    pub(crate) token: Token,
}

impl<D: Driver> Connection<D> {
    /// Starts a non-blocking connection attempt. Returns `None` if the
    /// driver couldn't even begin (e.g. DNS/socket failure) — the caller
    /// does not get a `Connection` to track in that case.
    pub fn init(config: &Config, token: Token) -> Option<Self> {
        let driver = D::connect_start(config).ok()?;
        Some(Self {
            driver,
            action: Action::Connecting,
            poll_phase: PollPhase::Init,
            writable: false,
            readable: false,
            last_activity: Instant::now(),
            callback: None,
            prev: None,
            next: None,
            token,
        })
    }

    /// Registers the connection's current socket with `registry` in
    /// edge-triggered mode for read, write, and peer-hangup/error (`mio`
    /// always reports `READABLE`/`WRITABLE` plus `ERROR`-equivalent events
    /// through `Event::is_error`/`is_read_closed`/`is_write_closed`, so a
    /// single `READABLE | WRITABLE` interest set is sufficient).
    pub fn begin_polling(&mut self, registry: &mio::Registry) -> std::io::Result<()> {
        registry.register(self.driver.source(), self.token, Interest::READABLE | Interest::WRITABLE)?;
        self.poll_phase = PollPhase::Init;
        Ok(())
    }

    fn re_register(&mut self, registry: &mio::Registry) -> std::io::Result<()> {
        // The socket is replaced wholesale on every reset (see
        // `examples/original_source/connection.c`'s `PQNB_connection_reset`,
        // which re-registers unconditionally), so always register fresh
        // rather than try to detect whether the fd actually changed.
        registry.register(self.driver.source(), self.token, Interest::READABLE | Interest::WRITABLE)
    }

    pub fn action(&self) -> Action {
        self.action
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn mark_event(&mut self, readable: bool, writable: bool, now: Instant) {
        self.readable |= readable;
        self.writable |= writable;
        self.last_activity = now;
    }

    pub fn has_callback(&self) -> bool {
        self.callback.is_some()
    }

    /// Binds `request` and attempts to dispatch it immediately. On full
    /// flush the connection becomes `Querying`; on partial flush,
    /// `Flushing`; on failure the request's callback fires with the
    /// driver's error and the connection is left for the caller to
    /// `reset`.
    pub fn query(&mut self, request: QueryRequest, now: Instant) -> bool {
        self.driver.send_query(&request.sql);
        self.callback = Some(request.callback);
        self.last_activity = now;

        match self.driver.flush() {
            FlushStatus::Done => {
                self.action = Action::Querying;
                true
            }
            FlushStatus::Partial => {
                self.action = Action::Flushing;
                true
            }
            FlushStatus::Failed => {
                self.fire(QueryEvent::Error(self.driver.error_message().to_owned()));
                false
            }
        }
    }

    fn fire(&mut self, event: QueryEvent) {
        if let Some(mut cb) = self.callback.take() {
            cb(event);
        }
    }

    /// Drives a `Connecting`/`Reconnecting` attempt one step. Returns the
    /// driver's verdict; the caller (`Pool::run`) interprets `Ok` as "link
    /// into idle" and `Failed` as "reset".
    pub fn drive_connect(&mut self) -> PollStep {
        debug_assert!(matches!(self.action, Action::Connecting | Action::Reconnecting));
        let step = match self.action {
            Action::Connecting => self.driver.connect_poll(),
            _ => self.driver.reset_poll(),
        };
        self.poll_phase = match step {
            PollStep::Reading => PollPhase::Read,
            PollStep::Writing => PollPhase::Write,
            PollStep::Ok => PollPhase::Ok,
            PollStep::Failed => PollPhase::Ok,
        };
        self.writable = false;
        self.readable = false;
        if step == PollStep::Ok {
            self.action = Action::Idle;
        }
        step
    }

    /// Drives the `Flushing` state: finishes writing the query, and if
    /// that completes, promotes to `Querying`. Returns `false` on failure.
    pub fn drive_flushing(&mut self) -> bool {
        debug_assert_eq!(self.action, Action::Flushing);
        if self.readable {
            self.readable = false;
            if !self.driver.consume_input() {
                self.fire(QueryEvent::Error(self.driver.error_message().to_owned()));
                return false;
            }
        }
        if !self.writable {
            return true;
        }
        self.writable = false;
        match self.driver.flush() {
            FlushStatus::Done => {
                self.action = Action::Querying;
                true
            }
            FlushStatus::Partial => true,
            FlushStatus::Failed => {
                self.fire(QueryEvent::Error(self.driver.error_message().to_owned()));
                false
            }
        }
    }

    /// Drives the `Querying` state. Returns `Some(true)` when the request
    /// is fully drained (connection should become `Idle`), `Some(false)`
    /// on failure (caller must `reset`), `None` if still in progress.
    pub fn drive_querying(&mut self) -> Option<bool> {
        debug_assert_eq!(self.action, Action::Querying);
        if !self.readable {
            return None;
        }
        self.readable = false;
        if !self.driver.consume_input() {
            self.fire(QueryEvent::Error(self.driver.error_message().to_owned()));
            return Some(false);
        }
        if self.driver.is_busy() {
            return None;
        }
        while let Some(outcome) = self.driver.get_result() {
            match outcome {
                QueryOutcome::Result(result) => self.fire(QueryEvent::Result(result)),
                QueryOutcome::Error(msg) => {
                    self.fire(QueryEvent::Error(msg));
                    return Some(false);
                }
            }
        }
        self.callback = None;
        self.action = Action::Idle;
        Some(true)
    }

    /// Canonical recovery path: fires a terminal callback for any bound
    /// request, clears readiness state, and begins a fresh reconnection
    /// attempt. Idempotent — calling this on an already-`Reconnecting`
    /// connection with no bound callback and a driver that's still mid
    /// reset is a no-op beyond re-attempting the reset.
    ///
    /// `now` becomes the connection's new `last_activity`, so the fresh
    /// reconnect gets a full, un-expired `connect_timeout` window — without
    /// this the connect-timeout sweep would see the very node it just reset
    /// as still expired and loop forever (see `spec.md` §9's monotone-FIFO
    /// timeout-sweep discipline).
    pub fn reset(&mut self, config: &Config, registry: &mio::Registry, now: Instant) {
        if matches!(self.action, Action::Flushing | Action::Querying | Action::Cancelling) {
            let msg = self.driver.error_message();
            let msg = if msg.is_empty() { "connection reset" } else { msg };
            self.fire(QueryEvent::Error(msg.to_owned()));
        }

        self.action = Action::Reconnecting;
        self.readable = false;
        self.writable = false;
        self.callback = None;
        self.poll_phase = PollPhase::Init;
        self.last_activity = now;

        if self.driver.reset_start(config) {
            #[cfg(feature = "log")]
            log::debug!("connection reset, retrying");
        } else {
            #[cfg(feature = "log")]
            log::warn!("connection reset failed to start: {}", self.driver.error_message());
        }

        if let Err(_e) = self.re_register(registry) {
            #[cfg(feature = "log")]
            log::error!("failed to re-register connection after reset: {_e}");
        }
    }

    /// Fires a timeout callback for the bound request (if any) and resets.
    /// Used by the pool's query-timeout sweep.
    pub fn timeout_and_reset(&mut self, config: &Config, registry: &mio::Registry, now: Instant) {
        self.action = Action::Cancelling;
        self.driver.request_cancel();
        self.fire(QueryEvent::Terminal);
        self.reset(config, registry, now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{ConnStatus, PollStep as PS};
    use std::{cell::RefCell, rc::Rc};

    struct FakeDriver {
        connect_steps: std::collections::VecDeque<PS>,
        busy: bool,
        results: std::collections::VecDeque<QueryOutcome>,
        error: String,
        flush_status: FlushStatus,
    }

    impl Driver for FakeDriver {
        fn connect_start(_config: &Config) -> std::io::Result<Self> {
            Ok(Self {
                connect_steps: [PS::Ok].into_iter().collect(),
                busy: false,
                results: Default::default(),
                error: String::new(),
                flush_status: FlushStatus::Done,
            })
        }

        fn connect_poll(&mut self) -> PollStep {
            self.connect_steps.pop_front().unwrap_or(PS::Ok)
        }

        fn reset_start(&mut self, _config: &Config) -> bool {
            self.connect_steps = [PS::Ok].into_iter().collect();
            true
        }

        fn reset_poll(&mut self) -> PollStep {
            self.connect_poll()
        }

        fn send_query(&mut self, _sql: &str) {
            self.busy = true;
        }

        fn flush(&mut self) -> FlushStatus {
            self.flush_status
        }

        fn consume_input(&mut self) -> bool {
            self.busy = false;
            true
        }

        fn is_busy(&self) -> bool {
            self.busy
        }

        fn get_result(&mut self) -> Option<QueryOutcome> {
            self.results.pop_front()
        }

        fn request_cancel(&mut self) {}

        fn source(&mut self) -> &mut dyn mio::event::Source {
            unimplemented!("FakeDriver has no real socket")
        }

        fn error_message(&self) -> &str {
            &self.error
        }

        fn status(&self) -> ConnStatus {
            ConnStatus::Ok
        }
    }

    fn fake_config() -> Config {
        Config::parse("postgres://u:p@h:5432/d").unwrap()
    }

    #[test]
    fn query_drains_results_then_goes_idle() {
        let mut conn = Connection::<FakeDriver> {
            driver: FakeDriver {
                connect_steps: Default::default(),
                busy: false,
                results: Default::default(),
                error: String::new(),
                flush_status: FlushStatus::Done,
            },
            action: Action::Idle,
            poll_phase: PollPhase::Ok,
            writable: false,
            readable: true,
            last_activity: Instant::now(),
            callback: None,
            prev: None,
            next: None,
            token: Token(0),
        };

        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen_cb = seen.clone();
        let request = QueryRequest {
            sql: "select 1".into(),
            callback: Box::new(move |ev: QueryEvent| {
                seen_cb.borrow_mut().push(match ev {
                    QueryEvent::Result(_) => "result",
                    QueryEvent::Error(_) => "error",
                    QueryEvent::Terminal => "terminal",
                });
            }),
            enqueued_at: Instant::now(),
        };

        assert!(conn.query(request, Instant::now()));
        assert_eq!(conn.action(), Action::Querying);

        conn.driver.results.push_back(QueryOutcome::Result(PgResult::new(
            vec![],
            vec![],
            crate::common::ByteStr::copy_from_str("SELECT 1"),
        )));

        assert_eq!(conn.drive_querying(), Some(true));
        assert_eq!(conn.action(), Action::Idle);
        assert_eq!(*seen.borrow(), vec!["result"]);
        assert!(!conn.has_callback());
    }
}
