//! application-facing handler traits (§6 "Handler interfaces")

use crate::connection::Connection;
use crate::errors::WsError;
use crate::message::MessageReader;
use crate::status::ConnectionStatus;

/// per-connection event sink
///
/// handlers must be re-entrant across connections — the same handler
/// instance may be shared by many connections, each calling it from its own
/// reader thread — but the core guarantees calls for a single connection
/// are always sequential (§5 "Ordering guarantees").
pub trait ConnectionHandler: Send + Sync {
    /// fired once, after the opening handshake succeeds
    fn on_open(&self, _conn: &Connection, _subprotocol: Option<&str>) {}

    /// fired once per reassembled inbound message
    ///
    /// `reader` streams the message payload lazily (§4.5); `is_text`
    /// indicates whether the message opcode was TEXT rather than BINARY.
    /// the reader loop resumes only once this call returns, so a handler
    /// that does not consume `reader` to EOF still leaves the connection
    /// synchronized (the reader's `Drop` drains the rest).
    fn on_message(&self, _conn: &Connection, _reader: &mut MessageReader, _is_text: bool) {}

    /// fired at most once, if a non-EOF error terminated the reader loop
    /// (including a failed opening handshake, in which case `on_open` is
    /// skipped)
    fn on_error(&self, _conn: &Connection, _error: &WsError) {}

    /// fired exactly once, always last
    fn on_close(&self, _conn: &Connection, _status: &ConnectionStatus) {}
}

/// per-acceptor lifecycle sink (§4.7)
pub trait AcceptorHandler: Send + Sync {
    fn on_start(&self) {}

    /// return `false` to reject the connection before it is spawned; the
    /// socket is closed without a handshake attempt
    fn on_accept(&self, _conn: &Connection) -> bool {
        true
    }

    fn on_stop(&self, _error: Option<&WsError>) {}
}

/// a handler that does nothing; useful as a default/placeholder
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl ConnectionHandler for NoopHandler {}
impl AcceptorHandler for NoopHandler {}
