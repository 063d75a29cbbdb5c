//! per-connection state machine: reader loop, synchronized writer, control
//! protocol, close handshake, timeouts and ping (§4.4, §4.6)

use std::io::{Cursor, Read};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use crate::errors::{ProtocolError, WsError};
use crate::frame::{write_frame, FrameHeader, OpCode};
use crate::handler::ConnectionHandler;
use crate::mask::{MaskSource, RandMask};
use crate::message::MessageReader;
use crate::params::ConnectionParams;
use crate::registry::Registry;
use crate::status::{self, clamp_close_code, close_code, truncate_reason, ConnectionState, ConnectionStatus};
use crate::stream::WsStream;

/// fixed probe payload for keepalive pings (§4.4 "Read timeouts")
pub const PING_PROBE_PAYLOAD: &[u8] = b"PingPong";

/// resolves the peer connections sharing whatever registry `Connection`'s
/// owner (an `Acceptor` or the `Endpoint`) put it in (§6 "listConnections")
///
/// implemented directly by `Registry<Connection>` so a `Connection` can
/// share its owner's registry without holding a `Weak` back-reference to
/// the owner type itself (which would otherwise need `connection.rs` and
/// `acceptor.rs`/`endpoint.rs` to name each other's concrete types).
pub(crate) trait PeerSource: Send + Sync {
    fn peers(&self) -> Vec<Arc<Connection>>;
}

impl PeerSource for Registry<Connection> {
    fn peers(&self) -> Vec<Arc<Connection>> {
        self.snapshot()
    }
}

fn next_connection_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// which side of the handshake this connection played
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    fn must_mask_outbound(self) -> bool {
        matches!(self, Role::Client)
    }

    fn must_mask_inbound(self) -> bool {
        matches!(self, Role::Server)
    }
}

struct ConnectionInner {
    stream: WsStream,
    state: ConnectionState,
    status: ConnectionStatus,
}

/// mutable state owned by the single reader thread; never shared
#[derive(Default)]
struct ReaderState {
    op_data: Option<OpCode>,
    ping_outstanding: bool,
    message_len: usize,
}

/// outcome of reading and locally dispatching one wire frame
enum FrameOutcome {
    /// first frame of a new TEXT/BINARY message
    NewMessage {
        opcode: OpCode,
        fin: bool,
        payload: Vec<u8>,
    },
    /// a CONTINUATION frame belonging to the message in progress
    Continuation { fin: bool, payload: Vec<u8> },
    /// a control frame (or a tolerated duplicate close echo) was fully
    /// handled in place; caller should read the next frame
    ControlHandled,
    /// the close handshake concluded; the reader loop should stop
    ConnectionClosed,
}

/// a single WebSocket connection
pub struct Connection {
    id: u64,
    inner: Mutex<ConnectionInner>,
    shutdown_handle: TcpStream,
    role: Role,
    secure: bool,
    peer_addr: SocketAddr,
    path: String,
    query: Option<String>,
    subprotocol: Option<String>,
    params: ConnectionParams,
    mask_source: Mutex<Box<dyn MaskSource>>,
    forced_close_fired: Arc<AtomicBool>,
    peer_source: OnceLock<Arc<dyn PeerSource>>,
}

impl Connection {
    pub(crate) fn new(
        stream: WsStream,
        shutdown_handle: TcpStream,
        role: Role,
        peer_addr: SocketAddr,
        path: String,
        query: Option<String>,
        subprotocol: Option<String>,
        params: ConnectionParams,
    ) -> Arc<Connection> {
        let secure = stream.is_secure();
        Arc::new(Connection {
            id: next_connection_id(),
            inner: Mutex::new(ConnectionInner {
                stream,
                state: ConnectionState::Connecting,
                status: ConnectionStatus::not_yet_open(),
            }),
            shutdown_handle,
            role,
            secure,
            peer_addr,
            path,
            query,
            subprotocol,
            params,
            mask_source: Mutex::new(Box::new(RandMask)),
            forced_close_fired: Arc::new(AtomicBool::new(false)),
            peer_source: OnceLock::new(),
        })
    }

    /// attach the registry this connection was pushed into, so
    /// [`Connection::list_connections`] can later list its peers; called
    /// once by the acceptor/endpoint right after registering the connection
    pub(crate) fn attach_peer_source(&self, source: Arc<dyn PeerSource>) {
        let _ = self.peer_source.set(source);
    }

    /// other live connections sharing this connection's acceptor (server
    /// side) or endpoint (client side), excluding this one (§6
    /// "listConnections")
    pub fn list_connections(&self) -> Vec<Arc<Connection>> {
        match self.peer_source.get() {
            Some(source) => source
                .peers()
                .into_iter()
                .filter(|peer| peer.id != self.id)
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.inner.lock().unwrap().state == ConnectionState::Open
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn is_client_side(&self) -> bool {
        self.role == Role::Client
    }

    pub fn sub_protocol(&self) -> Option<&str> {
        self.subprotocol.as_deref()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// peer's host, without the port (§6 "getPeerHost")
    pub fn peer_host(&self) -> String {
        self.peer_addr.ip().to_string()
    }

    /// peer's port (§6 "getPort")
    pub fn port(&self) -> u16 {
        self.peer_addr.port()
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// whether the background timer already force-shutdown the socket
    pub fn forced_close_fired(&self) -> bool {
        self.forced_close_fired.load(Ordering::SeqCst)
    }

    /// lock-free snapshot; may lag a concurrent transition (§5)
    pub fn status(&self) -> ConnectionStatus {
        self.inner.lock().unwrap().status.clone()
    }

    /// mark the handshake complete and the connection open
    pub(crate) fn mark_open(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = ConnectionState::Open;
        tracing::debug!(peer = %self.peer_addr, role = ?self.role, "connection open");
    }

    /// record a failed opening handshake so `onError`/`onClose` still see a
    /// coherent status (§4.4 "Event delivery": these fire with `onOpen`
    /// omitted when the handshake itself fails)
    pub(crate) fn mark_handshake_failed(&self, err: &WsError) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = ConnectionState::Closed;
        inner.status = ConnectionStatus {
            code: err.close_code(),
            reason: String::new(),
            remotely: false,
            was_clean: false,
            error: Some(Arc::new(err.clone())),
        };
    }

    pub(crate) fn set_read_timeout(&self, timeout: Duration) {
        let _ = self.shutdown_handle.set_read_timeout(Some(timeout));
    }

    // ---- sending ----------------------------------------------------

    fn next_mask_key(&self) -> Option<[u8; 4]> {
        if self.role.must_mask_outbound() {
            Some(self.mask_source.lock().unwrap().next_mask())
        } else {
            None
        }
    }

    fn send_frame_raw(&self, opcode: OpCode, fin: bool, payload: &[u8]) -> Result<(), WsError> {
        let mask = self.next_mask_key();
        let mut inner = self.inner.lock().unwrap();
        if inner.state != ConnectionState::Open {
            return Err(WsError::NotOpen(inner.state));
        }
        match write_frame(&mut inner.stream, opcode, fin, payload, mask) {
            Ok(()) => Ok(()),
            Err(e) => {
                inner.state = ConnectionState::Closed;
                inner.status.code = close_code::ABNORMAL_CLOSURE;
                Err(e.into())
            }
        }
    }

    /// always-allowed frame send used internally while tearing the
    /// connection down (close echoes, PONGs) where the caller has already
    /// decided the frame must go out regardless of (I4)
    fn send_frame_unchecked(&self, inner: &mut ConnectionInner, opcode: OpCode, fin: bool, payload: &[u8]) {
        let mask = self.next_mask_key();
        let _ = write_frame(&mut inner.stream, opcode, fin, payload, mask);
    }

    /// send one complete TEXT message
    pub fn send_text(&self, text: &str) -> Result<(), WsError> {
        self.send_message(OpCode::Text, Cursor::new(text.as_bytes()))
    }

    /// send one complete BINARY message
    pub fn send_binary(&self, data: &[u8]) -> Result<(), WsError> {
        self.send_message(OpCode::Binary, Cursor::new(data))
    }

    /// stream `source` out as one message, fragmenting into frames of
    /// `payloadBufferLength` bytes each (§4.6)
    pub fn send_message<R: Read>(&self, opcode: OpCode, mut source: R) -> Result<(), WsError> {
        let chunk_len = self.params.payload_buffer_length.max(1);
        let mut buf = vec![0u8; chunk_len];
        let mut current_opcode = opcode;
        loop {
            let filled = fill_buffer(&mut source, &mut buf)?;
            if filled == buf.len() {
                self.send_frame_raw(current_opcode, false, &buf[..filled])?;
                current_opcode = OpCode::Continuation;
                continue;
            } else {
                self.send_frame_raw(current_opcode, true, &buf[..filled])?;
                return Ok(());
            }
        }
    }

    /// send a single PING with an arbitrary payload (application-initiated;
    /// the keepalive ping always uses [`PING_PROBE_PAYLOAD`])
    pub fn send_ping(&self, payload: &[u8]) -> Result<(), WsError> {
        self.send_frame_raw(OpCode::Ping, true, payload)
    }

    /// initiate the closing handshake; a no-op unless the connection is
    /// currently OPEN (§4.4 "Close protocol")
    pub fn close(&self, code: u16, reason: &str) {
        let (clamped_code, clamped_reason) = clamp_close_code(code, reason);
        let clamped_reason = truncate_reason(&clamped_reason);
        let payload = close_payload(clamped_code, &clamped_reason);

        let mut inner = self.inner.lock().unwrap();
        if inner.state != ConnectionState::Open {
            return;
        }
        inner.state = ConnectionState::Closed;
        inner.status = ConnectionStatus {
            code: clamped_code,
            reason: clamped_reason,
            remotely: false,
            was_clean: false,
            error: None,
        };
        self.send_frame_unchecked(&mut inner, OpCode::Close, true, &payload);
        drop(inner);
        tracing::debug!(peer = %self.peer_addr, code = clamped_code, "close sent");
        self.schedule_forced_close();
    }

    /// shut the socket down immediately, with no closing handshake, marking
    /// the connection abnormally closed; used when an acceptor's
    /// `onAccept` rejects a connection (§4.7 "close the socket without
    /// starting" — no reader loop is ever run for it, so no `onOpen`/
    /// `onMessage`/`onClose` fire)
    pub(crate) fn shutdown_without_close_handshake(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = ConnectionState::Closed;
        let _ = self.shutdown_handle.shutdown(Shutdown::Both);
    }

    /// force the underlying socket closed after a grace period, to unblock
    /// a reader thread stuck waiting on the peer's close echo (§5)
    fn schedule_forced_close(&self) {
        let handle = self
            .shutdown_handle
            .try_clone()
            .expect("tcp stream handles are cheap to clone");
        let grace = self.params.handshake_so_timeout;
        let fired = self.forced_close_fired.clone();
        let peer = self.peer_addr;
        std::thread::spawn(move || {
            std::thread::sleep(grace);
            fired.store(true, Ordering::SeqCst);
            let _ = handle.shutdown(Shutdown::Both);
            tracing::warn!(peer = %peer, "forced socket close after close-handshake grace period");
        });
    }

    // ---- reading ------------------------------------------------------

    fn read_frame_blocking(&self) -> Result<(FrameHeader, Vec<u8>), WsError> {
        let mut inner = self.inner.lock().unwrap();
        let header = FrameHeader::read(&mut inner.stream)?;
        let payload = header.read_payload(&mut inner.stream)?;
        Ok((header, payload))
    }

    fn check_mask_direction(&self, masked: bool) -> Result<(), WsError> {
        if masked != self.role.must_mask_inbound() {
            return Err(ProtocolError::WrongMaskDirection.into());
        }
        Ok(())
    }

    /// record a terminal error locally (first writer wins, per I5) and
    /// best-effort send the matching CLOSE frame
    fn fail(&self, err: WsError) -> WsError {
        let code = err.close_code();
        tracing::warn!(peer = %self.peer_addr, code, error = %err, "closing connection due to protocol violation");
        let mut inner = self.inner.lock().unwrap();
        if inner.state == ConnectionState::Open {
            inner.state = ConnectionState::Closed;
            let reason = truncate_reason(&err.to_string());
            inner.status = ConnectionStatus {
                code,
                reason: reason.clone(),
                remotely: false,
                was_clean: false,
                error: Some(Arc::new(err.clone())),
            };
            let payload = close_payload(code, &reason);
            self.send_frame_unchecked(&mut inner, OpCode::Close, true, &payload);
        }
        err
    }

    fn fail_abnormal(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == ConnectionState::Open {
            inner.state = ConnectionState::Closed;
            inner.status = ConnectionStatus {
                code: close_code::ABNORMAL_CLOSURE,
                reason: String::new(),
                remotely: false,
                was_clean: false,
                error: None,
            };
        }
    }

    fn handle_read_timeout(&self, state: &mut ReaderState) -> Result<(), WsError> {
        if self.is_open() && self.params.ping_enabled && !state.ping_outstanding {
            state.ping_outstanding = true;
            self.send_frame_raw(OpCode::Ping, true, PING_PROBE_PAYLOAD)?;
            tracing::debug!(peer = %self.peer_addr, "idle timeout, keepalive ping sent");
            Ok(())
        } else {
            self.fail_abnormal();
            Err(WsError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "read timeout with no ping outstanding allowance",
            )))
        }
    }

    fn handle_inbound_close(&self, payload: &[u8]) -> Result<(), WsError> {
        let (peer_code, peer_reason) = decode_close_payload(payload)?;
        tracing::debug!(peer = %self.peer_addr, code = peer_code, "close received");
        let mut inner = self.inner.lock().unwrap();
        if inner.state == ConnectionState::Open {
            inner.state = ConnectionState::Closed;
            inner.status = ConnectionStatus {
                code: peer_code,
                reason: peer_reason,
                remotely: true,
                was_clean: true,
                error: None,
            };
            self.send_frame_unchecked(&mut inner, OpCode::Close, true, payload);
        } else {
            inner.status.was_clean = true;
        }
        Ok(())
    }

    /// read and locally dispatch exactly one inbound frame; may retry
    /// internally on a read timeout (sending a keepalive ping) before
    /// returning, per §4.4 "Read timeouts"
    fn read_and_dispatch_one_frame(&self, state: &mut ReaderState) -> Result<FrameOutcome, WsError> {
        loop {
            let (header, payload) = match self.read_frame_blocking() {
                Ok(v) => v,
                Err(WsError::Io(e)) if is_timeout(&e) => {
                    self.handle_read_timeout(state)?;
                    continue;
                }
                Err(e) => return Err(self.fail(e)),
            };

            if let Err(e) = self.check_mask_direction(header.masked) {
                return Err(self.fail(e));
            }

            match header.opcode {
                OpCode::Text | OpCode::Binary => {
                    if state.op_data.is_some() {
                        return Err(self.fail(ProtocolError::MessageAlreadyInProgress.into()));
                    }
                    state.op_data = Some(header.opcode);
                    state.message_len = payload.len();
                    if let Err(e) = self.enforce_message_cap(state, header.fin) {
                        return Err(e);
                    }
                    if header.fin {
                        state.op_data = None;
                    }
                    return Ok(FrameOutcome::NewMessage {
                        opcode: header.opcode,
                        fin: header.fin,
                        payload,
                    });
                }
                OpCode::Continuation => {
                    if state.op_data.is_none() {
                        return Err(self.fail(ProtocolError::UnexpectedContinuation.into()));
                    }
                    state.message_len += payload.len();
                    if let Err(e) = self.enforce_message_cap(state, header.fin) {
                        return Err(e);
                    }
                    if header.fin {
                        state.op_data = None;
                    }
                    return Ok(FrameOutcome::Continuation {
                        fin: header.fin,
                        payload,
                    });
                }
                OpCode::Close => {
                    self.handle_inbound_close(&payload)?;
                    return Ok(FrameOutcome::ConnectionClosed);
                }
                OpCode::Ping => {
                    if self.is_open() {
                        self.send_frame_raw(OpCode::Pong, true, &payload)?;
                    }
                    return Ok(FrameOutcome::ControlHandled);
                }
                OpCode::Pong => {
                    if !state.ping_outstanding || payload != PING_PROBE_PAYLOAD {
                        return Err(self.fail(ProtocolError::UnexpectedPong.into()));
                    }
                    state.ping_outstanding = false;
                    return Ok(FrameOutcome::ControlHandled);
                }
            }
        }
    }

    fn enforce_message_cap(&self, state: &mut ReaderState, current_fin: bool) -> Result<(), WsError> {
        if state.message_len <= self.params.max_message_length {
            return Ok(());
        }
        if !current_fin {
            self.drain_message_remainder();
        }
        state.op_data = None;
        self.close(close_code::MESSAGE_TOO_BIG, "message too big");
        Err(WsError::Protocol(ProtocolError::MessageTooBig(
            self.params.max_message_length,
        )))
    }

    fn drain_message_remainder(&self) {
        loop {
            match self.read_frame_blocking() {
                Ok((header, _payload)) if header.opcode == OpCode::Continuation => {
                    if header.fin {
                        return;
                    }
                }
                _ => return,
            }
        }
    }

    /// run the reader loop to completion, driving `handler` callbacks
    ///
    /// returns once the loop has terminated for any reason; the caller
    /// (the spawn site in `acceptor`/`endpoint`) is responsible for firing
    /// `on_close` with the final status snapshot. the socket is shut down
    /// on every exit path (success or exception, §5) via `_close_on_exit`'s
    /// `Drop`, since the loop below returns from several different points.
    pub(crate) fn run_reader_loop(self: &Arc<Self>, handler: &Arc<dyn ConnectionHandler>) {
        let span = tracing::info_span!("ws_conn", peer = %self.peer_addr, role = ?self.role, id = self.id);
        let _entered = span.enter();
        let _close_on_exit = ShutdownOnDrop(self);
        self.set_read_timeout(self.params.connection_so_timeout);
        let mut state = ReaderState::default();
        loop {
            match self.read_and_dispatch_one_frame(&mut state) {
                Ok(FrameOutcome::ControlHandled) => continue,
                Ok(FrameOutcome::ConnectionClosed) => return,
                Ok(FrameOutcome::Continuation { .. }) => {
                    // a bare continuation at top level means the previous
                    // message's MessageReader didn't consume it; treat as
                    // an internal error rather than silently dropping it
                    let err = self.fail(WsError::Internal(
                        "continuation frame observed outside message assembly".into(),
                    ));
                    self.report_error_if_not_eof(handler, &err);
                    return;
                }
                Ok(FrameOutcome::NewMessage { opcode, fin, payload }) => {
                    let is_text = opcode == OpCode::Text;
                    // a continuation pulled mid-message can fail (protocol
                    // violation, message-too-big); `fail`/`close` already ran
                    // by the time this closure returns the error, but the
                    // error itself would otherwise only reach the handler as
                    // an opaque `io::Error` through `Read`, never `onError`
                    let mid_message_error: std::cell::Cell<Option<WsError>> = std::cell::Cell::new(None);
                    {
                        let conn_ref: &Connection = self;
                        let state_ref = &mut state;
                        let error_slot = &mid_message_error;
                        let source = move || -> Result<(bool, Vec<u8>), WsError> {
                            loop {
                                match conn_ref.read_and_dispatch_one_frame(state_ref) {
                                    Ok(FrameOutcome::ControlHandled) => continue,
                                    Ok(FrameOutcome::ConnectionClosed) => return Ok((true, Vec::new())),
                                    Ok(FrameOutcome::Continuation { fin, payload }) => {
                                        return Ok((fin, payload))
                                    }
                                    Ok(FrameOutcome::NewMessage { .. }) => {
                                        let err: WsError = ProtocolError::MessageAlreadyInProgress.into();
                                        error_slot.set(Some(err.clone()));
                                        return Err(err);
                                    }
                                    Err(e) => {
                                        error_slot.set(Some(e.clone()));
                                        return Err(e);
                                    }
                                }
                            }
                        };
                        let mut reader = MessageReader::new(payload, fin, source);
                        let conn_for_handler = self.clone();
                        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                            handler.on_message(&conn_for_handler, &mut reader, is_text);
                        }));
                        drop(reader);
                        if outcome.is_err() {
                            tracing::error!("connection handler panicked in on_message");
                        }
                    }
                    if let Some(err) = mid_message_error.into_inner() {
                        self.report_error_if_not_eof(handler, &err);
                        return;
                    }
                    if !self.is_open() {
                        return;
                    }
                }
                Err(e) => {
                    self.report_error_if_not_eof(handler, &e);
                    return;
                }
            }
        }
    }

    fn report_error_if_not_eof(&self, handler: &Arc<dyn ConnectionHandler>, err: &WsError) {
        let is_eof = matches!(err, WsError::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof);
        if !is_eof {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                handler.on_error(self, err);
            }));
            if result.is_err() {
                tracing::error!("connection handler panicked in on_error");
            }
        }
        if !matches!(self.inner.lock().unwrap().state, ConnectionState::Closed) {
            self.fail_abnormal();
        }
    }
}

/// shuts the connection's socket down unconditionally when dropped,
/// regardless of which of `run_reader_loop`'s several return points fired
/// (§5 "on reader-loop exit, the socket is closed on all paths")
struct ShutdownOnDrop<'a>(&'a Connection);

impl Drop for ShutdownOnDrop<'_> {
    fn drop(&mut self) {
        let _ = self.0.shutdown_handle.shutdown(Shutdown::Both);
    }
}

fn is_timeout(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
    )
}

fn fill_buffer<R: Read>(source: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = source.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

fn close_payload(code: u16, reason: &str) -> Vec<u8> {
    if code == status::close_code::NO_STATUS {
        return Vec::new();
    }
    let mut payload = Vec::with_capacity(2 + reason.len());
    payload.extend_from_slice(&code.to_be_bytes());
    payload.extend_from_slice(reason.as_bytes());
    payload
}

fn decode_close_payload(payload: &[u8]) -> Result<(u16, String), WsError> {
    if payload.is_empty() {
        return Ok((close_code::NO_STATUS, String::new()));
    }
    if payload.len() == 1 {
        return Err(ProtocolError::InvalidCloseFramePayload(1).into());
    }
    let mut code_bytes = [0u8; 2];
    code_bytes.copy_from_slice(&payload[..2]);
    let code = u16::from_be_bytes(code_bytes);
    let valid = (1000..=1003).contains(&code) || (1007..=1011).contains(&code) || (3000..=4999).contains(&code);
    if !valid {
        return Err(ProtocolError::InvalidCloseCode(code).into());
    }
    let reason = std::str::from_utf8(&payload[2..])
        .map_err(|_| WsError::Protocol(ProtocolError::InvalidUtf8))?
        .to_string();
    Ok((code, reason))
}
