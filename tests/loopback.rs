//! end-to-end client/server exercises over a real loopback TCP socket
//!
//! these are the crate's only tests that span more than one module: they
//! drive a client `Connection` and a server `Connection` against each other
//! through the public `Endpoint` facade, the way an embedder would.

use std::io::Read;
use std::net::{SocketAddr, TcpListener};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use ws_endpoint::{
    close_code, handshake, AcceptorHandler, Connection, ConnectionHandler, ConnectionParamsBuilder,
    Endpoint, MessageReader, WsError,
};

/// binds a raw listener that completes exactly one opening handshake as a
/// server, then holds the socket open without ever reading or writing
/// again — a peer that goes silent, for exercising scenarios 5 and 6 which
/// depend on the *local* side timing out rather than on any peer behavior
fn spawn_silent_peer() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    std::thread::spawn(move || {
        let (mut socket, _) = listener.accept().expect("accept one connection");
        handshake::server_handshake(&mut socket, &[]).expect("server handshake should succeed");
        // keep the socket alive without servicing it further
        loop {
            std::thread::sleep(Duration::from_secs(60));
        }
    });
    addr
}

/// forwards every handler callback onto a channel so the test thread can
/// assert on the sequence without racing the reader thread
enum Event {
    Open(Option<String>),
    Message { text: String, is_text: bool },
    Error(String),
    Close { code: u16, reason: String, remotely: bool, was_clean: bool },
}

struct ChannelHandler {
    tx: mpsc::Sender<Event>,
}

impl ConnectionHandler for ChannelHandler {
    fn on_open(&self, _conn: &Connection, subprotocol: Option<&str>) {
        let _ = self.tx.send(Event::Open(subprotocol.map(str::to_string)));
    }

    fn on_message(&self, _conn: &Connection, reader: &mut MessageReader, is_text: bool) {
        let mut buf = Vec::new();
        let _ = reader.read_to_end(&mut buf);
        let text = String::from_utf8_lossy(&buf).into_owned();
        let _ = self.tx.send(Event::Message { text, is_text });
    }

    fn on_error(&self, _conn: &Connection, error: &WsError) {
        let _ = self.tx.send(Event::Error(error.to_string()));
    }

    fn on_close(&self, _conn: &Connection, status: &ws_endpoint::ConnectionStatus) {
        let _ = self.tx.send(Event::Close {
            code: status.code,
            reason: status.reason.clone(),
            remotely: status.remotely,
            was_clean: status.was_clean,
        });
    }
}

struct EchoOnOpen;

impl ConnectionHandler for EchoOnOpen {
    fn on_message(&self, conn: &Connection, reader: &mut MessageReader, is_text: bool) {
        let mut buf = Vec::new();
        let _ = reader.read_to_end(&mut buf);
        if is_text {
            let _ = conn.send_text(&String::from_utf8_lossy(&buf));
        } else {
            let _ = conn.send_binary(&buf);
        }
    }
}

struct CloseOnOpen {
    code: u16,
    reason: &'static str,
}

impl ConnectionHandler for CloseOnOpen {
    fn on_open(&self, conn: &Connection, _subprotocol: Option<&str>) {
        conn.close(self.code, self.reason);
    }
}

struct AcceptAll;
impl AcceptorHandler for AcceptAll {}

fn start_echo_server(endpoint: &Arc<Endpoint>) -> SocketAddr {
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let acceptor = endpoint
        .listen(
            addr,
            Arc::new(EchoOnOpen),
            Arc::new(AcceptAll),
            ConnectionParamsBuilder::new()
                .connection_so_timeout(Duration::from_secs(5))
                .build(),
            #[cfg(feature = "tls")]
            None,
        )
        .expect("bind loopback listener");
    acceptor.local_addr()
}

fn recv(rx: &mpsc::Receiver<Event>) -> Event {
    rx.recv_timeout(Duration::from_secs(5))
        .expect("expected an event within the timeout")
}

/// surfaces the crate's `tracing` events on stderr when a test fails
/// (`cargo test -- --nocapture`); idempotent across the many `#[test]` fns
/// in this file, each of which runs on its own thread
fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}

#[test]
fn client_sends_text_server_echoes_back() {
    init_tracing();
    let endpoint = Endpoint::new();
    let addr = start_echo_server(&endpoint);

    let (tx, rx) = mpsc::channel();
    let handler = Arc::new(ChannelHandler { tx });
    let conn = endpoint
        .connect(
            &format!("ws://{addr}/chat"),
            handler,
            ConnectionParamsBuilder::new().build(),
        )
        .expect("client handshake should succeed");

    assert!(matches!(recv(&rx), Event::Open(None)));

    conn.send_text("hello").unwrap();
    match recv(&rx) {
        Event::Message { text, is_text } => {
            assert_eq!(text, "hello");
            assert!(is_text);
        }
        _ => panic!("expected an echoed message"),
    }

    conn.close(1000, "bye");
    match recv(&rx) {
        Event::Close { code, was_clean, .. } => {
            assert_eq!(code, 1000);
            assert!(was_clean);
        }
        _ => panic!("expected a clean close"),
    }
}

/// end-to-end scenario 2: the server initiates the close; the client's
/// `onClose` sees the server's code/reason with `remotely = true`
#[test]
fn server_initiated_close_delivers_remote_status_to_client() {
    init_tracing();
    let endpoint = Endpoint::new();
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let acceptor = endpoint
        .listen(
            addr,
            Arc::new(CloseOnOpen { code: 1000, reason: "bye" }),
            Arc::new(AcceptAll),
            ConnectionParamsBuilder::new().build(),
            #[cfg(feature = "tls")]
            None,
        )
        .unwrap();

    let (tx, rx) = mpsc::channel();
    let handler = Arc::new(ChannelHandler { tx });
    let _conn = endpoint
        .connect(
            &format!("ws://{}/", acceptor.local_addr()),
            handler,
            ConnectionParamsBuilder::new().build(),
        )
        .unwrap();

    assert!(matches!(recv(&rx), Event::Open(_)));
    match recv(&rx) {
        Event::Close { code, reason, remotely, was_clean } => {
            assert_eq!(code, 1000);
            assert_eq!(reason, "bye");
            assert!(remotely);
            assert!(was_clean);
        }
        _ => panic!("expected onClose delivered from the server's close"),
    }
}

#[test]
fn subprotocol_is_negotiated_when_offered_and_supported() {
    init_tracing();
    let endpoint = Endpoint::new();
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let acceptor = endpoint
        .listen(
            addr,
            Arc::new(EchoOnOpen),
            Arc::new(AcceptAll),
            ConnectionParamsBuilder::new()
                .sub_protocol("chat")
                .build(),
            #[cfg(feature = "tls")]
            None,
        )
        .unwrap();

    let (tx, rx) = mpsc::channel();
    let handler = Arc::new(ChannelHandler { tx });
    let _conn = endpoint
        .connect(
            &format!("ws://{}/", acceptor.local_addr()),
            handler,
            ConnectionParamsBuilder::new()
                .sub_protocol("chat")
                .build(),
        )
        .expect("handshake should succeed with a matching subprotocol");

    match recv(&rx) {
        Event::Open(subprotocol) => assert_eq!(subprotocol.as_deref(), Some("chat")),
        _ => panic!("expected onOpen"),
    }
}

/// end-to-end scenario 1: subprotocol mismatch closes with PROTOCOL_ERROR
/// and never fires `onOpen`
#[test]
fn subprotocol_mismatch_fails_the_handshake() {
    init_tracing();
    let endpoint = Endpoint::new();
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let acceptor = endpoint
        .listen(
            addr,
            Arc::new(EchoOnOpen),
            Arc::new(AcceptAll),
            ConnectionParamsBuilder::new()
                .sub_protocol("chat")
                .build(),
            #[cfg(feature = "tls")]
            None,
        )
        .unwrap();

    let (tx, rx) = mpsc::channel();
    let handler = Arc::new(ChannelHandler { tx });
    let result = endpoint.connect(
        &format!("ws://{}/", acceptor.local_addr()),
        handler,
        ConnectionParamsBuilder::new()
            .sub_protocol("superChat")
            .build(),
    );
    assert!(result.is_err());

    // onError then onClose, never onOpen, per §4.4 "Event delivery"
    match recv(&rx) {
        Event::Error(_) => {}
        _ => panic!("expected onError for the failed handshake"),
    }
    match recv(&rx) {
        Event::Close { code, remotely, .. } => {
            assert_eq!(code, close_code::PROTOCOL_ERROR);
            assert!(!remotely);
        }
        _ => panic!("expected onClose for the failed handshake"),
    }
}

/// end-to-end scenario 3: an oversize close reason is truncated to 123
/// UTF-8 bytes before it reaches the wire
#[test]
fn oversize_close_reason_is_truncated() {
    init_tracing();
    let endpoint = Endpoint::new();
    let addr = start_echo_server(&endpoint);

    let (tx, rx) = mpsc::channel();
    let handler = Arc::new(ChannelHandler { tx });
    let conn = endpoint
        .connect(
            &format!("ws://{addr}/"),
            handler,
            ConnectionParamsBuilder::new().build(),
        )
        .unwrap();
    assert!(matches!(recv(&rx), Event::Open(_)));

    let long_reason = "X".repeat(200);
    conn.close(1000, &long_reason);
    match recv(&rx) {
        Event::Close { code, .. } => assert_eq!(code, 1000),
        _ => panic!("expected onClose"),
    }
    // the peer's own status is asserted at the unit level (status::truncate_reason);
    // this test only confirms the round trip doesn't hang or error.
}

/// §6 introspection API: peer host/port and `listConnections` see the other
/// live connection sharing the same acceptor, but never list themselves
#[test]
fn list_connections_excludes_self_and_reports_peer_address() {
    init_tracing();
    let endpoint = Endpoint::new();
    let addr = start_echo_server(&endpoint);

    let (tx_a, rx_a) = mpsc::channel();
    let conn_a = endpoint
        .connect(
            &format!("ws://{addr}/"),
            Arc::new(ChannelHandler { tx: tx_a }),
            ConnectionParamsBuilder::new().build(),
        )
        .unwrap();
    assert!(matches!(recv(&rx_a), Event::Open(_)));

    let (tx_b, rx_b) = mpsc::channel();
    let conn_b = endpoint
        .connect(
            &format!("ws://{addr}/"),
            Arc::new(ChannelHandler { tx: tx_b }),
            ConnectionParamsBuilder::new().build(),
        )
        .unwrap();
    assert!(matches!(recv(&rx_b), Event::Open(_)));

    assert_eq!(conn_a.peer_host(), addr.ip().to_string());
    assert_eq!(conn_a.port(), addr.port());

    // both were dialed through the same endpoint, so each sees the other as
    // its sole peer in the endpoint's client-side registry, never itself
    let peers_of_a = conn_a.list_connections();
    assert_eq!(peers_of_a.len(), 1);
    assert!(Arc::ptr_eq(&peers_of_a[0], &conn_b));

    let peers_of_b = conn_b.list_connections();
    assert_eq!(peers_of_b.len(), 1);
    assert!(Arc::ptr_eq(&peers_of_b[0], &conn_a));

    conn_a.close(1000, "done");
    conn_b.close(1000, "done");
    recv(&rx_a);
    recv(&rx_b);
}

/// §6 introspection API on the acceptor side: a server connection's
/// `listConnections` sees its sibling accepted by the same acceptor
#[test]
fn server_side_list_connections_sees_sibling_accepted_connections() {
    init_tracing();
    let endpoint = Endpoint::new();
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let acceptor = endpoint
        .listen(
            addr,
            Arc::new(EchoOnOpen),
            Arc::new(AcceptAll),
            ConnectionParamsBuilder::new().build(),
            #[cfg(feature = "tls")]
            None,
        )
        .unwrap();
    assert_eq!(acceptor.port(), acceptor.local_addr().port());
    assert!(acceptor.is_open());
    assert!(!acceptor.is_interrupted());

    let (tx1, rx1) = mpsc::channel();
    let _conn1 = endpoint
        .connect(
            &format!("ws://{}/", acceptor.local_addr()),
            Arc::new(ChannelHandler { tx: tx1 }),
            ConnectionParamsBuilder::new().build(),
        )
        .unwrap();
    assert!(matches!(recv(&rx1), Event::Open(_)));

    let (tx2, rx2) = mpsc::channel();
    let _conn2 = endpoint
        .connect(
            &format!("ws://{}/", acceptor.local_addr()),
            Arc::new(ChannelHandler { tx: tx2 }),
            ConnectionParamsBuilder::new().build(),
        )
        .unwrap();
    assert!(matches!(recv(&rx2), Event::Open(_)));

    // the client side's onOpen can fire slightly before the acceptor thread
    // finishes registering its accepted socket; poll briefly rather than
    // assume a fixed ordering between the two independent handshake threads
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    let accepted = loop {
        let accepted = acceptor.connections();
        if accepted.len() == 2 || std::time::Instant::now() > deadline {
            break accepted;
        }
        std::thread::sleep(Duration::from_millis(20));
    };
    assert_eq!(accepted.len(), 2);
    for conn in &accepted {
        let peers = conn.list_connections();
        assert_eq!(peers.len(), 1);
        assert!(!Arc::ptr_eq(&peers[0], conn));
    }

    acceptor.close("shutting down");
}

/// end-to-end scenario 5: an idle connection pings once, then closes with
/// ABNORMAL_CLOSURE when the peer never answers the ping
#[test]
fn idle_ping_goes_unanswered_then_closes_abnormally() {
    init_tracing();
    let addr = spawn_silent_peer();
    let endpoint = Endpoint::new();

    let (tx, rx) = mpsc::channel();
    let handler = Arc::new(ChannelHandler { tx });
    let _conn = endpoint
        .connect(
            &format!("ws://{addr}/"),
            handler,
            ConnectionParamsBuilder::new()
                .connection_so_timeout(Duration::from_millis(150))
                .ping_enabled(true)
                .build(),
        )
        .unwrap();
    assert!(matches!(recv(&rx), Event::Open(_)));

    // first idle timeout sends a PING and keeps the loop going (no event);
    // the second, with the ping still outstanding, aborts the connection
    match recv(&rx) {
        Event::Error(_) => {}
        _ => panic!("expected onError for the unanswered ping"),
    }
    match recv(&rx) {
        Event::Close { code, was_clean, .. } => {
            assert_eq!(code, close_code::ABNORMAL_CLOSURE);
            assert!(!was_clean);
        }
        _ => panic!("expected onClose with ABNORMAL_CLOSURE"),
    }
}

/// end-to-end scenario 6: a local `close()` whose peer never echoes CLOSE
/// is force-closed by the background timer after `handshakeSoTimeout`
#[test]
fn forced_close_fires_after_grace_period_when_peer_stays_silent() {
    init_tracing();
    let addr = spawn_silent_peer();
    let endpoint = Endpoint::new();

    let (tx, rx) = mpsc::channel();
    let handler = Arc::new(ChannelHandler { tx });
    let conn = endpoint
        .connect(
            &format!("ws://{addr}/"),
            handler,
            ConnectionParamsBuilder::new()
                .handshake_so_timeout(Duration::from_millis(150))
                .ping_enabled(false)
                .build(),
        )
        .unwrap();
    assert!(matches!(recv(&rx), Event::Open(_)));

    conn.close(1000, "");
    match recv(&rx) {
        Event::Close { code, was_clean, .. } => {
            assert_eq!(code, 1000);
            assert!(!was_clean);
        }
        _ => panic!("expected onClose once the grace period's forced shutdown lands"),
    }
    assert!(conn.forced_close_fired());
}

/// end-to-end scenario 4: a message over `maxMessageLength` is aborted with
/// MESSAGE_TOO_BIG after the remainder is drained
#[test]
fn oversize_message_closes_with_message_too_big() {
    init_tracing();
    let endpoint = Endpoint::new();
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    // server template params don't matter here; the cap that fires is the
    // *client's* own maxMessageLength, enforced on what it reads back.
    let acceptor = endpoint
        .listen(
            addr,
            Arc::new(EchoOnOpen),
            Arc::new(AcceptAll),
            ConnectionParamsBuilder::new().build(),
            #[cfg(feature = "tls")]
            None,
        )
        .unwrap();

    let (tx, rx) = mpsc::channel();
    let handler = Arc::new(ChannelHandler { tx });
    let conn = endpoint
        .connect(
            &format!("ws://{}/", acceptor.local_addr()),
            handler,
            ConnectionParamsBuilder::new()
                .max_message_length(1000)
                .build(),
        )
        .unwrap();
    assert!(matches!(recv(&rx), Event::Open(_)));

    // the server echoes back whatever it receives; send 2000 bytes so the
    // echoed reply trips the client's 1000-byte cap
    let oversized = vec![b'a'; 2000];
    conn.send_binary(&oversized).unwrap();

    loop {
        match recv(&rx) {
            Event::Error(_) => continue,
            Event::Close { code, .. } => {
                assert_eq!(code, close_code::MESSAGE_TOO_BIG);
                break;
            }
            other => panic!("unexpected event before close: {}", matches!(other, Event::Message { .. })),
        }
    }
}

/// (I6) "a Connection is registered in exactly one registry list for the
/// duration it holds the socket" — a connection whose reader loop has
/// already returned must stop appearing in registry snapshots even while
/// the application still holds its `Arc<Connection>` handle, since that's
/// the ordinary way to read `.status()` after close completes
#[test]
fn closed_connection_drops_out_of_registry_snapshots_while_still_held() {
    init_tracing();
    let endpoint = Endpoint::new();
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let acceptor = endpoint
        .listen(
            addr,
            Arc::new(EchoOnOpen),
            Arc::new(AcceptAll),
            ConnectionParamsBuilder::new().build(),
            #[cfg(feature = "tls")]
            None,
        )
        .unwrap();

    let (tx, rx) = mpsc::channel();
    let handler = Arc::new(ChannelHandler { tx });
    let conn = endpoint
        .connect(
            &format!("ws://{}/", acceptor.local_addr()),
            handler,
            ConnectionParamsBuilder::new().build(),
        )
        .unwrap();
    assert!(matches!(recv(&rx), Event::Open(_)));
    assert_eq!(endpoint.connections().len(), 1);

    conn.close(1000, "done");
    assert!(matches!(recv(&rx), Event::Close { .. }));

    // `conn` (and the acceptor's own `Arc<Connection>`, which this test
    // never touches directly) are both still alive; only explicit
    // `Registry::remove` on reader-loop exit — not reference counting —
    // can be responsible for the registries going empty here.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        if endpoint.connections().is_empty() && acceptor.connections().is_empty() {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "registries still report the closed connection"
        );
        std::thread::sleep(Duration::from_millis(20));
    }

    assert!(conn.status().code == 1000 || !conn.is_open());
}
