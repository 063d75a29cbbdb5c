//! process-wide facade: connect out, listen, and track every live
//! connection/acceptor for bulk shutdown (§4.7/§4.8)

use std::io;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use http::Uri;

use crate::acceptor::Acceptor;
use crate::connection::{Connection, PeerSource, Role};
use crate::errors::WsError;
use crate::handler::{AcceptorHandler, ConnectionHandler};
use crate::handshake;
use crate::params::ConnectionParams;
use crate::registry::Registry;
use crate::status::close_code;
use crate::stream::WsStream;
#[cfg(feature = "tls")]
use crate::stream::{self as stream_mod, ClientTrustProvider, ServerIdentityProvider};
#[cfg(feature = "tls")]
use rustls::pki_types::ServerName;

/// process-wide registry of every connection/acceptor spawned through
/// [`Endpoint`], used for [`Endpoint::close_all`]
#[derive(Default)]
pub struct Endpoint {
    connections: Arc<Registry<Connection>>,
    acceptors: Registry<Acceptor>,
}

impl Endpoint {
    pub fn new() -> Arc<Endpoint> {
        Arc::new(Endpoint::default())
    }

    /// connect to `uri` as a client; blocks until the opening handshake
    /// completes or fails, then runs the connection's reader loop on a new
    /// thread (§4.3 "client-initiated handshake")
    pub fn connect(
        self: &Arc<Self>,
        uri: &str,
        handler: Arc<dyn ConnectionHandler>,
        params: ConnectionParams,
    ) -> Result<Arc<Connection>, WsError> {
        let uri: Uri = uri
            .parse()
            .map_err(|e| WsError::InvalidUri(format!("{e}")))?;
        let scheme = uri.scheme_str().unwrap_or("ws");
        let secure = match scheme {
            "ws" => false,
            "wss" => true,
            other => return Err(WsError::InvalidUri(format!("unsupported scheme `{other}`"))),
        };
        #[cfg(not(feature = "tls"))]
        if secure {
            return Err(WsError::Tls("tls support not compiled in".into()));
        }

        let authority = uri
            .authority()
            .ok_or_else(|| WsError::InvalidUri("missing host".into()))?;
        let host = authority.host().to_string();
        let port = authority
            .port_u16()
            .unwrap_or(if secure { 443 } else { 80 });

        let addr = resolve_one(&host, port)?;
        let tcp = TcpStream::connect_timeout(&addr, params.handshake_so_timeout)
            .map_err(WsError::Io)?;
        let shutdown_handle = tcp.try_clone().map_err(WsError::Io)?;
        tcp.set_read_timeout(Some(params.handshake_so_timeout))
            .map_err(WsError::Io)?;

        let mut stream = if secure {
            self.wrap_tls_client(tcp, &host)?
        } else {
            WsStream::Plain(tcp)
        };

        let outcome = match handshake::client_handshake(&mut stream, &uri, &params.sub_protocols) {
            Ok(outcome) => outcome,
            Err(e) => {
                let failed = Connection::new(
                    stream,
                    shutdown_handle,
                    Role::Client,
                    addr,
                    uri.path().to_string(),
                    uri.query().map(str::to_string),
                    None,
                    params,
                );
                failed.mark_handshake_failed(&e);
                deliver_handshake_failure(&handler, &failed, &e);
                return Err(e);
            }
        };

        let conn = Connection::new(
            stream,
            shutdown_handle,
            Role::Client,
            addr,
            uri.path().to_string(),
            uri.query().map(str::to_string),
            outcome.subprotocol.clone(),
            params,
        );

        self.register_connection(&conn);
        conn.attach_peer_source(self.connections.clone() as Arc<dyn PeerSource>);
        conn.mark_open();

        let conn_for_thread = conn.clone();
        let handler_for_thread = handler.clone();
        let connections_for_thread = self.connections.clone();
        let subprotocol = outcome.subprotocol;
        std::thread::spawn(move || {
            let opened = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                handler_for_thread.on_open(&conn_for_thread, subprotocol.as_deref());
            }));
            if opened.is_err() {
                tracing::error!("connection handler panicked in on_open");
            }
            conn_for_thread.run_reader_loop(&handler_for_thread);
            connections_for_thread.remove(&conn_for_thread);
            let status = conn_for_thread.status();
            let closed = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                handler_for_thread.on_close(&conn_for_thread, &status);
            }));
            if closed.is_err() {
                tracing::error!("connection handler panicked in on_close");
            }
        });

        Ok(conn)
    }

    #[cfg(feature = "tls")]
    fn wrap_tls_client(&self, tcp: TcpStream, host: &str) -> Result<WsStream, WsError> {
        let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
            .map_err(|e| WsError::Tls(e.to_string()))?;
        stream_mod::wrap_client(tcp, server_name, self.default_trust().as_ref())
    }

    #[cfg(feature = "tls")]
    fn default_trust(&self) -> Arc<dyn ClientTrustProvider> {
        // a caller who needs custom trust roots builds the connection's
        // `rustls::ClientConfig` directly and calls `connect_with_tls`
        // instead; this path exists so `connect` never needs a provider
        // for the common native-roots case.
        Arc::new(crate::stream::NativeRootsTrust)
    }

    /// bind `addr` and spawn an [`Acceptor`] accepting connections on its
    /// own thread; `identity` is required when `secure` is set
    pub fn listen(
        self: &Arc<Self>,
        addr: SocketAddr,
        connection_handler: Arc<dyn ConnectionHandler>,
        acceptor_handler: Arc<dyn AcceptorHandler>,
        params: ConnectionParams,
        #[cfg(feature = "tls")] identity: Option<Arc<dyn ServerIdentityProvider>>,
    ) -> io::Result<Arc<Acceptor>> {
        let acceptor = Acceptor::bind(addr)?;
        self.register_acceptor(&acceptor);
        let acceptor_for_thread = acceptor.clone();
        std::thread::spawn(move || {
            acceptor_for_thread.run_accept_loop(
                connection_handler,
                acceptor_handler,
                params,
                #[cfg(feature = "tls")]
                identity,
            );
        });
        Ok(acceptor)
    }

    fn register_connection(&self, conn: &Arc<Connection>) {
        self.connections.push(conn);
    }

    fn register_acceptor(&self, acceptor: &Arc<Acceptor>) {
        self.acceptors.push(acceptor);
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections.snapshot()
    }

    pub fn acceptors(&self) -> Vec<Arc<Acceptor>> {
        self.acceptors.snapshot()
    }

    /// close every acceptor (stop accepting, GOING_AWAY to their
    /// connections) then every remaining directly-tracked connection
    ///
    /// safe to call concurrently with new connections arriving: any
    /// connection accepted after this snapshot is taken is simply missed,
    /// mirroring the underlying registries' best-effort semantics.
    pub fn close_all(&self, reason: &str) {
        for acceptor in self.acceptors() {
            acceptor.close(reason);
        }
        for conn in self.connections() {
            conn.close(close_code::GOING_AWAY, reason);
        }
    }
}

/// fire `onError` then `onClose` for a connection whose opening handshake
/// never succeeded (`onOpen` is skipped, per §4.4 "Event delivery")
pub(crate) fn deliver_handshake_failure(
    handler: &Arc<dyn ConnectionHandler>,
    conn: &Connection,
    err: &WsError,
) {
    let errored = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        handler.on_error(conn, err);
    }));
    if errored.is_err() {
        tracing::error!("connection handler panicked in on_error");
    }
    let status = conn.status();
    let closed = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        handler.on_close(conn, &status);
    }));
    if closed.is_err() {
        tracing::error!("connection handler panicked in on_close");
    }
}

fn resolve_one(host: &str, port: u16) -> Result<SocketAddr, WsError> {
    (host, port)
        .to_socket_addrs()
        .map_err(WsError::Io)?
        .next()
        .ok_or_else(|| WsError::InvalidUri(format!("could not resolve `{host}`")))
}

/// sentinel re-export so callers can spell out a per-call timeout without
/// reaching into `std::time` themselves
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
