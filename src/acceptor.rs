//! listening socket: accept loop, per-connection spawn, live registry (§4.7)

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};

use crate::connection::{Connection, PeerSource, Role};
use crate::errors::WsError;
use crate::handler::{AcceptorHandler, ConnectionHandler};
use crate::handshake;
use crate::params::ConnectionParams;
use crate::registry::Registry;
use crate::status::{close_code, ConnectionStatus};
use crate::stream::WsStream;
#[cfg(feature = "tls")]
use crate::stream::{self as stream_mod, ServerIdentityProvider};

/// a bound listening socket accepting WebSocket connections on its own thread
pub struct Acceptor {
    listener: TcpListener,
    local_addr: SocketAddr,
    registry: Arc<Registry<Connection>>,
    interrupted: Arc<std::sync::atomic::AtomicBool>,
    last_error: Mutex<Option<Arc<WsError>>>,
}

impl Acceptor {
    pub(crate) fn bind(addr: SocketAddr) -> io::Result<Arc<Acceptor>> {
        let listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;
        Ok(Arc::new(Acceptor {
            listener,
            local_addr,
            registry: Arc::new(Registry::default()),
            interrupted: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            last_error: Mutex::new(None),
        }))
    }

    /// bind address (§6 "getBindAddress")
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// bound port (§6 "getPort")
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn is_open(&self) -> bool {
        !self.is_interrupted()
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn error(&self) -> Option<Arc<WsError>> {
        self.last_error.lock().unwrap().clone()
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.registry.snapshot()
    }

    /// stop accepting new connections; connections already spawned run
    /// to their own natural conclusion (§4.7 "interrupt")
    pub fn interrupt(&self) {
        self.interrupted.store(true, std::sync::atomic::Ordering::SeqCst);
        // unblocks the accept() call parked in the acceptor thread
        if let Ok(local) = self.listener.local_addr() {
            let _ = TcpStream::connect(local);
        }
    }

    /// interrupt accepting and force-close every live connection with
    /// GOING_AWAY (§4.7 "close")
    pub fn close(&self, reason: &str) {
        self.interrupt();
        for conn in self.registry.snapshot() {
            conn.close(close_code::GOING_AWAY, reason);
        }
    }

    pub(crate) fn run_accept_loop(
        self: Arc<Self>,
        connection_handler: Arc<dyn ConnectionHandler>,
        acceptor_handler: Arc<dyn AcceptorHandler>,
        params: ConnectionParams,
        #[cfg(feature = "tls")] identity: Option<Arc<dyn ServerIdentityProvider>>,
    ) {
        let span = tracing::info_span!("ws_acceptor", bind = %self.local_addr);
        let _entered = span.enter();
        acceptor_handler.on_start();
        loop {
            if self.is_interrupted() {
                break;
            }
            match self.listener.accept() {
                Ok((tcp, peer_addr)) => {
                    if self.is_interrupted() {
                        break;
                    }
                    tracing::debug!(peer = %peer_addr, bind = %self.local_addr, "accepted socket");
                    let acceptor = self.clone();
                    let conn_handler = connection_handler.clone();
                    let acc_handler = acceptor_handler.clone();
                    let params = params.clone();
                    #[cfg(feature = "tls")]
                    let identity = identity.clone();
                    std::thread::spawn(move || {
                        serve_one(
                            acceptor,
                            tcp,
                            peer_addr,
                            conn_handler,
                            acc_handler,
                            params,
                            #[cfg(feature = "tls")]
                            identity,
                        );
                    });
                }
                Err(e) => {
                    tracing::warn!(bind = %self.local_addr, error = %e, "accept failed");
                    *self.last_error.lock().unwrap() = Some(Arc::new(WsError::Io(e)));
                    break;
                }
            }
        }
        self.interrupted.store(true, std::sync::atomic::Ordering::SeqCst);
        let err = self.last_error.lock().unwrap().clone();
        tracing::debug!(bind = %self.local_addr, clean = err.is_none(), "acceptor stopped");
        acceptor_handler.on_stop(err.as_deref());
    }
}

fn serve_one(
    acceptor: Arc<Acceptor>,
    tcp: TcpStream,
    peer_addr: SocketAddr,
    connection_handler: Arc<dyn ConnectionHandler>,
    acceptor_handler: Arc<dyn AcceptorHandler>,
    params: ConnectionParams,
    #[cfg(feature = "tls")] identity: Option<Arc<dyn ServerIdentityProvider>>,
) {
    let shutdown_handle = match tcp.try_clone() {
        Ok(h) => h,
        Err(e) => {
            tracing::debug!(peer = %peer_addr, error = %e, "could not clone accepted socket");
            return;
        }
    };
    let _ = tcp.set_read_timeout(Some(params.handshake_so_timeout));

    #[cfg(feature = "tls")]
    let wrapped = match identity {
        Some(id) => stream_mod::wrap_server(tcp, id.as_ref()),
        None => Ok(WsStream::Plain(tcp)),
    };
    #[cfg(not(feature = "tls"))]
    let wrapped: Result<WsStream, WsError> = Ok(WsStream::Plain(tcp));

    let mut wrapped = match wrapped {
        Ok(w) => w,
        Err(e) => {
            tracing::debug!(peer = %peer_addr, error = %e, "TLS setup failed before the opening handshake");
            return;
        }
    };

    let outcome = match handshake::server_handshake(&mut wrapped, &params.sub_protocols) {
        Ok(o) => o,
        Err(e) => {
            let failed = Connection::new(
                wrapped,
                shutdown_handle,
                Role::Server,
                peer_addr,
                String::new(),
                None,
                None,
                params,
            );
            failed.mark_handshake_failed(&e);
            crate::endpoint::deliver_handshake_failure(&connection_handler, &failed, &e);
            return;
        }
    };

    let conn = Connection::new(
        wrapped,
        shutdown_handle,
        Role::Server,
        peer_addr,
        outcome.path,
        outcome.query,
        outcome.subprotocol.clone(),
        params,
    );

    if !acceptor_handler.on_accept(&conn) {
        tracing::debug!(peer = %peer_addr, "connection rejected by onAccept");
        conn.shutdown_without_close_handshake();
        return;
    }

    acceptor.registry.push(&conn);
    conn.attach_peer_source(acceptor.registry.clone() as Arc<dyn PeerSource>);
    conn.mark_open();

    let open_result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        connection_handler.on_open(&conn, outcome.subprotocol.as_deref());
    }));
    if open_result.is_err() {
        tracing::error!("connection handler panicked in on_open");
    }

    conn.run_reader_loop(&connection_handler);
    acceptor.registry.remove(&conn);

    let status = conn.status();
    deliver_close(&connection_handler, &conn, &status);
}

fn deliver_close(handler: &Arc<dyn ConnectionHandler>, conn: &Connection, status: &ConnectionStatus) {
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        handler.on_close(conn, status);
    }));
    if result.is_err() {
        tracing::error!("connection handler panicked in on_close");
    }
}
