//! plain-or-TLS transport used by a connection
//!
//! mirrors the crate's historical `WsStream` enum (plain vs. rustls-wrapped
//! socket), kept to the synchronous `std::net::TcpStream` world since the
//! connection's concurrency model (§5) is thread-per-connection with
//! blocking reads, not `tokio`.

use std::io::{self, Read, Write};
use std::net::TcpStream;

#[cfg(feature = "tls")]
use rustls::{ClientConnection, ServerConnection, StreamOwned};

/// narrow interface for loading a server's TLS identity (§6 "TLS material")
///
/// the file format and storage are outside this crate's scope; callers
/// supply a fully-built `rustls::ServerConfig`.
#[cfg(feature = "tls")]
pub trait ServerIdentityProvider: Send + Sync {
    fn server_config(&self) -> std::sync::Arc<rustls::ServerConfig>;
}

/// narrow interface for loading a client's trust roots (§6 "TLS material")
#[cfg(feature = "tls")]
pub trait ClientTrustProvider: Send + Sync {
    fn client_config(&self) -> std::sync::Arc<rustls::ClientConfig>;
}

/// trust provider backed by the Mozilla root program, via `webpki-roots`
///
/// the default used by [`crate::Endpoint::connect`] when a caller doesn't
/// need a custom `rustls::ClientConfig` (private CAs, client certs, ...).
#[cfg(feature = "tls")]
pub struct NativeRootsTrust;

#[cfg(feature = "tls")]
impl ClientTrustProvider for NativeRootsTrust {
    fn client_config(&self) -> std::sync::Arc<rustls::ClientConfig> {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        std::sync::Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth(),
        )
    }
}

/// a connection's transport: a plain TCP socket or one wrapped in TLS
pub enum WsStream {
    Plain(TcpStream),
    #[cfg(feature = "tls")]
    TlsClient(StreamOwned<ClientConnection, TcpStream>),
    #[cfg(feature = "tls")]
    TlsServer(StreamOwned<ServerConnection, TcpStream>),
}

impl WsStream {
    pub fn is_secure(&self) -> bool {
        match self {
            WsStream::Plain(_) => false,
            #[cfg(feature = "tls")]
            WsStream::TlsClient(_) | WsStream::TlsServer(_) => true,
        }
    }

    /// underlying TCP socket, used for setting read timeouts and for the
    /// independent shutdown handle described in §5
    pub fn tcp(&self) -> &TcpStream {
        match self {
            WsStream::Plain(s) => s,
            #[cfg(feature = "tls")]
            WsStream::TlsClient(s) => s.get_ref(),
            #[cfg(feature = "tls")]
            WsStream::TlsServer(s) => s.get_ref(),
        }
    }
}

impl Read for WsStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            WsStream::Plain(s) => s.read(buf),
            #[cfg(feature = "tls")]
            WsStream::TlsClient(s) => s.read(buf),
            #[cfg(feature = "tls")]
            WsStream::TlsServer(s) => s.read(buf),
        }
    }
}

impl Write for WsStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            WsStream::Plain(s) => s.write(buf),
            #[cfg(feature = "tls")]
            WsStream::TlsClient(s) => s.write(buf),
            #[cfg(feature = "tls")]
            WsStream::TlsServer(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            WsStream::Plain(s) => s.flush(),
            #[cfg(feature = "tls")]
            WsStream::TlsClient(s) => s.flush(),
            #[cfg(feature = "tls")]
            WsStream::TlsServer(s) => s.flush(),
        }
    }
}

#[cfg(feature = "tls")]
pub(crate) fn wrap_client(
    tcp: TcpStream,
    server_name: rustls::pki_types::ServerName<'static>,
    trust: &dyn ClientTrustProvider,
) -> Result<WsStream, crate::errors::WsError> {
    let conn = ClientConnection::new(trust.client_config(), server_name)
        .map_err(|e| crate::errors::WsError::Tls(e.to_string()))?;
    Ok(WsStream::TlsClient(StreamOwned::new(conn, tcp)))
}

#[cfg(feature = "tls")]
pub(crate) fn wrap_server(
    tcp: TcpStream,
    identity: &dyn ServerIdentityProvider,
) -> Result<WsStream, crate::errors::WsError> {
    let conn = ServerConnection::new(identity.server_config())
        .map_err(|e| crate::errors::WsError::Tls(e.to_string()))?;
    Ok(WsStream::TlsServer(StreamOwned::new(conn, tcp)))
}
