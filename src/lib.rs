//! RFC 6455 WebSocket endpoint: framing, opening/closing handshake, and the
//! per-connection concurrency discipline (reader loop, synchronized writer,
//! keepalive ping, forced teardown) needed to run either role over plain TCP
//! or TLS.
//!
//! Extensions (permessage-deflate, ...) are not negotiated; a peer that
//! requests one is rejected with `UNSUPPORTED_EXTENSION`. HTTP routing
//! beyond the upgrade request, a CLI, and TLS key/trust material loading
//! from disk are this crate's embedder's job, not this crate's.

#![warn(missing_docs)]

pub use http;

/// server socket accept loop, per-connection spawn, live registry
pub mod acceptor;
/// per-connection state machine: reader loop, synchronized writer, control
/// protocol, close handshake, timeouts and ping
pub mod connection;
/// process-wide facade: connect out, listen, and bulk shutdown
pub mod endpoint;
/// typed error taxonomy and the mapping from error to close code
pub mod errors;
/// single WebSocket frame: header bit layout, parsing and serialization
pub mod frame;
/// application-facing handler traits
pub mod handler;
/// opening handshake: client-initiating and server-accepting sides
pub mod handshake;
/// HTTP/1.1 start-line + header codec used by the opening handshake
pub mod header;
/// XOR masking and the pluggable mask-key source
pub mod mask;
/// streaming reader over one reassembled inbound message
pub mod message;
/// per-connection configuration
pub mod params;
/// shared append/remove-under-lock registry backing the endpoint, acceptor,
/// and `Connection::list_connections`
pub(crate) mod registry;
/// connection close status and the reserved close-code table
pub mod status;
/// plain-or-TLS transport used by a connection
pub mod stream;

pub use acceptor::Acceptor;
pub use connection::{Connection, Role, PING_PROBE_PAYLOAD};
pub use endpoint::Endpoint;
pub use errors::{ProtocolError, WsError};
pub use frame::OpCode;
pub use handler::{AcceptorHandler, ConnectionHandler, NoopHandler};
pub use message::MessageReader;
pub use params::{ConnectionParams, ConnectionParamsBuilder};
pub use status::{close_code, ConnectionState, ConnectionStatus};
