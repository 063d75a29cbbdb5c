//! per-connection configuration (§3 "Parameters")

use std::time::Duration;

/// tunables for one connection, built through [`ConnectionParamsBuilder`]
///
/// mirrors the crate's historical `ClientBuilder`/`ServerBuilder` chainable
/// setters, but collapsed into a single immutable value handed to a
/// connection at construction time rather than mutated afterward.
#[derive(Debug, Clone)]
pub struct ConnectionParams {
    pub handshake_so_timeout: Duration,
    pub connection_so_timeout: Duration,
    pub ping_enabled: bool,
    pub payload_buffer_length: usize,
    pub max_message_length: usize,
    pub sub_protocols: Vec<String>,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        ConnectionParams {
            handshake_so_timeout: Duration::from_secs(5),
            connection_so_timeout: Duration::from_secs(60),
            ping_enabled: true,
            payload_buffer_length: 32 * 1024,
            max_message_length: 8 * 1024 * 1024,
            sub_protocols: Vec::new(),
        }
    }
}

/// builder for [`ConnectionParams`]
#[derive(Debug, Clone, Default)]
pub struct ConnectionParamsBuilder {
    params: ConnectionParams,
}

impl ConnectionParamsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handshake_so_timeout(mut self, d: Duration) -> Self {
        self.params.handshake_so_timeout = d;
        self
    }

    pub fn connection_so_timeout(mut self, d: Duration) -> Self {
        self.params.connection_so_timeout = d;
        self
    }

    pub fn ping_enabled(mut self, enabled: bool) -> Self {
        self.params.ping_enabled = enabled;
        self
    }

    pub fn payload_buffer_length(mut self, bytes: usize) -> Self {
        self.params.payload_buffer_length = bytes;
        self
    }

    pub fn max_message_length(mut self, bytes: usize) -> Self {
        self.params.max_message_length = bytes;
        self
    }

    pub fn sub_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.params.sub_protocols.push(protocol.into());
        self
    }

    pub fn sub_protocols(mut self, protocols: Vec<String>) -> Self {
        self.params.sub_protocols = protocols;
        self
    }

    pub fn build(self) -> ConnectionParams {
        self.params
    }
}
