//! websocket error definitions

use thiserror::Error;

/// low level framing/handshake protocol violation
///
/// these map to close codes through [`ProtocolError::close_code`]; they never
/// escape the reader loop on their own, only wrapped in [`WsError::Protocol`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("reserved bits set without a negotiated extension")]
    ReservedBitsSet,
    #[error("invalid opcode {0}")]
    InvalidOpcode(u8),
    #[error("fragmented control frame")]
    FragmentedControlFrame,
    #[error("control frame payload too large: {0} bytes")]
    ControlFrameTooBig(usize),
    #[error("continuation frame without a preceding data frame")]
    UnexpectedContinuation,
    #[error("data frame received while another message is still being assembled")]
    MessageAlreadyInProgress,
    #[error("frame masked in violation of the required direction")]
    WrongMaskDirection,
    #[error("unsolicited or mismatched pong payload")]
    UnexpectedPong,
    #[error("invalid close frame payload length {0}")]
    InvalidCloseFramePayload(usize),
    #[error("invalid close code {0}")]
    InvalidCloseCode(u16),
    #[error("payload is not valid utf-8")]
    InvalidUtf8,
    #[error("header line exceeds the {0} byte ceiling")]
    HeaderLineTooLong(usize),
    #[error("message exceeds configured maximum of {0} bytes")]
    MessageTooBig(usize),
    #[error("extension negotiation is not supported")]
    UnsupportedExtension,
}

impl ProtocolError {
    /// close code this violation maps to, per the connection status model
    pub fn close_code(&self) -> u16 {
        match self {
            ProtocolError::MessageTooBig(_) => 1009,
            ProtocolError::UnsupportedExtension | ProtocolError::ReservedBitsSet => 1010,
            _ => 1002,
        }
    }
}

/// errors during handshake, read/write frame
#[derive(Debug, Error)]
pub enum WsError {
    #[error("invalid uri `{0}`")]
    InvalidUri(String),
    #[error("opening handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("tls error: {0}")]
    Tls(String),
    #[error("operation invalid on a connection in state {0:?}")]
    NotOpen(crate::status::ConnectionState),
    #[error("internal error: {0}")]
    Internal(String),
}

impl Clone for WsError {
    /// `std::io::Error` isn't `Clone`; reconstructed from its kind and
    /// message, which is enough for `ConnectionStatus::error` (§3) to carry
    /// a copy of the error that tripped a close alongside the original that
    /// propagates to the caller.
    fn clone(&self) -> Self {
        match self {
            WsError::InvalidUri(s) => WsError::InvalidUri(s.clone()),
            WsError::HandshakeFailed(s) => WsError::HandshakeFailed(s.clone()),
            WsError::Protocol(p) => WsError::Protocol(p.clone()),
            WsError::Io(e) => WsError::Io(std::io::Error::new(e.kind(), e.to_string())),
            WsError::Tls(s) => WsError::Tls(s.clone()),
            WsError::NotOpen(s) => WsError::NotOpen(*s),
            WsError::Internal(s) => WsError::Internal(s.clone()),
        }
    }
}

impl WsError {
    /// close code an unhandled instance of this error should be reported with
    pub fn close_code(&self) -> u16 {
        match self {
            WsError::HandshakeFailed(_) => 1002,
            WsError::Protocol(p) => p.close_code(),
            WsError::Io(_) | WsError::Tls(_) => 1006,
            WsError::NotOpen(_) => 1006,
            WsError::Internal(_) => 1011,
            WsError::InvalidUri(_) => 1002,
        }
    }
}
