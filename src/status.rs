//! connection close status and the reserved close-code table

/// connection lifecycle state, independent of the close code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// socket accepted/connected, handshake not complete
    Connecting,
    /// handshake complete, `onOpen` has fired
    Open,
    /// local or remote side has initiated or completed closure
    Closed,
}

/// reserved close codes from §3 / RFC 6455 §7.4
pub mod close_code {
    pub const NOT_YET_OPEN: u16 = 0;
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const PROTOCOL_ERROR: u16 = 1002;
    pub const UNSUPPORTED_DATA: u16 = 1003;
    pub const NO_STATUS: u16 = 1005;
    pub const ABNORMAL_CLOSURE: u16 = 1006;
    pub const MESSAGE_TOO_BIG: u16 = 1009;
    pub const UNSUPPORTED_EXTENSION: u16 = 1010;
    pub const INTERNAL_ERROR: u16 = 1011;
}

/// clamp an application-specified close code per (I5)/P4
///
/// codes outside `[1000, 4999]` are replaced by [`close_code::NO_STATUS`]
/// and any reason is dropped, since such a code cannot be put on the wire.
pub fn clamp_close_code(code: u16, reason: &str) -> (u16, String) {
    if (1000..=4999).contains(&code) {
        (code, reason.to_string())
    } else {
        (close_code::NO_STATUS, String::new())
    }
}

/// truncate `reason` to at most 123 UTF-8 bytes, respecting char boundaries (P5)
pub fn truncate_reason(reason: &str) -> String {
    if reason.len() <= 123 {
        return reason.to_string();
    }
    let mut end = 123;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    reason[..end].to_string()
}

/// terminal or in-flight status of a connection
///
/// cloned for lock-free snapshots per §5; the authoritative copy lives
/// behind the connection's lock and is write-once per field after `code`
/// leaves `NOT_YET_OPEN`/`IS_OPEN`, per (I5).
#[derive(Debug, Clone)]
pub struct ConnectionStatus {
    pub code: u16,
    pub reason: String,
    pub remotely: bool,
    pub was_clean: bool,
    pub error: Option<std::sync::Arc<crate::errors::WsError>>,
}

impl ConnectionStatus {
    /// the not-yet-open sentinel; never valid on the wire
    pub fn not_yet_open() -> Self {
        ConnectionStatus {
            code: close_code::NOT_YET_OPEN,
            reason: String::new(),
            remotely: false,
            was_clean: false,
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_rejects_out_of_range_codes() {
        let (code, reason) = clamp_close_code(5001, "ignored");
        assert_eq!(code, close_code::NO_STATUS);
        assert_eq!(reason, "");

        let (code, reason) = clamp_close_code(999, "ignored");
        assert_eq!(code, close_code::NO_STATUS);
        assert_eq!(reason, "");
    }

    #[test]
    fn clamp_keeps_in_range_codes() {
        let (code, reason) = clamp_close_code(4000, "kept");
        assert_eq!(code, 4000);
        assert_eq!(reason, "kept");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let reason: String = std::iter::repeat('X').take(200).collect();
        let truncated = truncate_reason(&reason);
        assert_eq!(truncated.len(), 123);

        // a reason whose 123rd byte would split a multi-byte char
        let reason: String = std::iter::repeat('é').take(100).collect(); // 2 bytes each
        let truncated = truncate_reason(&reason);
        assert!(truncated.len() <= 123);
        assert!(truncated.is_char_boundary(truncated.len()));
    }
}
