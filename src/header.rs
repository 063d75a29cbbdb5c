//! HTTP/1.1 start-line + header codec used by the opening handshake (§4.1)
//!
//! header storage reuses `http::HeaderMap`, which already normalizes names
//! case-insensitively; this module adds the handshake-specific bits the
//! `http` crate doesn't do for us: reading a CRLF-terminated block off a
//! blocking stream with a line-length ceiling, and folding repeated/
//! comma-joined `Sec-WebSocket-Protocol` values into one ordered list.

use std::io::{Read, Write};

use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};

use crate::errors::{ProtocolError, WsError};

/// recommended ceiling from §4.1; guards against a peer that never sends
/// the terminating blank line.
pub const MAX_HEADER_BLOCK: usize = 8 * 1024;

/// read bytes up to and including the blank line that ends an HTTP/1.1
/// head, one byte at a time (handshakes are small and infrequent; there is
/// no need for a buffered reader shared with the frame codec).
pub fn read_head_block<R: Read>(reader: &mut R) -> Result<Vec<u8>, WsError> {
    let mut buf = Vec::with_capacity(512);
    let mut byte = [0u8; 1];
    loop {
        reader.read_exact(&mut byte)?;
        buf.push(byte[0]);
        if buf.len() > MAX_HEADER_BLOCK {
            return Err(ProtocolError::HeaderLineTooLong(MAX_HEADER_BLOCK).into());
        }
        if buf.ends_with(b"\r\n\r\n") {
            return Ok(buf);
        }
    }
}

/// a parsed request start line + headers
pub struct RequestHead {
    pub method: Method,
    pub target: String,
    pub headers: HeaderMap,
}

/// a parsed response start line + headers
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

fn build_header_map(raw: &[httparse::Header]) -> Result<HeaderMap, WsError> {
    let mut map = HeaderMap::with_capacity(raw.len());
    for header in raw {
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|e| WsError::HandshakeFailed(format!("invalid header name: {e}")))?;
        let value = HeaderValue::from_bytes(header.value)
            .map_err(|e| WsError::HandshakeFailed(format!("invalid header value: {e}")))?;
        map.append(name, value);
    }
    Ok(map)
}

/// parse an HTTP/1.1 request line + headers, terminated by a blank line
pub fn read_request<R: Read>(reader: &mut R) -> Result<RequestHead, WsError> {
    let block = read_head_block(reader)?;
    let mut raw_headers = [httparse::EMPTY_HEADER; 64];
    let mut req = httparse::Request::new(&mut raw_headers);
    req.parse(&block)
        .map_err(|e| WsError::HandshakeFailed(format!("malformed request: {e}")))?;
    let method = req
        .method
        .ok_or_else(|| WsError::HandshakeFailed("missing method".into()))?;
    let method = Method::from_bytes(method.as_bytes())
        .map_err(|_| WsError::HandshakeFailed(format!("invalid method {method}")))?;
    let target = req
        .path
        .ok_or_else(|| WsError::HandshakeFailed("missing request target".into()))?
        .to_string();
    let headers = build_header_map(req.headers)?;
    Ok(RequestHead {
        method,
        target,
        headers,
    })
}

/// parse an HTTP/1.1 status line + headers, terminated by a blank line
pub fn read_response<R: Read>(reader: &mut R) -> Result<ResponseHead, WsError> {
    let block = read_head_block(reader)?;
    let mut raw_headers = [httparse::EMPTY_HEADER; 64];
    let mut resp = httparse::Response::new(&mut raw_headers);
    resp.parse(&block)
        .map_err(|e| WsError::HandshakeFailed(format!("malformed response: {e}")))?;
    let code = resp
        .code
        .ok_or_else(|| WsError::HandshakeFailed("missing status code".into()))?;
    let status = StatusCode::from_u16(code)
        .map_err(|_| WsError::HandshakeFailed(format!("invalid status code {code}")))?;
    let headers = build_header_map(resp.headers)?;
    Ok(ResponseHead { status, headers })
}

/// case-insensitive single-value lookup
pub fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// case-insensitive header `name` present at all (e.g. `Upgrade: websocket`,
/// which may appear alongside other values in `Connection`)
pub fn header_contains_token(headers: &HeaderMap, name: &str, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|part| part.trim().eq_ignore_ascii_case(token))
}

/// fold every occurrence of `name` (repeated headers or one comma-joined
/// value, or both) into a single ordered, non-empty list
pub fn header_list(headers: &HeaderMap, name: &str) -> Vec<String> {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// write a request head: `METHOD target HTTP/1.1\r\n` + headers + blank line
pub fn write_request_head<W: Write>(
    writer: &mut W,
    method: &Method,
    target: &str,
    headers: &[(&str, String)],
) -> std::io::Result<()> {
    let mut out = format!("{method} {target} HTTP/1.1\r\n");
    for (name, value) in headers {
        out.push_str(name);
        out.push_str(": ");
        out.push_str(value);
        out.push_str("\r\n");
    }
    out.push_str("\r\n");
    writer.write_all(out.as_bytes())
}

/// write a response head: `HTTP/1.1 CODE reason\r\n` + headers + blank line
pub fn write_response_head<W: Write>(
    writer: &mut W,
    status: StatusCode,
    headers: &[(&str, String)],
) -> std::io::Result<()> {
    let reason = status.canonical_reason().unwrap_or("");
    let mut out = format!("HTTP/1.1 {} {}\r\n", status.as_u16(), reason);
    for (name, value) in headers {
        out.push_str(name);
        out.push_str(": ");
        out.push_str(value);
        out.push_str("\r\n");
    }
    out.push_str("\r\n");
    writer.write_all(out.as_bytes())
}
