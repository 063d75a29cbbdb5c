//! opening handshake: client-initiating and server-accepting sides (§4.3)

use std::io::{Read, Write};

use base64::Engine;
use http::{StatusCode, Uri};
use sha1::{Digest, Sha1};

use crate::errors::{ProtocolError, WsError};
use crate::header::{
    header_contains_token, header_list, header_str, read_request, read_response,
    write_request_head, write_response_head,
};

const GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
const PROTOCOL_VERSION: &str = "13";

fn b64(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// compute `Sec-WebSocket-Accept` for a given client key (P3)
pub fn compute_accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(GUID.as_bytes());
    b64(&hasher.finalize())
}

fn generate_client_key() -> String {
    let raw: [u8; 16] = rand::random();
    b64(&raw)
}

/// outcome of a successful client-initiated handshake
pub struct ClientHandshakeOutcome {
    pub subprotocol: Option<String>,
}

/// perform the client side of the opening handshake over an already
/// connected, already TLS-wrapped-if-needed stream
///
/// `scheme`/`authority` are used to build `Host`/`Origin`; `uri` supplies
/// the request path and query.
pub fn client_handshake<S: Read + Write>(
    stream: &mut S,
    uri: &Uri,
    subprotocols: &[String],
) -> Result<ClientHandshakeOutcome, WsError> {
    let authority = uri
        .authority()
        .ok_or_else(|| WsError::InvalidUri("missing host".into()))?
        .as_str()
        .to_string();
    let scheme = uri.scheme_str().unwrap_or("ws");
    let origin_scheme = if scheme == "wss" { "https" } else { "http" };
    let key = generate_client_key();
    let expected_accept = compute_accept_key(&key);

    let target = uri
        .path_and_query()
        .map(|pq| pq.to_string())
        .unwrap_or_else(|| "/".to_string());

    let mut headers: Vec<(&str, String)> = vec![
        ("Host", authority.clone()),
        ("Origin", format!("{origin_scheme}://{authority}")),
        ("Upgrade", "websocket".to_string()),
        ("Connection", "Upgrade,keep-alive".to_string()),
        ("Sec-WebSocket-Key", key.clone()),
        ("Sec-WebSocket-Version", PROTOCOL_VERSION.to_string()),
        (
            "User-Agent",
            concat!("ws-endpoint/", env!("CARGO_PKG_VERSION")).to_string(),
        ),
    ];
    if !subprotocols.is_empty() {
        headers.push(("Sec-WebSocket-Protocol", subprotocols.join(", ")));
    }

    write_request_head(stream, &http::Method::GET, &target, &headers)?;

    let resp = read_response(stream)?;
    if resp.status != StatusCode::SWITCHING_PROTOCOLS {
        return Err(WsError::HandshakeFailed(format!(
            "expected 101 Switching Protocols, got {}",
            resp.status
        )));
    }
    let accept = header_str(&resp.headers, "Sec-WebSocket-Accept")
        .ok_or_else(|| WsError::HandshakeFailed("missing Sec-WebSocket-Accept".into()))?;
    if accept != expected_accept {
        return Err(WsError::HandshakeFailed(
            "Sec-WebSocket-Accept mismatch".into(),
        ));
    }

    let returned = header_str(&resp.headers, "Sec-WebSocket-Protocol").map(str::to_string);
    let subprotocol = match (&returned, subprotocols.is_empty()) {
        (None, true) => None,
        (Some(name), false) if subprotocols.iter().any(|p| p == name) => Some(name.clone()),
        _ => {
            return Err(WsError::HandshakeFailed(
                "server returned a subprotocol inconsistent with what was offered".into(),
            ))
        }
    };

    Ok(ClientHandshakeOutcome { subprotocol })
}

/// outcome of a successful server-accepting handshake
pub struct ServerHandshakeOutcome {
    pub path: String,
    pub query: Option<String>,
    pub subprotocol: Option<String>,
}

/// perform the server side of the opening handshake
///
/// `configured_subprotocols` is the server's advertised list, in priority
/// order; an empty slice means the server ignores the header entirely.
pub fn server_handshake<S: Read + Write>(
    stream: &mut S,
    configured_subprotocols: &[String],
) -> Result<ServerHandshakeOutcome, WsError> {
    let req = match read_request(stream) {
        Ok(req) => req,
        Err(e) => {
            reject(stream, "malformed request")?;
            return Err(e);
        }
    };

    if req.method != http::Method::GET {
        reject(stream, "expected GET")?;
        return Err(WsError::HandshakeFailed("expected GET".into()));
    }
    if !header_contains_token(&req.headers, "Upgrade", "websocket") {
        reject(stream, "missing Upgrade: websocket")?;
        return Err(WsError::HandshakeFailed(
            "missing Upgrade: websocket".into(),
        ));
    }
    let client_key = match header_str(&req.headers, "Sec-WebSocket-Key") {
        Some(k) => k.to_string(),
        None => {
            reject(stream, "missing Sec-WebSocket-Key")?;
            return Err(WsError::HandshakeFailed(
                "missing Sec-WebSocket-Key".into(),
            ));
        }
    };
    if !header_list(&req.headers, "Sec-WebSocket-Extensions").is_empty() {
        reject(stream, "extensions are not supported")?;
        return Err(ProtocolError::UnsupportedExtension.into());
    }

    let offered = header_list(&req.headers, "Sec-WebSocket-Protocol");
    let subprotocol = match (offered.is_empty(), configured_subprotocols.is_empty()) {
        (true, _) => None,
        (false, true) => None,
        (false, false) => {
            let chosen = offered
                .iter()
                .find(|p| configured_subprotocols.iter().any(|c| &c == p))
                .cloned();
            if chosen.is_none() {
                reject(stream, "no matching subprotocol")?;
                return Err(WsError::HandshakeFailed(
                    "no matching subprotocol".into(),
                ));
            }
            chosen
        }
    };

    let accept = compute_accept_key(&client_key);
    let mut headers: Vec<(&str, String)> = vec![
        ("Upgrade", "websocket".to_string()),
        ("Connection", "Upgrade,keep-alive".to_string()),
        ("Sec-WebSocket-Accept", accept),
        ("Sec-WebSocket-Version", PROTOCOL_VERSION.to_string()),
    ];
    if let Some(ref proto) = subprotocol {
        headers.push(("Sec-WebSocket-Protocol", proto.clone()));
    }
    write_response_head(stream, StatusCode::SWITCHING_PROTOCOLS, &headers)?;

    let (path, query) = split_target(&req.target);
    Ok(ServerHandshakeOutcome {
        path,
        query,
        subprotocol,
    })
}

fn split_target(target: &str) -> (String, Option<String>) {
    match target.split_once('?') {
        Some((path, query)) => (path.to_string(), Some(query.to_string())),
        None => (target.to_string(), None),
    }
}

fn reject<S: Write>(stream: &mut S, reason: &str) -> std::io::Result<()> {
    let headers = [("Connection", "close".to_string())];
    write_response_head(stream, StatusCode::BAD_REQUEST, &headers)?;
    tracing::debug!(reason, "rejected opening handshake");
    Ok(())
}
