//! Which headers cross the proxy and which stay behind

use hyper::header::{
    HeaderMap, HeaderName, HeaderValue, ACCEPT_ENCODING, CONNECTION, CONTENT_LENGTH, HOST,
    SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_EXTENSIONS, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_PROTOCOL,
    SEC_WEBSOCKET_VERSION, TRAILER, UPGRADE,
};

/// Headers that only describe a single transport hop
pub const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

pub fn is_hop_by_hop(name: &HeaderName) -> bool {
    // `trailer` is the registered name; `trailers` is what clients actually send
    HOP_BY_HOP.contains(&name.as_str()) || name == TRAILER
}

/// Address a backend listens on
pub fn backend_authority(port: u16) -> String {
    format!("127.0.0.1:{}", port)
}

/// Prepare inbound request headers for the backend.
///
/// Drops hop-by-hop headers, `content-length` (the client recomputes it
/// from the body) and `accept-encoding` (compression is not negotiated on
/// the caller's behalf), then points `Host` at the backend.
pub fn prepare_request_headers(headers: &mut HeaderMap, port: u16) {
    remove_all(headers, |name| {
        is_hop_by_hop(name) || name == CONTENT_LENGTH || name == ACCEPT_ENCODING
    });
    // Always valid: digits, dots and a colon
    if let Ok(host) = HeaderValue::from_str(&backend_authority(port)) {
        headers.insert(HOST, host);
    }
}

/// Prepare backend response headers for the caller. Repeated names survive.
pub fn prepare_response_headers(headers: &mut HeaderMap) {
    remove_all(headers, |name| is_hop_by_hop(name) || name == CONTENT_LENGTH);
}

/// Headers worth replaying on the backend WebSocket handshake.
///
/// The handshake headers themselves are generated fresh for the backend
/// connection, and `Sec-WebSocket-Protocol` is negotiated separately.
pub fn websocket_forward_headers(headers: &HeaderMap) -> Vec<(HeaderName, HeaderValue)> {
    headers
        .iter()
        .filter(|(name, _)| {
            !is_hop_by_hop(name)
                && *name != HOST
                && *name != CONTENT_LENGTH
                && *name != SEC_WEBSOCKET_KEY
                && *name != SEC_WEBSOCKET_VERSION
                && *name != SEC_WEBSOCKET_EXTENSIONS
                && *name != SEC_WEBSOCKET_PROTOCOL
                && *name != SEC_WEBSOCKET_ACCEPT
        })
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

/// Subprotocols offered by the client, in preference order
pub fn offered_subprotocols(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(String::from)
        .collect()
}

/// Whether the request asks to switch to the WebSocket protocol
pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    let connection_upgrade = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));

    let upgrade_websocket = headers
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);

    connection_upgrade && upgrade_websocket
}

fn remove_all(headers: &mut HeaderMap, should_drop: impl Fn(&HeaderName) -> bool) {
    let doomed: Vec<HeaderName> = headers.keys().filter(|name| should_drop(name)).cloned().collect();
    for name in doomed {
        headers.remove(&name);
    }
}
