//! WebSocket bridge between a browser and its session backend
//!
//! The browser side is upgraded in place by hyper; the backend side is a
//! fresh HTTP/1.1 upgrade on a new loopback connection. Both ends are then
//! driven as tungstenite streams and frames are relayed in both directions
//! without interpretation.

use crate::error::{CLOSE_SESSION_EXPIRED, CLOSE_TRY_AGAIN_LATER};
use crate::headers::{backend_authority, offered_subprotocols, websocket_forward_headers};
use crate::metrics::ProxyMetrics;
use crate::registry::{BackendHandle, SessionRegistry};
use crate::session::SessionId;
use futures::{SinkExt, StreamExt};
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{
    HeaderMap, HeaderValue, CONNECTION, HOST, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY,
    SEC_WEBSOCKET_PROTOCOL, SEC_WEBSOCKET_VERSION, UPGRADE,
};
use hyper::upgrade::{OnUpgrade, Upgraded};
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::handshake::client::generate_key;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Role};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

/// Maximum time to open the backend WebSocket
const BACKEND_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// How long a rejected client gets to acknowledge the close frame
const CLOSE_ACK_TIMEOUT: Duration = Duration::from_secs(5);

type WsStream = WebSocketStream<TokioIo<Upgraded>>;

/// Why the backend side of a bridge could not be opened
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("connect failed: {0}")]
    Connect(#[from] std::io::Error),
    #[error("handshake failed: {0}")]
    Handshake(#[from] hyper::Error),
    #[error("invalid upgrade request: {0}")]
    Request(#[from] hyper::http::Error),
    #[error("backend answered {0} instead of 101")]
    Rejected(StatusCode),
    #[error("backend sent an invalid Sec-WebSocket-Accept")]
    InvalidAccept,
    #[error("timed out after {}s", BACKEND_CONNECT_TIMEOUT.as_secs())]
    Timeout,
}

/// Answer a WebSocket upgrade on a bridge route.
///
/// The client handshake always completes; a missing session or an
/// unreachable backend is reported as a close code on the new connection.
pub async fn handle_upgrade(
    mut req: Request<Incoming>,
    path_and_query: String,
    session: Option<(SessionId, Arc<BackendHandle>)>,
    registry: Arc<SessionRegistry>,
    metrics: Arc<ProxyMetrics>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let accept = match req.headers().get(SEC_WEBSOCKET_KEY) {
        Some(key) => derive_accept_key(key.as_bytes()),
        None => return bad_request("missing Sec-WebSocket-Key"),
    };
    let on_upgrade = hyper::upgrade::on(&mut req);

    let (id, handle) = match session {
        Some(session) => session,
        None => {
            debug!(path = %path_and_query, "WebSocket without a live session, closing");
            close_after_upgrade(on_upgrade, CLOSE_SESSION_EXPIRED, "session expired");
            return switching_protocols(&accept, None);
        }
    };

    let port = handle.port();
    let client_headers = req.headers().clone();
    let connected = tokio::time::timeout(
        BACKEND_CONNECT_TIMEOUT,
        connect_backend(port, &path_and_query, &client_headers),
    )
    .await
    .unwrap_or(Err(BridgeError::Timeout));

    let (backend, protocol) = match connected {
        Ok(connected) => connected,
        Err(e) => {
            warn!(session = %id, port, path = %path_and_query, error = %e, "Backend WebSocket unavailable");
            close_after_upgrade(on_upgrade, CLOSE_TRY_AGAIN_LATER, "backend unavailable");
            return switching_protocols(&accept, None);
        }
    };

    let response = switching_protocols(&accept, protocol);

    tokio::spawn(async move {
        let upgraded = match on_upgrade.await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                warn!(session = %id, error = %e, "Client upgrade failed");
                return;
            }
        };
        let client = WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;

        let _guard = metrics.ws_connection();
        registry.touch(&id);
        info!(session = %id, port, path = %path_and_query, "WebSocket bridged");

        let closed_by = relay(client, backend, id, &registry).await;
        debug!(session = %id, closed_by, "WebSocket bridge closed");
    });

    response
}

/// Open a WebSocket to the backend, replaying the client's headers.
/// Returns the stream and the subprotocol the backend selected.
async fn connect_backend(
    port: u16,
    path_and_query: &str,
    client_headers: &HeaderMap,
) -> Result<(WsStream, Option<HeaderValue>), BridgeError> {
    let stream = TcpStream::connect((std::net::Ipv4Addr::LOCALHOST, port)).await?;
    stream.set_nodelay(true)?;

    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
    tokio::spawn(async move {
        if let Err(e) = conn.with_upgrades().await {
            debug!(error = %e, "Backend upgrade connection ended");
        }
    });

    let key = generate_key();
    let mut builder = Request::builder()
        .method(Method::GET)
        .uri(path_and_query)
        .header(HOST, backend_authority(port))
        .header(CONNECTION, "Upgrade")
        .header(UPGRADE, "websocket")
        .header(SEC_WEBSOCKET_VERSION, "13")
        .header(SEC_WEBSOCKET_KEY, key.as_str());

    let offered = offered_subprotocols(client_headers);
    if !offered.is_empty() {
        builder = builder.header(SEC_WEBSOCKET_PROTOCOL, offered.join(", "));
    }

    let mut request = builder.body(Empty::<Bytes>::new())?;
    for (name, value) in websocket_forward_headers(client_headers) {
        request.headers_mut().append(name, value);
    }

    let response = sender.send_request(request).await?;
    if response.status() != StatusCode::SWITCHING_PROTOCOLS {
        return Err(BridgeError::Rejected(response.status()));
    }

    let expected = derive_accept_key(key.as_bytes());
    let accepted = response
        .headers()
        .get(SEC_WEBSOCKET_ACCEPT)
        .map(|v| v.as_bytes() == expected.as_bytes())
        .unwrap_or(false);
    if !accepted {
        return Err(BridgeError::InvalidAccept);
    }

    let protocol = response.headers().get(SEC_WEBSOCKET_PROTOCOL).cloned();
    let upgraded = hyper::upgrade::on(response).await?;
    let ws = WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Client, None).await;
    Ok((ws, protocol))
}

/// Relay frames both ways until either side finishes.
/// Returns which side ended the bridge.
async fn relay(
    client: WsStream,
    backend: WsStream,
    id: SessionId,
    registry: &SessionRegistry,
) -> &'static str {
    let (mut client_tx, mut client_rx) = client.split();
    let (mut backend_tx, mut backend_rx) = backend.split();

    let client_to_backend = async {
        while let Some(msg) = client_rx.next().await {
            match msg {
                Ok(msg @ (Message::Text(_) | Message::Binary(_))) => {
                    if backend_tx.send(msg).await.is_err() {
                        break;
                    }
                    registry.touch(&id);
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!(session = %id, error = %e, "Client WebSocket read failed");
                    break;
                }
            }
        }
        let _ = backend_tx.close().await;
    };

    let backend_to_client = async {
        while let Some(msg) = backend_rx.next().await {
            match msg {
                Ok(msg @ (Message::Text(_) | Message::Binary(_))) => {
                    if client_tx.send(msg).await.is_err() {
                        break;
                    }
                    registry.touch(&id);
                }
                Ok(Message::Close(frame)) => {
                    let _ = client_tx.send(Message::Close(frame)).await;
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(session = %id, error = %e, "Backend WebSocket read failed");
                    break;
                }
            }
        }
        let _ = client_tx.close().await;
    };

    tokio::select! {
        _ = client_to_backend => "client",
        _ = backend_to_client => "backend",
    }
}

/// Finish the client handshake, then close with `code`
fn close_after_upgrade(on_upgrade: OnUpgrade, code: u16, reason: &'static str) {
    tokio::spawn(async move {
        let upgraded = match on_upgrade.await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                debug!(error = %e, "Client upgrade failed before close");
                return;
            }
        };
        let mut ws = WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: Cow::Borrowed(reason),
        };
        if ws.close(Some(frame)).await.is_err() {
            return;
        }
        // Drain until the client acknowledges the close
        let _ = tokio::time::timeout(CLOSE_ACK_TIMEOUT, async {
            while let Some(Ok(_)) = ws.next().await {}
        })
        .await;
    });
}

fn switching_protocols(accept: &str, protocol: Option<HeaderValue>) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut builder = Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(CONNECTION, "Upgrade")
        .header(UPGRADE, "websocket")
        .header(SEC_WEBSOCKET_ACCEPT, accept);
    if let Some(protocol) = protocol {
        builder = builder.header(SEC_WEBSOCKET_PROTOCOL, protocol);
    }
    builder
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .expect("valid response builder")
}

fn bad_request(message: &'static str) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(StatusCode::BAD_REQUEST)
        .header(hyper::header::CONTENT_TYPE, "text/plain")
        .body(Full::new(Bytes::from(message)).map_err(|never| match never {}).boxed())
        .expect("valid response builder")
}
