//! Minimal session backend for local runs and integration tests
//!
//! Listens on 127.0.0.1 at `--port N` (or `PORT`). Routes:
//! - `GET /health`: `ok`
//! - `GET /env/{NAME}`: value of an environment variable, 404 when unset
//! - `GET /file/{name}`: contents of a file in the working directory
//! - WebSocket upgrade on any path: echoes every frame, selecting the first
//!   offered subprotocol
//! - anything else: JSON echo of the request, with two `Set-Cookie` and a
//!   repeated `X-Echo-Multi` header

use futures::{SinkExt, StreamExt};
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{
    HeaderValue, CONNECTION, CONTENT_TYPE, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_PROTOCOL, SET_COOKIE,
    UPGRADE,
};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

type EchoResponse = Response<BoxBody<Bytes, hyper::Error>>;

#[derive(Serialize)]
struct Echo {
    method: String,
    path: String,
    query: Option<String>,
    headers: Vec<(String, String)>,
    body: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("session_echo=info".parse().expect("valid log directive")),
        )
        .with_writer(std::io::stderr)
        .init();

    let port = port_from_args()?;
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "session-echo listening");

    loop {
        let (stream, peer) = listener.accept().await?;
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(handle))
                .with_upgrades()
                .await
            {
                debug!(%peer, error = %e, "Connection error");
            }
        });
    }
}

fn port_from_args() -> anyhow::Result<u16> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--port" {
            let value = args
                .next()
                .ok_or_else(|| anyhow::anyhow!("--port requires a value"))?;
            return Ok(value.parse()?);
        }
    }
    let value = std::env::var("PORT").map_err(|_| anyhow::anyhow!("pass --port or set PORT"))?;
    Ok(value.parse()?)
}

async fn handle(req: Request<Incoming>) -> Result<EchoResponse, hyper::Error> {
    if req.headers().contains_key(SEC_WEBSOCKET_KEY) {
        return Ok(websocket(req));
    }

    let path = req.uri().path().to_string();
    if req.method() == Method::GET {
        if path == "/health" {
            return Ok(text(StatusCode::OK, "ok".to_string()));
        }
        if let Some(name) = path.strip_prefix("/env/") {
            return Ok(match std::env::var(name) {
                Ok(value) => text(StatusCode::OK, value),
                Err(_) => text(StatusCode::NOT_FOUND, format!("{} is not set", name)),
            });
        }
        if let Some(name) = path.strip_prefix("/file/") {
            if name.contains("..") {
                return Ok(text(StatusCode::BAD_REQUEST, "invalid name".to_string()));
            }
            return Ok(match tokio::fs::read_to_string(name).await {
                Ok(content) => text(StatusCode::OK, content),
                Err(e) => text(StatusCode::NOT_FOUND, e.to_string()),
            });
        }
    }

    let (parts, body) = req.into_parts();
    let body = body.collect().await?.to_bytes();
    let echo = Echo {
        method: parts.method.to_string(),
        path,
        query: parts.uri.query().map(str::to_string),
        headers: parts
            .headers
            .iter()
            .map(|(name, value)| (name.to_string(), String::from_utf8_lossy(value.as_bytes()).into_owned()))
            .collect(),
        body: String::from_utf8_lossy(&body).into_owned(),
    };
    let json = serde_json::to_string(&echo).unwrap_or_else(|_| "{}".to_string());

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "application/json")
        .header(SET_COOKIE, "first=1; Path=/")
        .header(SET_COOKIE, "second=2; Path=/")
        .header("x-echo-multi", "a")
        .header("x-echo-multi", "b")
        .body(Full::new(Bytes::from(json)).map_err(|never| match never {}).boxed())
        .expect("valid response builder"))
}

fn text(status: StatusCode, body: String) -> EchoResponse {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain")
        .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed())
        .expect("valid response builder")
}

fn websocket(mut req: Request<Incoming>) -> EchoResponse {
    let accept = match req.headers().get(SEC_WEBSOCKET_KEY) {
        Some(key) => derive_accept_key(key.as_bytes()),
        None => return text(StatusCode::BAD_REQUEST, "missing key".to_string()),
    };
    let protocol = req
        .headers()
        .get(SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());
    let on_upgrade = hyper::upgrade::on(&mut req);

    tokio::spawn(async move {
        let upgraded = match on_upgrade.await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                warn!(error = %e, "Upgrade failed");
                return;
            }
        };
        let mut ws = WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;
        while let Some(Ok(msg)) = ws.next().await {
            match msg {
                Message::Text(_) | Message::Binary(_) => {
                    if ws.send(msg).await.is_err() {
                        break;
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
        let _ = ws.close(None).await;
    });

    let mut builder = Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(CONNECTION, "Upgrade")
        .header(UPGRADE, "websocket")
        .header(SEC_WEBSOCKET_ACCEPT, accept);
    if let Some(protocol) = protocol.and_then(|p| HeaderValue::from_str(&p).ok()) {
        builder = builder.header(SEC_WEBSOCKET_PROTOCOL, protocol);
    }
    builder
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .expect("valid response builder")
}
