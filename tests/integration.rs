//! Integration tests for Sessiongate
//!
//! Each test runs a proxy on an ephemeral port with `session-echo` as the
//! per-session backend and talks to it over real sockets.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderMap, COOKIE, LOCATION, SET_COOKIE};
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use sessiongate::config::{BackendConfig, Config};
use sessiongate::metrics::ProxyMetrics;
use sessiongate::provision::Provisioner;
use sessiongate::process::ProcessHandle;
use sessiongate::proxy::{ProxyServer, ProxyState};
use sessiongate::reaper::IdleReaper;
use sessiongate::registry::{BackendHandle, SessionRegistry};
use sessiongate::session::{Credentials, SessionId};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::process::Command;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;

const ENDPOINT: &str = "https://e1.example.com/";

/// Backend config launching the bundled echo server
fn echo_backend() -> BackendConfig {
    let mut backend = BackendConfig::local(env!("CARGO_BIN_EXE_session-echo"))
        .with_args(vec!["--port".to_string(), "{port}".to_string()]);
    backend.startup_timeout_secs = 10;
    backend.ready_poll_interval_ms = 50;
    backend.shutdown_grace_period_secs = 2;
    backend
}

fn test_config(backend: BackendConfig) -> Config {
    let mut config = Config::default();
    config.server.bind = "127.0.0.1".to_string();
    config.server.request_timeout_secs = 30;
    config.backend = backend;
    config
}

struct TestProxy {
    port: u16,
    registry: Arc<SessionRegistry>,
    provisioner: Arc<Provisioner>,
    shutdown_tx: watch::Sender<bool>,
    client: Client<HttpConnector, Full<Bytes>>,
}

impl TestProxy {
    async fn start(config: Config) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let registry = SessionRegistry::new();
        let provisioner = Provisioner::new(config.backend.clone());
        let state = ProxyState::new(
            &config,
            Arc::clone(&registry),
            Arc::clone(&provisioner),
            ProxyMetrics::new(),
        );

        let server = ProxyServer::new(addr, state, shutdown_rx);
        tokio::spawn(async move {
            let _ = server.serve(listener).await;
        });

        Self {
            port: addr.port(),
            registry,
            provisioner,
            shutdown_tx,
            client: Client::builder(TokioExecutor::new()).build_http(),
        }
    }

    async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        self.provisioner.teardown_all(&self.registry).await;
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        headers: &[(&str, &str)],
        body: &str,
    ) -> (StatusCode, HeaderMap, Bytes) {
        let mut builder = Request::builder()
            .method(method)
            .uri(format!("http://127.0.0.1:{}{}", self.port, path));
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let req = builder.body(Full::new(Bytes::from(body.to_string()))).unwrap();

        let response = tokio::time::timeout(Duration::from_secs(20), self.client.request(req))
            .await
            .expect("request timed out")
            .expect("request failed");
        let (parts, body) = response.into_parts();
        let body = body.collect().await.unwrap().to_bytes();
        (parts.status, parts.headers, body)
    }

    async fn get(&self, path: &str, cookie: &str) -> (StatusCode, HeaderMap, Bytes) {
        self.send(Method::GET, path, &[("cookie", cookie)], "").await
    }

    /// Log in and return the `Cookie` header for the new session
    async fn login(&self, endpoint: &str, credential: &str) -> String {
        let form = format!(
            "endpoint={}&credential={}",
            urlencoding::encode(endpoint),
            urlencoding::encode(credential)
        );
        let (status, headers, body) = self
            .send(
                Method::POST,
                "/start",
                &[("content-type", "application/x-www-form-urlencoded")],
                &form,
            )
            .await;
        assert_eq!(status, StatusCode::SEE_OTHER, "start failed: {}", String::from_utf8_lossy(&body));
        assert_eq!(headers.get(LOCATION).unwrap(), "/");
        cookie_header(&headers)
    }

    fn session(&self, endpoint: &str, credential: &str) -> SessionId {
        Credentials::new(endpoint, credential).session_id()
    }
}

/// Turn `Set-Cookie` response headers into a request `Cookie` header
fn cookie_header(headers: &HeaderMap) -> String {
    headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .filter_map(|v| v.split(';').next())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Swap the session's backend for a running placeholder process whose
/// traffic goes to `port`
async fn replace_backend(proxy: &TestProxy, id: SessionId, port: u16) -> Arc<BackendHandle> {
    if let Some(old) = proxy.registry.remove(&id) {
        proxy.provisioner.teardown(id, &old).await;
    }
    proxy
        .registry
        .ensure(
            id,
            move || async move {
                let mut cmd = Command::new("sleep");
                cmd.arg("60");
                let process = ProcessHandle::spawn(cmd, "placeholder").unwrap();
                let workdir = tempfile::tempdir().unwrap().keep();
                Ok(BackendHandle::new(port, process, workdir))
            },
            |_| async {},
        )
        .await
        .unwrap()
}

/// A loopback port with nothing listening on it
async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Serve `404 Not Found` to every connection
async fn not_found_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf).await;
                let _ = stream
                    .write_all(b"HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                    .await;
                let _ = stream.shutdown().await;
            });
        }
    });
    port
}

async fn ws_connections(proxy: &TestProxy) -> u64 {
    let (_, _, body) = proxy.get("/_health", "").await;
    let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
    health["ws_connections"].as_u64().unwrap()
}

async fn wait_until<F: Fn() -> bool>(check: F, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    check()
}

// ============================================================================
// Control routes
// ============================================================================

#[tokio::test]
async fn test_index_serves_login_without_session() {
    let proxy = TestProxy::start(test_config(echo_backend())).await;

    let (status, headers, body) = proxy.get("/", "").await;
    assert_eq!(status, StatusCode::OK);
    assert!(headers.get("content-type").unwrap().to_str().unwrap().starts_with("text/html"));
    assert!(String::from_utf8_lossy(&body).contains("action=\"/start\""));

    proxy.stop().await;
}

#[tokio::test]
async fn test_start_validates_form() {
    let proxy = TestProxy::start(test_config(echo_backend())).await;
    let form = [("content-type", "application/x-www-form-urlencoded")];

    let (status, headers, _) = proxy.send(Method::POST, "/start", &form, "credential=tok").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(headers.get("x-proxy-error").unwrap(), "INVALID_ENDPOINT");

    let (status, headers, _) = proxy
        .send(Method::POST, "/start", &form, "endpoint=e1.example.com&credential=")
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(headers.get("x-proxy-error").unwrap(), "MISSING_CREDENTIAL");
    assert!(headers.get(SET_COOKIE).is_none());
    assert!(proxy.registry.is_empty());

    proxy.stop().await;
}

#[tokio::test]
async fn test_start_rejects_oversized_form() {
    let proxy = TestProxy::start(test_config(echo_backend())).await;
    let form = format!("endpoint=e1.example.com&credential={}", "x".repeat(20 * 1024));

    let (status, headers, _) = proxy
        .send(
            Method::POST,
            "/start",
            &[("content-type", "application/x-www-form-urlencoded")],
            &form,
        )
        .await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(headers.get("x-proxy-error").unwrap(), "FORM_TOO_LARGE");
    assert!(headers.get(SET_COOKIE).is_none());
    assert!(proxy.registry.is_empty());

    proxy.stop().await;
}

#[tokio::test]
async fn test_start_sets_cookies_and_reuses_backend() {
    let proxy = TestProxy::start(test_config(echo_backend())).await;

    let cookie = proxy.login("e1.example.com", "tok-1").await;
    assert!(cookie.contains("goose_host="));
    assert!(cookie.contains("goose_token=tok-1"));

    let id = proxy.session(ENDPOINT, "tok-1");
    let first = proxy.registry.live(&id).expect("session is live");

    // Logging in again keeps the running backend
    proxy.login("e1.example.com", "tok-1").await;
    let second = proxy.registry.live(&id).unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(proxy.registry.len(), 1);

    // The shell page is served for a live session
    let (status, _, body) = proxy.get("/", &cookie).await;
    assert_eq!(status, StatusCode::OK);
    assert!(String::from_utf8_lossy(&body).contains("src=\"/goose/\""));

    proxy.stop().await;
}

#[tokio::test]
async fn test_concurrent_starts_provision_once() {
    let proxy = Arc::new(TestProxy::start(test_config(echo_backend())).await);

    let mut tasks = Vec::new();
    for _ in 0..6 {
        let proxy = Arc::clone(&proxy);
        tasks.push(tokio::spawn(async move { proxy.login("e1.example.com", "tok-c").await }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(proxy.registry.len(), 1);

    // A different credential gets its own backend
    proxy.login("e1.example.com", "tok-d").await;
    assert_eq!(proxy.registry.len(), 2);
    let ports = proxy.registry.ports_in_use();
    assert_eq!(ports.len(), 2);

    let proxy = Arc::try_unwrap(proxy).ok().expect("no other references");
    proxy.stop().await;
}

#[tokio::test]
async fn test_start_failure_sets_no_session() {
    let proxy = TestProxy::start(test_config(BackendConfig::local("false").with_args(vec![]))).await;

    let (status, headers, body) = proxy
        .send(
            Method::POST,
            "/start",
            &[("content-type", "application/x-www-form-urlencoded")],
            "endpoint=e1.example.com&credential=tok",
        )
        .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(headers.get("x-proxy-error").unwrap(), "PROVISIONING_FAILED");
    assert!(headers.get(SET_COOKIE).is_none());
    assert!(String::from_utf8_lossy(&body).contains("Failed to start backend"));
    assert!(proxy.registry.is_empty());

    proxy.stop().await;
}

#[tokio::test]
async fn test_logout_tears_down_session() {
    let proxy = TestProxy::start(test_config(echo_backend())).await;
    let cookie = proxy.login("e1.example.com", "tok-out").await;
    let handle = proxy.registry.live(&proxy.session(ENDPOINT, "tok-out")).unwrap();
    let workdir = handle.workdir().to_path_buf();

    let (status, headers, _) = proxy.get("/logout", &cookie).await;
    assert_eq!(status, StatusCode::SEE_OTHER);
    let cleared: Vec<_> = headers
        .get_all(SET_COOKIE)
        .iter()
        .map(|v| v.to_str().unwrap().to_string())
        .collect();
    assert_eq!(cleared.len(), 2);
    assert!(cleared.iter().all(|c| c.contains("Max-Age=0")));

    assert!(proxy.registry.is_empty());
    assert!(!handle.is_running());
    assert!(!workdir.exists());

    let (status, headers, _) = proxy.get("/goose/", &cookie).await;
    assert_eq!(status, StatusCode::SEE_OTHER);
    assert_eq!(headers.get(LOCATION).unwrap(), "/");

    proxy.stop().await;
}

#[tokio::test]
async fn test_heartbeat_and_health() {
    let proxy = TestProxy::start(test_config(echo_backend())).await;

    let (status, _, _) = proxy.send(Method::POST, "/heartbeat", &[], "").await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let cookie = proxy.login("e1.example.com", "tok-hb").await;
    let handle = proxy.registry.live(&proxy.session(ENDPOINT, "tok-hb")).unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    let idle_before = handle.idle_for();

    let (status, _, _) = proxy
        .send(Method::POST, "/heartbeat", &[("cookie", cookie.as_str())], "")
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(handle.idle_for() < idle_before);

    let (status, _, body) = proxy.get("/_health", "").await;
    assert_eq!(status, StatusCode::OK);
    let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["live_sessions"], 1);
    assert_eq!(health["backends"]["instances"], 1);
    assert_eq!(health["ws_connections"], 0);

    proxy.stop().await;
}

// ============================================================================
// HTTP proxying
// ============================================================================

#[tokio::test]
async fn test_unauthenticated_requests() {
    let proxy = TestProxy::start(test_config(echo_backend())).await;

    // Application routes always go back to login
    let (status, headers, _) = proxy.get("/goose/anything", "").await;
    assert_eq!(status, StatusCode::SEE_OTHER);
    assert_eq!(headers.get(LOCATION).unwrap(), "/");

    // Catch-all redirects browsers and rejects everything else
    let (status, _, _) = proxy
        .send(Method::GET, "/assets/app.js", &[("accept", "text/html")], "")
        .await;
    assert_eq!(status, StatusCode::SEE_OTHER);

    let (status, headers, _) = proxy
        .send(Method::GET, "/api/data", &[("accept", "application/json")], "")
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(headers.get("x-proxy-error").unwrap(), "SESSION_NOT_LIVE");

    // Nothing was provisioned along the way
    assert!(proxy.registry.is_empty());

    proxy.stop().await;
}

#[tokio::test]
async fn test_proxy_preserves_request_and_response() {
    let proxy = TestProxy::start(test_config(echo_backend())).await;
    let cookie = proxy.login("e1.example.com", "tok-h").await;
    let port = proxy.registry.live(&proxy.session(ENDPOINT, "tok-h")).unwrap().port();

    let (status, headers, body) = proxy
        .send(
            Method::POST,
            "/goose/api/reply?x=1&y=two",
            &[
                ("cookie", cookie.as_str()),
                ("x-custom", "kept"),
                ("content-type", "application/json"),
            ],
            "{\"hello\":true}",
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    // Repeated response headers survive the hop
    assert_eq!(headers.get_all(SET_COOKIE).iter().count(), 2);
    assert_eq!(headers.get_all("x-echo-multi").iter().count(), 2);

    let echo: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(echo["method"], "POST");
    assert_eq!(echo["path"], "/api/reply");
    assert_eq!(echo["query"], "x=1&y=two");
    assert_eq!(echo["body"], "{\"hello\":true}");

    let sent: Vec<(String, String)> = serde_json::from_value(echo["headers"].clone()).unwrap();
    let header = |name: &str| sent.iter().find(|(n, _)| n == name).map(|(_, v)| v.clone());
    assert_eq!(header("x-custom").as_deref(), Some("kept"));
    assert_eq!(header("host"), Some(format!("127.0.0.1:{}", port)));
    assert!(header("cookie").unwrap().contains("goose_token="));

    // Paths outside the application prefix are forwarded verbatim
    let (status, _, body) = proxy.get("/static/app.css", &cookie).await;
    assert_eq!(status, StatusCode::OK);
    let echo: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(echo["path"], "/static/app.css");

    proxy.stop().await;
}

#[tokio::test]
async fn test_backend_environment() {
    let mut backend = echo_backend();
    backend.clear_env = vec!["SESSIONGATE_TEST_CLEARED".to_string()];
    backend.env.insert("SESSIONGATE_TEST_EXTRA".to_string(), "extra".to_string());
    std::env::set_var("SESSIONGATE_TEST_CLEARED", "leaked");

    let proxy = TestProxy::start(test_config(backend)).await;
    let cookie = proxy.login("e1.example.com", "tok-env").await;
    let port = proxy.registry.live(&proxy.session(ENDPOINT, "tok-env")).unwrap().port();

    let body_of = |(status, _, body): (StatusCode, HeaderMap, Bytes)| {
        (status, String::from_utf8_lossy(&body).into_owned())
    };

    assert_eq!(
        body_of(proxy.get("/goose/env/DATABRICKS_HOST", &cookie).await),
        (StatusCode::OK, ENDPOINT.to_string())
    );
    assert_eq!(
        body_of(proxy.get("/goose/env/DATABRICKS_TOKEN", &cookie).await),
        (StatusCode::OK, "tok-env".to_string())
    );
    assert_eq!(
        body_of(proxy.get("/goose/env/PORT", &cookie).await),
        (StatusCode::OK, port.to_string())
    );
    assert_eq!(
        body_of(proxy.get("/goose/env/SESSIONGATE_TEST_EXTRA", &cookie).await),
        (StatusCode::OK, "extra".to_string())
    );
    assert_eq!(
        proxy.get("/goose/env/SESSIONGATE_TEST_CLEARED", &cookie).await.0,
        StatusCode::NOT_FOUND
    );

    proxy.stop().await;
}

#[tokio::test]
async fn test_template_is_copied_into_workdir() {
    let template = tempfile::tempdir().unwrap();
    std::fs::write(template.path().join("greeting.txt"), "hello from template").unwrap();
    std::fs::create_dir(template.path().join(".git")).unwrap();

    let backend = echo_backend().with_template_dir(&template.path().to_string_lossy());
    let proxy = TestProxy::start(test_config(backend)).await;
    let cookie = proxy.login("e1.example.com", "tok-tpl").await;

    let (status, _, body) = proxy.get("/goose/file/greeting.txt", &cookie).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], b"hello from template");

    let handle = proxy.registry.live(&proxy.session(ENDPOINT, "tok-tpl")).unwrap();
    assert!(handle.workdir().join("greeting.txt").exists());
    assert!(!handle.workdir().join(".git").exists());

    proxy.stop().await;
}

#[tokio::test]
async fn test_dead_backend_is_not_live() {
    let proxy = TestProxy::start(test_config(echo_backend())).await;
    let cookie = proxy.login("e1.example.com", "tok-dead").await;
    let id = proxy.session(ENDPOINT, "tok-dead");
    let first = proxy.registry.live(&id).unwrap();

    first.process().kill();
    assert!(wait_until(|| !first.is_running(), Duration::from_secs(5)).await);

    // Entry remains but is not live, so requests go back to login
    assert!(proxy.registry.resolve(&id).is_some());
    let (status, headers, _) = proxy.get("/goose/", &cookie).await;
    assert_eq!(status, StatusCode::SEE_OTHER);
    assert_eq!(headers.get(LOCATION).unwrap(), "/");

    // Logging in again replaces the dead entry
    proxy.login("e1.example.com", "tok-dead").await;
    let second = proxy.registry.live(&id).unwrap();
    assert!(!Arc::ptr_eq(&first, &second));

    proxy.stop().await;
}

#[tokio::test]
async fn test_upstream_failure_keeps_session_live() {
    let proxy = TestProxy::start(test_config(echo_backend())).await;
    let cookie = proxy.login("e1.example.com", "tok-refused").await;
    let id = proxy.session(ENDPOINT, "tok-refused");
    replace_backend(&proxy, id, closed_port().await).await;

    let (status, headers, body) = proxy.get("/goose/api/x", &cookie).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(headers.get("x-proxy-error").unwrap(), "UPSTREAM_TRANSPORT");
    let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["code"], "UPSTREAM_TRANSPORT");

    // A transport failure is reported, not treated as a dead session
    assert!(proxy.registry.is_live(&id));

    let (_, _, body) = proxy.get("/_health", "").await;
    let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert!(health["upstream"]["upstream_errors"].as_u64().unwrap() >= 1);

    proxy.stop().await;
}

#[tokio::test]
async fn test_reaper_removes_idle_session() {
    let proxy = TestProxy::start(test_config(echo_backend())).await;
    let cookie = proxy.login("e1.example.com", "tok-idle").await;
    let handle = proxy.registry.live(&proxy.session(ENDPOINT, "tok-idle")).unwrap();
    let workdir = handle.workdir().to_path_buf();

    let (reaper_tx, reaper_rx) = watch::channel(false);
    let reaper = IdleReaper::new(
        Arc::clone(&proxy.registry),
        Arc::clone(&proxy.provisioner),
        Duration::from_millis(50),
        Duration::from_millis(100),
    );
    let reaper_task = tokio::spawn(reaper.run(reaper_rx));

    let registry = Arc::clone(&proxy.registry);
    assert!(wait_until(|| registry.is_empty(), Duration::from_secs(5)).await);
    assert!(wait_until(|| !handle.is_running(), Duration::from_secs(5)).await);
    assert!(wait_until(|| !workdir.exists(), Duration::from_secs(5)).await);

    let (status, _, _) = proxy.get("/goose/", &cookie).await;
    assert_eq!(status, StatusCode::SEE_OTHER);

    let _ = reaper_tx.send(true);
    reaper_task.await.unwrap();
    proxy.stop().await;
}

// ============================================================================
// WebSocket bridge
// ============================================================================

#[tokio::test]
async fn test_websocket_relays_frames_in_order() {
    let proxy = TestProxy::start(test_config(echo_backend())).await;
    let cookie = proxy.login("e1.example.com", "tok-ws").await;

    let mut request = format!("ws://127.0.0.1:{}/ws", proxy.port)
        .into_client_request()
        .unwrap();
    request.headers_mut().insert(COOKIE, cookie.parse().unwrap());
    request
        .headers_mut()
        .insert("sec-websocket-protocol", "chat.v1, chat.v2".parse().unwrap());

    let (mut ws, response) = tokio_tungstenite::connect_async(request).await.unwrap();
    assert_eq!(response.headers().get("sec-websocket-protocol").unwrap(), "chat.v1");

    let mut sent = Vec::new();
    for i in 0..5 {
        sent.push(Message::Text(format!("message {}", i)));
    }
    sent.push(Message::Binary(vec![0, 1, 2, 255]));
    sent.push(Message::Text("last".to_string()));

    for msg in &sent {
        ws.send(msg.clone()).await.unwrap();
    }

    let mut received = Vec::new();
    while received.len() < sent.len() {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("frame timed out")
            .expect("stream ended")
            .unwrap();
        if msg.is_text() || msg.is_binary() {
            received.push(msg);
        }
    }
    assert_eq!(received, sent);

    let (_, _, body) = proxy.get("/_health", "").await;
    let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health["ws_connections"], 1);

    ws.close(None).await.unwrap();
    drop(ws);
    proxy.stop().await;
}

#[tokio::test]
async fn test_websocket_under_app_prefix() {
    let proxy = TestProxy::start(test_config(echo_backend())).await;
    let cookie = proxy.login("e1.example.com", "tok-ws2").await;

    let mut request = format!("ws://127.0.0.1:{}/goose/api/stream?room=1", proxy.port)
        .into_client_request()
        .unwrap();
    request.headers_mut().insert(COOKIE, cookie.parse().unwrap());

    let (mut ws, _) = tokio_tungstenite::connect_async(request).await.unwrap();
    ws.send(Message::Text("ping".to_string())).await.unwrap();
    let reply = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(reply, Message::Text("ping".to_string()));

    proxy.stop().await;
}

#[tokio::test]
async fn test_websocket_without_session_closes_4401() {
    let proxy = TestProxy::start(test_config(echo_backend())).await;

    let request = format!("ws://127.0.0.1:{}/ws", proxy.port)
        .into_client_request()
        .unwrap();
    let (mut ws, _) = tokio_tungstenite::connect_async(request).await.unwrap();

    let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("close timed out")
        .expect("stream ended")
        .unwrap();
    match msg {
        Message::Close(Some(frame)) => assert_eq!(u16::from(frame.code), 4401),
        other => panic!("expected close frame, got {:?}", other),
    }
    assert!(proxy.registry.is_empty());

    proxy.stop().await;
}

#[tokio::test]
async fn test_websocket_on_unknown_path_is_rejected() {
    let proxy = TestProxy::start(test_config(echo_backend())).await;

    let request = format!("ws://127.0.0.1:{}/elsewhere", proxy.port)
        .into_client_request()
        .unwrap();
    assert!(tokio_tungstenite::connect_async(request).await.is_err());

    proxy.stop().await;
}

#[tokio::test]
async fn test_websocket_backend_unavailable_closes_1013() {
    let proxy = TestProxy::start(test_config(echo_backend())).await;
    let cookie = proxy.login("e1.example.com", "tok-ws404").await;
    let id = proxy.session(ENDPOINT, "tok-ws404");
    replace_backend(&proxy, id, not_found_server().await).await;

    let mut request = format!("ws://127.0.0.1:{}/ws", proxy.port)
        .into_client_request()
        .unwrap();
    request.headers_mut().insert(COOKIE, cookie.parse().unwrap());
    let (mut ws, _) = tokio_tungstenite::connect_async(request).await.unwrap();

    let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("close timed out")
        .expect("stream ended")
        .unwrap();
    match msg {
        Message::Close(Some(frame)) => {
            assert_eq!(u16::from(frame.code), 1013);
            assert_eq!(frame.reason, "backend unavailable");
        }
        other => panic!("expected close frame, got {:?}", other),
    }

    // The session itself is untouched
    assert!(proxy.registry.is_live(&id));
    assert_eq!(ws_connections(&proxy).await, 0);

    proxy.stop().await;
}

#[tokio::test]
async fn test_websocket_counter_returns_to_zero_after_client_close() {
    let proxy = TestProxy::start(test_config(echo_backend())).await;
    let cookie = proxy.login("e1.example.com", "tok-wsclose").await;

    let mut request = format!("ws://127.0.0.1:{}/ws", proxy.port)
        .into_client_request()
        .unwrap();
    request.headers_mut().insert(COOKIE, cookie.parse().unwrap());
    let (mut ws, _) = tokio_tungstenite::connect_async(request).await.unwrap();

    ws.send(Message::Text("hello".to_string())).await.unwrap();
    let reply = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(reply, Message::Text("hello".to_string()));
    assert_eq!(ws_connections(&proxy).await, 1);

    ws.close(None).await.unwrap();
    drop(ws);

    let mut drained = false;
    for _ in 0..200 {
        if ws_connections(&proxy).await == 0 {
            drained = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(drained, "ws_connections did not return to 0");

    proxy.stop().await;
}

#[tokio::test]
async fn test_websocket_closed_when_reaper_tears_down_backend() {
    let proxy = TestProxy::start(test_config(echo_backend())).await;
    let cookie = proxy.login("e1.example.com", "tok-wsreap").await;

    let mut request = format!("ws://127.0.0.1:{}/ws", proxy.port)
        .into_client_request()
        .unwrap();
    request.headers_mut().insert(COOKIE, cookie.parse().unwrap());
    let (mut ws, _) = tokio_tungstenite::connect_async(request).await.unwrap();

    ws.send(Message::Text("hello".to_string())).await.unwrap();
    let reply = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(reply, Message::Text("hello".to_string()));
    assert_eq!(ws_connections(&proxy).await, 1);

    let (reaper_tx, reaper_rx) = watch::channel(false);
    let reaper = IdleReaper::new(
        Arc::clone(&proxy.registry),
        Arc::clone(&proxy.provisioner),
        Duration::from_millis(50),
        Duration::from_millis(100),
    );
    let reaper_task = tokio::spawn(reaper.run(reaper_rx));

    // The backend goes away under the open connection; the client sees the
    // bridge end rather than hanging
    loop {
        let next = tokio::time::timeout(Duration::from_secs(10), ws.next())
            .await
            .expect("bridge did not close after teardown");
        match next {
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
            Some(Ok(_)) => continue,
        }
    }
    drop(ws);

    let registry = Arc::clone(&proxy.registry);
    assert!(wait_until(|| registry.is_empty(), Duration::from_secs(5)).await);

    let mut drained = false;
    for _ in 0..200 {
        if ws_connections(&proxy).await == 0 {
            drained = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(drained, "ws_connections did not return to 0");

    let _ = reaper_tx.send(true);
    reaper_task.await.unwrap();
    proxy.stop().await;
}
