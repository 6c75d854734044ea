use crate::config::Config;
use crate::error::{json_error_response, ProxyErrorCode};
use crate::headers::is_websocket_upgrade;
use crate::metrics::ProxyMetrics;
use crate::pages;
use crate::pool::{ConnectionPool, PoolConfig};
use crate::provision::Provisioner;
use crate::registry::{BackendHandle, SessionRegistry};
use crate::routes::{with_query, Route};
use crate::session::{form_field, normalize_endpoint, parse_form, CookieCodec, Credentials, SessionId};
use crate::websocket;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full, LengthLimitError, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, ACCEPT, CACHE_CONTROL, CONTENT_TYPE, LOCATION, SET_COOKIE};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// Largest accepted login form body
const MAX_FORM_BYTES: usize = 16 * 1024;

type ProxyResponse = Response<BoxBody<Bytes, hyper::Error>>;

/// Everything a request handler needs, shared by every connection
pub struct ProxyState {
    pub registry: Arc<SessionRegistry>,
    pub provisioner: Arc<Provisioner>,
    pub metrics: Arc<ProxyMetrics>,
    pub pool: ConnectionPool,
    pub cookies: CookieCodec,
    pub request_timeout: Option<Duration>,
}

impl ProxyState {
    pub fn new(
        config: &Config,
        registry: Arc<SessionRegistry>,
        provisioner: Arc<Provisioner>,
        metrics: Arc<ProxyMetrics>,
    ) -> Arc<Self> {
        let pool = ConnectionPool::new(PoolConfig {
            max_idle_per_host: config.server.pool_max_idle_per_host,
            idle_timeout: Duration::from_secs(config.server.pool_idle_timeout_secs),
        });
        Arc::new(Self {
            registry,
            provisioner,
            metrics,
            pool,
            cookies: CookieCodec::new(&config.session, config.cookie_secure()),
            request_timeout: config.server.request_timeout(),
        })
    }

    /// The caller's session, only if its backend process is running
    fn live_session(&self, headers: &HeaderMap) -> Option<(SessionId, Arc<BackendHandle>)> {
        let id = self.cookies.credentials(headers)?.session_id();
        self.registry.live(&id).map(|handle| (id, handle))
    }
}

/// The main reverse proxy server
pub struct ProxyServer {
    bind_addr: SocketAddr,
    state: Arc<ProxyState>,
    shutdown_rx: watch::Receiver<bool>,
    tls_acceptor: Option<TlsAcceptor>,
}

impl ProxyServer {
    pub fn new(bind_addr: SocketAddr, state: Arc<ProxyState>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            state,
            shutdown_rx,
            tls_acceptor: None,
        }
    }

    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(acceptor);
        self
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_acceptor.is_some()
    }

    pub fn state(&self) -> &Arc<ProxyState> {
        &self.state
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let protocol = if self.tls_acceptor.is_some() { "HTTPS" } else { "HTTP" };
        info!(addr = %listener.local_addr()?, protocol, "Proxy server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            let tls_acceptor = self.tls_acceptor.clone();

                            tokio::spawn(async move {
                                if let Some(acceptor) = tls_acceptor {
                                    match acceptor.accept(stream).await {
                                        Ok(tls_stream) => {
                                            if let Err(e) = handle_connection(tls_stream, addr, state).await {
                                                debug!(addr = %addr, error = %e, "TLS connection error");
                                            }
                                        }
                                        Err(e) => {
                                            debug!(addr = %addr, error = %e, "TLS handshake failed");
                                        }
                                    }
                                } else if let Err(e) = handle_connection(stream, addr, state).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(stream: S, addr: SocketAddr, state: Arc<ProxyState>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let state = Arc::clone(&state);
        async move { handle_request(req, state, addr).await }
    });

    // HTTP/1.1 connections can still use WebSocket upgrades
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    state: Arc<ProxyState>,
    client_addr: SocketAddr,
) -> Result<ProxyResponse, hyper::Error> {
    let route = Route::classify(req.method(), req.uri().path(), is_websocket_upgrade(req.headers()));
    debug!(client = %client_addr, method = %req.method(), path = %req.uri().path(), ?route, "Incoming request");

    let always_redirect = route.redirects_when_unauthenticated();
    let response = match route {
        Route::Index => index(&req, &state),
        Route::Start => start(req, &state).await,
        Route::Logout => logout(req, &state).await,
        Route::Heartbeat => heartbeat(&req, &state),
        Route::Health => health(&state),
        Route::App { path } | Route::CatchAll { path } => proxy_http(req, &state, path, always_redirect).await,
        Route::WebSocket { path } => {
            let target = with_query(&path, req.uri().query());
            let session = state.live_session(req.headers());
            websocket::handle_upgrade(
                req,
                target,
                session,
                Arc::clone(&state.registry),
                Arc::clone(&state.metrics),
            )
            .await
        }
        Route::UnsupportedUpgrade => {
            json_error_response(ProxyErrorCode::NotFound, "No WebSocket endpoint at this path")
        }
    };

    Ok(response)
}

/// Login form, or the application shell for a live session
fn index(req: &Request<Incoming>, state: &ProxyState) -> ProxyResponse {
    let page = match state.live_session(req.headers()) {
        Some((_, handle)) => {
            handle.touch();
            let endpoint = state.cookies.endpoint(req.headers()).unwrap_or_default();
            pages::shell_page(&endpoint)
        }
        None => pages::login_page(state.cookies.endpoint(req.headers()).as_deref()),
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "text/html; charset=utf-8")
        .header(CACHE_CONTROL, "no-store")
        .body(Full::new(Bytes::from(page)).map_err(|never| match never {}).boxed())
        .expect("valid response builder")
}

/// Provision or reuse the backend for the submitted credentials
async fn start(req: Request<Incoming>, state: &ProxyState) -> ProxyResponse {
    let body = match Limited::new(req.into_body(), MAX_FORM_BYTES).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
            warn!(limit = MAX_FORM_BYTES, "Login form too large");
            return json_error_response(
                ProxyErrorCode::FormTooLarge,
                format!("Form body exceeds {} bytes", MAX_FORM_BYTES),
            );
        }
        Err(e) => {
            warn!(error = %e, "Failed to read login form");
            return json_error_response(ProxyErrorCode::InvalidForm, format!("Could not read form body: {}", e));
        }
    };
    let form = parse_form(&body);

    let endpoint = match normalize_endpoint(form_field(&form, &["endpoint", "host"]).unwrap_or_default()) {
        Ok(endpoint) => endpoint,
        Err(msg) => return json_error_response(ProxyErrorCode::InvalidEndpoint, msg),
    };
    let credential = form_field(&form, &["credential", "token"]).unwrap_or_default().trim();
    if credential.is_empty() {
        return json_error_response(ProxyErrorCode::MissingCredential, "credential is required");
    }

    let credentials = Credentials::new(endpoint, credential);
    let id = credentials.session_id();
    info!(session = %id, endpoint = %credentials.endpoint, "Session start requested");

    match state
        .provisioner
        .ensure_session(&state.registry, credentials.clone())
        .await
    {
        Ok(handle) => {
            handle.touch();
            redirect_home(&state.cookies.set_cookies(&credentials))
        }
        Err(e) => {
            error!(session = %id, error = %e, "Failed to start backend");
            json_error_response(e.code(), format!("Failed to start backend: {}", e))
        }
    }
}

/// Tear down the caller's session and clear the cookies
async fn logout(req: Request<Incoming>, state: &ProxyState) -> ProxyResponse {
    let credentials = state.cookies.credentials(req.headers());
    if let Some(credentials) = credentials {
        let id = credentials.session_id();
        if let Some(handle) = state.registry.remove(&id) {
            info!(session = %id, port = handle.port(), "Logout");
            state.provisioner.teardown(id, &handle).await;
        }
    }
    redirect_home(&state.cookies.clear_cookies())
}

fn heartbeat(req: &Request<Incoming>, state: &ProxyState) -> ProxyResponse {
    if let Some((_, handle)) = state.live_session(req.headers()) {
        handle.touch();
    }
    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .expect("valid response builder")
}

fn health(state: &ProxyState) -> ProxyResponse {
    let report = state.metrics.health(&state.registry, &state.pool.stats());
    match serde_json::to_string_pretty(&report) {
        Ok(mut body) => {
            body.push('\n');
            Response::builder()
                .status(StatusCode::OK)
                .header(CONTENT_TYPE, "application/json")
                .header(CACHE_CONTROL, "no-store")
                .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed())
                .expect("valid response builder")
        }
        Err(e) => json_error_response(ProxyErrorCode::InternalError, format!("Failed to encode health report: {}", e)),
    }
}

/// Forward an HTTP request to the caller's backend. Never provisions.
async fn proxy_http(req: Request<Incoming>, state: &ProxyState, path: String, always_redirect: bool) -> ProxyResponse {
    let (id, handle) = match state.live_session(req.headers()) {
        Some(session) => session,
        None => {
            if always_redirect || path == "/" || accepts_html(req.headers()) {
                return redirect_home(&[]);
            }
            return json_error_response(ProxyErrorCode::SessionNotLive, "No live session");
        }
    };

    handle.touch();
    let port = handle.port();
    let target = with_query(&path, req.uri().query());
    let method = req.method().clone();

    let forward = state.pool.forward(req, port, &target);
    let result = match state.request_timeout {
        Some(timeout) => match tokio::time::timeout(timeout, forward).await {
            Ok(result) => result,
            Err(_) => {
                warn!(session = %id, port, %method, timeout_secs = timeout.as_secs(), "Backend request timed out");
                return json_error_response(
                    ProxyErrorCode::RequestTimeout,
                    format!("Request timed out after {} seconds", timeout.as_secs()),
                );
            }
        },
        None => forward.await,
    };

    match result {
        Ok(response) => {
            debug!(session = %id, port, %method, status = %response.status(), "Proxied");
            response
        }
        Err(e) => {
            let detail = error_chain(&e);
            warn!(session = %id, port, %method, error = %detail, "Upstream request failed");
            json_error_response(ProxyErrorCode::UpstreamTransport, format!("Upstream error: {}", detail))
        }
    }
}

fn accepts_html(headers: &HeaderMap) -> bool {
    headers
        .get_all(ACCEPT)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.contains("text/html"))
}

/// 303 to `/`, optionally setting cookies
fn redirect_home(cookies: &[String]) -> ProxyResponse {
    let mut builder = Response::builder()
        .status(StatusCode::SEE_OTHER)
        .header(LOCATION, "/")
        .header(CACHE_CONTROL, "no-store");
    for cookie in cookies {
        builder = builder.header(SET_COOKIE, cookie.as_str());
    }
    match builder.body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed()) {
        Ok(response) => response,
        // Only reachable if a cookie value is not a valid header value
        Err(e) => json_error_response(ProxyErrorCode::InternalError, format!("Failed to build redirect: {}", e)),
    }
}

/// Display an error followed by its sources, skipping a source that
/// repeats the message before it
fn error_chain(err: &dyn std::error::Error) -> String {
    let mut previous = err.to_string();
    let mut out = previous.clone();
    let mut source = err.source();
    while let Some(cause) = source {
        let message = cause.to_string();
        if message != previous {
            out.push_str(": ");
            out.push_str(&message);
        }
        previous = message;
        source = cause.source();
    }
    out
}
