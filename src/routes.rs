//! Route table with explicit precedence
//!
//! Control routes are matched first and on exact method and path. Anything
//! that falls through lands on the catch-all proxy, so a backend can never
//! shadow `/start`, `/logout`, `/heartbeat` or `/_health`.

use hyper::Method;

/// Prefix under which the backend application is mounted
pub const APP_PREFIX: &str = "/goose";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// `GET /`: login form or application shell
    Index,
    /// `POST /start`
    Start,
    /// `GET /logout`
    Logout,
    /// `POST /heartbeat`
    Heartbeat,
    /// `GET /_health`
    Health,
    /// `/goose`, `/goose/`, `/goose/{path}`; carries the backend path
    App { path: String },
    /// WebSocket upgrade on `/ws` or `/goose/{path}`; carries the backend path
    WebSocket { path: String },
    /// WebSocket upgrade anywhere else
    UnsupportedUpgrade,
    /// Lowest priority: any other path, forwarded verbatim
    CatchAll { path: String },
}

impl Route {
    /// Classify a request. `path` is the URI path without the query string.
    pub fn classify(method: &Method, path: &str, is_websocket: bool) -> Route {
        if is_websocket {
            return match path {
                "/ws" => Route::WebSocket {
                    path: "/ws".to_string(),
                },
                _ => match strip_app_prefix(path) {
                    Some(rest) if path.len() > APP_PREFIX.len() + 1 => Route::WebSocket { path: rest },
                    _ => Route::UnsupportedUpgrade,
                },
            };
        }

        match (method, path) {
            (&Method::GET, "/") => return Route::Index,
            (&Method::POST, "/start") => return Route::Start,
            (&Method::GET, "/logout") => return Route::Logout,
            (&Method::POST, "/heartbeat") => return Route::Heartbeat,
            (&Method::GET, "/_health") => return Route::Health,
            _ => {}
        }

        if let Some(rest) = strip_app_prefix(path) {
            return Route::App { path: rest };
        }

        Route::CatchAll {
            path: path.to_string(),
        }
    }

    /// Whether an unauthenticated request on this route is always sent to login
    pub fn redirects_when_unauthenticated(&self) -> bool {
        matches!(self, Route::App { .. })
    }
}

/// `/goose` → `/`, `/goose/` → `/`, `/goose/a/b` → `/a/b`; other paths → None
fn strip_app_prefix(path: &str) -> Option<String> {
    let rest = path.strip_prefix(APP_PREFIX)?;
    if rest.is_empty() {
        return Some("/".to_string());
    }
    if rest.starts_with('/') {
        return Some(rest.to_string());
    }
    // `/gooseberry` is not under the prefix
    None
}

/// Backend path plus the original query string, if any
pub fn with_query(path: &str, query: Option<&str>) -> String {
    match query {
        Some(q) if !q.is_empty() => format!("{}?{}", path, q),
        _ => path.to_string(),
    }
}
