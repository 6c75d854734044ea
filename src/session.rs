//! Session identity, credentials and the cookies that carry them
//!
//! A session is keyed by a SHA-256 digest of the (endpoint, credential) pair
//! so the registry never holds raw secrets as map keys and log lines can name
//! a session by a short fingerprint.

use crate::config::SessionConfig;
use hyper::header::{HeaderMap, COOKIE};
use sha2::{Digest, Sha256};
use std::fmt;

/// Number of hex characters shown when a session is displayed
const FINGERPRINT_LEN: usize = 12;

/// The caller-supplied secret pair
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub endpoint: String,
    pub credential: String,
}

impl Credentials {
    pub fn new(endpoint: impl Into<String>, credential: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            credential: credential.into(),
        }
    }

    pub fn session_id(&self) -> SessionId {
        SessionId::derive(&self.endpoint, &self.credential)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("endpoint", &self.endpoint)
            .field("credential", &"<redacted>")
            .finish()
    }
}

/// Deterministic identity of a session; a value type
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId([u8; 32]);

impl SessionId {
    pub fn derive(endpoint: &str, credential: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(endpoint.as_bytes());
        // Separator keeps ("ab", "c") and ("a", "bc") apart
        hasher.update([0u8]);
        hasher.update(credential.as_bytes());
        Self(hasher.finalize().into())
    }

    /// Short hex form used in logs
    pub fn fingerprint(&self) -> String {
        let mut hex = hex::encode(self.0);
        hex.truncate(FINGERPRINT_LEN);
        hex
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.fingerprint())
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self.fingerprint())
    }
}

/// Normalize a submitted endpoint: default to https and end with `/`
pub fn normalize_endpoint(raw: &str) -> Result<String, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err("endpoint is required".to_string());
    }

    let mut endpoint = if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    };
    if !endpoint.ends_with('/') {
        endpoint.push('/');
    }
    Ok(endpoint)
}

/// Look up a cookie by name across every `Cookie` header
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, _)| *k == name)
        .and_then(|(_, v)| {
            urlencoding::decode(v.trim_matches('"'))
                .ok()
                .map(|s| s.into_owned())
        })
        .filter(|v| !v.is_empty())
}

/// Reads and writes the two session cookies
#[derive(Debug, Clone)]
pub struct CookieCodec {
    endpoint_cookie: String,
    credential_cookie: String,
    max_age_secs: u64,
    secure: bool,
}

impl CookieCodec {
    pub fn new(config: &SessionConfig, secure: bool) -> Self {
        Self {
            endpoint_cookie: config.endpoint_cookie.clone(),
            credential_cookie: config.credential_cookie.clone(),
            max_age_secs: config.cookie_max_age_secs,
            secure,
        }
    }

    /// Credentials carried by the request, if both cookies are present
    pub fn credentials(&self, headers: &HeaderMap) -> Option<Credentials> {
        let endpoint = cookie_value(headers, &self.endpoint_cookie)?;
        let credential = cookie_value(headers, &self.credential_cookie)?;
        Some(Credentials::new(endpoint, credential))
    }

    /// Only the endpoint cookie (used to prefill the login form)
    pub fn endpoint(&self, headers: &HeaderMap) -> Option<String> {
        cookie_value(headers, &self.endpoint_cookie)
    }

    /// `Set-Cookie` values establishing a session
    pub fn set_cookies(&self, credentials: &Credentials) -> [String; 2] {
        [
            self.build(&self.credential_cookie, &credentials.credential, self.max_age_secs),
            self.build(&self.endpoint_cookie, &credentials.endpoint, self.max_age_secs),
        ]
    }

    /// `Set-Cookie` values expiring both cookies
    pub fn clear_cookies(&self) -> [String; 2] {
        [
            self.build(&self.credential_cookie, "", 0),
            self.build(&self.endpoint_cookie, "", 0),
        ]
    }

    fn build(&self, name: &str, value: &str, max_age: u64) -> String {
        let mut cookie = format!(
            "{}={}; Path=/; Max-Age={}; HttpOnly; SameSite=Lax",
            name,
            urlencoding::encode(value),
            max_age
        );
        if self.secure {
            cookie.push_str("; Secure");
        }
        cookie
    }
}

/// Parse an `application/x-www-form-urlencoded` body into pairs
pub fn parse_form(body: &[u8]) -> Vec<(String, String)> {
    let decode = |s: &str| {
        let spaced = s.replace('+', " ");
        urlencoding::decode(&spaced)
            .map(|v| v.into_owned())
            .unwrap_or(spaced)
    };

    String::from_utf8_lossy(body)
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (decode(k), decode(v)),
            None => (decode(pair), String::new()),
        })
        .collect()
}

/// First value among `names` present in the form
pub fn form_field<'a>(form: &'a [(String, String)], names: &[&str]) -> Option<&'a str> {
    names.iter().find_map(|name| {
        form.iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    })
}
