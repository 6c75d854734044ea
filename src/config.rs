use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Placeholder in backend arguments that receives the allocated port
pub const PORT_PLACEHOLDER: &str = "{port}";

/// Global configuration for the proxy
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Session cookie and lifetime settings
    #[serde(default)]
    pub session: SessionConfig,

    /// How per-session backends are provisioned
    #[serde(default)]
    pub backend: BackendConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Listen port (default: 8000)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Maximum idle connections per backend port (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Maximum time to wait for a backend response in seconds (0 disables)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Path to PID file (optional)
    pub pid_file: Option<String>,

    /// Path to TLS certificate file (PEM format)
    pub tls_cert: Option<String>,

    /// Path to TLS private key file (PEM format)
    pub tls_key: Option<String>,
}

impl ServerConfig {
    pub fn tls_enabled(&self) -> bool {
        self.tls_cert.is_some() && self.tls_key.is_some()
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        match self.request_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            request_timeout_secs: default_request_timeout(),
            pid_file: None,
            tls_cert: None,
            tls_key: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    /// Cookie carrying the target endpoint
    #[serde(default = "default_endpoint_cookie")]
    pub endpoint_cookie: String,

    /// Cookie carrying the access credential
    #[serde(default = "default_credential_cookie")]
    pub credential_cookie: String,

    /// Cookie lifetime in seconds (default: 8 hours)
    #[serde(default = "default_cookie_max_age")]
    pub cookie_max_age_secs: u64,

    /// Mark cookies `Secure`. Defaults to whether TLS is enabled.
    pub cookie_secure: Option<bool>,

    /// Inactivity window before a backend is reaped (default: 60 minutes)
    #[serde(default = "default_inactivity_timeout")]
    pub inactivity_timeout_secs: u64,

    /// Idle reaper scan period (default: 60 seconds)
    #[serde(default = "default_reaper_interval")]
    pub reaper_interval_secs: u64,
}

impl SessionConfig {
    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout_secs)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            endpoint_cookie: default_endpoint_cookie(),
            credential_cookie: default_credential_cookie(),
            cookie_max_age_secs: default_cookie_max_age(),
            cookie_secure: None,
            inactivity_timeout_secs: default_inactivity_timeout(),
            reaper_interval_secs: default_reaper_interval(),
        }
    }
}

/// A one-time preparation command run inside a fresh session directory
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct PrepareStep {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Configuration for the per-session backend process
///
/// # Security Warning
///
/// `command`, `args` and `prepare` are executed directly with the permissions
/// of the proxy process. Configuration files must be protected accordingly.
#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    /// Executable launched for each session
    #[serde(default = "default_backend_command")]
    pub command: String,

    /// Arguments; `{port}` is replaced with the allocated port
    #[serde(default = "default_backend_args")]
    pub args: Vec<String>,

    /// Tree copied into every session working directory
    pub template_dir: Option<String>,

    /// Prefix for session working directory names
    #[serde(default = "default_workdir_prefix")]
    pub workdir_prefix: String,

    /// File and directory names skipped while copying the template
    #[serde(default = "default_exclude")]
    pub exclude: Vec<String>,

    /// Commands run once inside the new working directory before launch
    #[serde(default)]
    pub prepare: Vec<PrepareStep>,

    /// Environment variable receiving the session endpoint
    #[serde(default = "default_endpoint_env")]
    pub endpoint_env: String,

    /// Environment variable receiving the session credential
    #[serde(default = "default_credential_env")]
    pub credential_env: String,

    /// Alternate-credential variables removed from the child environment
    #[serde(default = "default_clear_env")]
    pub clear_env: Vec<String>,

    /// Extra environment variables for the child
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Maximum wait for the backend port to accept connections
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    /// Interval between readiness connection attempts in milliseconds
    #[serde(default = "default_ready_poll_interval")]
    pub ready_poll_interval_ms: u64,

    /// Grace period in seconds between SIGTERM and SIGKILL
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,
}

impl BackendConfig {
    /// Create a backend config for `command` with every other field defaulted
    pub fn local(command: &str) -> Self {
        Self {
            command: command.to_string(),
            ..Self::default()
        }
    }

    /// Set arguments (builder pattern)
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Set the template directory (builder pattern)
    pub fn with_template_dir(mut self, dir: &str) -> Self {
        self.template_dir = Some(dir.to_string());
        self
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn ready_poll_interval(&self) -> Duration {
        Duration::from_millis(self.ready_poll_interval_ms)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }

    /// Arguments with the port placeholder substituted
    pub fn args_for_port(&self, port: u16) -> Vec<String> {
        let port = port.to_string();
        self.args
            .iter()
            .map(|arg| arg.replace(PORT_PLACEHOLDER, &port))
            .collect()
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            command: default_backend_command(),
            args: default_backend_args(),
            template_dir: None,
            workdir_prefix: default_workdir_prefix(),
            exclude: default_exclude(),
            prepare: Vec::new(),
            endpoint_env: default_endpoint_env(),
            credential_env: default_credential_env(),
            clear_env: default_clear_env(),
            env: HashMap::new(),
            startup_timeout_secs: default_startup_timeout(),
            ready_poll_interval_ms: default_ready_poll_interval(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
        }
    }
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    8000
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_request_timeout() -> u64 {
    300
}

fn default_endpoint_cookie() -> String {
    "goose_host".to_string()
}

fn default_credential_cookie() -> String {
    "goose_token".to_string()
}

fn default_cookie_max_age() -> u64 {
    8 * 60 * 60
}

fn default_inactivity_timeout() -> u64 {
    60 * 60
}

fn default_reaper_interval() -> u64 {
    60
}

fn default_backend_command() -> String {
    "goose".to_string()
}

fn default_backend_args() -> Vec<String> {
    ["web", "--host", "127.0.0.1", "--port", PORT_PLACEHOLDER]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_workdir_prefix() -> String {
    "session-".to_string()
}

fn default_exclude() -> Vec<String> {
    [
        ".git",
        ".venv",
        "__pycache__",
        ".mypy_cache",
        ".pytest_cache",
        ".ruff_cache",
        ".idea",
        ".vscode",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_endpoint_env() -> String {
    "DATABRICKS_HOST".to_string()
}

fn default_credential_env() -> String {
    "DATABRICKS_TOKEN".to_string()
}

fn default_clear_env() -> Vec<String> {
    vec![
        "DATABRICKS_CLIENT_ID".to_string(),
        "DATABRICKS_CLIENT_SECRET".to_string(),
    ]
}

fn default_startup_timeout() -> u64 {
    30
}

fn default_ready_poll_interval() -> u64 {
    200
}

fn default_shutdown_grace_period() -> u64 {
    5
}

impl Config {
    /// Load configuration from a TOML file. A missing file yields the defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let config: Config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            Config::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Whether session cookies carry the `Secure` attribute
    pub fn cookie_secure(&self) -> bool {
        self.session
            .cookie_secure
            .unwrap_or_else(|| self.server.tls_enabled())
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.backend.command.trim().is_empty() {
            errors.push("backend: 'command' must not be empty".to_string());
        }
        if self.backend.startup_timeout_secs == 0 {
            errors.push("backend: 'startup_timeout_secs' must be greater than 0".to_string());
        }
        if self.backend.ready_poll_interval_ms == 0 {
            errors.push("backend: 'ready_poll_interval_ms' must be greater than 0".to_string());
        }
        for step in &self.backend.prepare {
            if step.command.trim().is_empty() {
                errors.push("backend: prepare step with empty 'command'".to_string());
            }
        }

        if self.session.inactivity_timeout_secs == 0 {
            errors.push("session: 'inactivity_timeout_secs' must be greater than 0".to_string());
        }
        if self.session.reaper_interval_secs == 0 {
            errors.push("session: 'reaper_interval_secs' must be greater than 0".to_string());
        }
        if self.session.endpoint_cookie.is_empty() || self.session.credential_cookie.is_empty() {
            errors.push("session: cookie names must not be empty".to_string());
        } else if self.session.endpoint_cookie == self.session.credential_cookie {
            errors.push("session: endpoint and credential cookies must differ".to_string());
        }

        if self.server.tls_cert.is_some() != self.server.tls_key.is_some() {
            errors.push("server: 'tls_cert' and 'tls_key' must be set together".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
