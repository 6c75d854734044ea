//! Backend provisioning and teardown
//!
//! Provisioning turns a session's credentials into a running backend:
//! pick a free loopback port, materialize a private working directory from
//! the template tree, run the one-time prepare steps, launch the backend with
//! the credentials in its environment, then wait until the port accepts
//! connections. Filesystem work and prepare steps run on the blocking pool.

use crate::config::{BackendConfig, PrepareStep};
use crate::error::ProvisionError;
use crate::process::ProcessHandle;
use crate::registry::{BackendHandle, ProvisionResult, SessionRegistry};
use crate::session::{Credentials, SessionId};
use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

/// Attempts at finding a port not already held by a live backend
const PORT_ALLOCATION_ATTEMPTS: usize = 16;

/// Upper bound on a single readiness connection attempt
const CONNECT_ATTEMPT_TIMEOUT: Duration = Duration::from_millis(500);

/// Stderr bytes kept in a failed prepare step's error message
const PREPARE_STDERR_TAIL: usize = 512;

pub struct Provisioner {
    config: BackendConfig,
}

impl Provisioner {
    pub fn new(config: BackendConfig) -> Arc<Self> {
        Arc::new(Self { config })
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Return the live backend for `credentials`, provisioning it if needed
    pub async fn ensure_session(
        self: &Arc<Self>,
        registry: &Arc<SessionRegistry>,
        credentials: Credentials,
    ) -> ProvisionResult {
        let id = credentials.session_id();
        let provisioner = Arc::clone(self);
        let ports = Arc::clone(registry);
        let stale_provisioner = Arc::clone(self);

        registry
            .ensure(
                id,
                move || async move {
                    let in_use = ports.ports_in_use();
                    provisioner.provision(id, &credentials, &in_use).await
                },
                move |stale| async move {
                    stale_provisioner.teardown(id, &stale).await;
                },
            )
            .await
    }

    /// Bring up a fresh backend for one session
    pub async fn provision(
        &self,
        id: SessionId,
        credentials: &Credentials,
        ports_in_use: &HashSet<u16>,
    ) -> Result<BackendHandle, ProvisionError> {
        let started = Instant::now();
        let port = allocate_port(ports_in_use)
            .map_err(|e| ProvisionError::provisioning(format!("port allocation failed: {}", e)))?;

        info!(session = %id, port, "Provisioning backend");

        let config = self.config.clone();
        let workdir = tokio::task::spawn_blocking(move || prepare_workdir(&config))
            .await
            .map_err(|e| ProvisionError::provisioning(format!("prepare task failed: {}", e)))??;

        debug!(session = %id, workdir = %workdir.display(), "Working directory ready");

        let process = match self.launch(id, credentials, port, &workdir) {
            Ok(process) => process,
            Err(e) => {
                remove_workdir(workdir).await;
                return Err(e);
            }
        };

        if let Err(e) = wait_for_port(
            port,
            &process,
            self.config.startup_timeout(),
            self.config.ready_poll_interval(),
        )
        .await
        {
            warn!(session = %id, port, error = %e, "Backend never became ready");
            process.kill();
            remove_workdir(workdir).await;
            return Err(e);
        }

        info!(
            session = %id,
            port,
            pid = ?process.pid(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Backend ready"
        );

        Ok(BackendHandle::new(port, process, workdir))
    }

    fn launch(
        &self,
        id: SessionId,
        credentials: &Credentials,
        port: u16,
        workdir: &Path,
    ) -> Result<ProcessHandle, ProvisionError> {
        let mut cmd = Command::new(&self.config.command);
        cmd.args(self.config.args_for_port(port))
            .current_dir(workdir)
            .stdin(Stdio::null());

        for name in &self.config.clear_env {
            cmd.env_remove(name);
        }
        cmd.envs(&self.config.env)
            .env("PORT", port.to_string())
            .env(&self.config.endpoint_env, &credentials.endpoint)
            .env(&self.config.credential_env, &credentials.credential);

        debug!(
            session = %id,
            command = %self.config.command,
            port,
            "Launching backend process"
        );

        ProcessHandle::spawn(cmd, &id.to_string()).map_err(|e| {
            ProvisionError::provisioning(format!(
                "failed to launch '{}': {}",
                self.config.command, e
            ))
        })
    }

    /// Stop the process and delete the working directory. Never fails.
    pub async fn teardown(&self, id: SessionId, handle: &BackendHandle) {
        let outcome = handle
            .process()
            .terminate(self.config.shutdown_grace_period())
            .await;
        debug!(session = %id, port = handle.port(), ?outcome, "Backend process stopped");

        remove_workdir(handle.workdir().to_path_buf()).await;
        info!(session = %id, port = handle.port(), "Session torn down");
    }

    /// Remove and tear down every registered session
    pub async fn teardown_all(&self, registry: &SessionRegistry) {
        let entries = registry.snapshot();
        if entries.is_empty() {
            return;
        }
        info!(count = entries.len(), "Tearing down all sessions");

        let mut tasks = Vec::with_capacity(entries.len());
        for (id, handle) in entries {
            if registry.remove_if_same(&id, &handle) {
                tasks.push(async move { self.teardown(id, &handle).await });
            }
        }
        futures::future::join_all(tasks).await;
    }
}

/// Pick a free loopback port, avoiding ports held by live backends.
///
/// The socket is released before returning, so this is best effort: another
/// process could take the port before the backend binds it.
pub fn allocate_port(in_use: &HashSet<u16>) -> std::io::Result<u16> {
    for _ in 0..PORT_ALLOCATION_ATTEMPTS {
        let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))?;
        let port = listener.local_addr()?.port();
        if !in_use.contains(&port) {
            return Ok(port);
        }
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::AddrInUse,
        "no free port outside those held by live backends",
    ))
}

/// Create the session directory, copy the template and run prepare steps.
/// On failure nothing is left on disk.
fn prepare_workdir(config: &BackendConfig) -> Result<PathBuf, ProvisionError> {
    let workdir = tempfile::Builder::new()
        .prefix(&config.workdir_prefix)
        .tempdir()
        .map_err(|e| ProvisionError::provisioning(format!("failed to create working directory: {}", e)))?
        .keep();

    let result = (|| -> Result<(), ProvisionError> {
        if let Some(template) = &config.template_dir {
            copy_template(Path::new(template), &workdir, &config.exclude).map_err(|e| {
                ProvisionError::provisioning(format!("failed to copy template '{}': {}", template, e))
            })?;
        }
        for step in &config.prepare {
            run_prepare_step(step, &workdir)?;
        }
        Ok(())
    })();

    match result {
        Ok(()) => Ok(workdir),
        Err(e) => {
            if let Err(rm) = std::fs::remove_dir_all(&workdir) {
                warn!(workdir = %workdir.display(), error = %rm, "Failed to remove partial working directory");
            }
            Err(e)
        }
    }
}

/// Recursively copy `src` into `dst`, skipping entries whose name is excluded
pub fn copy_template(src: &Path, dst: &Path, exclude: &[String]) -> std::io::Result<()> {
    let walker = WalkDir::new(src).follow_links(false).into_iter().filter_entry(|entry| {
        entry.depth() == 0
            || !exclude
                .iter()
                .any(|name| entry.file_name().to_str() == Some(name.as_str()))
    });

    for entry in walker {
        let entry = entry.map_err(std::io::Error::other)?;
        let relative = match entry.path().strip_prefix(src) {
            Ok(rel) if rel.as_os_str().is_empty() => continue,
            Ok(rel) => rel,
            Err(_) => continue,
        };
        let target = dst.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(src: &Path, dst: &Path) -> std::io::Result<()> {
    let link = std::fs::read_link(src)?;
    std::os::unix::fs::symlink(link, dst)
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::copy(src, dst).map(|_| ())
}

fn run_prepare_step(step: &PrepareStep, workdir: &Path) -> Result<(), ProvisionError> {
    let command_line = std::iter::once(step.command.as_str())
        .chain(step.args.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ");
    debug!(step = %command_line, workdir = %workdir.display(), "Running prepare step");

    let output = std::process::Command::new(&step.command)
        .args(&step.args)
        .envs(&step.env)
        .current_dir(workdir)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| ProvisionError::provisioning(format!("prepare step `{}` failed to start: {}", command_line, e)))?;

    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr = stderr.trim();
    let tail = match stderr.char_indices().rev().nth(PREPARE_STDERR_TAIL) {
        Some((idx, _)) => &stderr[idx..],
        None => stderr,
    };
    Err(ProvisionError::provisioning(format!(
        "prepare step `{}` exited with {}: {}",
        command_line, output.status, tail
    )))
}

/// Poll `port` until it accepts a connection, the process exits, or `timeout` elapses
pub async fn wait_for_port(
    port: u16,
    process: &ProcessHandle,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<(), ProvisionError> {
    let deadline = Instant::now() + timeout;
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));

    loop {
        if let Some(status) = process.exit_status() {
            return Err(ProvisionError::provisioning(format!(
                "backend exited with {} before accepting connections",
                status
            )));
        }

        if let Ok(Ok(_)) = tokio::time::timeout(CONNECT_ATTEMPT_TIMEOUT, TcpStream::connect(addr)).await {
            return Ok(());
        }

        if Instant::now() >= deadline {
            return Err(ProvisionError::ReadinessTimeout { port, timeout });
        }
        tokio::time::sleep(poll_interval).await;
    }
}

async fn remove_workdir(path: PathBuf) {
    let result = tokio::task::spawn_blocking(move || {
        let outcome = std::fs::remove_dir_all(&path);
        (path, outcome)
    })
    .await;

    match result {
        Ok((_, Ok(()))) => {}
        Ok((path, Err(e))) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(workdir = %path.display(), "Working directory already gone");
        }
        Ok((path, Err(e))) => {
            warn!(workdir = %path.display(), error = %e, "Failed to remove working directory");
        }
        Err(e) => error!(error = %e, "Working directory removal task failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn leftover_dirs(prefix: &str) -> Vec<PathBuf> {
        std::fs::read_dir(std::env::temp_dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(prefix))
            .map(|e| e.path())
            .collect()
    }

    fn unique_prefix(tag: &str) -> String {
        format!("sg-{}-{}-", tag, std::process::id())
    }

    fn creds() -> Credentials {
        Credentials::new("https://e1.example.com/", "c1")
    }

    #[test]
    fn test_allocate_port_skips_ports_in_use() {
        let port = allocate_port(&HashSet::new()).unwrap();
        assert!(port > 0);

        let mut in_use = HashSet::new();
        in_use.insert(port);
        let other = allocate_port(&in_use).unwrap();
        assert_ne!(other, port);
    }

    #[test]
    fn test_copy_template_excludes_named_entries() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();

        std::fs::create_dir_all(src.path().join("app/nested")).unwrap();
        std::fs::write(src.path().join("app/nested/main.py"), "print('hi')").unwrap();
        std::fs::write(src.path().join("pyproject.toml"), "[project]").unwrap();
        std::fs::create_dir_all(src.path().join(".git/objects")).unwrap();
        std::fs::write(src.path().join(".git/HEAD"), "ref").unwrap();
        std::fs::create_dir_all(src.path().join("app/__pycache__")).unwrap();
        std::fs::write(src.path().join("app/__pycache__/x.pyc"), "").unwrap();

        let exclude = vec![".git".to_string(), "__pycache__".to_string()];
        copy_template(src.path(), dst.path(), &exclude).unwrap();

        assert!(dst.path().join("pyproject.toml").exists());
        assert_eq!(
            std::fs::read_to_string(dst.path().join("app/nested/main.py")).unwrap(),
            "print('hi')"
        );
        assert!(!dst.path().join(".git").exists());
        assert!(!dst.path().join("app/__pycache__").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_copy_template_preserves_symlinks() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("real.txt"), "data").unwrap();
        std::os::unix::fs::symlink("real.txt", src.path().join("link.txt")).unwrap();

        copy_template(src.path(), dst.path(), &[]).unwrap();

        let link = dst.path().join("link.txt");
        assert!(std::fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
        assert_eq!(std::fs::read_to_string(link).unwrap(), "data");
    }

    #[test]
    fn test_prepare_workdir_runs_steps_in_directory() {
        let template = tempfile::tempdir().unwrap();
        std::fs::write(template.path().join("seed.txt"), "seed").unwrap();

        let mut config = BackendConfig::local("unused").with_template_dir(template.path().to_str().unwrap());
        config.workdir_prefix = unique_prefix("prep-ok");
        config.prepare = vec![PrepareStep {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), "cp seed.txt prepared.txt".to_string()],
            env: HashMap::new(),
        }];

        let workdir = prepare_workdir(&config).unwrap();
        assert_eq!(std::fs::read_to_string(workdir.join("prepared.txt")).unwrap(), "seed");
        std::fs::remove_dir_all(workdir).unwrap();
    }

    #[test]
    fn test_failed_prepare_step_removes_directory() {
        let mut config = BackendConfig::local("unused");
        config.workdir_prefix = unique_prefix("prep-fail");
        config.prepare = vec![PrepareStep {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), "echo 'lock file out of date' >&2; exit 3".to_string()],
            env: HashMap::new(),
        }];

        let err = prepare_workdir(&config).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("prepare step `sh -c"));
        assert!(msg.contains("lock file out of date"));
        assert!(leftover_dirs(&config.workdir_prefix).is_empty());
    }

    #[test]
    fn test_missing_template_fails_provisioning() {
        let mut config = BackendConfig::local("unused").with_template_dir("/nonexistent/template/dir");
        config.workdir_prefix = unique_prefix("no-template");

        let err = prepare_workdir(&config).unwrap_err();
        assert!(matches!(err, ProvisionError::Provisioning(_)));
        assert!(leftover_dirs(&config.workdir_prefix).is_empty());
    }

    #[tokio::test]
    async fn test_readiness_timeout_kills_and_cleans_up() {
        let mut config = BackendConfig::local("sleep").with_args(vec!["60".to_string()]);
        config.workdir_prefix = unique_prefix("ready-timeout");
        config.startup_timeout_secs = 1;
        config.ready_poll_interval_ms = 50;
        let provisioner = Provisioner::new(config);

        let started = Instant::now();
        let err = provisioner
            .provision(creds().session_id(), &creds(), &HashSet::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ProvisionError::ReadinessTimeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(leftover_dirs(&provisioner.config().workdir_prefix).is_empty());
    }

    #[tokio::test]
    async fn test_early_exit_fails_without_waiting_for_deadline() {
        let mut config = BackendConfig::local("false").with_args(vec![]);
        config.workdir_prefix = unique_prefix("early-exit");
        config.startup_timeout_secs = 30;
        let provisioner = Provisioner::new(config);

        let started = Instant::now();
        let err = provisioner
            .provision(creds().session_id(), &creds(), &HashSet::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ProvisionError::Provisioning(_)));
        assert!(err.to_string().contains("before accepting connections"));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(leftover_dirs(&provisioner.config().workdir_prefix).is_empty());
    }

    #[tokio::test]
    async fn test_unknown_command_fails_provisioning() {
        let mut config = BackendConfig::local("/nonexistent/backend-binary");
        config.workdir_prefix = unique_prefix("bad-cmd");
        let provisioner = Provisioner::new(config);

        let err = provisioner
            .provision(creds().session_id(), &creds(), &HashSet::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed to launch"));
        assert!(leftover_dirs(&provisioner.config().workdir_prefix).is_empty());
    }

    #[tokio::test]
    async fn test_wait_for_port_succeeds_once_listening() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut cmd = Command::new("sleep");
        cmd.arg("60");
        let process = ProcessHandle::spawn(cmd, "test").unwrap();

        wait_for_port(port, &process, Duration::from_secs(2), Duration::from_millis(20))
            .await
            .unwrap();
        process.kill();
    }

    #[tokio::test]
    async fn test_teardown_stops_process_and_removes_directory() {
        let workdir = tempfile::tempdir().unwrap().keep();
        std::fs::write(workdir.join("state"), "x").unwrap();
        let mut cmd = Command::new("sleep");
        cmd.arg("60");
        let handle = BackendHandle::new(1, ProcessHandle::spawn(cmd, "test").unwrap(), workdir.clone());

        let provisioner = Provisioner::new(BackendConfig::default());
        provisioner.teardown(creds().session_id(), &handle).await;

        assert!(!handle.is_running());
        assert!(!workdir.exists());

        // Second teardown is harmless
        provisioner.teardown(creds().session_id(), &handle).await;
    }
}
