use crate::error::ProvisionError;
use crate::process::ProcessHandle;
use crate::session::SessionId;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Outcome of one provisioning attempt, shared with every waiter
pub type ProvisionResult = Result<Arc<BackendHandle>, ProvisionError>;

/// A live backend owned by one session
pub struct BackendHandle {
    port: u16,
    process: ProcessHandle,
    workdir: PathBuf,
    last_activity: Mutex<Instant>,
}

impl BackendHandle {
    pub fn new(port: u16, process: ProcessHandle, workdir: PathBuf) -> Self {
        Self {
            port,
            process,
            workdir,
            last_activity: Mutex::new(Instant::now()),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn process(&self) -> &ProcessHandle {
        &self.process
    }

    pub fn is_running(&self) -> bool {
        self.process.is_running()
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity().elapsed()
    }

    /// Record activity; the timestamp only moves forward
    pub fn touch(&self) {
        let now = Instant::now();
        let mut last = self.last_activity.lock();
        if now > *last {
            *last = now;
        }
    }
}

impl std::fmt::Debug for BackendHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendHandle")
            .field("port", &self.port)
            .field("pid", &self.process.pid())
            .field("workdir", &self.workdir)
            .finish()
    }
}

/// In-memory map from session identity to its backend.
///
/// The single source of truth for "is this session live". Lookups go
/// straight to the sharded map; creation is funnelled through [`ensure`]
/// which guarantees at most one provisioning in flight per identity while
/// letting unrelated identities provision in parallel.
///
/// [`ensure`]: SessionRegistry::ensure
pub struct SessionRegistry {
    entries: DashMap<SessionId, Arc<BackendHandle>>,
    /// Provisioning attempts in flight, keyed by identity
    in_flight: Mutex<HashMap<SessionId, watch::Receiver<Option<ProvisionResult>>>>,
}

impl SessionRegistry {
    /// Create a new registry, shared behind an `Arc`
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: DashMap::new(),
            in_flight: Mutex::new(HashMap::new()),
        })
    }

    /// O(1) lookup; does not check the process
    pub fn resolve(&self, id: &SessionId) -> Option<Arc<BackendHandle>> {
        self.entries.get(id).map(|e| Arc::clone(e.value()))
    }

    /// Handle for `id` only if its process is still running
    pub fn live(&self, id: &SessionId) -> Option<Arc<BackendHandle>> {
        self.resolve(id).filter(|h| h.is_running())
    }

    pub fn is_live(&self, id: &SessionId) -> bool {
        self.live(id).is_some()
    }

    /// Update the activity timestamp; no-op when absent
    pub fn touch(&self, id: &SessionId) {
        if let Some(entry) = self.entries.get(id) {
            entry.value().touch();
        }
    }

    /// Detach the handle for teardown. Idempotent.
    pub fn remove(&self, id: &SessionId) -> Option<Arc<BackendHandle>> {
        let _guard = self.in_flight.lock();
        self.entries.remove(id).map(|(_, handle)| handle)
    }

    /// Remove `id` only if it still maps to `handle`
    pub fn remove_if_same(&self, id: &SessionId, handle: &Arc<BackendHandle>) -> bool {
        let _guard = self.in_flight.lock();
        self.entries
            .remove_if(id, |_, current| Arc::ptr_eq(current, handle))
            .is_some()
    }

    /// Point-in-time copy of every entry
    pub fn snapshot(&self) -> Vec<(SessionId, Arc<BackendHandle>)> {
        self.entries
            .iter()
            .map(|e| (*e.key(), Arc::clone(e.value())))
            .collect()
    }

    /// Number of entries whose process is running
    pub fn live_count(&self) -> usize {
        self.entries.iter().filter(|e| e.value().is_running()).count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Ports held by registered handles
    pub fn ports_in_use(&self) -> HashSet<u16> {
        self.entries.iter().map(|e| e.value().port()).collect()
    }

    /// Return the live handle for `id`, provisioning it exactly once if absent.
    ///
    /// Provisioning runs on its own task, so a caller that goes away does not
    /// cancel it and every concurrent caller receives the same outcome. A
    /// failed attempt leaves no entry behind. A registered handle whose
    /// process has exited is passed to `on_stale` for teardown before the
    /// new attempt starts.
    pub async fn ensure<F, Fut, S, SFut>(
        self: &Arc<Self>,
        id: SessionId,
        provision: F,
        on_stale: S,
    ) -> ProvisionResult
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<BackendHandle, ProvisionError>> + Send + 'static,
        S: FnOnce(Arc<BackendHandle>) -> SFut + Send + 'static,
        SFut: Future<Output = ()> + Send + 'static,
    {
        if let Some(handle) = self.live(&id) {
            return Ok(handle);
        }

        let mut rx = {
            let mut in_flight = self.in_flight.lock();

            // Re-check under the lock: a provisioning may have just finished
            if let Some(handle) = self.live(&id) {
                return Ok(handle);
            }

            match in_flight.get(&id) {
                Some(rx) => {
                    debug!(session = %id, "Provisioning already in flight, waiting");
                    rx.clone()
                }
                None => {
                    let (tx, rx) = watch::channel(None);
                    in_flight.insert(id, rx.clone());
                    let stale = self.entries.remove(&id).map(|(_, h)| h);
                    self.spawn_provisioning(id, tx, provision, stale, on_stale);
                    rx
                }
            }
        };

        let outcome = rx
            .wait_for(|result| result.is_some())
            .await
            .map(|result| result.clone());

        match outcome {
            Ok(Some(result)) => result,
            _ => Err(ProvisionError::provisioning("provisioning task ended unexpectedly")),
        }
    }

    fn spawn_provisioning<F, Fut, S, SFut>(
        self: &Arc<Self>,
        id: SessionId,
        tx: watch::Sender<Option<ProvisionResult>>,
        provision: F,
        stale: Option<Arc<BackendHandle>>,
        on_stale: S,
    ) where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<BackendHandle, ProvisionError>> + Send + 'static,
        S: FnOnce(Arc<BackendHandle>) -> SFut + Send + 'static,
        SFut: Future<Output = ()> + Send + 'static,
    {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            if let Some(stale) = stale {
                info!(session = %id, port = stale.port(), "Replacing backend whose process has exited");
                on_stale(stale).await;
            }

            // Run the attempt on its own task so a panic is contained
            let result = match tokio::spawn(provision()).await {
                Ok(Ok(handle)) => Ok(Arc::new(handle)),
                Ok(Err(e)) => Err(e),
                Err(e) => Err(ProvisionError::provisioning(format!("provisioning task failed: {}", e))),
            };

            {
                let mut in_flight = registry.in_flight.lock();
                if let Ok(handle) = &result {
                    registry.entries.insert(id, Arc::clone(handle));
                }
                in_flight.remove(&id);
            }

            match &result {
                Ok(handle) => info!(session = %id, port = handle.port(), "Session backend is live"),
                Err(e) => warn!(session = %id, error = %e, "Session provisioning failed"),
            }

            let _ = tx.send(Some(result));
        });
    }
}
