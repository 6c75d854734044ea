//! Background teardown of idle and dead sessions

use crate::provision::Provisioner;
use crate::registry::SessionRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

pub struct IdleReaper {
    registry: Arc<SessionRegistry>,
    provisioner: Arc<Provisioner>,
    interval: Duration,
    threshold: Duration,
}

impl IdleReaper {
    pub fn new(
        registry: Arc<SessionRegistry>,
        provisioner: Arc<Provisioner>,
        interval: Duration,
        threshold: Duration,
    ) -> Self {
        Self {
            registry,
            provisioner,
            interval,
            threshold,
        }
    }

    /// One scan of the registry. Returns how many sessions were removed.
    ///
    /// Entries idle past the threshold are stopped; entries whose process has
    /// already exited are cleaned up as well. An entry replaced or touched
    /// away between the snapshot and removal is left alone.
    pub async fn tick(&self) -> usize {
        let mut reaped = 0;

        for (id, handle) in self.registry.snapshot() {
            let idle_for = handle.idle_for();
            let running = handle.is_running();

            let reason = if !running {
                "process exited"
            } else if idle_for >= self.threshold {
                "idle"
            } else {
                continue;
            };

            if !self.registry.remove_if_same(&id, &handle) {
                continue;
            }

            info!(
                session = %id,
                port = handle.port(),
                idle_secs = idle_for.as_secs(),
                reason,
                "Reaping session"
            );
            self.provisioner.teardown(id, &handle).await;
            reaped += 1;
        }

        if reaped > 0 {
            debug!(reaped, remaining = self.registry.len(), "Reaper tick complete");
        }
        reaped
    }

    /// Run until `shutdown_rx` flips to true
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            threshold_secs = self.threshold.as_secs(),
            "Idle reaper started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    self.tick().await;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        debug!("Idle reaper stopped");
    }
}
