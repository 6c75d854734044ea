//! Process-wide counters and the `/_health` status document

use crate::pool::PoolStats;
use crate::registry::SessionRegistry;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub struct ProxyMetrics {
    started_at: Instant,
    started_at_unix: u64,
    ws_connections: AtomicUsize,
    /// Kept between reports; CPU percentages are deltas since the previous refresh
    system: Mutex<System>,
}

impl ProxyMetrics {
    pub fn new() -> Arc<Self> {
        let started_at_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Arc::new(Self {
            started_at: Instant::now(),
            started_at_unix,
            ws_connections: AtomicUsize::new(0),
            system: Mutex::new(System::new()),
        })
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn ws_connections(&self) -> usize {
        self.ws_connections.load(Ordering::SeqCst)
    }

    /// Count one bridged WebSocket until the guard is dropped
    pub fn ws_connection(self: &Arc<Self>) -> WsConnectionGuard {
        self.ws_connections.fetch_add(1, Ordering::SeqCst);
        WsConnectionGuard {
            metrics: Arc::clone(self),
        }
    }

    pub fn health(&self, registry: &SessionRegistry, pool: &PoolStats) -> HealthReport {
        let live: Vec<_> = registry
            .snapshot()
            .into_iter()
            .filter(|(_, handle)| handle.is_running())
            .collect();
        let backend_pids: Vec<Pid> = live
            .iter()
            .filter_map(|(_, handle)| handle.process().pid())
            .map(Pid::from_u32)
            .collect();

        let mut system = self.system.lock();
        let server = system_metrics(&mut system);
        let proxy_process = proxy_process_metrics(&mut system);
        let backends = backend_metrics(&mut system, &backend_pids, live.len());
        drop(system);

        HealthReport {
            status: "ok",
            uptime_seconds: self.uptime_seconds(),
            started_at_unix: self.started_at_unix,
            server,
            proxy_process,
            backends,
            upstream: UpstreamMetrics {
                total_requests: pool.get_total_requests(),
                upstream_errors: pool.get_upstream_errors(),
            },
            ws_connections: self.ws_connections(),
            live_sessions: live.len(),
            version: VERSION,
        }
    }
}

impl std::fmt::Debug for ProxyMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyMetrics")
            .field("started_at_unix", &self.started_at_unix)
            .field("ws_connections", &self.ws_connections())
            .finish()
    }
}

/// Decrements the live WebSocket counter exactly once, on drop
#[derive(Debug)]
pub struct WsConnectionGuard {
    metrics: Arc<ProxyMetrics>,
}

impl Drop for WsConnectionGuard {
    fn drop(&mut self) {
        self.metrics.ws_connections.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub uptime_seconds: u64,
    pub started_at_unix: u64,
    pub server: SystemMetrics,
    pub proxy_process: ProcessMetrics,
    pub backends: BackendMetrics,
    pub upstream: UpstreamMetrics,
    pub ws_connections: usize,
    pub live_sessions: usize,
    pub version: &'static str,
}

#[derive(Debug, Serialize)]
pub struct SystemMetrics {
    pub cpu_percent: f32,
    pub memory_total_bytes: u64,
    pub memory_used_bytes: u64,
    pub memory_percent: f64,
    pub load_average: [f64; 3],
}

#[derive(Debug, Default, Serialize)]
pub struct ProcessMetrics {
    pub pid: u32,
    pub rss_bytes: Option<u64>,
    pub cpu_percent: Option<f32>,
    pub threads: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct BackendMetrics {
    pub instances: usize,
    /// Summed resident memory of live backend processes
    pub rss_bytes: u64,
    pub cpu_percent_sum: f32,
}

/// Traffic forwarded through the backend connection pool
#[derive(Debug, Serialize)]
pub struct UpstreamMetrics {
    pub total_requests: u64,
    pub upstream_errors: u64,
}

fn system_metrics(system: &mut System) -> SystemMetrics {
    system.refresh_memory();
    system.refresh_cpu_usage();

    let total = system.total_memory();
    let used = system.used_memory();
    let percent = if total > 0 {
        (used as f64 / total as f64 * 1000.0).round() / 10.0
    } else {
        0.0
    };
    let load = System::load_average();

    SystemMetrics {
        cpu_percent: system.global_cpu_usage(),
        memory_total_bytes: total,
        memory_used_bytes: used,
        memory_percent: percent,
        load_average: [load.one, load.five, load.fifteen],
    }
}

fn proxy_process_metrics(system: &mut System) -> ProcessMetrics {
    let pid = std::process::id();
    let sys_pid = Pid::from_u32(pid);
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[sys_pid]),
        true,
        ProcessRefreshKind::everything(),
    );

    match system.process(sys_pid) {
        Some(process) => ProcessMetrics {
            pid,
            rss_bytes: Some(process.memory()),
            cpu_percent: Some(process.cpu_usage()),
            threads: process.tasks().map(|tasks| tasks.len()),
        },
        None => ProcessMetrics {
            pid,
            ..ProcessMetrics::default()
        },
    }
}

fn backend_metrics(system: &mut System, pids: &[Pid], instances: usize) -> BackendMetrics {
    if !pids.is_empty() {
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(pids),
            true,
            ProcessRefreshKind::nothing().with_memory().with_cpu(),
        );
    }

    let (rss_bytes, cpu_percent_sum) = pids
        .iter()
        .filter_map(|pid| system.process(*pid))
        .fold((0u64, 0f32), |(rss, cpu), process| {
            (rss + process.memory(), cpu + process.cpu_usage())
        });

    BackendMetrics {
        instances,
        rss_bytes,
        cpu_percent_sum,
    }
}
