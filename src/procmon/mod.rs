//! Client process monitoring and pool handle leak cleanup.
//!
//! One task (the "monitor") owns the table of client processes and the pool
//! handles each has open. Everything else talks to it through a
//! [`ProcessMonitor`] handle, which sends requests over a channel; the
//! monitor processes them one at a time, in arrival order. The table is never
//! shared and never locked.
//!
//! A process becomes tracked when it opens its first pool handle. While
//! tracked, a poller task checks every `poll_interval` that it is still
//! alive. When it goes away, whether reported through
//! [`ProcessMonitor::notify_exit`] or noticed by the poller, any handles it
//! still holds are evicted on the management service with one call per pool.
//! A process that closes all of its handles is simply forgotten.
//!
//! Cleanup is best-effort: failed evictions are logged and counted, the
//! process entry is dropped either way, and nothing is retried.
//!
//! # Shutdown
//!
//! The monitor stops when the [`CancellationToken`] passed to
//! [`ProcessMonitorBuilder::start_monitoring`] is cancelled. With
//! `evict_on_shutdown` set (the default) it first evicts every handle still
//! tracked. It also stops once every `ProcessMonitor` clone is dropped, in
//! which case nothing is evicted.

mod actor;
mod inspect;

pub use inspect::{ProcessInspector, SystemInspector};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::AgentConfig;
use crate::mgmt::HandleEvictor;
use crate::{AgentError, Result};
use actor::{MonitorActor, Request};

/// Default interval between liveness checks of a tracked process.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Buffered liveness results. Requests themselves are not buffered.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// A tracked client process, as reported by
/// [`ProcessMonitor::tracked_processes`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackedProcess {
    pub pid: i32,
    /// Command name, if it could be resolved when tracking started.
    pub name: Option<String>,
    /// Open handle count per pool.
    pub handles: BTreeMap<String, usize>,
}

/// Handle to a running process monitor. Cheap to clone.
#[derive(Clone)]
pub struct ProcessMonitor {
    requests: mpsc::Sender<Request>,
}

impl ProcessMonitor {
    pub fn builder(evictor: Arc<dyn HandleEvictor>) -> ProcessMonitorBuilder {
        ProcessMonitorBuilder::new(evictor)
    }

    /// Record that `pid` opened `handle` on `pool`. Starts monitoring `pid`
    /// if it is not tracked yet.
    pub async fn add_pool_handle(
        &self,
        pid: i32,
        pool: impl Into<String>,
        handle: impl Into<String>,
    ) {
        self.send(Request::AddHandle {
            pid,
            pool: pool.into(),
            handle: handle.into(),
        })
        .await;
    }

    /// Record that `pid` closed `handle` on `pool`. A process left with no
    /// open handles is no longer monitored.
    pub async fn remove_pool_handle(
        &self,
        pid: i32,
        pool: impl Into<String>,
        handle: impl Into<String>,
    ) {
        self.send(Request::RemoveHandle {
            pid,
            pool: pool.into(),
            handle: handle.into(),
        })
        .await;
    }

    /// Report that `pid` has exited. Handles it still holds are evicted.
    pub async fn notify_exit(&self, pid: i32) {
        self.send(Request::NotifyExit { pid }).await;
    }

    /// Evict every tracked handle and forget every process.
    ///
    /// Returns once an eviction has been attempted for each handle that was
    /// tracked when the request was received. Eviction failures are logged,
    /// not returned.
    pub async fn flush_all_handles(&self) {
        let (done, finished) = oneshot::channel();
        self.send(Request::Flush { done }).await;
        if finished.await.is_err() {
            warn!("process monitor stopped before completing flush");
        }
    }

    /// Snapshot of the processes currently tracked, ordered by PID.
    pub async fn tracked_processes(&self) -> Result<Vec<TrackedProcess>> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(Request::Status { reply })
            .await
            .map_err(|_| AgentError::MonitorStopped)?;
        response.await.map_err(|_| AgentError::MonitorStopped)
    }

    /// Whether the monitor has stopped.
    pub fn is_closed(&self) -> bool {
        self.requests.is_closed()
    }

    /// Wait for the monitor to stop.
    pub async fn closed(&self) {
        self.requests.closed().await;
    }

    async fn send(&self, request: Request) {
        if self.requests.send(request).await.is_err() {
            warn!("process monitor is not running, request dropped");
        }
    }
}

impl std::fmt::Debug for ProcessMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessMonitor")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Builder for a [`ProcessMonitor`].
pub struct ProcessMonitorBuilder {
    evictor: Arc<dyn HandleEvictor>,
    inspector: Arc<dyn ProcessInspector>,
    poll_interval: Duration,
    machine_name: Option<String>,
    evict_on_shutdown: bool,
}

impl ProcessMonitorBuilder {
    pub fn new(evictor: Arc<dyn HandleEvictor>) -> Self {
        Self {
            evictor,
            inspector: Arc::new(SystemInspector),
            poll_interval: DEFAULT_POLL_INTERVAL,
            machine_name: None,
            evict_on_shutdown: true,
        }
    }

    pub fn inspector(mut self, inspector: Arc<dyn ProcessInspector>) -> Self {
        self.inspector = inspector;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Name this machine is known by to the management service. Defaults to
    /// the host name; with no usable name the startup cleanup is skipped.
    pub fn machine_name(mut self, name: impl Into<String>) -> Self {
        self.machine_name = Some(name.into());
        self
    }

    pub fn evict_on_shutdown(mut self, enabled: bool) -> Self {
        self.evict_on_shutdown = enabled;
        self
    }

    /// Apply the poll interval and shutdown policy from `config`.
    pub fn config(mut self, config: &AgentConfig) -> Self {
        self.poll_interval = config.poll_interval();
        self.evict_on_shutdown = config.evict_on_shutdown;
        self
    }

    /// Spawn the monitor task and return a handle to it.
    ///
    /// With `clean_on_start`, the management service is first asked to revoke
    /// every handle it holds for this machine; the monitor accepts requests
    /// only after that call completes. The monitor runs until `token` is
    /// cancelled.
    pub async fn start_monitoring(
        self,
        token: CancellationToken,
        clean_on_start: bool,
    ) -> ProcessMonitor {
        let (requests_tx, requests_rx) = mpsc::channel(1);
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let actor = MonitorActor::new(
            self.evictor,
            self.inspector,
            self.poll_interval.max(Duration::from_millis(1)),
            self.evict_on_shutdown,
            token,
            events_tx,
        );
        if clean_on_start {
            let machine = match self.machine_name {
                Some(name) => Some(name).filter(|n| !n.is_empty()),
                None => host_name(),
            };
            match machine {
                Some(machine) => actor.cleanup_machine(&machine).await,
                None => warn!("machine name unknown, skipping startup handle cleanup"),
            }
        }
        tokio::spawn(actor.run(requests_rx, events_rx));

        ProcessMonitor {
            requests: requests_tx,
        }
    }
}

fn host_name() -> Option<String> {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
}
