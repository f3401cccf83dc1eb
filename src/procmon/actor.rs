//! The monitor's event loop and per-process liveness pollers.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::TrackedProcess;
use super::inspect::ProcessInspector;
use crate::mgmt::HandleEvictor;
use crate::telemetry;

/// Messages accepted by the event loop, processed strictly in arrival order.
pub(super) enum Request {
    AddHandle {
        pid: i32,
        pool: String,
        handle: String,
    },
    RemoveHandle {
        pid: i32,
        pool: String,
        handle: String,
    },
    NotifyExit {
        pid: i32,
    },
    Flush {
        done: oneshot::Sender<()>,
    },
    Status {
        reply: oneshot::Sender<Vec<TrackedProcess>>,
    },
}

/// Sent once by a poller when its process is gone or can no longer be
/// checked.
pub(super) struct PollerEvent {
    pid: i32,
    generation: u64,
    error: Option<String>,
}

/// pool -> open handles
type Handles = BTreeMap<String, BTreeSet<String>>;

struct ProcInfo {
    name: Option<String>,
    handles: Handles,
    poller: CancellationToken,
    /// Distinguishes this tracking period from earlier ones for the same PID.
    generation: u64,
}

pub(super) struct MonitorActor {
    processes: HashMap<i32, ProcInfo>,
    evictor: Arc<dyn HandleEvictor>,
    inspector: Arc<dyn ProcessInspector>,
    poll_interval: Duration,
    evict_on_shutdown: bool,
    token: CancellationToken,
    events_tx: mpsc::Sender<PollerEvent>,
    next_generation: u64,
}

impl MonitorActor {
    pub(super) fn new(
        evictor: Arc<dyn HandleEvictor>,
        inspector: Arc<dyn ProcessInspector>,
        poll_interval: Duration,
        evict_on_shutdown: bool,
        token: CancellationToken,
        events_tx: mpsc::Sender<PollerEvent>,
    ) -> Self {
        Self {
            processes: HashMap::new(),
            evictor,
            inspector,
            poll_interval,
            evict_on_shutdown,
            token,
            events_tx,
            next_generation: 0,
        }
    }

    /// Revoke whatever the management service still holds for `machine`
    /// from a previous run of the agent.
    pub(super) async fn cleanup_machine(&self, machine: &str) {
        match self.evictor.cleanup_machine_handles(machine).await {
            Ok(result) => {
                let handles: u64 = result.pools.iter().map(|p| u64::from(p.count)).sum();
                info!(
                    machine,
                    pools = result.pools.len(),
                    handles,
                    "cleaned up pool handles from a previous run"
                );
                for pool in result.pools.iter().filter(|p| p.status != 0) {
                    warn!(pool = %pool.pool, status = pool.status, "pool handle cleanup failed");
                }
            }
            Err(e) => {
                metrics::counter!(telemetry::CLEANUP_FAILURES_TOTAL).increment(1);
                error!(machine, error = %e, "machine handle cleanup failed");
            }
        }
    }

    pub(super) async fn run(
        mut self,
        mut requests: mpsc::Receiver<Request>,
        mut events: mpsc::Receiver<PollerEvent>,
    ) {
        debug!("process monitor started");
        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => {
                    self.shutdown().await;
                    break;
                }
                // Dead processes are reclaimed ahead of queued requests.
                Some(event) = events.recv() => self.handle_event(event).await,
                request = requests.recv() => match request {
                    Some(request) => self.handle_request(request).await,
                    None => {
                        debug!("all process monitor handles dropped");
                        self.stop_pollers();
                        break;
                    }
                },
            }
        }
        debug!("process monitor stopped");
    }

    async fn handle_request(&mut self, request: Request) {
        match request {
            Request::AddHandle { pid, pool, handle } => self.add_handle(pid, pool, handle),
            Request::RemoveHandle { pid, pool, handle } => self.remove_handle(pid, &pool, &handle),
            Request::NotifyExit { pid } => self.reclaim(pid, "client process exited").await,
            Request::Flush { done } => {
                self.flush().await;
                let _ = done.send(());
            }
            Request::Status { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    async fn handle_event(&mut self, event: PollerEvent) {
        let current = self
            .processes
            .get(&event.pid)
            .is_some_and(|info| info.generation == event.generation);
        if !current {
            debug!(pid = event.pid, "ignoring liveness result for untracked process");
            return;
        }
        match event.error {
            Some(e) => {
                warn!(pid = event.pid, error = %e, "liveness check failed, treating process as gone");
                self.reclaim(event.pid, "liveness check failed").await;
            }
            None => self.reclaim(event.pid, "client process disappeared").await,
        }
    }

    fn add_handle(&mut self, pid: i32, pool: String, handle: String) {
        if !self.processes.contains_key(&pid) {
            let info = self.start_tracking(pid);
            self.processes.insert(pid, info);
        }
        if let Some(info) = self.processes.get_mut(&pid) {
            debug!(pid, pool = %pool, handle = %handle, "pool handle opened");
            if info.handles.entry(pool).or_default().insert(handle) {
                metrics::counter!(telemetry::HANDLES_TRACKED_TOTAL).increment(1);
            }
        }
    }

    fn start_tracking(&mut self, pid: i32) -> ProcInfo {
        let name = match self.inspector.process_name(pid) {
            Ok(name) => Some(name),
            Err(e) => {
                debug!(pid, error = %e, "could not resolve process name");
                None
            }
        };
        info!(pid, name = name.as_deref().unwrap_or("<unknown>"), "monitoring client process");

        self.next_generation += 1;
        let poller = self.token.child_token();
        self.spawn_poller(pid, self.next_generation, poller.clone());
        ProcInfo {
            name,
            handles: Handles::new(),
            poller,
            generation: self.next_generation,
        }
    }

    fn remove_handle(&mut self, pid: i32, pool: &str, handle: &str) {
        let Some(info) = self.processes.get_mut(&pid) else {
            debug!(pid, pool, handle, "pool handle closed for untracked process");
            return;
        };
        if let Some(open) = info.handles.get_mut(pool) {
            open.remove(handle);
            if open.is_empty() {
                info.handles.remove(pool);
            }
        }
        debug!(pid, pool, handle, "pool handle closed");

        if info.handles.is_empty() {
            info.poller.cancel();
            self.processes.remove(&pid);
            debug!(pid, "no open pool handles left, stopped monitoring");
        }
    }

    /// Stop tracking `pid` and evict any handles it left open.
    async fn reclaim(&mut self, pid: i32, reason: &str) {
        let Some(info) = self.processes.remove(&pid) else {
            debug!(pid, reason, "process is not tracked, nothing to clean up");
            return;
        };
        info.poller.cancel();
        if !info.handles.is_empty() {
            info!(
                pid,
                name = info.name.as_deref().unwrap_or("<unknown>"),
                reason,
                "reclaiming leaked pool handles"
            );
        }
        self.evict(info.handles).await;
    }

    /// Issue one eviction call per pool. Failures are logged, never retried.
    async fn evict(&self, leaked: Handles) {
        for (pool, handles) in leaked {
            if handles.is_empty() {
                continue;
            }
            let handles: Vec<String> = handles.into_iter().collect();
            match self.evictor.evict_pool_handles(&pool, &handles).await {
                Ok(()) => {
                    info!(pool = %pool, count = handles.len(), "evicted pool handles");
                    metrics::counter!(telemetry::HANDLES_EVICTED_TOTAL)
                        .increment(handles.len() as u64);
                }
                Err(e) => {
                    metrics::counter!(telemetry::CLEANUP_FAILURES_TOTAL).increment(1);
                    error!(pool = %pool, count = handles.len(), error = %e, "failed to evict pool handles");
                }
            }
        }
    }

    async fn flush(&mut self) {
        let mut all = Handles::new();
        for (_, info) in self.processes.drain() {
            info.poller.cancel();
            for (pool, handles) in info.handles {
                all.entry(pool).or_default().extend(handles);
            }
        }
        if !all.is_empty() {
            info!(pools = all.len(), "flushing all tracked pool handles");
        }
        self.evict(all).await;
    }

    async fn shutdown(&mut self) {
        if self.evict_on_shutdown {
            self.flush().await;
        } else {
            self.stop_pollers();
            self.processes.clear();
        }
    }

    fn stop_pollers(&self) {
        for info in self.processes.values() {
            info.poller.cancel();
        }
    }

    fn snapshot(&self) -> Vec<TrackedProcess> {
        let mut processes: Vec<TrackedProcess> = self
            .processes
            .iter()
            .map(|(pid, info)| TrackedProcess {
                pid: *pid,
                name: info.name.clone(),
                handles: info
                    .handles
                    .iter()
                    .map(|(pool, open)| (pool.clone(), open.len()))
                    .collect(),
            })
            .collect();
        processes.sort_by_key(|p| p.pid);
        processes
    }

    fn spawn_poller(&self, pid: i32, generation: u64, token: CancellationToken) {
        let inspector = Arc::clone(&self.inspector);
        let events = self.events_tx.clone();
        let period = self.poll_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            let error = loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                match inspector.process_exists(pid) {
                    Ok(true) => continue,
                    Ok(false) => break None,
                    Err(e) => break Some(e.to_string()),
                }
            };

            let event = PollerEvent {
                pid,
                generation,
                error,
            };
            tokio::select! {
                biased;
                _ = token.cancelled() => {}
                _ = events.send(event) => {}
            }
        });
    }
}
