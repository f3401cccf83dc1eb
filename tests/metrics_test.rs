//! Tests for metrics emitted by the caches and device selection.
//!
//! Uses `metrics_util::debugging::DebuggingRecorder` to capture and assert
//! on emitted metrics without needing a real exporter.

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics_util::MetricKind;
use metrics_util::debugging::{DebugValue, DebuggingRecorder};
use tokio_util::sync::CancellationToken;

use fabric_agent::fabric::InterfaceResolver;
use fabric_agent::mgmt::CleanupResult;
use fabric_agent::procmon::ProcessInspector;
use fabric_agent::telemetry;
use fabric_agent::{
    AgentError, AttachInfo, ConnectionInfoFetcher, FabricInterface, FabricScanner,
    HandleEvictor, InfoCache, NetDevClass, NumaFabric, ProcessMonitor, Result,
};

// ============================================================================
// Mocks
// ============================================================================

struct StaticFetcher;

#[async_trait]
impl ConnectionInfoFetcher for StaticFetcher {
    async fn fetch_connection_info(&self, system: &str) -> Result<AttachInfo> {
        Ok(AttachInfo {
            system: system.to_string(),
            ..Default::default()
        })
    }
}

struct AllUp;

impl InterfaceResolver for AllUp {
    fn addresses(&self, _name: &str) -> Result<Vec<IpAddr>> {
        Ok(vec![IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))])
    }
}

/// One Ethernet device, on NUMA node 1 only.
struct OneNodeScanner;

#[async_trait]
impl FabricScanner for OneNodeScanner {
    async fn scan(&self, providers: &[String]) -> Result<NumaFabric> {
        Ok(NumaFabric::from_interfaces(
            [FabricInterface::new("eth1", NetDevClass::ETHER)
                .with_numa_node(1)
                .with_providers(providers.iter().cloned())],
            Arc::new(AllUp),
        ))
    }
}

/// Fails evictions for `failing_pool` and, optionally, the startup cleanup.
#[derive(Default)]
struct FlakyEvictor {
    failing_pool: Option<&'static str>,
    fail_cleanup: bool,
}

#[async_trait]
impl HandleEvictor for FlakyEvictor {
    async fn evict_pool_handles(&self, pool: &str, _handles: &[String]) -> Result<()> {
        if self.failing_pool == Some(pool) {
            return Err(AgentError::Upstream(format!("pool {pool} unreachable")));
        }
        Ok(())
    }

    async fn cleanup_machine_handles(&self, _machine: &str) -> Result<CleanupResult> {
        if self.fail_cleanup {
            return Err(AgentError::Upstream("mgmt service down".into()));
        }
        Ok(CleanupResult { pools: Vec::new() })
    }
}

struct AlwaysAlive;

impl ProcessInspector for AlwaysAlive {
    fn process_name(&self, pid: i32) -> Result<String> {
        Ok(format!("client-{pid}"))
    }

    fn process_exists(&self, _pid: i32) -> Result<bool> {
        Ok(true)
    }
}

async fn monitor(evictor: FlakyEvictor, clean_on_start: bool) -> ProcessMonitor {
    ProcessMonitor::builder(Arc::new(evictor))
        .inspector(Arc::new(AlwaysAlive))
        .poll_interval(Duration::from_secs(3600))
        .machine_name("node-1")
        .start_monitoring(CancellationToken::new(), clean_on_start)
        .await
}

fn info_cache() -> InfoCache {
    InfoCache::builder()
        .fetcher(Arc::new(StaticFetcher))
        .scanner(Arc::new(OneNodeScanner))
        .providers(["ofi+tcp"])
        .build()
        .unwrap()
}

// ============================================================================
// Snapshot helpers
// ============================================================================

type SnapshotVec = Vec<(
    metrics_util::CompositeKey,
    Option<metrics::Unit>,
    Option<metrics::SharedString>,
    DebugValue,
)>;

/// Sum all counter values matching a given metric name.
fn counter_total(snapshot: &SnapshotVec, name: &str) -> u64 {
    snapshot
        .iter()
        .filter(|(key, _, _, _)| key.kind() == MetricKind::Counter && key.key().name() == name)
        .map(|(_, _, _, value)| match value {
            DebugValue::Counter(v) => *v,
            _ => 0,
        })
        .sum()
}

/// Sum counter values for `name` carrying label `label=value`.
fn counter_with_label(snapshot: &SnapshotVec, name: &str, label: &str, value: &str) -> u64 {
    snapshot
        .iter()
        .filter(|(key, _, _, _)| {
            key.kind() == MetricKind::Counter
                && key.key().name() == name
                && key
                    .key()
                    .labels()
                    .any(|l| l.key() == label && l.value() == value)
        })
        .map(|(_, _, _, value)| match value {
            DebugValue::Counter(v) => *v,
            _ => 0,
        })
        .sum()
}

/// Runs `fut` on a current-thread runtime inside a local recorder scope.
///
/// The monitor emits from its own task; a current-thread runtime keeps that
/// task on the thread the local recorder is installed on.
fn record_monitor<F>(recorder: &DebuggingRecorder, fut: F)
where
    F: Future<Output = ()>,
{
    metrics::with_local_recorder(recorder, || {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(fut)
    });
}

// ============================================================================
// Tests
// ============================================================================

/// Runs async code within a local recorder scope on the multi-thread runtime.
///
/// `block_in_place` keeps the sync `with_local_recorder` closure on the
/// current thread while `block_on` drives the inner async work.
#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn attach_info_hits_and_misses() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();

    metrics::with_local_recorder(&recorder, || {
        tokio::task::block_in_place(|| {
            tokio::runtime::Handle::current().block_on(async {
                let cache = info_cache();
                cache.get_attach_info("foo").await.unwrap();
                cache.get_attach_info("foo").await.unwrap();
                cache.get_attach_info("foo").await.unwrap();
                cache.get_attach_info("bar").await.unwrap();
            })
        })
    });

    let snapshot = snapshotter.snapshot().into_vec();
    assert_eq!(counter_total(&snapshot, telemetry::CACHE_MISSES_TOTAL), 2);
    assert_eq!(counter_total(&snapshot, telemetry::CACHE_HITS_TOTAL), 2);
    assert_eq!(
        counter_with_label(&snapshot, telemetry::CACHE_HITS_TOTAL, "key", "attach_info:foo"),
        2
    );
    assert_eq!(
        counter_with_label(&snapshot, telemetry::CACHE_REFRESHES_TOTAL, "kind", "attach_info"),
        2
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn fabric_scan_and_fallback_are_counted() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();

    metrics::with_local_recorder(&recorder, || {
        tokio::task::block_in_place(|| {
            tokio::runtime::Handle::current().block_on(async {
                let cache = info_cache();
                // Node 0 has nothing; both requests fall back to node 1.
                cache.get_fabric_device(0, NetDevClass::ETHER, "ofi+tcp").await.unwrap();
                cache.get_fabric_device(0, NetDevClass::ETHER, "ofi+tcp").await.unwrap();
                // Local hit, no fallback.
                cache.get_fabric_device(1, NetDevClass::ETHER, "ofi+tcp").await.unwrap();
            })
        })
    });

    let snapshot = snapshotter.snapshot().into_vec();
    assert_eq!(
        counter_with_label(&snapshot, telemetry::CACHE_REFRESHES_TOTAL, "kind", "fabric"),
        1
    );
    assert_eq!(counter_total(&snapshot, telemetry::FABRIC_FALLBACKS_TOTAL), 2);
}

#[tokio::test]
async fn metrics_are_noop_without_recorder() {
    // Verify no panics when no recorder is installed.
    let cache = info_cache();
    cache.get_attach_info("foo").await.unwrap();
    cache.get_fabric_device(0, NetDevClass::ETHER, "ofi+tcp").await.unwrap();
}

#[test]
fn tracked_and_evicted_handles_are_counted() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();

    record_monitor(&recorder, async {
        let monitor = monitor(FlakyEvictor::default(), false).await;
        monitor.add_pool_handle(1, "pool-a", "h1").await;
        // Already open: not counted again.
        monitor.add_pool_handle(1, "pool-a", "h1").await;
        monitor.add_pool_handle(1, "pool-b", "h2").await;
        monitor.notify_exit(1).await;
        assert!(monitor.tracked_processes().await.unwrap().is_empty());
    });

    let snapshot = snapshotter.snapshot().into_vec();
    assert_eq!(counter_total(&snapshot, telemetry::HANDLES_TRACKED_TOTAL), 2);
    assert_eq!(counter_total(&snapshot, telemetry::HANDLES_EVICTED_TOTAL), 2);
    assert_eq!(counter_total(&snapshot, telemetry::CLEANUP_FAILURES_TOTAL), 0);
}

#[test]
fn failed_eviction_is_counted() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();

    record_monitor(&recorder, async {
        let evictor = FlakyEvictor {
            failing_pool: Some("pool-a"),
            ..Default::default()
        };
        let monitor = monitor(evictor, false).await;
        monitor.add_pool_handle(1, "pool-a", "h1").await;
        monitor.add_pool_handle(1, "pool-b", "h2").await;
        monitor.notify_exit(1).await;
        monitor.tracked_processes().await.unwrap();
    });

    let snapshot = snapshotter.snapshot().into_vec();
    assert_eq!(counter_total(&snapshot, telemetry::CLEANUP_FAILURES_TOTAL), 1);
    assert_eq!(counter_total(&snapshot, telemetry::HANDLES_EVICTED_TOTAL), 1);
}

#[test]
fn failed_startup_cleanup_is_counted() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();

    record_monitor(&recorder, async {
        let evictor = FlakyEvictor {
            fail_cleanup: true,
            ..Default::default()
        };
        let monitor = monitor(evictor, true).await;
        assert!(monitor.tracked_processes().await.unwrap().is_empty());
    });

    let snapshot = snapshotter.snapshot().into_vec();
    assert_eq!(counter_total(&snapshot, telemetry::CLEANUP_FAILURES_TOTAL), 1);
    assert_eq!(counter_total(&snapshot, telemetry::HANDLES_EVICTED_TOTAL), 0);
}
