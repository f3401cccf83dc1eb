//! Telemetry metric name constants.
//!
//! Centralised metric names for agent operations. The daemon (or an
//! embedding process) installs its own `metrics` recorder; without a
//! recorder installed, all metric calls are no-ops.
//!
//! # Metric naming conventions
//!
//! All metrics are prefixed with `fabric_agent_`. Counters end in `_total`.
//!
//! # Common labels
//!
//! - `key` — cache key the lookup was for
//! - `kind` — cache entry kind: "attach_info" or "fabric"

/// Total cache lookups answered by an existing entry.
///
/// Labels: `key`.
pub const CACHE_HITS_TOTAL: &str = "fabric_agent_cache_hits_total";

/// Total cache lookups that had to create a new entry.
///
/// Labels: `key`.
pub const CACHE_MISSES_TOTAL: &str = "fabric_agent_cache_misses_total";

/// Total successful fetches/scans performed by cache entries.
///
/// Labels: `kind`.
pub const CACHE_REFRESHES_TOTAL: &str = "fabric_agent_cache_refreshes_total";

/// Total device selections that had to leave the requested NUMA node.
pub const FABRIC_FALLBACKS_TOTAL: &str = "fabric_agent_fabric_fallbacks_total";

/// Total pool handles registered with the process monitor.
pub const HANDLES_TRACKED_TOTAL: &str = "fabric_agent_handles_tracked_total";

/// Total pool handles submitted for eviction after a client went away.
pub const HANDLES_EVICTED_TOTAL: &str = "fabric_agent_handles_evicted_total";

/// Total eviction calls that failed.
pub const CLEANUP_FAILURES_TOTAL: &str = "fabric_agent_cleanup_failures_total";
