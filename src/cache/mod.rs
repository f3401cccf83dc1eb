//! Caching subsystem.
//!
//! - [`KeyedCache`] — generic keyed container of [`CacheItem`]s with per-key
//!   locking, lazy expiry and capability-based refresh.
//!
//! - [`AttachInfoCache`] — memoized connection info for one system,
//!   refreshed on an interval.
//!
//! - [`FabricInfoCache`] — memoized fabric topology, scanned once.
//!
//! - [`InfoCache`] — the two entries above behind a single object, with
//!   switches to bypass either cache.

pub mod attach;
pub mod fabric;
pub mod info;
pub mod keyed;

pub use attach::{AttachInfoCache, attach_info_key};
pub use fabric::{FABRIC_KEY, FabricInfoCache};
pub use info::{InfoCache, InfoCacheBuilder};
pub use keyed::{CacheGuard, CacheItem, Expirable, KeyedCache, Refreshable};
