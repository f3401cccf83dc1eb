//! Fabric agent - runtime state engine of a storage client agent
//!
//! The agent sits between client processes on a compute node and the
//! storage system's management service. This crate holds its in-memory
//! state:
//!
//! - [`InfoCache`] memoizes the connection ("attach") info clients need to
//!   join a system, and the node's fabric topology.
//! - [`NumaFabric`] hands out fabric interfaces round-robin per NUMA node,
//!   falling back to other nodes when the local one has no match.
//! - [`ProcessMonitor`] tracks the pool handles each client process holds
//!   and evicts them when the process dies without releasing them.
//!
//! The RPC transport to the management service is not part of this crate;
//! it plugs in through [`ConnectionInfoFetcher`] and [`HandleEvictor`].
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use fabric_agent::{InfoCache, NetDevClass, SystemScanner, InterfaceFilter};
//! # use fabric_agent::{AttachInfo, ConnectionInfoFetcher};
//! # struct Mgmt;
//! # #[async_trait::async_trait]
//! # impl ConnectionInfoFetcher for Mgmt {
//! #     async fn fetch_connection_info(&self, system: &str) -> fabric_agent::Result<AttachInfo> {
//! #         unimplemented!()
//! #     }
//! # }
//!
//! #[tokio::main]
//! async fn main() -> fabric_agent::Result<()> {
//!     let cache = InfoCache::builder()
//!         .fetcher(Arc::new(Mgmt))
//!         .scanner(Arc::new(SystemScanner::new(InterfaceFilter::default())))
//!         .providers(["ofi+tcp"])
//!         .build()?;
//!
//!     let device = cache.get_fabric_device(0, NetDevClass::ETHER, "ofi+tcp").await?;
//!     println!("{device}");
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod fabric;
pub mod mgmt;
pub mod procmon;
pub mod telemetry;
pub mod version;

// Re-export main types at crate root
pub use cache::{InfoCache, InfoCacheBuilder, KeyedCache};
pub use config::AgentConfig;
pub use error::{AgentError, Result};
pub use fabric::{
    FabricInterface, FabricScanner, InterfaceFilter, NetDevClass, NumaFabric, SystemScanner,
};
pub use mgmt::{AttachInfo, ConnectionInfoFetcher, HandleEvictor};
pub use procmon::{ProcessMonitor, TrackedProcess};
pub use version::{PKG_VERSION, version_string};
