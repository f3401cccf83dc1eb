//! Management service collaborators.
//!
//! The agent talks to the remote management service for three things: the
//! connection ("attach") info clients need to join a system, evicting pool
//! handles left behind by dead clients, and a machine-wide handle cleanup at
//! startup. The RPC transport lives outside this crate; it plugs in by
//! implementing the traits below.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;

/// Default system name used when a client does not ask for one.
pub const DEFAULT_SYSTEM: &str = "daos_server";

/// A service rank and the URI it listens on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankUri {
    pub rank: u32,
    pub uri: String,
    #[serde(default)]
    pub provider: String,
}

/// Network settings the management service recommends to clients.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientNetHint {
    /// Transport provider the servers are using (e.g. `ofi+tcp`).
    pub provider: String,
    /// Interface the servers are using; informational for clients.
    #[serde(default)]
    pub interface: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub crt_timeout: u32,
    /// Raw `ARPHRD` class of the servers' fabric.
    #[serde(default)]
    pub net_dev_class: u32,
    #[serde(default)]
    pub srv_srx_set: i32,
}

/// Response to a "get connection info" request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachInfo {
    pub system: String,
    #[serde(default)]
    pub rank_uris: Vec<RankUri>,
    /// Ranks currently running a management service replica.
    #[serde(default)]
    pub ms_ranks: Vec<u32>,
    #[serde(default)]
    pub client_net_hint: ClientNetHint,
}

/// Fetches connection info from the management service.
#[async_trait]
pub trait ConnectionInfoFetcher: Send + Sync {
    async fn fetch_connection_info(&self, system: &str) -> Result<AttachInfo>;
}

/// Outcome of cleaning up one pool during a machine-wide cleanup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolCleanup {
    pub pool: String,
    /// Handles the service revoked.
    pub count: u32,
    /// Non-zero when the pool could not be cleaned up.
    pub status: i32,
}

/// Response to a machine-wide handle cleanup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupResult {
    pub pools: Vec<PoolCleanup>,
}

/// Revokes pool handles on the management service.
#[async_trait]
pub trait HandleEvictor: Send + Sync {
    /// Revoke `handles` on `pool`.
    async fn evict_pool_handles(&self, pool: &str, handles: &[String]) -> Result<()>;

    /// Revoke every handle the service believes belongs to `machine`.
    async fn cleanup_machine_handles(&self, machine: &str) -> Result<CleanupResult>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attach_info_json_defaults() {
        let info: AttachInfo = serde_json::from_str(r#"{"system":"foo"}"#).unwrap();
        assert_eq!(info.system, "foo");
        assert!(info.rank_uris.is_empty());
        assert_eq!(info.client_net_hint, ClientNetHint::default());
    }

    #[test]
    fn attach_info_json_full() {
        let json = r#"{
            "system": "daos_server",
            "rank_uris": [{"rank": 0, "uri": "ofi+tcp://10.0.0.1:31416"}],
            "ms_ranks": [0],
            "client_net_hint": {"provider": "ofi+tcp", "net_dev_class": 1, "crt_timeout": 30}
        }"#;
        let info: AttachInfo = serde_json::from_str(json).unwrap();
        assert_eq!(info.rank_uris[0].uri, "ofi+tcp://10.0.0.1:31416");
        assert_eq!(info.ms_ranks, vec![0]);
        assert_eq!(info.client_net_hint.provider, "ofi+tcp");
        assert_eq!(info.client_net_hint.crt_timeout, 30);
    }
}
