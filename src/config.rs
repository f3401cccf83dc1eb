//! Configuration loading for the agent.
//!
//! Configuration is loaded from TOML files with the following resolution order:
//! 1. `--config <path>` (CLI flag)
//! 2. `~/.fabric-agent/config.toml` (user)
//! 3. `/etc/fabric-agent/config.toml` (system)

use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::fabric::{FabricInterface, InterfaceFilter, NumaFabric, SystemResolver};
use crate::mgmt::DEFAULT_SYSTEM;
use crate::{AgentError, Result};

/// Agent configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// System to attach to when a client does not name one.
    #[serde(default = "default_system")]
    pub name: String,
    /// Bypass attach-info and fabric caching entirely.
    #[serde(default)]
    pub disable_caching: bool,
    /// Attach-info refresh interval in seconds (0: fetch once, keep forever).
    #[serde(default)]
    pub cache_expiration_secs: u64,
    /// Transport providers to scan the fabric for.
    #[serde(default = "default_providers")]
    pub providers: Vec<String>,
    /// Operator-declared fabric interfaces. When non-empty the fabric is never
    /// scanned.
    #[serde(default)]
    pub fabric_interfaces: Vec<NumaFabricConfig>,
    #[serde(default)]
    pub include_fabric_ifaces: Vec<String>,
    #[serde(default)]
    pub exclude_fabric_ifaces: Vec<String>,
    /// How often each monitored client process is checked for liveness.
    #[serde(default = "default_poll_interval_ms")]
    pub process_poll_interval_ms: u64,
    /// Evict every tracked pool handle when the agent shuts down.
    #[serde(default = "default_true")]
    pub evict_on_shutdown: bool,
    /// Ask the management service to drop this machine's handles at startup.
    #[serde(default)]
    pub cleanup_on_start: bool,
    /// Default log filter (overridden by `RUST_LOG`).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Interfaces declared for one NUMA node.
#[derive(Debug, Clone, Deserialize)]
pub struct NumaFabricConfig {
    pub numa_node: u32,
    #[serde(default)]
    pub interfaces: Vec<FabricInterfaceConfig>,
}

/// One operator-declared interface.
#[derive(Debug, Clone, Deserialize)]
pub struct FabricInterfaceConfig {
    pub iface: String,
    #[serde(default)]
    pub domain: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: default_system(),
            disable_caching: false,
            cache_expiration_secs: 0,
            providers: default_providers(),
            fabric_interfaces: Vec::new(),
            include_fabric_ifaces: Vec::new(),
            exclude_fabric_ifaces: Vec::new(),
            process_poll_interval_ms: default_poll_interval_ms(),
            evict_on_shutdown: true,
            cleanup_on_start: false,
            log_level: default_log_level(),
        }
    }
}

fn default_system() -> String {
    DEFAULT_SYSTEM.to_string()
}

fn default_providers() -> Vec<String> {
    vec!["ofi+tcp".to_string()]
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AgentConfig {
    /// Load and validate configuration from the standard locations.
    ///
    /// Resolution order:
    /// 1. Explicit path (if provided)
    /// 2. `~/.fabric-agent/config.toml`
    /// 3. `/etc/fabric-agent/config.toml`
    ///
    /// With no explicit path and no file found, defaults are used.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let Some(path) = Self::resolve_config_path(explicit_path)? else {
            return Ok(Self::default());
        };
        let content = fs::read_to_string(&path).map_err(|e| {
            AgentError::Configuration(format!("Failed to read config file {path:?}: {e}"))
        })?;
        let config: Self = toml::from_str(&content).map_err(|e| {
            AgentError::Configuration(format!("Failed to parse config file {path:?}: {e}"))
        })?;
        config.validate()?;
        Ok(config)
    }

    fn resolve_config_path(explicit: Option<&Path>) -> Result<Option<PathBuf>> {
        if let Some(path) = explicit {
            if path.exists() {
                return Ok(Some(path.to_path_buf()));
            }
            return Err(AgentError::Configuration(format!(
                "Config file not found: {path:?}"
            )));
        }

        // User config
        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".fabric-agent").join("config.toml");
            if user_config.exists() {
                return Ok(Some(user_config));
            }
        }

        // System config
        let system_config = PathBuf::from("/etc/fabric-agent/config.toml");
        if system_config.exists() {
            return Ok(Some(system_config));
        }

        Ok(None)
    }

    /// Reject settings that cannot work together.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(AgentError::Configuration("system name is empty".to_string()));
        }
        InterfaceFilter::from_lists(&self.include_fabric_ifaces, &self.exclude_fabric_ifaces)?;

        let mut seen = HashSet::new();
        for node in &self.fabric_interfaces {
            for iface in &node.interfaces {
                if iface.iface.is_empty() {
                    return Err(AgentError::Configuration(format!(
                        "empty fabric interface name on NUMA node {}",
                        node.numa_node
                    )));
                }
                if !seen.insert(iface.iface.as_str()) {
                    return Err(AgentError::Configuration(format!(
                        "fabric interface {:?} declared more than once",
                        iface.iface
                    )));
                }
            }
        }
        if self.process_poll_interval_ms == 0 {
            return Err(AgentError::Configuration(
                "process_poll_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.cache_expiration_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.process_poll_interval_ms)
    }

    pub fn interface_filter(&self) -> Result<InterfaceFilter> {
        InterfaceFilter::from_lists(&self.include_fabric_ifaces, &self.exclude_fabric_ifaces)
    }

    /// The operator-declared topology, if any interfaces were declared.
    pub fn static_fabric(&self) -> Option<NumaFabric> {
        let interfaces: Vec<FabricInterface> = self
            .fabric_interfaces
            .iter()
            .flat_map(|node| {
                node.interfaces.iter().map(|iface| {
                    let fi = FabricInterface::manual(&iface.iface, node.numa_node);
                    match &iface.domain {
                        Some(domain) => fi.with_domain(domain),
                        None => fi,
                    }
                })
            })
            .collect();
        if interfaces.is_empty() {
            return None;
        }
        Some(NumaFabric::from_interfaces(
            interfaces,
            Arc::new(SystemResolver),
        ))
    }
}
