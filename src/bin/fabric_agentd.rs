//! fabric-agentd — fabric agent diagnostics.
//!
//! Runs the agent's fabric scan and device selection against the local
//! node, using the same configuration the agent would.

use std::sync::Arc;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tracing::info;

use fabric_agent::{
    AgentConfig, AgentError, AttachInfo, ConnectionInfoFetcher, InfoCache, NetDevClass,
    SystemScanner,
};

/// Fabric agent daemon tools
#[derive(Parser)]
#[command(name = "fabric-agentd")]
#[command(version = fabric_agent::PKG_VERSION)]
#[command(about = "Fabric agent diagnostics")]
struct Args {
    /// Path to configuration file.
    #[arg(short, long, env = "FABRIC_AGENT_CONFIG")]
    config: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Scan the fabric and print the topology as JSON
    NetScan {
        /// Providers to scan for (default: from config)
        #[arg(short, long)]
        provider: Vec<String>,
    },

    /// Select a fabric interface the way a client request would
    Select {
        /// NUMA node of the client
        #[arg(short, long, default_value_t = 0)]
        numa: u32,
        /// Transport provider
        #[arg(short, long)]
        provider: String,
        /// Device class (name such as "ether" or ARPHRD number)
        #[arg(short, long, default_value = "any")]
        class: NetDevClass,
    },

    /// Print build metadata as JSON
    Version,
}

/// Attach info is served by the management service over RPC, which these
/// tools do not speak.
struct NoManagementService;

#[async_trait]
impl ConnectionInfoFetcher for NoManagementService {
    async fn fetch_connection_info(&self, system: &str) -> fabric_agent::Result<AttachInfo> {
        Err(AgentError::Upstream(format!(
            "no management service connection for system {system:?}"
        )))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    if let Command::Version = args.command {
        println!("{}", serde_json::to_string_pretty(&fabric_agent::version::build_info())?);
        return Ok(());
    }
    let config = AgentConfig::load(args.config.as_deref())?;

    // RUST_LOG overrides the configured level.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .init();

    info!(
        version = fabric_agent::version_string(),
        built_at = fabric_agent::version::BUILD_TIMESTAMP,
        system = %config.name,
        "fabric-agentd starting"
    );

    match args.command {
        Command::NetScan { provider } => {
            let mut config = config;
            if !provider.is_empty() {
                config.providers = provider;
            }
            let cache = build_cache(&config)?;
            let fabric = cache.fabric().await?;
            println!("{}", serde_json::to_string_pretty(&fabric.snapshot())?);
        }
        Command::Select {
            numa,
            provider,
            class,
        } => {
            let cache = build_cache(&config)?;
            let device = cache.get_fabric_device(numa, class, &provider).await?;
            println!("{device}");
        }
        Command::Version => {}
    }

    Ok(())
}

fn build_cache(config: &AgentConfig) -> fabric_agent::Result<InfoCache> {
    let scanner = SystemScanner::new(config.interface_filter()?);
    InfoCache::builder()
        .config(config)
        .fetcher(Arc::new(NoManagementService))
        .scanner(Arc::new(scanner))
        .build()
}
