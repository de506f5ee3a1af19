//! stackbd satellite
//!
//! Builds the layer registry over the real tool adapters and keeps the
//! device processing engine available for controller requests.

use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use stackbd::{
    DeviceProcessor, DmsetupOps, DrbdAdmOps, DrbdLayer, CryptsetupOps, LayerRegistry,
    LogNotifier, LuksLayer, LvmProvider, NvmeCliOps, NvmeLayer, Result, SnapshotShippingManager,
    SpdkProvider, StorageLayer, WritecacheLayer, ZfsProvider,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// stackbd satellite - layered block device processing engine
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory for generated DRBD resource files
    #[arg(long, env = "DRBD_CONFIG_DIR", default_value = "/var/lib/stackbd/drbd.d")]
    drbd_config_dir: String,

    /// nvmet configfs mount point
    #[arg(long, env = "NVMET_DIR", default_value = "/sys/kernel/config/nvmet")]
    nvmet_dir: String,

    /// Timeout for external tool invocations in seconds
    #[arg(long, env = "TOOL_TIMEOUT", default_value = "60")]
    tool_timeout_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    info!("Starting stackbd satellite");
    info!("  Version: {}", stackbd::VERSION);
    info!("  DRBD config dir: {}", args.drbd_config_dir);
    info!("  Tool timeout: {}s", args.tool_timeout_secs);

    tokio::fs::create_dir_all(&args.drbd_config_dir).await?;

    let providers: Vec<Arc<dyn stackbd::ProviderOps>> = vec![
        Arc::new(LvmProvider::thick()),
        Arc::new(LvmProvider::thin()),
        Arc::new(ZfsProvider::thick()),
        Arc::new(ZfsProvider::thin()),
        Arc::new(SpdkProvider::new()),
    ];
    let storage = Arc::new(StorageLayer::new(providers));
    let nvme_ops = Arc::new(NvmeCliOps::new(args.nvmet_dir.clone()));

    let mut registry = LayerRegistry::new();
    registry.register(storage.clone());
    registry.register(Arc::new(LuksLayer::new(Arc::new(CryptsetupOps))));
    registry.register(Arc::new(WritecacheLayer::new(Arc::new(DmsetupOps))));
    registry.register(Arc::new(NvmeLayer::new(nvme_ops.clone())));
    registry.register(Arc::new(NvmeLayer::openflex(nvme_ops)));
    registry.register(Arc::new(DrbdLayer::new(Arc::new(DrbdAdmOps::new(
        args.drbd_config_dir.clone(),
    )))));

    let _processor = DeviceProcessor::new(
        Arc::new(registry),
        storage,
        Arc::new(LogNotifier),
        Duration::from_secs(args.tool_timeout_secs),
    );
    info!("Layer registry initialized");

    let (shipping, mut outcomes) = SnapshotShippingManager::new();
    tokio::spawn(async move {
        while let Some(outcome) = outcomes.recv().await {
            info!(
                "Shipping outcome: group={} snapshot={} success={}",
                outcome.group_id, outcome.snapshot, outcome.success
            );
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    for group in shipping.active_groups() {
        if let Err(e) = shipping.abort_group(&group) {
            tracing::warn!("Could not abort shipping group '{}': {}", group, e);
        }
    }
    info!("Satellite shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
