#![forbid(unsafe_code)]
//! Local validator network orchestrator entrypoint

use clap::Parser;
use localnet::config::load_config;
use localnet::keys::OpensslKeyProvider;
use localnet::network::{Network, NetworkPreset};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "localnet", about = "Build and supervise a local validator network")]
struct Args {
    /// Topology preset to build
    #[arg(long, value_enum)]
    network_type: NetworkPreset,

    /// Override the block version advertised by every node
    #[arg(long)]
    block_version: Option<u32>,

    /// Path to the orchestrator config file (defaults to ./localnet.toml)
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let config = match load_config(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load config: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let keys = Arc::new(OpensslKeyProvider::new(&config));
    let mut network = match Network::new(config, keys, args.block_version) {
        Ok(network) => network,
        Err(e) => {
            error!("Failed to set up working directory: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = network.apply_preset(args.network_type) {
        error!("Failed to build topology: {}", e);
        return ExitCode::FAILURE;
    }

    if let Err(e) = network.start().await {
        error!("Failed to start network: {}", e);
        network.stop().await;
        return ExitCode::FAILURE;
    }

    info!("Network is up; watching processes");
    if network.wait().await {
        ExitCode::SUCCESS
    } else {
        network.stop().await;
        ExitCode::FAILURE
    }
}
