mod config;
mod device;
mod dispatch;
mod gateway;

use crate::device::Device;
use crate::dispatch::Dispatcher;
use crate::gateway::ProbeGateway;
use clap::Parser;
use plugd_network::receiver::InboundService;
use plugd_network::{message_queue, sender};
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(about = "Smart plug gateway service")]
struct CliArgs {
    /// Path to the YAML service configuration.
    config: PathBuf,
    /// Log filter directive, overridden by RUST_LOG when set.
    #[arg(long, default_value = "info")]
    log: String,
}

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log)),
        )
        .init();

    let config = match config::load_config(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };

    let bind_address = SocketAddr::from((config.service.addr, config.service.port));
    let inbound = match InboundService::bind(bind_address).await {
        Ok(inbound) => inbound,
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };
    info!("Service listening at {bind_address}");

    let (in_tx, in_rx) = message_queue();
    let (out_tx, out_rx) = message_queue();

    let dispatcher = Dispatcher::new(
        ProbeGateway::new(),
        in_rx,
        out_tx,
        config.service.endpoint(),
        config.peers.values().map(|p| p.endpoint()).collect(),
        config.message_types,
        config.devices.iter().map(Device::from_spec).collect(),
    );

    let cancellation_token = CancellationToken::new();
    let inbound_task = tokio::spawn(inbound.run(in_tx, cancellation_token.clone()));
    let outbound_task = tokio::spawn(sender::run_outbound(out_rx, cancellation_token.clone()));
    let dispatch_task = tokio::spawn(dispatcher.run(cancellation_token.clone()));

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Could not listen for shutdown signal: {e:?}");
    }
    info!("Shutting down");
    cancellation_token.cancel();

    let _ = inbound_task.await;
    let _ = outbound_task.await;
    let _ = dispatch_task.await;
}
