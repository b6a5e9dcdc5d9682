//! nimsforest launcher.
//!
//! Loads the YAML forest declaration, brings up the embedded broker, starts
//! the forest with its control API (and the viewmodel publisher when a
//! `viewer` section is present), then runs until interrupted.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use nimsforest::api::{ControlApi, api_addr_from_env};
use nimsforest::asker::EchoAsker;
use nimsforest::broker::{BrokerConfig, BrokerHost};
use nimsforest::cancel::CancelToken;
use nimsforest::config::load_config;
use nimsforest::forest::Forest;
use nimsforest::source::{SourceFactory, webhook_addr_from_env};
use nimsforest::viewmodel::ViewmodelPublisher;

#[derive(Parser, Debug)]
#[command(name = "nimsforest", version)]
#[command(about = "Declarative event-processing runtime over an embedded message fabric")]
struct Cli {
    /// Path to the forest configuration file.
    #[arg(long, default_value = "forest.yaml")]
    config: PathBuf,

    /// Broker data directory for streams and KV state.
    #[arg(long, default_value = ".nimsforest")]
    data_dir: PathBuf,

    /// Node name within the cluster.
    #[arg(long, default_value = "node-0")]
    node_name: String,

    /// Cluster name.
    #[arg(long, default_value = "nimsforest")]
    cluster_name: String,

    /// Broker client port (0 auto-assigns, negative uses the default).
    #[arg(long, default_value_t = -1)]
    client_port: i32,

    /// Broker monitor port (-1 disables monitoring).
    #[arg(long, default_value_t = -1)]
    monitor_port: i32,

    /// Peer addresses to join (repeatable). Empty means first-node mode.
    #[arg(long = "peer")]
    peers: Vec<String>,

    /// Control API bind address (overrides NIMSFOREST_API_ADDR).
    #[arg(long)]
    api_addr: Option<String>,

    /// Webhook server bind address (overrides NIMSFOREST_WEBHOOK_ADDR).
    #[arg(long)]
    webhook_addr: Option<String>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;

    let mut broker = BrokerHost::new(BrokerConfig {
        node_name: cli.node_name.clone(),
        cluster_name: cli.cluster_name.clone(),
        data_dir: cli.data_dir.clone(),
        client_port: cli.client_port,
        cluster_port: -1,
        monitor_port: cli.monitor_port,
        peers: cli.peers.clone(),
    })?;
    broker.start()?;
    info!(client = %broker.client_url(), "broker up");

    let webhook_addr = cli.webhook_addr.clone().unwrap_or_else(webhook_addr_from_env);
    let viewer = config.viewer.clone();
    let forest = Arc::new(Forest::new(
        config,
        Some(cli.config.clone()),
        broker.handles()?,
        Arc::new(EchoAsker),
        SourceFactory::new(),
        webhook_addr,
    )?);
    forest.start()?;

    let api_addr = cli.api_addr.clone().unwrap_or_else(api_addr_from_env);
    let mut api = ControlApi::new(Arc::clone(&forest), api_addr);
    api.start()?;

    let mut viewmodel = viewer.map(|viewer_config| {
        ViewmodelPublisher::new(viewer_config, Arc::clone(&forest), forest.fabric().wind)
    });
    let viewmodel_cancel = CancelToken::new();
    if let Some(publisher) = viewmodel.as_mut() {
        publisher.start(viewmodel_cancel.clone())?;
    }

    info!("forest is up; press Ctrl-C to stop");
    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.send(());
    })
    .context("failed to install signal handler")?;
    let _ = shutdown_rx.recv();

    info!("shutting down");
    viewmodel_cancel.cancel();
    if let Some(publisher) = viewmodel.as_mut() {
        publisher.stop();
    }
    api.stop();
    forest.stop();
    broker.shutdown();
    Ok(())
}
