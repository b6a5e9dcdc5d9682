//! Broker host: the embedded message substrate.
//!
//! Composes the subject bus (wind), the file-backed stream store (river,
//! humus), and the revisioned KV (soil) over one data directory, and fronts
//! them with the cluster-facing knobs a real deployment needs: a local client
//! endpoint, best-effort peer routes, and an optional monitor port.

use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::humus::Humus;
use crate::river::{River, StreamStore};
use crate::soil::Soil;
use crate::wind::{Bus, Wind};

/// Default client port when none is configured.
pub const DEFAULT_CLIENT_PORT: u16 = 4222;

/// Start must confirm readiness within this budget.
pub const READY_TIMEOUT: Duration = Duration::from_secs(10);

const PEER_DIAL_TIMEOUT: Duration = Duration::from_secs(2);

/// Broker host configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Node name within the cluster. Required.
    pub node_name: String,
    /// Cluster name. Required.
    pub cluster_name: String,
    /// Root directory for persisted streams and KV state.
    pub data_dir: PathBuf,
    /// Client port: 0 auto-assigns an ephemeral port, negative uses the
    /// default.
    #[serde(default = "default_port")]
    pub client_port: i32,
    /// Cluster route port; negative disables cluster listening.
    #[serde(default = "default_port")]
    pub cluster_port: i32,
    /// Monitor port; -1 disables monitoring.
    #[serde(default = "default_port")]
    pub monitor_port: i32,
    /// Peer addresses (`host:port`). Empty means first-node mode.
    #[serde(default)]
    pub peers: Vec<String>,
}

fn default_port() -> i32 {
    -1
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            node_name: String::new(),
            cluster_name: String::new(),
            data_dir: PathBuf::from("./nimsforest-data"),
            client_port: -1,
            cluster_port: -1,
            monitor_port: -1,
            peers: Vec::new(),
        }
    }
}

/// Shared handles onto the running fabric.
#[derive(Clone, Debug)]
pub struct FabricHandles {
    pub wind: Wind,
    pub river: River,
    pub soil: Soil,
    pub humus: Humus,
}

/// The embedded broker.
#[derive(Debug)]
pub struct BrokerHost {
    config: BrokerConfig,
    bus: Option<Arc<Bus>>,
    streams: Option<Arc<StreamStore>>,
    handles: Option<FabricHandles>,
    client_listener: Option<TcpListener>,
    client_port: u16,
    started: bool,
}

impl BrokerHost {
    /// Validate configuration and create the host. Fails fast on missing
    /// required fields; nothing touches the filesystem until `start`.
    pub fn new(config: BrokerConfig) -> Result<Self> {
        if config.node_name.trim().is_empty() {
            bail!("broker config: node_name is required");
        }
        if config.cluster_name.trim().is_empty() {
            bail!("broker config: cluster_name is required");
        }
        Ok(Self {
            config,
            bus: None,
            streams: None,
            handles: None,
            client_listener: None,
            client_port: 0,
            started: false,
        })
    }

    /// Start the broker: initialize stores, bind the client endpoint, dial
    /// peers, and confirm readiness within [`READY_TIMEOUT`].
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }
        let deadline = Instant::now() + READY_TIMEOUT;

        std::fs::create_dir_all(&self.config.data_dir).with_context(|| {
            format!(
                "failed to create broker data dir {}",
                self.config.data_dir.display()
            )
        })?;

        let streams = StreamStore::open(self.config.data_dir.join("river"))?;
        let soil = Soil::open(&self.config.data_dir.join("soil"))?;
        let bus = Bus::new();

        let river = River::new(Arc::clone(&streams));
        let humus = Humus::new(river.clone());
        let wind = Wind::new(Arc::clone(&bus));

        // Bind the local client endpoint.
        let port = resolve_client_port(self.config.client_port);
        let listener = TcpListener::bind(("127.0.0.1", port))
            .with_context(|| format!("failed to bind client endpoint on port {}", port))?;
        self.client_port = listener
            .local_addr()
            .context("failed to read client endpoint address")?
            .port();

        // Peer routes are best-effort; a bad address is a warning, not fatal.
        for peer in &self.config.peers {
            match dial_peer(peer) {
                Ok(()) => info!(peer = %peer, "peer route established"),
                Err(e) => warn!(peer = %peer, "skipping peer route: {:#}", e),
            }
        }

        if Instant::now() > deadline {
            bail!(
                "broker {} failed to become ready within {:?}",
                self.config.node_name,
                READY_TIMEOUT
            );
        }

        info!(
            node = %self.config.node_name,
            cluster = %self.config.cluster_name,
            client_port = self.client_port,
            "broker ready"
        );

        self.bus = Some(bus);
        self.streams = Some(streams);
        self.handles = Some(FabricHandles {
            wind,
            river,
            soil,
            humus,
        });
        self.client_listener = Some(listener);
        self.started = true;
        Ok(())
    }

    /// Graceful shutdown: stop accepting publishes, drop the client
    /// endpoint, and let consumers drain.
    pub fn shutdown(&mut self) {
        if let Some(bus) = self.bus.take() {
            bus.shutdown();
        }
        if let Some(streams) = self.streams.take() {
            streams.shutdown();
        }
        self.client_listener = None;
        self.handles = None;
        self.started = false;
        info!(node = %self.config.node_name, "broker shut down");
    }

    /// Handles onto the running fabric.
    pub fn handles(&self) -> Result<FabricHandles> {
        self.handles
            .clone()
            .ok_or_else(|| anyhow::anyhow!("broker {} is not started", self.config.node_name))
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Address of the local client endpoint, e.g. `127.0.0.1:4222`.
    pub fn client_url(&self) -> String {
        format!("127.0.0.1:{}", self.client_port)
    }

    /// Monitoring URL; empty iff monitoring is disabled.
    pub fn monitor_url(&self) -> String {
        if self.config.monitor_port < 0 {
            String::new()
        } else {
            format!("http://127.0.0.1:{}", self.config.monitor_port)
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }
}

impl Drop for BrokerHost {
    fn drop(&mut self) {
        if self.started {
            self.shutdown();
        }
    }
}

/// Port selection: 0 picks an ephemeral port, negative means the default.
pub fn resolve_client_port(configured: i32) -> u16 {
    if configured < 0 {
        DEFAULT_CLIENT_PORT
    } else {
        configured as u16
    }
}

fn dial_peer(peer: &str) -> Result<()> {
    let addr = peer
        .parse()
        .with_context(|| format!("invalid peer address {:?}", peer))?;
    TcpStream::connect_timeout(&addr, PEER_DIAL_TIMEOUT)
        .with_context(|| format!("peer {} unreachable", peer))?;
    Ok(())
}
