//! # NimsForest core
//!
//! A distributed event-processing runtime. Operators declare, in
//! configuration, a graph of cooperating components that consume, transform,
//! and emit messages over a shared publish/subscribe substrate; this crate is
//! the runtime that makes the graph live.
//!
//! ## Fabric
//!
//! The embedded broker composes three layers over one data directory:
//!
//! - [`wind`] — ephemeral subject pub/sub carrying typed [`Leaf`] events,
//!   with `*`/`>` wildcard subscriptions.
//! - [`river`] — persistent, replayable log of raw payloads with named
//!   durable consumers (at-least-once, explicit ack).
//! - [`soil`] — revisioned key/value store with compare-and-set writes.
//! - [`humus`] — append-only change journal whose entries a [`decomposer`]
//!   lands into soil with retry/backoff.
//!
//! ## Components
//!
//! [`source`]s publish inbound payloads onto river; [`tree`]s parse river
//! payloads through a deterministic Lua [`script`] engine onto wind;
//! [`treehouse`]s transform wind-to-wind; [`nim`]s render prompt templates,
//! call an [`asker`], and publish AI results (with dynamic subject
//! interpolation); [`bedrock`]s watch persistent filesystem trees, mediate
//! writes with distributed locks, and optionally drive a git
//! commit/pull-request workflow.
//!
//! The [`forest`] lifecycle manager owns every instance and supports runtime
//! add/remove/pause/resume plus diff-based [`forest::Forest::reload`]. The
//! [`api`] module serves the HTTP control surface, [`client`] is its blocking
//! counterpart, and [`viewmodel`] periodically publishes world snapshots
//! back onto wind.
//!
//! ## Example
//!
//! ```no_run
//! use nimsforest::broker::{BrokerConfig, BrokerHost};
//!
//! let mut host = BrokerHost::new(BrokerConfig {
//!     node_name: "node-a".into(),
//!     cluster_name: "forest".into(),
//!     data_dir: "./data".into(),
//!     ..Default::default()
//! })?;
//! host.start()?;
//! let handles = host.handles()?;
//! handles.wind.drop_leaf(nimsforest_types::Leaf::new(
//!     "forest.hello",
//!     b"{}".to_vec(),
//!     "example",
//! ))?;
//! # anyhow::Ok(())
//! ```

/// Cancellation tokens for component start/stop.
pub mod cancel;

/// Atomic JSON file persistence helpers.
pub(crate) mod fsutil;

/// Embedded broker host: bus + stream store + revisioned KV over a data dir.
pub mod broker;

/// Ephemeral pub/sub over the broker: drop, catch, whisper.
pub mod wind;

/// Persistent, replayable log with named durable consumers.
pub mod river;

/// Revisioned key/value store with compare-and-set writes.
pub mod soil;

/// Append-only change journal.
pub mod humus;

/// Durable worker landing humus slots into soil.
pub mod decomposer;

/// Deterministic Lua transformer engine.
pub mod script;

/// River-to-wind parser component.
pub mod tree;

/// Wind-to-wind transformer component.
pub mod treehouse;

/// The asker seam to external AI adapters.
pub mod asker;

/// Wind-to-wind AI processor component.
pub mod nim;

/// Persistent filesystem-backed source of truth (unix and git variants).
pub mod bedrock;

/// Inbound adapters: webhook, poll, ceremony, pluggable platforms.
pub mod source;

/// Outbound adapter seams (songbirds, flowerbeds).
pub mod outbound;

/// YAML configuration: descriptors, path resolution, validation.
pub mod config;

/// Lifecycle manager for every component instance.
pub mod forest;

/// HTTP management surface over the forest.
pub mod api;

/// Blocking client for the control API.
pub mod client;

/// Periodic world-snapshot publisher.
pub mod viewmodel;

pub use nimsforest_types::{
    BedrockEvent, BedrockEventType, BedrockFileInfo, BedrockKind, BedrockLock, BedrockManifest,
    ComponentKind, ComponentState, ComponentSummary, ForestError, ForestStatus, HumusSlot, Leaf,
    LockType, RiverMessage,
};
