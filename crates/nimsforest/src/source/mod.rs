//! Inbound adapters.
//!
//! A source feeds raw external payloads onto river. The core ships webhook,
//! poll, and ceremony kinds; platform kinds (chat ingress and friends) are
//! registered by the embedding application through the factory.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::cancel::CancelToken;
use crate::config::SourceConfig;
use crate::river::River;
use crate::soil::Soil;

mod ceremony;
mod poll;
mod webhook;

pub use ceremony::CeremonySource;
pub use poll::PollSource;
pub use webhook::{WebhookServer, WebhookSource, webhook_addr_from_env};

/// The flavor of an inbound adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Webhook,
    Poll,
    Ceremony,
    Platform,
}

/// An inbound adapter.
pub trait Source: Send {
    fn name(&self) -> &str;
    fn kind(&self) -> SourceKind;
    /// River subject this source publishes on.
    fn publishes(&self) -> &str;
    fn start(&mut self, cancel: CancelToken) -> Result<()>;
    fn stop(&mut self);
}

/// Builder for a platform source kind.
pub type PlatformBuilder =
    Arc<dyn Fn(&SourceConfig, River) -> Result<Box<dyn Source>> + Send + Sync>;

/// Builds sources from descriptors, resolving platform kinds through the
/// registry.
#[derive(Default, Clone)]
pub struct SourceFactory {
    platforms: BTreeMap<String, PlatformBuilder>,
}

impl SourceFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a builder for a platform source type.
    pub fn register_platform(&mut self, kind: &str, builder: PlatformBuilder) {
        self.platforms.insert(kind.to_string(), builder);
    }

    pub fn build(
        &self,
        config: &SourceConfig,
        river: &River,
        soil: &Soil,
        webhooks: &WebhookServer,
    ) -> Result<Box<dyn Source>> {
        match config.kind.as_str() {
            "http_webhook" => Ok(Box::new(
                WebhookSource::new(config, river.clone(), webhooks.clone())
                    .with_context(|| format!("source {}", config.name))?,
            )),
            "http_poll" => Ok(Box::new(
                PollSource::new(config, river.clone(), soil.clone())
                    .with_context(|| format!("source {}", config.name))?,
            )),
            "ceremony" => Ok(Box::new(
                CeremonySource::new(config, river.clone())
                    .with_context(|| format!("source {}", config.name))?,
            )),
            kind => match self.platforms.get(kind) {
                Some(builder) => builder(config, river.clone()),
                None => bail!("source {}: unknown type {:?}", config.name, kind),
            },
        }
    }
}

impl std::fmt::Debug for SourceFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceFactory")
            .field("platforms", &self.platforms.keys().collect::<Vec<_>>())
            .finish()
    }
}
