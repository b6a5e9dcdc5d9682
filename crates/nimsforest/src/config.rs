//! Forest configuration.
//!
//! A forest is declared in one YAML file: top-level maps of `name ->
//! descriptor` per component kind. Names are the map keys and are reflected
//! into the descriptors after load. Relative `script`, `prompt`, and `path`
//! fields resolve against the config file's directory.
//!
//! Validation happens at load time and fails with messages naming the
//! offending field; a config that loads is safe to hand to the forest.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Source descriptor. The `type` field selects the adapter:
/// `http_webhook`, `http_poll`, `ceremony`, or a registered platform kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SourceConfig {
    /// Reflected from the map key after load.
    #[serde(skip)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    /// River subject raw payloads are published on.
    #[serde(default)]
    pub publishes: String,
    /// Webhook: HTTP path this source is mounted at.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Webhook: optional HMAC secret for signature verification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    /// Poll: URL to fetch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Poll: HTTP method, GET (default) or POST.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Poll/ceremony: tick interval as a duration string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    /// Poll: per-request timeout as a duration string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    /// Poll: cursor-based pagination.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<CursorConfig>,
    /// Ceremony: fixed payload to emit each tick.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// Ceremony: inline Lua producing the payload instead.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
    /// Platform-specific settings, passed through to the builder.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Cursor pagination settings for poll sources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorConfig {
    /// Request query parameter carrying the cursor.
    pub param: String,
    /// Dot-path into the response JSON for the next cursor.
    pub path: String,
    /// Soil key the cursor persists under, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub soil_key: Option<String>,
}

/// Tree descriptor: river subject in, wind subject out, script on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TreeConfig {
    #[serde(skip)]
    pub name: String,
    #[serde(default)]
    pub watches: String,
    #[serde(default)]
    pub publishes: String,
    #[serde(default)]
    pub script: PathBuf,
}

/// TreeHouse descriptor: wind in, wind out, script on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TreeHouseConfig {
    #[serde(skip)]
    pub name: String,
    #[serde(default)]
    pub subscribes: String,
    #[serde(default)]
    pub publishes: String,
    #[serde(default)]
    pub script: PathBuf,
}

/// Nim descriptor: wind in, wind out (placeholders allowed), prompt on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct NimConfig {
    #[serde(skip)]
    pub name: String,
    #[serde(default)]
    pub subscribes: String,
    #[serde(default)]
    pub publishes: String,
    #[serde(default)]
    pub prompt: PathBuf,
}

/// Bedrock descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct BedrockConfig {
    #[serde(skip)]
    pub name: String,
    /// `unix` or `git`.
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Root directory of the bedrock.
    #[serde(default)]
    pub path: PathBuf,
    #[serde(default)]
    pub read_only: bool,
    /// Git: remote URL to clone/push.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<String>,
    /// Git: branch to track (default `main`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    /// Git: `commit` (default) or `pull_request`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_mode: Option<String>,
    /// Git: pull-request workflow settings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr: Option<PrSettings>,
}

/// Pull-request workflow settings for a git bedrock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PrSettings {
    /// Base branch PRs target; defaults to the bedrock branch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reviewers: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
    /// Prefix for generated PR branch names.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_prefix: Option<String>,
}

/// Songbird descriptor (outbound messaging adapter; registered externally).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SongbirdConfig {
    #[serde(skip)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub subscribes: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Flowerbed descriptor (outbound HTTP static content; registered externally).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct FlowerbedConfig {
    #[serde(skip)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub subscribes: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Viewmodel publisher settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewerConfig {
    #[serde(default = "default_state_subject")]
    pub state_subject: String,
    #[serde(default = "default_events_subject")]
    pub events_subject: String,
    /// Publish cadence in beats.
    #[serde(default = "default_beats")]
    pub beats: u32,
    /// Beats per second.
    #[serde(default = "default_hz")]
    pub hz: u32,
    /// Republish the snapshot only when it changed.
    #[serde(default)]
    pub only_on_change: bool,
}

fn default_state_subject() -> String {
    "forest.viewmodel.state".to_string()
}

fn default_events_subject() -> String {
    "forest.viewmodel.events".to_string()
}

fn default_beats() -> u32 {
    90
}

fn default_hz() -> u32 {
    90
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            state_subject: default_state_subject(),
            events_subject: default_events_subject(),
            beats: default_beats(),
            hz: default_hz(),
            only_on_change: false,
        }
    }
}

/// The whole forest declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub sources: BTreeMap<String, SourceConfig>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub trees: BTreeMap<String, TreeConfig>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub treehouses: BTreeMap<String, TreeHouseConfig>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub nims: BTreeMap<String, NimConfig>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub songbirds: BTreeMap<String, SongbirdConfig>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub flowerbeds: BTreeMap<String, FlowerbedConfig>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub bedrocks: BTreeMap<String, BedrockConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viewer: Option<ViewerConfig>,
}

/// Load and validate a config file. Relative paths resolve against the
/// file's directory.
pub fn load_config(path: &Path) -> Result<Config> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    load_config_str(&text, base)
}

/// Parse and validate config text against a base directory.
pub fn load_config_str(text: &str, base: &Path) -> Result<Config> {
    let mut config: Config = serde_yaml::from_str(text).context("failed to parse config YAML")?;
    reflect_names(&mut config);
    resolve_paths(&mut config, base);
    validate(&config)?;
    Ok(config)
}

/// Serialize a config back to YAML (names stay map keys).
pub fn serialize_config(config: &Config) -> Result<String> {
    serde_yaml::to_string(config).context("failed to serialize config")
}

fn reflect_names(config: &mut Config) {
    for (name, c) in &mut config.sources {
        c.name = name.clone();
    }
    for (name, c) in &mut config.trees {
        c.name = name.clone();
    }
    for (name, c) in &mut config.treehouses {
        c.name = name.clone();
    }
    for (name, c) in &mut config.nims {
        c.name = name.clone();
    }
    for (name, c) in &mut config.songbirds {
        c.name = name.clone();
    }
    for (name, c) in &mut config.flowerbeds {
        c.name = name.clone();
    }
    for (name, c) in &mut config.bedrocks {
        c.name = name.clone();
    }
}

fn resolve_paths(config: &mut Config, base: &Path) {
    for c in config.trees.values_mut() {
        c.script = resolve(base, &c.script);
    }
    for c in config.treehouses.values_mut() {
        c.script = resolve(base, &c.script);
    }
    for c in config.nims.values_mut() {
        c.prompt = resolve(base, &c.prompt);
    }
    for c in config.bedrocks.values_mut() {
        c.path = resolve(base, &c.path);
    }
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.as_os_str().is_empty() || path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

const SOURCE_KINDS: &[&str] = &["http_webhook", "http_poll", "ceremony"];
const BEDROCK_KINDS: &[&str] = &["unix", "git"];
const GIT_WRITE_MODES: &[&str] = &["commit", "pull_request"];

fn validate(config: &Config) -> Result<()> {
    for (name, c) in &config.sources {
        validate_source(c).map_err(|e| anyhow::anyhow!("source {}: {}", name, e))?;
    }
    for (name, c) in &config.trees {
        validate_tree(c).map_err(|e| anyhow::anyhow!("tree {}: {}", name, e))?;
    }
    for (name, c) in &config.treehouses {
        validate_treehouse(c).map_err(|e| anyhow::anyhow!("treehouse {}: {}", name, e))?;
    }
    for (name, c) in &config.nims {
        validate_nim(c).map_err(|e| anyhow::anyhow!("nim {}: {}", name, e))?;
    }
    for (name, c) in &config.bedrocks {
        validate_bedrock(c).map_err(|e| anyhow::anyhow!("bedrock {}: {}", name, e))?;
    }
    Ok(())
}

/// Field-level validation for a source descriptor.
pub fn validate_source(c: &SourceConfig) -> Result<()> {
    if c.kind.is_empty() {
        bail!("type is required");
    }
    if c.publishes.is_empty() {
        bail!("publishes is required");
    }
    match c.kind.as_str() {
        "http_webhook" => {
            if c.path.as_deref().unwrap_or("").is_empty() {
                bail!("path is required for http_webhook");
            }
        }
        "http_poll" => {
            if c.url.as_deref().unwrap_or("").is_empty() {
                bail!("url is required for http_poll");
            }
            if let Some(interval) = &c.interval {
                if nimsforest_duration::parse_duration(interval).is_err() {
                    bail!("invalid interval");
                }
            }
        }
        "ceremony" => {
            let interval = c
                .interval
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("interval is required"))?;
            if nimsforest_duration::parse_duration(interval).is_err() {
                bail!("invalid interval");
            }
        }
        // Platform kinds are validated by their registered builder at
        // construction time; here we only require a non-empty type.
        _ => {}
    }
    Ok(())
}

/// Field-level validation for a tree descriptor.
pub fn validate_tree(c: &TreeConfig) -> Result<()> {
    if c.watches.is_empty() {
        bail!("watches is required");
    }
    if c.publishes.is_empty() {
        bail!("publishes is required");
    }
    if c.script.as_os_str().is_empty() {
        bail!("script is required");
    }
    Ok(())
}

/// Field-level validation for a treehouse descriptor.
pub fn validate_treehouse(c: &TreeHouseConfig) -> Result<()> {
    if c.subscribes.is_empty() {
        bail!("subscribes is required");
    }
    if c.publishes.is_empty() {
        bail!("publishes is required");
    }
    if c.script.as_os_str().is_empty() {
        bail!("script is required");
    }
    Ok(())
}

/// Field-level validation for a nim descriptor.
pub fn validate_nim(c: &NimConfig) -> Result<()> {
    if c.subscribes.is_empty() {
        bail!("subscribes is required");
    }
    if c.publishes.is_empty() {
        bail!("publishes is required");
    }
    if c.prompt.as_os_str().is_empty() {
        bail!("prompt is required");
    }
    Ok(())
}

/// Field-level validation for a bedrock descriptor.
pub fn validate_bedrock(c: &BedrockConfig) -> Result<()> {
    if c.kind.is_empty() {
        bail!("type is required");
    }
    if !BEDROCK_KINDS.contains(&c.kind.as_str()) {
        bail!("unknown type {:?}", c.kind);
    }
    if c.path.as_os_str().is_empty() {
        bail!("path is required");
    }
    if c.kind == "git" {
        if let Some(mode) = &c.write_mode {
            if !GIT_WRITE_MODES.contains(&mode.as_str()) {
                bail!(
                    "write_mode must be one of {:?}, got {:?}",
                    GIT_WRITE_MODES,
                    mode
                );
            }
        }
    }
    Ok(())
}

/// Whether the given source type is one of the built-in kinds (as opposed to
/// a platform kind resolved through the factory registry).
pub fn is_builtin_source_kind(kind: &str) -> bool {
    SOURCE_KINDS.contains(&kind)
}
