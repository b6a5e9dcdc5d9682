//! Domain types shared across the nimsforest runtime.
//!
//! This crate defines the wire-level and state-level records that travel
//! between forest components: leaves on Wind, raw messages on River, journal
//! slots in Humus, bedrock file/lock/event records, and the status snapshots
//! served by the control plane. It also carries the sentinel error taxonomy
//! that the Control API maps to HTTP status codes, and the subject-matching
//! rules used by the in-process broker.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Distinguishable state errors surfaced by the fabric and bedrock layers.
///
/// These are the errors callers are expected to match on; everything else in
/// the runtime flows through `anyhow` with context chains.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ForestError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("bedrock is read-only")]
    ReadOnly,
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("locked by {holder}")]
    Locked { holder: String },
    #[error("awaiting PR approval ({pr_ref})")]
    AwaitingPrApproval { pr_ref: String },
    #[error("revision conflict on {key}: expected {expected}, current {current}")]
    RevisionConflict {
        key: String,
        expected: u64,
        current: u64,
    },
    #[error("bedrock stopped")]
    BedrockStopped,
    #[error("invalid subject: {0}")]
    InvalidSubject(String),
    /// Transient: the broker/bus is shut down or shutting down.
    #[error("stopped")]
    Stopped,
}

/// A typed event on Wind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Leaf {
    /// Dot-separated routing key.
    pub subject: String,
    /// Opaque payload, canonically a JSON object. May be empty only for
    /// signalling subjects.
    pub data: Vec<u8>,
    /// Origin tag, e.g. `tree:scoring` or `bedrock:docs`.
    pub source: String,
    pub timestamp: DateTime<Utc>,
}

impl Leaf {
    pub fn new(subject: impl Into<String>, data: Vec<u8>, source: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            data,
            source: source.into(),
            timestamp: Utc::now(),
        }
    }

    /// Decode the payload as JSON.
    pub fn json(&self) -> Result<Value, serde_json::Error> {
        serde_json::from_slice(&self.data)
    }

    /// A leaf is publishable when its subject is a valid concrete subject.
    pub fn validate(&self) -> Result<(), ForestError> {
        subject::validate_subject(&self.subject)
    }
}

/// A raw persisted message on River.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiverMessage {
    pub subject: String,
    pub data: Vec<u8>,
    /// Position in the stream, starting at 1.
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
}

/// One append-only journal entry in Humus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HumusSlot {
    /// Who declared the change, e.g. `nim:qualifier`.
    pub emitter: String,
    pub entity_id: String,
    /// Operation verb; `update` and `delete` are understood by decomposers.
    pub operation: String,
    pub payload: Value,
    /// Assigned by the journal on append; 0 until then.
    #[serde(default)]
    pub sequence: u64,
}

/// Metadata for one file or directory below a bedrock root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BedrockFileInfo {
    /// Path relative to the bedrock root.
    pub path: String,
    pub name: String,
    pub size: u64,
    pub modified_time: DateTime<Utc>,
    pub is_dir: bool,
    pub mime_type: String,
    /// `sha256:<hex>` for regular files up to the hash size cap.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
}

/// The flavor of a bedrock instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BedrockKind {
    Unix,
    Git,
}

impl std::fmt::Display for BedrockKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BedrockKind::Unix => write!(f, "unix"),
            BedrockKind::Git => write!(f, "git"),
        }
    }
}

/// Summary of a bedrock's contents, published alongside mount events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BedrockManifest {
    pub name: String,
    pub kind: BedrockKind,
    pub root: String,
    pub file_count: u64,
    pub total_size: u64,
    pub last_scan: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

/// Flavor of a distributed bedrock lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockType {
    /// Short-lived exclusive write lock; expires after its TTL.
    Write,
    /// Held while a pull request is open; never expires by time.
    PendingPr,
}

/// A distributed lock record stored in Soil at `bedrock:<name>:lock:<path>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BedrockLock {
    /// Lock holder identity, `<hostname>:<pid>`.
    pub holder: String,
    pub lock_type: LockType,
    pub acquired_at: DateTime<Utc>,
    pub ttl_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pr_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl BedrockLock {
    /// Whether the lock has lapsed at `now`. `pending_pr` locks never expire
    /// by time; they are released when the PR is merged or closed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.lock_type {
            LockType::PendingPr => false,
            LockType::Write => {
                let age = now.signed_duration_since(self.acquired_at);
                age.num_seconds() > self.ttl_seconds as i64
            }
        }
    }
}

/// What happened below a bedrock root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BedrockEventType {
    #[serde(rename = "mounted")]
    Mounted,
    #[serde(rename = "unmounted")]
    Unmounted,
    #[serde(rename = "file.created")]
    FileCreated,
    #[serde(rename = "file.modified")]
    FileModified,
    #[serde(rename = "file.deleted")]
    FileDeleted,
    #[serde(rename = "file.moved")]
    FileMoved,
}

impl BedrockEventType {
    /// The subject token(s) for this event type, e.g. `file.created`.
    pub fn as_subject(&self) -> &'static str {
        match self {
            BedrockEventType::Mounted => "mounted",
            BedrockEventType::Unmounted => "unmounted",
            BedrockEventType::FileCreated => "file.created",
            BedrockEventType::FileModified => "file.modified",
            BedrockEventType::FileDeleted => "file.deleted",
            BedrockEventType::FileMoved => "file.moved",
        }
    }
}

/// A change notification emitted by a bedrock onto Wind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BedrockEvent {
    pub bedrock_name: String,
    pub event_type: BedrockEventType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_info: Option<BedrockFileInfo>,
}

impl BedrockEvent {
    /// Wind subject this event is published on: `bedrock.<name>.<type>`.
    pub fn subject(&self) -> String {
        format!("bedrock.{}.{}", self.bedrock_name, self.event_type.as_subject())
    }
}

/// Lifecycle state of a managed component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentState {
    #[default]
    Created,
    Running,
    Paused,
    Stopped,
}

/// The kind of a managed component, as reported by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    Source,
    Tree,
    #[serde(rename = "treehouse")]
    TreeHouse,
    Nim,
    Bedrock,
    Songbird,
    Flowerbed,
}

impl std::fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ComponentKind::Source => "source",
            ComponentKind::Tree => "tree",
            ComponentKind::TreeHouse => "treehouse",
            ComponentKind::Nim => "nim",
            ComponentKind::Bedrock => "bedrock",
            ComponentKind::Songbird => "songbird",
            ComponentKind::Flowerbed => "flowerbed",
        };
        write!(f, "{}", s)
    }
}

/// One row in a status listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentSummary {
    pub name: String,
    pub kind: ComponentKind,
    /// The primary subject this component consumes or produces.
    pub subject: String,
    pub state: ComponentState,
}

/// Full forest status as served by `GET /api/v1/status`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ForestStatus {
    pub running: bool,
    pub sources: Vec<ComponentSummary>,
    pub trees: Vec<ComponentSummary>,
    pub treehouses: Vec<ComponentSummary>,
    pub nims: Vec<ComponentSummary>,
    pub bedrocks: Vec<ComponentSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_path: Option<String>,
}

impl ForestStatus {
    /// All component summaries across kinds, in listing order.
    pub fn all_components(&self) -> Vec<&ComponentSummary> {
        self.sources
            .iter()
            .chain(self.trees.iter())
            .chain(self.treehouses.iter())
            .chain(self.nims.iter())
            .chain(self.bedrocks.iter())
            .collect()
    }
}

/// The periodic full-world snapshot published on the viewmodel subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewmodelSnapshot {
    pub lands: Vec<ComponentSummary>,
    pub summary: ViewmodelSummary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewmodelSummary {
    pub running: bool,
    pub total: usize,
    pub by_kind: BTreeMap<String, usize>,
}

/// An incremental change published on the viewmodel events subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewmodelEvent {
    /// `component.added` or `component.removed`.
    pub event_type: String,
    pub name: String,
    pub kind: ComponentKind,
    pub timestamp: DateTime<Utc>,
}

/// Subject grammar: dot-separated tokens, `*` matches one token, `>` matches
/// one or more trailing tokens.
pub mod subject {
    use serde_json::Value;

    use super::ForestError;

    /// Whether `subject` (a concrete subject) matches `pattern`.
    ///
    /// `a.*.c` matches exactly one token in the starred position; `a.>`
    /// matches one or more trailing tokens. A concrete subject never contains
    /// wildcards itself.
    pub fn matches(pattern: &str, subject: &str) -> bool {
        if pattern.is_empty() || subject.is_empty() {
            return false;
        }
        let pat: Vec<&str> = pattern.split('.').collect();
        let sub: Vec<&str> = subject.split('.').collect();

        let mut i = 0;
        for (pi, token) in pat.iter().enumerate() {
            match *token {
                ">" => {
                    // `>` must be terminal and match at least one token.
                    return pi == pat.len() - 1 && i < sub.len();
                }
                "*" => {
                    if i >= sub.len() {
                        return false;
                    }
                    i += 1;
                }
                literal => {
                    if i >= sub.len() || sub[i] != literal {
                        return false;
                    }
                    i += 1;
                }
            }
        }
        i == sub.len()
    }

    /// Validate a concrete publish subject: non-empty, no empty tokens.
    pub fn validate_subject(s: &str) -> Result<(), ForestError> {
        if s.is_empty() {
            return Err(ForestError::InvalidSubject("empty subject".to_string()));
        }
        if s.split('.').any(|t| t.is_empty()) {
            return Err(ForestError::InvalidSubject(format!(
                "empty token in {:?}",
                s
            )));
        }
        Ok(())
    }

    /// Validate a subscription pattern: like a subject, but `>` only terminal.
    pub fn validate_pattern(s: &str) -> Result<(), ForestError> {
        validate_subject(s)?;
        let tokens: Vec<&str> = s.split('.').collect();
        for (i, t) in tokens.iter().enumerate() {
            if *t == ">" && i != tokens.len() - 1 {
                return Err(ForestError::InvalidSubject(format!(
                    "'>' must be the last token in {:?}",
                    s
                )));
            }
        }
        Ok(())
    }

    /// Replace `{field}` placeholders in a publish subject with the string
    /// form of `output[field]`.
    ///
    /// Missing fields leave the placeholder intact, so a subject that never
    /// resolves stays literal (and re-interpolation is a no-op). Wildcard
    /// tokens are not placeholders and pass through unchanged.
    pub fn interpolate(pattern: &str, output: &Value) -> String {
        let mut result = String::with_capacity(pattern.len());
        let mut rest = pattern;

        while let Some(open) = rest.find('{') {
            let (head, tail) = rest.split_at(open);
            result.push_str(head);
            match tail[1..].find('}') {
                Some(close) => {
                    let name = &tail[1..1 + close];
                    match lookup_token(output, name) {
                        Some(replacement) if is_placeholder_name(name) => {
                            result.push_str(&replacement);
                        }
                        _ => {
                            result.push_str(&tail[..close + 2]);
                        }
                    }
                    rest = &tail[close + 2..];
                }
                None => {
                    result.push_str(tail);
                    return result;
                }
            }
        }
        result.push_str(rest);
        result
    }

    fn is_placeholder_name(name: &str) -> bool {
        !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
    }

    fn lookup_token(output: &Value, field: &str) -> Option<String> {
        let v = output.as_object()?.get(field)?;
        match v {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }
}
