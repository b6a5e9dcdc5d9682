//! Unix bedrock: a plain directory tree.

use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use nimsforest_types::{
    BedrockEvent, BedrockEventType, BedrockFileInfo, BedrockKind, BedrockManifest, ComponentState,
    ForestError, Leaf,
};
use sha2::{Digest, Sha256};
use tracing::warn;

use super::watcher::WatcherHandle;
use super::{Bedrock, is_ignored};
use crate::cancel::CancelToken;
use crate::config::BedrockConfig;
use crate::wind::Wind;

/// Files larger than this skip the content hash in stat output.
pub const HASH_SIZE_CAP: u64 = 10 * 1024 * 1024;

pub struct UnixBedrock {
    name: String,
    root: PathBuf,
    read_only: bool,
    state: ComponentState,
    watcher: Option<WatcherHandle>,
}

impl UnixBedrock {
    /// Create the bedrock, creating its root directory if missing.
    pub fn new(config: &BedrockConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.path).with_context(|| {
            format!(
                "failed to create bedrock root {} for {}",
                config.path.display(),
                config.name
            )
        })?;
        Ok(Self {
            name: config.name.clone(),
            root: config.path.clone(),
            read_only: config.read_only,
            state: ComponentState::Created,
            watcher: None,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Validate a relative path and join it below the root.
    ///
    /// Paths starting with `/` or containing any `..` component are rejected
    /// with the `invalid path` sentinel before any I/O happens.
    pub(crate) fn resolve(&self, rel: &str) -> Result<PathBuf, ForestError> {
        if rel.starts_with('/') {
            return Err(ForestError::InvalidPath(rel.to_string()));
        }
        let rel_path = Path::new(rel);
        for component in rel_path.components() {
            match component {
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(ForestError::InvalidPath(rel.to_string()));
                }
                Component::Normal(_) | Component::CurDir => {}
            }
        }
        Ok(self.root.join(rel_path))
    }

    fn ensure_writable(&self) -> Result<(), ForestError> {
        if self.state == ComponentState::Stopped {
            return Err(ForestError::BedrockStopped);
        }
        if self.read_only {
            return Err(ForestError::ReadOnly);
        }
        Ok(())
    }

    fn ensure_readable(&self) -> Result<(), ForestError> {
        if self.state == ComponentState::Stopped {
            return Err(ForestError::BedrockStopped);
        }
        Ok(())
    }

    pub(crate) fn file_info(&self, rel: &str, with_hash: bool) -> Result<BedrockFileInfo> {
        let full = self.resolve(rel)?;
        let meta = std::fs::metadata(&full)
            .with_context(|| format!("failed to stat {}", full.display()))?;
        let modified: DateTime<Utc> = meta
            .modified()
            .with_context(|| format!("no modification time for {}", full.display()))?
            .into();
        let name = full
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        let content_hash = if with_hash && meta.is_file() && meta.len() <= HASH_SIZE_CAP {
            let data = std::fs::read(&full)
                .with_context(|| format!("failed to read {} for hashing", full.display()))?;
            Some(format!("sha256:{}", hex::encode(Sha256::digest(&data))))
        } else {
            None
        };

        Ok(BedrockFileInfo {
            path: rel.to_string(),
            name,
            size: meta.len(),
            modified_time: modified,
            is_dir: meta.is_dir(),
            mime_type: mime_type_for(&full, meta.is_dir()),
            content_hash,
        })
    }

    fn render_tree(&self, dir: &Path, depth: usize, max_depth: usize, out: &mut String) -> Result<()> {
        if max_depth > 0 && depth >= max_depth {
            return Ok(());
        }
        let mut entries: Vec<_> = std::fs::read_dir(dir)
            .with_context(|| format!("failed to list {}", dir.display()))?
            .collect::<std::io::Result<_>>()
            .with_context(|| format!("failed to read entries of {}", dir.display()))?;
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let full = entry.path();
            let rel = full.strip_prefix(&self.root).unwrap_or(&full);
            if is_ignored(rel) {
                continue;
            }
            let meta = entry
                .metadata()
                .with_context(|| format!("failed to stat {}", full.display()))?;
            let modified: DateTime<Utc> = meta
                .modified()
                .with_context(|| format!("no modification time for {}", full.display()))?
                .into();
            let name = entry.file_name().to_string_lossy().to_string();
            let indent = "  ".repeat(depth);
            if meta.is_dir() {
                out.push_str(&format!("{}{}/\n", indent, name));
                self.render_tree(&full, depth + 1, max_depth, out)?;
            } else {
                out.push_str(&format!(
                    "{}{} ({} bytes, {})\n",
                    indent,
                    name,
                    meta.len(),
                    modified.format("%Y-%m-%d %H:%M:%S")
                ));
            }
        }
        Ok(())
    }

    fn scan(&self) -> Result<(u64, u64)> {
        fn walk(root: &Path, dir: &Path, files: &mut u64, bytes: &mut u64) -> Result<()> {
            for entry in std::fs::read_dir(dir)
                .with_context(|| format!("failed to list {}", dir.display()))?
            {
                let entry = entry.context("failed to read dir entry")?;
                let full = entry.path();
                let rel = full.strip_prefix(root).unwrap_or(&full);
                if is_ignored(rel) {
                    continue;
                }
                let meta = entry.metadata().context("failed to stat entry")?;
                if meta.is_dir() {
                    walk(root, &full, files, bytes)?;
                } else {
                    *files += 1;
                    *bytes += meta.len();
                }
            }
            Ok(())
        }
        let mut files = 0;
        let mut bytes = 0;
        walk(&self.root, &self.root, &mut files, &mut bytes)?;
        Ok((files, bytes))
    }

    fn emit(&self, wind: &Wind, event_type: BedrockEventType) {
        let event = BedrockEvent {
            bedrock_name: self.name.clone(),
            event_type,
            path: None,
            timestamp: Utc::now(),
            file_info: None,
        };
        let data = match serde_json::to_vec(&event) {
            Ok(d) => d,
            Err(_) => return,
        };
        if let Err(e) = wind.drop_leaf(Leaf::new(
            event.subject(),
            data,
            format!("bedrock:{}", self.name),
        )) {
            warn!(bedrock = %self.name, "failed to emit {:?} event: {:#}", event_type, e);
        }
    }
}

impl Bedrock for UnixBedrock {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> BedrockKind {
        BedrockKind::Unix
    }

    fn read_only(&self) -> bool {
        self.read_only
    }

    fn manifest(&self) -> Result<BedrockManifest> {
        self.ensure_readable()?;
        let (file_count, total_size) = self.scan()?;
        Ok(BedrockManifest {
            name: self.name.clone(),
            kind: BedrockKind::Unix,
            root: self.root.display().to_string(),
            file_count,
            total_size,
            last_scan: Utc::now(),
            remote: None,
            branch: None,
        })
    }

    fn list(&self, rel: &str) -> Result<Vec<BedrockFileInfo>> {
        self.ensure_readable()?;
        let dir = self.resolve(rel)?;
        let mut entries: Vec<_> = std::fs::read_dir(&dir)
            .with_context(|| format!("failed to list {}", dir.display()))?
            .collect::<std::io::Result<_>>()
            .with_context(|| format!("failed to read entries of {}", dir.display()))?;
        entries.sort_by_key(|e| e.file_name());

        let mut infos = Vec::new();
        for entry in entries {
            let name = entry.file_name().to_string_lossy().to_string();
            let child_rel = if rel.is_empty() {
                name.clone()
            } else {
                format!("{}/{}", rel.trim_end_matches('/'), name)
            };
            if is_ignored(Path::new(&child_rel)) {
                continue;
            }
            infos.push(self.file_info(&child_rel, false)?);
        }
        Ok(infos)
    }

    fn read(&self, rel: &str) -> Result<Vec<u8>> {
        self.ensure_readable()?;
        let full = self.resolve(rel)?;
        std::fs::read(&full).with_context(|| format!("failed to read {}", full.display()))
    }

    fn stat(&self, rel: &str) -> Result<BedrockFileInfo> {
        self.ensure_readable()?;
        self.file_info(rel, true)
    }

    fn write(&self, rel: &str, data: &[u8], _message: Option<&str>) -> Result<()> {
        self.ensure_writable()?;
        let full = self.resolve(rel)?;
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        std::fs::write(&full, data)
            .with_context(|| format!("failed to write {}", full.display()))
    }

    fn delete(&self, rel: &str, _message: Option<&str>) -> Result<()> {
        self.ensure_writable()?;
        let full = self.resolve(rel)?;
        let meta = std::fs::metadata(&full)
            .with_context(|| format!("failed to stat {}", full.display()))?;
        if meta.is_dir() {
            std::fs::remove_dir_all(&full)
                .with_context(|| format!("failed to delete {}", full.display()))
        } else {
            std::fs::remove_file(&full)
                .with_context(|| format!("failed to delete {}", full.display()))
        }
    }

    fn rename(&self, from: &str, to: &str, _message: Option<&str>) -> Result<()> {
        self.ensure_writable()?;
        let from_full = self.resolve(from)?;
        let to_full = self.resolve(to)?;
        if let Some(parent) = to_full.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        std::fs::rename(&from_full, &to_full).with_context(|| {
            format!(
                "failed to move {} to {}",
                from_full.display(),
                to_full.display()
            )
        })
    }

    fn tree(&self, max_depth: usize) -> Result<String> {
        self.ensure_readable()?;
        let mut out = format!("{}/\n", self.name);
        self.render_tree(&self.root.clone(), 0, max_depth, &mut out)?;
        Ok(out)
    }

    fn start(&mut self, wind: &Wind, cancel: CancelToken) -> Result<()> {
        let watcher = WatcherHandle::spawn(
            self.name.clone(),
            self.root.clone(),
            wind.clone(),
            cancel,
        )?;
        self.watcher = Some(watcher);
        self.state = ComponentState::Running;
        self.emit(wind, BedrockEventType::Mounted);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.stop();
        }
        self.state = ComponentState::Stopped;
    }
}

fn mime_type_for(path: &Path, is_dir: bool) -> String {
    if is_dir {
        return "inode/directory".to_string();
    }
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "txt" | "lua" => "text/plain",
        "md" => "text/markdown",
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "csv" => "text/csv",
        "js" => "text/javascript",
        "json" => "application/json",
        "yaml" | "yml" => "application/yaml",
        "xml" => "application/xml",
        "pdf" => "application/pdf",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        _ => "application/octet-stream",
    }
    .to_string()
}
