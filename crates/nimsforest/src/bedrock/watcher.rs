//! Filesystem watcher for bedrock roots.
//!
//! Uses the platform's native change notifications (recursively, so new
//! subdirectories are covered automatically) and republishes changes as wind
//! events keyed `bedrock.<name>.<type>`. Paths matching the ignore set are
//! dropped before they reach the wind.

use std::path::PathBuf;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use nimsforest_types::{BedrockEvent, BedrockEventType, Leaf};
use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, warn};

use super::is_ignored;
use crate::cancel::CancelToken;
use crate::wind::Wind;

const DRAIN_INTERVAL: Duration = Duration::from_millis(200);

pub(crate) struct WatcherHandle {
    cancel: CancelToken,
    thread: Option<JoinHandle<()>>,
}

impl WatcherHandle {
    pub(crate) fn spawn(
        name: String,
        root: PathBuf,
        wind: Wind,
        cancel: CancelToken,
    ) -> Result<Self> {
        let (tx, rx) = crossbeam_channel::unbounded::<notify::Result<Event>>();
        let mut watcher: RecommendedWatcher = notify::recommended_watcher(move |res| {
            let _ = tx.send(res);
        })
        .context("failed to create filesystem watcher")?;
        watcher
            .watch(&root, RecursiveMode::Recursive)
            .with_context(|| format!("failed to watch {}", root.display()))?;

        let loop_cancel = cancel.clone();
        let thread = thread::spawn(move || {
            // The watcher must live as long as the loop.
            let _watcher = watcher;
            loop {
                if loop_cancel.is_cancelled() {
                    return;
                }
                let event = match rx.recv_timeout(DRAIN_INTERVAL) {
                    Ok(Ok(event)) => event,
                    Ok(Err(e)) => {
                        warn!(bedrock = %name, "watch error: {}", e);
                        continue;
                    }
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
                    Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return,
                };
                let event_type = match classify(&event.kind) {
                    Some(t) => t,
                    None => continue,
                };
                for path in &event.paths {
                    let rel = match path.strip_prefix(&root) {
                        Ok(rel) => rel,
                        Err(_) => continue,
                    };
                    if rel.as_os_str().is_empty() || is_ignored(rel) {
                        continue;
                    }
                    publish(&wind, &name, event_type, rel.display().to_string());
                }
            }
        });

        Ok(Self {
            cancel,
            thread: Some(thread),
        })
    }

    pub(crate) fn stop(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for WatcherHandle {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn classify(kind: &EventKind) -> Option<BedrockEventType> {
    match kind {
        EventKind::Create(_) => Some(BedrockEventType::FileCreated),
        EventKind::Modify(ModifyKind::Name(_)) => Some(BedrockEventType::FileMoved),
        EventKind::Modify(_) => Some(BedrockEventType::FileModified),
        EventKind::Remove(_) => Some(BedrockEventType::FileDeleted),
        _ => None,
    }
}

fn publish(wind: &Wind, name: &str, event_type: BedrockEventType, rel: String) {
    let event = BedrockEvent {
        bedrock_name: name.to_string(),
        event_type,
        path: Some(rel),
        timestamp: Utc::now(),
        file_info: None,
    };
    let data = match serde_json::to_vec(&event) {
        Ok(d) => d,
        Err(e) => {
            warn!(bedrock = %name, "failed to serialize bedrock event: {}", e);
            return;
        }
    };
    match wind.drop_leaf(Leaf::new(
        event.subject(),
        data,
        format!("bedrock:{}", name),
    )) {
        Ok(()) => debug!(bedrock = %name, subject = %event.subject(), "emitted"),
        Err(e) => warn!(bedrock = %name, "failed to emit bedrock event: {:#}", e),
    }
}
