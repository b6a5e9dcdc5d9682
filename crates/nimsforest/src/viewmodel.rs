//! Viewmodel publisher.
//!
//! Periodically snapshots the forest and publishes it on a dedicated wind
//! subject, plus incremental component add/remove events on a sibling
//! subject. External viewers subscribe to these instead of querying the
//! control API.
//!
//! Cadence is expressed in beats at a fixed hz: 90 beats at 90 Hz is one
//! snapshot per second. With `only_on_change` the snapshot subject stays
//! quiet while nothing changes; the events subject always reflects diffs.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use nimsforest_types::{
    ComponentSummary, Leaf, ViewmodelEvent, ViewmodelSnapshot, ViewmodelSummary,
};
use tracing::warn;

use crate::cancel::CancelToken;
use crate::config::ViewerConfig;
use crate::forest::Forest;
use crate::wind::Wind;

pub struct ViewmodelPublisher {
    config: ViewerConfig,
    forest: Arc<Forest>,
    wind: Wind,
    thread: Option<JoinHandle<()>>,
    cancel: Option<CancelToken>,
}

impl ViewmodelPublisher {
    pub fn new(config: ViewerConfig, forest: Arc<Forest>, wind: Wind) -> Self {
        Self {
            config,
            forest,
            wind,
            thread: None,
            cancel: None,
        }
    }

    pub fn start(&mut self, cancel: CancelToken) -> Result<()> {
        let config = self.config.clone();
        let forest = Arc::clone(&self.forest);
        let wind = self.wind.clone();
        let interval = beat_interval(config.beats, config.hz);
        let loop_cancel = cancel.clone();

        let thread = thread::spawn(move || {
            let mut last_snapshot_json: Option<String> = None;
            let mut last_names: BTreeMap<String, ComponentSummary> = BTreeMap::new();
            loop {
                if loop_cancel.wait_timeout(interval) {
                    return;
                }
                let snapshot = build_snapshot(&forest);
                let json = match serde_json::to_string(&snapshot) {
                    Ok(j) => j,
                    Err(e) => {
                        warn!("failed to serialize viewmodel snapshot: {}", e);
                        continue;
                    }
                };

                let changed = last_snapshot_json.as_deref() != Some(json.as_str());
                if changed || !config.only_on_change {
                    if let Err(e) = wind.drop_leaf(Leaf::new(
                        config.state_subject.clone(),
                        json.clone().into_bytes(),
                        "forest:viewmodel",
                    )) {
                        warn!("failed to publish viewmodel state: {:#}", e);
                    }
                }
                if changed {
                    let current: BTreeMap<String, ComponentSummary> = snapshot
                        .lands
                        .iter()
                        .map(|s| (event_key(s), s.clone()))
                        .collect();
                    publish_events(&wind, &config.events_subject, &last_names, &current);
                    last_names = current;
                    last_snapshot_json = Some(json);
                }
            }
        });

        self.thread = Some(thread);
        self.cancel = Some(cancel);
        Ok(())
    }

    pub fn stop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for ViewmodelPublisher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Beats over hz, as wall time. 90 beats at 90 Hz is one second.
pub fn beat_interval(beats: u32, hz: u32) -> Duration {
    let hz = hz.max(1);
    Duration::from_secs_f64(f64::from(beats.max(1)) / f64::from(hz))
}

fn event_key(summary: &ComponentSummary) -> String {
    format!("{}:{}", summary.kind, summary.name)
}

fn build_snapshot(forest: &Forest) -> ViewmodelSnapshot {
    let status = forest.status();
    let lands: Vec<ComponentSummary> = status.all_components().into_iter().cloned().collect();

    let mut by_kind = BTreeMap::new();
    for land in &lands {
        *by_kind.entry(land.kind.to_string()).or_insert(0) += 1;
    }

    ViewmodelSnapshot {
        summary: ViewmodelSummary {
            running: status.running,
            total: lands.len(),
            by_kind,
        },
        lands,
    }
}

fn publish_events(
    wind: &Wind,
    subject: &str,
    previous: &BTreeMap<String, ComponentSummary>,
    current: &BTreeMap<String, ComponentSummary>,
) {
    for (key, summary) in current {
        if !previous.contains_key(key) {
            emit_event(wind, subject, "component.added", summary);
        }
    }
    for (key, summary) in previous {
        if !current.contains_key(key) {
            emit_event(wind, subject, "component.removed", summary);
        }
    }
}

fn emit_event(wind: &Wind, subject: &str, event_type: &str, summary: &ComponentSummary) {
    let event = ViewmodelEvent {
        event_type: event_type.to_string(),
        name: summary.name.clone(),
        kind: summary.kind,
        timestamp: Utc::now(),
    };
    let data = match serde_json::to_vec(&event) {
        Ok(d) => d,
        Err(_) => return,
    };
    if let Err(e) = wind.drop_leaf(Leaf::new(subject.to_string(), data, "forest:viewmodel")) {
        warn!("failed to publish viewmodel event: {:#}", e);
    }
}
