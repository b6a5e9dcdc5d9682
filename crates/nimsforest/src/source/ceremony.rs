//! Ceremony source: periodic ticks onto river.
//!
//! Every interval the ceremony emits either its fixed payload or the output
//! of a short inline Lua script (called with `{tick = n}`). Creation fails
//! with "invalid interval" when the interval string does not parse.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde_json::{Value, json};
use tracing::warn;

use super::{Source, SourceKind};
use crate::cancel::CancelToken;
use crate::config::SourceConfig;
use crate::river::River;
use crate::script::ScriptEngine;

#[derive(Debug)]
pub struct CeremonySource {
    name: String,
    publishes: String,
    interval: Duration,
    payload: Option<Value>,
    engine: Option<Arc<ScriptEngine>>,
    river: River,
    thread: Option<JoinHandle<()>>,
    cancel: Option<CancelToken>,
}

impl CeremonySource {
    pub fn new(config: &SourceConfig, river: River) -> Result<Self> {
        let interval_text = config
            .interval
            .as_deref()
            .context("interval is required for ceremony")?;
        let interval = nimsforest_duration::parse_duration(interval_text)
            .map_err(|_| anyhow::anyhow!("invalid interval"))?;
        if interval.is_zero() {
            bail!("invalid interval");
        }

        let engine = match config.script.as_deref() {
            Some(source) if !source.trim().is_empty() => Some(Arc::new(
                ScriptEngine::from_source(&config.name, source)
                    .context("failed to load ceremony script")?,
            )),
            _ => None,
        };

        Ok(Self {
            name: config.name.clone(),
            publishes: config.publishes.clone(),
            interval,
            payload: config.payload.clone(),
            engine,
            river,
            thread: None,
            cancel: None,
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

impl Source for CeremonySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Ceremony
    }

    fn publishes(&self) -> &str {
        &self.publishes
    }

    fn start(&mut self, cancel: CancelToken) -> Result<()> {
        let name = self.name.clone();
        let publishes = self.publishes.clone();
        let interval = self.interval;
        let payload = self.payload.clone();
        let engine = self.engine.clone();
        let river = self.river.clone();
        let loop_cancel = cancel.clone();

        let thread = thread::spawn(move || {
            let mut tick: u64 = 0;
            loop {
                if loop_cancel.wait_timeout(interval) {
                    return;
                }
                tick += 1;
                let value = match &engine {
                    Some(engine) => match engine.process(&json!({"tick": tick, "name": name})) {
                        Ok(v) => v,
                        Err(e) => {
                            warn!(source = %name, tick, "ceremony script failed: {:#}", e);
                            continue;
                        }
                    },
                    None => payload.clone().unwrap_or_else(|| json!({"tick": tick})),
                };
                let data = match serde_json::to_vec(&value) {
                    Ok(d) => d,
                    Err(e) => {
                        warn!(source = %name, "unserializable ceremony payload: {}", e);
                        continue;
                    }
                };
                if let Err(e) = river.flow(&publishes, &data) {
                    warn!(source = %name, "failed to publish tick: {:#}", e);
                }
            }
        });

        self.thread = Some(thread);
        self.cancel = Some(cancel);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for CeremonySource {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tempfile::tempdir;

    use super::*;
    use crate::river::StreamStore;

    fn river(dir: &std::path::Path) -> River {
        River::new(StreamStore::open(dir.to_path_buf()).expect("open"))
    }

    fn ceremony_config(interval: &str) -> SourceConfig {
        SourceConfig {
            name: "heartbeat".to_string(),
            kind: "ceremony".to_string(),
            publishes: "raw.ticks".to_string(),
            interval: Some(interval.to_string()),
            ..Default::default()
        }
    }

    fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..600 {
            if cond() {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn invalid_interval_fails_creation() {
        let td = tempdir().expect("tempdir");
        let err = CeremonySource::new(&ceremony_config("invalid"), river(td.path())).unwrap_err();
        assert_eq!(err.to_string(), "invalid interval");
    }

    #[test]
    fn missing_interval_fails_creation() {
        let td = tempdir().expect("tempdir");
        let mut config = ceremony_config("1s");
        config.interval = None;
        assert!(CeremonySource::new(&config, river(td.path())).is_err());
    }

    #[test]
    fn duration_forms_parse() {
        let td = tempdir().expect("tempdir");
        for interval in ["30s", "5m", "1h"] {
            let source = CeremonySource::new(&ceremony_config(interval), river(td.path()))
                .expect("create");
            assert_eq!(
                source.interval(),
                nimsforest_duration::parse_duration(interval).unwrap()
            );
        }
    }

    #[test]
    fn fixed_payload_is_emitted_each_tick() {
        let td = tempdir().expect("tempdir");
        let river = river(td.path());
        let mut config = ceremony_config("30ms");
        config.payload = Some(json!({"kind": "standup"}));

        let mut source = CeremonySource::new(&config, river.clone()).expect("create");
        source.start(CancelToken::new()).expect("start");

        wait_for(|| river.replay("raw.ticks", 0, 10).unwrap().len() >= 2);
        source.stop();

        let messages = river.replay("raw.ticks", 0, 10).expect("replay");
        let payload: serde_json::Value = serde_json::from_slice(&messages[0].data).unwrap();
        assert_eq!(payload, json!({"kind": "standup"}));
    }

    #[test]
    fn inline_script_produces_payload() {
        let td = tempdir().expect("tempdir");
        let river = river(td.path());
        let mut config = ceremony_config("30ms");
        config.script = Some(
            "function process(input) return { tick = input.tick, doubled = input.tick * 2 } end"
                .to_string(),
        );

        let mut source = CeremonySource::new(&config, river.clone()).expect("create");
        source.start(CancelToken::new()).expect("start");

        wait_for(|| !river.replay("raw.ticks", 0, 1).unwrap().is_empty());
        source.stop();

        let messages = river.replay("raw.ticks", 0, 1).expect("replay");
        let payload: serde_json::Value = serde_json::from_slice(&messages[0].data).unwrap();
        assert_eq!(payload["tick"], json!(1));
        assert_eq!(payload["doubled"], json!(2));
    }

    #[test]
    fn default_payload_is_the_tick_counter() {
        let td = tempdir().expect("tempdir");
        let river = river(td.path());
        let mut source =
            CeremonySource::new(&ceremony_config("30ms"), river.clone()).expect("create");
        source.start(CancelToken::new()).expect("start");

        wait_for(|| !river.replay("raw.ticks", 0, 1).unwrap().is_empty());
        source.stop();

        let messages = river.replay("raw.ticks", 0, 1).expect("replay");
        let payload: serde_json::Value = serde_json::from_slice(&messages[0].data).unwrap();
        assert_eq!(payload, json!({"tick": 1}));
    }
}
