//! TreeHouse: wind-to-wind transformer.
//!
//! Same transformer protocol as a tree, but the input is a wind leaf and
//! there is no acknowledgement — wind is not durable. Data errors drop the
//! leaf; the subscription survives.

use std::sync::Arc;

use anyhow::Result;
use nimsforest_types::Leaf;
use tracing::warn;

use crate::cancel::CancelToken;
use crate::config::TreeHouseConfig;
use crate::script::ScriptEngine;
use crate::wind::{Subscription, Wind};

pub struct TreeHouse {
    name: String,
    subscribes: String,
    publishes: String,
    engine: Arc<ScriptEngine>,
    wind: Wind,
    subscription: Option<Subscription>,
}

impl TreeHouse {
    pub fn new(config: &TreeHouseConfig, wind: Wind) -> Result<Self> {
        let engine = ScriptEngine::from_file(&config.name, &config.script)?;
        Ok(Self {
            name: config.name.clone(),
            subscribes: config.subscribes.clone(),
            publishes: config.publishes.clone(),
            engine: Arc::new(engine),
            wind,
            subscription: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subscribes(&self) -> &str {
        &self.subscribes
    }

    pub fn publishes(&self) -> &str {
        &self.publishes
    }

    pub fn start(&mut self, _cancel: CancelToken) -> Result<()> {
        let name = self.name.clone();
        let publishes = self.publishes.clone();
        let engine = Arc::clone(&self.engine);
        let wind = self.wind.clone();

        let subscription = self.wind.catch(&self.subscribes, move |leaf| {
            let input: serde_json::Value = match leaf.json() {
                Ok(v) => v,
                Err(e) => {
                    warn!(treehouse = %name, subject = %leaf.subject, "dropping non-JSON leaf: {}", e);
                    return Ok(());
                }
            };
            let output = match engine.process(&input) {
                Ok(v) => v,
                Err(e) => {
                    warn!(treehouse = %name, subject = %leaf.subject, "dropping leaf, script failed: {:#}", e);
                    return Ok(());
                }
            };
            let data = match serde_json::to_vec(&output) {
                Ok(d) => d,
                Err(e) => {
                    warn!(treehouse = %name, "dropping leaf, unserializable output: {}", e);
                    return Ok(());
                }
            };
            if let Err(e) = wind.drop_leaf(Leaf::new(
                publishes.clone(),
                data,
                format!("treehouse:{}", name),
            )) {
                warn!(treehouse = %name, "publish failed, leaf lost: {:#}", e);
            }
            Ok(())
        })?;
        self.subscription = Some(subscription);
        Ok(())
    }

    pub fn stop(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
    }
}

impl std::fmt::Debug for TreeHouse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeHouse").field("name", &self.name).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use serde_json::json;
    use tempfile::tempdir;

    use super::*;
    use crate::wind::Bus;

    fn write_script(dir: &std::path::Path, body: &str) -> std::path::PathBuf {
        let path = dir.join("treehouse.lua");
        std::fs::write(&path, body).expect("write script");
        path
    }

    fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..400 {
            if cond() {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn transforms_wind_to_wind() {
        let td = tempdir().expect("tempdir");
        let wind = Wind::new(Bus::new());
        let script = write_script(
            td.path(),
            "function process(input) return { shouted = string.upper(input.word) } end",
        );

        let config = TreeHouseConfig {
            name: "shouter".to_string(),
            subscribes: "words.in".to_string(),
            publishes: "words.out".to_string(),
            script,
        };
        let mut treehouse = TreeHouse::new(&config, wind.clone()).expect("new");

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = wind
            .catch("words.out", move |leaf| {
                sink.lock().unwrap().push(leaf);
                Ok(())
            })
            .expect("catch");

        treehouse.start(CancelToken::new()).expect("start");
        wind.drop_leaf(Leaf::new(
            "words.in",
            serde_json::to_vec(&json!({"word": "hello"})).unwrap(),
            "test",
        ))
        .expect("drop");

        wait_for(|| !seen.lock().unwrap().is_empty());
        let leaves = seen.lock().unwrap();
        assert_eq!(leaves[0].source, "treehouse:shouter");
        assert_eq!(leaves[0].json().unwrap(), json!({"shouted": "HELLO"}));
        drop(leaves);
        treehouse.stop();
    }

    #[test]
    fn stop_detaches_the_subscription() {
        let td = tempdir().expect("tempdir");
        let wind = Wind::new(Bus::new());
        let script = write_script(
            td.path(),
            "function process(input) return input end",
        );

        let config = TreeHouseConfig {
            name: "echo".to_string(),
            subscribes: "echo.in".to_string(),
            publishes: "echo.out".to_string(),
            script,
        };
        let mut treehouse = TreeHouse::new(&config, wind.clone()).expect("new");

        let seen = Arc::new(Mutex::new(0u32));
        let sink = Arc::clone(&seen);
        let _sub = wind
            .catch("echo.out", move |_| {
                *sink.lock().unwrap() += 1;
                Ok(())
            })
            .expect("catch");

        treehouse.start(CancelToken::new()).expect("start");
        wind.drop_leaf(Leaf::new("echo.in", b"{}".to_vec(), "t")).unwrap();
        wait_for(|| *seen.lock().unwrap() == 1);

        treehouse.stop();
        wind.drop_leaf(Leaf::new("echo.in", b"{}".to_vec(), "t")).unwrap();
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(*seen.lock().unwrap(), 1);
    }

    #[test]
    fn script_failure_drops_leaf_but_keeps_subscription() {
        let td = tempdir().expect("tempdir");
        let wind = Wind::new(Bus::new());
        let script = write_script(
            td.path(),
            r#"
            function process(input)
                if input.bad then error("refuse") end
                return { ok = true }
            end
            "#,
        );

        let config = TreeHouseConfig {
            name: "picky".to_string(),
            subscribes: "picky.in".to_string(),
            publishes: "picky.out".to_string(),
            script,
        };
        let mut treehouse = TreeHouse::new(&config, wind.clone()).expect("new");

        let seen = Arc::new(Mutex::new(0u32));
        let sink = Arc::clone(&seen);
        let _sub = wind
            .catch("picky.out", move |_| {
                *sink.lock().unwrap() += 1;
                Ok(())
            })
            .expect("catch");

        treehouse.start(CancelToken::new()).expect("start");
        wind.drop_leaf(Leaf::new(
            "picky.in",
            serde_json::to_vec(&json!({"bad": true})).unwrap(),
            "t",
        ))
        .unwrap();
        wind.drop_leaf(Leaf::new(
            "picky.in",
            serde_json::to_vec(&json!({"bad": false})).unwrap(),
            "t",
        ))
        .unwrap();

        wait_for(|| *seen.lock().unwrap() == 1);
        treehouse.stop();
    }
}
