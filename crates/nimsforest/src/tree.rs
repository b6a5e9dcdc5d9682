//! Tree: river-to-wind parser.
//!
//! A tree is a named durable consumer on one river subject. Each raw payload
//! is parsed as JSON, run through the tree's Lua script, and published as a
//! leaf on the configured wind subject with source `tree:<name>`.
//!
//! Ack policy: the river offset advances only after the wind publish
//! succeeds. Data errors (malformed JSON, script failure) are logged and the
//! message is dropped with an ack — redelivering a payload that fails
//! deterministically would loop forever. Only transient publish errors leave
//! the message unacked for redelivery.

use std::sync::Arc;

use anyhow::Result;
use nimsforest_types::Leaf;
use tracing::warn;

use crate::cancel::CancelToken;
use crate::config::TreeConfig;
use crate::river::{ConsumerHandle, River};
use crate::script::ScriptEngine;
use crate::wind::Wind;

pub struct Tree {
    name: String,
    watches: String,
    publishes: String,
    engine: Arc<ScriptEngine>,
    wind: Wind,
    river: River,
    handle: Option<ConsumerHandle>,
}

impl Tree {
    /// Build a tree from its descriptor, loading the script eagerly so a
    /// broken script fails construction rather than the first message.
    pub fn new(config: &TreeConfig, wind: Wind, river: River) -> Result<Self> {
        let engine = ScriptEngine::from_file(&config.name, &config.script)?;
        Ok(Self {
            name: config.name.clone(),
            watches: config.watches.clone(),
            publishes: config.publishes.clone(),
            engine: Arc::new(engine),
            wind,
            river,
            handle: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn watches(&self) -> &str {
        &self.watches
    }

    pub fn publishes(&self) -> &str {
        &self.publishes
    }

    pub fn start(&mut self, cancel: CancelToken) -> Result<()> {
        let durable = format!("tree-{}", self.name);
        let name = self.name.clone();
        let publishes = self.publishes.clone();
        let engine = Arc::clone(&self.engine);
        let wind = self.wind.clone();

        let handle = self.river.consume(
            &self.watches,
            &durable,
            move |msg| {
                let input: serde_json::Value = match serde_json::from_slice(&msg.data) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(tree = %name, sequence = msg.sequence, "dropping non-JSON payload: {}", e);
                        return Ok(());
                    }
                };
                let output = match engine.process(&input) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(tree = %name, sequence = msg.sequence, "dropping payload, script failed: {:#}", e);
                        return Ok(());
                    }
                };
                let data = match serde_json::to_vec(&output) {
                    Ok(d) => d,
                    Err(e) => {
                        warn!(tree = %name, sequence = msg.sequence, "dropping payload, unserializable output: {}", e);
                        return Ok(());
                    }
                };
                // A publish failure is transient; leave the message unacked.
                wind.drop_leaf(Leaf::new(
                    publishes.clone(),
                    data,
                    format!("tree:{}", name),
                ))
            },
            cancel,
        )?;
        self.handle = Some(handle);
        Ok(())
    }

    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.stop();
        }
    }
}

impl std::fmt::Debug for Tree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tree").field("name", &self.name).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tempfile::tempdir;

    use super::*;
    use crate::river::StreamStore;
    use crate::wind::Bus;

    fn fabric(dir: &std::path::Path) -> (Wind, River) {
        (
            Wind::new(Bus::new()),
            River::new(StreamStore::open(dir.to_path_buf()).expect("open")),
        )
    }

    fn write_script(dir: &std::path::Path, body: &str) -> std::path::PathBuf {
        let path = dir.join("script.lua");
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

    fn collect(wind: &Wind, pattern: &str) -> (crate::wind::Subscription, std::sync::Arc<std::sync::Mutex<Vec<Leaf>>>) {
        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = std::sync::Arc::clone(&seen);
        let sub = wind
            .catch(pattern, move |leaf| {
                sink.lock().unwrap().push(leaf);
                Ok(())
            })
            .expect("catch");
        (sub, seen)
    }

    #[test]
    fn parses_and_publishes_with_source_tag() {
        let td = tempdir().expect("tempdir");
        let (wind, river) = fabric(td.path());
        let script = write_script(
            td.path(),
            "function process(input) return { doubled = input.n * 2 } end",
        );

        let config = TreeConfig {
            name: "doubler".to_string(),
            watches: "raw.numbers".to_string(),
            publishes: "numbers.doubled".to_string(),
            script,
        };
        let mut tree = Tree::new(&config, wind.clone(), river.clone()).expect("new");
        let (_sub, seen) = collect(&wind, "numbers.doubled");
        tree.start(CancelToken::new()).expect("start");

        river
            .flow("raw.numbers", serde_json::to_vec(&json!({"n": 4})).unwrap().as_slice())
            .expect("flow");

        wait_for(|| !seen.lock().unwrap().is_empty());
        let leaves = seen.lock().unwrap();
        assert_eq!(leaves[0].source, "tree:doubler");
        assert_eq!(leaves[0].json().unwrap(), json!({"doubled": 8}));
        drop(leaves);
        tree.stop();
    }

    #[test]
    fn bad_json_is_dropped_and_later_messages_flow() {
        let td = tempdir().expect("tempdir");
        let (wind, river) = fabric(td.path());
        let script = write_script(
            td.path(),
            "function process(input) return { ok = true } end",
        );

        let config = TreeConfig {
            name: "tolerant".to_string(),
            watches: "raw.mixed".to_string(),
            publishes: "mixed.out".to_string(),
            script,
        };
        let mut tree = Tree::new(&config, wind.clone(), river.clone()).expect("new");
        let (_sub, seen) = collect(&wind, "mixed.out");
        tree.start(CancelToken::new()).expect("start");

        river.flow("raw.mixed", b"not json at all").expect("flow");
        river
            .flow("raw.mixed", serde_json::to_vec(&json!({"n": 1})).unwrap().as_slice())
            .expect("flow");

        wait_for(|| seen.lock().unwrap().len() == 1);
        tree.stop();
    }

    #[test]
    fn missing_script_fails_construction() {
        let td = tempdir().expect("tempdir");
        let (wind, river) = fabric(td.path());
        let config = TreeConfig {
            name: "ghost".to_string(),
            watches: "raw.x".to_string(),
            publishes: "x.out".to_string(),
            script: td.path().join("absent.lua"),
        };
        assert!(Tree::new(&config, wind, river).is_err());
    }

    #[test]
    fn repeated_publish_gives_identical_output() {
        let td = tempdir().expect("tempdir");
        let (wind, river) = fabric(td.path());
        let script = write_script(
            td.path(),
            r#"
            function process(input)
                local score = 0
                if contains(input.title, "VP") then score = score + 40 end
                if input.company_size >= 100 and input.company_size <= 500 then score = score + 30 end
                if input.industry == "technology" then score = score + 15 end
                return { id = input.id, score = score }
            end
            "#,
        );

        let config = TreeConfig {
            name: "scorer".to_string(),
            watches: "raw.leads".to_string(),
            publishes: "leads.scored".to_string(),
            script,
        };
        let mut tree = Tree::new(&config, wind.clone(), river.clone()).expect("new");
        let (_sub, seen) = collect(&wind, "leads.scored");
        tree.start(CancelToken::new()).expect("start");

        let lead = json!({
            "id": "test-123",
            "email": "j@acme.com",
            "title": "VP Engineering",
            "company_size": 250,
            "industry": "technology"
        });
        for _ in 0..3 {
            river
                .flow("raw.leads", serde_json::to_vec(&lead).unwrap().as_slice())
                .expect("flow");
        }

        wait_for(|| seen.lock().unwrap().len() == 3);
        let leaves = seen.lock().unwrap();
        for leaf in leaves.iter() {
            assert_eq!(leaf.json().unwrap()["score"], json!(85));
        }
        drop(leaves);
        tree.stop();
    }
}
