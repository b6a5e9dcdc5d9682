//! Blocking client for the control API.
//!
//! Mirrors every route the API serves; non-2xx responses surface the body's
//! `error` message.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use nimsforest_types::{ComponentSummary, ForestStatus};
use serde_json::Value;

use crate::config::{NimConfig, TreeHouseConfig};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ControlClient {
    base: String,
    http: reqwest::blocking::Client,
}

impl ControlClient {
    /// Create a client for `http://<addr>`.
    pub fn new(addr: &str) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;
        let base = if addr.starts_with("http://") || addr.starts_with("https://") {
            addr.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", addr)
        };
        Ok(Self { base, http })
    }

    pub fn health(&self) -> Result<()> {
        let value = self.get("/health")?;
        if value["status"] == "ok" {
            Ok(())
        } else {
            bail!("unexpected health response: {}", value)
        }
    }

    pub fn status(&self) -> Result<ForestStatus> {
        let value = self.get("/api/v1/status")?;
        serde_json::from_value(value).context("failed to parse forest status")
    }

    pub fn list_treehouses(&self) -> Result<Vec<ComponentSummary>> {
        let value = self.get("/api/v1/treehouses")?;
        serde_json::from_value(value["treehouses"].clone())
            .context("failed to parse treehouse list")
    }

    pub fn add_treehouse(&self, config: &TreeHouseConfig) -> Result<()> {
        let body = with_name(serde_json::to_value(config)?, &config.name);
        self.post("/api/v1/treehouses", Some(body)).map(|_| ())
    }

    pub fn remove_treehouse(&self, name: &str) -> Result<()> {
        self.delete(&format!("/api/v1/treehouses/{}", name))
    }

    pub fn list_nims(&self) -> Result<Vec<ComponentSummary>> {
        let value = self.get("/api/v1/nims")?;
        serde_json::from_value(value["nims"].clone()).context("failed to parse nim list")
    }

    pub fn add_nim(&self, config: &NimConfig) -> Result<()> {
        let body = with_name(serde_json::to_value(config)?, &config.name);
        self.post("/api/v1/nims", Some(body)).map(|_| ())
    }

    pub fn remove_nim(&self, name: &str) -> Result<()> {
        self.delete(&format!("/api/v1/nims/{}", name))
    }

    pub fn reload(&self) -> Result<()> {
        self.post("/-/reload", None).map(|_| ())
    }

    fn get(&self, path: &str) -> Result<Value> {
        let response = self
            .http
            .get(format!("{}{}", self.base, path))
            .send()
            .with_context(|| format!("GET {} failed", path))?;
        Self::expect_success(response)
    }

    fn post(&self, path: &str, body: Option<Value>) -> Result<Value> {
        let mut request = self.http.post(format!("{}{}", self.base, path));
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request
            .send()
            .with_context(|| format!("POST {} failed", path))?;
        Self::expect_success(response)
    }

    fn delete(&self, path: &str) -> Result<()> {
        let response = self
            .http
            .delete(format!("{}{}", self.base, path))
            .send()
            .with_context(|| format!("DELETE {} failed", path))?;
        Self::expect_success(response).map(|_| ())
    }

    fn expect_success(response: reqwest::blocking::Response) -> Result<Value> {
        let status = response.status();
        let text = response.text().unwrap_or_default();
        if !status.is_success() {
            let message = serde_json::from_str::<Value>(&text)
                .ok()
                .and_then(|v| v["error"].as_str().map(|s| s.to_string()))
                .unwrap_or_else(|| text.clone());
            bail!("server returned {}: {}", status.as_u16(), message);
        }
        if text.is_empty() {
            Ok(Value::Null)
        } else {
            serde_json::from_str(&text).context("response was not JSON")
        }
    }
}

/// Descriptor JSON plus the `name` field the API expects in bodies.
fn with_name(mut value: Value, name: &str) -> Value {
    if let Some(map) = value.as_object_mut() {
        map.insert("name".to_string(), Value::String(name.to_string()));
    }
    value
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;

    use tempfile::tempdir;

    use super::*;
    use crate::api::ControlApi;
    use crate::asker::EchoAsker;
    use crate::broker::{BrokerConfig, BrokerHost};
    use crate::config::Config;
    use crate::forest::Forest;
    use crate::source::SourceFactory;

    fn fixture(td: &std::path::Path) -> (BrokerHost, ControlApi, ControlClient) {
        let mut host = BrokerHost::new(BrokerConfig {
            node_name: "client-test".to_string(),
            cluster_name: "forest".to_string(),
            data_dir: td.join("data"),
            client_port: 0,
            cluster_port: -1,
            monitor_port: -1,
            peers: Vec::new(),
        })
        .expect("broker");
        host.start().expect("start broker");

        let forest = Arc::new(
            Forest::new(
                Config::default(),
                None,
                host.handles().expect("handles"),
                Arc::new(EchoAsker),
                SourceFactory::new(),
                "127.0.0.1:0".to_string(),
            )
            .expect("forest"),
        );
        forest.start().expect("start forest");

        let mut api = ControlApi::new(forest, "127.0.0.1:0".to_string());
        api.start().expect("start api");
        let client = ControlClient::new(&api.local_addr().expect("addr").to_string())
            .expect("client");
        (host, api, client)
    }

    fn script_in(dir: &std::path::Path) -> PathBuf {
        let path = dir.join("s.lua");
        std::fs::write(&path, "function process(input) return input end").expect("write");
        path
    }

    #[test]
    fn full_treehouse_lifecycle_over_http() {
        let td = tempdir().expect("tempdir");
        let (_host, _api, client) = fixture(td.path());

        client.health().expect("health");
        assert!(client.status().expect("status").running);
        assert!(client.list_treehouses().expect("list").is_empty());

        client
            .add_treehouse(&TreeHouseConfig {
                name: "router".to_string(),
                subscribes: "a.in".to_string(),
                publishes: "a.out".to_string(),
                script: script_in(td.path()),
            })
            .expect("add");

        let listed = client.list_treehouses().expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "router");

        client.remove_treehouse("router").expect("remove");
        assert!(client.list_treehouses().expect("list").is_empty());
    }

    #[test]
    fn errors_carry_server_messages() {
        let td = tempdir().expect("tempdir");
        let (_host, _api, client) = fixture(td.path());

        let err = client
            .add_treehouse(&TreeHouseConfig {
                name: "bad".to_string(),
                ..Default::default()
            })
            .unwrap_err();
        assert!(err.to_string().contains("subscribes is required"));

        let err = client.remove_nim("ghost").unwrap_err();
        assert!(err.to_string().contains("404"));
    }
}
