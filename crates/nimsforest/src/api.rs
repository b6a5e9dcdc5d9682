//! HTTP control plane.
//!
//! A small management surface over the forest: health, status, treehouse and
//! nim CRUD, and config reload. All payloads are JSON; every non-2xx body is
//! `{"error": "<message>"}`. Sentinel errors map to 4xx, anything else is a
//! 500.

use std::io::Read;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::Result;
use nimsforest_types::ForestError;
use serde_json::{Value, json};
use tiny_http::{Header, Method, Response, Server};
use tracing::{debug, info, warn};

use crate::config::{NimConfig, TreeHouseConfig};
use crate::forest::Forest;

/// Default bind address for the control API.
pub const DEFAULT_API_ADDR: &str = "127.0.0.1:8080";

/// Budget for draining the accept loop on shutdown.
pub const SHUTDOWN_BUDGET: Duration = Duration::from_secs(5);

/// Control API address: env override or the default.
pub fn api_addr_from_env() -> String {
    std::env::var("NIMSFOREST_API_ADDR").unwrap_or_else(|_| DEFAULT_API_ADDR.to_string())
}

/// The control API server.
pub struct ControlApi {
    forest: Arc<Forest>,
    addr: String,
    server: Option<Arc<Server>>,
    accept_thread: Option<JoinHandle<()>>,
    shutting_down: Arc<AtomicBool>,
}

impl ControlApi {
    pub fn new(forest: Arc<Forest>, addr: String) -> Self {
        Self {
            forest,
            addr,
            server: None,
            accept_thread: None,
            shutting_down: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn start(&mut self) -> Result<()> {
        if self.server.is_some() {
            return Ok(());
        }
        let server = Server::http(&self.addr)
            .map_err(|e| anyhow::anyhow!("failed to bind control API on {}: {}", self.addr, e))?;
        let server = Arc::new(server);

        let accept_server = Arc::clone(&server);
        let forest = Arc::clone(&self.forest);
        let shutting_down = Arc::clone(&self.shutting_down);
        shutting_down.store(false, Ordering::SeqCst);

        let handle = thread::spawn(move || {
            loop {
                match accept_server.recv() {
                    Ok(request) => handle_request(&forest, request),
                    Err(_) => {
                        if shutting_down.load(Ordering::SeqCst) {
                            return;
                        }
                        thread::sleep(Duration::from_millis(10));
                    }
                }
            }
        });

        info!(addr = %self.addr, "control API listening");
        self.server = Some(server);
        self.accept_thread = Some(handle);
        Ok(())
    }

    /// Graceful shutdown within [`SHUTDOWN_BUDGET`].
    pub fn stop(&mut self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        if let Some(server) = self.server.take() {
            server.unblock();
        }
        if let Some(handle) = self.accept_thread.take() {
            let deadline = Instant::now() + SHUTDOWN_BUDGET;
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                warn!("control API did not drain within {:?}", SHUTDOWN_BUDGET);
            }
        }
    }

    /// The bound address (useful when bound to port 0).
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.server.as_ref().and_then(|s| match s.server_addr() {
            tiny_http::ListenAddr::IP(addr) => Some(addr),
            _ => None,
        })
    }
}

impl Drop for ControlApi {
    fn drop(&mut self) {
        self.stop();
    }
}

fn handle_request(forest: &Arc<Forest>, mut request: tiny_http::Request) {
    let path = request.url().split('?').next().unwrap_or("/").to_string();
    let method = request.method().clone();

    let mut body = String::new();
    if let Err(e) = request.as_reader().read_to_string(&mut body) {
        respond(request, 400, json!({"error": format!("unreadable body: {}", e)}));
        return;
    }

    let (status, reply) = route(forest, &method, &path, &body);
    debug!(method = %method, path = %path, status, "control API request");
    respond(request, status, reply);
}

fn route(forest: &Arc<Forest>, method: &Method, path: &str, body: &str) -> (u16, Value) {
    match (method, path) {
        (Method::Get, "/health") => (200, json!({"status": "ok"})),
        (Method::Get, "/api/v1/status") => match serde_json::to_value(forest.status()) {
            Ok(status) => (200, status),
            Err(e) => (500, json!({"error": e.to_string()})),
        },
        (Method::Get, "/api/v1/treehouses") => {
            let status = forest.status();
            (200, json!({"treehouses": status.treehouses}))
        }
        (Method::Post, "/api/v1/treehouses") => add_treehouse(forest, body),
        (Method::Get, "/api/v1/nims") => {
            let status = forest.status();
            (200, json!({"nims": status.nims}))
        }
        (Method::Post, "/api/v1/nims") => add_nim(forest, body),
        (Method::Post, "/-/reload") => match forest.reload_from_disk() {
            Ok(()) => (200, json!({"status": "reloaded"})),
            Err(e) => (error_status(&e).max(400), json!({"error": flat_message(&e)})),
        },
        (Method::Delete, _) if path.starts_with("/api/v1/treehouses/") => {
            let name = &path["/api/v1/treehouses/".len()..];
            match forest.remove_treehouse(name) {
                Ok(()) => (204, Value::Null),
                Err(e) => (error_status(&e), json!({"error": flat_message(&e)})),
            }
        }
        (Method::Delete, _) if path.starts_with("/api/v1/nims/") => {
            let name = &path["/api/v1/nims/".len()..];
            match forest.remove_nim(name) {
                Ok(()) => (204, Value::Null),
                Err(e) => (error_status(&e), json!({"error": flat_message(&e)})),
            }
        }
        _ => (404, json!({"error": "not found"})),
    }
}

fn add_treehouse(forest: &Arc<Forest>, body: &str) -> (u16, Value) {
    #[derive(serde::Deserialize)]
    struct Body {
        name: String,
        #[serde(flatten)]
        rest: TreeHouseConfig,
    }
    let parsed: Body = match serde_json::from_str(body) {
        Ok(b) => b,
        Err(e) => return (400, json!({"error": format!("invalid body: {}", e)})),
    };
    if parsed.name.is_empty() {
        return (400, json!({"error": "name is required"}));
    }
    let mut config = parsed.rest;
    config.name = parsed.name;
    let name = config.name.clone();
    match forest.add_treehouse(config) {
        Ok(()) => (201, json!({"status": "created", "name": name})),
        Err(e) => (error_status(&e), json!({"error": flat_message(&e)})),
    }
}

fn add_nim(forest: &Arc<Forest>, body: &str) -> (u16, Value) {
    #[derive(serde::Deserialize)]
    struct Body {
        name: String,
        #[serde(flatten)]
        rest: NimConfig,
    }
    let parsed: Body = match serde_json::from_str(body) {
        Ok(b) => b,
        Err(e) => return (400, json!({"error": format!("invalid body: {}", e)})),
    };
    if parsed.name.is_empty() {
        return (400, json!({"error": "name is required"}));
    }
    let mut config = parsed.rest;
    config.name = parsed.name;
    let name = config.name.clone();
    match forest.add_nim(config) {
        Ok(()) => (201, json!({"status": "created", "name": name})),
        Err(e) => (error_status(&e), json!({"error": flat_message(&e)})),
    }
}

/// Map an error to its HTTP status. Sentinels carry their own 4xx; anything
/// else on these routes is a validation or build failure and maps to 400.
fn error_status(e: &anyhow::Error) -> u16 {
    match e.downcast_ref::<ForestError>() {
        Some(ForestError::NotFound(_)) => 404,
        Some(ForestError::AlreadyExists(_)) => 409,
        Some(ForestError::Locked { .. }) => 409,
        Some(ForestError::AwaitingPrApproval { .. }) => 409,
        Some(ForestError::ReadOnly) => 403,
        Some(ForestError::InvalidPath(_)) => 400,
        Some(ForestError::InvalidSubject(_)) => 400,
        Some(ForestError::RevisionConflict { .. }) => 409,
        Some(ForestError::BedrockStopped) => 409,
        Some(ForestError::Stopped) => 503,
        // Validation and build errors carry plain messages.
        None => 400,
    }
}

fn flat_message(e: &anyhow::Error) -> String {
    format!("{:#}", e)
}

fn respond(request: tiny_http::Request, status: u16, body: Value) {
    let text = if body.is_null() {
        String::new()
    } else {
        body.to_string()
    };
    let response = Response::from_string(text)
        .with_status_code(status)
        .with_header(Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]).unwrap());
    if let Err(e) = request.respond(response) {
        debug!("failed to send control API response: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use serde_json::json;
    use tempfile::{TempDir, tempdir};

    use super::*;
    use crate::asker::EchoAsker;
    use crate::broker::{BrokerConfig, BrokerHost};
    use crate::config::Config;
    use crate::source::SourceFactory;

    struct Fixture {
        _td: TempDir,
        _host: BrokerHost,
        api: ControlApi,
        base: String,
    }

    fn fixture() -> Fixture {
        let td = tempdir().expect("tempdir");
        let mut host = BrokerHost::new(BrokerConfig {
            node_name: "api-test".to_string(),
            cluster_name: "forest".to_string(),
            data_dir: td.path().join("data"),
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
        let base = format!("http://{}", api.local_addr().expect("addr"));
        Fixture {
            _td: td,
            _host: host,
            api,
            base,
        }
    }

    fn script_in(td: &std::path::Path) -> PathBuf {
        let path = td.join("s.lua");
        std::fs::write(&path, "function process(input) return input end").expect("write");
        path
    }

    #[test]
    fn health_returns_ok() {
        let fx = fixture();
        let resp = reqwest::blocking::get(format!("{}/health", fx.base)).expect("get");
        assert_eq!(resp.status().as_u16(), 200);
        let body: Value = resp.json().expect("json");
        assert_eq!(body, json!({"status": "ok"}));
    }

    #[test]
    fn status_lists_components() {
        let fx = fixture();
        let resp = reqwest::blocking::get(format!("{}/api/v1/status", fx.base)).expect("get");
        assert_eq!(resp.status().as_u16(), 200);
        let body: Value = resp.json().expect("json");
        assert_eq!(body["running"], json!(true));
        assert!(body["treehouses"].is_array());
    }

    #[test]
    fn post_treehouse_missing_field_is_400() {
        let fx = fixture();
        let client = reqwest::blocking::Client::new();
        let resp = client
            .post(format!("{}/api/v1/treehouses", fx.base))
            .body(r#"{"name": "test"}"#)
            .send()
            .expect("post");
        assert_eq!(resp.status().as_u16(), 400);
        let body: Value = resp.json().expect("json");
        assert_eq!(body["error"], json!("subscribes is required"));
    }

    #[test]
    fn post_treehouse_creates_then_conflicts() {
        let fx = fixture();
        let td = tempdir().expect("tempdir");
        let script = script_in(td.path());
        let client = reqwest::blocking::Client::new();
        let body = json!({
            "name": "router",
            "subscribes": "a.in",
            "publishes": "a.out",
            "script": script,
        })
        .to_string();

        let resp = client
            .post(format!("{}/api/v1/treehouses", fx.base))
            .body(body.clone())
            .send()
            .expect("post");
        assert_eq!(resp.status().as_u16(), 201);

        let resp = client
            .post(format!("{}/api/v1/treehouses", fx.base))
            .body(body)
            .send()
            .expect("post again");
        assert_eq!(resp.status().as_u16(), 409);
        let reply: Value = resp.json().expect("json");
        assert!(reply["error"].as_str().unwrap().contains("already exists"));
    }

    #[test]
    fn delete_treehouse_204_then_404() {
        let fx = fixture();
        let td = tempdir().expect("tempdir");
        let script = script_in(td.path());
        let client = reqwest::blocking::Client::new();
        client
            .post(format!("{}/api/v1/treehouses", fx.base))
            .body(
                json!({
                    "name": "gone",
                    "subscribes": "a.in",
                    "publishes": "a.out",
                    "script": script,
                })
                .to_string(),
            )
            .send()
            .expect("post");

        let resp = client
            .delete(format!("{}/api/v1/treehouses/gone", fx.base))
            .send()
            .expect("delete");
        assert_eq!(resp.status().as_u16(), 204);

        let resp = client
            .delete(format!("{}/api/v1/treehouses/gone", fx.base))
            .send()
            .expect("delete again");
        assert_eq!(resp.status().as_u16(), 404);
        let reply: Value = resp.json().expect("json");
        assert!(reply["error"].as_str().unwrap().contains("not found"));
    }

    #[test]
    fn nim_routes_mirror_treehouse_routes() {
        let fx = fixture();
        let td = tempdir().expect("tempdir");
        let prompt = td.path().join("p.txt");
        std::fs::write(&prompt, "summarize {{ .text }}").expect("write");
        let client = reqwest::blocking::Client::new();

        let resp = client
            .post(format!("{}/api/v1/nims", fx.base))
            .body(
                json!({
                    "name": "summarizer",
                    "subscribes": "text.in",
                    "publishes": "text.out",
                    "prompt": prompt,
                })
                .to_string(),
            )
            .send()
            .expect("post");
        assert_eq!(resp.status().as_u16(), 201);

        let resp = reqwest::blocking::get(format!("{}/api/v1/nims", fx.base)).expect("get");
        let body: Value = resp.json().expect("json");
        assert_eq!(body["nims"][0]["name"], json!("summarizer"));
    }

    #[test]
    fn unknown_route_is_404_with_error_body() {
        let fx = fixture();
        let resp = reqwest::blocking::get(format!("{}/api/v1/unknown", fx.base)).expect("get");
        assert_eq!(resp.status().as_u16(), 404);
        let body: Value = resp.json().expect("json");
        assert!(body["error"].is_string());
    }

    #[test]
    fn reload_without_config_path_is_client_error() {
        let fx = fixture();
        let client = reqwest::blocking::Client::new();
        let resp = client
            .post(format!("{}/-/reload", fx.base))
            .send()
            .expect("post");
        assert_eq!(resp.status().as_u16(), 400);
    }

    #[test]
    fn stop_completes_within_budget() {
        let mut fx = fixture();
        let started = Instant::now();
        fx.api.stop();
        assert!(started.elapsed() < SHUTDOWN_BUDGET);
    }
}
