//! Webhook sources and the shared webhook HTTP server.
//!
//! One server binds one address and multiplexes every webhook source by
//! path. Requests must be POSTs; a registered-but-stopped route answers 503;
//! an optional HMAC-SHA256 signature (`X-Signature-256: sha256=<hex>`) is
//! verified before anything touches the river.

use std::collections::BTreeMap;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use hmac::{Hmac, Mac};
use nimsforest_types::ForestError;
use serde_json::json;
use sha2::Sha256;
use tiny_http::{Header, Method, Response, Server};
use tracing::{debug, info, warn};

use super::{Source, SourceKind};
use crate::cancel::CancelToken;
use crate::config::SourceConfig;
use crate::river::River;

/// Default bind address for the shared webhook server.
pub const DEFAULT_WEBHOOK_ADDR: &str = "127.0.0.1:8081";

/// Signature header checked when a route has a secret.
pub const SIGNATURE_HEADER: &str = "X-Signature-256";

type HmacSha256 = Hmac<Sha256>;

/// Webhook server address: env override or the default.
pub fn webhook_addr_from_env() -> String {
    std::env::var("NIMSFOREST_WEBHOOK_ADDR").unwrap_or_else(|_| DEFAULT_WEBHOOK_ADDR.to_string())
}

#[derive(Debug)]
struct Route {
    subject: String,
    secret: Option<String>,
    source_name: String,
    active: bool,
    river: River,
}

struct ServerInner {
    addr: String,
    routes: Mutex<BTreeMap<String, Route>>,
    server: Mutex<Option<Arc<Server>>>,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
    shutting_down: AtomicBool,
}

impl std::fmt::Debug for ServerInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerInner")
            .field("addr", &self.addr)
            .field("routes", &self.routes)
            .field("server", &self.server.lock().ok().map(|s| s.is_some()))
            .field("accept_thread", &self.accept_thread)
            .field("shutting_down", &self.shutting_down)
            .finish()
    }
}

/// The shared, path-multiplexed webhook HTTP server.
#[derive(Clone, Debug)]
pub struct WebhookServer {
    inner: Arc<ServerInner>,
}

impl WebhookServer {
    pub fn new(addr: String) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                addr,
                routes: Mutex::new(BTreeMap::new()),
                server: Mutex::new(None),
                accept_thread: Mutex::new(None),
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    /// Bind and start serving. Idempotent; the first webhook source to start
    /// brings the server up.
    pub fn ensure_started(&self) -> Result<()> {
        let mut server_slot = self.inner.server.lock().unwrap();
        if server_slot.is_some() {
            return Ok(());
        }
        let server = Server::http(&self.inner.addr)
            .map_err(|e| anyhow::anyhow!("failed to bind webhook server on {}: {}", self.inner.addr, e))?;
        let server = Arc::new(server);
        let accept_server = Arc::clone(&server);
        let inner = Arc::clone(&self.inner);
        self.inner.shutting_down.store(false, Ordering::SeqCst);

        let handle = thread::spawn(move || {
            loop {
                match accept_server.recv() {
                    Ok(request) => handle_request(&inner, request),
                    Err(_) => {
                        if inner.shutting_down.load(Ordering::SeqCst) {
                            return;
                        }
                        thread::sleep(std::time::Duration::from_millis(10));
                    }
                }
            }
        });

        info!(addr = %self.inner.addr, "webhook server listening");
        *server_slot = Some(server);
        *self.inner.accept_thread.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Stop serving and join the accept loop.
    pub fn stop(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        if let Some(server) = self.inner.server.lock().unwrap().take() {
            server.unblock();
        }
        if let Some(handle) = self.inner.accept_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    /// The local address once started (useful when bound to port 0).
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.inner
            .server
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|s| match s.server_addr() {
                tiny_http::ListenAddr::IP(addr) => Some(addr),
                _ => None,
            })
    }

    fn register(&self, path: &str, route: Route) -> Result<()> {
        let mut routes = self.inner.routes.lock().unwrap();
        if routes.contains_key(path) {
            return Err(ForestError::AlreadyExists(format!("webhook path {}", path)).into());
        }
        routes.insert(path.to_string(), route);
        Ok(())
    }

    fn set_active(&self, path: &str, active: bool) {
        if let Some(route) = self.inner.routes.lock().unwrap().get_mut(path) {
            route.active = active;
        }
    }

    fn deregister(&self, path: &str) {
        self.inner.routes.lock().unwrap().remove(path);
    }
}

fn handle_request(inner: &Arc<ServerInner>, mut request: tiny_http::Request) {
    let path = request.url().split('?').next().unwrap_or("/").to_string();
    let method = request.method().clone();

    let mut body = Vec::new();
    if let Err(e) = request.as_reader().read_to_end(&mut body) {
        warn!(path = %path, "failed to read webhook body: {}", e);
        respond(request, 500, json!({"error": "failed to read body"}));
        return;
    }

    let headers: BTreeMap<String, String> = request
        .headers()
        .iter()
        .map(|h| (h.field.as_str().to_string(), h.value.to_string()))
        .collect();

    let (status, reply) = {
        let routes = inner.routes.lock().unwrap();
        match routes.get(&path) {
            None => (404, json!({"error": "not found"})),
            Some(route) => {
                if method != Method::Post {
                    (405, json!({"error": "method not allowed"}))
                } else if !route.active {
                    (503, json!({"error": "source not running"}))
                } else if let Err(e) = verify_signature(route.secret.as_deref(), &headers, &body) {
                    debug!(path = %path, "signature rejected: {}", e);
                    (401, json!({"error": "invalid signature"}))
                } else {
                    let payload = json!({
                        "headers": headers,
                        "body": String::from_utf8_lossy(&body),
                        "timestamp": Utc::now().to_rfc3339(),
                        "source": format!("source:{}", route.source_name),
                    });
                    match serde_json::to_vec(&payload)
                        .map_err(anyhow::Error::from)
                        .and_then(|data| route.river.flow(&route.subject, &data))
                    {
                        Ok(_) => (200, json!({"status": "ok"})),
                        Err(e) => {
                            warn!(path = %path, "failed to publish webhook payload: {:#}", e);
                            (500, json!({"error": "failed to persist payload"}))
                        }
                    }
                }
            }
        }
    };
    respond(request, status, reply);
}

fn verify_signature(
    secret: Option<&str>,
    headers: &BTreeMap<String, String>,
    body: &[u8],
) -> Result<()> {
    let secret = match secret {
        None => return Ok(()),
        Some(s) => s,
    };
    let provided = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(SIGNATURE_HEADER))
        .map(|(_, v)| v.as_str())
        .context("missing signature header")?;
    let hex_part = provided
        .strip_prefix("sha256=")
        .context("signature must be sha256=<hex>")?;
    let expected = hex::decode(hex_part).context("signature is not valid hex")?;

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).context("failed to build HMAC")?;
    mac.update(body);
    mac.verify_slice(&expected).context("signature mismatch")?;
    Ok(())
}

fn respond(request: tiny_http::Request, status: u16, body: serde_json::Value) {
    let response = Response::from_string(body.to_string())
        .with_status_code(status)
        .with_header(Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]).unwrap());
    if let Err(e) = request.respond(response) {
        debug!("failed to send webhook response: {}", e);
    }
}

/// One webhook route, managed as a source.
#[derive(Debug)]
pub struct WebhookSource {
    name: String,
    path: String,
    publishes: String,
    server: WebhookServer,
}

impl WebhookSource {
    pub fn new(config: &SourceConfig, river: River, server: WebhookServer) -> Result<Self> {
        let path = match config.path.as_deref() {
            Some(p) if !p.is_empty() => p.to_string(),
            _ => bail!("path is required for http_webhook"),
        };
        server.register(
            &path,
            Route {
                subject: config.publishes.clone(),
                secret: config.secret.clone(),
                source_name: config.name.clone(),
                active: false,
                river,
            },
        )?;
        Ok(Self {
            name: config.name.clone(),
            path,
            publishes: config.publishes.clone(),
            server,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Source for WebhookSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Webhook
    }

    fn publishes(&self) -> &str {
        &self.publishes
    }

    fn start(&mut self, _cancel: CancelToken) -> Result<()> {
        self.server.ensure_started()?;
        self.server.set_active(&self.path, true);
        Ok(())
    }

    fn stop(&mut self) {
        self.server.set_active(&self.path, false);
    }
}

impl Drop for WebhookSource {
    fn drop(&mut self) {
        self.server.deregister(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::tempdir;

    use super::*;
    use crate::river::StreamStore;

    fn fixture(dir: &std::path::Path) -> (River, WebhookServer) {
        let river = River::new(StreamStore::open(dir.to_path_buf()).expect("open"));
        let server = WebhookServer::new("127.0.0.1:0".to_string());
        (river, server)
    }

    fn source_config(name: &str, path: &str, secret: Option<&str>) -> SourceConfig {
        SourceConfig {
            name: name.to_string(),
            kind: "http_webhook".to_string(),
            publishes: "raw.webhook".to_string(),
            path: Some(path.to_string()),
            secret: secret.map(|s| s.to_string()),
            ..Default::default()
        }
    }

    fn post(addr: std::net::SocketAddr, path: &str, body: &str, headers: &[(&str, &str)]) -> (u16, String) {
        let client = reqwest::blocking::Client::new();
        let mut req = client
            .post(format!("http://{}{}", addr, path))
            .body(body.to_string());
        for (k, v) in headers {
            req = req.header(*k, *v);
        }
        let resp = req.send().expect("request");
        let status = resp.status().as_u16();
        (status, resp.text().unwrap_or_default())
    }

    fn sign(secret: &str, body: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body.as_bytes());
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn post_lands_payload_in_river() {
        let td = tempdir().expect("tempdir");
        let (river, server) = fixture(td.path());
        let mut source =
            WebhookSource::new(&source_config("hook", "/hook", None), river.clone(), server.clone())
                .expect("new");
        source.start(CancelToken::new()).expect("start");
        let addr = server.local_addr().expect("addr");

        let (status, _) = post(addr, "/hook", r#"{"event": "ping"}"#, &[]);
        assert_eq!(status, 200);

        let messages = river.replay("raw.webhook", 0, 10).expect("replay");
        assert_eq!(messages.len(), 1);
        let payload: serde_json::Value = serde_json::from_slice(&messages[0].data).unwrap();
        assert_eq!(payload["body"], r#"{"event": "ping"}"#);
        assert_eq!(payload["source"], "source:hook");
        assert!(payload["headers"].is_object());
        assert!(payload["timestamp"].is_string());

        source.stop();
        server.stop();
    }

    #[test]
    fn non_post_gets_405() {
        let td = tempdir().expect("tempdir");
        let (river, server) = fixture(td.path());
        let mut source =
            WebhookSource::new(&source_config("hook", "/hook", None), river, server.clone())
                .expect("new");
        source.start(CancelToken::new()).expect("start");
        let addr = server.local_addr().expect("addr");

        let resp = reqwest::blocking::get(format!("http://{}/hook", addr)).expect("get");
        assert_eq!(resp.status().as_u16(), 405);
        let body: serde_json::Value = resp.json().expect("json body");
        assert!(body["error"].is_string());

        server.stop();
    }

    #[test]
    fn unknown_path_gets_404() {
        let td = tempdir().expect("tempdir");
        let (river, server) = fixture(td.path());
        let mut source =
            WebhookSource::new(&source_config("hook", "/hook", None), river, server.clone())
                .expect("new");
        source.start(CancelToken::new()).expect("start");
        let addr = server.local_addr().expect("addr");

        let (status, _) = post(addr, "/other", "{}", &[]);
        assert_eq!(status, 404);
        server.stop();
    }

    #[test]
    fn stopped_route_gets_503() {
        let td = tempdir().expect("tempdir");
        let (river, server) = fixture(td.path());
        let mut source =
            WebhookSource::new(&source_config("hook", "/hook", None), river, server.clone())
                .expect("new");
        source.start(CancelToken::new()).expect("start");
        source.stop();
        let addr = server.local_addr().expect("addr");

        let (status, body) = post(addr, "/hook", "{}", &[]);
        assert_eq!(status, 503);
        assert!(body.contains("error"));
        server.stop();
    }

    #[test]
    fn valid_signature_is_accepted_invalid_rejected() {
        let td = tempdir().expect("tempdir");
        let (river, server) = fixture(td.path());
        let mut source = WebhookSource::new(
            &source_config("hook", "/hook", Some("s3cret")),
            river.clone(),
            server.clone(),
        )
        .expect("new");
        source.start(CancelToken::new()).expect("start");
        let addr = server.local_addr().expect("addr");

        let body = r#"{"n": 1}"#;
        let (status, _) = post(
            addr,
            "/hook",
            body,
            &[(SIGNATURE_HEADER, sign("s3cret", body).as_str())],
        );
        assert_eq!(status, 200);

        let (status, _) = post(
            addr,
            "/hook",
            body,
            &[(SIGNATURE_HEADER, sign("wrong", body).as_str())],
        );
        assert_eq!(status, 401);

        let (status, _) = post(addr, "/hook", body, &[]);
        assert_eq!(status, 401);

        assert_eq!(river.replay("raw.webhook", 0, 10).expect("replay").len(), 1);
        server.stop();
    }

    #[test]
    fn duplicate_path_registration_fails() {
        let td = tempdir().expect("tempdir");
        let (river, server) = fixture(td.path());
        let _first =
            WebhookSource::new(&source_config("a", "/hook", None), river.clone(), server.clone())
                .expect("new");
        let err = WebhookSource::new(&source_config("b", "/hook", None), river, server.clone())
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ForestError>(),
            Some(ForestError::AlreadyExists(_))
        ));
    }

    #[test]
    fn dropping_source_frees_the_path() {
        let td = tempdir().expect("tempdir");
        let (river, server) = fixture(td.path());
        {
            let _source =
                WebhookSource::new(&source_config("a", "/hook", None), river.clone(), server.clone())
                    .expect("new");
        }
        // Path is free again after drop.
        let _second =
            WebhookSource::new(&source_config("b", "/hook", None), river, server).expect("new");
    }

    #[test]
    fn stop_unblocks_quickly() {
        let td = tempdir().expect("tempdir");
        let (river, server) = fixture(td.path());
        let mut source =
            WebhookSource::new(&source_config("hook", "/hook", None), river, server.clone())
                .expect("new");
        source.start(CancelToken::new()).expect("start");

        let started = std::time::Instant::now();
        server.stop();
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
