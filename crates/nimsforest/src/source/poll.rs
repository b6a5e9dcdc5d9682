//! Poll source: periodic HTTP fetches onto river.
//!
//! Each tick issues one GET or POST with a per-request timeout and appends
//! the response body to the configured river subject. Cursor pagination is
//! optional: a dot-path extracts the next cursor from the response JSON, the
//! cursor rides a query parameter on the next request, and it can persist in
//! soil so polling resumes where it left off after a restart.

use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde_json::Value;
use tracing::{debug, warn};

use super::{Source, SourceKind};
use crate::cancel::CancelToken;
use crate::config::{CursorConfig, SourceConfig};
use crate::river::River;
use crate::soil::Soil;

const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub struct PollSource {
    name: String,
    publishes: String,
    url: String,
    method: PollMethod,
    interval: Duration,
    timeout: Duration,
    cursor: Option<CursorConfig>,
    river: River,
    soil: Soil,
    thread: Option<JoinHandle<()>>,
    cancel: Option<CancelToken>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PollMethod {
    Get,
    Post,
}

impl PollSource {
    pub fn new(config: &SourceConfig, river: River, soil: Soil) -> Result<Self> {
        let url = match config.url.as_deref() {
            Some(u) if !u.is_empty() => u.to_string(),
            _ => bail!("url is required for http_poll"),
        };
        let method = match config.method.as_deref() {
            None => PollMethod::Get,
            Some(m) if m.eq_ignore_ascii_case("get") => PollMethod::Get,
            Some(m) if m.eq_ignore_ascii_case("post") => PollMethod::Post,
            Some(other) => bail!("method must be GET or POST, got {:?}", other),
        };
        let interval = match config.interval.as_deref() {
            None => DEFAULT_INTERVAL,
            Some(s) => nimsforest_duration::parse_duration(s)
                .map_err(|_| anyhow::anyhow!("invalid interval"))?,
        };
        let timeout = match config.timeout.as_deref() {
            None => DEFAULT_TIMEOUT,
            Some(s) => nimsforest_duration::parse_duration(s)
                .map_err(|_| anyhow::anyhow!("invalid timeout"))?,
        };

        Ok(Self {
            name: config.name.clone(),
            publishes: config.publishes.clone(),
            url,
            method,
            interval,
            timeout,
            cursor: config.cursor.clone(),
            river,
            soil,
            thread: None,
            cancel: None,
        })
    }
}

impl Source for PollSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Poll
    }

    fn publishes(&self) -> &str {
        &self.publishes
    }

    fn start(&mut self, cancel: CancelToken) -> Result<()> {
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()
            .context("failed to build HTTP client")?;

        let name = self.name.clone();
        let url = self.url.clone();
        let method = self.method;
        let interval = self.interval;
        let publishes = self.publishes.clone();
        let cursor_config = self.cursor.clone();
        let river = self.river.clone();
        let soil = self.soil.clone();
        let loop_cancel = cancel.clone();

        let mut cursor = load_cursor(&soil, cursor_config.as_ref());

        let thread = thread::spawn(move || {
            loop {
                if loop_cancel.wait_timeout(interval) {
                    return;
                }
                match poll_once(&client, &url, method, cursor_config.as_ref(), cursor.as_deref()) {
                    Ok(body) => {
                        if let Err(e) = river.flow(&publishes, &body) {
                            warn!(source = %name, "failed to publish poll response: {:#}", e);
                            continue;
                        }
                        if let Some(config) = &cursor_config {
                            if let Some(next) = extract_cursor(&body, &config.path) {
                                debug!(source = %name, cursor = %next, "advanced cursor");
                                persist_cursor(&soil, config, &next);
                                cursor = Some(next);
                            }
                        }
                    }
                    Err(e) => warn!(source = %name, "poll failed: {:#}", e),
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

impl Drop for PollSource {
    fn drop(&mut self) {
        self.stop();
    }
}

fn poll_once(
    client: &reqwest::blocking::Client,
    url: &str,
    method: PollMethod,
    cursor_config: Option<&CursorConfig>,
    cursor: Option<&str>,
) -> Result<Vec<u8>> {
    let mut request = match method {
        PollMethod::Get => client.get(url),
        PollMethod::Post => client.post(url),
    };
    if let (Some(config), Some(cursor)) = (cursor_config, cursor) {
        request = request.query(&[(config.param.as_str(), cursor)]);
    }
    let response = request.send().context("request failed")?;
    if !response.status().is_success() {
        bail!("unexpected status {}", response.status());
    }
    let body = response.bytes().context("failed to read response body")?;
    Ok(body.to_vec())
}

/// Pull the next cursor out of a JSON response by dot path.
fn extract_cursor(body: &[u8], path: &str) -> Option<String> {
    let value: Value = serde_json::from_slice(body).ok()?;
    let mut current = &value;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    match current {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn load_cursor(soil: &Soil, config: Option<&CursorConfig>) -> Option<String> {
    let key = config?.soil_key.as_deref()?;
    match soil.dig(key) {
        Ok(Some((data, _))) => String::from_utf8(data).ok(),
        _ => None,
    }
}

fn persist_cursor(soil: &Soil, config: &CursorConfig, cursor: &str) {
    let key = match config.soil_key.as_deref() {
        Some(k) => k,
        None => return,
    };
    // Read-modify-write; one retry covers a concurrent bump.
    for _ in 0..2 {
        let rev = match soil.dig(key) {
            Ok(Some((_, rev))) => rev,
            Ok(None) => 0,
            Err(e) => {
                warn!(key = %key, "failed to read cursor: {:#}", e);
                return;
            }
        };
        match soil.bury(key, cursor.as_bytes(), rev) {
            Ok(_) => return,
            Err(e) => debug!(key = %key, "cursor write raced, retrying: {:#}", e),
        }
    }
    warn!(key = %key, "failed to persist cursor");
}
