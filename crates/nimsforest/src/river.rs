//! River: persistent, replayable log of raw payloads.
//!
//! Each subject maps to an append-only JSONL stream under the broker data
//! directory. Consumers are named and durable: their acknowledged sequence is
//! persisted, delivery is at-least-once, and the offset only advances after
//! the handler returns Ok. A handler error leaves the message unacked and it
//! is redelivered after a backoff delay.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use nimsforest_retry::{RetryStrategyConfig, calculate_delay};
use nimsforest_types::{ForestError, RiverMessage, subject};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::fsutil;

const CONSUMER_POLL_INTERVAL_MS: u64 = 50;
const CONSUMER_BATCH: usize = 64;

/// One record in a stream file. Payload bytes ride as base64.
#[derive(Debug, Serialize, Deserialize)]
struct StoredMessage {
    sequence: u64,
    subject: String,
    data: String,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct ConsumerOffset {
    acked: u64,
}

/// File-backed stream store shared by river and humus.
#[derive(Debug)]
pub(crate) struct StreamStore {
    root: PathBuf,
    streams: Mutex<BTreeMap<String, u64>>,
    running: Mutex<bool>,
}

impl StreamStore {
    pub(crate) fn open(root: PathBuf) -> Result<Arc<Self>> {
        std::fs::create_dir_all(root.join("consumers"))
            .with_context(|| format!("failed to create stream dir {}", root.display()))?;
        Ok(Arc::new(Self {
            root,
            streams: Mutex::new(BTreeMap::new()),
            running: Mutex::new(true),
        }))
    }

    pub(crate) fn shutdown(&self) {
        *self.running.lock().unwrap() = false;
    }

    fn is_running(&self) -> bool {
        *self.running.lock().unwrap()
    }

    fn stream_path(&self, stream: &str) -> PathBuf {
        self.root.join(format!("{}.jsonl", sanitize(stream)))
    }

    fn offset_path(&self, stream: &str, durable: &str) -> PathBuf {
        self.root
            .join("consumers")
            .join(format!("{}__{}.json", sanitize(stream), sanitize(durable)))
    }

    fn append(&self, stream: &str, data: &[u8]) -> Result<u64> {
        if !self.is_running() {
            return Err(ForestError::Stopped.into());
        }
        let mut streams = self.streams.lock().unwrap();
        let next = match streams.get(stream) {
            Some(seq) => seq + 1,
            None => self.scan_last_sequence(stream)? + 1,
        };

        let record = StoredMessage {
            sequence: next,
            subject: stream.to_string(),
            data: BASE64.encode(data),
            timestamp: Utc::now(),
        };

        let path = self.stream_path(stream);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open stream file {}", path.display()))?;
        let mut writer = std::io::BufWriter::new(file);
        let line = serde_json::to_string(&record).context("failed to serialize stream record")?;
        writeln!(writer, "{}", line).context("failed to append stream record")?;
        writer.flush().context("failed to flush stream file")?;

        streams.insert(stream.to_string(), next);
        Ok(next)
    }

    fn scan_last_sequence(&self, stream: &str) -> Result<u64> {
        let path = self.stream_path(stream);
        if !path.exists() {
            return Ok(0);
        }
        let file = File::open(&path)
            .with_context(|| format!("failed to open stream file {}", path.display()))?;
        let mut last = 0;
        for line in BufReader::new(file).lines() {
            let line = line.context("failed to read stream line")?;
            if line.trim().is_empty() {
                continue;
            }
            let record: StoredMessage = serde_json::from_str(&line)
                .with_context(|| format!("corrupt stream record in {}", path.display()))?;
            last = record.sequence;
        }
        Ok(last)
    }

    /// Read up to `limit` messages with sequence greater than `after`.
    fn read_after(&self, stream: &str, after: u64, limit: usize) -> Result<Vec<RiverMessage>> {
        let path = self.stream_path(stream);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&path)
            .with_context(|| format!("failed to open stream file {}", path.display()))?;
        let mut out = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.context("failed to read stream line")?;
            if line.trim().is_empty() {
                continue;
            }
            let record: StoredMessage = serde_json::from_str(&line)
                .with_context(|| format!("corrupt stream record in {}", path.display()))?;
            if record.sequence <= after {
                continue;
            }
            let data = BASE64
                .decode(&record.data)
                .context("corrupt base64 payload in stream record")?;
            out.push(RiverMessage {
                subject: record.subject,
                data,
                sequence: record.sequence,
                timestamp: record.timestamp,
            });
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    fn load_offset(&self, stream: &str, durable: &str) -> Result<u64> {
        let offset: Option<ConsumerOffset> = fsutil::load_json(&self.offset_path(stream, durable))?;
        Ok(offset.map(|o| o.acked).unwrap_or(0))
    }

    fn save_offset(&self, stream: &str, durable: &str, acked: u64) -> Result<()> {
        fsutil::atomic_write_json(&self.offset_path(stream, durable), &ConsumerOffset { acked })
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Handle to the persistent log layer.
#[derive(Clone, Debug)]
pub struct River {
    store: Arc<StreamStore>,
}

/// A running durable consumer. Stopping (or dropping) cancels the poll loop.
pub struct ConsumerHandle {
    durable: String,
    cancel: CancelToken,
    thread: Option<JoinHandle<()>>,
}

impl ConsumerHandle {
    pub fn stop(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ConsumerHandle {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl std::fmt::Debug for ConsumerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerHandle")
            .field("durable", &self.durable)
            .finish()
    }
}

impl River {
    pub(crate) fn new(store: Arc<StreamStore>) -> Self {
        Self { store }
    }

    /// Append raw bytes to a subject's stream, returning the sequence number.
    pub fn flow(&self, subj: &str, data: &[u8]) -> Result<u64> {
        subject::validate_subject(subj)?;
        self.store.append(subj, data)
    }

    /// Read messages after the given sequence without consuming them.
    /// Replay support for viewers and tests.
    pub fn replay(&self, subj: &str, after: u64, limit: usize) -> Result<Vec<RiverMessage>> {
        self.store.read_after(subj, after, limit)
    }

    /// Start a named durable consumer on a subject stream.
    ///
    /// The handler is invoked in sequence order; the durable offset advances
    /// only after the handler returns Ok. A handler error is logged and the
    /// message is redelivered after a backoff delay.
    pub fn consume(
        &self,
        subj: &str,
        durable: &str,
        mut handler: impl FnMut(RiverMessage) -> Result<()> + Send + 'static,
        cancel: CancelToken,
    ) -> Result<ConsumerHandle> {
        subject::validate_subject(subj)?;
        if durable.is_empty() {
            anyhow::bail!("durable consumer name must not be empty");
        }

        let store = Arc::clone(&self.store);
        let stream = subj.to_string();
        let durable_name = durable.to_string();
        let loop_cancel = cancel.clone();
        let retry = RetryStrategyConfig::default();

        let mut acked = store.load_offset(&stream, &durable_name)?;
        let thread = thread::spawn(move || {
            let mut failures: u32 = 0;
            loop {
                if loop_cancel.wait_timeout(std::time::Duration::from_millis(
                    CONSUMER_POLL_INTERVAL_MS,
                )) {
                    return;
                }
                let batch = match store.read_after(&stream, acked, CONSUMER_BATCH) {
                    Ok(batch) => batch,
                    Err(e) => {
                        warn!(stream = %stream, durable = %durable_name, "stream read failed: {:#}", e);
                        continue;
                    }
                };
                for msg in batch {
                    if loop_cancel.is_cancelled() {
                        return;
                    }
                    let seq = msg.sequence;
                    match handler(msg) {
                        Ok(()) => {
                            failures = 0;
                            acked = seq;
                            if let Err(e) = store.save_offset(&stream, &durable_name, acked) {
                                warn!(
                                    stream = %stream,
                                    durable = %durable_name,
                                    "failed to persist consumer offset: {:#}", e
                                );
                            }
                        }
                        Err(e) => {
                            failures += 1;
                            let delay = calculate_delay(&retry, failures);
                            debug!(
                                stream = %stream,
                                durable = %durable_name,
                                sequence = seq,
                                "handler failed, redelivering after {:?}: {:#}", delay, e
                            );
                            if loop_cancel.wait_timeout(delay) {
                                return;
                            }
                            // Re-read from the unacked position.
                            break;
                        }
                    }
                }
            }
        });

        Ok(ConsumerHandle {
            durable: durable.to_string(),
            cancel,
            thread: Some(thread),
        })
    }
}
