//! Decomposer: lands humus slots into soil.
//!
//! A decomposer is a named durable consumer over the journal. For each slot
//! it reads the current soil value, applies the operation, and writes back
//! with the observed revision. A compare-and-set conflict means another
//! writer got there first; the decomposer retries with backoff and, once the
//! attempt budget is spent, logs and moves on rather than wedging the
//! journal.

use anyhow::{Context, Result};
use nimsforest_retry::{RetryStrategyConfig, calculate_delay, should_retry};
use nimsforest_types::{ForestError, HumusSlot};
use serde_json::Value;
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::humus::Humus;
use crate::river::ConsumerHandle;
use crate::soil::Soil;

/// Configuration for one decomposer instance.
#[derive(Debug, Clone)]
pub struct DecomposerConfig {
    /// Durable consumer name; must be unique per instance so instances can
    /// scale horizontally without sharing offsets.
    pub consumer_name: String,
    pub retry: RetryStrategyConfig,
}

impl DecomposerConfig {
    pub fn named(consumer_name: impl Into<String>) -> Self {
        Self {
            consumer_name: consumer_name.into(),
            retry: RetryStrategyConfig::default(),
        }
    }
}

/// A background worker consuming humus into soil.
pub struct Decomposer {
    config: DecomposerConfig,
    humus: Humus,
    soil: Soil,
    handle: Option<ConsumerHandle>,
}

impl Decomposer {
    pub fn new(config: DecomposerConfig, humus: Humus, soil: Soil) -> Self {
        Self {
            config,
            humus,
            soil,
            handle: None,
        }
    }

    pub fn start(&mut self, cancel: CancelToken) -> Result<()> {
        let soil = self.soil.clone();
        let retry = self.config.retry.clone();
        let worker_cancel = cancel.clone();
        let handle = self.humus.consume(
            &self.config.consumer_name,
            move |slot| apply_slot(&soil, &slot, &retry, &worker_cancel),
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

/// Soil key a slot lands at.
pub fn slot_key(slot: &HumusSlot) -> String {
    format!("{}:{}", slot.emitter, slot.entity_id)
}

/// Apply one slot with CAS retries. Exhausting the budget logs and returns
/// Ok so the journal offset still advances.
fn apply_slot(
    soil: &Soil,
    slot: &HumusSlot,
    retry: &RetryStrategyConfig,
    cancel: &CancelToken,
) -> Result<()> {
    let key = slot_key(slot);
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match apply_once(soil, &key, slot) {
            Ok(()) => return Ok(()),
            Err(e) if is_conflict(&e) => {
                if !should_retry(retry, attempt) {
                    warn!(
                        key = %key,
                        sequence = slot.sequence,
                        "giving up on humus slot after {} attempts", attempt
                    );
                    return Ok(());
                }
                let delay = calculate_delay(retry, attempt);
                debug!(key = %key, "soil conflict, retrying after {:?}", delay);
                if cancel.wait_timeout(delay) {
                    // Shutting down; leave the slot unacked for redelivery.
                    return Err(e);
                }
            }
            Err(e) => return Err(e),
        }
    }
}

fn apply_once(soil: &Soil, key: &str, slot: &HumusSlot) -> Result<()> {
    let current = soil.dig(key)?;
    match slot.operation.as_str() {
        "delete" => match current {
            Some((_, rev)) => soil.delete(key, rev),
            None => Ok(()),
        },
        // Everything else is an upsert; unknown verbs behave like `update`.
        op => {
            if op != "update" {
                debug!(key = %key, operation = %op, "treating unknown operation as update");
            }
            let (merged, rev) = match current {
                Some((bytes, rev)) => (merge_payload(&bytes, &slot.payload), rev),
                None => (slot.payload.clone(), 0),
            };
            let data = serde_json::to_vec(&merged).context("failed to serialize merged entity")?;
            soil.bury(key, &data, rev)?;
            Ok(())
        }
    }
}

/// Shallow-merge the slot payload over the stored JSON object. Non-object
/// state on either side is replaced wholesale.
fn merge_payload(current: &[u8], update: &Value) -> Value {
    let existing: Value = match serde_json::from_slice(current) {
        Ok(v) => v,
        Err(_) => return update.clone(),
    };
    match (existing, update) {
        (Value::Object(mut base), Value::Object(over)) => {
            for (k, v) in over {
                base.insert(k.clone(), v.clone());
            }
            Value::Object(base)
        }
        (_, update) => update.clone(),
    }
}

fn is_conflict(e: &anyhow::Error) -> bool {
    matches!(
        e.downcast_ref::<ForestError>(),
        Some(ForestError::RevisionConflict { .. })
    )
}
