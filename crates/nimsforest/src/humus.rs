//! Humus: append-only change journal.
//!
//! Nims record intended state changes here without blocking on Soil; a
//! decomposer lands them later. Slots ride the river layer on a dedicated
//! stream, so consumption inherits durable-offset semantics: each named
//! consumer sees every slot exactly once as long as its handler acks by
//! returning Ok.

use anyhow::{Context, Result};
use nimsforest_types::HumusSlot;
use serde_json::Value;

use crate::cancel::CancelToken;
use crate::river::{ConsumerHandle, River};

/// Stream name the journal rides on.
pub const HUMUS_STREAM: &str = "humus";

/// Handle to the change journal.
#[derive(Clone, Debug)]
pub struct Humus {
    river: River,
}

impl Humus {
    pub(crate) fn new(river: River) -> Self {
        Self { river }
    }

    /// Append a slot, returning its assigned sequence.
    pub fn append(
        &self,
        emitter: &str,
        entity_id: &str,
        operation: &str,
        payload: Value,
    ) -> Result<u64> {
        let slot = HumusSlot {
            emitter: emitter.to_string(),
            entity_id: entity_id.to_string(),
            operation: operation.to_string(),
            payload,
            sequence: 0,
        };
        let data = serde_json::to_vec(&slot).context("failed to serialize humus slot")?;
        self.river.flow(HUMUS_STREAM, &data)
    }

    /// Start a named consumer over the journal. The slot's `sequence` field
    /// is filled from the stream position before the handler sees it.
    pub fn consume(
        &self,
        consumer: &str,
        mut handler: impl FnMut(HumusSlot) -> Result<()> + Send + 'static,
        cancel: CancelToken,
    ) -> Result<ConsumerHandle> {
        self.river.consume(
            HUMUS_STREAM,
            consumer,
            move |msg| {
                let mut slot: HumusSlot = serde_json::from_slice(&msg.data)
                    .context("failed to parse humus slot")?;
                slot.sequence = msg.sequence;
                handler(slot)
            },
            cancel,
        )
    }
}
