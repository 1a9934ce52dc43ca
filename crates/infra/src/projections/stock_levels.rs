use std::collections::HashMap;
use std::sync::RwLock;

use serde_json::Value as JsonValue;
use thiserror::Error;

use procura_core::AggregateId;
use procura_events::EventEnvelope;
use procura_inventory::{InventoryEvent, InventoryItemId};
use procura_products::ProductId;

use crate::read_model::ReadStore;

/// Queryable stock read model: current availability per inventory item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockReadModel {
    pub item_id: InventoryItemId,
    pub product_id: Option<ProductId>,
    pub unit: String,
    pub available: i64,
}

#[derive(Debug, Error)]
pub enum StockProjectionError {
    #[error("failed to deserialize inventory event: {0}")]
    Deserialize(String),

    #[error("event item_id does not match envelope aggregate_id")]
    StreamMismatch,

    #[error("non-monotonic sequence number (last={last}, found={found})")]
    NonMonotonicSequence { last: u64, found: u64 },
}

/// Stock levels projection.
///
/// Consumes published envelopes (JSON payloads) and maintains a disposable
/// read model of available quantities.
#[derive(Debug)]
pub struct StockLevelsProjection<S>
where
    S: ReadStore<InventoryItemId, StockReadModel>,
{
    store: S,
    cursors: RwLock<HashMap<AggregateId, u64>>,
}

impl<S> StockLevelsProjection<S>
where
    S: ReadStore<InventoryItemId, StockReadModel>,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            cursors: RwLock::new(HashMap::new()),
        }
    }

    /// Query the read model for one item.
    pub fn get(&self, item_id: &InventoryItemId) -> Option<StockReadModel> {
        self.store.get(item_id)
    }

    /// List all tracked items.
    pub fn list(&self) -> Vec<StockReadModel> {
        self.store.list()
    }

    /// Apply a published envelope into the projection.
    ///
    /// - Enforces monotonic sequence per aggregate stream
    /// - Idempotent for at-least-once delivery (replays <= cursor are ignored)
    /// - Envelopes for other aggregate types are ignored
    pub fn apply_envelope(
        &self,
        envelope: &EventEnvelope<JsonValue>,
    ) -> Result<(), StockProjectionError> {
        if envelope.aggregate_type() != "inventory.item" {
            return Ok(());
        }

        let aggregate_id = envelope.aggregate_id();
        let seq = envelope.sequence_number();

        let mut cursors = match self.cursors.write() {
            Ok(c) => c,
            Err(_) => {
                tracing::warn!(
                    aggregate_id = %aggregate_id,
                    sequence = seq,
                    "stock projection cursor lock poisoned; dropping envelope"
                );
                return Ok(());
            }
        };
        let last = *cursors.get(&aggregate_id).unwrap_or(&0);

        if seq == 0 {
            return Err(StockProjectionError::NonMonotonicSequence { last, found: seq });
        }
        if seq <= last {
            // Duplicate or replay; safe to ignore.
            return Ok(());
        }
        if last != 0 && seq != last + 1 {
            return Err(StockProjectionError::NonMonotonicSequence { last, found: seq });
        }

        let event: InventoryEvent = serde_json::from_value(envelope.payload().clone())
            .map_err(|e| StockProjectionError::Deserialize(e.to_string()))?;

        let item_id = match &event {
            InventoryEvent::ItemRegistered(e) => e.item_id,
            InventoryEvent::StockReceived(e) => e.item_id,
            InventoryEvent::StockFulfilled(e) => e.item_id,
            InventoryEvent::StockReserved(e) => e.item_id,
            InventoryEvent::ReservationReleased(e) => e.item_id,
        };
        if item_id.0 != aggregate_id {
            return Err(StockProjectionError::StreamMismatch);
        }

        match event {
            InventoryEvent::ItemRegistered(e) => {
                self.store.upsert(
                    e.item_id,
                    StockReadModel {
                        item_id: e.item_id,
                        product_id: Some(e.product_id),
                        unit: e.batch.unit,
                        available: 0,
                    },
                );
            }
            InventoryEvent::StockReceived(e) => {
                let mut rm = self.store.get(&e.item_id).unwrap_or(StockReadModel {
                    item_id: e.item_id,
                    product_id: Some(e.product_id),
                    unit: String::new(),
                    available: 0,
                });
                rm.available += e.quantity;
                self.store.upsert(e.item_id, rm);
            }
            InventoryEvent::StockFulfilled(e) => {
                if let Some(mut rm) = self.store.get(&e.item_id) {
                    rm.available -= e.quantity;
                    self.store.upsert(e.item_id, rm);
                }
            }
            // Reservations never change availability.
            InventoryEvent::StockReserved(_) | InventoryEvent::ReservationReleased(_) => {}
        }

        // Advance cursor after successful apply.
        cursors.insert(aggregate_id, seq);
        Ok(())
    }
}
