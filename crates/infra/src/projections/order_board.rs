use std::collections::HashMap;
use std::sync::RwLock;

use serde_json::Value as JsonValue;
use thiserror::Error;

use procura_core::AggregateId;
use procura_events::EventEnvelope;
use procura_products::ProductId;
use procura_purchasing::{PurchaseOrderEvent, PurchaseOrderId, PurchaseOrderStatus};

use crate::read_model::ReadStore;

/// One line as shown on the order board.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderLineView {
    pub line_no: u32,
    pub product_id: ProductId,
    pub ordered: i64,
    pub received: i64,
}

/// Queryable purchase-order read model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderReadModel {
    pub order_id: PurchaseOrderId,
    pub status: PurchaseOrderStatus,
    pub lines: Vec<OrderLineView>,
}

#[derive(Debug, Error)]
pub enum OrderProjectionError {
    #[error("failed to deserialize purchase order event: {0}")]
    Deserialize(String),

    #[error("non-monotonic sequence number (last={last}, found={found})")]
    NonMonotonicSequence { last: u64, found: u64 },
}

/// Order board projection: status and line progress per purchase order.
#[derive(Debug)]
pub struct OrderBoardProjection<S>
where
    S: ReadStore<PurchaseOrderId, OrderReadModel>,
{
    store: S,
    cursors: RwLock<HashMap<AggregateId, u64>>,
}

impl<S> OrderBoardProjection<S>
where
    S: ReadStore<PurchaseOrderId, OrderReadModel>,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            cursors: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, order_id: &PurchaseOrderId) -> Option<OrderReadModel> {
        self.store.get(order_id)
    }

    pub fn list(&self) -> Vec<OrderReadModel> {
        self.store.list()
    }

    /// Apply a published envelope into the projection (idempotent replays).
    pub fn apply_envelope(
        &self,
        envelope: &EventEnvelope<JsonValue>,
    ) -> Result<(), OrderProjectionError> {
        if envelope.aggregate_type() != "purchasing.order" {
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
                    "order board cursor lock poisoned; dropping envelope"
                );
                return Ok(());
            }
        };
        let last = *cursors.get(&aggregate_id).unwrap_or(&0);

        if seq == 0 {
            return Err(OrderProjectionError::NonMonotonicSequence { last, found: seq });
        }
        if seq <= last {
            return Ok(());
        }
        if last != 0 && seq != last + 1 {
            return Err(OrderProjectionError::NonMonotonicSequence { last, found: seq });
        }

        let event: PurchaseOrderEvent = serde_json::from_value(envelope.payload().clone())
            .map_err(|e| OrderProjectionError::Deserialize(e.to_string()))?;

        match event {
            PurchaseOrderEvent::OrderDrafted(e) => {
                self.store.upsert(
                    e.order_id,
                    OrderReadModel {
                        order_id: e.order_id,
                        status: PurchaseOrderStatus::Draft,
                        lines: vec![],
                    },
                );
            }
            PurchaseOrderEvent::OrderOpened(e) => {
                self.store.upsert(
                    e.order_id,
                    OrderReadModel {
                        order_id: e.order_id,
                        status: PurchaseOrderStatus::Pending,
                        lines: e
                            .lines
                            .iter()
                            .map(|l| OrderLineView {
                                line_no: l.line_no,
                                product_id: l.product_id,
                                ordered: l.ordered,
                                received: l.received,
                            })
                            .collect(),
                    },
                );
            }
            PurchaseOrderEvent::PurchaseOrderLineAdded(e) => {
                if let Some(mut rm) = self.store.get(&e.order_id) {
                    rm.lines.push(OrderLineView {
                        line_no: e.line_no,
                        product_id: e.product_id,
                        ordered: e.quantity,
                        received: 0,
                    });
                    self.store.upsert(e.order_id, rm);
                }
            }
            PurchaseOrderEvent::OrderSubmitted(e) => {
                if let Some(mut rm) = self.store.get(&e.order_id) {
                    rm.status = PurchaseOrderStatus::Pending;
                    self.store.upsert(e.order_id, rm);
                }
            }
            PurchaseOrderEvent::ReceiptRecorded(e) => {
                if let Some(mut rm) = self.store.get(&e.order_id) {
                    if let Some(line) = rm.lines.iter_mut().find(|l| l.line_no == e.line_no) {
                        line.received += e.quantity;
                    }
                    let full = rm
                        .lines
                        .iter()
                        .filter(|l| l.received == l.ordered)
                        .count();
                    if !rm.lines.is_empty() && full == rm.lines.len() {
                        rm.status = PurchaseOrderStatus::Received;
                    } else if full > 0 {
                        rm.status = PurchaseOrderStatus::PartiallyReceived;
                    }
                    self.store.upsert(e.order_id, rm);
                }
            }
            PurchaseOrderEvent::OrderCancelled(e) => {
                if let Some(mut rm) = self.store.get(&e.order_id) {
                    rm.status = PurchaseOrderStatus::Cancelled;
                    self.store.upsert(e.order_id, rm);
                }
            }
        }

        cursors.insert(aggregate_id, seq);
        Ok(())
    }
}
