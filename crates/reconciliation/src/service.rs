//! Write-side coordination: intake, conversion, receipts, fulfillment.
//!
//! The service is the only place commands, streams and indexes meet. Each
//! operation rehydrates the aggregates it touches, runs their pure command
//! handlers and commits the produced events in one atomic append. Cross
//! entity steps (order receipt + ledger receipt, conversion marker + new
//! order) share one append, so readers never observe half of them.
//!
//! Appends race under optimistic concurrency; a lost race is retried with a
//! fresh rehydration up to [`RetryPolicy::max_attempts`] times. Publication
//! to the bus happens after commit and is best effort: persisted events can
//! always be re-published.

use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use procura_core::{Aggregate, AggregateId, AggregateRoot, DomainError, ExpectedVersion, UserId};
use procura_events::{Event, EventBus, EventEnvelope};
use procura_infra::catalog::{CatalogError, CatalogHit, CatalogIndex};
use procura_infra::event_store::{
    EventStore, EventStoreError, StoredEvent, StreamAppend, UncommittedEvent,
};
use procura_infra::stock::StockIndex;
use procura_intake::{
    AmendLines, IntakeConfig, MarkConverted, RawApplication, RawLine, RawWishlist, SubmitWishlist,
    WishlistCommand, WishlistEntry, WishlistEntryId, normalize, normalize_application,
};
use procura_inventory::{
    BatchInfo, FulfillStock, InventoryCommand, InventoryItem, InventoryItemId, ReceiptRef,
    ReceiveStock, ReleaseReservation, Reservation, ReservationId, ReservationPolicy, ReserveStock,
};
use procura_products::{CreateProduct, Product, ProductCommand, ProductId};
use procura_purchasing::{
    NewLine, OpenOrder, OrderSource, PurchaseOrder, PurchaseOrderCommand, PurchaseOrderId,
    RecordReceipt,
};

use crate::error::{ReconciliationError, ReconciliationResult};

const WISHLIST: &str = "intake.wishlist";
const PRODUCT: &str = "products.product";
const ORDER: &str = "purchasing.order";
const ITEM: &str = "inventory.item";

/// Bounded retry for appends that lose an optimistic concurrency race.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(10),
        }
    }
}

/// The reconciliation service.
///
/// Owns process-local indexes (catalog, stock) over a shared event store and
/// publishes committed events to the bus.
#[derive(Debug)]
pub struct ReconciliationService<S, B> {
    store: S,
    bus: B,
    catalog: CatalogIndex<S>,
    stock: StockIndex,
    intake: IntakeConfig,
    reservations: ReservationPolicy,
    retry: RetryPolicy,
}

impl<S, B> ReconciliationService<S, B>
where
    S: EventStore + Clone,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    pub fn new(store: S, bus: B) -> Self {
        Self {
            catalog: CatalogIndex::new(store.clone()),
            stock: StockIndex::new(),
            store,
            bus,
            intake: IntakeConfig::default(),
            reservations: ReservationPolicy::default(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_intake_config(mut self, config: IntakeConfig) -> Self {
        self.intake = config;
        self
    }

    pub fn with_reservation_policy(mut self, policy: ReservationPolicy) -> Self {
        self.reservations = policy;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    // ----- intake -----

    /// Validate, normalize and persist a raw wishlist submission.
    pub fn submit_wishlist(&self, raw: &RawWishlist) -> ReconciliationResult<WishlistEntryId> {
        let draft = normalize(raw, &self.intake)?;

        let entry_id = WishlistEntryId::new(AggregateId::new());
        let entry = WishlistEntry::empty(entry_id);
        let events = entry.handle(&WishlistCommand::SubmitWishlist(SubmitWishlist {
            entry_id,
            customer_id: draft.customer_id,
            agent_id: draft.agent_id,
            lines: draft.lines,
            occurred_at: Utc::now(),
        }))?;

        let batch = self.build_batch(entry_id.0, WISHLIST, 0, &events)?;
        let stored = self.store.append_atomic(vec![batch])?;
        self.publish(&stored);

        tracing::info!(entry_id = %entry_id, "wishlist submitted");
        Ok(entry_id)
    }

    /// Replace a wishlist entry's lines. Only the owning agent may amend,
    /// and only until the entry is converted.
    pub fn amend_wishlist(
        &self,
        entry_id: WishlistEntryId,
        actor: UserId,
        lines: Vec<RawLine>,
    ) -> ReconciliationResult<()> {
        self.with_retry(|| {
            let entry = self.rehydrate(entry_id.0, WISHLIST, WishlistEntry::empty(entry_id))?;
            if !entry.is_created() {
                return Err(DomainError::NotFound.into());
            }
            let customer_id = entry.customer_id().ok_or_else(|| {
                self.corrupt(entry_id.0, "created entry carries no customer_id")
            })?;

            // Same normalization path as submission, so amendment cannot
            // smuggle in lines a fresh submission would reject.
            let draft = normalize(
                &RawWishlist {
                    customer_id,
                    agent_id: actor,
                    lines: lines.clone(),
                },
                &self.intake,
            )?;

            let events = entry.handle(&WishlistCommand::AmendLines(AmendLines {
                entry_id,
                actor,
                lines: draft.lines,
                occurred_at: Utc::now(),
            }))?;

            let batch = self.build_batch(entry_id.0, WISHLIST, entry.version(), &events)?;
            let stored = self.store.append_atomic(vec![batch])?;
            self.publish(&stored);
            Ok(())
        })
    }

    // ----- catalog -----

    /// Resolve a manager-entered application to a catalog product, creating
    /// one when no product matches the normalized key.
    pub fn register_product(&self, raw: &RawApplication) -> ReconciliationResult<CatalogHit> {
        let draft = normalize_application(raw)?;
        let now = Utc::now();

        let (hit, stored) = self.catalog.find_or_create(&draft.key, |product_id| {
            let events = Product::empty(product_id)
                .handle(&ProductCommand::CreateProduct(CreateProduct {
                    product_id,
                    title: draft.title.clone(),
                    sku: draft.sku.clone(),
                    unit: draft.unit.clone(),
                    final_price: draft.final_price,
                    occurred_at: now,
                }))
                .map_err(|e| CatalogError::Rejected(e.to_string()))?;
            to_uncommitted(product_id.0, PRODUCT, &events)
        })?;
        self.publish(&stored);

        if hit.created {
            tracing::info!(product_id = %hit.product_id, "product registered from application");
        }
        Ok(hit)
    }

    // ----- conversion -----

    /// Convert a wishlist entry into a pending purchase order.
    ///
    /// Resolves every line to a catalog product (creating on miss), opens
    /// the order at Pending and marks the entry converted in the same append.
    /// Converting an already-converted entry returns the existing order id.
    pub fn convert_wishlist_to_order(
        &self,
        entry_id: WishlistEntryId,
        actor: UserId,
    ) -> ReconciliationResult<PurchaseOrderId> {
        self.with_retry(|| {
            let entry = self.rehydrate(entry_id.0, WISHLIST, WishlistEntry::empty(entry_id))?;
            if !entry.is_created() {
                return Err(DomainError::NotFound.into());
            }
            if let Some(order) = entry.converted_order() {
                return Ok(PurchaseOrderId::new(order));
            }

            let now = Utc::now();
            let mut to_publish: Vec<StoredEvent> = Vec::new();
            let mut new_lines = Vec::with_capacity(entry.lines().len());

            for line in entry.lines() {
                let (hit, stored) = self.catalog.find_or_create(&line.key, |product_id| {
                    let events = Product::empty(product_id)
                        .handle(&ProductCommand::CreateProduct(CreateProduct {
                            product_id,
                            title: line.title.clone(),
                            sku: line.sku.clone(),
                            unit: "pcs".to_string(),
                            final_price: None,
                            occurred_at: now,
                        }))
                        .map_err(|e| CatalogError::Rejected(e.to_string()))?;
                    to_uncommitted(product_id.0, PRODUCT, &events)
                })?;
                to_publish.extend(stored);
                new_lines.push(NewLine {
                    product_id: hit.product_id,
                    quantity: line.quantity,
                });
            }

            let order_id = PurchaseOrderId::new(AggregateId::new());
            let order = PurchaseOrder::empty(order_id);
            let order_events = order.handle(&PurchaseOrderCommand::OpenOrder(OpenOrder {
                order_id,
                source: Some(OrderSource::WishlistEntry(entry_id.0)),
                created_by: actor,
                lines: new_lines,
                occurred_at: now,
            }))?;
            let entry_events = entry.handle(&WishlistCommand::MarkConverted(MarkConverted {
                entry_id,
                order_id: order_id.0,
                converted_by: actor,
                occurred_at: now,
            }))?;

            let batches = vec![
                self.build_batch(entry_id.0, WISHLIST, entry.version(), &entry_events)?,
                self.build_batch(order_id.0, ORDER, 0, &order_events)?,
            ];
            let stored = self.store.append_atomic(batches)?;
            to_publish.extend(stored);
            self.publish(&to_publish);

            tracing::info!(
                entry_id = %entry_id,
                order_id = %order_id,
                "wishlist converted to purchase order"
            );
            Ok(order_id)
        })
    }

    // ----- receipts -----

    /// Record a warehouse delivery against an order line.
    ///
    /// The order-side receipt and the ledger-side receipt commit in one
    /// atomic append: the order's received quantity and the item's available
    /// quantity move together or not at all.
    pub fn receive_delivery(
        &self,
        order_id: PurchaseOrderId,
        line_no: u32,
        quantity: i64,
        batch: BatchInfo,
        received_by: UserId,
    ) -> ReconciliationResult<ReceiptRef> {
        self.with_retry(|| {
            let order = self.rehydrate(order_id.0, ORDER, PurchaseOrder::empty(order_id))?;
            if !order.is_created() {
                return Err(DomainError::NotFound.into());
            }
            let product_id = order
                .line(line_no)
                .map(|l| l.product_id)
                .ok_or(DomainError::NotFound)?;

            let now = Utc::now();
            let order_events =
                order.handle(&PurchaseOrderCommand::RecordReceipt(RecordReceipt {
                    order_id,
                    line_no,
                    quantity,
                    received_by,
                    occurred_at: now,
                }))?;

            // The receipt's identity is its position in the order stream:
            // replaying a committed receipt dedupes at the item, a later
            // delivery for the same line gets a fresh sequence.
            let receipt = ReceiptRef {
                order_id: order_id.0,
                line_no,
                sequence: order.version() + 1,
            };

            let item_id = self.stock.resolve(product_id, batch.batch_code.as_deref())?;
            let item = self.rehydrate(item_id.0, ITEM, InventoryItem::empty(item_id))?;
            let item_events = item.handle(&InventoryCommand::ReceiveStock(ReceiveStock {
                item_id,
                product_id,
                batch: batch.clone(),
                receipt,
                quantity,
                occurred_at: now,
            }))?;

            let batches = vec![
                self.build_batch(order_id.0, ORDER, order.version(), &order_events)?,
                self.build_batch(item_id.0, ITEM, item.version(), &item_events)?,
            ];
            let stored = self.store.append_atomic(batches)?;
            self.publish(&stored);

            tracing::info!(order_id = %order_id, line_no, quantity, "delivery received");
            Ok(receipt)
        })
    }

    // ----- fulfillment & reservations -----

    /// Deduct stock for an outbound fulfillment. Fails whole-or-nothing: a
    /// product with no stock record behaves exactly like one with zero units.
    pub fn fulfill(
        &self,
        product_id: ProductId,
        batch_code: Option<&str>,
        quantity: i64,
    ) -> ReconciliationResult<()> {
        let Some(item_id) = self.stock.find(product_id, batch_code) else {
            return Err(DomainError::insufficient_stock(quantity, 0).into());
        };

        self.with_retry(|| {
            let item = self.rehydrate(item_id.0, ITEM, InventoryItem::empty(item_id))?;
            if !item.is_created() {
                return Err(DomainError::insufficient_stock(quantity, 0).into());
            }

            let events = item.handle(&InventoryCommand::FulfillStock(FulfillStock {
                item_id,
                quantity,
                occurred_at: Utc::now(),
            }))?;

            let batch = self.build_batch(item_id.0, ITEM, item.version(), &events)?;
            let stored = self.store.append_atomic(vec![batch])?;
            self.publish(&stored);
            Ok(())
        })
    }

    /// Reserve stock against future fulfillment. The reservation expires
    /// after the configured TTL and never changes the available quantity.
    pub fn reserve(
        &self,
        product_id: ProductId,
        batch_code: Option<&str>,
        quantity: i64,
    ) -> ReconciliationResult<ReservationId> {
        let Some(item_id) = self.stock.find(product_id, batch_code) else {
            return Err(DomainError::insufficient_stock(quantity, 0).into());
        };

        self.with_retry(|| {
            let item = self.rehydrate(item_id.0, ITEM, InventoryItem::empty(item_id))?;
            if !item.is_created() {
                return Err(DomainError::insufficient_stock(quantity, 0).into());
            }

            let now = Utc::now();
            let reservation_id = ReservationId::new();
            let events = item.handle(&InventoryCommand::ReserveStock(ReserveStock {
                item_id,
                reservation_id,
                quantity,
                expires_at: self.reservations.expires_at(now),
                occurred_at: now,
            }))?;

            let batch = self.build_batch(item_id.0, ITEM, item.version(), &events)?;
            let stored = self.store.append_atomic(vec![batch])?;
            self.publish(&stored);
            Ok(reservation_id)
        })
    }

    /// Release a reservation. Unknown or already-expired reservations are a
    /// recognized no-op.
    pub fn release_reservation(
        &self,
        product_id: ProductId,
        batch_code: Option<&str>,
        reservation_id: ReservationId,
    ) -> ReconciliationResult<()> {
        let Some(item_id) = self.stock.find(product_id, batch_code) else {
            return Ok(());
        };

        self.with_retry(|| {
            let item = self.rehydrate(item_id.0, ITEM, InventoryItem::empty(item_id))?;
            if !item.is_created() {
                return Ok(());
            }

            let events = item.handle(&InventoryCommand::ReleaseReservation(
                ReleaseReservation {
                    item_id,
                    reservation_id,
                    occurred_at: Utc::now(),
                },
            ))?;

            let batch = self.build_batch(item_id.0, ITEM, item.version(), &events)?;
            let stored = self.store.append_atomic(vec![batch])?;
            self.publish(&stored);
            Ok(())
        })
    }

    // ----- queries -----

    /// Current state of a wishlist entry.
    pub fn wishlist(&self, entry_id: WishlistEntryId) -> ReconciliationResult<WishlistEntry> {
        self.rehydrate(entry_id.0, WISHLIST, WishlistEntry::empty(entry_id))
    }

    /// Current state of a purchase order.
    pub fn order(&self, order_id: PurchaseOrderId) -> ReconciliationResult<PurchaseOrder> {
        self.rehydrate(order_id.0, ORDER, PurchaseOrder::empty(order_id))
    }

    /// Available quantity for a product/batch (0 when never received).
    pub fn available(
        &self,
        product_id: ProductId,
        batch_code: Option<&str>,
    ) -> ReconciliationResult<i64> {
        match self.stock.find(product_id, batch_code) {
            Some(item_id) => Ok(self
                .rehydrate(item_id.0, ITEM, InventoryItem::empty(item_id))?
                .available()),
            None => Ok(0),
        }
    }

    /// Live reservations for a product/batch as of now.
    pub fn reservations(
        &self,
        product_id: ProductId,
        batch_code: Option<&str>,
    ) -> ReconciliationResult<Vec<Reservation>> {
        let Some(item_id) = self.stock.find(product_id, batch_code) else {
            return Ok(vec![]);
        };
        let item = self.rehydrate(item_id.0, ITEM, InventoryItem::empty(item_id))?;
        let now = Utc::now();
        Ok(item
            .reservations()
            .iter()
            .filter(|r| r.expires_at > now)
            .cloned()
            .collect())
    }

    /// The inventory item id backing a product/batch, if one was allocated.
    pub fn item_id(&self, product_id: ProductId, batch_code: Option<&str>) -> Option<InventoryItemId> {
        self.stock.find(product_id, batch_code)
    }

    /// The underlying event store handle (audit reads).
    pub fn store(&self) -> &S {
        &self.store
    }

    // ----- internals -----

    fn with_retry<T>(
        &self,
        mut op: impl FnMut() -> ReconciliationResult<T>,
    ) -> ReconciliationResult<T> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match op() {
                Err(ReconciliationError::Store(EventStoreError::Concurrency(detail))) => {
                    if attempt >= self.retry.max_attempts {
                        return Err(ReconciliationError::StoreConflict {
                            attempts: attempt,
                            detail,
                        });
                    }
                    tracing::debug!(attempt, "concurrent append won; reloading and retrying");
                    std::thread::sleep(self.retry.backoff);
                }
                other => return other,
            }
        }
    }

    fn rehydrate<A>(
        &self,
        stream_id: AggregateId,
        aggregate_type: &str,
        empty: A,
    ) -> ReconciliationResult<A>
    where
        A: Aggregate,
        A::Event: DeserializeOwned,
    {
        let stream = self.store.load_stream(stream_id)?;
        let mut aggregate = empty;
        let mut last = 0u64;

        for stored in &stream {
            if stored.aggregate_type != aggregate_type {
                return Err(self.corrupt(
                    stream_id,
                    format!(
                        "aggregate_type '{}' where '{}' was expected",
                        stored.aggregate_type, aggregate_type
                    ),
                ));
            }
            if stored.sequence_number != last + 1 {
                return Err(self.corrupt(
                    stream_id,
                    format!("sequence {} after {}", stored.sequence_number, last),
                ));
            }
            last = stored.sequence_number;

            let event: A::Event = serde_json::from_value(stored.payload.clone())
                .map_err(|e| {
                    self.corrupt(
                        stream_id,
                        format!("undecodable payload at sequence {last}: {e}"),
                    )
                })?;
            aggregate.apply(&event);
        }

        Ok(aggregate)
    }

    fn build_batch<E>(
        &self,
        stream_id: AggregateId,
        aggregate_type: &str,
        expected: u64,
        events: &[E],
    ) -> ReconciliationResult<StreamAppend>
    where
        E: Event + Serialize,
    {
        let mut uncommitted = Vec::with_capacity(events.len());
        for event in events {
            uncommitted.push(UncommittedEvent::from_typed(
                stream_id,
                aggregate_type,
                Uuid::now_v7(),
                event,
            )?);
        }
        Ok(StreamAppend {
            expected: ExpectedVersion::Exact(expected),
            events: uncommitted,
        })
    }

    /// Publish committed events. Failures are logged, never propagated: the
    /// events are already persisted and can be re-published.
    fn publish(&self, stored: &[StoredEvent]) {
        for event in stored {
            if let Err(err) = self.bus.publish(event.to_envelope()) {
                tracing::warn!(
                    event_type = %event.event_type,
                    error = ?err,
                    "event publish failed; event remains persisted"
                );
            }
        }
    }

    fn corrupt(&self, stream: AggregateId, detail: impl Into<String>) -> ReconciliationError {
        ReconciliationError::CorruptHistory {
            stream,
            detail: detail.into(),
        }
    }
}

fn to_uncommitted<E>(
    stream_id: AggregateId,
    aggregate_type: &str,
    events: &[E],
) -> Result<Vec<UncommittedEvent>, CatalogError>
where
    E: Event + Serialize,
{
    events
        .iter()
        .map(|e| {
            UncommittedEvent::from_typed(stream_id, aggregate_type, Uuid::now_v7(), e)
                .map_err(CatalogError::from)
        })
        .collect()
}
