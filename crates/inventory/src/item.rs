use std::collections::HashSet;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use procura_core::{Aggregate, AggregateId, AggregateRoot, DomainError};
use procura_events::Event;
use procura_products::ProductId;

/// Inventory item identifier (one stream per product/batch).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InventoryItemId(pub AggregateId);

impl InventoryItemId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for InventoryItemId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Reservation identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReservationId(pub Uuid);

impl ReservationId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ReservationId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for ReservationId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Batch/SKU metadata carried by a receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BatchInfo {
    pub batch_code: Option<String>,
    pub unit: String,
    pub expiry_date: Option<NaiveDate>,
    /// Price in smallest currency unit (e.g. cents).
    pub final_price: Option<u64>,
}

/// Identifies one warehouse receipt: a purchase-order line plus the receipt
/// sequence within that order. Replaying a receipt with a ref the item has
/// already processed must not double-count.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReceiptRef {
    pub order_id: AggregateId,
    pub line_no: u32,
    pub sequence: u64,
}

/// A recorded intent to fulfill later. Never mutates `available`; only
/// constrains how much further reservation is allowed until it expires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub reservation_id: ReservationId,
    pub quantity: i64,
    pub expires_at: DateTime<Utc>,
}

/// Reservation expiry policy. Abandoned flows release implicit capacity
/// once the TTL has passed.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationPolicy {
    pub ttl_seconds: i64,
}

impl Default for ReservationPolicy {
    fn default() -> Self {
        Self { ttl_seconds: 900 }
    }
}

impl ReservationPolicy {
    pub fn expires_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + Duration::seconds(self.ttl_seconds)
    }
}

/// Aggregate root: InventoryItem.
///
/// Owns `available` exclusively; every change arrives as an event in the
/// item's stream, which doubles as the audit ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryItem {
    id: InventoryItemId,
    product_id: Option<ProductId>,
    batch: BatchInfo,
    available: i64,
    reservations: Vec<Reservation>,
    processed_receipts: HashSet<ReceiptRef>,
    version: u64,
    created: bool,
}

impl InventoryItem {
    /// Create an empty, not-yet-created aggregate instance for rehydration.
    pub fn empty(id: InventoryItemId) -> Self {
        Self {
            id,
            product_id: None,
            batch: BatchInfo::default(),
            available: 0,
            reservations: Vec::new(),
            processed_receipts: HashSet::new(),
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> InventoryItemId {
        self.id
    }

    pub fn product_id(&self) -> Option<ProductId> {
        self.product_id
    }

    pub fn batch(&self) -> &BatchInfo {
        &self.batch
    }

    pub fn available(&self) -> i64 {
        self.available
    }

    pub fn is_created(&self) -> bool {
        self.created
    }

    /// All recorded reservations, expired ones included.
    pub fn reservations(&self) -> &[Reservation] {
        &self.reservations
    }

    /// Quantity held by reservations still alive at `now`.
    pub fn reserved(&self, now: DateTime<Utc>) -> i64 {
        self.reservations
            .iter()
            .filter(|r| r.expires_at > now)
            .map(|r| r.quantity)
            .sum()
    }

    /// Quantity a new reservation may still claim at `now`.
    pub fn uncommitted(&self, now: DateTime<Utc>) -> i64 {
        self.available - self.reserved(now)
    }
}

impl AggregateRoot for InventoryItem {
    type Id = InventoryItemId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: ReceiveStock (idempotent per `receipt`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiveStock {
    pub item_id: InventoryItemId,
    pub product_id: ProductId,
    pub batch: BatchInfo,
    pub receipt: ReceiptRef,
    pub quantity: i64,
    pub occurred_at: DateTime<Utc>,
}

/// Command: FulfillStock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FulfillStock {
    pub item_id: InventoryItemId,
    pub quantity: i64,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ReserveStock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReserveStock {
    pub item_id: InventoryItemId,
    pub reservation_id: ReservationId,
    pub quantity: i64,
    pub expires_at: DateTime<Utc>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ReleaseReservation (idempotent for unknown/expired ids).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseReservation {
    pub item_id: InventoryItemId,
    pub reservation_id: ReservationId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InventoryCommand {
    ReceiveStock(ReceiveStock),
    FulfillStock(FulfillStock),
    ReserveStock(ReserveStock),
    ReleaseReservation(ReleaseReservation),
}

/// Event: ItemRegistered (lazy creation on first receipt).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRegistered {
    pub item_id: InventoryItemId,
    pub product_id: ProductId,
    pub batch: BatchInfo,
    pub occurred_at: DateTime<Utc>,
}

/// Event: StockReceived (ledger entry, delta = +quantity).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockReceived {
    pub item_id: InventoryItemId,
    pub product_id: ProductId,
    pub receipt: ReceiptRef,
    pub quantity: i64,
    pub occurred_at: DateTime<Utc>,
}

/// Event: StockFulfilled (ledger entry, delta = -quantity).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockFulfilled {
    pub item_id: InventoryItemId,
    pub quantity: i64,
    pub occurred_at: DateTime<Utc>,
}

/// Event: StockReserved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockReserved {
    pub item_id: InventoryItemId,
    pub reservation_id: ReservationId,
    pub quantity: i64,
    pub expires_at: DateTime<Utc>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ReservationReleased.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationReleased {
    pub item_id: InventoryItemId,
    pub reservation_id: ReservationId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InventoryEvent {
    ItemRegistered(ItemRegistered),
    StockReceived(StockReceived),
    StockFulfilled(StockFulfilled),
    StockReserved(StockReserved),
    ReservationReleased(ReservationReleased),
}

impl Event for InventoryEvent {
    fn event_type(&self) -> &'static str {
        match self {
            InventoryEvent::ItemRegistered(_) => "inventory.item.registered",
            InventoryEvent::StockReceived(_) => "inventory.item.stock_received",
            InventoryEvent::StockFulfilled(_) => "inventory.item.stock_fulfilled",
            InventoryEvent::StockReserved(_) => "inventory.item.stock_reserved",
            InventoryEvent::ReservationReleased(_) => "inventory.item.reservation_released",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            InventoryEvent::ItemRegistered(e) => e.occurred_at,
            InventoryEvent::StockReceived(e) => e.occurred_at,
            InventoryEvent::StockFulfilled(e) => e.occurred_at,
            InventoryEvent::StockReserved(e) => e.occurred_at,
            InventoryEvent::ReservationReleased(e) => e.occurred_at,
        }
    }
}

impl Aggregate for InventoryItem {
    type Command = InventoryCommand;
    type Event = InventoryEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            InventoryEvent::ItemRegistered(e) => {
                self.id = e.item_id;
                self.product_id = Some(e.product_id);
                self.batch = e.batch.clone();
                self.available = 0;
                self.created = true;
            }
            InventoryEvent::StockReceived(e) => {
                self.available += e.quantity;
                self.processed_receipts.insert(e.receipt);
            }
            InventoryEvent::StockFulfilled(e) => {
                self.available -= e.quantity;
            }
            InventoryEvent::StockReserved(e) => {
                self.reservations.push(Reservation {
                    reservation_id: e.reservation_id,
                    quantity: e.quantity,
                    expires_at: e.expires_at,
                });
            }
            InventoryEvent::ReservationReleased(e) => {
                self.reservations
                    .retain(|r| r.reservation_id != e.reservation_id);
            }
        }

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            InventoryCommand::ReceiveStock(cmd) => self.handle_receive(cmd),
            InventoryCommand::FulfillStock(cmd) => self.handle_fulfill(cmd),
            InventoryCommand::ReserveStock(cmd) => self.handle_reserve(cmd),
            InventoryCommand::ReleaseReservation(cmd) => self.handle_release(cmd),
        }
    }
}

impl InventoryItem {
    fn ensure_item_id(&self, item_id: InventoryItemId) -> Result<(), DomainError> {
        if self.id != item_id {
            return Err(DomainError::invariant("item_id mismatch"));
        }
        Ok(())
    }

    fn handle_receive(&self, cmd: &ReceiveStock) -> Result<Vec<InventoryEvent>, DomainError> {
        self.ensure_item_id(cmd.item_id)?;

        if cmd.quantity <= 0 {
            return Err(DomainError::validation("received quantity must be positive"));
        }

        // Replay of an already-processed receipt: recognized no-op.
        if self.processed_receipts.contains(&cmd.receipt) {
            return Ok(vec![]);
        }

        if let Some(existing) = self.product_id {
            if existing != cmd.product_id {
                return Err(DomainError::invariant("product_id mismatch"));
            }
        }

        if self.available.checked_add(cmd.quantity).is_none() {
            return Err(DomainError::validation(
                "received quantity overflows the available stock counter",
            ));
        }

        let mut events = Vec::with_capacity(2);

        // Lazy creation on the first receipt of a new product/batch.
        if !self.created {
            events.push(InventoryEvent::ItemRegistered(ItemRegistered {
                item_id: cmd.item_id,
                product_id: cmd.product_id,
                batch: cmd.batch.clone(),
                occurred_at: cmd.occurred_at,
            }));
        }

        events.push(InventoryEvent::StockReceived(StockReceived {
            item_id: cmd.item_id,
            product_id: cmd.product_id,
            receipt: cmd.receipt,
            quantity: cmd.quantity,
            occurred_at: cmd.occurred_at,
        }));

        Ok(events)
    }

    fn handle_fulfill(&self, cmd: &FulfillStock) -> Result<Vec<InventoryEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_item_id(cmd.item_id)?;

        if cmd.quantity <= 0 {
            return Err(DomainError::validation("fulfilled quantity must be positive"));
        }

        // Fails atomically: either the full quantity is available or nothing
        // is decremented.
        if cmd.quantity > self.available {
            return Err(DomainError::insufficient_stock(cmd.quantity, self.available));
        }

        Ok(vec![InventoryEvent::StockFulfilled(StockFulfilled {
            item_id: cmd.item_id,
            quantity: cmd.quantity,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_reserve(&self, cmd: &ReserveStock) -> Result<Vec<InventoryEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_item_id(cmd.item_id)?;

        if cmd.quantity <= 0 {
            return Err(DomainError::validation("reserved quantity must be positive"));
        }
        if cmd.expires_at <= cmd.occurred_at {
            return Err(DomainError::validation("reservation must expire in the future"));
        }

        // Optimistic check against capacity not already claimed by live
        // reservations. Expired reservations no longer count.
        let uncommitted = self.uncommitted(cmd.occurred_at);
        if cmd.quantity > uncommitted {
            return Err(DomainError::insufficient_stock(cmd.quantity, uncommitted));
        }

        Ok(vec![InventoryEvent::StockReserved(StockReserved {
            item_id: cmd.item_id,
            reservation_id: cmd.reservation_id,
            quantity: cmd.quantity,
            expires_at: cmd.expires_at,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_release(&self, cmd: &ReleaseReservation) -> Result<Vec<InventoryEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_item_id(cmd.item_id)?;

        let known = self
            .reservations
            .iter()
            .any(|r| r.reservation_id == cmd.reservation_id);
        if !known {
            // Already released or expired-and-forgotten: recognized no-op.
            return Ok(vec![]);
        }

        Ok(vec![InventoryEvent::ReservationReleased(
            ReservationReleased {
                item_id: cmd.item_id,
                reservation_id: cmd.reservation_id,
                occurred_at: cmd.occurred_at,
            },
        )])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_item_id() -> InventoryItemId {
        InventoryItemId::new(AggregateId::new())
    }

    fn test_product_id() -> ProductId {
        ProductId::new(AggregateId::new())
    }

    fn test_time() -> DateTime<Utc> {
        Utc::now()
    }

    fn test_batch() -> BatchInfo {
        BatchInfo {
            batch_code: Some("B-01".to_string()),
            unit: "pcs".to_string(),
            expiry_date: None,
            final_price: Some(499),
        }
    }

    fn receipt(order_id: AggregateId, line_no: u32, sequence: u64) -> ReceiptRef {
        ReceiptRef {
            order_id,
            line_no,
            sequence,
        }
    }

    fn receive(item: &mut InventoryItem, product_id: ProductId, r: ReceiptRef, qty: i64) {
        let cmd = ReceiveStock {
            item_id: item.id_typed(),
            product_id,
            batch: test_batch(),
            receipt: r,
            quantity: qty,
            occurred_at: test_time(),
        };
        let events = item
            .handle(&InventoryCommand::ReceiveStock(cmd))
            .unwrap();
        for e in &events {
            item.apply(e);
        }
    }

    #[test]
    fn first_receipt_registers_item_lazily() {
        let mut item = InventoryItem::empty(test_item_id());
        let product_id = test_product_id();
        let order = AggregateId::new();

        let cmd = ReceiveStock {
            item_id: item.id_typed(),
            product_id,
            batch: test_batch(),
            receipt: receipt(order, 1, 1),
            quantity: 5,
            occurred_at: test_time(),
        };

        let events = item
            .handle(&InventoryCommand::ReceiveStock(cmd))
            .unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], InventoryEvent::ItemRegistered(_)));
        assert!(matches!(events[1], InventoryEvent::StockReceived(_)));

        for e in &events {
            item.apply(e);
        }
        assert!(item.is_created());
        assert_eq!(item.available(), 5);
    }

    #[test]
    fn replaying_a_receipt_does_not_double_count() {
        let mut item = InventoryItem::empty(test_item_id());
        let product_id = test_product_id();
        let order = AggregateId::new();
        let r = receipt(order, 1, 1);

        receive(&mut item, product_id, r, 5);
        assert_eq!(item.available(), 5);

        let replay = ReceiveStock {
            item_id: item.id_typed(),
            product_id,
            batch: test_batch(),
            receipt: r,
            quantity: 5,
            occurred_at: test_time(),
        };
        let events = item
            .handle(&InventoryCommand::ReceiveStock(replay))
            .unwrap();
        assert!(events.is_empty());
        assert_eq!(item.available(), 5);

        // A later receipt against the same line (new sequence) is distinct.
        receive(&mut item, product_id, receipt(order, 1, 2), 3);
        assert_eq!(item.available(), 8);
    }

    #[test]
    fn receipt_overflowing_the_counter_is_rejected() {
        let mut item = InventoryItem::empty(test_item_id());
        let product_id = test_product_id();
        let order = AggregateId::new();
        receive(&mut item, product_id, receipt(order, 1, 1), 5);

        // available + quantity would exceed i64::MAX; the command must be
        // refused before any event is emitted.
        let huge = ReceiveStock {
            item_id: item.id_typed(),
            product_id,
            batch: test_batch(),
            receipt: receipt(order, 1, 2),
            quantity: i64::MAX,
            occurred_at: test_time(),
        };
        let err = item
            .handle(&InventoryCommand::ReceiveStock(huge))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
        assert_eq!(item.available(), 5);
    }

    #[test]
    fn fulfill_decrements_and_refuses_overdraw() {
        let mut item = InventoryItem::empty(test_item_id());
        let product_id = test_product_id();
        receive(&mut item, product_id, receipt(AggregateId::new(), 1, 1), 4);

        let overdraw = FulfillStock {
            item_id: item.id_typed(),
            quantity: 5,
            occurred_at: test_time(),
        };
        let err = item
            .handle(&InventoryCommand::FulfillStock(overdraw))
            .unwrap_err();
        assert_eq!(
            err,
            DomainError::InsufficientStock {
                requested: 5,
                available: 4
            }
        );
        assert_eq!(item.available(), 4);

        let fulfill = FulfillStock {
            item_id: item.id_typed(),
            quantity: 4,
            occurred_at: test_time(),
        };
        let events = item
            .handle(&InventoryCommand::FulfillStock(fulfill))
            .unwrap();
        item.apply(&events[0]);
        assert_eq!(item.available(), 0);
    }

    #[test]
    fn fulfill_before_any_receipt_is_not_found() {
        let item = InventoryItem::empty(test_item_id());
        let cmd = FulfillStock {
            item_id: item.id_typed(),
            quantity: 1,
            occurred_at: test_time(),
        };
        let err = item
            .handle(&InventoryCommand::FulfillStock(cmd))
            .unwrap_err();
        assert_eq!(err, DomainError::NotFound);
    }

    #[test]
    fn reserve_counts_live_reservations_only() {
        let mut item = InventoryItem::empty(test_item_id());
        let product_id = test_product_id();
        receive(&mut item, product_id, receipt(AggregateId::new(), 1, 1), 10);

        let now = test_time();
        let policy = ReservationPolicy::default();

        let first = ReserveStock {
            item_id: item.id_typed(),
            reservation_id: ReservationId::new(),
            quantity: 7,
            expires_at: policy.expires_at(now),
            occurred_at: now,
        };
        let events = item.handle(&InventoryCommand::ReserveStock(first)).unwrap();
        item.apply(&events[0]);
        assert_eq!(item.uncommitted(now), 3);

        // Capacity is constrained by the live reservation, not by stock.
        let second = ReserveStock {
            item_id: item.id_typed(),
            reservation_id: ReservationId::new(),
            quantity: 4,
            expires_at: policy.expires_at(now),
            occurred_at: now,
        };
        let err = item
            .handle(&InventoryCommand::ReserveStock(second))
            .unwrap_err();
        assert_eq!(
            err,
            DomainError::InsufficientStock {
                requested: 4,
                available: 3
            }
        );

        // Reservations never touch the available quantity itself.
        assert_eq!(item.available(), 10);
    }

    #[test]
    fn expired_reservation_releases_capacity() {
        let mut item = InventoryItem::empty(test_item_id());
        let product_id = test_product_id();
        receive(&mut item, product_id, receipt(AggregateId::new(), 1, 1), 10);

        let now = test_time();
        let reserve = ReserveStock {
            item_id: item.id_typed(),
            reservation_id: ReservationId::new(),
            quantity: 10,
            expires_at: now + Duration::seconds(60),
            occurred_at: now,
        };
        let events = item
            .handle(&InventoryCommand::ReserveStock(reserve))
            .unwrap();
        item.apply(&events[0]);

        let later = now + Duration::seconds(61);
        assert_eq!(item.uncommitted(later), 10);

        let again = ReserveStock {
            item_id: item.id_typed(),
            reservation_id: ReservationId::new(),
            quantity: 10,
            expires_at: later + Duration::seconds(60),
            occurred_at: later,
        };
        assert!(item.handle(&InventoryCommand::ReserveStock(again)).is_ok());
    }

    #[test]
    fn releasing_an_unknown_reservation_is_a_no_op() {
        let mut item = InventoryItem::empty(test_item_id());
        let product_id = test_product_id();
        receive(&mut item, product_id, receipt(AggregateId::new(), 1, 1), 1);

        let cmd = ReleaseReservation {
            item_id: item.id_typed(),
            reservation_id: ReservationId::new(),
            occurred_at: test_time(),
        };
        let events = item
            .handle(&InventoryCommand::ReleaseReservation(cmd))
            .unwrap();
        assert!(events.is_empty());
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum Op {
            Receive(i64),
            Fulfill(i64),
        }

        fn op_strategy() -> impl Strategy<Value = Op> {
            prop_oneof![
                (1i64..50).prop_map(Op::Receive),
                (1i64..50).prop_map(Op::Fulfill),
            ]
        }

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 256,
                ..ProptestConfig::default()
            })]

            /// Property: for any sequence of receive/fulfill commands, the
            /// available quantity never goes negative; rejected commands
            /// leave state untouched.
            #[test]
            fn available_quantity_never_negative(ops in prop::collection::vec(op_strategy(), 1..40)) {
                let mut item = InventoryItem::empty(test_item_id());
                let product_id = test_product_id();
                let order = AggregateId::new();
                let mut seq = 0u64;

                for op in ops {
                    let result = match op {
                        Op::Receive(qty) => {
                            seq += 1;
                            item.handle(&InventoryCommand::ReceiveStock(ReceiveStock {
                                item_id: item.id_typed(),
                                product_id,
                                batch: test_batch(),
                                receipt: receipt(order, 1, seq),
                                quantity: qty,
                                occurred_at: test_time(),
                            }))
                        }
                        Op::Fulfill(qty) => {
                            item.handle(&InventoryCommand::FulfillStock(FulfillStock {
                                item_id: item.id_typed(),
                                quantity: qty,
                                occurred_at: test_time(),
                            }))
                        }
                    };

                    if let Ok(events) = result {
                        for e in &events {
                            item.apply(e);
                        }
                    }

                    prop_assert!(item.available() >= 0);
                }
            }
        }
    }
}
