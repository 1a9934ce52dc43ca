//! `procura-inventory` — the inventory ledger.
//!
//! An [`InventoryItem`] aggregate owns the available quantity for one
//! product/batch. Its event stream is the append-only ledger every quantity
//! change is reconstructed from: receipts, fulfillments, reservations.

pub mod item;

pub use item::{
    BatchInfo, FulfillStock, InventoryCommand, InventoryEvent, InventoryItem, InventoryItemId,
    ItemRegistered, ReceiptRef, ReceiveStock, ReleaseReservation, Reservation, ReservationId,
    ReservationPolicy, ReservationReleased, ReserveStock, StockFulfilled, StockReceived,
    StockReserved,
};
