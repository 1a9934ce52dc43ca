//! `procura-purchasing` — the purchase order workflow.
//!
//! State machine: Draft → Pending → {PartiallyReceived → Received |
//! Received} | Cancelled. Receipts can never exceed the ordered quantity on
//! a line.

pub mod order;

pub use order::{
    AddLine, CancelOrder, DraftOrder, NewLine, OpenOrder, OrderCancelled, OrderDrafted,
    OrderLine, OrderOpened, OrderSource, OrderSubmitted, PurchaseOrder, PurchaseOrderCommand,
    PurchaseOrderEvent, PurchaseOrderId, PurchaseOrderLineAdded, PurchaseOrderStatus,
    ReceiptRecorded, RecordReceipt, SubmitOrder,
};
