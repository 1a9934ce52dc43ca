//! `procura-reconciliation` — the write-side coordination service.
//!
//! Ties intake, catalog, purchasing and the inventory ledger together:
//! wishlists come in, purchase orders go out, deliveries reconcile against
//! both the order and the ledger in one atomic append.

pub mod error;
pub mod service;

pub use error::{ReconciliationError, ReconciliationResult};
pub use service::{ReconciliationService, RetryPolicy};
