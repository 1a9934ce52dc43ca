//! Append-only event store boundary.
//!
//! Defines the infrastructure-facing abstraction for storing and loading
//! event streams without making storage assumptions. The atomic multi-stream
//! append is what makes cross-entity mutations (order status + ledger
//! quantity) all-or-nothing.

pub mod in_memory;
pub mod r#trait;

pub use in_memory::InMemoryEventStore;
pub use r#trait::{EventStore, EventStoreError, StoredEvent, StreamAppend, UncommittedEvent};
