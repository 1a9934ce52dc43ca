//! Infrastructure layer: event store, indexes, read models, projections.

pub mod catalog;
pub mod event_store;
pub mod projections;
pub mod read_model;
pub mod stock;

#[cfg(test)]
mod integration_tests;
