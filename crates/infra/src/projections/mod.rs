//! Event-driven read-model projections.
//!
//! Projections consume published envelopes and keep queryable views current.
//! They tolerate at-least-once delivery: a per-stream cursor makes replays
//! no-ops.

pub mod order_board;
pub mod stock_levels;

pub use order_board::{OrderBoardProjection, OrderLineView, OrderReadModel};
pub use stock_levels::{StockLevelsProjection, StockReadModel};
