//! Product/batch → inventory item mapping.
//!
//! Inventory items are created lazily on first receipt, so the stream id for
//! a product/batch has to be allocated somewhere stable. This index owns that
//! mapping; `resolve` allocates on first sight and always hands concurrent
//! callers the same item id.

use std::collections::HashMap;
use std::sync::RwLock;

use thiserror::Error;

use procura_core::AggregateId;
use procura_inventory::InventoryItemId;
use procura_products::ProductId;

#[derive(Debug, Error)]
pub enum StockIndexError {
    #[error("stock index lock poisoned")]
    Poisoned,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct StockKey {
    product_id: ProductId,
    batch_code: Option<String>,
}

/// Process-local product/batch → item index.
#[derive(Debug, Default)]
pub struct StockIndex {
    index: RwLock<HashMap<StockKey, InventoryItemId>>,
}

impl StockIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Item id for a product/batch, if one was ever allocated.
    pub fn find(&self, product_id: ProductId, batch_code: Option<&str>) -> Option<InventoryItemId> {
        let key = StockKey {
            product_id,
            batch_code: batch_code.map(str::to_string),
        };
        self.index.read().ok()?.get(&key).copied()
    }

    /// Item id for a product/batch, allocating one on first sight.
    pub fn resolve(
        &self,
        product_id: ProductId,
        batch_code: Option<&str>,
    ) -> Result<InventoryItemId, StockIndexError> {
        let key = StockKey {
            product_id,
            batch_code: batch_code.map(str::to_string),
        };

        let mut index = self.index.write().map_err(|_| StockIndexError::Poisoned)?;
        Ok(*index
            .entry(key)
            .or_insert_with(|| InventoryItemId::new(AggregateId::new())))
    }
}
