//! Atomic find-or-create catalog index.
//!
//! Resolving an intake line to a product by case-insensitive lookup and then
//! creating on miss is race-prone: two managers converting concurrently
//! would duplicate the catalog entry. The index holds its write lock across
//! the lookup *and* the creating append, so exactly one caller creates and
//! every other caller sees the same [`ProductId`] for a given key.

use std::collections::HashMap;
use std::sync::RwLock;

use thiserror::Error;

use procura_core::{AggregateId, ExpectedVersion};
use procura_products::{ProductId, ProductKey};

use crate::event_store::{EventStore, EventStoreError, StoredEvent, UncommittedEvent};

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog index lock poisoned")]
    Poisoned,

    #[error("product creation rejected: {0}")]
    Rejected(String),

    #[error(transparent)]
    Store(#[from] EventStoreError),
}

/// Outcome of [`CatalogIndex::find_or_create`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogHit {
    pub product_id: ProductId,
    pub created: bool,
}

/// Process-local catalog index over the event store.
///
/// Like a read model it is disposable: rebuildable from the product streams.
#[derive(Debug)]
pub struct CatalogIndex<S> {
    store: S,
    index: RwLock<HashMap<ProductKey, ProductId>>,
}

impl<S> CatalogIndex<S>
where
    S: EventStore,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            index: RwLock::new(HashMap::new()),
        }
    }

    /// Look up a product by normalized key.
    pub fn find(&self, key: &ProductKey) -> Option<ProductId> {
        self.index.read().ok()?.get(key).copied()
    }

    /// Resolve a key to a product, creating one if none exists.
    ///
    /// `create` receives the freshly allocated id and returns the events to
    /// seed the new product stream with. The index lock is held across the
    /// append, making find-or-create atomic under concurrent callers. Any
    /// stored events returned alongside the hit are the caller's to publish.
    pub fn find_or_create(
        &self,
        key: &ProductKey,
        create: impl FnOnce(ProductId) -> Result<Vec<UncommittedEvent>, CatalogError>,
    ) -> Result<(CatalogHit, Vec<StoredEvent>), CatalogError> {
        let mut index = self.index.write().map_err(|_| CatalogError::Poisoned)?;

        if let Some(&product_id) = index.get(key) {
            return Ok((
                CatalogHit {
                    product_id,
                    created: false,
                },
                vec![],
            ));
        }

        let product_id = ProductId::new(AggregateId::new());
        let events = create(product_id)?;
        let stored = self.store.append(events, ExpectedVersion::Exact(0))?;
        index.insert(key.clone(), product_id);

        tracing::info!(key = %key, product_id = %product_id, "catalog entry created");

        Ok((
            CatalogHit {
                product_id,
                created: true,
            },
            stored,
        ))
    }
}
