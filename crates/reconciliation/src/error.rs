use thiserror::Error;

use procura_core::{AggregateId, DomainError};
use procura_infra::catalog::CatalogError;
use procura_infra::event_store::EventStoreError;
use procura_infra::stock::StockIndexError;

/// Service-level error: domain rejections plus infrastructure failures.
///
/// Domain rejections pass through unchanged so callers can distinguish "the
/// business said no" from "the write lost a race".
#[derive(Debug, Error)]
pub enum ReconciliationError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    /// The stream version moved under the request and the bounded retry
    /// budget ran out. The caller may safely resubmit.
    #[error("stream version moved during the request (gave up after {attempts} attempts): {detail}")]
    StoreConflict { attempts: u32, detail: String },

    #[error(transparent)]
    Store(EventStoreError),

    /// A persisted stream failed to rehydrate (gap, type drift, undecodable
    /// payload). This is data corruption, not a caller mistake.
    #[error("corrupt history for stream {stream}: {detail}")]
    CorruptHistory { stream: AggregateId, detail: String },

    #[error("catalog index lock poisoned")]
    CatalogPoisoned,

    #[error("stock index lock poisoned")]
    StockPoisoned,
}

impl From<EventStoreError> for ReconciliationError {
    fn from(err: EventStoreError) -> Self {
        Self::Store(err)
    }
}

impl From<CatalogError> for ReconciliationError {
    fn from(err: CatalogError) -> Self {
        match err {
            CatalogError::Poisoned => Self::CatalogPoisoned,
            CatalogError::Rejected(detail) => Self::Domain(DomainError::validation(detail)),
            CatalogError::Store(e) => Self::Store(e),
        }
    }
}

impl From<StockIndexError> for ReconciliationError {
    fn from(err: StockIndexError) -> Self {
        match err {
            StockIndexError::Poisoned => Self::StockPoisoned,
        }
    }
}

pub type ReconciliationResult<T> = Result<T, ReconciliationError>;
