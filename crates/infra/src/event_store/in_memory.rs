use std::collections::HashMap;
use std::sync::RwLock;

use procura_core::AggregateId;

use super::r#trait::{EventStore, EventStoreError, StoredEvent, StreamAppend, UncommittedEvent};

/// In-memory append-only event store.
///
/// Intended for tests/dev. A single write lock covers the whole store, so an
/// atomic multi-stream append either commits every batch or none.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    streams: RwLock<HashMap<AggregateId, Vec<StoredEvent>>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn current_version(stream: &[StoredEvent]) -> u64 {
        stream.last().map(|e| e.sequence_number).unwrap_or(0)
    }

    fn validate_batch(events: &[UncommittedEvent]) -> Result<(AggregateId, &str), EventStoreError> {
        let aggregate_id = events[0].aggregate_id;
        let aggregate_type = events[0].aggregate_type.as_str();

        for (idx, e) in events.iter().enumerate() {
            if e.aggregate_id != aggregate_id {
                return Err(EventStoreError::InvalidAppend(format!(
                    "batch contains multiple aggregate_ids (index {idx})"
                )));
            }
            if e.aggregate_type != aggregate_type {
                return Err(EventStoreError::AggregateTypeMismatch(format!(
                    "batch contains multiple aggregate_types (index {idx})"
                )));
            }
        }

        Ok((aggregate_id, aggregate_type))
    }
}

impl EventStore for InMemoryEventStore {
    fn append_atomic(
        &self,
        batches: Vec<StreamAppend>,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let batches: Vec<StreamAppend> = batches
            .into_iter()
            .filter(|b| !b.events.is_empty())
            .collect();
        if batches.is_empty() {
            return Ok(vec![]);
        }

        let mut streams = self
            .streams
            .write()
            .map_err(|_| EventStoreError::InvalidAppend("lock poisoned".to_string()))?;

        // First pass: validate every batch before touching any stream, so a
        // failure leaves the store untouched.
        let mut validated = Vec::with_capacity(batches.len());
        for batch in &batches {
            let (aggregate_id, aggregate_type) = Self::validate_batch(&batch.events)?;

            if validated.iter().any(|&(id, _, _)| id == aggregate_id) {
                return Err(EventStoreError::InvalidAppend(format!(
                    "atomic append targets stream {aggregate_id} twice"
                )));
            }

            let stream = streams.get(&aggregate_id).map(Vec::as_slice).unwrap_or(&[]);
            let current = Self::current_version(stream);

            if !batch.expected.matches(current) {
                return Err(EventStoreError::Concurrency(format!(
                    "stream {aggregate_id}: expected {:?}, found {current}",
                    batch.expected
                )));
            }

            // Enforce aggregate type stability across the stream.
            if let Some(existing) = stream.first() {
                if existing.aggregate_type != aggregate_type {
                    return Err(EventStoreError::AggregateTypeMismatch(format!(
                        "stream aggregate_type is '{}', attempted append with '{}'",
                        existing.aggregate_type, aggregate_type
                    )));
                }
            }

            validated.push((aggregate_id, aggregate_type.to_string(), current));
        }

        // Second pass: assign sequence numbers and append (append-only).
        let mut committed = Vec::new();
        for (batch, (aggregate_id, _, current)) in batches.into_iter().zip(validated) {
            let stream = streams.entry(aggregate_id).or_default();
            let mut next = current + 1;

            for e in batch.events {
                let stored = StoredEvent {
                    event_id: e.event_id,
                    aggregate_id: e.aggregate_id,
                    aggregate_type: e.aggregate_type,
                    sequence_number: next,
                    event_type: e.event_type,
                    event_version: e.event_version,
                    occurred_at: e.occurred_at,
                    payload: e.payload,
                };
                next += 1;
                stream.push(stored.clone());
                committed.push(stored);
            }
        }

        Ok(committed)
    }

    fn load_stream(&self, aggregate_id: AggregateId) -> Result<Vec<StoredEvent>, EventStoreError> {
        let streams = self
            .streams
            .read()
            .map_err(|_| EventStoreError::InvalidAppend("lock poisoned".to_string()))?;

        Ok(streams.get(&aggregate_id).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use procura_core::ExpectedVersion;
    use serde_json::json;
    use uuid::Uuid;

    fn uncommitted(aggregate_id: AggregateId, kind: &str) -> UncommittedEvent {
        UncommittedEvent {
            event_id: Uuid::now_v7(),
            aggregate_id,
            aggregate_type: kind.to_string(),
            event_type: format!("{kind}.test"),
            event_version: 1,
            occurred_at: Utc::now(),
            payload: json!({"ok": true}),
        }
    }

    #[test]
    fn append_assigns_monotonic_sequence_numbers() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new();

        let first = store
            .append(vec![uncommitted(id, "a"), uncommitted(id, "a")], ExpectedVersion::Exact(0))
            .unwrap();
        assert_eq!(first[0].sequence_number, 1);
        assert_eq!(first[1].sequence_number, 2);

        let second = store
            .append(vec![uncommitted(id, "a")], ExpectedVersion::Exact(2))
            .unwrap();
        assert_eq!(second[0].sequence_number, 3);
    }

    #[test]
    fn stale_expected_version_is_a_concurrency_error() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new();

        store
            .append(vec![uncommitted(id, "a")], ExpectedVersion::Exact(0))
            .unwrap();

        let err = store
            .append(vec![uncommitted(id, "a")], ExpectedVersion::Exact(0))
            .unwrap_err();
        assert!(matches!(err, EventStoreError::Concurrency(_)));
    }

    #[test]
    fn atomic_append_commits_all_streams_or_none() {
        let store = InMemoryEventStore::new();
        let a = AggregateId::new();
        let b = AggregateId::new();

        // Seed stream b so an Exact(0) expectation on it is stale.
        store
            .append(vec![uncommitted(b, "b")], ExpectedVersion::Exact(0))
            .unwrap();

        let err = store
            .append_atomic(vec![
                StreamAppend {
                    expected: ExpectedVersion::Exact(0),
                    events: vec![uncommitted(a, "a")],
                },
                StreamAppend {
                    expected: ExpectedVersion::Exact(0),
                    events: vec![uncommitted(b, "b")],
                },
            ])
            .unwrap_err();
        assert!(matches!(err, EventStoreError::Concurrency(_)));

        // Stream a must be untouched even though its own check would pass.
        assert!(store.load_stream(a).unwrap().is_empty());
        assert_eq!(store.load_stream(b).unwrap().len(), 1);

        let committed = store
            .append_atomic(vec![
                StreamAppend {
                    expected: ExpectedVersion::Exact(0),
                    events: vec![uncommitted(a, "a")],
                },
                StreamAppend {
                    expected: ExpectedVersion::Exact(1),
                    events: vec![uncommitted(b, "b")],
                },
            ])
            .unwrap();
        assert_eq!(committed.len(), 2);
    }

    #[test]
    fn aggregate_type_is_stable_per_stream() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new();

        store
            .append(vec![uncommitted(id, "a")], ExpectedVersion::Exact(0))
            .unwrap();
        let err = store
            .append(vec![uncommitted(id, "b")], ExpectedVersion::Exact(1))
            .unwrap_err();
        assert!(matches!(err, EventStoreError::AggregateTypeMismatch(_)));
    }

    #[test]
    fn empty_batches_are_skipped() {
        let store = InMemoryEventStore::new();
        let committed = store
            .append_atomic(vec![StreamAppend {
                expected: ExpectedVersion::Exact(0),
                events: vec![],
            }])
            .unwrap();
        assert!(committed.is_empty());
    }
}
