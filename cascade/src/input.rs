//! Input layers: the data sources chains stream their records from.

use std::collections::HashMap;
use std::sync::Arc;

use crate::stage::{StageContext, StageError};
use crate::types::InputLayerId;
use crate::value::Record;

/// Cursor over the records matching a query.
pub trait RecordIterator: Send {
    /// `false` while the data is still being fetched.
    ///
    /// A handler that sees a non-ready iterator parks the chain with the
    /// notifier instead of blocking.
    fn is_ready(&self) -> bool {
        true
    }

    /// Moves to the next record. Returns `false` at end of stream.
    ///
    /// # Errors
    ///
    /// Read failures end the activation.
    fn advance(&mut self) -> Result<bool, StageError>;

    /// The record under the cursor. Only valid after `advance` returned `true`.
    fn current(&self) -> &Record;
}

/// A data source queried with a chain's input record.
pub trait InputLayer: Send + Sync {
    /// Opens an iterator over the records matching `query`.
    ///
    /// # Errors
    ///
    /// Fails if the query cannot be served by this layer.
    fn iterator(
        &self,
        query: &Record,
        ctx: &StageContext,
    ) -> Result<Box<dyn RecordIterator>, StageError>;

    /// Takes back an iterator once the chain is done with it.
    fn release_iterator(&self, iterator: Box<dyn RecordIterator>) {
        drop(iterator);
    }
}

/// Input layers by id. Filled before the engine starts, read-only afterwards.
#[derive(Default)]
pub struct InputRegistry {
    layers: HashMap<InputLayerId, Arc<dyn InputLayer>>,
}

impl InputRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: InputLayerId, layer: Arc<dyn InputLayer>) {
        self.layers.insert(id, layer);
    }

    /// # Errors
    ///
    /// Returns [`StageError::UnknownInputLayer`] for an unregistered id.
    pub fn get(&self, id: InputLayerId) -> Result<Arc<dyn InputLayer>, StageError> {
        self.layers
            .get(&id)
            .cloned()
            .ok_or(StageError::UnknownInputLayer(id))
    }
}

/// In-memory layer serving a fixed set of records to every query.
pub struct MemoryLayer {
    records: Arc<[Record]>,
}

impl MemoryLayer {
    #[must_use]
    pub fn new(records: Vec<Record>) -> Self {
        Self {
            records: records.into(),
        }
    }
}

impl InputLayer for MemoryLayer {
    fn iterator(
        &self,
        _query: &Record,
        _ctx: &StageContext,
    ) -> Result<Box<dyn RecordIterator>, StageError> {
        Ok(Box::new(MemoryIterator {
            records: Arc::clone(&self.records),
            pos: None,
        }))
    }
}

struct MemoryIterator {
    records: Arc<[Record]>,
    pos: Option<usize>,
}

impl RecordIterator for MemoryIterator {
    fn advance(&mut self) -> Result<bool, StageError> {
        let next = self.pos.map_or(0, |p| p + 1);
        self.pos = Some(next.min(self.records.len()));
        Ok(next < self.records.len())
    }

    fn current(&self) -> &Record {
        &self.records[self.pos.unwrap_or(0)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BucketIdAllocator, ChainIdAllocator, PartitionId};
    use crate::value::Value;

    fn ctx() -> StageContext {
        StageContext::new(
            PartitionId::new(0),
            ChainIdAllocator::from_sequence(0),
            BucketIdAllocator::from_sequence(0),
            None,
        )
    }

    #[test]
    fn memory_layer_streams_all_records() {
        let layer = MemoryLayer::new(vec![
            Record::from(vec![Value::Int(1)]),
            Record::from(vec![Value::Int(2)]),
        ]);
        let mut itr = layer.iterator(&Record::new(), &ctx()).unwrap();
        assert!(itr.is_ready());

        let mut seen = Vec::new();
        while itr.advance().unwrap() {
            seen.push(itr.current()[0].as_int().unwrap());
        }
        assert_eq!(seen, vec![1, 2]);
        assert!(!itr.advance().unwrap());
    }

    #[test]
    fn registry_rejects_unknown_layer() {
        let mut registry = InputRegistry::new();
        registry.register(InputLayerId::DEFAULT, Arc::new(MemoryLayer::new(vec![])));
        assert!(registry.get(InputLayerId::DEFAULT).is_ok());
        assert!(matches!(
            registry.get(InputLayerId::new(3)),
            Err(StageError::UnknownInputLayer(_))
        ));
    }
}
