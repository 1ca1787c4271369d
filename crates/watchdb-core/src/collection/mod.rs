//! Module: collection
//! Responsibility: typed records plus their secondary index entries, read
//! through a read-only view or staged through a read-write view inside a
//! transaction.
//! Does not own: commit or retry (see `txn`), feed translation (see `watch`).
//!
//! Invariants:
//! - Every live record has exactly one index entry per `(index, value)` its
//!   item currently produces, and no other entries.
//! - Index entry payloads byte-equal the record payload.
//! - A record and its index entries carry the same lease.

mod read_only;
mod read_write;

#[cfg(test)]
mod tests;

pub use read_only::{Entries, ReadContext, ReadOnlyCollection};
pub use read_write::ReadWriteCollection;

use crate::{
    config::EngineConfig,
    error::InternalError,
    schema::Schema,
    store::{CoordinationStore, KeyValue, Revision},
    txn::Stm,
};
use std::sync::Arc;

///
/// Collection
///
/// A namespace of typed records bound to one coordination store.
/// Cheap to clone; clones share the schema.
///

pub struct Collection<T, S: CoordinationStore> {
    store: Arc<S>,
    schema: Arc<Schema<T>>,
    config: Arc<EngineConfig>,
}

impl<T, S: CoordinationStore> Collection<T, S> {
    #[must_use]
    pub fn new(store: Arc<S>, schema: Schema<T>) -> Self {
        Self {
            store,
            schema: Arc::new(schema),
            config: Arc::new(EngineConfig::default()),
        }
    }

    pub fn with_config(
        store: Arc<S>,
        schema: Schema<T>,
        config: EngineConfig,
    ) -> Result<Self, InternalError> {
        config.validate()?;

        Ok(Self {
            store,
            schema: Arc::new(schema),
            config: Arc::new(config),
        })
    }

    #[must_use]
    pub fn schema(&self) -> &Schema<T> {
        &self.schema
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub const fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// View reading at the store head on every call.
    #[must_use]
    pub fn read_only(&self) -> ReadOnlyCollection<'_, T, S> {
        ReadOnlyCollection::new(self, ReadContext::Head)
    }

    /// View reading at a fixed revision.
    #[must_use]
    pub fn read_only_at(&self, revision: Revision) -> ReadOnlyCollection<'_, T, S> {
        ReadOnlyCollection::new(self, ReadContext::At(revision))
    }

    /// View staging writes into `stm`.
    pub fn read_write<'a>(&'a self, stm: &'a mut Stm<S>) -> ReadWriteCollection<'a, T, S> {
        ReadWriteCollection::new(self, stm)
    }

    // Decode a scanned record or index entry, keyed by the id it belongs to.
    pub(crate) fn decode_entry(&self, id: &str, kv: &KeyValue) -> Result<(String, T), InternalError> {
        let item = self.schema.decode(&kv.value)?;

        Ok((id.to_string(), item))
    }
}

impl<T, S: CoordinationStore> Clone for Collection<T, S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            schema: self.schema.clone(),
            config: self.config.clone(),
        }
    }
}
