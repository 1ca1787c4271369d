use crate::{
    collection::{Collection, Entries},
    error::{ErrorClass, ErrorOrigin, InternalError},
    obs::sink::{self, MetricsEvent},
    schema::{Index, IndexValue, diff_fragments, key},
    store::{CoordinationStore, LeaseId},
    txn::Stm,
};
use std::collections::BTreeSet;

///
/// LeaseMode
///

#[derive(Clone, Copy, Debug)]
enum LeaseMode {
    /// Keep whatever lease the record already carries.
    Keep,

    /// Attach every written key to this lease.
    Fresh(LeaseId),
}

///
/// ReadWriteCollection
///
/// Stages record and index mutations into one transaction attempt. Reads are
/// served at the attempt's snapshot and see the attempt's own writes.
///

pub struct ReadWriteCollection<'a, T, S: CoordinationStore> {
    collection: &'a Collection<T, S>,
    stm: &'a mut Stm<S>,
}

impl<'a, T, S: CoordinationStore> ReadWriteCollection<'a, T, S> {
    pub(crate) const fn new(collection: &'a Collection<T, S>, stm: &'a mut Stm<S>) -> Self {
        Self { collection, stm }
    }

    pub async fn get(&mut self, id: &str) -> Result<T, InternalError> {
        self.find(id)
            .await?
            .ok_or_else(|| InternalError::not_found(self.collection.schema.keys().primary(id)))
    }

    async fn find(&mut self, id: &str) -> Result<Option<T>, InternalError> {
        key::validate_id(id)?;
        let schema = &self.collection.schema;

        match self.stm.get(&schema.keys().primary(id)).await? {
            Some(entry) => schema.decode(&entry.value).map(Some),
            None => Ok(None),
        }
    }

    /// Store `item` under `id`, keeping any lease the record already has.
    ///
    /// Writing bytes identical to the stored ones stages nothing.
    pub async fn put(&mut self, id: &str, item: &T) -> Result<(), InternalError> {
        self.write(id, item, LeaseMode::Keep).await
    }

    /// Store `item` under `id` on a fresh lease of `ttl_secs`, replacing any
    /// lease the record had.
    pub async fn put_ttl(&mut self, id: &str, item: &T, ttl_secs: i64) -> Result<(), InternalError> {
        if ttl_secs <= 0 {
            return Err(InternalError::new(
                ErrorClass::Configuration,
                ErrorOrigin::Store,
                format!("lease ttl must be positive, got {ttl_secs}s"),
            ));
        }
        let lease = self.stm.grant_lease(ttl_secs).await?;

        self.write(id, item, LeaseMode::Fresh(lease)).await
    }

    /// Store `item` under an id that must not exist yet.
    pub async fn create(&mut self, id: &str, item: &T) -> Result<(), InternalError> {
        let primary = self.collection.schema.keys().primary(id);
        if self.find(id).await?.is_some() {
            return Err(InternalError::already_exists(primary));
        }

        self.write(id, item, LeaseMode::Keep).await
    }

    /// Modify an existing record in place and return the new value.
    pub async fn update(&mut self, id: &str, f: impl FnOnce(&mut T)) -> Result<T, InternalError> {
        let mut item = self.get(id).await?;
        f(&mut item);
        self.write(id, &item, LeaseMode::Keep).await?;

        Ok(item)
    }

    /// Write `f(current)` where `current` is `None` for a missing record.
    pub async fn upsert(
        &mut self,
        id: &str,
        f: impl FnOnce(Option<T>) -> T,
    ) -> Result<T, InternalError> {
        let current = self.find(id).await?;
        let item = f(current);
        self.write(id, &item, LeaseMode::Keep).await?;

        Ok(item)
    }

    async fn write(&mut self, id: &str, item: &T, lease: LeaseMode) -> Result<(), InternalError> {
        let collection = self.collection;
        let schema = &collection.schema;
        let keys = schema.keys();
        schema.check_id(id)?;

        let encoded = schema.encode(item)?;
        let limit = collection.config.max_payload_bytes;
        if encoded.len() > limit {
            return Err(InternalError::new(
                ErrorClass::Configuration,
                ErrorOrigin::Serialize,
                format!(
                    "encoded item '{id}' is {} bytes, above the {limit} byte limit",
                    encoded.len()
                ),
            ));
        }

        let primary = keys.primary(id);
        let previous = self.stm.get(&primary).await?;
        if let Some(prev) = &previous
            && matches!(lease, LeaseMode::Keep)
            && schema.codec().equivalent(&prev.value, &encoded)
        {
            sink::record(MetricsEvent::NoopPut {
                namespace: schema.namespace(),
            });
            return Ok(());
        }

        let old_item = previous
            .as_ref()
            .map(|prev| schema.decode(&prev.value))
            .transpose()?;
        let lease = match lease {
            LeaseMode::Keep => previous.and_then(|prev| prev.lease),
            LeaseMode::Fresh(lease) => Some(lease),
        };

        let (mut inserts, mut removes) = (0u64, 0u64);
        for index in schema.indexes() {
            let old = match &old_item {
                Some(old) => index.fragments(old)?,
                None => BTreeSet::new(),
            };
            let new = index.fragments(item)?;
            let diff = diff_fragments(&old, &new);

            for fragment in &diff.removed {
                self.stm.delete(keys.index_key(index.field(), fragment, id));
            }
            // retained entries are rewritten so their payload tracks the record
            for fragment in diff.added.iter().chain(&diff.retained) {
                self.stm.put(
                    keys.index_key(index.field(), fragment, id),
                    encoded.clone(),
                    lease,
                );
            }

            inserts = inserts.saturating_add(u64::try_from(diff.added.len()).unwrap_or(u64::MAX));
            removes = removes.saturating_add(u64::try_from(diff.removed.len()).unwrap_or(u64::MAX));
        }
        self.stm.put(primary, encoded, lease);

        let namespace = schema.namespace();
        sink::record(MetricsEvent::Put { namespace });
        sink::record(MetricsEvent::IndexDelta {
            namespace,
            inserts,
            removes,
        });

        Ok(())
    }

    /// Remove a record and every index entry it owns.
    pub async fn delete(&mut self, id: &str) -> Result<(), InternalError> {
        let collection = self.collection;
        let schema = &collection.schema;
        let keys = schema.keys();

        let Some(old) = self.find(id).await? else {
            return Err(InternalError::not_found(keys.primary(id)));
        };

        let mut removes = 0u64;
        for index in schema.indexes() {
            for fragment in index.fragments(&old)? {
                self.stm.delete(keys.index_key(index.field(), &fragment, id));
                removes = removes.saturating_add(1);
            }
        }
        self.stm.delete(keys.primary(id));

        let namespace = schema.namespace();
        sink::record(MetricsEvent::Delete { namespace, rows: 1 });
        sink::record(MetricsEvent::IndexDelta {
            namespace,
            inserts: 0,
            removes,
        });

        Ok(())
    }

    /// Remove every record and index entry of the collection.
    pub fn delete_all(&mut self) {
        let namespace = self.collection.schema.namespace();
        self.stm.delete_prefix(namespace.to_string());
    }

    /// Whole seconds until the record expires.
    pub async fn ttl(&mut self, id: &str) -> Result<i64, InternalError> {
        key::validate_id(id)?;
        let primary = self.collection.schema.keys().primary(id);

        let lease = self
            .stm
            .get(&primary)
            .await?
            .and_then(|entry| entry.lease)
            .ok_or_else(|| InternalError::not_found(&primary))?;

        self.stm
            .lease_ttl(lease)
            .await?
            .ok_or_else(|| InternalError::not_found(&primary))
    }

    /// Every record, ascending by id, as seen by this attempt.
    pub async fn list(&mut self) -> Result<Entries<T>, InternalError> {
        let collection = self.collection;
        let keys = collection.schema.keys();

        let kvs = self.stm.range(keys.namespace()).await?;
        let entries = kvs
            .iter()
            .filter_map(|kv| keys.record_id(&kv.key).map(|id| collection.decode_entry(id, kv)))
            .collect();

        Ok(Entries::new(entries))
    }

    /// Records `index` maps to `value`, as seen by this attempt.
    pub async fn get_by_index(
        &mut self,
        index: &Index<T>,
        value: impl Into<IndexValue>,
    ) -> Result<Entries<T>, InternalError> {
        let collection = self.collection;
        let schema = &collection.schema;
        let index = schema.resolve_index(index)?;
        let fragment = value.into().stringify()?;
        let prefix = schema.keys().index_value_prefix(index.field(), &fragment);

        let kvs = self.stm.range(&prefix).await?;
        let entries = kvs
            .iter()
            .filter_map(|kv| {
                key::id_after_prefix(&prefix, &kv.key).map(|id| collection.decode_entry(id, kv))
            })
            .collect();

        Ok(Entries::new(entries))
    }
}
