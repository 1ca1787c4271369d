use crate::{
    collection::Collection,
    error::InternalError,
    obs::sink::{self, MetricsEvent},
    schema::{Index, IndexValue, key},
    store::{CoordinationStore, KeyValue, Revision},
    watch::{self, WatchScope, Watcher},
};
use tokio_util::sync::CancellationToken;

///
/// ReadContext
///

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReadContext {
    /// Every call reads at the store head.
    Head,

    /// Every call reads at this revision.
    At(Revision),
}

impl ReadContext {
    const fn revision(self) -> Option<Revision> {
        match self {
            Self::Head => None,
            Self::At(revision) => Some(revision),
        }
    }
}

///
/// Entries
///
/// Eager result of one scan, ascending by id. Entries whose payload failed
/// to decode surface as `Err` items in place.
///

pub struct Entries<T> {
    inner: std::vec::IntoIter<Result<(String, T), InternalError>>,
}

impl<T> Entries<T> {
    pub(crate) fn new(items: Vec<Result<(String, T), InternalError>>) -> Self {
        Self {
            inner: items.into_iter(),
        }
    }

    /// All entries, failing on the first undecodable one.
    pub fn into_vec(self) -> Result<Vec<(String, T)>, InternalError> {
        self.collect()
    }

    /// Ids in scan order, failing on the first undecodable entry.
    pub fn into_ids(self) -> Result<Vec<String>, InternalError> {
        self.map(|entry| entry.map(|(id, _)| id)).collect()
    }
}

impl<T> Iterator for Entries<T> {
    type Item = Result<(String, T), InternalError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl<T> ExactSizeIterator for Entries<T> {}

///
/// ReadOnlyCollection
///

pub struct ReadOnlyCollection<'a, T, S: CoordinationStore> {
    collection: &'a Collection<T, S>,
    context: ReadContext,
    cancel: Option<CancellationToken>,
}

impl<'a, T, S: CoordinationStore> ReadOnlyCollection<'a, T, S> {
    pub(crate) const fn new(collection: &'a Collection<T, S>, context: ReadContext) -> Self {
        Self {
            collection,
            context,
            cancel: None,
        }
    }

    /// Watchers opened from this view also stop when `cancel` fires.
    #[must_use]
    pub fn cancelled_by(mut self, cancel: &CancellationToken) -> Self {
        self.cancel = Some(cancel.clone());
        self
    }

    #[must_use]
    pub const fn context(&self) -> ReadContext {
        self.context
    }

    pub async fn get(&self, id: &str) -> Result<T, InternalError> {
        key::validate_id(id)?;
        let primary = self.collection.schema.keys().primary(id);

        let kv = self
            .collection
            .store
            .get(&primary, self.context.revision())
            .await?
            .ok_or_else(|| InternalError::not_found(&primary))?;

        self.collection.schema.decode(&kv.value)
    }

    /// Records whose `index` currently produces `value`, ascending by id.
    pub async fn get_by_index(
        &self,
        index: &Index<T>,
        value: impl Into<IndexValue>,
    ) -> Result<Entries<T>, InternalError> {
        let schema = &self.collection.schema;
        let index = schema.resolve_index(index)?;
        let fragment = value.into().stringify()?;
        let prefix = schema.keys().index_value_prefix(index.field(), &fragment);

        let kvs = self.scan(&prefix).await?;
        let entries = kvs
            .iter()
            .filter_map(|kv| {
                key::id_after_prefix(&prefix, &kv.key)
                    .map(|id| self.collection.decode_entry(id, kv))
            })
            .collect();

        Ok(Entries::new(entries))
    }

    /// Every record of the collection, ascending by id.
    pub async fn list(&self) -> Result<Entries<T>, InternalError> {
        let keys = self.collection.schema.keys();

        let kvs = self.scan(keys.namespace()).await?;
        let entries = kvs
            .iter()
            .filter_map(|kv| {
                keys.record_id(&kv.key)
                    .map(|id| self.collection.decode_entry(id, kv))
            })
            .collect();

        Ok(Entries::new(entries))
    }

    /// Number of records, without decoding them.
    pub async fn count(&self) -> Result<usize, InternalError> {
        let keys = self.collection.schema.keys();
        let kvs = self.scan(keys.namespace()).await?;

        Ok(kvs
            .iter()
            .filter(|kv| keys.record_id(&kv.key).is_some())
            .count())
    }

    /// Whole seconds until the record expires.
    pub async fn ttl(&self, id: &str) -> Result<i64, InternalError> {
        key::validate_id(id)?;
        let primary = self.collection.schema.keys().primary(id);
        let store = &self.collection.store;

        let lease = store
            .get(&primary, self.context.revision())
            .await?
            .and_then(|kv| kv.lease)
            .ok_or_else(|| InternalError::not_found(&primary))?;

        store
            .lease_ttl(lease)
            .await?
            .ok_or_else(|| InternalError::not_found(&primary))
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<KeyValue>, InternalError> {
        let response = self
            .collection
            .store
            .range(prefix, self.context.revision())
            .await?;
        sink::record(MetricsEvent::RowsScanned {
            namespace: self.collection.schema.namespace(),
            rows: u64::try_from(response.kvs.len()).unwrap_or(u64::MAX),
        });

        Ok(response.kvs)
    }
}

impl<T, S> ReadOnlyCollection<'_, T, S>
where
    T: Send + 'static,
    S: CoordinationStore,
{
    async fn open(&self, scope: WatchScope) -> Result<Watcher<T>, InternalError> {
        watch::open(
            &self.collection.store,
            &self.collection.schema,
            scope,
            self.context.revision(),
            self.collection.config.watch_buffer,
            self.cancel.as_ref(),
        )
        .await
    }

    /// Follow every record of the collection.
    pub async fn watch(&self) -> Result<Watcher<T>, InternalError> {
        self.open(WatchScope::Collection).await
    }

    /// Follow one record.
    pub async fn watch_one(&self, id: &str) -> Result<Watcher<T>, InternalError> {
        key::validate_id(id)?;

        self.open(WatchScope::Record { id: id.to_string() }).await
    }

    /// Follow the records `index` maps to `value`. A record whose value moves
    /// away is reported as a delete.
    pub async fn watch_by_index(
        &self,
        index: &Index<T>,
        value: impl Into<IndexValue>,
    ) -> Result<Watcher<T>, InternalError> {
        let schema = &self.collection.schema;
        let index = schema.resolve_index(index)?;
        let fragment = value.into().stringify()?;
        let prefix = schema.keys().index_value_prefix(index.field(), &fragment);

        self.open(WatchScope::IndexValue { prefix }).await
    }
}
