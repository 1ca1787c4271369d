//! Module: txn
//! Responsibility: optimistic multi-key transactions over a coordination store.
//! Does not own: item encoding or index maintenance (see `collection`).
//!
//! Invariants:
//! - Every read is served at the attempt's snapshot revision, overlaid with
//!   the attempt's own staged writes.
//! - A commit carries one `Unmodified` compare per key read or written and one
//!   `RangeUnmodified` compare per range read, all against the snapshot.
//! - A failed, aborted or cancelled attempt leaves no trace in the store.


use crate::{
    config::EngineConfig,
    error::InternalError,
    obs::sink::{self, MetricsEvent},
    store::{Compare, CoordinationStore, KeyValue, LeaseId, Revision, TxnOp},
};
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, BTreeSet},
    ops::Bound,
    sync::Arc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

///
/// Entry
/// A value visible to the transaction, with the lease it is attached to.
///

#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct Entry {
    pub(crate) value: Vec<u8>,
    pub(crate) lease: Option<LeaseId>,
}

///
/// Staged
///

#[derive(Clone, Debug)]
enum Staged {
    Put {
        value: Vec<u8>,
        lease: Option<LeaseId>,
    },
    Delete,
}

///
/// Stm
///
/// Software-transactional view handed to one attempt of a transaction body.
/// Reads go to the store at `snapshot`; writes are buffered until commit.
///

pub struct Stm<S: CoordinationStore> {
    store: Arc<S>,
    snapshot: Revision,
    reads: BTreeSet<String>,
    ranges: BTreeSet<String>,
    writes: BTreeMap<String, Staged>,
    range_deletes: Vec<String>,
    granted: Arc<Mutex<Vec<LeaseId>>>,
}

impl<S: CoordinationStore> Stm<S> {
    fn new(store: Arc<S>, snapshot: Revision, granted: Arc<Mutex<Vec<LeaseId>>>) -> Self {
        Self {
            store,
            snapshot,
            reads: BTreeSet::new(),
            ranges: BTreeSet::new(),
            writes: BTreeMap::new(),
            range_deletes: Vec::new(),
            granted,
        }
    }

    /// Revision every read in this attempt is served at.
    #[must_use]
    pub const fn snapshot(&self) -> Revision {
        self.snapshot
    }

    fn range_deleted(&self, key: &str) -> bool {
        self.range_deletes
            .iter()
            .any(|prefix| key.starts_with(prefix.as_str()))
    }

    /// Point read with read-your-writes.
    pub(crate) async fn get(&mut self, key: &str) -> Result<Option<Entry>, InternalError> {
        match self.writes.get(key) {
            Some(Staged::Put { value, lease }) => {
                return Ok(Some(Entry {
                    value: value.clone(),
                    lease: *lease,
                }));
            }
            Some(Staged::Delete) => return Ok(None),
            None => {}
        }
        if self.range_deleted(key) {
            return Ok(None);
        }

        self.reads.insert(key.to_string());
        let kv = self.store.get(key, Some(self.snapshot)).await?;

        Ok(kv.map(|kv| Entry {
            value: kv.value,
            lease: kv.lease,
        }))
    }

    /// Prefix read with read-your-writes, ascending by key.
    pub(crate) async fn range(&mut self, prefix: &str) -> Result<Vec<KeyValue>, InternalError> {
        self.ranges.insert(prefix.to_string());
        let response = self.store.range(prefix, Some(self.snapshot)).await?;

        let mut merged: BTreeMap<String, KeyValue> = response
            .kvs
            .into_iter()
            .filter(|kv| !self.range_deleted(&kv.key))
            .map(|kv| (kv.key.clone(), kv))
            .collect();

        for (key, staged) in self
            .writes
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(prefix))
        {
            match staged {
                Staged::Put { value, lease } => {
                    merged.insert(
                        key.clone(),
                        KeyValue {
                            key: key.clone(),
                            value: value.clone(),
                            mod_revision: self.snapshot,
                            lease: *lease,
                        },
                    );
                }
                Staged::Delete => {
                    merged.remove(key);
                }
            }
        }

        Ok(merged.into_values().collect())
    }

    pub(crate) fn put(&mut self, key: String, value: Vec<u8>, lease: Option<LeaseId>) {
        self.writes.insert(key, Staged::Put { value, lease });
    }

    pub(crate) fn delete(&mut self, key: String) {
        self.writes.insert(key, Staged::Delete);
    }

    /// Stage removal of every key under `prefix`. Writes staged earlier under
    /// the prefix are discarded; later ones apply on top.
    pub(crate) fn delete_prefix(&mut self, prefix: String) {
        self.writes.retain(|key, _| !key.starts_with(prefix.as_str()));
        self.range_deletes.push(prefix);
    }

    /// Grant a lease owned by this attempt. It is revoked if the attempt does
    /// not commit.
    pub(crate) async fn grant_lease(&mut self, ttl_secs: i64) -> Result<LeaseId, InternalError> {
        let lease = self.store.grant_lease(ttl_secs).await?;
        self.granted.lock().push(lease);

        Ok(lease)
    }

    pub(crate) async fn lease_ttl(&self, lease: LeaseId) -> Result<Option<i64>, InternalError> {
        Ok(self.store.lease_ttl(lease).await?)
    }

    fn into_commit(self) -> (Vec<Compare>, Vec<TxnOp>) {
        let since = self.snapshot;

        let touched: BTreeSet<&String> = self.reads.iter().chain(self.writes.keys()).collect();
        let mut compares: Vec<Compare> = touched
            .into_iter()
            .map(|key| Compare::Unmodified {
                key: key.clone(),
                since,
            })
            .collect();
        compares.extend(
            self.ranges
                .into_iter()
                .map(|prefix| Compare::RangeUnmodified { prefix, since }),
        );

        let mut ops: Vec<TxnOp> = self
            .range_deletes
            .into_iter()
            .map(|prefix| TxnOp::DeleteRange { prefix })
            .collect();
        ops.extend(self.writes.into_iter().map(|(key, staged)| match staged {
            Staged::Put { value, lease } => TxnOp::Put { key, value, lease },
            Staged::Delete => TxnOp::Delete { key },
        }));

        (compares, ops)
    }
}

// Revoke leases granted by an attempt that will never commit.
async fn revoke_granted<S: CoordinationStore>(store: &S, granted: &Mutex<Vec<LeaseId>>) {
    let leases = std::mem::take(&mut *granted.lock());
    for lease in leases {
        if let Err(err) = store.revoke_lease(lease).await {
            warn!(%lease, error = %err, "failed to revoke lease of an abandoned attempt");
        }
    }
}

async fn attempt_loop<S, R, F>(
    store: &Arc<S>,
    config: &EngineConfig,
    granted: &Arc<Mutex<Vec<LeaseId>>>,
    body: &mut F,
) -> Result<R, InternalError>
where
    S: CoordinationStore,
    F: AsyncFnMut(&mut Stm<S>) -> Result<R, InternalError>,
{
    let mut attempt: u32 = 0;

    loop {
        attempt = attempt.saturating_add(1);
        let snapshot = store.head().await?;
        let mut stm = Stm::new(store.clone(), snapshot, granted.clone());

        let value = match body(&mut stm).await {
            Ok(value) => value,
            Err(err) => {
                revoke_granted(store.as_ref(), granted).await;
                sink::record(MetricsEvent::TxnAbort);
                return Err(err);
            }
        };

        let (compares, ops) = stm.into_commit();
        if ops.is_empty() {
            revoke_granted(store.as_ref(), granted).await;
            return Ok(value);
        }
        let op_count = u64::try_from(ops.len()).unwrap_or(u64::MAX);

        // Leases ride with the commit from here; an interrupted commit leaves
        // them to expire on their own.
        let in_flight = std::mem::take(&mut *granted.lock());
        let response = store.commit(compares, ops).await?;

        if response.succeeded {
            debug!(attempt, %snapshot, revision = %response.revision, "transaction committed");
            sink::record(MetricsEvent::TxnCommit {
                attempts: attempt,
                ops: op_count,
            });
            return Ok(value);
        }

        granted.lock().extend(in_flight);
        revoke_granted(store.as_ref(), granted).await;
        sink::record(MetricsEvent::TxnConflict);

        if let Some(max) = config.max_commit_attempts
            && attempt >= max
        {
            debug!(attempt, "transaction gave up after conflicts");
            return Err(InternalError::txn_conflict(attempt));
        }

        debug!(attempt, %snapshot, head = %response.revision, "transaction conflicted; retrying");
        if let Some(delay) = config.backoff(attempt) {
            tokio::time::sleep(delay).await;
        }
    }
}

/// Run `body` until it commits without conflict.
///
/// The body may run several times and must confine its effects to the
/// operations it stages on the [`Stm`]. A body error aborts the transaction
/// with nothing written. Cancelling `cancel` (or hitting the configured
/// timeout) abandons the in-flight attempt and returns a cancellation error.
pub async fn run_transaction<S, R, F>(
    store: &Arc<S>,
    config: &EngineConfig,
    cancel: &CancellationToken,
    mut body: F,
) -> Result<R, InternalError>
where
    S: CoordinationStore,
    F: AsyncFnMut(&mut Stm<S>) -> Result<R, InternalError>,
{
    let granted = Arc::new(Mutex::new(Vec::new()));
    let work = attempt_loop(store, config, &granted, &mut body);

    let result = match config.txn_timeout() {
        Some(limit) => tokio::select! {
            biased;
            () = cancel.cancelled() => Err(InternalError::txn_cancelled("transaction cancelled")),
            timed = tokio::time::timeout(limit, work) => timed.unwrap_or_else(|_| {
                Err(InternalError::txn_cancelled(format!(
                    "transaction timed out after {}ms",
                    limit.as_millis()
                )))
            }),
        },
        None => tokio::select! {
            biased;
            () = cancel.cancelled() => Err(InternalError::txn_cancelled("transaction cancelled")),
            result = work => result,
        },
    };

    if let Err(err) = &result
        && err.is_cancelled()
    {
        debug!(error = %err, "transaction abandoned");
        revoke_granted(store.as_ref(), &granted).await;
        sink::record(MetricsEvent::TxnAbort);
    }

    result
}

/// Run `body` once against a fresh snapshot and discard its staged writes.
pub async fn run_dryrun<S, R, F>(store: &Arc<S>, mut body: F) -> Result<R, InternalError>
where
    S: CoordinationStore,
    F: AsyncFnMut(&mut Stm<S>) -> Result<R, InternalError>,
{
    let granted = Arc::new(Mutex::new(Vec::new()));
    let snapshot = store.head().await?;
    let mut stm = Stm::new(store.clone(), snapshot, granted.clone());

    let result = body(&mut stm).await;
    revoke_granted(store.as_ref(), &granted).await;

    result
}

///
/// TxnEngine
///
/// Handle bundling a store with engine configuration.
///

pub struct TxnEngine<S: CoordinationStore> {
    store: Arc<S>,
    config: Arc<EngineConfig>,
}

impl<S: CoordinationStore> TxnEngine<S> {
    #[must_use]
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            config: Arc::new(EngineConfig::default()),
        }
    }

    pub fn with_config(store: Arc<S>, config: EngineConfig) -> Result<Self, InternalError> {
        config.validate()?;

        Ok(Self {
            store,
            config: Arc::new(config),
        })
    }

    #[must_use]
    pub const fn store(&self) -> &Arc<S> {
        &self.store
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub async fn run<R, F>(&self, body: F) -> Result<R, InternalError>
    where
        F: AsyncFnMut(&mut Stm<S>) -> Result<R, InternalError>,
    {
        run_transaction(&self.store, &self.config, &CancellationToken::new(), body).await
    }

    pub async fn run_cancellable<R, F>(
        &self,
        cancel: &CancellationToken,
        body: F,
    ) -> Result<R, InternalError>
    where
        F: AsyncFnMut(&mut Stm<S>) -> Result<R, InternalError>,
    {
        run_transaction(&self.store, &self.config, cancel, body).await
    }

    pub async fn dryrun<R, F>(&self, body: F) -> Result<R, InternalError>
    where
        F: AsyncFnMut(&mut Stm<S>) -> Result<R, InternalError>,
    {
        run_dryrun(&self.store, body).await
    }
}

impl<S: CoordinationStore> Clone for TxnEngine<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            config: self.config.clone(),
        }
    }
}
