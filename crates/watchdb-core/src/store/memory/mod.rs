//! In-process coordination store.
//!
//! Keeps every key's version history so reads can be served at any retained
//! revision, attaches keys to leases that expire autonomously, and fans change
//! events out to subscribers in commit order.
//!
//! Lease expiry is checked lazily on every call and, when constructed inside a
//! tokio runtime, by a background reaper so watchers observe expiry without
//! other traffic.
//!
//! History older than the retention window is compacted automatically once
//! the floor has moved a full window since the last sweep, so reads and
//! watches may reach back at least `retention` revisions behind the head.


use crate::store::{
    CommitResponse, Compare, CoordinationError, CoordinationStore, KeyValue, LeaseId,
    RangeResponse, RawEvent, RawWatchStream, Revision, TxnOp, WatchTarget,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    ops::Bound,
    sync::Arc,
    time::Duration,
};
use tokio::{sync::mpsc, time::Instant};
use tracing::debug;

const REAP_INTERVAL: Duration = Duration::from_millis(250);

/// Revisions of history `MemoryStore::new` keeps behind the head.
pub const DEFAULT_HISTORY_RETENTION: u64 = 10_000;

///
/// Version
///

#[derive(Clone, Debug)]
struct Version {
    revision: Revision,
    value: Option<Vec<u8>>,
    lease: Option<LeaseId>,
}

///
/// Lease
///

#[derive(Debug)]
struct Lease {
    expires_at: Instant,
    keys: BTreeSet<String>,
}

///
/// Subscriber
///

struct Subscriber {
    target: WatchTarget,
    tx: mpsc::UnboundedSender<Result<RawEvent, CoordinationError>>,
}

///
/// State
///

struct State {
    head: Revision,
    compacted: Revision,
    retention: Option<u64>,
    keys: BTreeMap<String, Vec<Version>>,
    leases: HashMap<LeaseId, Lease>,
    log: Vec<RawEvent>,
    subscribers: Vec<Subscriber>,
}

impl State {
    fn new(retention: Option<u64>) -> Self {
        Self {
            head: Revision::ZERO,
            compacted: Revision::ZERO,
            retention,
            keys: BTreeMap::new(),
            leases: HashMap::new(),
            log: Vec::new(),
            subscribers: Vec::new(),
        }
    }

    fn latest(&self, key: &str) -> Option<&Version> {
        self.keys.get(key).and_then(|versions| versions.last())
    }

    fn prefixed<'a>(
        &'a self,
        prefix: &'a str,
    ) -> impl Iterator<Item = (&'a String, &'a Vec<Version>)> + 'a {
        self.keys
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(move |(key, _)| key.starts_with(prefix))
    }

    fn visible(key: &str, versions: &[Version], at: Revision) -> Option<KeyValue> {
        let version = versions.iter().rev().find(|v| v.revision <= at)?;
        let value = version.value.clone()?;

        Some(KeyValue {
            key: key.to_string(),
            value,
            mod_revision: version.revision,
            lease: version.lease,
        })
    }

    fn read_revision(&self, at: Option<Revision>) -> Result<Revision, CoordinationError> {
        let at = at.unwrap_or(self.head);
        if at > self.head {
            return Err(CoordinationError::FutureRevision {
                requested: at,
                head: self.head,
            });
        }
        if at < self.compacted {
            return Err(CoordinationError::Compacted {
                requested: at,
                compacted: self.compacted,
            });
        }

        Ok(at)
    }

    fn compare_holds(&self, compare: &Compare) -> bool {
        match compare {
            Compare::Unmodified { key, since } => {
                self.latest(key).is_none_or(|v| v.revision <= *since)
            }
            Compare::RangeUnmodified { prefix, since } => self
                .prefixed(prefix)
                .all(|(_, versions)| versions.last().is_none_or(|v| v.revision <= *since)),
        }
    }

    fn is_live(&self, key: &str) -> bool {
        self.latest(key).is_some_and(|v| v.value.is_some())
    }

    // Record one mutation at `revision`, keeping lease membership in step.
    fn write(
        &mut self,
        key: &str,
        value: Option<Vec<u8>>,
        lease: Option<LeaseId>,
        revision: Revision,
    ) {
        if let Some(prev) = self.latest(key).and_then(|v| v.lease)
            && Some(prev) != lease
            && let Some(prev_lease) = self.leases.get_mut(&prev)
        {
            prev_lease.keys.remove(key);
        }
        if let Some(lease) = lease
            && let Some(attached) = self.leases.get_mut(&lease)
        {
            attached.keys.insert(key.to_string());
        }

        let versions = self.keys.entry(key.to_string()).or_default();
        let version = Version {
            revision,
            value,
            lease,
        };
        match versions.last_mut() {
            Some(last) if last.revision == revision => *last = version,
            _ => versions.push(version),
        }
    }

    fn apply(&mut self, ops: Vec<TxnOp>) {
        let revision = self.head.next();
        let mut events = Vec::new();

        for op in ops {
            match op {
                TxnOp::Put { key, value, lease } => {
                    self.write(&key, Some(value.clone()), lease, revision);
                    events.push(RawEvent::Put(KeyValue {
                        key,
                        value,
                        mod_revision: revision,
                        lease,
                    }));
                }
                TxnOp::Delete { key } => {
                    if self.is_live(&key) {
                        self.write(&key, None, None, revision);
                        events.push(RawEvent::Delete { key, revision });
                    }
                }
                TxnOp::DeleteRange { prefix } => {
                    let live: Vec<String> = self
                        .prefixed(&prefix)
                        .filter(|(_, versions)| versions.last().is_some_and(|v| v.value.is_some()))
                        .map(|(key, _)| key.clone())
                        .collect();
                    for key in live {
                        self.write(&key, None, None, revision);
                        events.push(RawEvent::Delete { key, revision });
                    }
                }
            }
        }

        if !events.is_empty() {
            self.head = revision;
            self.publish(events);
            self.compact_retained();
        }
    }

    // Sweep only once the floor has advanced a whole window past the last
    // sweep, keeping compaction cost amortized over the commits.
    fn compact_retained(&mut self) {
        let Some(retention) = self.retention else {
            return;
        };
        let floor = self.head.get().saturating_sub(retention);
        if floor >= self.compacted.get().saturating_add(retention.max(1)) {
            debug!(floor, head = %self.head, "compacting history");
            self.compact(Revision::from(floor));
        }
    }

    fn publish(&mut self, events: Vec<RawEvent>) {
        self.subscribers.retain(|sub| {
            events
                .iter()
                .filter(|event| sub.target.matches(event.key()))
                .all(|event| sub.tx.send(Ok(event.clone())).is_ok())
        });
        self.log.extend(events);
    }

    fn delete_lease_keys(&mut self, lease: Lease) {
        let ops = lease
            .keys
            .into_iter()
            .map(|key| TxnOp::Delete { key })
            .collect();
        self.apply(ops);
    }

    // Expired leases take their keys with them in one revision each.
    fn reap(&mut self, now: Instant) {
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in expired {
            if let Some(lease) = self.leases.remove(&id) {
                debug!(lease = %id, keys = lease.keys.len(), "lease expired");
                self.delete_lease_keys(lease);
            }
        }
    }

    fn compact(&mut self, revision: Revision) {
        let revision = revision.min(self.head);
        if revision <= self.compacted {
            return;
        }
        self.compacted = revision;

        for versions in self.keys.values_mut() {
            let keep_from = versions
                .iter()
                .rposition(|v| v.revision <= revision)
                .unwrap_or(0);
            versions.drain(..keep_from);
        }
        self.keys.retain(|_, versions| {
            !(versions.len() == 1 && versions[0].value.is_none() && versions[0].revision <= revision)
        });
        self.log.retain(|event| event.revision() > revision);
    }
}

///
/// MemoryStore
///

#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    /// Create an empty store keeping [`DEFAULT_HISTORY_RETENTION`] revisions
    /// of history. Inside a tokio runtime a background reaper is spawned; it
    /// exits once the last handle is dropped.
    #[must_use]
    pub fn new() -> Self {
        Self::with_history_retention(Some(DEFAULT_HISTORY_RETENTION))
    }

    /// Create an empty store keeping `retention` revisions of history behind
    /// the head; `None` keeps everything until [`MemoryStore::compact`].
    #[must_use]
    pub fn with_history_retention(retention: Option<u64>) -> Self {
        let store = Self {
            state: Arc::new(Mutex::new(State::new(retention))),
        };
        store.spawn_reaper();

        store
    }

    fn spawn_reaper(&self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let weak = Arc::downgrade(&self.state);

        handle.spawn(async move {
            let mut tick = tokio::time::interval(REAP_INTERVAL);
            loop {
                tick.tick().await;
                let Some(state) = weak.upgrade() else {
                    break;
                };
                state.lock().reap(Instant::now());
            }
        });
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let mut state = self.state.lock();
        state.reap(Instant::now());

        f(&mut state)
    }

    /// Discard history at or below `revision`.
    pub fn compact(&self, revision: Revision) {
        self.with_state(|state| state.compact(revision));
    }

    /// Current compaction floor; reads below it fail with `Compacted`.
    #[must_use]
    pub fn compacted(&self) -> Revision {
        self.with_state(|state| state.compacted)
    }

    /// Number of live change-feed subscriptions.
    #[must_use]
    pub fn watcher_count(&self) -> usize {
        self.with_state(|state| {
            state.subscribers.retain(|sub| !sub.tx.is_closed());
            state.subscribers.len()
        })
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

// Every call yields once so concurrent callers interleave the way they would
// against a remote store.
#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn head(&self) -> Result<Revision, CoordinationError> {
        tokio::task::yield_now().await;

        Ok(self.with_state(|state| state.head))
    }

    async fn get(
        &self,
        key: &str,
        at: Option<Revision>,
    ) -> Result<Option<KeyValue>, CoordinationError> {
        tokio::task::yield_now().await;

        self.with_state(|state| {
            let at = state.read_revision(at)?;

            Ok(state
                .keys
                .get(key)
                .and_then(|versions| State::visible(key, versions, at)))
        })
    }

    async fn range(
        &self,
        prefix: &str,
        at: Option<Revision>,
    ) -> Result<RangeResponse, CoordinationError> {
        tokio::task::yield_now().await;

        self.with_state(|state| {
            let at = state.read_revision(at)?;
            let kvs = state
                .prefixed(prefix)
                .filter_map(|(key, versions)| State::visible(key, versions, at))
                .collect();

            Ok(RangeResponse { kvs, revision: at })
        })
    }

    async fn commit(
        &self,
        compares: Vec<Compare>,
        ops: Vec<TxnOp>,
    ) -> Result<CommitResponse, CoordinationError> {
        tokio::task::yield_now().await;

        self.with_state(|state| {
            if !compares.iter().all(|compare| state.compare_holds(compare)) {
                return Ok(CommitResponse {
                    succeeded: false,
                    revision: state.head,
                });
            }

            for op in &ops {
                if let TxnOp::Put {
                    lease: Some(lease), ..
                } = op
                    && !state.leases.contains_key(lease)
                {
                    return Err(CoordinationError::LeaseNotFound(*lease));
                }
            }

            state.apply(ops);

            Ok(CommitResponse {
                succeeded: true,
                revision: state.head,
            })
        })
    }

    async fn grant_lease(&self, ttl_secs: i64) -> Result<LeaseId, CoordinationError> {
        tokio::task::yield_now().await;

        if ttl_secs <= 0 {
            return Err(CoordinationError::InvalidTtl(ttl_secs));
        }
        let id = LeaseId::generate();
        let lease = Lease {
            expires_at: Instant::now() + Duration::from_secs(ttl_secs.unsigned_abs()),
            keys: BTreeSet::new(),
        };
        self.with_state(|state| state.leases.insert(id, lease));

        Ok(id)
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<(), CoordinationError> {
        tokio::task::yield_now().await;

        self.with_state(|state| {
            let removed = state
                .leases
                .remove(&lease)
                .ok_or(CoordinationError::LeaseNotFound(lease))?;
            state.delete_lease_keys(removed);

            Ok(())
        })
    }

    async fn lease_ttl(&self, lease: LeaseId) -> Result<Option<i64>, CoordinationError> {
        tokio::task::yield_now().await;

        let now = Instant::now();
        Ok(self.with_state(|state| {
            state.leases.get(&lease).map(|lease| {
                let remaining = lease.expires_at.saturating_duration_since(now);
                i64::try_from(remaining.as_millis().div_ceil(1000)).unwrap_or(i64::MAX)
            })
        }))
    }

    async fn watch(
        &self,
        target: WatchTarget,
        from: Revision,
    ) -> Result<RawWatchStream, CoordinationError> {
        tokio::task::yield_now().await;

        self.with_state(|state| {
            if state.compacted > Revision::ZERO && from <= state.compacted {
                return Err(CoordinationError::Compacted {
                    requested: from,
                    compacted: state.compacted,
                });
            }

            let (tx, rx) = mpsc::unbounded_channel();
            for event in &state.log {
                if event.revision() >= from && target.matches(event.key()) {
                    // receiver is held locally, send cannot fail
                    let _ = tx.send(Ok(event.clone()));
                }
            }
            state.subscribers.push(Subscriber { target, tx });

            Ok(rx)
        })
    }
}
