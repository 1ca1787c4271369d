use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    cmp::Ordering,
    collections::BTreeMap,
    sync::LazyLock,
    time::{SystemTime, UNIX_EPOCH},
};

///
/// EventState
/// Ephemeral, in-memory counters for transactions, collections and watchers.
///

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct EventState {
    pub ops: EventOps,
    pub collections: BTreeMap<String, CollectionCounters>,
    pub window_start_ms: u64,
}

impl Default for EventState {
    fn default() -> Self {
        Self {
            ops: EventOps::default(),
            collections: BTreeMap::new(),
            window_start_ms: now_millis(),
        }
    }
}

///
/// EventOps
///

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct EventOps {
    // Transaction engine
    pub txn_commits: u64,
    pub txn_conflicts: u64,
    pub txn_aborts: u64,
    pub txn_attempts: u64,
    pub committed_ops: u64,

    // Writes
    pub puts: u64,
    pub noop_puts: u64,
    pub deletes: u64,

    // Reads
    pub rows_scanned: u64,

    // Index maintenance
    pub index_inserts: u64,
    pub index_removes: u64,

    // Watchers
    pub watches_opened: u64,
    pub watch_events: u64,
    pub watch_errors: u64,
}

///
/// CollectionCounters
///

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct CollectionCounters {
    pub puts: u64,
    pub noop_puts: u64,
    pub deletes: u64,
    pub scans: u64,
    pub rows_scanned: u64,
    pub index_inserts: u64,
    pub index_removes: u64,
    pub watches_opened: u64,
    pub watch_events: u64,
    pub watch_errors: u64,
}

// Shared by every task in the process; records arrive from watcher tasks
// as well as from transaction bodies.
static EVENT_STATE: LazyLock<Mutex<EventState>> =
    LazyLock::new(|| Mutex::new(EventState::default()));

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| {
            u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
        })
}

/// Borrow metrics immutably.
pub(crate) fn with_state<R>(f: impl FnOnce(&EventState) -> R) -> R {
    f(&EVENT_STATE.lock())
}

/// Borrow metrics mutably.
pub(crate) fn with_state_mut<R>(f: impl FnOnce(&mut EventState) -> R) -> R {
    f(&mut EVENT_STATE.lock())
}

/// Reset all counters and open a new window.
pub(crate) fn reset_all() {
    with_state_mut(|m| *m = EventState::default());
}

/// Counters for one collection namespace, created on first use.
pub(crate) fn collection<'a>(m: &'a mut EventState, namespace: &str) -> &'a mut CollectionCounters {
    m.collections.entry(namespace.to_string()).or_default()
}

///
/// EventReport
///

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct EventReport {
    /// Ephemeral runtime counters since `window_start_ms`.
    pub counters: Option<EventState>,

    /// Per-collection counters and averages.
    pub collection_counters: Vec<CollectionSummary>,
}

///
/// CollectionSummary
///

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct CollectionSummary {
    pub namespace: String,
    pub puts: u64,
    pub noop_puts: u64,
    pub deletes: u64,
    pub scans: u64,
    pub rows_scanned: u64,
    pub avg_rows_per_scan: f64,
    pub index_inserts: u64,
    pub index_removes: u64,
    pub watch_events: u64,
    pub watch_errors: u64,
}

/// Build a report from the in-memory counters.
///
/// When `window_start_ms` is later than the current window's start the
/// counters are considered stale and the report is empty.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub(crate) fn report_window_start(window_start_ms: Option<u64>) -> EventReport {
    let snap = with_state(Clone::clone);
    if let Some(requested) = window_start_ms
        && requested > snap.window_start_ms
    {
        return EventReport::default();
    }

    let mut collection_counters: Vec<CollectionSummary> = snap
        .collections
        .iter()
        .map(|(namespace, c)| CollectionSummary {
            namespace: namespace.clone(),
            puts: c.puts,
            noop_puts: c.noop_puts,
            deletes: c.deletes,
            scans: c.scans,
            rows_scanned: c.rows_scanned,
            avg_rows_per_scan: if c.scans > 0 {
                c.rows_scanned as f64 / c.scans as f64
            } else {
                0.0
            },
            index_inserts: c.index_inserts,
            index_removes: c.index_removes,
            watch_events: c.watch_events,
            watch_errors: c.watch_errors,
        })
        .collect();

    collection_counters.sort_by(|a, b| {
        match b
            .avg_rows_per_scan
            .partial_cmp(&a.avg_rows_per_scan)
            .unwrap_or(Ordering::Equal)
        {
            Ordering::Equal => match b.rows_scanned.cmp(&a.rows_scanned) {
                Ordering::Equal => a.namespace.cmp(&b.namespace),
                other => other,
            },
            other => other,
        }
    });

    EventReport {
        counters: Some(snap),
        collection_counters,
    }
}

///
/// TESTS
///
