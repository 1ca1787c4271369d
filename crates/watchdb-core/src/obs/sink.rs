//! Metrics sink boundary.
//!
//! Collection, transaction and watch logic MUST NOT touch obs::metrics
//! directly. All instrumentation flows through MetricsEvent and MetricsSink.
//!
//! This module is the only allowed bridge between execution logic
//! and the global metrics state.
use crate::obs::metrics;
use std::{cell::RefCell, sync::Arc};

thread_local! {
    static SINK_OVERRIDE: RefCell<Option<Arc<dyn MetricsSink>>> = const { RefCell::new(None) };
}

///
/// MetricsEvent
///

#[derive(Clone, Copy, Debug)]
pub enum MetricsEvent<'a> {
    TxnCommit {
        attempts: u32,
        ops: u64,
    },
    TxnConflict,
    TxnAbort,
    Put {
        namespace: &'a str,
    },
    NoopPut {
        namespace: &'a str,
    },
    Delete {
        namespace: &'a str,
        rows: u64,
    },
    IndexDelta {
        namespace: &'a str,
        inserts: u64,
        removes: u64,
    },
    RowsScanned {
        namespace: &'a str,
        rows: u64,
    },
    WatchOpened {
        namespace: &'a str,
    },
    WatchEvent {
        namespace: &'a str,
    },
    WatchError {
        namespace: &'a str,
    },
}

///
/// MetricsSink
///

pub trait MetricsSink: Send + Sync {
    fn record(&self, event: MetricsEvent<'_>);
}

/// GlobalMetricsSink
/// Default process-wide sink that writes into global metrics state.
/// Acts as the concrete sink when no scoped override is installed.

pub(crate) struct GlobalMetricsSink;

impl MetricsSink for GlobalMetricsSink {
    fn record(&self, event: MetricsEvent<'_>) {
        metrics::with_state_mut(|m| match event {
            MetricsEvent::TxnCommit { attempts, ops } => {
                m.ops.txn_commits = m.ops.txn_commits.saturating_add(1);
                m.ops.txn_attempts = m.ops.txn_attempts.saturating_add(attempts.into());
                m.ops.committed_ops = m.ops.committed_ops.saturating_add(ops);
            }

            MetricsEvent::TxnConflict => {
                m.ops.txn_conflicts = m.ops.txn_conflicts.saturating_add(1);
            }

            MetricsEvent::TxnAbort => {
                m.ops.txn_aborts = m.ops.txn_aborts.saturating_add(1);
            }

            MetricsEvent::Put { namespace } => {
                m.ops.puts = m.ops.puts.saturating_add(1);
                let entry = metrics::collection(m, namespace);
                entry.puts = entry.puts.saturating_add(1);
            }

            MetricsEvent::NoopPut { namespace } => {
                m.ops.noop_puts = m.ops.noop_puts.saturating_add(1);
                let entry = metrics::collection(m, namespace);
                entry.noop_puts = entry.noop_puts.saturating_add(1);
            }

            MetricsEvent::Delete { namespace, rows } => {
                m.ops.deletes = m.ops.deletes.saturating_add(rows);
                let entry = metrics::collection(m, namespace);
                entry.deletes = entry.deletes.saturating_add(rows);
            }

            MetricsEvent::IndexDelta {
                namespace,
                inserts,
                removes,
            } => {
                m.ops.index_inserts = m.ops.index_inserts.saturating_add(inserts);
                m.ops.index_removes = m.ops.index_removes.saturating_add(removes);
                let entry = metrics::collection(m, namespace);
                entry.index_inserts = entry.index_inserts.saturating_add(inserts);
                entry.index_removes = entry.index_removes.saturating_add(removes);
            }

            MetricsEvent::RowsScanned { namespace, rows } => {
                m.ops.rows_scanned = m.ops.rows_scanned.saturating_add(rows);
                let entry = metrics::collection(m, namespace);
                entry.scans = entry.scans.saturating_add(1);
                entry.rows_scanned = entry.rows_scanned.saturating_add(rows);
            }

            MetricsEvent::WatchOpened { namespace } => {
                m.ops.watches_opened = m.ops.watches_opened.saturating_add(1);
                let entry = metrics::collection(m, namespace);
                entry.watches_opened = entry.watches_opened.saturating_add(1);
            }

            MetricsEvent::WatchEvent { namespace } => {
                m.ops.watch_events = m.ops.watch_events.saturating_add(1);
                let entry = metrics::collection(m, namespace);
                entry.watch_events = entry.watch_events.saturating_add(1);
            }

            MetricsEvent::WatchError { namespace } => {
                m.ops.watch_errors = m.ops.watch_errors.saturating_add(1);
                let entry = metrics::collection(m, namespace);
                entry.watch_errors = entry.watch_errors.saturating_add(1);
            }
        });
    }
}

pub(crate) const GLOBAL_METRICS_SINK: GlobalMetricsSink = GlobalMetricsSink;

pub(crate) fn record(event: MetricsEvent<'_>) {
    let installed = SINK_OVERRIDE.with(|cell| cell.borrow().clone());
    match installed {
        Some(sink) => sink.record(event),
        None => GLOBAL_METRICS_SINK.record(event),
    }
}

/// Snapshot the current metrics state.
///
/// `window_start_ms` filters by window start (`EventState::window_start_ms`),
/// not by per-event timestamps.
#[must_use]
pub fn metrics_report(window_start_ms: Option<u64>) -> metrics::EventReport {
    metrics::report_window_start(window_start_ms)
}

/// Reset all metrics state and open a new window.
pub fn metrics_reset_all() {
    metrics::reset_all();
}

/// Run a closure with a metrics sink override installed on this thread.
///
/// Tasks polled on this thread while `f` runs (for example everything driven
/// by a current-thread runtime's `block_on` inside `f`) record into `sink`.
pub fn with_metrics_sink<T>(sink: Arc<dyn MetricsSink>, f: impl FnOnce() -> T) -> T {
    struct Guard(Option<Arc<dyn MetricsSink>>);

    impl Drop for Guard {
        fn drop(&mut self) {
            let prev = self.0.take();
            SINK_OVERRIDE.with(|cell| {
                *cell.borrow_mut() = prev;
            });
        }
    }

    let prev = SINK_OVERRIDE.with(|cell| cell.borrow_mut().replace(sink));
    let _guard = Guard(prev);

    f()
}

///
/// TESTS
///
