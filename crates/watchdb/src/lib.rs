//! ## Crate layout
//! - `core`: collections, schemas, transactions, watchers, and observability.
//! - `store`: the coordination store contract and the in-memory store.
//!
//! The `prelude` module mirrors the surface application code needs to
//! declare a collection, run transactions against it, and watch it.

pub use watchdb_core as core;
pub use watchdb_core::store;

/// re-exports
///
/// saves callers from naming the cancellation crate in their own Cargo.toml
pub mod __reexports {
    pub use tokio_util;
}

//
// Consts
//

/// Workspace version re-export for downstream tooling/tests.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Error type surfaced by every fallible operation.
pub type Error = watchdb_core::error::InternalError;

///
/// Prelude
///

pub mod prelude {
    pub use crate::core::{
        collection::{
            Collection, Entries, ReadContext, ReadOnlyCollection, ReadWriteCollection,
        },
        config::EngineConfig,
        error::{ErrorClass, ErrorOrigin, InternalError},
        obs::{MetricsEvent, MetricsSink, metrics_report, with_metrics_sink},
        schema::{Index, IndexValue, Schema},
        store::{CoordinationStore, MemoryStore, Revision},
        txn::{Stm, TxnEngine},
        watch::{Event, Watcher},
    };
    pub use tokio_util::sync::CancellationToken;
}
