//! Core runtime for watchdb: typed collections with secondary indexes,
//! optimistic transactions, and change-feed watchers layered over a
//! linearizable coordination store.
#![warn(unreachable_pub)]

// public exports are one module level down
pub mod collection;
pub mod config;
pub mod error;
pub mod obs;
pub mod schema;
pub mod serialize;
pub mod store;
pub mod txn;
pub mod watch;

// test
#[cfg(test)]
pub(crate) mod test_support;

///
/// CONSTANTS
///

/// Marker segment separating a collection's records from its index entries.
///
/// Ids beginning with this marker are rejected so that a namespace scan can
/// tell the two key families apart.
pub const INDEX_MARKER: &str = "__index_";

/// Separator between key segments (namespace, index value, record id).
pub const KEY_SEPARATOR: char = '/';

/// Upper bound on a single encoded item.
///
/// Enforced on decode by the CBOR layer and on write by the transaction view.
pub const MAX_PAYLOAD_BYTES: usize = 1024 * 1024;

///
/// Prelude
///
/// Prelude contains only domain vocabulary.
/// No stores, serializers, or helpers are re-exported here.
///

pub mod prelude {
    pub use crate::{
        collection::{Collection, ReadOnlyCollection, ReadWriteCollection},
        error::InternalError,
        schema::{Index, IndexValue, Schema},
        txn::{Stm, TxnEngine},
        watch::{Event, Watcher},
    };
}
