//! Coordination store capability surface.
//!
//! The collection engine never talks to a concrete backend; it consumes the
//! [`CoordinationStore`] trait: linearizable point/range reads at a chosen
//! revision, an atomic compare-then-write commit, leases, and an ordered
//! change feed per key or key prefix.

pub mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use derive_more::{Display, From, Into};
use thiserror::Error as ThisError;
use tokio::sync::mpsc;
use ulid::Ulid;

///
/// Revision
///
/// Store-wide logical clock. Every successful commit that mutates at least one
/// key advances it by exactly one; every key mutated in that commit carries it.
///

#[derive(
    Clone, Copy, Debug, Default, Display, Eq, From, Hash, Into, Ord, PartialEq, PartialOrd,
)]
pub struct Revision(u64);

impl Revision {
    pub const ZERO: Self = Self(0);

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

///
/// LeaseId
///

#[derive(Clone, Copy, Debug, Display, Eq, From, Hash, Ord, PartialEq, PartialOrd)]
pub struct LeaseId(Ulid);

impl LeaseId {
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }
}

///
/// KeyValue
/// One live key as observed at some revision.
///

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    pub mod_revision: Revision,
    pub lease: Option<LeaseId>,
}

///
/// RangeResponse
///

#[derive(Clone, Debug, Default)]
pub struct RangeResponse {
    /// Entries in ascending key order.
    pub kvs: Vec<KeyValue>,

    /// Revision the range was served at.
    pub revision: Revision,
}

///
/// Compare
///
/// Commit precondition. Both variants fail when the key (or any key under the
/// prefix, including keys deleted since) was modified after `since`.
///

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Compare {
    Unmodified { key: String, since: Revision },
    RangeUnmodified { prefix: String, since: Revision },
}

///
/// TxnOp
///

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TxnOp {
    Put {
        key: String,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    },
    Delete {
        key: String,
    },
    DeleteRange {
        prefix: String,
    },
}

///
/// CommitResponse
///

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CommitResponse {
    /// False when a compare failed; nothing was written.
    pub succeeded: bool,

    /// Store head after the call.
    pub revision: Revision,
}

///
/// WatchTarget
///

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum WatchTarget {
    Key(String),
    Prefix(String),
}

impl WatchTarget {
    #[must_use]
    pub fn matches(&self, key: &str) -> bool {
        match self {
            Self::Key(target) => target == key,
            Self::Prefix(prefix) => key.starts_with(prefix.as_str()),
        }
    }
}

///
/// RawEvent
/// Untyped change-feed notification.
///

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RawEvent {
    Put(KeyValue),
    Delete { key: String, revision: Revision },
}

impl RawEvent {
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::Put(kv) => &kv.key,
            Self::Delete { key, .. } => key,
        }
    }

    #[must_use]
    pub const fn revision(&self) -> Revision {
        match self {
            Self::Put(kv) => kv.mod_revision,
            Self::Delete { revision, .. } => *revision,
        }
    }
}

/// Change feed for one subscription. Dropping the receiver releases it.
pub type RawWatchStream = mpsc::UnboundedReceiver<Result<RawEvent, CoordinationError>>;

///
/// CoordinationError
/// Failures reported by the coordination store itself.
///

#[derive(Debug, ThisError)]
pub enum CoordinationError {
    #[error("coordination store unavailable: {0}")]
    Unavailable(String),

    #[error("revision {requested} has been compacted (compacted through {compacted})")]
    Compacted {
        requested: Revision,
        compacted: Revision,
    },

    #[error("revision {requested} is ahead of the store head {head}")]
    FutureRevision { requested: Revision, head: Revision },

    #[error("lease {0} not found")]
    LeaseNotFound(LeaseId),

    #[error("invalid lease ttl: {0}s")]
    InvalidTtl(i64),
}

///
/// CoordinationStore
///
/// Linearizable key-value capability consumed by collections. Implementations
/// must serve ranges in ascending key order and deliver change-feed events in
/// commit order.
///

#[async_trait]
pub trait CoordinationStore: Send + Sync + 'static {
    /// Current head revision.
    async fn head(&self) -> Result<Revision, CoordinationError>;

    /// Point read at `at` (or the head when `None`).
    async fn get(
        &self,
        key: &str,
        at: Option<Revision>,
    ) -> Result<Option<KeyValue>, CoordinationError>;

    /// Prefix scan at `at` (or the head when `None`).
    async fn range(
        &self,
        prefix: &str,
        at: Option<Revision>,
    ) -> Result<RangeResponse, CoordinationError>;

    /// Apply `ops` atomically iff every compare holds.
    async fn commit(
        &self,
        compares: Vec<Compare>,
        ops: Vec<TxnOp>,
    ) -> Result<CommitResponse, CoordinationError>;

    async fn grant_lease(&self, ttl_secs: i64) -> Result<LeaseId, CoordinationError>;

    /// Revoke a lease, deleting every key attached to it.
    async fn revoke_lease(&self, lease: LeaseId) -> Result<(), CoordinationError>;

    /// Whole seconds remaining, or `None` when the lease is gone.
    async fn lease_ttl(&self, lease: LeaseId) -> Result<Option<i64>, CoordinationError>;

    /// Subscribe to changes on `target` with revision `>= from`.
    async fn watch(
        &self,
        target: WatchTarget,
        from: Revision,
    ) -> Result<RawWatchStream, CoordinationError>;
}
