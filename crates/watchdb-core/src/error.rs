use crate::store::CoordinationError;
use std::fmt;
use thiserror::Error as ThisError;

///
/// InternalError
///
/// Structured runtime error with a stable internal classification.
/// Callers branch on `class`; `message` is for humans only.
///

#[derive(Debug, ThisError)]
#[error("{message}")]
pub struct InternalError {
    pub class: ErrorClass,
    pub origin: ErrorOrigin,
    pub message: String,

    /// Optional structured error detail.
    /// The variant (if present) must correspond to `origin`.
    pub detail: Option<ErrorDetail>,
}

impl InternalError {
    /// Construct an InternalError without structured detail.
    pub fn new(class: ErrorClass, origin: ErrorOrigin, message: impl Into<String>) -> Self {
        Self {
            class,
            origin,
            message: message.into(),
            detail: None,
        }
    }

    /// A record (or the lease backing it) does not exist.
    pub fn not_found(key: impl Into<String>) -> Self {
        let key = key.into();

        Self {
            class: ErrorClass::NotFound,
            origin: ErrorOrigin::Store,
            message: format!("key not found: {key}"),
            detail: Some(ErrorDetail::Store(StoreError::NotFound { key })),
        }
    }

    /// A create found the record already present.
    pub fn already_exists(key: impl Into<String>) -> Self {
        let key = key.into();

        Self {
            class: ErrorClass::AlreadyExists,
            origin: ErrorOrigin::Store,
            message: format!("key already exists: {key}"),
            detail: Some(ErrorDetail::Store(StoreError::AlreadyExists { key })),
        }
    }

    /// Commit-time conflict. Only escapes the engine when the attempt bound is hit.
    pub(crate) fn txn_conflict(attempts: u32) -> Self {
        Self::new(
            ErrorClass::Conflict,
            ErrorOrigin::Txn,
            format!("transaction conflicted on every attempt ({attempts} attempts)"),
        )
    }

    /// Construct a transaction-origin cancellation error.
    pub(crate) fn txn_cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Cancelled, ErrorOrigin::Txn, message)
    }

    /// Construct a schema-origin configuration error.
    pub(crate) fn schema_config(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Configuration, ErrorOrigin::Schema, message)
    }

    /// Construct a config-origin configuration error.
    pub(crate) fn engine_config(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Configuration, ErrorOrigin::Config, message)
    }

    /// Construct a serialize-origin internal error.
    pub(crate) fn serialize_internal(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Internal, ErrorOrigin::Serialize, message)
    }

    /// Construct a serialize-origin corruption error.
    pub(crate) fn serialize_corruption(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Corruption, ErrorOrigin::Serialize, message)
    }

    /// Construct a store-origin availability error.
    pub(crate) fn store_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Unavailable, ErrorOrigin::Store, message)
    }

    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self.class, ErrorClass::NotFound)
    }

    #[must_use]
    pub const fn is_already_exists(&self) -> bool {
        matches!(self.class, ErrorClass::AlreadyExists)
    }

    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self.class, ErrorClass::Conflict)
    }

    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self.class, ErrorClass::Cancelled)
    }

    #[must_use]
    pub fn display_with_class(&self) -> String {
        format!("{}:{}: {}", self.origin, self.class, self.message)
    }
}

impl From<CoordinationError> for InternalError {
    fn from(err: CoordinationError) -> Self {
        let class = match err {
            CoordinationError::LeaseNotFound(_) => ErrorClass::NotFound,
            CoordinationError::InvalidTtl(_) => ErrorClass::Configuration,
            CoordinationError::Unavailable(_)
            | CoordinationError::Compacted { .. }
            | CoordinationError::FutureRevision { .. } => ErrorClass::Unavailable,
        };

        Self {
            class,
            origin: ErrorOrigin::Store,
            message: err.to_string(),
            detail: Some(ErrorDetail::Coordination(err)),
        }
    }
}

///
/// ErrorDetail
///
/// Structured, origin-specific error detail carried by [`InternalError`].
///

#[derive(Debug, ThisError)]
pub enum ErrorDetail {
    #[error("{0}")]
    Store(StoreError),

    #[error("{0}")]
    Coordination(CoordinationError),
}

///
/// StoreError
///
/// Record-level structured error detail.
/// Never returned directly; always wrapped in [`ErrorDetail::Store`].
///

#[derive(Debug, ThisError)]
pub enum StoreError {
    #[error("key not found: {key}")]
    NotFound { key: String },

    #[error("key already exists: {key}")]
    AlreadyExists { key: String },
}

///
/// ErrorClass
/// Internal error taxonomy for runtime classification.
///

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorClass {
    Corruption,
    NotFound,
    AlreadyExists,
    Internal,
    Conflict,
    Unavailable,
    Configuration,
    Cancelled,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Corruption => "corruption",
            Self::NotFound => "not_found",
            Self::AlreadyExists => "already_exists",
            Self::Internal => "internal",
            Self::Conflict => "conflict",
            Self::Unavailable => "unavailable",
            Self::Configuration => "configuration",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{label}")
    }
}

///
/// ErrorOrigin
/// Internal origin taxonomy for runtime classification.
///

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorOrigin {
    Serialize,
    Store,
    Schema,
    Txn,
    Watch,
    Config,
}

impl fmt::Display for ErrorOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Serialize => "serialize",
            Self::Store => "store",
            Self::Schema => "schema",
            Self::Txn => "txn",
            Self::Watch => "watch",
            Self::Config => "config",
        };
        write!(f, "{label}")
    }
}
