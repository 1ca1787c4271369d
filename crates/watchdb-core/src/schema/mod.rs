//! Module: schema
//! Responsibility: immutable description of one collection (namespace, item
//! codec, index definitions) and the index key function.
//! Does not own: reads, writes, or watches; those live in `collection`.
//!
//! Invariants:
//! - Index field names are non-empty, unique, and free of `/`.
//! - `IndexValue::stringify` is deterministic and never emits a fragment that
//!   could be confused with a different value plus a trailing id.

mod codec;
pub mod key;


pub use codec::{CborCodec, ItemCodec};
pub use key::KeySpace;

use crate::{KEY_SEPARATOR, error::InternalError};
use serde::{Serialize, de::DeserializeOwned};
use std::{collections::BTreeSet, fmt, sync::Arc};

///
/// IndexValue
///
/// Supported indexed field shapes. Structured references (for example a
/// `(repo, commit)` pair) convert into `Path`, which renders as its components
/// joined by `/`.
///

#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum IndexValue {
    Bool(bool),
    Int(i64),
    Uint(u64),
    Text(String),
    Path(Vec<String>),
}

impl IndexValue {
    pub fn path<I, P>(parts: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        Self::Path(parts.into_iter().map(Into::into).collect())
    }

    /// Canonical key fragment for this value.
    pub fn stringify(&self) -> Result<String, InternalError> {
        match self {
            Self::Bool(value) => Ok(value.to_string()),
            Self::Int(value) => Ok(value.to_string()),
            Self::Uint(value) => Ok(value.to_string()),
            Self::Text(text) => {
                if text.contains(KEY_SEPARATOR) {
                    return Err(InternalError::schema_config(format!(
                        "text index value '{text}' contains '{KEY_SEPARATOR}'; use a path value"
                    )));
                }

                Ok(text.clone())
            }
            Self::Path(parts) => {
                if parts.is_empty() {
                    return Err(InternalError::schema_config("path index value has no components"));
                }
                if let Some(bad) = parts
                    .iter()
                    .find(|part| part.is_empty() || part.contains(KEY_SEPARATOR))
                {
                    return Err(InternalError::schema_config(format!(
                        "path index component '{bad}' is empty or contains '{KEY_SEPARATOR}'"
                    )));
                }

                Ok(parts.join("/"))
            }
        }
    }
}

impl From<bool> for IndexValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for IndexValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for IndexValue {
    fn from(value: i32) -> Self {
        Self::Int(value.into())
    }
}

impl From<u64> for IndexValue {
    fn from(value: u64) -> Self {
        Self::Uint(value)
    }
}

impl From<u32> for IndexValue {
    fn from(value: u32) -> Self {
        Self::Uint(value.into())
    }
}

impl From<&str> for IndexValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for IndexValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&String> for IndexValue {
    fn from(value: &String) -> Self {
        Self::Text(value.clone())
    }
}

///
/// Extractor
///

enum Extractor<T> {
    Single(fn(&T) -> Option<IndexValue>),
    Multi(fn(&T) -> Vec<IndexValue>),
}

impl<T> Clone for Extractor<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Extractor<T> {}

///
/// Index
///
/// A secondary index over one field. Single-valued indexes map an item to at
/// most one value; multi-valued indexes map it to a set.
///

pub struct Index<T> {
    field: &'static str,
    extractor: Extractor<T>,
}

impl<T> Index<T> {
    #[must_use]
    pub const fn single(field: &'static str, extract: fn(&T) -> Option<IndexValue>) -> Self {
        Self {
            field,
            extractor: Extractor::Single(extract),
        }
    }

    #[must_use]
    pub const fn multi(field: &'static str, extract: fn(&T) -> Vec<IndexValue>) -> Self {
        Self {
            field,
            extractor: Extractor::Multi(extract),
        }
    }

    #[must_use]
    pub const fn field(&self) -> &'static str {
        self.field
    }

    #[must_use]
    pub const fn is_multi(&self) -> bool {
        matches!(self.extractor, Extractor::Multi(_))
    }

    /// Deduplicated key fragments the item currently maps to.
    pub fn fragments(&self, item: &T) -> Result<BTreeSet<String>, InternalError> {
        match self.extractor {
            Extractor::Single(extract) => extract(item)
                .map(|value| value.stringify())
                .into_iter()
                .collect(),
            Extractor::Multi(extract) => extract(item)
                .iter()
                .map(IndexValue::stringify)
                .collect(),
        }
    }
}

impl<T> Clone for Index<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Index<T> {}

impl<T> fmt::Debug for Index<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Index")
            .field("field", &self.field)
            .field("multi", &self.is_multi())
            .finish()
    }
}

impl<T> fmt::Display for Index<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_multi() {
            write!(f, "MULTI {}", self.field)
        } else {
            write!(f, "{}", self.field)
        }
    }
}

///
/// IndexDiff
/// Fragment-level delta between the previous and the new item.
///

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct IndexDiff {
    pub removed: Vec<String>,
    pub added: Vec<String>,
    pub retained: Vec<String>,
}

#[must_use]
pub fn diff_fragments(old: &BTreeSet<String>, new: &BTreeSet<String>) -> IndexDiff {
    IndexDiff {
        removed: old.difference(new).cloned().collect(),
        added: new.difference(old).cloned().collect(),
        retained: old.intersection(new).cloned().collect(),
    }
}

type KeyCheck = Arc<dyn Fn(&str) -> Result<(), String> + Send + Sync>;

///
/// Schema
///
/// Immutable once built. Cheap to share behind an `Arc`.
///

pub struct Schema<T> {
    keys: KeySpace,
    indexes: Vec<Index<T>>,
    codec: Arc<dyn ItemCodec<T>>,
    key_check: Option<KeyCheck>,
}

impl<T: 'static> Schema<T> {
    pub fn new(
        namespace: &str,
        indexes: Vec<Index<T>>,
        codec: impl ItemCodec<T> + 'static,
    ) -> Result<Self, InternalError> {
        let keys = KeySpace::new(namespace)?;

        let mut seen = BTreeSet::new();
        for index in &indexes {
            let field = index.field();
            if field.is_empty() || field.contains(KEY_SEPARATOR) {
                return Err(InternalError::schema_config(format!(
                    "index field '{field}' is empty or contains '{KEY_SEPARATOR}'"
                )));
            }
            if !seen.insert(field) {
                return Err(InternalError::schema_config(format!(
                    "index field '{field}' is declared twice"
                )));
            }
        }

        Ok(Self {
            keys,
            indexes,
            codec: Arc::new(codec),
            key_check: None,
        })
    }

    /// Schema using the default CBOR codec.
    pub fn cbor(namespace: &str, indexes: Vec<Index<T>>) -> Result<Self, InternalError>
    where
        T: Serialize + DeserializeOwned,
    {
        Self::new(namespace, indexes, CborCodec::new())
    }
}

impl<T> Schema<T> {
    /// Run `check` against every id written through this schema.
    #[must_use]
    pub fn with_key_check(
        mut self,
        check: impl Fn(&str) -> Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        self.key_check = Some(Arc::new(check));
        self
    }

    #[must_use]
    pub const fn keys(&self) -> &KeySpace {
        &self.keys
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        self.keys.namespace()
    }

    #[must_use]
    pub fn indexes(&self) -> &[Index<T>] {
        &self.indexes
    }

    #[must_use]
    pub fn index(&self, field: &str) -> Option<&Index<T>> {
        self.indexes.iter().find(|index| index.field() == field)
    }

    #[must_use]
    pub fn codec(&self) -> &dyn ItemCodec<T> {
        self.codec.as_ref()
    }

    /// Ensure `index` is one of this schema's indexes.
    pub(crate) fn resolve_index(&self, index: &Index<T>) -> Result<&Index<T>, InternalError> {
        self.index(index.field()).ok_or_else(|| {
            InternalError::schema_config(format!(
                "index '{}' is not registered on collection '{}'",
                index.field(),
                self.namespace()
            ))
        })
    }

    pub(crate) fn check_id(&self, id: &str) -> Result<(), InternalError> {
        key::validate_id(id)?;

        if let Some(check) = &self.key_check {
            check(id).map_err(|reason| {
                InternalError::schema_config(format!("record id '{id}' rejected: {reason}"))
            })?;
        }

        Ok(())
    }

    pub(crate) fn encode(&self, item: &T) -> Result<Vec<u8>, InternalError> {
        Ok(self.codec.encode(item)?)
    }

    pub(crate) fn decode(&self, bytes: &[u8]) -> Result<T, InternalError> {
        Ok(self.codec.decode(bytes)?)
    }
}
