//! Key-space layout for one collection.
//!
//! | Purpose | Key |
//! |---|---|
//! | record | `namespace + id` |
//! | index entry | `namespace + "__index_" + field + "/" + value + "/" + id` |
//!
//! The namespace is a single segment that always ends in `/`, so no
//! namespace is a key prefix of another. Ids never contain `/`, which makes
//! the id the unambiguous final segment of every key.

use crate::{INDEX_MARKER, KEY_SEPARATOR, error::InternalError};

///
/// KeySpace
///

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct KeySpace {
    namespace: String,
}

impl KeySpace {
    pub(crate) fn new(namespace: &str) -> Result<Self, InternalError> {
        if namespace.is_empty() || namespace == "/" {
            return Err(InternalError::schema_config("collection namespace is empty"));
        }

        // one segment only; `a/` would otherwise be a key prefix of `a/b/`
        let name = namespace.strip_suffix(KEY_SEPARATOR).unwrap_or(namespace);
        if name.contains(KEY_SEPARATOR) || name.starts_with(INDEX_MARKER) {
            return Err(InternalError::schema_config(format!(
                "collection namespace '{namespace}' must be a single segment not starting with '{INDEX_MARKER}'"
            )));
        }

        let mut namespace = name.to_string();
        namespace.push(KEY_SEPARATOR);

        Ok(Self { namespace })
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    #[must_use]
    pub fn primary(&self, id: &str) -> String {
        format!("{}{id}", self.namespace)
    }

    /// Prefix holding every entry of one index.
    #[must_use]
    pub fn index_namespace(&self, field: &str) -> String {
        format!("{}{INDEX_MARKER}{field}{KEY_SEPARATOR}", self.namespace)
    }

    /// Prefix holding the entries of one index value.
    #[must_use]
    pub fn index_value_prefix(&self, field: &str, fragment: &str) -> String {
        format!("{}{fragment}{KEY_SEPARATOR}", self.index_namespace(field))
    }

    #[must_use]
    pub fn index_key(&self, field: &str, fragment: &str, id: &str) -> String {
        format!("{}{id}", self.index_value_prefix(field, fragment))
    }

    /// Id of a record key, or `None` for index entries and foreign keys.
    #[must_use]
    pub fn record_id<'k>(&self, key: &'k str) -> Option<&'k str> {
        let rest = key.strip_prefix(self.namespace.as_str())?;
        if rest.starts_with(INDEX_MARKER) {
            return None;
        }

        final_segment(rest)
    }
}

/// Remainder of `key` after `prefix`, provided it is a single segment.
///
/// An index value `in` must not match the entries of value `in/c1`; the extra
/// separator in the remainder is what tells them apart.
#[must_use]
pub fn id_after_prefix<'k>(prefix: &str, key: &'k str) -> Option<&'k str> {
    final_segment(key.strip_prefix(prefix)?)
}

fn final_segment(rest: &str) -> Option<&str> {
    (!rest.is_empty() && !rest.contains(KEY_SEPARATOR)).then_some(rest)
}

/// Reject ids that would break key segmentation.
pub(crate) fn validate_id(id: &str) -> Result<(), InternalError> {
    if id.is_empty() {
        return Err(InternalError::schema_config("record id is empty"));
    }
    if id.contains(KEY_SEPARATOR) {
        return Err(InternalError::schema_config(format!(
            "record id '{id}' contains the key separator '{KEY_SEPARATOR}'"
        )));
    }
    if id.starts_with(INDEX_MARKER) {
        return Err(InternalError::schema_config(format!(
            "record id '{id}' starts with the reserved marker '{INDEX_MARKER}'"
        )));
    }

    Ok(())
}
