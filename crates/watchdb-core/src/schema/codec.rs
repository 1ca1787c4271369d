use crate::serialize::{SerializeError, deserialize_bounded, serialize};
use serde::{Serialize, de::DeserializeOwned};
use std::marker::PhantomData;

///
/// ItemCodec
///
/// Binary encoding for the items of one collection. Two encodings that are
/// `equivalent` describe the same item; writes and watchers use this to
/// suppress no-op updates, so an encoding must be deterministic.
///

pub trait ItemCodec<T>: Send + Sync {
    fn encode(&self, item: &T) -> Result<Vec<u8>, SerializeError>;

    fn decode(&self, bytes: &[u8]) -> Result<T, SerializeError>;

    fn equivalent(&self, left: &[u8], right: &[u8]) -> bool {
        left == right
    }
}

///
/// CborCodec
///
/// Default codec. Deterministic for items without hash-ordered maps.
///

pub struct CborCodec<T> {
    max_bytes: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> CborCodec<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self::with_limit(crate::MAX_PAYLOAD_BYTES)
    }

    /// Codec that refuses to decode payloads above `max_bytes`.
    #[must_use]
    pub const fn with_limit(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            _marker: PhantomData,
        }
    }
}

impl<T> Default for CborCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ItemCodec<T> for CborCodec<T>
where
    T: Serialize + DeserializeOwned,
{
    fn encode(&self, item: &T) -> Result<Vec<u8>, SerializeError> {
        serialize(item)
    }

    fn decode(&self, bytes: &[u8]) -> Result<T, SerializeError> {
        deserialize_bounded(bytes, self.max_bytes)
    }
}
