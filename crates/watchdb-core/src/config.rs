use crate::{MAX_PAYLOAD_BYTES, error::InternalError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

///
/// EngineConfig
///
/// Runtime tunables for transactions and watchers. Every field has a default,
/// so partial documents deserialize.
///

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Upper bound on commit attempts per transaction; `None` retries until
    /// success, a non-conflict error, or cancellation.
    pub max_commit_attempts: Option<u32>,

    /// Initial delay before re-running a conflicted body (0 = immediate).
    pub retry_backoff_ms: u64,

    /// Cap for the doubling backoff.
    pub retry_backoff_max_ms: u64,

    /// Whole-transaction deadline, retries included.
    pub txn_timeout_ms: Option<u64>,

    /// Capacity of each watcher's event channel.
    pub watch_buffer: usize,

    /// Largest encoded item a write may stage.
    pub max_payload_bytes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_commit_attempts: None,
            retry_backoff_ms: 0,
            retry_backoff_max_ms: 250,
            txn_timeout_ms: None,
            watch_buffer: 128,
            max_payload_bytes: MAX_PAYLOAD_BYTES,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), InternalError> {
        if self.max_commit_attempts == Some(0) {
            return Err(InternalError::engine_config(
                "max_commit_attempts must be at least 1",
            ));
        }
        if self.watch_buffer == 0 {
            return Err(InternalError::engine_config("watch_buffer must be non-zero"));
        }
        if self.max_payload_bytes == 0 {
            return Err(InternalError::engine_config(
                "max_payload_bytes must be non-zero",
            ));
        }
        if self.max_payload_bytes > MAX_PAYLOAD_BYTES {
            return Err(InternalError::engine_config(format!(
                "max_payload_bytes ({}) exceeds the decode limit of {MAX_PAYLOAD_BYTES} bytes",
                self.max_payload_bytes
            )));
        }
        if self.retry_backoff_ms > self.retry_backoff_max_ms {
            return Err(InternalError::engine_config(format!(
                "retry_backoff_ms ({}) exceeds retry_backoff_max_ms ({})",
                self.retry_backoff_ms, self.retry_backoff_max_ms
            )));
        }
        if self.txn_timeout_ms == Some(0) {
            return Err(InternalError::engine_config("txn_timeout_ms must be non-zero"));
        }

        Ok(())
    }

    /// Delay before attempt `attempt + 1`, doubling per conflict.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Option<Duration> {
        if self.retry_backoff_ms == 0 {
            return None;
        }
        let shift = attempt.saturating_sub(1).min(16);
        let millis = self
            .retry_backoff_ms
            .saturating_mul(1u64 << shift)
            .min(self.retry_backoff_max_ms);

        Some(Duration::from_millis(millis))
    }

    #[must_use]
    pub const fn txn_timeout(&self) -> Option<Duration> {
        match self.txn_timeout_ms {
            Some(ms) => Some(Duration::from_millis(ms)),
            None => None,
        }
    }
}
