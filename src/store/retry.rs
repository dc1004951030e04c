//! Bounded exponential backoff shared by every `ObjectStore` backend.
//!
//! Mirrors the retrier/backoff pattern the wider example pack uses for its
//! own object stores, simplified for a synchronous engine: no futures, just
//! a closure retried in place with `std::thread::sleep` between attempts.

use std::time::Duration;

use log::warn;

use crate::error::BackupError;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, initial_delay_secs: u64) -> Self {
        Self {
            attempts,
            initial_delay: Duration::from_secs(initial_delay_secs),
        }
    }
}

/// Runs `op` up to `policy.attempts + 1` times (the first try plus
/// `attempts` retries), doubling the delay after each transient failure.
/// `op` distinguishes transient from permanent failures by the
/// `BackupError` variant it returns; a permanent failure (or a transient one
/// with no retries left) is returned as `StoragePermanent`.
pub fn with_retry<T>(
    policy: &RetryPolicy,
    op_name: &str,
    mut op: impl FnMut() -> Result<T, BackupError>,
) -> Result<T, BackupError> {
    let mut delay = policy.initial_delay;
    let mut last_err = None;

    for attempt in 0..=policy.attempts {
        match op() {
            Ok(value) => return Ok(value),
            Err(BackupError::StorageTransient(msg)) => {
                if attempt == policy.attempts {
                    return Err(BackupError::StoragePermanent(format!(
                        "{op_name}: exhausted {} retries: {msg}",
                        policy.attempts
                    )));
                }
                warn!("{op_name}: transient error (attempt {}/{}): {msg}", attempt + 1, policy.attempts + 1);
                std::thread::sleep(delay);
                delay *= 2;
                last_err = Some(msg);
            }
            Err(other) => return Err(other),
        }
    }

    Err(BackupError::StoragePermanent(format!(
        "{op_name}: retries exhausted: {}",
        last_err.unwrap_or_default()
    )))
}
