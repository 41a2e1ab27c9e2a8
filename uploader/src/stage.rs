//! This module provides the staging executor: uploading one chunk as one block, with bounded retries.

use std::time::Duration;

use bytes::Bytes;
use rand::Rng;

use crate::backend::BlockBackend;
use crate::{BlockId, Error};

/// Attempts made to stage a block before giving up.
pub const MAX_ATTEMPTS: u32 = 5;
/// Delay before the first retry, doubled on each subsequent one.
pub const BASE_DELAY: Duration = Duration::from_secs(1);
/// Backoff cap, jitter excluded.
pub const MAX_DELAY: Duration = Duration::from_secs(30);
/// Upper bound of the random jitter added to every delay.
pub const MAX_JITTER: Duration = Duration::from_secs(1);

/// Exponential backoff policy with random jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    max_jitter: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            base_delay: BASE_DELAY,
            max_delay: MAX_DELAY,
            max_jitter: MAX_JITTER,
        }
    }
}

impl Backoff {
    /// Set the total number of attempts, including the first one (at least 1).
    #[inline]
    pub fn with_max_attempts(self, max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..self
        }
    }

    #[inline]
    pub fn with_delays(self, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            ..self
        }
    }

    #[inline]
    pub fn with_max_jitter(self, max_jitter: Duration) -> Self {
        Self { max_jitter, ..self }
    }

    #[inline]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Return the delay to wait after the `attempt`-th (1-based) failed attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let delay = self.base_delay.saturating_mul(1 << exp).min(self.max_delay);

        delay + self.jitter()
    }

    fn jitter(&self) -> Duration {
        let max = u64::try_from(self.max_jitter.as_millis()).unwrap_or(u64::MAX);

        match max {
            0 => Duration::ZERO,
            _ => Duration::from_millis(rand::thread_rng().gen_range(0..=max)),
        }
    }
}

/// A successfully staged block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedBlock {
    pub id: BlockId,
    pub index: u64,
    pub size: u64,
}

/// Outcome of staging a chunk.
pub type StageResult = Result<StagedBlock, Error>;

/// Stage `data` as the block of sequence `index` of object `key`.
///
/// Transient failures are retried in a loop, sleeping between attempts as told by `backoff`.
/// Only once every attempt failed is the last backend error returned, as an [`Error::Stage`].
pub(crate) async fn stage<B: BlockBackend>(
    backend: &B,
    backoff: &Backoff,
    key: &str,
    index: u64,
    data: Bytes,
) -> Result<StagedBlock, Error> {
    let id = BlockId::new(index)?;
    let size = data.len() as u64;

    let mut attempt = 0;

    loop {
        attempt += 1;

        match backend.stage_block(key, &id, data.clone()).await {
            Ok(()) => {
                tracing::trace!("Staged chunk #{index} as block {id} ({size} bytes, attempt {attempt})");

                return Ok(StagedBlock { id, index, size });
            }
            Err(source) if attempt >= backoff.max_attempts => {
                tracing::warn!("Giving up staging chunk #{index} after {attempt} attempts: {source}");

                return Err(Error::Stage {
                    index,
                    attempts: attempt,
                    source,
                });
            }
            Err(e) => {
                let delay = backoff.delay_for_attempt(attempt);

                tracing::debug!("Staging chunk #{index} failed (attempt {attempt}), retrying in {delay:?}: {e}");

                tokio::time::sleep(delay).await;
            }
        }
    }
}
