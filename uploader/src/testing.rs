//! Test doubles.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use url::Url;

use crate::backend::{BlockBackend, Error, MemoryBackend};
use crate::BlockId;

const ALWAYS: u32 = u32::MAX;

/// A memory backend injecting failures and latencies per block index, and recording what it has been asked.
#[derive(Debug, Default)]
pub(crate) struct FlakyBackend {
    inner: MemoryBackend,
    failures: Mutex<HashMap<u64, u32>>,
    delays: HashMap<u64, Duration>,
    attempts: Mutex<HashMap<u64, u32>>,
    completed: Mutex<Vec<u64>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    connect_failures: AtomicU32,
    connect_delay: Option<Duration>,
    connects: AtomicU32,
    commit_failures: AtomicU32,
    commit_delay: Option<Duration>,
    commits: Mutex<Vec<Vec<BlockId>>>,
}

impl FlakyBackend {
    /// Fail the first `times` attempts to stage block `index`.
    pub fn fail_times(mut self, index: u64, times: u32) -> Self {
        self.failures.get_mut().unwrap().insert(index, times);
        self
    }

    /// Fail every attempt to stage block `index`.
    pub fn fail_always(self, index: u64) -> Self {
        self.fail_times(index, ALWAYS)
    }

    /// Wait `delay` in every attempt to stage block `index`.
    pub fn delay(mut self, index: u64, delay: Duration) -> Self {
        self.delays.insert(index, delay);
        self
    }

    pub fn fail_connect(self, times: u32) -> Self {
        self.connect_failures.store(times, Ordering::SeqCst);
        self
    }

    pub fn fail_commit(self, times: u32) -> Self {
        self.commit_failures.store(times, Ordering::SeqCst);
        self
    }

    pub fn delay_connect(self, delay: Duration) -> Self {
        Self {
            connect_delay: Some(delay),
            ..self
        }
    }

    pub fn delay_commit(self, delay: Duration) -> Self {
        Self {
            commit_delay: Some(delay),
            ..self
        }
    }

    pub fn attempts(&self, index: u64) -> u32 {
        self.attempts.lock().unwrap().get(&index).copied().unwrap_or_default()
    }

    pub fn total_attempts(&self) -> u32 {
        self.attempts.lock().unwrap().values().sum()
    }

    /// Indexes of the successfully staged blocks, in completion order.
    pub fn completed(&self) -> Vec<u64> {
        self.completed.lock().unwrap().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn commits(&self) -> Vec<Vec<BlockId>> {
        self.commits.lock().unwrap().clone()
    }

    pub fn inner(&self) -> &MemoryBackend {
        &self.inner
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok()
    }
}

impl BlockBackend for FlakyBackend {
    async fn connect(&self) -> Result<(), Error> {
        self.connects.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.connect_delay {
            tokio::time::sleep(delay).await;
        }

        if Self::take_failure(&self.connect_failures) {
            return Err(Error::Rejected("injected connect failure".to_owned()));
        }

        Ok(())
    }

    async fn stage_block(&self, key: &str, id: &BlockId, data: Bytes) -> Result<(), Error> {
        let index = id.index();

        *self.attempts.lock().unwrap().entry(index).or_default() += 1;

        let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);

        if let Some(&delay) = self.delays.get(&index) {
            tokio::time::sleep(delay).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let fail = match self.failures.lock().unwrap().get_mut(&index) {
            Some(&mut ALWAYS) => true,
            Some(times) if *times > 0 => {
                *times -= 1;
                true
            }
            _ => false,
        };

        if fail {
            return Err(Error::Rejected(format!("injected failure for block {id}")));
        }

        self.inner.stage_block(key, id, data).await?;
        self.completed.lock().unwrap().push(index);

        Ok(())
    }

    async fn commit_block_list(&self, key: &str, ids: &[BlockId]) -> Result<Url, Error> {
        self.commits.lock().unwrap().push(ids.to_vec());

        if let Some(delay) = self.commit_delay {
            tokio::time::sleep(delay).await;
        }

        if Self::take_failure(&self.commit_failures) {
            return Err(Error::Rejected("injected commit failure".to_owned()));
        }

        self.inner.commit_block_list(key, ids).await
    }
}
