use std::collections::VecDeque;
use std::num::NonZeroU8;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{oneshot, OnceCell};
use url::Url;

use super::*;
use crate::backend::BlockBackend;
use crate::pump::Pump;
use crate::stage::{self, StagedBlock};
use crate::{BlockId, Error, StateError};

/// Interval at which `finalize` checks whether pending chunks have drained.
pub const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A chunk waiting for a staging slot.
#[derive(Debug)]
struct Pending {
    index: u64,
    data: Bytes,
    reply: oneshot::Sender<StageResult>,
}

/// Mutable upload state, only ever touched under the session lock.
#[derive(Debug)]
struct State {
    phase: Phase,
    /// Index assigned to the next enqueued chunk.
    next_index: u64,
    /// Chunks waiting for a slot, in index order.
    pending: VecDeque<Pending>,
    /// Number of chunks picked by a slot and not settled yet.
    in_flight: usize,
    /// Successfully staged blocks, in completion order.
    staged: Vec<StagedBlock>,
    /// Sum of the sizes of `staged`.
    uploaded_bytes: u64,
}

impl State {
    /// Move from one of `from` phases to `to`, return whether it happened.
    fn transition(&mut self, from: &[Phase], to: Phase) -> bool {
        let allowed = from.contains(&self.phase);
        if allowed {
            self.phase = to;
        }
        allowed
    }
}

/// State shared between the session and its staging slots.
#[derive(Debug)]
struct Shared<B> {
    backend: B,
    key: String,
    backoff: Backoff,
    notifier: Notifier,
    state: Mutex<State>,
}

impl<B: BlockBackend> Shared<B> {
    #[inline]
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Stage the chunk at the front of the pending queue, if any.
    ///
    /// Every enqueued chunk pushes exactly one such dispatch to the pump, so pending chunks are taken in index order.
    async fn stage_next(self: Arc<Self>) {
        let next = {
            let mut state = self.state();

            match state.phase {
                Phase::Aborted | Phase::Halted { .. } => None,
                _ => {
                    let next = state.pending.pop_front();
                    if next.is_some() {
                        state.in_flight += 1;
                    }
                    next
                }
            }
        };

        let Some(Pending { index, data, reply }) = next else {
            tracing::trace!("No pending chunk left to stage for `{}`", self.key);
            return;
        };

        let result = stage::stage(&self.backend, &self.backoff, &self.key, index, data).await;

        let (uploaded_bytes, discarded) = {
            let mut state = self.state();
            state.in_flight -= 1;

            match result {
                Ok(ref block) => {
                    state.staged.push(block.clone());
                    state.uploaded_bytes += block.size;

                    (state.uploaded_bytes, VecDeque::new())
                }
                Err(_) => {
                    let halted = Phase::Halted { index };

                    if state.transition(&[Phase::Active, Phase::Finalizing], halted) {
                        tracing::warn!("Halting upload of `{}`: chunk #{index} failed permanently", self.key);
                    }

                    (state.uploaded_bytes, std::mem::take(&mut state.pending))
                }
            }
        };

        match result {
            Ok(_) => self.notifier.progress(uploaded_bytes),
            Err(ref e) => self.notifier.error(e),
        }

        for pending in discarded {
            let _ = pending.reply.send(Err(Error::Halted { index }));
        }

        // the ticket may have been dropped
        let _ = reply.send(result);
    }
}

/// A single-use upload of a stream of chunks as one destination object.
///
/// Chunks are assigned gapless sequence indexes in enqueue order and staged in the background by at most
/// `max_concurrency` simultaneous stage operations. They may complete in any order, but they are always committed
/// in index order.
///
/// # Example
/// ```
/// # tokio_test::block_on(async {
/// use uploader::{backend::MemoryBackend, Destination, SessionConfig, UploadSession};
///
/// let destination = Destination::new("u1", "video").with_revision(2).with_extension("mp4");
/// let session = UploadSession::new(SessionConfig::new(destination), MemoryBackend::new()).unwrap();
///
/// session.enqueue("hello ".into()).await.unwrap();
/// session.enqueue("world".into()).await.unwrap();
///
/// let address = session.finalize().await.unwrap();
///
/// assert_eq!(address.as_str(), "memory:///u1_video_2.mp4");
/// assert_eq!(session.uploaded_bytes(), 11);
/// # })
/// ```
#[derive(Debug)]
pub struct UploadSession<B> {
    shared: Arc<Shared<B>>,
    max_concurrency: NonZeroU8,
    /// Started along with the backend connection, on first enqueue.
    pump: OnceCell<Pump>,
}

impl<B: BlockBackend> UploadSession<B> {
    /// Create a new upload session.
    ///
    /// Naming is validated right away, before any network activity.
    pub fn new(config: SessionConfig, backend: B) -> Result<Self, Error> {
        let SessionConfig {
            destination,
            max_concurrency,
            backoff,
            notifier,
        } = config;

        let key = destination.key()?;

        tracing::debug!("New upload session for `{key}` ({max_concurrency} concurrent stages)");

        Ok(Self {
            shared: Arc::new(Shared {
                backend,
                key,
                backoff,
                notifier,
                state: Mutex::new(State {
                    phase: Phase::Uninitialized,
                    next_index: 0,
                    pending: VecDeque::new(),
                    in_flight: 0,
                    staged: Vec::new(),
                    uploaded_bytes: 0,
                }),
            }),
            max_concurrency,
            pump: OnceCell::new(),
        })
    }

    /// Enqueue the next chunk.
    ///
    /// The backend is connected on first call. When it cannot be, the error callback is invoked and the chunk is not
    /// queued, the next call tries again.
    ///
    /// The returned [`Staging`] ticket resolves once the chunk is staged or has failed permanently, in which case the
    /// whole session is halted.
    pub async fn enqueue(&self, chunk: Bytes) -> Result<Staging, Error> {
        self.shared.state().phase.accepting()?;

        if chunk.is_empty() {
            return Err(StateError::EmptyChunk.into());
        }

        let pump = self.pump().await?;

        let (reply, receiver) = oneshot::channel();

        let index = {
            let mut state = self.shared.state();

            // might have been aborted while connecting
            state.phase.accepting()?;

            let index = state.next_index;
            BlockId::new(index)?;

            state.next_index += 1;
            state.pending.push_back(Pending {
                index,
                data: chunk,
                reply,
            });

            index
        };

        tracing::trace!("Enqueued chunk #{index} for `{}`", self.shared.key);

        let shared = Arc::clone(&self.shared);
        pump.dispatch(shared.stage_next());

        Ok(Staging {
            index,
            reply: receiver,
        })
    }

    /// Connect the backend and start the pump, once.
    async fn pump(&self) -> Result<&Pump, Error> {
        self.pump
            .get_or_try_init(|| async {
                self.shared.state().transition(&[Phase::Uninitialized], Phase::Initializing);

                tracing::debug!("Connecting backend for `{}`...", self.shared.key);

                match self.shared.backend.connect().await {
                    Ok(()) => {
                        // aborted while connecting
                        if !self.shared.state().transition(&[Phase::Initializing], Phase::Active) {
                            return Err(StateError::Aborted.into());
                        }

                        Ok(Pump::start(&self.shared.key, self.max_concurrency))
                    }
                    Err(source) => {
                        self.shared.state().transition(&[Phase::Initializing], Phase::Uninitialized);

                        let e = Error::Connect(source);
                        self.shared.notifier.error(&e);

                        Err(e)
                    }
                }
            })
            .await
    }

    /// Wait for every enqueued chunk to be staged, then commit them in index order as the destination object.
    ///
    /// Return the durable address of the object, also passed to the completion callback.
    ///
    /// When nothing was staged or the backend rejects the commit, the session is left active: more chunks can be
    /// enqueued and `finalize` can be called again.
    pub async fn finalize(&self) -> Result<Url, Error> {
        {
            let mut state = self.shared.state();

            match state.phase {
                Phase::Active => state.phase = Phase::Finalizing,
                Phase::Uninitialized | Phase::Initializing => return Err(StateError::Uninitialized.into()),
                Phase::Finalizing | Phase::Committing => return Err(StateError::Finalizing.into()),
                Phase::Committed => return Err(StateError::AlreadyCommitted.into()),
                Phase::Aborted => return Err(StateError::Aborted.into()),
                Phase::Halted { index } => return Err(Error::Halted { index }),
            }
        }

        let mut blocks = loop {
            {
                let mut state = self.shared.state();

                match state.phase {
                    Phase::Finalizing if state.in_flight == 0 && state.pending.is_empty() => {
                        if state.staged.is_empty() {
                            state.phase = Phase::Active;
                            return Err(StateError::NothingStaged.into());
                        }

                        state.phase = Phase::Committing;
                        break state.staged.clone();
                    }
                    Phase::Finalizing => {}
                    Phase::Halted { index } => return Err(Error::Halted { index }),
                    // nothing but an abort moves away from finalizing meanwhile
                    _ => return Err(StateError::Aborted.into()),
                }
            }

            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        };

        blocks.sort_unstable_by_key(|block| block.index);
        let ids: Vec<_> = blocks.into_iter().map(|block| block.id).collect();

        tracing::debug!("Committing {} blocks as `{}`...", ids.len(), self.shared.key);

        match self.shared.backend.commit_block_list(&self.shared.key, &ids).await {
            Ok(address) => {
                self.shared.state().transition(&[Phase::Committing], Phase::Committed);

                if let Some(pump) = self.pump.get() {
                    pump.stop().await;
                }

                tracing::debug!("Committed `{}`: {address}", self.shared.key);

                self.shared.notifier.complete(&address);

                Ok(address)
            }
            Err(source) => {
                self.shared.state().transition(&[Phase::Committing], Phase::Active);

                Err(Error::Commit {
                    blocks: ids.len(),
                    source,
                })
            }
        }
    }

    /// Stop accepting chunks and discard those not dispatched yet.
    ///
    /// Stage operations already running are left to settle. Blocks already staged are not removed from the backend,
    /// which is expected to expire uncommitted blocks on its own.
    ///
    /// Has no effect once the block list commit has been requested.
    pub fn abort(&self) {
        let discarded = {
            let mut state = self.shared.state();

            match state.phase {
                Phase::Committed | Phase::Aborted => return,
                Phase::Committing => {
                    tracing::debug!("Not aborting `{}`: block list commit already in flight", self.shared.key);
                    return;
                }
                _ => {}
            }

            state.phase = Phase::Aborted;
            std::mem::take(&mut state.pending)
        };

        tracing::debug!("Aborted upload of `{}`, {} pending chunks discarded", self.shared.key, discarded.len());

        for pending in discarded {
            let _ = pending.reply.send(Err(StateError::Aborted.into()));
        }

        if let Some(pump) = self.pump.get() {
            pump.close();
        }
    }

    /// Cumulative size of the staged blocks.
    pub fn uploaded_bytes(&self) -> u64 {
        self.shared.state().uploaded_bytes
    }

    pub fn staged_chunks_count(&self) -> usize {
        self.shared.state().staged.len()
    }

    /// Staged blocks, in index order.
    pub fn staged_blocks(&self) -> Vec<StagedBlock> {
        let mut blocks = self.shared.state().staged.clone();
        blocks.sort_unstable_by_key(|block| block.index);
        blocks
    }

    pub fn is_aborted(&self) -> bool {
        self.shared.state().phase == Phase::Aborted
    }

    pub fn phase(&self) -> Phase {
        self.shared.state().phase
    }

    #[inline]
    pub fn destination_key(&self) -> &str {
        &self.shared.key
    }

    #[inline]
    pub fn max_concurrency(&self) -> NonZeroU8 {
        self.max_concurrency
    }

    #[inline]
    pub fn backend(&self) -> &B {
        &self.shared.backend
    }
}
