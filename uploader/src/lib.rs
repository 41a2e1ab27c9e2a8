//! A resumable chunked upload client.
//!
//! A generic, robust and efficient crate uploading a stream of byte chunks to a block storage backend as a single
//! named object:
//! - every chunk is assigned a gapless sequence index and staged as an uncommitted block,
//! - a bounded number of stage operations run concurrently in the background,
//! - transient failures are retried with exponential backoff and jitter,
//! - the final block list is committed in index order, whatever order blocks completed in.
//!
//! Callers push chunks as they produce them and never wait for a block to be staged unless they want to, through the
//! [`Staging`] ticket returned for each chunk. Progress, permanent failures and completion are also reported through
//! the optional callbacks of a [`Notifier`].
//!
//! As a **strong hypothesis**, we can assume that:
//! - one [`UploadSession`] uploads exactly one object and is then discarded;
//! - uncommitted blocks left behind by an aborted or halted session are garbage collected by the backend itself.
//!
//! Here is the lifecycle of an upload session:
//!
//! ```text
//!     enqueue(chunk)         stage_next()                          finalize()
//!           |                      |                                   |
//!           v                      v                                   v
//!     +-----------+  dispatch  +------+  stage_block (retried)  +-------------+  commit_block_list
//!     |  pending  | ---------> | pump | ----------------------> |   staged    | -------------------> object
//!     |  (FIFO)   |            | (N)  |                         | (any order) |   (index order)
//!     +-----------+            +------+                         +-------------+
//! ```
//!
//! The destination object key is derived from caller inputs as `{identity}_{category}_{revision}.{extension}`, and
//! block identifiers are fixed-width zero-padded sequence indexes so that lexicographic order equals index order.
//!
//! Two backends are provided: [`backend::AzureBackend`], talking to Azure Blob Storage either through a pre-signed
//! container URL or a delegated service principal, and [`backend::MemoryBackend`], keeping everything in memory.

pub mod backend;
mod block;
mod error;
mod notify;
pub mod pump;
mod session;
mod stage;
#[cfg(test)]
mod testing;

pub use block::{BlockId, INDEX_WIDTH, MAX_INDEX};
pub use error::{ConfigError, Error, StateError};
pub use notify::{CompleteCallback, ErrorCallback, Notifier, ProgressCallback};
pub use session::*;
pub use stage::{Backoff, StageResult, StagedBlock, BASE_DELAY, MAX_ATTEMPTS, MAX_DELAY, MAX_JITTER};
