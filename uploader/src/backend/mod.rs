//! Block storage backends.
//!
//! A backend only has to provide two primitives on a named object: staging an uncommitted block of bytes
//! under a [`BlockId`], and committing an ordered list of staged blocks as the object's final content.

use std::future::Future;

use bytes::Bytes;
use thiserror::Error;
use url::Url;

use crate::BlockId;

pub mod azure;
pub mod memory;

pub use azure::{AuthMode, AzureBackend};
pub use memory::MemoryBackend;

/// Backend transport errors.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),
    #[error(transparent)]
    Url(#[from] url::ParseError),
    /// No bearer token could be obtained for a delegated credential.
    #[error("token request failed: {0}")]
    Token(#[source] Box<dyn std::error::Error + Send + Sync>),
    /// The backend understood the request but refused it.
    #[error("rejected by backend: {0}")]
    Rejected(String),
}

/// Block storage backend interface.
pub trait BlockBackend: Send + Sync + 'static {
    /// Initialize the client and its credentials.
    ///
    /// Called once, lazily, before the first block is staged. Backends without any setup can rely on the default.
    fn connect(&self) -> impl Future<Output = Result<(), Error>> + Send {
        async { Ok(()) }
    }

    /// Stage `data` as an uncommitted block `id` of object `key`.
    fn stage_block(&self, key: &str, id: &BlockId, data: Bytes) -> impl Future<Output = Result<(), Error>> + Send;

    /// Commit `ids`, in this order, as the content of object `key` and return its durable address.
    fn commit_block_list(&self, key: &str, ids: &[BlockId]) -> impl Future<Output = Result<Url, Error>> + Send;
}
