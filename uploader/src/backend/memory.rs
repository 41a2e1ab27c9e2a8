use std::collections::HashMap;
use std::sync::RwLock;

use bytes::{Bytes, BytesMut};
use url::Url;

use super::{BlockBackend, Error};
use crate::BlockId;

/// An in-memory block backend.
///
/// Staged blocks are kept per object until committed, at which point they are concatenated in commit order and
/// every uncommitted leftover of the object is discarded.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    staged: RwLock<HashMap<String, HashMap<BlockId, Bytes>>>,
    objects: RwLock<HashMap<String, Bytes>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the committed content of object `key`.
    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.objects.read().unwrap_or_else(|e| e.into_inner()).get(key).cloned()
    }

    /// Return the number of uncommitted blocks staged for object `key`.
    pub fn staged_count(&self, key: &str) -> usize {
        self.staged.read().unwrap_or_else(|e| e.into_inner()).get(key).map_or(0, HashMap::len)
    }
}

impl BlockBackend for MemoryBackend {
    async fn stage_block(&self, key: &str, id: &BlockId, data: Bytes) -> Result<(), Error> {
        tracing::trace!("Staging block {id} of `{key}` in memory ({} bytes)", data.len());

        self.staged
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(key.to_owned())
            .or_default()
            .insert(id.clone(), data);

        Ok(())
    }

    async fn commit_block_list(&self, key: &str, ids: &[BlockId]) -> Result<Url, Error> {
        let address = Url::parse(&format!("memory:///{key}"))?;

        let mut staged = self.staged.write().unwrap_or_else(|e| e.into_inner());
        let blocks = staged.get(key).ok_or_else(|| Error::Rejected(format!("no block staged for `{key}`")))?;

        let mut content = BytesMut::new();
        for id in ids {
            let block = blocks.get(id).ok_or_else(|| Error::Rejected(format!("block {id} not staged for `{key}`")))?;
            content.extend_from_slice(block);
        }

        staged.remove(key);
        drop(staged);

        self.objects.write().unwrap_or_else(|e| e.into_inner()).insert(key.to_owned(), content.freeze());

        Ok(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(index: u64) -> BlockId {
        BlockId::new(index).unwrap()
    }

    #[tokio::test]
    async fn test_commit_in_list_order() {
        let backend = MemoryBackend::new();

        backend.stage_block("obj", &id(1), Bytes::from_static(b"world")).await.unwrap();
        backend.stage_block("obj", &id(0), Bytes::from_static(b"hello ")).await.unwrap();
        assert_eq!(backend.staged_count("obj"), 2);

        let address = backend.commit_block_list("obj", &[id(0), id(1)]).await.unwrap();

        assert_eq!(address.as_str(), "memory:///obj");
        assert_eq!(backend.object("obj").as_deref(), Some(&b"hello world"[..]));
        assert_eq!(backend.staged_count("obj"), 0);
    }

    #[tokio::test]
    async fn test_commit_unknown_block() {
        let backend = MemoryBackend::new();

        backend.stage_block("obj", &id(0), Bytes::from_static(b"data")).await.unwrap();

        let result = backend.commit_block_list("obj", &[id(0), id(1)]).await;

        assert!(matches!(result, Err(Error::Rejected(_))));
        assert!(backend.object("obj").is_none());
        assert_eq!(backend.staged_count("obj"), 1);
    }

    #[tokio::test]
    async fn test_commit_nothing_staged() {
        let backend = MemoryBackend::new();

        assert!(matches!(backend.commit_block_list("obj", &[]).await, Err(Error::Rejected(_))));
    }
}
