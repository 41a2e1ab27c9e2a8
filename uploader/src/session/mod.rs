use std::num::NonZeroU8;

use tokio::sync::oneshot;

mod upload;
pub use upload::*;

use crate::{Backoff, ConfigError, Error, Notifier, StageResult, StateError};

/// Default number of simultaneous stage operations.
pub const DEFAULT_MAX_CONCURRENCY: NonZeroU8 = match NonZeroU8::new(3) {
    Some(n) => n,
    None => unreachable!(),
};

/// Default revision of a destination.
pub const DEFAULT_REVISION: u64 = 1;

/// Destination object naming.
///
/// The object key is fully defined by `{identity}_{category}_{revision}.{extension}`, eg. `u1_video_2.mp4`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    /// Caller identity (user, session...), first segment of the key.
    identity: String,
    /// Fixed discriminator, middle segment of the key.
    category: String,
    /// Distinguishes repeated uploads for the same identity.
    revision: u64,
    /// File extension, with or without its leading dot.
    extension: String,
}

impl Destination {
    pub fn new(identity: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            category: category.into(),
            revision: DEFAULT_REVISION,
            extension: String::new(),
        }
    }

    #[inline]
    pub fn with_revision(self, revision: u64) -> Self {
        Self { revision, ..self }
    }

    #[inline]
    pub fn with_extension(self, extension: impl Into<String>) -> Self {
        Self {
            extension: extension.into(),
            ..self
        }
    }

    /// Compose the destination object key.
    pub fn key(&self) -> Result<String, ConfigError> {
        let identity = required(&self.identity, "identity")?;
        let category = required(&self.category, "category")?;
        let extension = required(self.extension.trim().trim_start_matches('.'), "extension")?;

        if self.revision == 0 {
            return Err(ConfigError::InvalidRevision);
        }

        Ok(format!("{identity}_{category}_{}.{extension}", self.revision))
    }
}

fn required<'a>(value: &'a str, name: &'static str) -> Result<&'a str, ConfigError> {
    match value.trim() {
        "" => Err(ConfigError::MissingNaming(name)),
        value => Ok(value),
    }
}

/// Upload session configuration.
#[derive(Debug)]
pub struct SessionConfig {
    pub(crate) destination: Destination,
    pub(crate) max_concurrency: NonZeroU8,
    pub(crate) backoff: Backoff,
    pub(crate) notifier: Notifier,
}

impl SessionConfig {
    pub fn new(destination: Destination) -> Self {
        Self {
            destination,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            backoff: Backoff::default(),
            notifier: Notifier::default(),
        }
    }

    #[inline]
    pub fn with_max_concurrency(self, max_concurrency: NonZeroU8) -> Self {
        Self { max_concurrency, ..self }
    }

    #[inline]
    pub fn with_backoff(self, backoff: Backoff) -> Self {
        Self { backoff, ..self }
    }

    #[inline]
    pub fn with_notifier(self, notifier: Notifier) -> Self {
        Self { notifier, ..self }
    }
}

/// Upload session lifecycle.
///
/// ```text
///     Uninitialized -> Initializing -> Active -> Finalizing -> Committing -> Committed
///                          |              |           |
///                          +--------------+-----------+-> Aborted | Halted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No chunk has been enqueued yet, the backend is not connected.
    Uninitialized,
    /// The backend is being connected by a first enqueue.
    Initializing,
    /// Accepting chunks.
    Active,
    /// Draining pending chunks before committing them.
    Finalizing,
    /// The block list commit request is in flight, it can no longer be aborted.
    Committing,
    /// The object has been committed. Terminal.
    Committed,
    /// The caller gave up. Terminal.
    Aborted,
    /// Chunk `index` failed permanently, the session cannot commit anymore.
    Halted { index: u64 },
}

impl Phase {
    /// Check that chunks can still be enqueued.
    pub(crate) fn accepting(self) -> Result<(), Error> {
        match self {
            Phase::Uninitialized | Phase::Initializing | Phase::Active => Ok(()),
            Phase::Finalizing | Phase::Committing => Err(StateError::Finalizing.into()),
            Phase::Committed => Err(StateError::AlreadyCommitted.into()),
            Phase::Aborted => Err(StateError::Aborted.into()),
            Phase::Halted { index } => Err(Error::Halted { index }),
        }
    }
}

/// A ticket on an enqueued chunk.
///
/// Dropping it does not cancel the chunk upload.
#[derive(Debug)]
pub struct Staging {
    index: u64,
    reply: oneshot::Receiver<StageResult>,
}

impl Staging {
    /// Sequence index assigned to the chunk.
    #[inline]
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Wait for the chunk to be staged or to fail permanently.
    pub async fn wait(self) -> StageResult {
        self.reply.await.unwrap_or(Err(Error::State(StateError::Aborted)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key() {
        let destination = Destination::new("u1", "video").with_revision(2).with_extension("mp4");

        assert_eq!(destination.key().unwrap(), "u1_video_2.mp4");
    }

    #[test]
    fn test_key_defaults_and_normalization() {
        let destination = Destination::new(" u1 ", "audio").with_extension(".wav");

        assert_eq!(destination.key().unwrap(), "u1_audio_1.wav");
        assert_eq!(destination.clone().with_extension("..wav").key().unwrap(), "u1_audio_1.wav");
    }

    #[test]
    fn test_key_missing_naming() {
        let destination = Destination::new("u1", "video").with_extension("mp4");

        assert_eq!(
            Destination::new("", "video").with_extension("mp4").key(),
            Err(ConfigError::MissingNaming("identity"))
        );
        assert_eq!(
            Destination::new("u1", "  ").with_extension("mp4").key(),
            Err(ConfigError::MissingNaming("category"))
        );
        assert_eq!(
            destination.clone().with_extension(".").key(),
            Err(ConfigError::MissingNaming("extension"))
        );
        assert_eq!(destination.with_revision(0).key(), Err(ConfigError::InvalidRevision));
    }

    #[test]
    fn test_accepting() {
        assert!(Phase::Uninitialized.accepting().is_ok());
        assert!(Phase::Active.accepting().is_ok());
        assert!(matches!(Phase::Committing.accepting(), Err(Error::State(StateError::Finalizing))));
        assert!(matches!(Phase::Aborted.accepting(), Err(Error::State(StateError::Aborted))));
        assert!(matches!(Phase::Halted { index: 4 }.accepting(), Err(Error::Halted { index: 4 })));
    }
}
