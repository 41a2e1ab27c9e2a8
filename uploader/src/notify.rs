//! Caller-supplied progress, error and completion hooks.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};

use url::Url;

use crate::Error;

/// Callback invoked with the cumulative number of uploaded bytes.
pub type ProgressCallback = Box<dyn Fn(u64) + Send + Sync>;
/// Callback invoked when a chunk permanently fails or the backend cannot be initialized.
pub type ErrorCallback = Box<dyn Fn(&Error) + Send + Sync>;
/// Callback invoked with the durable address of the committed object.
pub type CompleteCallback = Box<dyn Fn(&Url) + Send + Sync>;

/// Dispatches session events to the registered callbacks.
///
/// Callbacks run synchronously on the task that produced the event, so they should return quickly.
/// A panicking callback is caught and logged: it never reaches the session nor the retry loop.
#[derive(Default)]
pub struct Notifier {
    on_progress: Option<ProgressCallback>,
    on_error: Option<ErrorCallback>,
    on_complete: Option<CompleteCallback>,
    /// Greatest progress reported so far.
    reported: AtomicU64,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn on_progress(self, callback: impl Fn(u64) + Send + Sync + 'static) -> Self {
        Self {
            on_progress: Some(Box::new(callback)),
            ..self
        }
    }

    #[inline]
    pub fn on_error(self, callback: impl Fn(&Error) + Send + Sync + 'static) -> Self {
        Self {
            on_error: Some(Box::new(callback)),
            ..self
        }
    }

    #[inline]
    pub fn on_complete(self, callback: impl Fn(&Url) + Send + Sync + 'static) -> Self {
        Self {
            on_complete: Some(Box::new(callback)),
            ..self
        }
    }

    /// Report the cumulative uploaded bytes.
    ///
    /// Concurrent stages may settle out of order: a total lower than one already reported is skipped.
    pub(crate) fn progress(&self, uploaded: u64) {
        if self.reported.fetch_max(uploaded, Ordering::AcqRel) >= uploaded {
            return;
        }

        if let Some(ref callback) = self.on_progress {
            guard("on_progress", || callback(uploaded));
        }
    }

    pub(crate) fn error(&self, error: &Error) {
        if let Some(ref callback) = self.on_error {
            guard("on_error", || callback(error));
        }
    }

    pub(crate) fn complete(&self, address: &Url) {
        if let Some(ref callback) = self.on_complete {
            guard("on_complete", || callback(address));
        }
    }
}

fn guard(name: &str, callback: impl FnOnce()) {
    if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(callback)) {
        let msg = panic
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
            .unwrap_or("<non-string payload>");

        tracing::error!("`{name}` callback panicked: {msg}");
    }
}

impl fmt::Debug for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notifier")
            .field("on_progress", &self.on_progress.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_complete", &self.on_complete.is_some())
            .finish()
    }
}
