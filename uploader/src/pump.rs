//! This module provides the concurrency pump draining staged work under a fixed ceiling.

use std::num::NonZeroU8;
use std::sync::{Arc, Mutex};

use futures::future::{self, Future, FutureExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

type Dispatch = future::BoxFuture<'static, ()>;
type Queue = Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Dispatch>>>;

/// A fixed set of staging slots draining a FIFO of dispatches in the background.
///
/// Each slot runs one dispatch at a time, so no more than `size` dispatches ever run concurrently, and dispatches
/// start in the exact order they were pushed (they may still complete in any order).
///
/// # Example
/// ```
/// # tokio_test::block_on(async {
/// # use uploader::pump::Pump;
/// let pump = Pump::start("demo.mp4", 2.try_into().unwrap());
///
/// for i in 0..=3 {
///     pump.dispatch(async move { println!("Staging chunk #{i}...") });
/// }
///
/// pump.stop().await;
/// # })
/// ```
#[derive(Debug)]
pub struct Pump {
    /// Labels the slots in logs, usually the destination key.
    name: Arc<str>,
    /// Handles of the running slots, slot `i` at position `i`.
    slots: Mutex<Vec<JoinHandle<()>>>,
    /// The sending part of the FIFO, the next idle slot waits on the receiving part.
    ///
    /// Taken when the pump is closed.
    sender: Mutex<Option<mpsc::UnboundedSender<Dispatch>>>,
}

impl Pump {
    /// Start a pump with `size` slots.
    ///
    /// Must be called within a Tokio runtime.
    pub fn start(name: &str, size: NonZeroU8) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();

        let name: Arc<str> = name.into();
        let queue: Queue = Arc::new(tokio::sync::Mutex::new(receiver));

        let slots = (0..size.get())
            .map(|slot| tokio::spawn(run_slot(Arc::clone(&name), slot, Arc::clone(&queue))))
            .collect();

        tracing::debug!("Started {size} staging slots for `{name}`");

        Self {
            name,
            slots: Mutex::new(slots),
            sender: Mutex::new(Some(sender)),
        }
    }

    /// Push a dispatch at the back of the FIFO.
    ///
    /// Return `false`, dropping the dispatch without running it, when the pump has been closed.
    pub fn dispatch(&self, future: impl Future<Output = ()> + Send + 'static) -> bool {
        match *self.sender.lock().unwrap_or_else(|e| e.into_inner()) {
            Some(ref sender) => sender.send(future.boxed()).is_ok(),
            None => false,
        }
    }

    /// Return the number of slots not joined yet.
    pub fn size(&self) -> usize {
        self.slots.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Close the FIFO without waiting: slots exit on their own once every pushed dispatch has run.
    ///
    /// Once closed, further dispatches are rejected.
    pub fn close(&self) {
        drop(self.sender.lock().unwrap_or_else(|e| e.into_inner()).take());
    }

    /// Close the FIFO and wait for every pushed dispatch to complete.
    pub async fn stop(&self) {
        self.close();

        let slots = std::mem::take(&mut *self.slots.lock().unwrap_or_else(|e| e.into_inner()));

        tracing::debug!("Stopping {} staging slots of `{}`...", slots.len(), self.name);

        for (slot, joined) in future::join_all(slots).await.into_iter().enumerate() {
            if let Err(e) = joined {
                tracing::error!("Staging slot {}#{slot} failed: {e}", self.name);
            }
        }
    }
}

/// Run dispatches pulled from `queue` one after the other, until it is closed and drained.
async fn run_slot(name: Arc<str>, slot: u8, queue: Queue) {
    loop {
        // the lock is released at the end of this statement, so that the next idle slot can pick the following dispatch
        let next = queue.lock().await.recv().await;

        let Some(dispatch) = next else {
            break;
        };

        tracing::trace!("Running dispatch on staging slot {name}#{slot}");

        dispatch.await;
    }

    tracing::trace!("Staging slot {name}#{slot} drained");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test(start_paused = true)]
    #[tracing_test::traced_test]
    async fn test_ceiling() {
        let pump = Pump::start("obj", 3.try_into().unwrap());
        assert_eq!(pump.size(), 3);

        let running = Arc::new(AtomicUsize::new(0));
        let max = Arc::new(AtomicUsize::new(0));

        for i in 0..10 {
            let (running, max) = (Arc::clone(&running), Arc::clone(&max));

            assert!(pump.dispatch(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                max.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10 * (i % 4 + 1))).await;
                running.fetch_sub(1, Ordering::SeqCst);
            }));
        }

        pump.stop().await;

        assert_eq!(max.load(Ordering::SeqCst), 3);
        assert_eq!(running.load(Ordering::SeqCst), 0);
        assert!(logs_contain("Stopping 3 staging slots of `obj`"));
    }

    #[tokio::test]
    async fn test_fifo_start_order() {
        let pump = Pump::start("obj", 1.try_into().unwrap());
        let started = Arc::new(Mutex::new(vec![]));

        for i in 0..5 {
            let started = Arc::clone(&started);
            pump.dispatch(async move { started.lock().unwrap().push(i) });
        }

        pump.stop().await;

        assert_eq!(*started.lock().unwrap(), [0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_dispatch_after_stop() {
        let pump = Pump::start("obj", 2.try_into().unwrap());

        pump.stop().await;

        assert!(!pump.dispatch(async {}));
        assert_eq!(pump.size(), 0);
    }

    #[tokio::test]
    async fn test_close_drains_pushed_dispatches() {
        let pump = Pump::start("obj", 1.try_into().unwrap());
        let (sender, receiver) = tokio::sync::oneshot::channel();

        pump.dispatch(async move {
            tokio::task::yield_now().await;
            sender.send(()).unwrap();
        });
        pump.close();

        assert!(!pump.dispatch(async {}));
        assert_eq!(receiver.await, Ok(()));
    }

    #[tokio::test]
    async fn test_pumps_are_independent() {
        let first = Pump::start("first", 2.try_into().unwrap());
        let second = Pump::start("second", 1.try_into().unwrap());

        first.stop().await;

        assert!(!first.dispatch(async {}));
        assert!(second.dispatch(async {}));
        assert_eq!(second.size(), 1);

        second.stop().await;
    }
}
