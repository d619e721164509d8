//! Reader-side cursor over one subpartition and the notification contract.

use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::Result;
use crate::buffer::BufferAndBacklog;
use crate::concurrency::IoExecutor;
use crate::subpartition::Subpartition;

/// Wakes a reader that was told no data is available.
///
/// A view calls [`notify_data_available`](Self::notify_data_available) at
/// most once per "no data" answer, as soon as polling again would make
/// progress. Implementations are invoked from producer and I/O threads and
/// must not call back into the view.
pub trait AvailabilityListener: Send + Sync {
    fn notify_data_available(&self);
}

impl<F> AvailabilityListener for F
where
    F: Fn() + Send + Sync,
{
    fn notify_data_available(&self) {
        self()
    }
}

/// Ignores notifications. For readers that poll on their own schedule.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpListener;

impl AvailabilityListener for NoOpListener {
    fn notify_data_available(&self) {}
}

/// A listener a reader thread can block on.
///
/// Notifications that arrive before the reader starts waiting are kept, so a
/// wakeup racing with the reader's last poll is never lost.
#[derive(Debug, Default)]
pub struct BlockingListener {
    pending: Mutex<usize>,
    available: Condvar,
}

impl BlockingListener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until at least one notification is pending, then clears them all.
    pub fn wait_for_data(&self) {
        let mut pending = self.pending.lock();
        while *pending == 0 {
            self.available.wait(&mut pending);
        }
        *pending = 0;
    }

    /// Like [`wait_for_data`](Self::wait_for_data) but gives up after `timeout`.
    /// Returns false on timeout.
    pub fn wait_for_data_timeout(&self, timeout: Duration) -> bool {
        let mut pending = self.pending.lock();
        if *pending == 0 {
            let _ = self
                .available
                .wait_while_for(&mut pending, |pending| *pending == 0, timeout);
        }
        if *pending == 0 {
            return false;
        }
        *pending = 0;
        true
    }

    /// Notifications received since the last wait returned.
    pub fn pending_notifications(&self) -> usize {
        *self.pending.lock()
    }
}

impl AvailabilityListener for BlockingListener {
    fn notify_data_available(&self) {
        *self.pending.lock() += 1;
        self.available.notify_all();
    }
}

/// The single reader handle of a subpartition.
///
/// Dropping the view releases it.
pub struct SubpartitionView {
    subpartition: Arc<Subpartition>,
    executor: Arc<IoExecutor>,
}

impl SubpartitionView {
    pub(crate) fn new(subpartition: Arc<Subpartition>, executor: Arc<IoExecutor>) -> Self {
        Self {
            subpartition,
            executor,
        }
    }

    /// Returns the next buffer in sequence order, or `None` if it is not ready.
    ///
    /// Never blocks. After `None`, wait for the listener before polling again.
    /// Returns `None` for good once the end-of-partition event has been
    /// delivered or the view has been released.
    pub fn get_next_buffer(&self) -> Result<Option<BufferAndBacklog>> {
        self.subpartition.get_next_buffer(&self.executor)
    }

    /// Discards the unread data of this subpartition. Safe to call at any time.
    pub fn release_all_resources(&self) {
        if !self.subpartition.is_view_released() {
            debug!(
                subpartition = self.subpartition.index(),
                "Releasing subpartition view"
            );
        }
        self.subpartition.release_view();
    }

    pub fn is_released(&self) -> bool {
        self.subpartition.is_view_released()
    }

    pub fn subpartition_index(&self) -> usize {
        self.subpartition.index()
    }

    /// Buffers not yet delivered, including any being loaded from disk.
    pub fn buffers_in_backlog(&self) -> usize {
        self.subpartition.backlog()
    }
}

impl fmt::Debug for SubpartitionView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubpartitionView")
            .field("subpartition", &self.subpartition.index())
            .field("released", &self.is_released())
            .finish()
    }
}

impl Drop for SubpartitionView {
    fn drop(&mut self) {
        self.subpartition.release_view();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_closure_listener() {
        let count = Arc::new(AtomicUsize::new(0));
        let listener: Arc<dyn AvailabilityListener> = {
            let count = Arc::clone(&count);
            Arc::new(move || {
                count.fetch_add(1, Ordering::SeqCst);
            })
        };
        listener.notify_data_available();
        listener.notify_data_available();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_notification_before_wait_is_kept() {
        let listener = BlockingListener::new();
        listener.notify_data_available();
        listener.wait_for_data();
        assert_eq!(listener.pending_notifications(), 0);
        assert!(!listener.wait_for_data_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn test_waiter_wakes_on_notify() {
        let listener = Arc::new(BlockingListener::new());
        let waiter = {
            let listener = Arc::clone(&listener);
            thread::spawn(move || listener.wait_for_data_timeout(Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        listener.notify_data_available();
        assert!(waiter.join().unwrap());
    }
}
