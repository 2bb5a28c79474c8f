//! One-shot timer slots.
//!
//! A [`TimerSlot`] holds at most one pending timer. Scheduling into an
//! occupied slot aborts the previous timer, so timers for one concern never
//! stack. The timer body receives its [`TimerId`] and must call
//! [`TimerSlot::fired`] under the owner's lock before acting: a `false`
//! return means it was replaced or cancelled in the meantime.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;

/// Identity of a scheduled timer within its slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerId(u64);

/// A single-occupancy slot for a cancellable one-shot timer.
#[derive(Debug, Default)]
pub struct TimerSlot {
    next_id: u64,
    pending: Option<(TimerId, JoinHandle<()>)>,
}

impl TimerSlot {
    /// Create an empty slot.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next_id: 0,
            pending: None,
        }
    }

    /// Schedule `make(id)` to run after `delay`, replacing any pending timer.
    ///
    /// Must be called from within a tokio runtime.
    pub fn schedule<F, Fut>(&mut self, delay: Duration, make: F) -> TimerId
    where
        F: FnOnce(TimerId) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.cancel();

        self.next_id = self.next_id.wrapping_add(1);
        let id = TimerId(self.next_id);
        let body = make(id);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            body.await;
        });
        self.pending = Some((id, handle));
        id
    }

    /// Claim the slot from inside the timer body.
    ///
    /// Returns `true` if `id` is still the pending timer; the slot is then
    /// emptied without aborting the running task.
    pub fn fired(&mut self, id: TimerId) -> bool {
        match &self.pending {
            Some((pending, _)) if *pending == id => {
                self.pending = None;
                true
            }
            _ => false,
        }
    }

    /// Abort the pending timer. Returns `true` if one was pending.
    pub fn cancel(&mut self) -> bool {
        self.pending.take().is_some_and(|(_, handle)| {
            handle.abort();
            true
        })
    }

    /// Whether a timer is pending.
    #[must_use]
    pub const fn is_pending(&self) -> bool {
        self.pending.is_some()
    }
}

impl Drop for TimerSlot {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use parking_lot::Mutex;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn fires_once_after_delay() {
        let slot = Arc::new(Mutex::new(TimerSlot::new()));
        let hits = Arc::new(AtomicU32::new(0));

        {
            let slot_ref = Arc::clone(&slot);
            let hits = Arc::clone(&hits);
            slot.lock().schedule(Duration::from_millis(100), move |id| async move {
                if slot_ref.lock().fired(id) {
                    hits.fetch_add(1, Ordering::SeqCst);
                }
            });
        }
        assert!(slot.lock().is_pending());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!slot.lock().is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn rescheduling_replaces_previous_timer() {
        let slot = Arc::new(Mutex::new(TimerSlot::new()));
        let hits = Arc::new(AtomicU32::new(0));

        for delay in [100, 200] {
            let slot_ref = Arc::clone(&slot);
            let hits = Arc::clone(&hits);
            slot.lock().schedule(Duration::from_millis(delay), move |id| async move {
                if slot_ref.lock().fired(id) {
                    hits.fetch_add(1, Ordering::SeqCst);
                }
            });
        }

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_firing() {
        let slot = Arc::new(Mutex::new(TimerSlot::new()));
        let hits = Arc::new(AtomicU32::new(0));

        {
            let hits = Arc::clone(&hits);
            slot.lock().schedule(Duration::from_millis(10), move |_| async move {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert!(slot.lock().cancel());
        assert!(!slot.lock().cancel());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn stale_id_is_not_claimed() {
        let mut slot = TimerSlot::new();
        assert!(!slot.fired(TimerId(1)));
    }
}
