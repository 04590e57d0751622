//! Single-shot, cancellable revert timer.
//!
//! Arming spawns a tokio task that sleeps until the deadline and then runs the
//! callback. Cancelling signals the task over a watch channel, so a callback
//! that has not started yet never runs, while one already running is left
//! alone. Each arm gets a fresh id that the callback receives; the owner uses
//! it to recognise a callback that fired for a timer it has since replaced.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

struct Armed {
    id: u64,
    fires_at: Instant,
    cancel_tx: watch::Sender<bool>,
}

/// At most one pending delayed action.
pub struct RevertTimer {
    next_id: u64,
    armed: Option<Armed>,
}

impl RevertTimer {
    pub fn new() -> Self {
        Self {
            next_id: 0,
            armed: None,
        }
    }

    /// Arm the timer, replacing (and cancelling) any previously armed one.
    /// Returns the id handed to `callback`.
    pub fn arm<F, Fut>(&mut self, after: Duration, callback: F) -> u64
    where
        F: FnOnce(u64) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.cancel();

        self.next_id += 1;
        let id = self.next_id;
        let fires_at = Instant::now() + after;
        let (cancel_tx, mut cancel_rx) = watch::channel(false);

        tokio::spawn(async move {
            tokio::select! {
                biased;
                // Also resolves when the sender is dropped with the timer.
                _ = cancel_rx.changed() => return,
                _ = tokio::time::sleep_until(fires_at) => {}
            }
            callback(id).await;
        });

        self.armed = Some(Armed {
            id,
            fires_at,
            cancel_tx,
        });
        id
    }

    /// Cancel the armed timer, if any. Returns whether one was armed.
    ///
    /// Safe to call when nothing is armed or the callback already started.
    pub fn cancel(&mut self) -> bool {
        match self.armed.take() {
            Some(armed) => {
                let _ = armed.cancel_tx.send(true);
                true
            }
            None => false,
        }
    }

    /// Whether `id` is the currently armed timer.
    pub fn is_armed(&self, id: u64) -> bool {
        self.armed.as_ref().is_some_and(|a| a.id == id)
    }

    /// Called from a fired callback: forget the timer without signalling it.
    /// Returns false if `id` was cancelled or replaced in the meantime.
    pub fn take_fired(&mut self, id: u64) -> bool {
        if self.is_armed(id) {
            self.armed = None;
            true
        } else {
            false
        }
    }

    pub fn fires_at(&self) -> Option<Instant> {
        self.armed.as_ref().map(|a| a.fires_at)
    }
}

impl Default for RevertTimer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::oneshot;

    fn remaining(timer: &RevertTimer) -> Option<Duration> {
        timer
            .fires_at()
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    fn counting(counter: &Arc<AtomicUsize>) -> impl FnOnce(u64) -> std::future::Ready<()> {
        let counter = counter.clone();
        move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_once_after_duration() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut timer = RevertTimer::new();
        timer.arm(Duration::from_secs(60), counting(&fired));

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(remaining(&timer), Some(Duration::from_secs(1)));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_callback() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut timer = RevertTimer::new();
        let id = timer.arm(Duration::from_secs(60), counting(&fired));

        assert!(timer.cancel());
        assert!(!timer.is_armed(id));
        assert!(!timer.cancel());

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(remaining(&timer), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_replaces_previous() {
        let seen = Arc::new(AtomicU64::new(0));
        let mut timer = RevertTimer::new();

        let record = |seen: &Arc<AtomicU64>| {
            let seen = seen.clone();
            move |id: u64| {
                seen.fetch_add(id, Ordering::SeqCst);
                std::future::ready(())
            }
        };

        let first = timer.arm(Duration::from_secs(60), record(&seen));
        tokio::time::sleep(Duration::from_secs(30)).await;
        let second = timer.arm(Duration::from_secs(60), record(&seen));
        assert_ne!(first, second);
        assert!(timer.is_armed(second));

        // The first deadline passes without effect.
        tokio::time::sleep(Duration::from_secs(40)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(seen.load(Ordering::SeqCst), second);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_does_not_stop_running_callback() {
        let (started_tx, started_rx) = oneshot::channel::<()>();
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let (done_tx, done_rx) = oneshot::channel::<u64>();

        let mut timer = RevertTimer::new();
        let id = timer.arm(Duration::from_secs(5), move |id| async move {
            let _ = started_tx.send(());
            let _ = release_rx.await;
            let _ = done_tx.send(id);
        });

        started_rx.await.unwrap();
        timer.cancel();
        release_tx.send(()).unwrap();

        assert_eq!(done_rx.await.unwrap(), id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_take_fired_rejects_stale_id() {
        let mut timer = RevertTimer::new();
        let old = timer.arm(Duration::from_secs(5), |_| std::future::ready(()));
        let new = timer.arm(Duration::from_secs(5), |_| std::future::ready(()));

        assert!(!timer.take_fired(old));
        assert!(timer.take_fired(new));
        assert!(!timer.take_fired(new));
    }
}
