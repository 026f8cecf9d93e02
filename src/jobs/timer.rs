use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// A resettable one-shot alarm that runs `on_fire` on a background task.
///
/// Dropping the timer stops it. Once the callback has started it is left to
/// finish, so a callback may safely drop its own timer.
pub(crate) struct StateTimer {
    deadline: watch::Sender<Instant>,
    fired: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl StateTimer {
    pub(crate) fn start<F>(after: Duration, on_fire: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let (deadline, mut rx) = watch::channel(Instant::now() + after);
        let fired = Arc::new(AtomicBool::new(false));
        let task_fired = Arc::clone(&fired);

        let handle = tokio::spawn(async move {
            loop {
                let at = *rx.borrow_and_update();
                tokio::select! {
                    _ = tokio::time::sleep_until(at) => break,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            }
            task_fired.store(true, Ordering::SeqCst);
            on_fire.await;
        });

        Self {
            deadline,
            fired,
            handle,
        }
    }

    /// Push the deadline out to `after` from now.
    pub(crate) fn reset(&self, after: Duration) {
        let _ = self.deadline.send(Instant::now() + after);
    }

    pub(crate) fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

impl Drop for StateTimer {
    fn drop(&mut self) {
        if !self.has_fired() {
            self.handle.abort();
        }
    }
}
