//! Debounced background persistence
//!
//! State owners call [`Debouncer::mark_changed`] after every mutation. A
//! background task waits for the first signal, then keeps resetting a quiet
//! window while further signals arrive; one save runs when the window elapses
//! without new signals. Signals that arrive during a save leave a permit
//! behind, so the next cycle starts immediately and nothing is lost.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::debug;

/// Handle used to signal "state changed" to a debounced writer task.
#[derive(Clone, Debug)]
pub struct Debouncer {
    notify: Arc<Notify>,
}

impl Debouncer {
    /// Record that the owned state changed and should eventually be written.
    pub fn mark_changed(&self) {
        self.notify.notify_one();
    }
}

/// Spawn a task that coalesces change signals and runs `save` once per burst.
///
/// `window` is the quiet period required before writing. The returned
/// `JoinHandle` can be aborted on shutdown after a final synchronous flush.
pub fn spawn_debounced<F, Fut>(window: Duration, save: F) -> (Debouncer, JoinHandle<()>)
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    let notify = Arc::new(Notify::new());
    let debouncer = Debouncer {
        notify: notify.clone(),
    };

    let handle = tokio::spawn(async move {
        loop {
            notify.notified().await;
            let mut coalesced = 1u32;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(window) => break,
                    _ = notify.notified() => coalesced += 1,
                }
            }
            debug!(coalesced, "debounce window elapsed, saving");
            save().await;
        }
    });

    (debouncer, handle)
}
