//! Cancellable pre-recording countdown.

use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::{interval_at, Instant};
use tracing::debug;

const TICK: Duration = Duration::from_secs(1);

/// Cancels the countdown it was returned from. Dropping the handle cancels too.
#[derive(Debug)]
pub struct CountdownHandle {
    cancel_tx: Option<oneshot::Sender<()>>,
}

impl CountdownHandle {
    pub fn cancel(&mut self) {
        if let Some(tx) = self.cancel_tx.take() {
            let _ = tx.send(());
        }
    }
}

pub struct CountdownGate;

impl CountdownGate {
    /// Run an N-second countdown on a background task.
    ///
    /// `on_tick` first receives `seconds`, then every remaining value above
    /// zero, one second apart. Exactly one of `on_cancel` or `on_complete` runs
    /// afterwards. A zero-second countdown completes without ticking.
    pub fn start<T, C, D>(seconds: u32, mut on_tick: T, on_cancel: C, on_complete: D) -> CountdownHandle
    where
        T: FnMut(u32) + Send + 'static,
        C: FnOnce() + Send + 'static,
        D: FnOnce() + Send + 'static,
    {
        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            if seconds == 0 {
                on_complete();
                return;
            }

            let mut remaining = seconds;
            on_tick(remaining);

            let mut ticker = interval_at(Instant::now() + TICK, TICK);
            loop {
                tokio::select! {
                    biased;
                    _ = &mut cancel_rx => {
                        debug!("Countdown cancelled with {}s remaining", remaining);
                        on_cancel();
                        return;
                    }
                    _ = ticker.tick() => {
                        remaining -= 1;
                        if remaining == 0 {
                            on_complete();
                            return;
                        }
                        on_tick(remaining);
                    }
                }
            }
        });

        CountdownHandle {
            cancel_tx: Some(cancel_tx),
        }
    }
}
