//! Leading-and-trailing throttle for snapshot requests.

use std::future::Future;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::trace;

/// Coalesces bursts of requests into at most one run per window.
///
/// The first request runs immediately. Requests arriving while a run is in
/// progress or inside the window collapse into one trailing run at the end
/// of the window.
#[derive(Debug, Clone)]
pub struct Throttle {
    tx: mpsc::UnboundedSender<()>,
}

impl Throttle {
    /// Spawns the worker running `f`. It exits when `shutdown` turns true or
    /// every [`Throttle`] handle is dropped.
    pub fn spawn<F, Fut>(
        window: Duration,
        mut shutdown: watch::Receiver<bool>,
        mut f: F,
    ) -> (Self, JoinHandle<()>)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();

        let handle = tokio::spawn(async move {
            let mut last_run: Option<Instant> = None;
            loop {
                if *shutdown.borrow() {
                    return;
                }

                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        continue;
                    }
                    request = rx.recv() => {
                        if request.is_none() {
                            return;
                        }
                    }
                }

                if let Some(last) = last_run {
                    tokio::select! {
                        () = sleep_until(last + window) => {}
                        _ = shutdown.changed() => return,
                    }
                }

                let mut coalesced = 0usize;
                while rx.try_recv().is_ok() {
                    coalesced += 1;
                }
                trace!("throttled run ({coalesced} coalesced requests)");

                f().await;
                last_run = Some(Instant::now());
            }
        });

        (Self { tx }, handle)
    }

    /// Requests a run.
    pub fn request(&self) {
        let _ = self.tx.send(());
    }
}
