use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::debug;

/// Resettable keepalive timer.
///
/// While running it emits a monotonically increasing nonce once per period,
/// the first one a full period after [`start`](Self::start). Restarting with
/// a new period aborts the previous timer task, so at most one is ever live;
/// the nonce sequence keeps counting across restarts.
pub(crate) struct ResettableInterval {
    tick_tx: mpsc::UnboundedSender<u64>,
    nonce: Arc<AtomicU64>,
    task: Option<JoinHandle<()>>,
}

impl ResettableInterval {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<u64>) {
        let (tick_tx, tick_rx) = mpsc::unbounded_channel();
        (
            Self {
                tick_tx,
                nonce: Arc::new(AtomicU64::new(0)),
                task: None,
            },
            tick_rx,
        )
    }

    pub(crate) fn start(&mut self, period: Duration) {
        self.stop();
        debug!("heartbeat period set to {:?}", period);
        let tick_tx = self.tick_tx.clone();
        let nonce = self.nonce.clone();
        self.task = Some(tokio::spawn(async move {
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if tick_tx.send(nonce.fetch_add(1, Ordering::Relaxed)).is_err() {
                    break;
                }
            }
        }));
    }

    pub(crate) fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for ResettableInterval {
    fn drop(&mut self) {
        self.stop();
    }
}
