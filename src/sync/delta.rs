use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::protocol::Envelope;
use crate::session::ControlChannelMultiplexer;

use super::{ChangeFeed, DedupeWindow, Timestamped};

/// Periodically drains one change feed into the control channel.
///
/// Each cycle fetches everything at or after the high-water mark, drops
/// records the dedupe window has already admitted this session and hands
/// the rest to the multiplexer under this syncer's origin.
pub struct DeltaSyncer<F>
where
    F: ChangeFeed,
    F::Item: Into<Envelope>,
{
    feed: F,
    origin: String,
    mux: Arc<ControlChannelMultiplexer>,
    interval: Duration,
    window: DedupeWindow,
}

impl<F> DeltaSyncer<F>
where
    F: ChangeFeed,
    F::Item: Into<Envelope>,
{
    pub fn new(
        feed: F,
        origin: impl Into<String>,
        mux: Arc<ControlChannelMultiplexer>,
        interval: Duration,
    ) -> Self {
        Self {
            feed,
            origin: origin.into(),
            mux,
            interval,
            window: DedupeWindow::new(),
        }
    }

    /// One fetch-and-forward cycle. Returns how many envelopes were handed
    /// to the multiplexer (rate-limited drops do not count).
    pub async fn sync_once(&mut self) -> usize {
        let items = self.feed.fetch_since(self.window.mark()).await;
        let mut forwarded = 0;
        for item in items {
            let ts = item.timestamp();
            if self.window.is_seen(ts) {
                continue;
            }
            // The mark moves only once the multiplexer accepted the record;
            // an enqueue error leaves it unseen for the next cycle.
            match self.mux.enqueue_telemetry(&self.origin, item.into()).await {
                Ok(true) => {
                    self.window.admit(ts);
                    forwarded += 1;
                }
                Ok(false) => {
                    self.window.admit(ts);
                }
                Err(err) => {
                    warn!(target: "tether::sync", origin = %self.origin, error = %err, "telemetry enqueue failed");
                    break;
                }
            }
        }
        if forwarded > 0 {
            debug!(target: "tether::sync", origin = %self.origin, forwarded, "delta cycle forwarded records");
        }
        forwarded
    }

    /// Run cycles on the configured interval until shutdown.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sync_once().await;
                }
                _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => break,
            }
        }
    }
}
