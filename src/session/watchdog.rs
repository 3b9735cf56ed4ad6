//! Transport health watchdog.
//!
//! Transient ICE flaps recover on their own; only a failure that persists
//! past the debounce window is worth tearing the session down for.

use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::transport::PeerState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The transport stayed down for the whole debounce window.
    SustainedFailure,
    /// The session closed (or shut down) while watching.
    Ended,
}

/// Watch a transport's state stream until it either fails for longer than
/// `debounce` or the session ends.
pub async fn watch(
    mut states: watch::Receiver<PeerState>,
    debounce: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Verdict {
    loop {
        let current = *states.borrow_and_update();
        match current {
            PeerState::Closed => return Verdict::Ended,
            PeerState::Disconnected | PeerState::Failed => {
                debug!(target: "tether::watchdog", state = ?current, ?debounce, "transport unhealthy, debouncing");
                match debounce_failure(&mut states, debounce, &mut shutdown).await {
                    Some(verdict) => return verdict,
                    None => continue,
                }
            }
            _ => {}
        }
        tokio::select! {
            changed = states.changed() => {
                if changed.is_err() {
                    return Verdict::Ended;
                }
            }
            _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => return Verdict::Ended,
        }
    }
}

/// `Some(verdict)` ends the watch; `None` means the transport recovered.
async fn debounce_failure(
    states: &mut watch::Receiver<PeerState>,
    debounce: Duration,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<Verdict> {
    let deadline = tokio::time::sleep(debounce);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => {
                info!(target: "tether::watchdog", ?debounce, "failure persisted past debounce");
                return Some(Verdict::SustainedFailure);
            }
            changed = states.changed() => {
                if changed.is_err() {
                    return Some(Verdict::Ended);
                }
                match *states.borrow_and_update() {
                    PeerState::Connected => {
                        debug!(target: "tether::watchdog", "transport recovered within debounce");
                        return None;
                    }
                    PeerState::Closed => return Some(Verdict::Ended),
                    _ => {}
                }
            }
            _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => return Some(Verdict::Ended),
        }
    }
}
