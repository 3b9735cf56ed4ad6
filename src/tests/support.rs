//! Shared fixtures for the integration tests.

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::watch;

use crate::capability::{CapabilityController, CapabilityError};
use crate::config::Config;
use crate::protocol::{Envelope, NotificationBody};
use crate::session::SessionState;

/// Config with durations short enough for tests.
pub fn test_config() -> Config {
    Config {
        gathering_timeout: Duration::from_secs(2),
        renegotiation_timeout: Duration::from_secs(2),
        batch_flush_interval: Duration::from_secs(30),
        batch_capacity: 500,
        rate_limit_ceiling: 100,
        rate_limit_window: Duration::from_secs(60),
        watchdog_debounce: Duration::from_millis(60),
        reassembly_ttl: Duration::from_secs(5),
        ice_servers: Vec::new(),
        ..Config::default()
    }
}

pub async fn wait_for_session_state(
    rx: &mut watch::Receiver<SessionState>,
    want: SessionState,
) -> SessionState {
    tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| *s == want))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {want:?}"))
        .map(|s| *s)
        .expect("state channel closed")
}

pub async fn recv_envelope(rx: &mut tokio::sync::mpsc::UnboundedReceiver<Envelope>) -> Envelope {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for envelope")
        .expect("inbound stream closed")
}

pub fn small_notification(title: &str, post_time: i64) -> NotificationBody {
    NotificationBody {
        app_name: "Messages".to_string(),
        package_name: "com.app.x".to_string(),
        title: title.to_string(),
        text: "body".to_string(),
        priority: 0,
        is_ongoing: false,
        post_time,
        action_count: 0,
        ..Default::default()
    }
}

/// Capability controller that records invocations.
pub struct StubController {
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    pub switches: AtomicUsize,
    tracks: bool,
}

impl StubController {
    pub fn new(tracks: bool) -> Arc<Self> {
        Arc::new(Self {
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            switches: AtomicUsize::new(0),
            tracks,
        })
    }
}

#[async_trait]
impl CapabilityController for StubController {
    async fn start(&self) -> Result<(), CapabilityError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<(), CapabilityError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn switch(&self) -> Result<(), CapabilityError> {
        self.switches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn affects_media_tracks(&self) -> bool {
        self.tracks
    }
}
