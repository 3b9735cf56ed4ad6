//! In-memory transport pair for tests and embedder integration harnesses.
//! Both ends report `Connected` and open their channel once each side has
//! applied the other's description, mimicking a completed handshake.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use super::{
    DescriptorKind, GatheringOutcome, PeerState, PeerTransport, SessionDescriptor, SessionRole,
    TransportError, TransportFactory,
};

struct MockLink {
    ready: [AtomicBool; 2],
    open: [AtomicBool; 2],
    state_tx: [watch::Sender<PeerState>; 2],
}

pub struct MockPeerTransport {
    idx: usize,
    link: Arc<MockLink>,
    out_tx: mpsc::UnboundedSender<Bytes>,
    incoming: Mutex<Option<mpsc::UnboundedReceiver<Bytes>>>,
    state_rx: watch::Receiver<PeerState>,
    gathering_tx: watch::Sender<bool>,
    gathering_rx: watch::Receiver<bool>,
    local: Mutex<Option<SessionDescriptor>>,
    remote: Mutex<Option<SessionDescriptor>>,
    desc_seq: AtomicU64,
    negotiation_delay: Mutex<Option<Duration>>,
}

impl MockPeerTransport {
    /// A connected-by-handshake pair; candidate gathering stays pending
    /// until `complete_gathering` is called on each end.
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let (a_state_tx, a_state_rx) = watch::channel(PeerState::New);
        let (b_state_tx, b_state_rx) = watch::channel(PeerState::New);
        let link = Arc::new(MockLink {
            ready: [AtomicBool::new(false), AtomicBool::new(false)],
            open: [AtomicBool::new(false), AtomicBool::new(false)],
            state_tx: [a_state_tx, b_state_tx],
        });
        let (a_out, b_in) = mpsc::unbounded_channel();
        let (b_out, a_in) = mpsc::unbounded_channel();

        let make = |idx, out_tx, in_rx, state_rx| {
            let (gathering_tx, gathering_rx) = watch::channel(false);
            Arc::new(Self {
                idx,
                link: link.clone(),
                out_tx,
                incoming: Mutex::new(Some(in_rx)),
                state_rx,
                gathering_tx,
                gathering_rx,
                local: Mutex::new(None),
                remote: Mutex::new(None),
                desc_seq: AtomicU64::new(0),
                negotiation_delay: Mutex::new(None),
            })
        };
        (
            make(0, a_out, a_in, a_state_rx),
            make(1, b_out, b_in, b_state_rx),
        )
    }

    /// A pair with candidate gathering already complete on both ends.
    pub fn pair_ready() -> (Arc<Self>, Arc<Self>) {
        let (a, b) = Self::pair();
        a.complete_gathering();
        b.complete_gathering();
        (a, b)
    }

    /// Signal that no further candidates will be produced.
    pub fn complete_gathering(&self) {
        let _ = self.gathering_tx.send(true);
    }

    /// Delay applied inside create_offer/create_answer, for tests that need
    /// a negotiation cycle to stay in flight for a while.
    pub fn set_negotiation_delay(&self, delay: Duration) {
        *self.negotiation_delay.lock().unwrap() = Some(delay);
    }

    /// Drive both ends into sustained failure.
    pub fn fail(&self) {
        for i in 0..2 {
            self.link.open[i].store(false, Ordering::SeqCst);
            let _ = self.link.state_tx[i].send(PeerState::Failed);
        }
    }

    /// A transient flap: both ends report disconnected without losing the
    /// channel for good.
    pub fn flap(&self) {
        for i in 0..2 {
            let _ = self.link.state_tx[i].send(PeerState::Disconnected);
        }
    }

    pub fn recover(&self) {
        for i in 0..2 {
            self.link.open[i].store(true, Ordering::SeqCst);
            let _ = self.link.state_tx[i].send(PeerState::Connected);
        }
    }

    /// Skip the handshake entirely; used by unit tests that only exercise
    /// the byte path.
    pub fn force_open(&self) {
        for i in 0..2 {
            self.link.open[i].store(true, Ordering::SeqCst);
            let _ = self.link.state_tx[i].send(PeerState::Connected);
        }
    }

    fn mark_ready(&self) {
        self.link.ready[self.idx].store(true, Ordering::SeqCst);
        let both = self.link.ready.iter().all(|r| r.load(Ordering::SeqCst));
        if both {
            for i in 0..2 {
                self.link.open[i].store(true, Ordering::SeqCst);
                let _ = self.link.state_tx[i].send(PeerState::Connected);
            }
        }
    }

    async fn negotiation_pause(&self) {
        let delay = *self.negotiation_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn next_sdp(&self, kind: DescriptorKind) -> SessionDescriptor {
        let n = self.desc_seq.fetch_add(1, Ordering::SeqCst);
        let label = match kind {
            DescriptorKind::Offer => "offer",
            DescriptorKind::Answer => "answer",
        };
        SessionDescriptor {
            kind,
            sdp: format!("v=0 mock-{label}-{}-{n}", self.idx),
        }
    }
}

#[async_trait]
impl PeerTransport for MockPeerTransport {
    async fn create_offer(&self) -> Result<SessionDescriptor, TransportError> {
        self.negotiation_pause().await;
        Ok(self.next_sdp(DescriptorKind::Offer))
    }

    async fn create_answer(&self) -> Result<SessionDescriptor, TransportError> {
        self.negotiation_pause().await;
        if self.remote.lock().unwrap().is_none() {
            return Err(TransportError::Negotiation(
                "remote description not set".to_string(),
            ));
        }
        Ok(self.next_sdp(DescriptorKind::Answer))
    }

    async fn set_local_description(&self, desc: SessionDescriptor) -> Result<(), TransportError> {
        *self.local.lock().unwrap() = Some(desc);
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescriptor) -> Result<(), TransportError> {
        *self.remote.lock().unwrap() = Some(desc);
        self.mark_ready();
        Ok(())
    }

    async fn wait_gathering_complete(&self, timeout: Duration) -> GatheringOutcome {
        let mut rx = self.gathering_rx.clone();
        match tokio::time::timeout(timeout, rx.wait_for(|done| *done)).await {
            Ok(_) => GatheringOutcome::Complete,
            Err(_) => GatheringOutcome::TimedOut,
        }
    }

    async fn local_description(&self) -> Option<SessionDescriptor> {
        self.local.lock().unwrap().clone()
    }

    fn state_stream(&self) -> watch::Receiver<PeerState> {
        self.state_rx.clone()
    }

    fn channel_open(&self) -> bool {
        self.link.open[self.idx].load(Ordering::SeqCst)
    }

    async fn send(&self, data: Bytes) -> Result<(), TransportError> {
        if !self.channel_open() {
            return Err(TransportError::ChannelNotOpen);
        }
        self.out_tx
            .send(data)
            .map_err(|_| TransportError::Closed)
    }

    fn take_incoming(&self) -> Option<mpsc::UnboundedReceiver<Bytes>> {
        self.incoming.lock().unwrap().take()
    }

    async fn close(&self) {
        self.link.open[self.idx].store(false, Ordering::SeqCst);
        let _ = self.link.state_tx[self.idx].send(PeerState::Closed);
    }
}

/// Hands out pre-built mock transports in order; one per session attempt.
#[derive(Default)]
pub struct MockTransportFactory {
    queue: Mutex<VecDeque<Arc<MockPeerTransport>>>,
}

impl MockTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, transport: Arc<MockPeerTransport>) {
        self.queue.lock().unwrap().push_back(transport);
    }
}

#[async_trait]
impl TransportFactory for MockTransportFactory {
    async fn create(&self, _role: SessionRole) -> Result<Arc<dyn PeerTransport>, TransportError> {
        self.queue
            .lock()
            .unwrap()
            .pop_front()
            .map(|t| t as Arc<dyn PeerTransport>)
            .ok_or_else(|| TransportError::Setup("no transport available".to_string()))
    }
}
