//! WebRTC implementation of [`PeerTransport`].
//!
//! Candidate handling is non-trickle: candidates are never signaled on
//! their own. The transport flips a gathering flag when the engine reports
//! the final (null) candidate, and `local_description` then returns the
//! description with everything gathered embedded.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{RwLock as AsyncRwLock, mpsc, watch};
use tracing::{debug, warn};

use webrtc::api::APIBuilder;
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::config::Config;

use super::{
    DescriptorKind, GatheringOutcome, PeerState, PeerTransport, SessionDescriptor, SessionRole,
    TransportError, TransportFactory,
};

pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    data_channel: Arc<AsyncRwLock<Option<Arc<RTCDataChannel>>>>,
    channel_open: Arc<AtomicBool>,
    state_rx: watch::Receiver<PeerState>,
    gathering_rx: watch::Receiver<bool>,
    incoming: std::sync::Mutex<Option<mpsc::UnboundedReceiver<Bytes>>>,
}

impl WebRtcTransport {
    pub async fn new(role: SessionRole, config: &Config) -> Result<Self, TransportError> {
        let api = APIBuilder::new().build();
        let rtc_config = RTCConfiguration {
            ice_servers: ice_servers(&config.ice_servers),
            ..Default::default()
        };
        let pc = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(|e| TransportError::Setup(e.to_string()))?,
        );

        let (state_tx, state_rx) = watch::channel(PeerState::New);
        let state_tx = Arc::new(state_tx);
        let (gathering_tx, gathering_rx) = watch::channel(false);
        let gathering_tx = Arc::new(gathering_tx);
        let (in_tx, in_rx) = mpsc::unbounded_channel::<Bytes>();
        let channel_open = Arc::new(AtomicBool::new(false));
        let data_channel = Arc::new(AsyncRwLock::new(None::<Arc<RTCDataChannel>>));

        let state_for_cb = state_tx.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let state_tx = state_for_cb.clone();
            Box::pin(async move {
                if let Some(mapped) = map_state(state) {
                    let _ = state_tx.send(mapped);
                }
            })
        }));

        let gathering_for_cb = gathering_tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let gathering_tx = gathering_for_cb.clone();
            Box::pin(async move {
                // The engine reports a null candidate once gathering ends;
                // individual candidates stay embedded in the description.
                if candidate.is_none() {
                    debug!(target: "tether::transport", "candidate gathering complete");
                    let _ = gathering_tx.send(true);
                }
            })
        }));

        match role {
            SessionRole::Offerer => {
                let init = RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                };
                let dc = pc
                    .create_data_channel(&config.channel_label, Some(init))
                    .await
                    .map_err(|e| TransportError::Setup(e.to_string()))?;
                attach_channel(&dc, in_tx.clone(), channel_open.clone());
                *data_channel.write().await = Some(dc);
            }
            SessionRole::Answerer => {
                let data_channel_cb = data_channel.clone();
                let in_tx_cb = in_tx.clone();
                let open_cb = channel_open.clone();
                pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                    let data_channel = data_channel_cb.clone();
                    let in_tx = in_tx_cb.clone();
                    let open = open_cb.clone();
                    Box::pin(async move {
                        debug!(target: "tether::transport", label = %dc.label(), "data channel received");
                        attach_channel(&dc, in_tx, open);
                        *data_channel.write().await = Some(dc);
                    })
                }));
            }
        }

        Ok(Self {
            pc,
            data_channel,
            channel_open,
            state_rx,
            gathering_rx,
            incoming: std::sync::Mutex::new(Some(in_rx)),
        })
    }
}

fn ice_servers(urls: &[String]) -> Vec<RTCIceServer> {
    if urls.is_empty() {
        return Vec::new();
    }
    vec![RTCIceServer {
        urls: urls.to_vec(),
        ..Default::default()
    }]
}

fn map_state(state: RTCPeerConnectionState) -> Option<PeerState> {
    match state {
        RTCPeerConnectionState::New => Some(PeerState::New),
        RTCPeerConnectionState::Connecting => Some(PeerState::Connecting),
        RTCPeerConnectionState::Connected => Some(PeerState::Connected),
        RTCPeerConnectionState::Disconnected => Some(PeerState::Disconnected),
        RTCPeerConnectionState::Failed => Some(PeerState::Failed),
        RTCPeerConnectionState::Closed => Some(PeerState::Closed),
        _ => None,
    }
}

fn attach_channel(
    dc: &Arc<RTCDataChannel>,
    in_tx: mpsc::UnboundedSender<Bytes>,
    open: Arc<AtomicBool>,
) {
    let open_for_open = open.clone();
    dc.on_open(Box::new(move || {
        open_for_open.store(true, Ordering::SeqCst);
        debug!(target: "tether::transport", "control channel open");
        Box::pin(async {})
    }));

    let open_for_close = open.clone();
    dc.on_close(Box::new(move || {
        open_for_close.store(false, Ordering::SeqCst);
        debug!(target: "tether::transport", "control channel closed");
        Box::pin(async {})
    }));

    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let in_tx = in_tx.clone();
        Box::pin(async move {
            // Receiver dropped means the session is shutting down.
            let _ = in_tx.send(msg.data);
        })
    }));
}

fn to_rtc(desc: SessionDescriptor) -> Result<RTCSessionDescription, TransportError> {
    let result = match desc.kind {
        DescriptorKind::Offer => RTCSessionDescription::offer(desc.sdp),
        DescriptorKind::Answer => RTCSessionDescription::answer(desc.sdp),
    };
    result.map_err(|e| TransportError::Negotiation(e.to_string()))
}

fn from_rtc(desc: RTCSessionDescription) -> Option<SessionDescriptor> {
    let kind = match desc.sdp_type {
        RTCSdpType::Offer => DescriptorKind::Offer,
        RTCSdpType::Answer => DescriptorKind::Answer,
        _ => return None,
    };
    Some(SessionDescriptor {
        kind,
        sdp: desc.sdp,
    })
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn create_offer(&self) -> Result<SessionDescriptor, TransportError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| TransportError::Negotiation(e.to_string()))?;
        from_rtc(offer).ok_or_else(|| TransportError::Negotiation("not an offer".to_string()))
    }

    async fn create_answer(&self) -> Result<SessionDescriptor, TransportError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| TransportError::Negotiation(e.to_string()))?;
        from_rtc(answer).ok_or_else(|| TransportError::Negotiation("not an answer".to_string()))
    }

    async fn set_local_description(&self, desc: SessionDescriptor) -> Result<(), TransportError> {
        self.pc
            .set_local_description(to_rtc(desc)?)
            .await
            .map_err(|e| TransportError::Negotiation(e.to_string()))
    }

    async fn set_remote_description(&self, desc: SessionDescriptor) -> Result<(), TransportError> {
        self.pc
            .set_remote_description(to_rtc(desc)?)
            .await
            .map_err(|e| TransportError::Negotiation(e.to_string()))
    }

    async fn wait_gathering_complete(&self, timeout: Duration) -> GatheringOutcome {
        let mut rx = self.gathering_rx.clone();
        match tokio::time::timeout(timeout, rx.wait_for(|done| *done)).await {
            Ok(_) => GatheringOutcome::Complete,
            Err(_) => {
                warn!(target: "tether::transport", ?timeout, "candidate gathering timed out");
                GatheringOutcome::TimedOut
            }
        }
    }

    async fn local_description(&self) -> Option<SessionDescriptor> {
        self.pc.local_description().await.and_then(from_rtc)
    }

    fn state_stream(&self) -> watch::Receiver<PeerState> {
        self.state_rx.clone()
    }

    fn channel_open(&self) -> bool {
        self.channel_open.load(Ordering::SeqCst)
    }

    async fn send(&self, data: Bytes) -> Result<(), TransportError> {
        if !self.channel_open() {
            return Err(TransportError::ChannelNotOpen);
        }
        let dc = self.data_channel.read().await;
        let Some(dc) = dc.as_ref() else {
            return Err(TransportError::ChannelNotOpen);
        };
        dc.send(&data)
            .await
            .map(|_| ())
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    fn take_incoming(&self) -> Option<mpsc::UnboundedReceiver<Bytes>> {
        self.incoming.lock().unwrap().take()
    }

    async fn close(&self) {
        self.channel_open.store(false, Ordering::SeqCst);
        if let Err(err) = self.pc.close().await {
            warn!(target: "tether::transport", error = %err, "peer connection close failed");
        }
    }
}

/// Builds one [`WebRtcTransport`] per session attempt.
pub struct WebRtcTransportFactory {
    config: Config,
}

impl WebRtcTransportFactory {
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn create(&self, role: SessionRole) -> Result<Arc<dyn PeerTransport>, TransportError> {
        Ok(Arc::new(WebRtcTransport::new(role, &self.config).await?))
    }
}
