use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

pub mod chunk;
pub mod mock;
pub mod webrtc;

/// Which side of the handshake this endpoint plays. Fixed for the lifetime
/// of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    Offerer,
    Answerer,
}

/// Connection state reported by the peer transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DescriptorKind {
    Offer,
    Answer,
}

/// A session description as exchanged through the signaling store. The SDP
/// payload is opaque to this layer beyond routing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionDescriptor {
    #[serde(rename = "type")]
    pub kind: DescriptorKind,
    pub sdp: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatheringOutcome {
    Complete,
    TimedOut,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("data channel is not open")]
    ChannelNotOpen,
    #[error("send failed: {0}")]
    Send(String),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("transport closed")]
    Closed,
}

/// The peer-to-peer engine as seen by this layer: offer/answer primitives,
/// a gathering-complete signal and one reliable byte channel. ICE, DTLS and
/// media stay behind this trait.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescriptor, TransportError>;

    async fn create_answer(&self) -> Result<SessionDescriptor, TransportError>;

    async fn set_local_description(&self, desc: SessionDescriptor) -> Result<(), TransportError>;

    async fn set_remote_description(&self, desc: SessionDescriptor) -> Result<(), TransportError>;

    /// Resolves once the transport will produce no further candidates, or at
    /// the deadline. Completion is remembered: calling this after gathering
    /// finished returns immediately.
    async fn wait_gathering_complete(&self, timeout: Duration) -> GatheringOutcome;

    /// The local description with every candidate gathered so far embedded.
    async fn local_description(&self) -> Option<SessionDescriptor>;

    fn state_stream(&self) -> watch::Receiver<PeerState>;

    fn channel_open(&self) -> bool;

    /// Send one message over the control channel. Fails fast when the
    /// channel is not open; message boundaries are preserved per call.
    async fn send(&self, data: Bytes) -> Result<(), TransportError>;

    /// Hand out the inbound message stream. Yields `Some` exactly once.
    fn take_incoming(&self) -> Option<mpsc::UnboundedReceiver<Bytes>>;

    async fn close(&self);
}

/// Creates a fresh transport for a session attempt. The coordinator goes
/// through this both on initial connect and on its controlled restart.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(&self, role: SessionRole) -> Result<Arc<dyn PeerTransport>, TransportError>;
}
