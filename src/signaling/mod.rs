//! Session descriptor exchange through a shared signaling store.
//!
//! Each session owns a `calls/{session_id}/` subtree with one slot per
//! descriptor direction. A peer only ever writes its own slot and
//! subscribes to the remote one, so the two sides never race on a path.

pub mod memory;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::transport::SessionRole;

/// Signaling slots under a session's subtree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalSlot {
    Offer,
    Answer,
    /// Reserved for trickle candidates. Nothing writes it today; the
    /// non-trickle flow embeds candidates in the descriptors.
    Candidates,
}

impl SignalSlot {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalSlot::Offer => "offer",
            SignalSlot::Answer => "answer",
            SignalSlot::Candidates => "candidates",
        }
    }
}

/// Full store path for a slot, e.g. `calls/abc123/offer`.
pub fn slot_path(session_id: &str, slot: SignalSlot) -> String {
    format!("calls/{}/{}", session_id, slot.as_str())
}

/// The slot this role publishes to.
pub fn local_slot(role: SessionRole) -> SignalSlot {
    match role {
        SessionRole::Offerer => SignalSlot::Offer,
        SessionRole::Answerer => SignalSlot::Answer,
    }
}

/// The slot this role watches.
pub fn remote_slot(role: SessionRole) -> SignalSlot {
    match role {
        SessionRole::Offerer => SignalSlot::Answer,
        SessionRole::Answerer => SignalSlot::Offer,
    }
}

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("signaling write failed: {0}")]
    Write(String),
    #[error("signaling subscribe failed: {0}")]
    Subscribe(String),
    #[error("signaling store unavailable: {0}")]
    Unavailable(String),
}

/// Backend-agnostic signaling store.
///
/// Subscriptions deliver the current value first (when one exists), then
/// every subsequent write to the path. A rewrite of the same slot during
/// renegotiation arrives as a fresh delivery.
#[async_trait]
pub trait SignalingStore: Send + Sync {
    async fn write(&self, path: &str, value: Value) -> Result<(), SignalingError>;

    async fn subscribe(
        &self,
        path: &str,
    ) -> Result<mpsc::UnboundedReceiver<Value>, SignalingError>;

    /// Idempotent; unknown paths are a no-op.
    async fn unsubscribe(&self, path: &str);

    /// Removes a single path. Used to clear a peer's own stale slot
    /// before republishing after a transport restart.
    async fn remove(&self, path: &str) -> Result<(), SignalingError>;

    /// Removes the whole `calls/{session_id}/` subtree.
    async fn cleanup(&self, session_id: &str) -> Result<(), SignalingError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_paths_are_role_scoped() {
        assert_eq!(slot_path("s1", SignalSlot::Offer), "calls/s1/offer");
        assert_eq!(slot_path("s1", SignalSlot::Answer), "calls/s1/answer");
        assert_eq!(local_slot(SessionRole::Offerer), SignalSlot::Offer);
        assert_eq!(remote_slot(SessionRole::Offerer), SignalSlot::Answer);
        assert_eq!(local_slot(SessionRole::Answerer), SignalSlot::Answer);
        assert_eq!(remote_slot(SessionRole::Answerer), SignalSlot::Offer);
    }
}
