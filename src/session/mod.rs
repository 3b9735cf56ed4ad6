//! Session establishment and lifecycle.
//!
//! The [`SessionCoordinator`] drives the non-trickle handshake through the
//! signaling store, owns the transport and its control channel multiplexer,
//! coalesces renegotiation requests and performs one controlled restart
//! when the watchdog reports a sustained transport failure.

pub mod multiplexer;
pub mod watchdog;

pub use multiplexer::{ControlChannelMultiplexer, MuxError};
pub use watchdog::Verdict;

use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::capability::CapabilityRegistry;
use crate::config::{Config, GatheringTimeoutPolicy};
use crate::signaling::{SignalingError, SignalingStore, local_slot, remote_slot, slot_path};
use crate::transport::{
    DescriptorKind, GatheringOutcome, PeerState, PeerTransport, SessionDescriptor, SessionRole,
    TransportError, TransportFactory,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    AwaitingRemoteOffer,
    CreatingOffer,
    LocalDescriptionSet,
    GatheringCandidates,
    Published,
    Connected,
    Renegotiating,
    Failed,
    Closed,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error("descriptor encoding failed: {0}")]
    Descriptor(#[from] serde_json::Error),
    #[error("unexpected descriptor: {0}")]
    BadDescriptor(String),
    #[error("candidate gathering timed out")]
    GatheringTimeout,
    #[error("peer did not answer the renegotiation in time")]
    RenegotiationTimeout,
    #[error("no local description available to publish")]
    NoLocalDescription,
    #[error("controlled restart already used")]
    RestartExhausted,
    #[error("session is closed")]
    Closed,
}

struct Core {
    transport: Option<Arc<dyn PeerTransport>>,
    mux: Option<Arc<ControlChannelMultiplexer>>,
    /// Tasks tied to the current transport generation (remote descriptor
    /// loop). Replaced on restart.
    attempt_tasks: Vec<JoinHandle<()>>,
}

#[derive(Default)]
struct RenegState {
    in_flight: bool,
    pending: bool,
}

pub struct SessionCoordinator {
    session_id: String,
    role: SessionRole,
    config: Config,
    store: Arc<dyn SignalingStore>,
    factory: Arc<dyn TransportFactory>,
    registry: Arc<CapabilityRegistry>,
    core: AsyncMutex<Core>,
    reneg: Mutex<RenegState>,
    /// Signaled whenever a remote answer has been applied.
    remote_applied: Notify,
    restart_used: AtomicBool,
    shutting_down: AtomicBool,
    state_tx: watch::Sender<SessionState>,
    shutdown_tx: watch::Sender<bool>,
    session_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SessionCoordinator {
    pub fn new(
        session_id: impl Into<String>,
        role: SessionRole,
        config: Config,
        store: Arc<dyn SignalingStore>,
        factory: Arc<dyn TransportFactory>,
        registry: Arc<CapabilityRegistry>,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(SessionState::Idle);
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            session_id: session_id.into(),
            role,
            config,
            store,
            factory,
            registry,
            core: AsyncMutex::new(Core {
                transport: None,
                mux: None,
                attempt_tasks: Vec::new(),
            }),
            reneg: Mutex::new(RenegState::default()),
            remote_applied: Notify::new(),
            restart_used: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            state_tx,
            shutdown_tx,
            session_tasks: Mutex::new(Vec::new()),
        })
    }

    /// Fresh random session id for the `calls/` subtree.
    pub fn generate_session_id() -> String {
        Uuid::new_v4().to_string()
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// The multiplexer of the current transport generation.
    pub async fn multiplexer(&self) -> Option<Arc<ControlChannelMultiplexer>> {
        self.core.lock().await.mux.clone()
    }

    /// Run the handshake to completion and start the background machinery:
    /// the renegotiation pump fed by `reneg_rx` and the transport watchdog.
    pub async fn connect(
        self: &Arc<Self>,
        mut reneg_rx: mpsc::UnboundedReceiver<()>,
    ) -> Result<(), SessionError> {
        if let Err(err) = self.establish().await {
            // A failure caused by a concurrent shutdown must not clobber
            // `Closed`.
            if !self.shutting_down.load(Ordering::SeqCst) {
                self.set_state(SessionState::Failed);
            }
            return Err(err);
        }

        let this = self.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        let pump = tokio::spawn(async move {
            loop {
                tokio::select! {
                    maybe = reneg_rx.recv() => {
                        if maybe.is_none() {
                            break;
                        }
                        this.request_renegotiation().await;
                    }
                    _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => break,
                }
            }
        });

        let this = self.clone();
        let supervisor = tokio::spawn(async move {
            this.supervise().await;
        });

        self.session_tasks.lock().unwrap().extend([pump, supervisor]);
        Ok(())
    }

    /// Fire-and-forget variant of [`connect`](Self::connect); progress is
    /// observed through [`state`](Self::state).
    pub fn spawn_connect(
        self: &Arc<Self>,
        reneg_rx: mpsc::UnboundedReceiver<()>,
    ) -> JoinHandle<Result<(), SessionError>> {
        let this = self.clone();
        tokio::spawn(async move { this.connect(reneg_rx).await })
    }

    /// Request a renegotiation cycle. Requests arriving while a cycle is in
    /// flight coalesce into exactly one follow-up cycle.
    pub async fn request_renegotiation(self: &Arc<Self>) {
        {
            let mut reneg = self.reneg.lock().unwrap();
            if reneg.in_flight {
                reneg.pending = true;
                return;
            }
            reneg.in_flight = true;
        }
        loop {
            if let Err(err) = self.renegotiate_once().await {
                warn!(target: "tether::session", session_id = %self.session_id, error = %err, "renegotiation cycle failed");
            }
            let mut reneg = self.reneg.lock().unwrap();
            if reneg.pending {
                reneg.pending = false;
            } else {
                reneg.in_flight = false;
                return;
            }
        }
    }

    /// Tear the session down: close the channel and transport, clear this
    /// session's signaling subtree, stop every task. Idempotent.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(target: "tether::session", session_id = %self.session_id, "shutting down");
        self.shutdown_tx.send_replace(true);
        {
            let mut core = self.core.lock().await;
            for task in core.attempt_tasks.drain(..) {
                task.abort();
            }
            if let Some(mux) = core.mux.take() {
                mux.close().await;
            }
            if let Some(transport) = core.transport.take() {
                transport.close().await;
            }
        }
        let remote = slot_path(&self.session_id, remote_slot(self.role));
        self.store.unsubscribe(&remote).await;
        if let Err(err) = self.store.cleanup(&self.session_id).await {
            warn!(target: "tether::session", error = %err, "signaling cleanup failed");
        }
        self.set_state(SessionState::Closed);
        // No awaits below this point; the supervisor reaches here too.
        for task in self.session_tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }

    // send_replace so transitions made before anyone subscribes still land.
    fn set_state(&self, state: SessionState) {
        debug!(target: "tether::session", session_id = %self.session_id, ?state, "state change");
        self.state_tx.send_replace(state);
    }

    async fn establish(self: &Arc<Self>) -> Result<(), SessionError> {
        let transport = self.factory.create(self.role).await?;
        self.set_state(match self.role {
            SessionRole::Offerer => SessionState::CreatingOffer,
            SessionRole::Answerer => SessionState::AwaitingRemoteOffer,
        });

        let remote_path = slot_path(&self.session_id, remote_slot(self.role));
        let mut remote_rx = self.store.subscribe(&remote_path).await?;

        match self.role {
            SessionRole::Offerer => {
                // An answer can only respond to the offer we are about to
                // publish; anything already in the slot is stale.
                while remote_rx.try_recv().is_ok() {}
                let offer = transport.create_offer().await?;
                transport.set_local_description(offer).await?;
                self.set_state(SessionState::LocalDescriptionSet);
                self.publish_local(&transport).await?;
                let answer = self
                    .await_descriptor(&mut remote_rx, DescriptorKind::Answer)
                    .await?;
                transport.set_remote_description(answer).await?;
                self.remote_applied.notify_waiters();
            }
            SessionRole::Answerer => {
                let offer = self
                    .await_descriptor(&mut remote_rx, DescriptorKind::Offer)
                    .await?;
                transport.set_remote_description(offer).await?;
                let answer = transport.create_answer().await?;
                transport.set_local_description(answer).await?;
                self.set_state(SessionState::LocalDescriptionSet);
                self.publish_local(&transport).await?;
            }
        }

        self.await_connected(&transport).await?;
        self.set_state(SessionState::Connected);
        info!(target: "tether::session", session_id = %self.session_id, role = ?self.role, "session connected");

        let mux = ControlChannelMultiplexer::new(transport.clone(), self.registry.clone(), &self.config);
        mux.start();

        let mut core = self.core.lock().await;
        core.transport = Some(transport);
        core.mux = Some(mux);
        let this = self.clone();
        let shutdown = self.shutdown_tx.subscribe();
        core.attempt_tasks.push(tokio::spawn(async move {
            this.remote_loop(remote_rx, shutdown).await;
        }));
        Ok(())
    }

    /// Gather, then publish the full local description into this role's slot.
    async fn publish_local(
        &self,
        transport: &Arc<dyn PeerTransport>,
    ) -> Result<(), SessionError> {
        self.set_state(SessionState::GatheringCandidates);
        self.wait_gathering(transport).await?;
        let desc = transport
            .local_description()
            .await
            .ok_or(SessionError::NoLocalDescription)?;
        self.publish_descriptor(&desc).await?;
        self.set_state(SessionState::Published);
        Ok(())
    }

    async fn publish_descriptor(&self, desc: &SessionDescriptor) -> Result<(), SessionError> {
        let path = slot_path(&self.session_id, local_slot(self.role));
        self.store.write(&path, serde_json::to_value(desc)?).await?;
        debug!(target: "tether::session", session_id = %self.session_id, kind = ?desc.kind, "descriptor published");
        Ok(())
    }

    async fn wait_gathering(
        &self,
        transport: &Arc<dyn PeerTransport>,
    ) -> Result<(), SessionError> {
        let mut shutdown = self.shutdown_tx.subscribe();
        let outcome = tokio::select! {
            outcome = transport.wait_gathering_complete(self.config.gathering_timeout) => outcome,
            _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => return Err(SessionError::Closed),
        };
        match outcome {
            GatheringOutcome::Complete => Ok(()),
            GatheringOutcome::TimedOut => match self.config.gathering_timeout_policy {
                GatheringTimeoutPolicy::PublishPartial => {
                    warn!(target: "tether::session", session_id = %self.session_id, "publishing partially gathered description");
                    Ok(())
                }
                GatheringTimeoutPolicy::FailSession => Err(SessionError::GatheringTimeout),
            },
        }
    }

    async fn await_descriptor(
        &self,
        rx: &mut mpsc::UnboundedReceiver<Value>,
        expected: DescriptorKind,
    ) -> Result<SessionDescriptor, SessionError> {
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::select! {
            maybe = rx.recv() => {
                let value = maybe.ok_or(SessionError::Closed)?;
                let desc: SessionDescriptor = serde_json::from_value(value)?;
                if desc.kind != expected {
                    return Err(SessionError::BadDescriptor(format!(
                        "expected {expected:?}, got {:?}",
                        desc.kind
                    )));
                }
                Ok(desc)
            }
            // wait_for sees a shutdown that completed before this
            // subscription was created.
            _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => Err(SessionError::Closed),
        }
    }

    async fn await_connected(
        &self,
        transport: &Arc<dyn PeerTransport>,
    ) -> Result<(), SessionError> {
        let mut states = transport.state_stream();
        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            match *states.borrow_and_update() {
                PeerState::Connected => return Ok(()),
                PeerState::Failed | PeerState::Closed => {
                    return Err(SessionError::Transport(TransportError::Closed));
                }
                _ => {}
            }
            tokio::select! {
                changed = states.changed() => {
                    changed.map_err(|_| SessionError::Transport(TransportError::Closed))?;
                }
                _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => {
                    return Err(SessionError::Closed);
                }
            }
        }
    }

    async fn current_transport(&self) -> Option<Arc<dyn PeerTransport>> {
        self.core.lock().await.transport.clone()
    }

    /// Follows the remote slot after establishment. Dispatch is by
    /// descriptor kind: a fresh offer means the peer (re)negotiates, a
    /// fresh answer completes a cycle we initiated.
    async fn remote_loop(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<Value>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    let Some(value) = maybe else { break };
                    let desc = match serde_json::from_value::<SessionDescriptor>(value) {
                        Ok(desc) => desc,
                        Err(err) => {
                            warn!(target: "tether::session", error = %err, "ignoring undecodable descriptor");
                            continue;
                        }
                    };
                    if let Err(err) = self.apply_remote(desc).await {
                        warn!(target: "tether::session", session_id = %self.session_id, error = %err, "failed to apply remote descriptor");
                    }
                }
                _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => break,
            }
        }
    }

    async fn apply_remote(&self, desc: SessionDescriptor) -> Result<(), SessionError> {
        let transport = self.current_transport().await.ok_or(SessionError::Closed)?;
        match desc.kind {
            DescriptorKind::Answer => {
                transport.set_remote_description(desc).await?;
                self.remote_applied.notify_waiters();
                Ok(())
            }
            DescriptorKind::Offer => {
                self.set_state(SessionState::Renegotiating);
                transport.set_remote_description(desc).await?;
                let answer = transport.create_answer().await?;
                transport.set_local_description(answer).await?;
                self.wait_gathering(&transport).await?;
                let local = transport
                    .local_description()
                    .await
                    .ok_or(SessionError::NoLocalDescription)?;
                self.publish_descriptor(&local).await?;
                self.set_state(SessionState::Connected);
                Ok(())
            }
        }
    }

    /// One offer/answer cycle driven from this side. The waiter for the
    /// peer's answer is registered before publishing so a fast reply
    /// cannot slip past it.
    async fn renegotiate_once(&self) -> Result<(), SessionError> {
        let transport = self.current_transport().await.ok_or(SessionError::Closed)?;
        self.set_state(SessionState::Renegotiating);
        let result = self.drive_offer_cycle(&transport).await;
        self.set_state(SessionState::Connected);
        result
    }

    async fn drive_offer_cycle(
        &self,
        transport: &Arc<dyn PeerTransport>,
    ) -> Result<(), SessionError> {
        let offer = transport.create_offer().await?;
        transport.set_local_description(offer).await?;
        self.wait_gathering(transport).await?;
        let local = transport
            .local_description()
            .await
            .ok_or(SessionError::NoLocalDescription)?;

        let applied = self.remote_applied.notified();
        tokio::pin!(applied);
        applied.as_mut().enable();

        self.publish_descriptor(&local).await?;

        match tokio::time::timeout(self.config.renegotiation_timeout, applied).await {
            Ok(()) => Ok(()),
            Err(_) => Err(SessionError::RenegotiationTimeout),
        }
    }

    /// Watches transport health across generations, restarting once on a
    /// sustained failure.
    async fn supervise(self: Arc<Self>) {
        loop {
            let Some(transport) = self.current_transport().await else {
                break;
            };
            let verdict = watchdog::watch(
                transport.state_stream(),
                self.config.watchdog_debounce,
                self.shutdown_tx.subscribe(),
            )
            .await;
            match verdict {
                Verdict::Ended => break,
                Verdict::SustainedFailure => {
                    if let Err(err) = self.restart().await {
                        error!(target: "tether::session", session_id = %self.session_id, error = %err, "restart failed, closing session");
                        self.set_state(SessionState::Failed);
                        self.shutdown().await;
                        break;
                    }
                }
            }
        }
    }

    /// The single controlled restart: tear down the failed generation,
    /// clear this side's signaling slot and rerun the handshake.
    async fn restart(self: &Arc<Self>) -> Result<(), SessionError> {
        if self.restart_used.swap(true, Ordering::SeqCst) {
            return Err(SessionError::RestartExhausted);
        }
        warn!(target: "tether::session", session_id = %self.session_id, "sustained transport failure, restarting");
        {
            let mut core = self.core.lock().await;
            for task in core.attempt_tasks.drain(..) {
                task.abort();
            }
            if let Some(mux) = core.mux.take() {
                mux.close().await;
            }
            if let Some(transport) = core.transport.take() {
                transport.close().await;
            }
        }
        let local = slot_path(&self.session_id, local_slot(self.role));
        if let Err(err) = self.store.remove(&local).await {
            warn!(target: "tether::session", error = %err, "failed to clear own signaling slot");
        }
        let remote = slot_path(&self.session_id, remote_slot(self.role));
        self.store.unsubscribe(&remote).await;
        self.establish().await
    }
}
