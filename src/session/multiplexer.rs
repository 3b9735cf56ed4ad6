//! Control channel multiplexer.
//!
//! Everything that crosses the control data channel goes through here:
//! outbound envelopes are chunked and sent in order, inbound bytes are
//! reassembled, decoded and routed. Telemetry producers hand their
//! envelopes to [`ControlChannelMultiplexer::enqueue_telemetry`], which
//! applies per-origin rate limiting and batches notification traffic.

use bytes::Bytes;
use serde_json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::capability::CapabilityRegistry;
use crate::config::Config;
use crate::protocol::{CommandToken, Envelope, EnvelopeBody, ack_token, is_ack_token};
use crate::transport::chunk::{
    MAX_MESSAGE_BYTES, Reassembler, decode_frame, encode_frame, split_message,
};
use crate::transport::{PeerTransport, TransportError};

#[derive(Debug, Error)]
pub enum MuxError {
    #[error("message of {0} bytes exceeds the {MAX_MESSAGE_BYTES} byte limit")]
    Oversized(usize),
    #[error("sent {sent} of {total} chunks before the transport failed: {source}")]
    PartialSend {
        sent: u32,
        total: u32,
        source: TransportError,
    },
    #[error("envelope serialization failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("multiplexer is closed")]
    Closed,
}

/// Sliding-window admission per telemetry origin.
struct OriginWindow {
    count: u32,
    window_start: Instant,
    dropped: u64,
}

struct RateLimiter {
    ceiling: u32,
    window: std::time::Duration,
    origins: HashMap<String, OriginWindow>,
}

impl RateLimiter {
    fn new(ceiling: u32, window: std::time::Duration) -> Self {
        Self {
            ceiling,
            window,
            origins: HashMap::new(),
        }
    }

    fn admit(&mut self, origin: &str, now: Instant) -> bool {
        let entry = self
            .origins
            .entry(origin.to_string())
            .or_insert_with(|| OriginWindow {
                count: 0,
                window_start: now,
                dropped: 0,
            });
        if now.duration_since(entry.window_start) >= self.window {
            entry.count = 0;
            entry.window_start = now;
        }
        if entry.count >= self.ceiling {
            entry.dropped += 1;
            false
        } else {
            entry.count += 1;
            true
        }
    }

    fn drop_count(&self, origin: &str) -> u64 {
        self.origins.get(origin).map(|o| o.dropped).unwrap_or(0)
    }
}

type SnapshotSource = Box<dyn Fn() -> Vec<Envelope> + Send + Sync>;

pub struct ControlChannelMultiplexer {
    transport: Arc<dyn PeerTransport>,
    registry: Arc<CapabilityRegistry>,
    next_msg_id: AtomicU64,
    batch_capacity: usize,
    batch_flush_interval: std::time::Duration,
    reassembly_ttl: std::time::Duration,
    batch: AsyncMutex<Vec<Envelope>>,
    limiter: Mutex<RateLimiter>,
    /// Serializes whole-message chunk bursts so two large envelopes never
    /// interleave on the wire.
    send_gate: AsyncMutex<()>,
    snapshot_source: Mutex<Option<SnapshotSource>>,
    inbound_tx: mpsc::UnboundedSender<Envelope>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Envelope>>>,
    closed: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ControlChannelMultiplexer {
    pub fn new(
        transport: Arc<dyn PeerTransport>,
        registry: Arc<CapabilityRegistry>,
        config: &Config,
    ) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            transport,
            registry,
            next_msg_id: AtomicU64::new(1),
            batch_capacity: config.batch_capacity,
            batch_flush_interval: config.batch_flush_interval,
            reassembly_ttl: config.reassembly_ttl,
            batch: AsyncMutex::new(Vec::new()),
            limiter: Mutex::new(RateLimiter::new(
                config.rate_limit_ceiling,
                config.rate_limit_window,
            )),
            send_gate: AsyncMutex::new(()),
            snapshot_source: Mutex::new(None),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            closed: AtomicBool::new(false),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Install the provider queried when a `NOTIF_SNAPSHOT` command arrives.
    pub fn set_snapshot_source<F>(&self, source: F)
    where
        F: Fn() -> Vec<Envelope> + Send + Sync + 'static,
    {
        *self.snapshot_source.lock().unwrap() = Some(Box::new(source));
    }

    /// Receiver for inbound envelopes that are not commands (telemetry,
    /// acks, pongs). Can only be taken once.
    pub fn take_inbound(&self) -> Option<mpsc::UnboundedReceiver<Envelope>> {
        self.inbound_rx.lock().unwrap().take()
    }

    /// Spawn the inbound routing loop and the periodic batch flusher.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().unwrap();
        if !tasks.is_empty() {
            return;
        }

        if let Some(incoming) = self.transport.take_incoming() {
            let mux = self.clone();
            let shutdown = self.shutdown_tx.subscribe();
            tasks.push(tokio::spawn(async move {
                mux.inbound_loop(incoming, shutdown).await;
            }));
        } else {
            warn!(target: "tether::mux", "transport incoming stream already taken");
        }

        let mux = self.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(mux.batch_flush_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = mux.flush().await {
                            debug!(target: "tether::mux", error = %err, "periodic flush failed");
                        }
                    }
                    _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => break,
                }
            }
        }));
    }

    /// Serialize, chunk and send one envelope. Chunks go out strictly in
    /// order; a mid-message transport failure aborts the rest.
    pub async fn send_envelope(&self, envelope: &Envelope) -> Result<(), MuxError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MuxError::Closed);
        }
        let payload = serde_json::to_vec(envelope)?;
        if payload.len() > MAX_MESSAGE_BYTES {
            warn!(target: "tether::mux", bytes = payload.len(), "rejecting oversized envelope");
            return Err(MuxError::Oversized(payload.len()));
        }
        let msg_id = self.next_msg_id.fetch_add(1, Ordering::SeqCst);
        let frames = split_message(&payload, msg_id).map_err(|_| MuxError::Oversized(payload.len()))?;
        let total = frames.len() as u32;

        let _gate = self.send_gate.lock().await;
        for (sent, frame) in frames.iter().enumerate() {
            if let Err(err) = self.transport.send(encode_frame(frame)).await {
                return Err(MuxError::PartialSend {
                    sent: sent as u32,
                    total,
                    source: err,
                });
            }
        }
        trace!(target: "tether::mux", msg_id, chunks = total, "envelope sent");
        Ok(())
    }

    /// Admit one telemetry envelope from `origin`. Batchable envelopes are
    /// buffered for the next flush; everything else goes out immediately.
    /// Returns `Ok(false)` when the rate limiter dropped the envelope.
    pub async fn enqueue_telemetry(
        &self,
        origin: &str,
        envelope: Envelope,
    ) -> Result<bool, MuxError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MuxError::Closed);
        }
        let admitted = self.limiter.lock().unwrap().admit(origin, Instant::now());
        if !admitted {
            trace!(target: "tether::mux", origin, "telemetry dropped by rate limiter");
            return Ok(false);
        }

        if envelope.is_batchable() {
            let flush_now = {
                let mut batch = self.batch.lock().await;
                batch.push(envelope);
                batch.len() >= self.batch_capacity
            };
            if flush_now {
                self.flush().await?;
            }
        } else {
            self.send_envelope(&envelope).await?;
        }
        Ok(true)
    }

    /// Observed rate-limiter drops for one origin.
    pub fn drop_count(&self, origin: &str) -> u64 {
        self.limiter.lock().unwrap().drop_count(origin)
    }

    /// Send everything buffered. A single buffered envelope goes out alone;
    /// two or more are wrapped in `notification_batch` envelopes, split so
    /// no wrapped batch exceeds the message size limit.
    pub async fn flush(&self) -> Result<(), MuxError> {
        let pending = {
            let mut batch = self.batch.lock().await;
            if batch.is_empty() {
                return Ok(());
            }
            std::mem::take(&mut *batch)
        };
        for group in batch_groups(pending) {
            if group.len() == 1 {
                self.send_envelope(&group[0]).await?;
            } else {
                debug!(target: "tether::mux", envelopes = group.len(), "flushing notification batch");
                self.send_envelope(&Envelope::notification_batch(group))
                    .await?;
            }
        }
        Ok(())
    }

    /// Flush what remains and stop the background tasks. Idempotent. The
    /// transport itself is left to the session coordinator.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let pending = std::mem::take(&mut *self.batch.lock().await);
        for group in batch_groups(pending) {
            let envelope = if group.len() == 1 {
                match group.into_iter().next() {
                    Some(env) => env,
                    None => continue,
                }
            } else {
                Envelope::notification_batch(group)
            };
            if let Err(err) = self.final_send(&envelope).await {
                debug!(target: "tether::mux", error = %err, "final flush failed");
                break;
            }
        }
        self.shutdown_tx.send_replace(true);
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }

    // send_envelope refuses once closed, so the closing flush bypasses
    // the flag check.
    async fn final_send(&self, envelope: &Envelope) -> Result<(), MuxError> {
        let payload = serde_json::to_vec(envelope)?;
        if payload.len() > MAX_MESSAGE_BYTES {
            return Err(MuxError::Oversized(payload.len()));
        }
        let msg_id = self.next_msg_id.fetch_add(1, Ordering::SeqCst);
        let frames = split_message(&payload, msg_id).map_err(|_| MuxError::Oversized(payload.len()))?;
        let _gate = self.send_gate.lock().await;
        for frame in &frames {
            self.transport.send(encode_frame(frame)).await?;
        }
        Ok(())
    }

    async fn inbound_loop(
        self: Arc<Self>,
        mut incoming: mpsc::UnboundedReceiver<Bytes>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut reassembler = Reassembler::new(self.reassembly_ttl);
        let mut gc_tick = tokio::time::interval(self.reassembly_ttl);
        gc_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                maybe = incoming.recv() => {
                    let Some(bytes) = maybe else { break };
                    self.handle_inbound(&mut reassembler, bytes).await;
                }
                _ = gc_tick.tick() => {
                    let expired = reassembler.gc(Instant::now());
                    if expired > 0 {
                        warn!(target: "tether::mux", expired, "discarded stale partial messages");
                    }
                }
                _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => break,
            }
        }
    }

    async fn handle_inbound(&self, reassembler: &mut Reassembler, bytes: Bytes) {
        let message = match decode_frame(&bytes) {
            Ok(Some(frame)) => match reassembler.ingest(frame, Instant::now()) {
                Ok(Some(complete)) => complete,
                Ok(None) => return,
                Err(err) => {
                    warn!(target: "tether::mux", error = %err, "dropping malformed chunked message");
                    return;
                }
            },
            // Not framed: legacy peers send bare command tokens.
            Ok(None) => bytes,
            Err(err) => {
                warn!(target: "tether::mux", error = %err, "dropping malformed frame");
                return;
            }
        };

        match serde_json::from_slice::<Envelope>(&message) {
            Ok(envelope) => self.route_envelope(envelope).await,
            Err(_) => {
                // Bare token tolerance for peers predating envelopes.
                if let Ok(text) = std::str::from_utf8(&message) {
                    let token = text.trim();
                    if CommandToken::parse(token).is_some() {
                        debug!(target: "tether::mux", token, "legacy bare command token");
                        self.handle_command(token).await;
                        return;
                    }
                }
                warn!(target: "tether::mux", bytes = message.len(), "undecodable inbound message");
            }
        }
    }

    async fn route_envelope(&self, envelope: Envelope) {
        match &envelope.body {
            EnvelopeBody::Command { token } if !is_ack_token(token) => {
                let token = token.clone();
                self.handle_command(&token).await;
            }
            _ => {
                // Acks and telemetry go to the consumer. Receiver gone just
                // means nobody is listening.
                let _ = self.inbound_tx.send(envelope);
            }
        }
    }

    async fn handle_command(&self, token: &str) {
        let Some(command) = CommandToken::parse(token) else {
            // Version skew: a newer peer may know commands we do not.
            // Acknowledge the no-op so the sender is not left waiting.
            debug!(target: "tether::mux", token, "unknown command token, acking as no-op");
            let reply = Envelope::command(ack_token(
                token,
                &crate::capability::AckKind::Stopped,
            ));
            if let Err(err) = self.send_envelope(&reply).await {
                warn!(target: "tether::mux", error = %err, token, "failed to ack unknown command");
            }
            return;
        };
        match command {
            CommandToken::Ping => {
                let pong = Envelope::pong(chrono::Utc::now().timestamp_millis());
                if let Err(err) = self.send_envelope(&pong).await {
                    warn!(target: "tether::mux", error = %err, "failed to answer ping");
                }
            }
            CommandToken::NotifSnapshot => {
                let items = self.snapshot_source.lock().unwrap().as_ref().map(|f| f());
                let reply = match items {
                    Some(items) => Envelope::notification_snapshot(items),
                    None => Envelope::command(ack_token(
                        token,
                        &crate::capability::AckKind::Error("snapshot unavailable".to_string()),
                    )),
                };
                if let Err(err) = self.send_envelope(&reply).await {
                    warn!(target: "tether::mux", error = %err, "failed to send notification snapshot");
                }
            }
            other => {
                let Some((capability, action)) = other.capability() else {
                    return;
                };
                let ack = self.registry.dispatch(capability, action).await;
                let reply = Envelope::command(ack_token(token, &ack));
                if let Err(err) = self.send_envelope(&reply).await {
                    warn!(target: "tether::mux", error = %err, token, "failed to send command ack");
                }
            }
        }
    }
}

// The wrapper envelope costs the schema fields plus the `items` array
// syntax on top of the summed item payloads.
const BATCH_WRAPPER_BYTES: usize = 128;

/// Splits buffered envelopes into groups whose wrapped batch stays under
/// the message size limit. An envelope that cannot be sized is given its
/// own group so only that send can fail.
fn batch_groups(pending: Vec<Envelope>) -> Vec<Vec<Envelope>> {
    let mut groups = Vec::new();
    let mut current = Vec::new();
    let mut current_bytes = BATCH_WRAPPER_BYTES;
    for envelope in pending {
        let size = serde_json::to_vec(&envelope)
            .map(|v| v.len())
            .unwrap_or(MAX_MESSAGE_BYTES);
        if !current.is_empty() && current_bytes + size + 1 > MAX_MESSAGE_BYTES {
            groups.push(std::mem::take(&mut current));
            current_bytes = BATCH_WRAPPER_BYTES;
        }
        current_bytes += size + 1;
        current.push(envelope);
    }
    if !current.is_empty() {
        groups.push(current);
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn limiter_enforces_ceiling_per_window() {
        let mut limiter = RateLimiter::new(3, Duration::from_secs(60));
        let now = Instant::now();
        assert!(limiter.admit("a", now));
        assert!(limiter.admit("a", now));
        assert!(limiter.admit("a", now));
        assert!(!limiter.admit("a", now));
        assert!(!limiter.admit("a", now));
        assert_eq!(limiter.drop_count("a"), 2);
    }

    #[test]
    fn limiter_resets_after_window() {
        let mut limiter = RateLimiter::new(1, Duration::from_millis(10));
        let start = Instant::now();
        assert!(limiter.admit("a", start));
        assert!(!limiter.admit("a", start));
        assert!(limiter.admit("a", start + Duration::from_millis(11)));
    }

    #[test]
    fn limiter_isolates_origins() {
        let mut limiter = RateLimiter::new(1, Duration::from_secs(60));
        let now = Instant::now();
        assert!(limiter.admit("a", now));
        assert!(limiter.admit("b", now));
        assert!(!limiter.admit("a", now));
        assert_eq!(limiter.drop_count("a"), 1);
        assert_eq!(limiter.drop_count("b"), 0);
    }
}
