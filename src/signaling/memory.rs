//! In-process signaling store.
//!
//! Backs tests and single-host deployments where both peers live in the
//! same process. Last write wins per path; subscribers get the current
//! value on attach followed by every later write.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use super::{SignalingError, SignalingStore};

#[derive(Default)]
struct State {
    values: HashMap<String, Value>,
    subscribers: HashMap<String, Vec<mpsc::UnboundedSender<Value>>>,
}

#[derive(Clone, Default)]
pub struct InMemorySignalingStore {
    state: Arc<Mutex<State>>,
}

impl InMemorySignalingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value at a path, if any. Test accessor.
    pub fn read(&self, path: &str) -> Option<Value> {
        self.state.lock().unwrap().values.get(path).cloned()
    }
}

#[async_trait]
impl SignalingStore for InMemorySignalingStore {
    async fn write(&self, path: &str, value: Value) -> Result<(), SignalingError> {
        let mut state = self.state.lock().unwrap();
        state.values.insert(path.to_string(), value.clone());
        if let Some(subs) = state.subscribers.get_mut(path) {
            subs.retain(|tx| tx.send(value.clone()).is_ok());
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        path: &str,
    ) -> Result<mpsc::UnboundedReceiver<Value>, SignalingError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock().unwrap();
        if let Some(current) = state.values.get(path) {
            let _ = tx.send(current.clone());
        }
        state.subscribers.entry(path.to_string()).or_default().push(tx);
        Ok(rx)
    }

    async fn unsubscribe(&self, path: &str) {
        self.state.lock().unwrap().subscribers.remove(path);
    }

    async fn remove(&self, path: &str) -> Result<(), SignalingError> {
        self.state.lock().unwrap().values.remove(path);
        Ok(())
    }

    async fn cleanup(&self, session_id: &str) -> Result<(), SignalingError> {
        let prefix = format!("calls/{session_id}/");
        let mut state = self.state.lock().unwrap();
        state.values.retain(|path, _| !path.starts_with(&prefix));
        state.subscribers.retain(|path, _| !path.starts_with(&prefix));
        Ok(())
    }
}
