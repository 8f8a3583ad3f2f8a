// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! User-facing chat session.
//!
//! Turns user intents into controller calls and folds every connection
//! outcome into the [`SessionStore`] in arrival order.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::bluetooth::{
    BluetoothAdapter, BluetoothController, ChatMessage, ConnectionOutcome, ControllerSettings,
    DeviceSet, PermissionGuard, RemoteDevice,
};
use crate::state::{SessionEvent, SessionState, SessionStore};

/// A chat session over one Bluetooth adapter.
pub struct ChatSession {
    controller: Arc<BluetoothController>,
    store: SessionStore,
    /// Task folding the current outcome stream into the store.
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl ChatSession {
    /// Create a new session. Paired devices are loaded immediately.
    pub async fn new(
        adapter: Arc<dyn BluetoothAdapter>,
        permissions: Arc<dyn PermissionGuard>,
        settings: ControllerSettings,
    ) -> Self {
        let store = SessionStore::new();
        let controller =
            BluetoothController::new(adapter, permissions, settings, store.clone()).await;
        Self {
            controller,
            store,
            consumer: Mutex::new(None),
        }
    }

    pub fn controller(&self) -> &Arc<BluetoothController> {
        &self.controller
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.store.subscribe()
    }

    pub fn snapshot(&self) -> SessionState {
        self.store.snapshot()
    }

    /// Start scanning. A pending host or connect attempt is dropped.
    pub async fn start_scan(&self) {
        let state = self.snapshot();
        if state.is_waiting_for_inbound || state.is_connecting {
            self.abort_attempt();
        }
        self.controller.start_discovery().await;
    }

    pub async fn stop_scan(&self) {
        self.controller.stop_discovery().await;
    }

    pub async fn refresh_paired_devices(&self) -> DeviceSet {
        self.controller.refresh_paired().await
    }

    /// Open the server socket and wait for a peer.
    pub async fn host_chat(&self) {
        self.stop_consumer();
        self.controller.stop_discovery().await;
        self.store.apply(SessionEvent::ListeningStarted);
        match self.controller.start_server_and_wait().await {
            Ok(outcomes) => self.consume(outcomes),
            Err(e) => self
                .store
                .apply(SessionEvent::Outcome(ConnectionOutcome::Failed(e.to_string()))),
        }
    }

    /// Connect to a remote device.
    pub async fn connect_to_device(&self, device: &RemoteDevice) {
        self.stop_consumer();
        self.controller.stop_discovery().await;
        self.store.apply(SessionEvent::ConnectingStarted);
        match self.controller.connect_to(device).await {
            Ok(outcomes) => self.consume(outcomes),
            Err(e) => self
                .store
                .apply(SessionEvent::Outcome(ConnectionOutcome::Failed(e.to_string()))),
        }
    }

    pub fn disconnect_from_device(&self) {
        info!("Disconnecting");
        self.abort_attempt();
    }

    pub fn stop_listening_for_incoming_connections(&self) {
        info!("Stopped listening for incoming connections");
        self.abort_attempt();
    }

    /// Send a message to the connected peer.
    ///
    /// Leading and trailing whitespace is trimmed; empty input is ignored.
    /// The sent message is appended to the log even if the write failed.
    pub async fn send_message(&self, text: &str) -> Option<ChatMessage> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        let message = self.controller.send(text).await?;
        self.store.apply(SessionEvent::MessageSent(message.clone()));
        Some(message)
    }

    pub fn dismiss_error(&self) {
        self.store.apply(SessionEvent::ErrorDismissed);
    }

    /// Release the controller. Later calls do nothing.
    pub fn shutdown(&self) {
        self.stop_consumer();
        self.controller.release();
    }

    fn abort_attempt(&self) {
        self.stop_consumer();
        self.controller.disconnect();
        self.store.apply(SessionEvent::ConnectionReset);
    }

    fn stop_consumer(&self) {
        if let Some(consumer) = self.consumer.lock().take() {
            debug!("Stopping outcome consumer");
            consumer.abort();
        }
    }

    fn consume(&self, mut outcomes: mpsc::Receiver<ConnectionOutcome>) {
        let store = self.store.clone();
        let handle = tokio::spawn(async move {
            while let Some(outcome) = outcomes.recv().await {
                store.apply(SessionEvent::Outcome(outcome));
            }
        });
        *self.consumer.lock() = Some(handle);
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}
