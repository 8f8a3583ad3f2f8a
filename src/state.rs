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

//! Session state management.
//!
//! All writers funnel through [`SessionStore::apply`], which folds one
//! [`SessionEvent`] at a time into the current snapshot under the watch
//! channel's lock. Subscribers always see whole snapshots, and a late
//! subscriber immediately sees the latest one.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

use crate::bluetooth::{ChatMessage, ConnectionOutcome, DeviceSet};

/// Externally observable state of the chat session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionState {
    /// Incremented on every applied event.
    pub version: u64,
    pub paired_devices: DeviceSet,
    pub scanned_devices: DeviceSet,
    pub is_connected: bool,
    pub is_connecting: bool,
    /// A server socket is open and no peer has connected yet.
    pub is_waiting_for_inbound: bool,
    pub is_discovering: bool,
    pub is_discovery_finished: bool,
    pub last_error: Option<String>,
    /// Sent and received messages, oldest first.
    pub message_log: Vec<ChatMessage>,
}

/// Everything that can change the session state.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    PairedDevicesChanged(DeviceSet),
    ScannedDevicesChanged(DeviceSet),
    DiscoveryStarted,
    /// Discovery cancelled locally.
    DiscoveryStopped,
    /// The radio ended the discovery cycle.
    DiscoveryFinished,
    ListeningStarted,
    ConnectingStarted,
    /// One item from a connection outcome stream.
    Outcome(ConnectionOutcome),
    /// Link-level connection change reported by the platform for a paired peer.
    ConnectionStateChanged(bool),
    /// The user tore the connection or listen attempt down.
    ConnectionReset,
    MessageSent(ChatMessage),
    ErrorRaised(String),
    ErrorDismissed,
}

impl SessionState {
    /// Produce the snapshot that follows `event`.
    pub fn apply(mut self, event: SessionEvent) -> Self {
        self.version += 1;
        match event {
            SessionEvent::PairedDevicesChanged(devices) => self.paired_devices = devices,
            SessionEvent::ScannedDevicesChanged(devices) => self.scanned_devices = devices,
            SessionEvent::DiscoveryStarted => {
                self.is_discovering = true;
                self.is_discovery_finished = false;
                self.is_connecting = false;
                self.is_waiting_for_inbound = false;
            }
            SessionEvent::DiscoveryStopped => self.is_discovering = false,
            SessionEvent::DiscoveryFinished => {
                self.is_discovering = false;
                self.is_discovery_finished = true;
            }
            SessionEvent::ListeningStarted => {
                self.is_waiting_for_inbound = true;
                self.is_connecting = false;
                self.is_connected = false;
                self.is_discovering = false;
            }
            SessionEvent::ConnectingStarted => {
                self.is_connecting = true;
                self.is_waiting_for_inbound = false;
                self.is_connected = false;
                self.is_discovering = false;
            }
            SessionEvent::Outcome(ConnectionOutcome::Established) => {
                self.is_connected = true;
                self.is_connecting = false;
                self.is_waiting_for_inbound = false;
                self.last_error = None;
            }
            SessionEvent::Outcome(ConnectionOutcome::TransferReceived(message)) => {
                self.message_log.push(message);
            }
            SessionEvent::Outcome(ConnectionOutcome::Failed(reason)) => {
                self.is_connected = false;
                self.is_connecting = false;
                self.is_waiting_for_inbound = false;
                self.last_error = Some(reason);
            }
            SessionEvent::ConnectionStateChanged(connected) => {
                self.is_connected = connected;
                if connected {
                    self.is_connecting = false;
                    self.is_waiting_for_inbound = false;
                }
            }
            SessionEvent::ConnectionReset => {
                self.is_connected = false;
                self.is_connecting = false;
                self.is_waiting_for_inbound = false;
            }
            SessionEvent::MessageSent(message) => self.message_log.push(message),
            SessionEvent::ErrorRaised(error) => self.last_error = Some(error),
            SessionEvent::ErrorDismissed => self.last_error = None,
        }
        self
    }
}

/// Single-writer publisher of [`SessionState`] snapshots.
#[derive(Clone)]
pub struct SessionStore {
    tx: Arc<watch::Sender<SessionState>>,
}

impl SessionStore {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(SessionState::default());
        Self { tx: Arc::new(tx) }
    }

    /// Fold one event into the current snapshot and publish the result.
    pub fn apply(&self, event: SessionEvent) {
        debug!("Session event: {:?}", event);
        self.tx.send_modify(|state| {
            let current = std::mem::take(state);
            *state = current.apply(event);
        });
    }

    /// Subscribe to snapshots. The receiver starts at the latest one.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> SessionState {
        self.tx.borrow().clone()
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::RemoteDevice;
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    fn event_strategy() -> impl Strategy<Value = SessionEvent> {
        prop_oneof![
            Just(SessionEvent::DiscoveryStarted),
            Just(SessionEvent::DiscoveryStopped),
            Just(SessionEvent::DiscoveryFinished),
            Just(SessionEvent::ListeningStarted),
            Just(SessionEvent::ConnectingStarted),
            Just(SessionEvent::Outcome(ConnectionOutcome::Established)),
            Just(SessionEvent::Outcome(ConnectionOutcome::Failed("boom".into()))),
            Just(SessionEvent::ConnectionReset),
            any::<bool>().prop_map(SessionEvent::ConnectionStateChanged),
            Just(SessionEvent::ErrorDismissed),
        ]
    }

    #[test]
    fn test_established_after_listening() {
        let state = SessionState::default()
            .apply(SessionEvent::ListeningStarted)
            .apply(SessionEvent::Outcome(ConnectionOutcome::Established));
        assert!(state.is_connected);
        assert!(!state.is_waiting_for_inbound);
        assert_eq!(state.version, 2);
    }

    #[test]
    fn test_failed_records_error() {
        let state = SessionState::default()
            .apply(SessionEvent::ConnectingStarted)
            .apply(SessionEvent::Outcome(ConnectionOutcome::Failed(
                "Connection was interrupted: refused".into(),
            )));
        assert!(!state.is_connected);
        assert!(!state.is_connecting);
        assert_eq!(
            state.last_error.as_deref(),
            Some("Connection was interrupted: refused")
        );

        let state = state.apply(SessionEvent::ErrorDismissed);
        assert!(state.last_error.is_none());
    }

    #[test]
    fn test_message_log_keeps_order() {
        let state = SessionState::default()
            .apply(SessionEvent::MessageSent(ChatMessage::local("me", "one")))
            .apply(SessionEvent::Outcome(ConnectionOutcome::TransferReceived(
                ChatMessage::remote("peer", "two"),
            )));
        let bodies: Vec<_> = state.message_log.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, ["one", "two"]);
    }

    #[test]
    fn test_discovery_finished_then_restarted() {
        let state = SessionState::default()
            .apply(SessionEvent::DiscoveryStarted)
            .apply(SessionEvent::DiscoveryFinished);
        assert!(!state.is_discovering);
        assert!(state.is_discovery_finished);

        let state = state.apply(SessionEvent::DiscoveryStarted);
        assert!(state.is_discovering);
        assert!(!state.is_discovery_finished);
    }

    #[test]
    fn test_store_publishes_to_late_subscribers() {
        let store = SessionStore::new();
        let devices: DeviceSet = Arc::new(BTreeSet::from([RemoteDevice::new("AA:AA:AA:AA:AA:AA")]));
        store.apply(SessionEvent::PairedDevicesChanged(devices));

        let rx = store.subscribe();
        assert_eq!(rx.borrow().paired_devices.len(), 1);
        assert_eq!(store.snapshot().version, 1);
    }

    proptest! {
        #[test]
        fn prop_connected_and_connecting_exclusive(events in proptest::collection::vec(event_strategy(), 0..64)) {
            let mut state = SessionState::default();
            for event in events {
                state = state.apply(event);
                prop_assert!(!(state.is_connected && state.is_connecting));
                let active = [state.is_discovering, state.is_connecting, state.is_waiting_for_inbound]
                    .iter()
                    .filter(|flag| **flag)
                    .count();
                prop_assert!(active <= 1);
            }
        }
    }
}
