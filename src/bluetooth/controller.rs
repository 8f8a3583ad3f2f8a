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

//! Connection orchestration.
//!
//! [`BluetoothController`] owns the server socket, the client/data socket and
//! the job driving the current connection attempt. At most one attempt and one
//! transfer channel exist at a time. Cancelling an attempt closes its sockets
//! from the calling task, which makes the pending `accept`, `connect` or
//! `read` in the job fail and the job wind down.
//!
//! Every attempt gets a generation number. A job only touches the shared slot
//! while its generation is still current, so a job outliving its attempt
//! cannot clobber the sockets of a newer one.

use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::catalog::{DeviceCatalog, DeviceSet};
use super::connection::{TransferChannel, READ_BUFFER_SIZE};
use super::device::RemoteDevice;
use super::platform::{
    AdapterEvent, BluetoothAdapter, Capability, PermissionGuard, RfcommListener, RfcommSocket,
};
use super::protocol::{ChatMessage, WireFormat};
use crate::error::BluetoothError;
use crate::state::{SessionEvent, SessionStore};

/// Service UUID shared by both peers.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x27b7d1da_08c7_4505_a6d1_2459987e5e2d);

/// SDP service name registered by the listening side.
pub const SERVICE_NAME: &str = "bluechat_service";

/// Sender name used when the adapter reports none.
pub const DEFAULT_DEVICE_NAME: &str = "Unknown Name";

const OUTCOME_CHANNEL_SIZE: usize = 32;

/// One event on a connection outcome stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionOutcome {
    /// A peer is connected and the transfer channel is up.
    Established,
    TransferReceived(ChatMessage),
    /// The attempt or the connection ended. Always the last item.
    Failed(String),
}

/// Where the orchestrator is in its connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Idle,
    Listening,
    Connecting,
    Connected,
}

/// Tunables handed to the controller.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub service_name: String,
    pub service_uuid: Uuid,
    pub wire_format: WireFormat,
    pub read_buffer_size: usize,
    /// Sender name when the adapter has no name.
    pub device_name: String,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            service_name: SERVICE_NAME.to_string(),
            service_uuid: SERVICE_UUID,
            wire_format: WireFormat::default(),
            read_buffer_size: READ_BUFFER_SIZE,
            device_name: DEFAULT_DEVICE_NAME.to_string(),
        }
    }
}

/// Handle to the task driving one connection attempt.
struct ConnectionJob {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

struct ConnectionSlot {
    generation: u64,
    phase: ConnectionPhase,
    server: Option<Arc<dyn RfcommListener>>,
    client: Option<Arc<dyn RfcommSocket>>,
    channel: Option<Arc<TransferChannel>>,
    job: Option<ConnectionJob>,
}

impl ConnectionSlot {
    fn new() -> Self {
        Self {
            generation: 0,
            phase: ConnectionPhase::Idle,
            server: None,
            client: None,
            channel: None,
            job: None,
        }
    }

    /// Close and drop every socket handle.
    fn close_sockets(&mut self) {
        if let Some(server) = self.server.take() {
            if let Err(e) = server.close() {
                warn!("Error closing server socket: {}", e);
            }
        }
        if let Some(client) = self.client.take() {
            if let Err(e) = client.close() {
                warn!("Error closing client socket: {}", e);
            }
        }
        if let Some(channel) = self.channel.take() {
            channel.close();
        }
        self.phase = ConnectionPhase::Idle;
    }
}

type SharedSlot = Arc<Mutex<ConnectionSlot>>;

/// Close the sockets of `generation` if it is still the current attempt.
fn finish_attempt(slot: &SharedSlot, generation: u64) {
    let mut slot = slot.lock();
    if slot.generation == generation {
        slot.close_sockets();
        slot.job = None;
    }
}

/// Everything a connection job needs, detached from the controller.
struct AttemptContext {
    slot: SharedSlot,
    generation: u64,
    cancel: CancellationToken,
    outcomes: mpsc::Sender<ConnectionOutcome>,
    format: WireFormat,
    read_buffer_size: usize,
}

impl AttemptContext {
    async fn emit(&self, outcome: ConnectionOutcome) -> bool {
        self.outcomes.send(outcome).await.is_ok()
    }

    async fn fail(&self, reason: String) {
        warn!("Connection attempt failed: {}", reason);
        finish_attempt(&self.slot, self.generation);
        let _ = self.emit(ConnectionOutcome::Failed(reason)).await;
    }

    /// Install the transfer channel for `socket` and pump inbound messages
    /// into the outcome stream until the connection ends.
    async fn run_transfer(self, socket: Arc<dyn RfcommSocket>) {
        let channel = Arc::new(TransferChannel::new(
            socket.clone(),
            self.format,
            self.read_buffer_size,
        ));

        let installed = {
            let mut slot = self.slot.lock();
            if slot.generation == self.generation {
                slot.client = Some(socket);
                slot.channel = Some(channel.clone());
                slot.phase = ConnectionPhase::Connected;
                true
            } else {
                false
            }
        };
        if !installed {
            channel.close();
            let _ = self
                .emit(ConnectionOutcome::Failed("Connection attempt cancelled".into()))
                .await;
            return;
        }

        info!("Connected to {}", channel.remote_device());
        if !self.emit(ConnectionOutcome::Established).await {
            debug!("Outcome receiver dropped, closing connection");
            finish_attempt(&self.slot, self.generation);
            return;
        }

        let mut incoming = Box::pin(channel.clone().incoming());
        let reason = loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break "Connection closed".to_string(),
                item = incoming.next() => match item {
                    Some(Ok(message)) => {
                        if !self.emit(ConnectionOutcome::TransferReceived(message)).await {
                            debug!("Outcome receiver dropped, closing connection");
                            finish_attempt(&self.slot, self.generation);
                            return;
                        }
                    }
                    Some(Err(e)) => break e.to_string(),
                    None => break "Connection closed".to_string(),
                },
            }
        };

        self.fail(reason).await;
    }
}

/// Drives discovery, the server-listen loop and the client-connect sequence.
pub struct BluetoothController {
    adapter: Arc<dyn BluetoothAdapter>,
    permissions: Arc<dyn PermissionGuard>,
    catalog: DeviceCatalog,
    settings: ControllerSettings,
    store: SessionStore,
    slot: SharedSlot,
    pump: Mutex<Option<JoinHandle<()>>>,
    released: AtomicBool,
}

impl BluetoothController {
    /// Create a new controller and start listening for platform events.
    ///
    /// The paired-device set is loaded once up front.
    pub async fn new(
        adapter: Arc<dyn BluetoothAdapter>,
        permissions: Arc<dyn PermissionGuard>,
        settings: ControllerSettings,
        store: SessionStore,
    ) -> Arc<Self> {
        let events = adapter.subscribe();
        let controller = Arc::new(Self {
            catalog: DeviceCatalog::new(adapter.clone(), permissions.clone()),
            adapter,
            permissions,
            settings,
            store,
            slot: Arc::new(Mutex::new(ConnectionSlot::new())),
            pump: Mutex::new(None),
            released: AtomicBool::new(false),
        });

        controller.refresh_paired().await;

        let pump = tokio::spawn(event_pump(Arc::downgrade(&controller), events));
        *controller.pump.lock() = Some(pump);

        info!("Bluetooth controller ready");
        controller
    }

    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.slot.lock().phase
    }

    pub fn paired_devices(&self) -> DeviceSet {
        self.catalog.paired()
    }

    pub fn scanned_devices(&self) -> DeviceSet {
        self.catalog.scanned()
    }

    /// Name this side puts on outgoing messages.
    pub fn sender_name(&self) -> String {
        self.adapter
            .name()
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| self.settings.device_name.clone())
    }

    /// Re-read bonded devices and publish them.
    pub async fn refresh_paired(&self) -> DeviceSet {
        let paired = self.catalog.refresh_paired().await;
        self.store
            .apply(SessionEvent::PairedDevicesChanged(paired.clone()));
        paired
    }

    /// Start a fresh discovery cycle.
    ///
    /// Paired devices are refreshed first. A pending listen or connect attempt
    /// is abandoned; an established connection is left alone.
    pub async fn start_discovery(&self) -> bool {
        if !self.permissions.has_capability(Capability::Scan) {
            debug!("Ignoring discovery request: no {} permission", Capability::Scan);
            return false;
        }

        if matches!(
            self.phase(),
            ConnectionPhase::Listening | ConnectionPhase::Connecting
        ) {
            info!("Abandoning pending connection attempt for discovery");
            self.disconnect();
        }

        self.refresh_paired().await;
        let started = self.catalog.start_discovery().await;
        self.store
            .apply(SessionEvent::ScannedDevicesChanged(self.catalog.scanned()));
        if started {
            self.store.apply(SessionEvent::DiscoveryStarted);
        }
        started
    }

    /// Cancel discovery if it is running.
    pub async fn stop_discovery(&self) -> bool {
        let stopped = self.catalog.stop_discovery().await;
        if stopped {
            self.store.apply(SessionEvent::DiscoveryStopped);
        }
        stopped
    }

    /// Open the server socket and wait for exactly one peer.
    ///
    /// The returned stream yields `Established` when a peer connects, then
    /// every received message, and ends with a single `Failed`.
    pub async fn start_server_and_wait(
        &self,
    ) -> Result<mpsc::Receiver<ConnectionOutcome>, BluetoothError> {
        self.require(Capability::Connect)?;
        self.disconnect();
        self.stop_discovery().await;

        let listener = self
            .adapter
            .listen(&self.settings.service_name, self.settings.service_uuid)
            .await?;
        info!(
            "Listening for inbound connections on service {}",
            self.settings.service_uuid
        );

        let (tx, rx) = mpsc::channel(OUTCOME_CHANNEL_SIZE);
        let ctx = self.begin_attempt(ConnectionPhase::Listening, tx, |slot| {
            slot.server = Some(listener.clone());
        });
        let generation = ctx.generation;

        let handle = tokio::spawn(async move {
            let accepted = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => None,
                result = listener.accept() => Some(result),
            };

            // One peer only: stop listening as soon as accept returns.
            if let Err(e) = listener.close() {
                warn!("Error closing server socket: {}", e);
            }
            {
                let mut slot = ctx.slot.lock();
                if slot.generation == ctx.generation {
                    slot.server = None;
                }
            }

            match accepted {
                Some(Ok(socket)) => {
                    info!("Accepted connection from {}", socket.remote_device());
                    ctx.run_transfer(socket).await;
                }
                Some(Err(e)) => ctx.fail(format!("Failed to accept connection: {}", e)).await,
                None => ctx.fail("Stopped listening".into()).await,
            }
        });

        self.attach_job(generation, handle);
        Ok(rx)
    }

    /// Connect to `device` as a client.
    ///
    /// Stops discovery first. The returned stream behaves like the one from
    /// [`Self::start_server_and_wait`]. A failed handshake yields one `Failed`
    /// and the stream ends; there is no retry.
    pub async fn connect_to(
        &self,
        device: &RemoteDevice,
    ) -> Result<mpsc::Receiver<ConnectionOutcome>, BluetoothError> {
        self.require(Capability::Connect)?;
        self.disconnect();
        self.stop_discovery().await;

        let socket = self
            .adapter
            .create_socket(device, self.settings.service_uuid)?;
        info!("Connecting to {}", device);

        let (tx, rx) = mpsc::channel(OUTCOME_CHANNEL_SIZE);
        let ctx = self.begin_attempt(ConnectionPhase::Connecting, tx, |slot| {
            slot.client = Some(socket.clone());
        });
        let generation = ctx.generation;

        let handle = tokio::spawn(async move {
            let connected = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => None,
                result = socket.connect() => Some(result),
            };

            match connected {
                Some(Ok(())) => ctx.run_transfer(socket).await,
                Some(Err(e)) => {
                    if let Err(close_err) = socket.close() {
                        warn!("Error closing client socket: {}", close_err);
                    }
                    ctx.fail(format!("Connection was interrupted: {}", e)).await;
                }
                None => {
                    let _ = socket.close();
                    ctx.fail("Connection attempt cancelled".into()).await;
                }
            }
        });

        self.attach_job(generation, handle);
        Ok(rx)
    }

    /// Send `text` to the connected peer.
    ///
    /// Returns `None` when there is no transfer channel or the connect
    /// capability is missing. Otherwise returns the local copy of the message,
    /// even if the write failed.
    pub async fn send(&self, text: &str) -> Option<ChatMessage> {
        if !self.permissions.has_capability(Capability::Connect) {
            debug!("Not sending: no {} permission", Capability::Connect);
            return None;
        }

        let channel = self.slot.lock().channel.clone()?;
        let message = ChatMessage::local(self.sender_name(), text);
        if !channel.send_message(&message).await {
            warn!("Message to {} was not delivered", channel.remote_device());
        }
        Some(message)
    }

    /// Close the server and client sockets. Safe to call any number of times
    /// from any state.
    pub fn close_connection(&self) {
        self.slot.lock().close_sockets();
    }

    /// Cancel the current attempt and close its sockets.
    pub fn disconnect(&self) {
        if let Some(job) = self.take_job() {
            debug!("Cancelling connection job");
            job.cancel.cancel();
        }
        self.close_connection();
    }

    /// Stop reacting to platform events and close everything.
    ///
    /// Only the first call has any effect.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        if let Some(job) = self.take_job() {
            job.cancel.cancel();
            if let Some(handle) = job.handle {
                handle.abort();
            }
        }
        self.close_connection();
        info!("Bluetooth controller released");
    }

    fn require(&self, capability: Capability) -> Result<(), BluetoothError> {
        if self.permissions.has_capability(capability) {
            Ok(())
        } else {
            error!("Missing {} permission", capability);
            Err(BluetoothError::PermissionDenied(capability))
        }
    }

    fn begin_attempt(
        &self,
        phase: ConnectionPhase,
        outcomes: mpsc::Sender<ConnectionOutcome>,
        install: impl FnOnce(&mut ConnectionSlot),
    ) -> AttemptContext {
        let cancel = CancellationToken::new();
        let mut slot = self.slot.lock();
        slot.generation += 1;
        slot.phase = phase;
        slot.job = Some(ConnectionJob {
            cancel: cancel.clone(),
            handle: None,
        });
        install(&mut slot);
        debug!("Connection attempt {} started: {:?}", slot.generation, phase);
        AttemptContext {
            slot: self.slot.clone(),
            generation: slot.generation,
            cancel,
            outcomes,
            format: self.settings.wire_format,
            read_buffer_size: self.settings.read_buffer_size,
        }
    }

    fn attach_job(&self, generation: u64, handle: JoinHandle<()>) {
        let mut slot = self.slot.lock();
        if slot.generation != generation {
            return;
        }
        // The job may already have finished and cleared itself.
        if let Some(job) = slot.job.as_mut() {
            job.handle = Some(handle);
        }
    }

    fn take_job(&self) -> Option<ConnectionJob> {
        let mut slot = self.slot.lock();
        slot.generation += 1;
        slot.job.take()
    }

    async fn handle_event(&self, event: AdapterEvent) {
        match event {
            AdapterEvent::DeviceFound(device) => {
                if !self.catalog.is_current_cycle() {
                    debug!("Ignoring {} reported by an earlier discovery cycle", device);
                    return;
                }
                let scanned = self.catalog.on_device_found(device);
                self.store.apply(SessionEvent::ScannedDevicesChanged(scanned));
            }
            AdapterEvent::DiscoveryStarted => {
                self.catalog.on_discovery_started();
                // Stale once a connect attempt has already cancelled the cycle.
                if self.adapter.is_discovering() {
                    self.store.apply(SessionEvent::DiscoveryStarted);
                }
            }
            AdapterEvent::DiscoveryFinished => {
                // Stale when a restart already began the next cycle.
                if !self.adapter.is_discovering() {
                    info!("Device discovery finished");
                    self.store.apply(SessionEvent::DiscoveryFinished);
                }
            }
            AdapterEvent::ConnectionStateChanged { device, connected } => {
                // Only a connect needs a trusted peer; losing a link always counts.
                if connected && !self.catalog.is_paired(&device) {
                    self.refresh_paired().await;
                }
                if !connected || self.catalog.is_paired(&device) {
                    info!(
                        "{} {}",
                        device,
                        if connected { "connected" } else { "disconnected" }
                    );
                    self.store
                        .apply(SessionEvent::ConnectionStateChanged(connected));
                } else {
                    warn!("Connection state change from non-paired device {}", device);
                    self.store.apply(SessionEvent::ErrorRaised(format!(
                        "Cannot connect to non-paired device ({})",
                        device.id
                    )));
                }
            }
            AdapterEvent::BondStateChanged { device, bonded } => {
                info!(
                    "Bond state of {} changed: {}",
                    device,
                    if bonded { "bonded" } else { "not bonded" }
                );
                self.refresh_paired().await;
            }
            AdapterEvent::AdapterStateChanged { powered } => {
                info!("Bluetooth adapter powered {}", if powered { "on" } else { "off" });
            }
        }
    }
}

impl Drop for BluetoothController {
    fn drop(&mut self) {
        self.release();
    }
}

async fn event_pump(controller: Weak<BluetoothController>, mut events: broadcast::Receiver<AdapterEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!("Missed {} adapter events", missed);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        let Some(controller) = controller.upgrade() else {
            break;
        };
        controller.handle_event(event).await;
    }
    debug!("Adapter event pump stopped");
}
