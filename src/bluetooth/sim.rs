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

//! In-memory Bluetooth radio.
//!
//! Every [`SimulatedAdapter`] created from the same [`SimulatedAir`] can
//! listen for and connect to the others by `(address, service uuid)`, just
//! like RFCOMM peers resolving a service record. Each socket write arrives at
//! the peer as one chunk; a read returns at most one chunk.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use super::device::RemoteDevice;
use super::platform::{AdapterEvent, BluetoothAdapter, RfcommListener, RfcommSocket};

type ServiceKey = (String, Uuid);

#[derive(Default)]
struct AirState {
    listeners: HashMap<ServiceKey, Arc<SimulatedListener>>,
}

/// Shared medium connecting simulated adapters.
#[derive(Clone, Default)]
pub struct SimulatedAir {
    state: Arc<Mutex<AirState>>,
}

impl SimulatedAir {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an adapter on this medium.
    pub fn adapter(&self, address: impl Into<String>, name: impl Into<String>) -> Arc<SimulatedAdapter> {
        let (events, _) = broadcast::channel(64);
        Arc::new(SimulatedAdapter {
            address: address.into(),
            name: Some(name.into()),
            air: self.clone(),
            bonded: RwLock::new(Vec::new()),
            nearby: RwLock::new(Vec::new()),
            discovering: AtomicBool::new(false),
            cycles: AtomicUsize::new(0),
            connect_failures: Mutex::new(VecDeque::new()),
            events,
        })
    }

    fn find_listener(&self, address: &str, uuid: Uuid) -> Option<Arc<SimulatedListener>> {
        self.state
            .lock()
            .listeners
            .get(&(address.to_string(), uuid))
            .cloned()
    }

    fn register(&self, listener: Arc<SimulatedListener>) -> io::Result<()> {
        let mut state = self.state.lock();
        if state.listeners.contains_key(&listener.key) {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                "service already registered",
            ));
        }
        state.listeners.insert(listener.key.clone(), listener);
        Ok(())
    }
}

fn unregister(state: &Weak<Mutex<AirState>>, listener: &SimulatedListener) {
    let Some(state) = state.upgrade() else {
        return;
    };
    let mut state = state.lock();
    let registered = state
        .listeners
        .get(&listener.key)
        .map(|l| std::ptr::eq(Arc::as_ptr(l), listener))
        .unwrap_or(false);
    if registered {
        state.listeners.remove(&listener.key);
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "socket closed")
}

struct Inbox {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    pending: Vec<u8>,
}

/// One direction-pair of an established link.
struct Link {
    inbox: tokio::sync::Mutex<Inbox>,
    outgoing: mpsc::UnboundedSender<Vec<u8>>,
}

impl Link {
    fn pair() -> (Link, Link) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let a = Link {
            inbox: tokio::sync::Mutex::new(Inbox {
                rx: b_rx,
                pending: Vec::new(),
            }),
            outgoing: a_tx,
        };
        let b = Link {
            inbox: tokio::sync::Mutex::new(Inbox {
                rx: a_rx,
                pending: Vec::new(),
            }),
            outgoing: b_tx,
        };
        (a, b)
    }

    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut guard = self.inbox.lock().await;
        let inbox = &mut *guard;
        if inbox.pending.is_empty() {
            match inbox.rx.recv().await {
                Some(chunk) => inbox.pending = chunk,
                None => return Ok(0),
            }
        }
        let n = buf.len().min(inbox.pending.len());
        buf[..n].copy_from_slice(&inbox.pending[..n]);
        inbox.pending.drain(..n);
        Ok(n)
    }
}

/// Where a client socket should connect to.
struct ConnectTarget {
    air: SimulatedAir,
    uuid: Uuid,
    local: RemoteDevice,
    failure: Option<String>,
}

/// A simulated RFCOMM stream socket.
pub struct SimulatedSocket {
    remote: RemoteDevice,
    target: Option<ConnectTarget>,
    link: Mutex<Option<Arc<Link>>>,
    closed: CancellationToken,
}

impl SimulatedSocket {
    fn accepted(remote: RemoteDevice, link: Link) -> Self {
        Self {
            remote,
            target: None,
            link: Mutex::new(Some(Arc::new(link))),
            closed: CancellationToken::new(),
        }
    }

    fn current_link(&self) -> io::Result<Arc<Link>> {
        if self.closed.is_cancelled() {
            return Err(closed_error());
        }
        self.link
            .lock()
            .clone()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "socket not connected"))
    }
}

#[async_trait]
impl RfcommSocket for SimulatedSocket {
    fn remote_device(&self) -> RemoteDevice {
        self.remote.clone()
    }

    async fn connect(&self) -> io::Result<()> {
        if self.closed.is_cancelled() {
            return Err(closed_error());
        }
        if self.link.lock().is_some() {
            return Ok(());
        }

        let target = self
            .target
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "not a client socket"))?;

        if let Some(reason) = &target.failure {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, reason.clone()));
        }

        let listener = target
            .air
            .find_listener(&self.remote.id, target.uuid)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    "read failed, socket might closed or timeout",
                )
            })?;

        let (mine, theirs) = Link::pair();
        let peer = Arc::new(SimulatedSocket::accepted(target.local.clone(), theirs));
        listener.deliver(peer)?;
        *self.link.lock() = Some(Arc::new(mine));
        debug!("Simulated link up: {} -> {}", target.local.id, self.remote.id);
        Ok(())
    }

    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let link = self.current_link()?;
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(closed_error()),
            n = link.read(buf) => n,
        }
    }

    async fn write(&self, bytes: &[u8]) -> io::Result<()> {
        let link = self.current_link()?;
        link.outgoing
            .send(bytes.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "Broken pipe"))
    }

    fn close(&self) -> io::Result<()> {
        self.closed.cancel();
        self.link.lock().take();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.closed.is_cancelled() && self.link.lock().is_some()
    }
}

/// A simulated RFCOMM server socket.
pub struct SimulatedListener {
    key: ServiceKey,
    air: Weak<Mutex<AirState>>,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<Arc<SimulatedSocket>>>,
    deliver_tx: mpsc::UnboundedSender<Arc<SimulatedSocket>>,
    closed: CancellationToken,
}

impl SimulatedListener {
    fn deliver(&self, socket: Arc<SimulatedSocket>) -> io::Result<()> {
        if self.closed.is_cancelled() {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "listener closed"));
        }
        self.deliver_tx
            .send(socket)
            .map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, "listener closed"))
    }
}

#[async_trait]
impl RfcommListener for SimulatedListener {
    async fn accept(&self) -> io::Result<Arc<dyn RfcommSocket>> {
        if self.closed.is_cancelled() {
            return Err(closed_error());
        }
        let mut incoming = self.incoming.lock().await;
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(closed_error()),
            socket = incoming.recv() => match socket {
                Some(socket) => Ok(socket as Arc<dyn RfcommSocket>),
                None => Err(closed_error()),
            },
        }
    }

    fn close(&self) -> io::Result<()> {
        if !self.closed.is_cancelled() {
            self.closed.cancel();
            unregister(&self.air, self);
        }
        Ok(())
    }
}

/// A simulated local adapter.
pub struct SimulatedAdapter {
    address: String,
    name: Option<String>,
    air: SimulatedAir,
    bonded: RwLock<Vec<RemoteDevice>>,
    nearby: RwLock<Vec<RemoteDevice>>,
    discovering: AtomicBool,
    cycles: AtomicUsize,
    connect_failures: Mutex<VecDeque<String>>,
    events: broadcast::Sender<AdapterEvent>,
}

impl SimulatedAdapter {
    pub fn address(&self) -> &str {
        &self.address
    }

    /// This adapter as seen by its peers.
    pub fn identity(&self) -> RemoteDevice {
        let device = RemoteDevice::new(self.address.clone());
        match &self.name {
            Some(name) => device.with_name(name.clone()),
            None => device,
        }
    }

    /// Replace the bonded device list.
    pub fn set_bonded(&self, devices: Vec<RemoteDevice>) {
        *self.bonded.write() = devices;
    }

    /// Devices reported by every discovery cycle.
    pub fn set_nearby(&self, devices: Vec<RemoteDevice>) {
        *self.nearby.write() = devices;
    }

    /// Make the next client socket created by this adapter fail its handshake.
    pub fn fail_next_connect(&self, reason: impl Into<String>) {
        self.connect_failures.lock().push_back(reason.into());
    }

    /// End the running discovery cycle as the radio would after its inquiry window.
    pub fn finish_discovery(&self) {
        self.discovering.store(false, Ordering::SeqCst);
        self.emit(AdapterEvent::DiscoveryFinished);
    }

    /// Deliver a raw platform event to subscribers.
    pub fn emit(&self, event: AdapterEvent) {
        let _ = self.events.send(event);
    }

    /// Number of discovery cycles started so far.
    pub fn discovery_cycles(&self) -> usize {
        self.cycles.load(Ordering::SeqCst)
    }

    /// Whether a server socket is registered under `uuid` on this adapter.
    pub fn is_listening(&self, uuid: Uuid) -> bool {
        self.air.find_listener(&self.address, uuid).is_some()
    }
}

#[async_trait]
impl BluetoothAdapter for SimulatedAdapter {
    fn name(&self) -> Option<String> {
        self.name.clone()
    }

    async fn bonded_devices(&self) -> io::Result<Vec<RemoteDevice>> {
        Ok(self.bonded.read().clone())
    }

    async fn start_discovery(&self) -> bool {
        self.discovering.store(true, Ordering::SeqCst);
        self.cycles.fetch_add(1, Ordering::SeqCst);
        self.emit(AdapterEvent::DiscoveryStarted);
        let nearby = self.nearby.read().clone();
        for device in nearby {
            self.emit(AdapterEvent::DeviceFound(device));
        }
        true
    }

    async fn cancel_discovery(&self) -> bool {
        if self.discovering.swap(false, Ordering::SeqCst) {
            self.emit(AdapterEvent::DiscoveryFinished);
            true
        } else {
            false
        }
    }

    fn is_discovering(&self) -> bool {
        self.discovering.load(Ordering::SeqCst)
    }

    async fn listen(&self, service_name: &str, uuid: Uuid) -> io::Result<Arc<dyn RfcommListener>> {
        let (deliver_tx, deliver_rx) = mpsc::unbounded_channel();
        let listener = Arc::new(SimulatedListener {
            key: (self.address.clone(), uuid),
            air: Arc::downgrade(&self.air.state),
            incoming: tokio::sync::Mutex::new(deliver_rx),
            deliver_tx,
            closed: CancellationToken::new(),
        });
        self.air.register(listener.clone())?;
        debug!("Simulated service '{}' registered on {}", service_name, self.address);
        Ok(listener)
    }

    fn create_socket(&self, device: &RemoteDevice, uuid: Uuid) -> io::Result<Arc<dyn RfcommSocket>> {
        let failure = self.connect_failures.lock().pop_front();
        Ok(Arc::new(SimulatedSocket {
            remote: device.clone(),
            target: Some(ConnectTarget {
                air: self.air.clone(),
                uuid,
                local: self.identity(),
                failure,
            }),
            link: Mutex::new(None),
            closed: CancellationToken::new(),
        }))
    }

    fn subscribe(&self) -> broadcast::Receiver<AdapterEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const SERVICE: Uuid = Uuid::from_u128(0x27b7d1da_08c7_4505_a6d1_2459987e5e2d);

    async fn connected_pair() -> (Arc<dyn RfcommSocket>, Arc<dyn RfcommSocket>) {
        let air = SimulatedAir::new();
        let host = air.adapter("00:00:00:00:00:01", "Host");
        let guest = air.adapter("00:00:00:00:00:02", "Guest");

        let listener = host.listen("test", SERVICE).await.unwrap();
        let client = guest.create_socket(&host.identity(), SERVICE).unwrap();
        client.connect().await.unwrap();
        let server = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_connect_and_exchange() {
        let (client, server) = connected_pair().await;
        assert_eq!(server.remote_device().id, "00:00:00:00:00:02");
        assert_eq!(server.remote_device().display_name.as_deref(), Some("Guest"));

        client.write(b"hello").await.unwrap();
        client.write(b"world").await.unwrap();

        let mut buf = [0u8; 16];
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"world");
    }

    #[tokio::test]
    async fn test_oversized_write_splits_across_reads() {
        let (client, server) = connected_pair().await;
        client.write(&[b'x'; 10]).await.unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(server.read(&mut buf).await.unwrap(), 4);
        assert_eq!(server.read(&mut buf).await.unwrap(), 4);
        assert_eq!(server.read(&mut buf).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_close_unblocks_pending_read() {
        let (client, server) = connected_pair().await;
        let reader = server.clone();
        let pending = tokio::spawn(async move {
            let mut buf = [0u8; 16];
            reader.read(&mut buf).await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        server.close().unwrap();
        server.close().unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_err());
        assert!(!server.is_connected());
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_peer_close_reads_as_eof() {
        let (client, server) = connected_pair().await;
        client.close().unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(server.read(&mut buf).await.unwrap(), 0);
        assert!(server.write(b"late").await.is_err());
    }

    #[tokio::test]
    async fn test_close_unblocks_accept() {
        let air = SimulatedAir::new();
        let host = air.adapter("00:00:00:00:00:01", "Host");
        let listener = host.listen("test", SERVICE).await.unwrap();
        assert!(host.is_listening(SERVICE));

        let accepting = listener.clone();
        let pending = tokio::spawn(async move { accepting.accept().await.map(|_| ()) });
        tokio::time::sleep(Duration::from_millis(10)).await;
        listener.close().unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_err());
        assert!(!host.is_listening(SERVICE));
    }

    #[tokio::test]
    async fn test_connect_without_listener_is_refused() {
        let air = SimulatedAir::new();
        let guest = air.adapter("00:00:00:00:00:02", "Guest");
        let socket = guest
            .create_socket(&RemoteDevice::new("00:00:00:00:00:09"), SERVICE)
            .unwrap();
        let err = socket.connect().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }

    #[tokio::test]
    async fn test_injected_connect_failure() {
        let air = SimulatedAir::new();
        let host = air.adapter("00:00:00:00:00:01", "Host");
        let guest = air.adapter("00:00:00:00:00:02", "Guest");
        let _listener = host.listen("test", SERVICE).await.unwrap();

        guest.fail_next_connect("page timeout");
        let socket = guest.create_socket(&host.identity(), SERVICE).unwrap();
        let err = socket.connect().await.unwrap_err();
        assert_eq!(err.to_string(), "page timeout");

        let socket = guest.create_socket(&host.identity(), SERVICE).unwrap();
        assert!(socket.connect().await.is_ok());
    }

    #[tokio::test]
    async fn test_duplicate_listen_rejected() {
        let air = SimulatedAir::new();
        let host = air.adapter("00:00:00:00:00:01", "Host");
        let first = host.listen("test", SERVICE).await.unwrap();
        assert!(host.listen("test", SERVICE).await.is_err());

        first.close().unwrap();
        assert!(host.listen("test", SERVICE).await.is_ok());
    }

    #[tokio::test]
    async fn test_discovery_events() {
        let air = SimulatedAir::new();
        let adapter = air.adapter("00:00:00:00:00:01", "Host");
        adapter.set_nearby(vec![RemoteDevice::new("AA:AA:AA:AA:AA:AA")]);
        let mut events = adapter.subscribe();

        assert!(adapter.start_discovery().await);
        assert!(matches!(events.recv().await.unwrap(), AdapterEvent::DiscoveryStarted));
        assert!(matches!(events.recv().await.unwrap(), AdapterEvent::DeviceFound(_)));

        assert!(adapter.cancel_discovery().await);
        assert!(matches!(events.recv().await.unwrap(), AdapterEvent::DiscoveryFinished));
        assert!(!adapter.cancel_discovery().await);
    }
}
