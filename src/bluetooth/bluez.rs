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

//! BlueZ backend.
//!
//! Hosting registers an RFCOMM profile so the service UUID appears in the SDP
//! record, which is how phones resolve the channel. Connecting registers the
//! same UUID as a client profile and asks BlueZ to connect it on the device.

use async_trait::async_trait;
use bluer::rfcomm::stream::{OwnedReadHalf, OwnedWriteHalf};
use bluer::rfcomm::{Profile, ProfileHandle, Role, Stream};
use bluer::{Address, AdapterEvent as BluezEvent, AdapterProperty, DeviceEvent, DeviceProperty, Session};
use futures::{Stream as FuturesStream, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::device::RemoteDevice;
use super::platform::{AdapterEvent, BluetoothAdapter, RfcommListener, RfcommSocket};

fn to_io(e: bluer::Error) -> io::Error {
    io::Error::other(e)
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "socket closed")
}

/// Look up name and first service UUID of a device known to BlueZ.
async fn describe(adapter: &bluer::Adapter, address: Address) -> RemoteDevice {
    let mut device = RemoteDevice::new(address.to_string());
    let Ok(remote) = adapter.device(address) else {
        return device;
    };
    if let Ok(Some(name)) = remote.name().await {
        device = device.with_name(name);
    }
    if let Ok(Some(uuids)) = remote.uuids().await {
        if let Some(uuid) = uuids.into_iter().min() {
            device = device.with_service_uuid(uuid);
        }
    }
    device
}

struct DiscoveryJob {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// A BlueZ adapter reached over D-Bus.
pub struct BluezAdapter {
    session: Session,
    adapter: bluer::Adapter,
    name: Option<String>,
    discovery_timeout: Duration,
    rfcomm_channel: u8,
    discovering: Arc<AtomicBool>,
    discovery: Mutex<Option<DiscoveryJob>>,
    watchers: Mutex<HashMap<Address, JoinHandle<()>>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<AdapterEvent>,
}

impl BluezAdapter {
    /// Open the default adapter and power it on.
    ///
    /// Hosted services are offered on `rfcomm_channel`.
    pub async fn new(discovery_timeout: Duration, rfcomm_channel: u8) -> anyhow::Result<Arc<Self>> {
        info!("Initializing BlueZ adapter...");

        let session = Session::new().await?;
        let adapter = session.default_adapter().await?;
        info!("Using Bluetooth adapter: {}", adapter.name());

        if !adapter.is_powered().await? {
            info!("Powering on Bluetooth adapter...");
            adapter.set_powered(true).await?;
        }

        let name = adapter.alias().await.ok().filter(|alias| !alias.is_empty());
        let (events, _) = broadcast::channel(64);

        let this = Arc::new(Self {
            session,
            adapter,
            name,
            discovery_timeout,
            rfcomm_channel,
            discovering: Arc::new(AtomicBool::new(false)),
            discovery: Mutex::new(None),
            watchers: Mutex::new(HashMap::new()),
            monitor: Mutex::new(None),
            events,
        });

        for address in this.adapter.device_addresses().await? {
            this.watch_device(address);
        }
        *this.monitor.lock() = Some(this.spawn_monitor().await?);

        Ok(this)
    }

    /// Forward adapter power changes and start watching new devices.
    async fn spawn_monitor(self: &Arc<Self>) -> anyhow::Result<JoinHandle<()>> {
        let mut stream = self.adapter.events().await?;
        let weak = Arc::downgrade(self);
        Ok(tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                let Some(this) = weak.upgrade() else {
                    break;
                };
                match event {
                    BluezEvent::DeviceAdded(address) => this.watch_device(address),
                    BluezEvent::DeviceRemoved(address) => {
                        if let Some(watcher) = this.watchers.lock().remove(&address) {
                            watcher.abort();
                        }
                    }
                    BluezEvent::PropertyChanged(AdapterProperty::Powered(powered)) => {
                        let _ = this.events.send(AdapterEvent::AdapterStateChanged { powered });
                    }
                    _ => {}
                }
            }
            debug!("BlueZ adapter monitor stopped");
        }))
    }

    /// Translate connection and bond changes of one device into adapter events.
    fn watch_device(&self, address: Address) {
        let mut watchers = self.watchers.lock();
        if watchers.contains_key(&address) {
            return;
        }
        let adapter = self.adapter.clone();
        let events = self.events.clone();
        let handle = tokio::spawn(async move {
            let Ok(device) = adapter.device(address) else {
                return;
            };
            let Ok(mut stream) = device.events().await else {
                return;
            };
            while let Some(event) = stream.next().await {
                let DeviceEvent::PropertyChanged(property) = event else {
                    continue;
                };
                let event = match property {
                    DeviceProperty::Connected(connected) => AdapterEvent::ConnectionStateChanged {
                        device: describe(&adapter, address).await,
                        connected,
                    },
                    DeviceProperty::Paired(bonded) => AdapterEvent::BondStateChanged {
                        device: describe(&adapter, address).await,
                        bonded,
                    },
                    _ => continue,
                };
                let _ = events.send(event);
            }
        });
        watchers.insert(address, handle);
    }

    fn end_discovery(&self) {
        if let Some(job) = self.discovery.lock().take() {
            job.cancel.cancel();
            drop(job.handle);
            if self.discovering.swap(false, Ordering::SeqCst) {
                let _ = self.events.send(AdapterEvent::DiscoveryFinished);
            }
        }
    }
}

impl Drop for BluezAdapter {
    fn drop(&mut self) {
        self.end_discovery();
        if let Some(monitor) = self.monitor.lock().take() {
            monitor.abort();
        }
        for (_, watcher) in self.watchers.lock().drain() {
            watcher.abort();
        }
    }
}

#[async_trait]
impl BluetoothAdapter for BluezAdapter {
    fn name(&self) -> Option<String> {
        self.name.clone()
    }

    async fn bonded_devices(&self) -> io::Result<Vec<RemoteDevice>> {
        let mut bonded = Vec::new();
        for address in self.adapter.device_addresses().await.map_err(to_io)? {
            let Ok(device) = self.adapter.device(address) else {
                continue;
            };
            if device.is_paired().await.unwrap_or(false) {
                bonded.push(describe(&self.adapter, address).await);
            }
        }
        Ok(bonded)
    }

    async fn start_discovery(&self) -> bool {
        self.end_discovery();

        let stream = match self.adapter.discover_devices().await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Failed to start discovery: {}", e);
                return false;
            }
        };
        let mut stream: Pin<Box<dyn FuturesStream<Item = BluezEvent> + Send>> = Box::pin(stream);

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let adapter = self.adapter.clone();
        let events = self.events.clone();
        let discovering = self.discovering.clone();
        let timeout = tokio::time::sleep(self.discovery_timeout);

        discovering.store(true, Ordering::SeqCst);
        let _ = events.send(AdapterEvent::DiscoveryStarted);

        let handle = tokio::spawn(async move {
            tokio::pin!(timeout);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = &mut timeout => {
                        debug!("Discovery window elapsed");
                        break;
                    }
                    event = stream.next() => match event {
                        Some(BluezEvent::DeviceAdded(address)) => {
                            let device = describe(&adapter, address).await;
                            let _ = events.send(AdapterEvent::DeviceFound(device));
                        }
                        Some(_) => {}
                        None => break,
                    },
                }
            }
            // Dropping the stream stops the inquiry.
            drop(stream);
            // A cancelled cycle was already reported by whoever cancelled it.
            if !token.is_cancelled() {
                discovering.store(false, Ordering::SeqCst);
                let _ = events.send(AdapterEvent::DiscoveryFinished);
            }
        });

        *self.discovery.lock() = Some(DiscoveryJob { cancel, handle });
        true
    }

    async fn cancel_discovery(&self) -> bool {
        let was_discovering = self.is_discovering();
        self.end_discovery();
        was_discovering
    }

    fn is_discovering(&self) -> bool {
        self.discovering.load(Ordering::SeqCst)
    }

    async fn listen(&self, service_name: &str, uuid: Uuid) -> io::Result<Arc<dyn RfcommListener>> {
        let profile = Profile {
            uuid,
            name: Some(service_name.to_string()),
            role: Some(Role::Server),
            channel: Some(u16::from(self.rfcomm_channel)),
            require_authentication: Some(false),
            require_authorization: Some(false),
            auto_connect: Some(false),
            ..Default::default()
        };
        let handle = self.session.register_profile(profile).await.map_err(to_io)?;
        info!(
            "RFCOMM service '{}' registered with UUID {} on channel {}",
            service_name, uuid, self.rfcomm_channel
        );

        Ok(Arc::new(BluezListener {
            adapter: self.adapter.clone(),
            handle: tokio::sync::Mutex::new(Some(handle)),
            closed: CancellationToken::new(),
        }))
    }

    fn create_socket(&self, device: &RemoteDevice, uuid: Uuid) -> io::Result<Arc<dyn RfcommSocket>> {
        let address = Address::from_str(&device.id).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Invalid Bluetooth address '{}': {}", device.id, e),
            )
        })?;
        Ok(Arc::new(BluezSocket {
            remote: device.clone(),
            target: Some(ClientTarget {
                session: self.session.clone(),
                adapter: self.adapter.clone(),
                address,
                uuid,
            }),
            reader: tokio::sync::Mutex::new(None),
            writer: tokio::sync::Mutex::new(None),
            connected: AtomicBool::new(false),
            closed: CancellationToken::new(),
        }))
    }

    fn subscribe(&self) -> broadcast::Receiver<AdapterEvent> {
        self.events.subscribe()
    }
}

/// Registered server profile waiting for one inbound connection at a time.
pub struct BluezListener {
    adapter: bluer::Adapter,
    handle: tokio::sync::Mutex<Option<ProfileHandle>>,
    closed: CancellationToken,
}

#[async_trait]
impl RfcommListener for BluezListener {
    async fn accept(&self) -> io::Result<Arc<dyn RfcommSocket>> {
        let mut guard = self.handle.lock().await;
        let handle = guard.as_mut().ok_or_else(closed_error)?;

        let request = tokio::select! {
            _ = self.closed.cancelled() => None,
            request = handle.next() => Some(request),
        };
        let request = match request {
            Some(Some(request)) => request,
            Some(None) => {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "Profile handle closed"))
            }
            None => {
                // Dropping the handle unregisters the profile.
                guard.take();
                return Err(closed_error());
            }
        };

        let address = request.device();
        let stream = request.accept().map_err(to_io)?;
        info!("Accepted RFCOMM connection from {}", address);

        let remote = describe(&self.adapter, address).await;
        Ok(Arc::new(BluezSocket::from_stream(remote, stream)))
    }

    fn close(&self) -> io::Result<()> {
        self.closed.cancel();
        if let Ok(mut guard) = self.handle.try_lock() {
            guard.take();
        }
        Ok(())
    }
}

struct ClientTarget {
    session: Session,
    adapter: bluer::Adapter,
    address: Address,
    uuid: Uuid,
}

/// An RFCOMM stream split into independently locked halves.
pub struct BluezSocket {
    remote: RemoteDevice,
    target: Option<ClientTarget>,
    reader: tokio::sync::Mutex<Option<OwnedReadHalf>>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    connected: AtomicBool,
    closed: CancellationToken,
}

impl BluezSocket {
    fn from_stream(remote: RemoteDevice, stream: Stream) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            remote,
            target: None,
            reader: tokio::sync::Mutex::new(Some(reader)),
            writer: tokio::sync::Mutex::new(Some(writer)),
            connected: AtomicBool::new(true),
            closed: CancellationToken::new(),
        }
    }

    async fn install(&self, stream: Stream) {
        let (reader, writer) = stream.into_split();
        *self.reader.lock().await = Some(reader);
        *self.writer.lock().await = Some(writer);
        self.connected.store(true, Ordering::SeqCst);
    }
}

/// Register a client profile for `target.uuid` and have BlueZ connect it.
async fn connect_profile(target: &ClientTarget) -> io::Result<Stream> {
    let profile = Profile {
        uuid: target.uuid,
        role: Some(Role::Client),
        require_authentication: Some(false),
        require_authorization: Some(false),
        auto_connect: Some(false),
        ..Default::default()
    };
    let mut handle = target.session.register_profile(profile).await.map_err(to_io)?;
    let device = target.adapter.device(target.address).map_err(to_io)?;

    let connect = device.connect_profile(&target.uuid);
    tokio::pin!(connect);
    let mut connect_done = false;
    loop {
        tokio::select! {
            request = handle.next() => {
                let request = request.ok_or_else(|| {
                    io::Error::new(io::ErrorKind::BrokenPipe, "Profile handle closed")
                })?;
                return request.accept().map_err(to_io);
            }
            result = &mut connect, if !connect_done => {
                result.map_err(to_io)?;
                connect_done = true;
            }
        }
    }
}

#[async_trait]
impl RfcommSocket for BluezSocket {
    fn remote_device(&self) -> RemoteDevice {
        self.remote.clone()
    }

    async fn connect(&self) -> io::Result<()> {
        if self.closed.is_cancelled() {
            return Err(closed_error());
        }
        if self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }
        let target = self
            .target
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "not a client socket"))?;

        let stream = tokio::select! {
            _ = self.closed.cancelled() => return Err(closed_error()),
            stream = connect_profile(target) => stream?,
        };
        self.install(stream).await;
        info!("RFCOMM connection to {} established", self.remote);
        Ok(())
    }

    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or_else(closed_error)?;
        let result = tokio::select! {
            _ = self.closed.cancelled() => None,
            n = reader.read(buf) => Some(n),
        };
        match result {
            Some(n) => n,
            None => {
                guard.take();
                Err(closed_error())
            }
        }
    }

    async fn write(&self, bytes: &[u8]) -> io::Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(closed_error)?;
        let result = tokio::select! {
            _ = self.closed.cancelled() => None,
            result = async {
                writer.write_all(bytes).await?;
                writer.flush().await
            } => Some(result),
        };
        match result {
            Some(result) => result,
            None => {
                guard.take();
                Err(closed_error())
            }
        }
    }

    fn close(&self) -> io::Result<()> {
        self.closed.cancel();
        self.connected.store(false, Ordering::SeqCst);
        if let Ok(mut reader) = self.reader.try_lock() {
            reader.take();
        }
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.closed.is_cancelled() && self.connected.load(Ordering::SeqCst)
    }
}
