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

//! Platform capability traits.
//!
//! The controller never talks to a Bluetooth stack directly. It is handed an
//! adapter, a permission guard, and an event subscription at construction so
//! that a real stack and the in-memory simulation are interchangeable.
//!
//! Socket operations that wait on the peer (`accept`, `connect`, `read`,
//! `write`) are cancelled by calling `close` on the same socket from another
//! task. A closed socket makes every pending and future call fail.

use async_trait::async_trait;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::device::RemoteDevice;

/// Asynchronous notifications delivered by the platform.
#[derive(Debug, Clone)]
pub enum AdapterEvent {
    /// A device answered an inquiry scan.
    DeviceFound(RemoteDevice),
    DiscoveryStarted,
    DiscoveryFinished,
    /// Link-level connection state of a peer changed.
    ConnectionStateChanged {
        device: RemoteDevice,
        connected: bool,
    },
    BondStateChanged {
        device: RemoteDevice,
        bonded: bool,
    },
    /// Radio switched on or off.
    AdapterStateChanged { powered: bool },
}

/// A connected (or connectable) RFCOMM stream socket.
#[async_trait]
pub trait RfcommSocket: Send + Sync {
    /// The peer at the other end.
    fn remote_device(&self) -> RemoteDevice;

    /// Perform the connect handshake. Only meaningful for client sockets.
    async fn connect(&self) -> io::Result<()>;

    /// Read whatever bytes are available. `Ok(0)` means the peer closed.
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write all of `bytes` in one call.
    async fn write(&self, bytes: &[u8]) -> io::Result<()>;

    /// Close the socket. Idempotent.
    fn close(&self) -> io::Result<()>;

    fn is_connected(&self) -> bool;
}

/// A listening RFCOMM server socket.
#[async_trait]
pub trait RfcommListener: Send + Sync {
    /// Wait for the next inbound connection.
    async fn accept(&self) -> io::Result<Arc<dyn RfcommSocket>>;

    /// Stop listening. Idempotent.
    fn close(&self) -> io::Result<()>;
}

/// The local Bluetooth radio.
#[async_trait]
pub trait BluetoothAdapter: Send + Sync {
    /// Friendly name of the local adapter.
    fn name(&self) -> Option<String>;

    /// Devices bonded with this adapter.
    async fn bonded_devices(&self) -> io::Result<Vec<RemoteDevice>>;

    /// Begin an inquiry scan. Returns false if the radio refused.
    async fn start_discovery(&self) -> bool;

    /// Cancel a running inquiry scan. Returns false if none was running.
    async fn cancel_discovery(&self) -> bool;

    fn is_discovering(&self) -> bool;

    /// Open a server socket registered under `uuid`.
    async fn listen(&self, service_name: &str, uuid: Uuid) -> io::Result<Arc<dyn RfcommListener>>;

    /// Create an unconnected client socket aimed at `uuid` on `device`.
    fn create_socket(&self, device: &RemoteDevice, uuid: Uuid) -> io::Result<Arc<dyn RfcommSocket>>;

    /// Subscribe to platform events.
    fn subscribe(&self) -> broadcast::Receiver<AdapterEvent>;
}

/// Platform permissions guarding Bluetooth operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Inquiry scan.
    Scan,
    /// Listening, connecting, and talking to bonded devices.
    Connect,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scan => "BLUETOOTH_SCAN",
            Self::Connect => "BLUETOOTH_CONNECT",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Answers whether a capability is currently granted.
pub trait PermissionGuard: Send + Sync {
    fn has_capability(&self, capability: Capability) -> bool;
}

/// Mutable permission flags.
///
/// Desktop stacks have no runtime permission model, so the default grants
/// everything; tests revoke individual capabilities.
#[derive(Debug)]
pub struct PermissionSet {
    scan: AtomicBool,
    connect: AtomicBool,
}

impl PermissionSet {
    pub fn granted() -> Self {
        Self {
            scan: AtomicBool::new(true),
            connect: AtomicBool::new(true),
        }
    }

    pub fn denied() -> Self {
        Self {
            scan: AtomicBool::new(false),
            connect: AtomicBool::new(false),
        }
    }

    pub fn set(&self, capability: Capability, granted: bool) {
        match capability {
            Capability::Scan => self.scan.store(granted, Ordering::SeqCst),
            Capability::Connect => self.connect.store(granted, Ordering::SeqCst),
        }
    }
}

impl Default for PermissionSet {
    fn default() -> Self {
        Self::granted()
    }
}

impl PermissionGuard for PermissionSet {
    fn has_capability(&self, capability: Capability) -> bool {
        match capability {
            Capability::Scan => self.scan.load(Ordering::SeqCst),
            Capability::Connect => self.connect.load(Ordering::SeqCst),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_set() {
        let permissions = PermissionSet::granted();
        assert!(permissions.has_capability(Capability::Scan));
        assert!(permissions.has_capability(Capability::Connect));

        permissions.set(Capability::Scan, false);
        assert!(!permissions.has_capability(Capability::Scan));
        assert!(permissions.has_capability(Capability::Connect));

        let denied = PermissionSet::denied();
        assert!(!denied.has_capability(Capability::Connect));
    }
}
