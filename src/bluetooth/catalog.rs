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

//! Paired and discovered device bookkeeping.

use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::device::RemoteDevice;
use super::platform::{BluetoothAdapter, Capability, PermissionGuard};

/// Immutable snapshot of a device set.
pub type DeviceSet = Arc<BTreeSet<RemoteDevice>>;

/// Tracks bonded devices and devices seen during the current scan.
///
/// Both sets are replaced wholesale on every update, so readers only ever
/// clone an `Arc` and never block writers for long.
pub struct DeviceCatalog {
    adapter: Arc<dyn BluetoothAdapter>,
    permissions: Arc<dyn PermissionGuard>,
    paired: RwLock<DeviceSet>,
    scanned: RwLock<DeviceSet>,
    /// Discovery cycles this catalog asked the radio to start.
    cycles_started: AtomicU64,
    /// Discovery-started reports seen from the radio.
    cycles_reported: AtomicU64,
}

impl DeviceCatalog {
    /// Create an empty catalog.
    pub fn new(adapter: Arc<dyn BluetoothAdapter>, permissions: Arc<dyn PermissionGuard>) -> Self {
        Self {
            adapter,
            permissions,
            paired: RwLock::new(DeviceSet::default()),
            scanned: RwLock::new(DeviceSet::default()),
            cycles_started: AtomicU64::new(0),
            cycles_reported: AtomicU64::new(0),
        }
    }

    /// Current paired-device snapshot.
    pub fn paired(&self) -> DeviceSet {
        self.paired.read().clone()
    }

    /// Current scanned-device snapshot.
    pub fn scanned(&self) -> DeviceSet {
        self.scanned.read().clone()
    }

    pub fn is_paired(&self, device: &RemoteDevice) -> bool {
        self.paired.read().contains(device)
    }

    /// Re-read the bonded device list from the adapter.
    ///
    /// Without the connect capability, or if the adapter query fails, the
    /// previous snapshot is returned unchanged.
    pub async fn refresh_paired(&self) -> DeviceSet {
        if !self.permissions.has_capability(Capability::Connect) {
            debug!("Skipping paired device refresh: no {} permission", Capability::Connect);
            return self.paired();
        }

        match self.adapter.bonded_devices().await {
            Ok(devices) => {
                let set: DeviceSet = Arc::new(devices.into_iter().collect());
                debug!("Paired devices refreshed: {} device(s)", set.len());
                *self.paired.write() = set.clone();
                set
            }
            Err(e) => {
                warn!("Failed to query bonded devices: {}", e);
                self.paired()
            }
        }
    }

    /// Merge a device reported by the scan into the scanned set.
    ///
    /// A device already present under the same address is replaced by the
    /// newer report, never duplicated.
    pub fn on_device_found(&self, device: RemoteDevice) -> DeviceSet {
        let mut scanned = self.scanned.write();
        let mut next = BTreeSet::clone(&scanned);
        debug!("Device found: {}", device);
        next.replace(device);
        *scanned = Arc::new(next);
        scanned.clone()
    }

    /// Forget every scanned device.
    pub fn clear_scanned(&self) {
        *self.scanned.write() = DeviceSet::default();
    }

    /// Record a discovery-started report from the radio.
    pub fn on_discovery_started(&self) {
        self.cycles_reported.fetch_add(1, Ordering::SeqCst);
    }

    /// Whether device reports now belong to the latest started cycle.
    ///
    /// False while reports queued by an earlier cycle are still being
    /// delivered after a restart.
    pub fn is_current_cycle(&self) -> bool {
        self.cycles_reported.load(Ordering::SeqCst) >= self.cycles_started.load(Ordering::SeqCst)
    }

    /// Start a new discovery cycle.
    ///
    /// Clears the scanned set and cancels any running cycle before starting.
    /// Returns false without touching anything if the scan capability is
    /// missing, or if the radio refused to start.
    pub async fn start_discovery(&self) -> bool {
        if !self.permissions.has_capability(Capability::Scan) {
            debug!("Skipping discovery: no {} permission", Capability::Scan);
            return false;
        }

        self.clear_scanned();
        self.stop_discovery().await;

        // Counted before the radio can report the new cycle.
        self.cycles_started.fetch_add(1, Ordering::SeqCst);
        let started = self.adapter.start_discovery().await;
        if started {
            info!("Device discovery started");
        } else {
            self.cycles_started.fetch_sub(1, Ordering::SeqCst);
            warn!("Adapter refused to start discovery");
        }
        started
    }

    /// Cancel the running discovery cycle.
    ///
    /// Returns true only if a cycle was actually cancelled.
    pub async fn stop_discovery(&self) -> bool {
        if !self.permissions.has_capability(Capability::Scan) {
            return false;
        }

        if self.adapter.is_discovering() {
            info!("Stopping device discovery");
            self.adapter.cancel_discovery().await
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::platform::PermissionSet;
    use crate::bluetooth::sim::{SimulatedAdapter, SimulatedAir};
    use proptest::prelude::*;

    fn catalog_with(adapter: Arc<SimulatedAdapter>, permissions: Arc<PermissionSet>) -> DeviceCatalog {
        DeviceCatalog::new(adapter, permissions)
    }

    fn adapter() -> Arc<SimulatedAdapter> {
        SimulatedAir::new().adapter("00:00:00:00:00:01", "Desk")
    }

    #[test]
    fn test_found_devices_are_deduplicated() {
        let catalog = catalog_with(adapter(), Arc::new(PermissionSet::granted()));

        catalog.on_device_found(RemoteDevice::new("AA:AA:AA:AA:AA:AA"));
        catalog.on_device_found(RemoteDevice::new("AA:AA:AA:AA:AA:AA").with_name("Phone"));
        let scanned = catalog.on_device_found(RemoteDevice::new("BB:BB:BB:BB:BB:BB"));

        assert_eq!(scanned.len(), 2);
        let phone = scanned.iter().next().unwrap();
        assert_eq!(phone.display_name.as_deref(), Some("Phone"));
    }

    #[test]
    fn test_clear_then_found_yields_single_device() {
        let catalog = catalog_with(adapter(), Arc::new(PermissionSet::granted()));
        catalog.on_device_found(RemoteDevice::new("AA:AA:AA:AA:AA:AA"));
        catalog.on_device_found(RemoteDevice::new("BB:BB:BB:BB:BB:BB"));

        catalog.clear_scanned();
        let d = RemoteDevice::new("CC:CC:CC:CC:CC:CC");
        let scanned = catalog.on_device_found(d.clone());

        assert_eq!(scanned.len(), 1);
        assert!(scanned.contains(&d));
    }

    #[test]
    fn test_snapshots_are_immutable() {
        let catalog = catalog_with(adapter(), Arc::new(PermissionSet::granted()));
        let before = catalog.scanned();
        catalog.on_device_found(RemoteDevice::new("AA:AA:AA:AA:AA:AA"));
        assert!(before.is_empty());
        assert_eq!(catalog.scanned().len(), 1);
    }

    #[tokio::test]
    async fn test_refresh_paired() {
        let adapter = adapter();
        adapter.set_bonded(vec![RemoteDevice::new("AA:AA:AA:AA:AA:AA").with_name("Phone")]);
        let catalog = catalog_with(adapter, Arc::new(PermissionSet::granted()));

        let paired = catalog.refresh_paired().await;
        assert_eq!(paired.len(), 1);
        assert!(catalog.is_paired(&RemoteDevice::new("AA:AA:AA:AA:AA:AA")));
    }

    #[tokio::test]
    async fn test_refresh_paired_without_permission_keeps_snapshot() {
        let adapter = adapter();
        let permissions = Arc::new(PermissionSet::granted());
        adapter.set_bonded(vec![RemoteDevice::new("AA:AA:AA:AA:AA:AA")]);
        let catalog = catalog_with(adapter.clone(), permissions.clone());
        catalog.refresh_paired().await;

        permissions.set(Capability::Connect, false);
        adapter.set_bonded(vec![]);
        let paired = catalog.refresh_paired().await;
        assert_eq!(paired.len(), 1);
    }

    #[tokio::test]
    async fn test_discovery_without_permission_is_noop() {
        let adapter = adapter();
        let catalog = catalog_with(adapter.clone(), Arc::new(PermissionSet::denied()));

        assert!(!catalog.start_discovery().await);
        assert!(!adapter.is_discovering());
        assert!(!catalog.stop_discovery().await);
    }

    #[tokio::test]
    async fn test_start_discovery_restarts_cycle() {
        let adapter = adapter();
        let catalog = catalog_with(adapter.clone(), Arc::new(PermissionSet::granted()));

        assert!(catalog.start_discovery().await);
        catalog.on_device_found(RemoteDevice::new("AA:AA:AA:AA:AA:AA"));
        assert!(adapter.is_discovering());

        assert!(catalog.start_discovery().await);
        assert!(catalog.scanned().is_empty());
        assert!(adapter.is_discovering());
        assert_eq!(adapter.discovery_cycles(), 2);

        assert!(catalog.stop_discovery().await);
        assert!(!adapter.is_discovering());
        assert!(!catalog.stop_discovery().await);
    }

    #[tokio::test]
    async fn test_reports_from_earlier_cycle_are_not_current() {
        let adapter = adapter();
        let catalog = catalog_with(adapter.clone(), Arc::new(PermissionSet::granted()));
        assert!(catalog.is_current_cycle());

        assert!(catalog.start_discovery().await);
        assert!(catalog.start_discovery().await);
        assert!(!catalog.is_current_cycle());

        // Radio reports for the first cycle, then the second.
        catalog.on_discovery_started();
        assert!(!catalog.is_current_cycle());
        catalog.on_discovery_started();
        assert!(catalog.is_current_cycle());
    }

    proptest! {
        #[test]
        fn prop_scanned_set_is_union_of_addresses(ids in proptest::collection::vec(0u8..8, 0..32)) {
            let catalog = catalog_with(adapter(), Arc::new(PermissionSet::granted()));
            for id in &ids {
                catalog.on_device_found(RemoteDevice::new(format!("00:00:00:00:00:{:02X}", id)));
            }
            let distinct: BTreeSet<u8> = ids.iter().copied().collect();
            prop_assert_eq!(catalog.scanned().len(), distinct.len());
        }
    }
}
