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

//! Bluetooth communication module.
//!
//! Discovers devices, hosts or joins an RFCOMM chat, and moves messages
//! over the resulting socket.

mod catalog;
mod connection;
mod controller;
mod device;
mod platform;
mod protocol;
pub mod sim;

#[cfg(feature = "bluez")]
pub mod bluez;

pub use catalog::{DeviceCatalog, DeviceSet};
pub use connection::{TransferChannel, READ_BUFFER_SIZE};
pub use controller::{
    BluetoothController, ConnectionOutcome, ConnectionPhase, ControllerSettings,
    DEFAULT_DEVICE_NAME, SERVICE_NAME, SERVICE_UUID,
};
pub use device::RemoteDevice;
pub use platform::{
    AdapterEvent, BluetoothAdapter, Capability, PermissionGuard, PermissionSet, RfcommListener,
    RfcommSocket,
};
pub use protocol::{ChatMessage, CodecError, WireFormat, DELIMITER};
