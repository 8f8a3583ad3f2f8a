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

//! Remote Bluetooth device representation.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use uuid::Uuid;

use crate::error::BluetoothError;

/// A remote Bluetooth peer.
///
/// Two devices are the same device when their hardware addresses match;
/// name and service UUID do not take part in equality or ordering.
#[derive(Debug, Clone)]
pub struct RemoteDevice {
    /// Hardware address, e.g. `AA:BB:CC:DD:EE:FF`.
    pub id: String,
    /// Friendly name, if the platform reported one.
    pub display_name: Option<String>,
    /// First service UUID advertised by the device.
    pub service_uuid: Option<Uuid>,
}

impl RemoteDevice {
    /// Create a device known only by its address.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: None,
            service_uuid: None,
        }
    }

    /// Parse a user-supplied `AA:BB:CC:DD:EE:FF` address.
    pub fn from_address(address: &str) -> Result<Self, BluetoothError> {
        let address = address.trim();
        let octets: Vec<&str> = address.split(':').collect();
        let valid = octets.len() == 6
            && octets
                .iter()
                .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()));
        if !valid {
            return Err(BluetoothError::InvalidAddress(address.to_string()));
        }
        Ok(Self::new(address.to_ascii_uppercase()))
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_service_uuid(mut self, uuid: Uuid) -> Self {
        self.service_uuid = Some(uuid);
        self
    }

    /// Name to show to the user, falling back to the address.
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.id)
    }
}

impl PartialEq for RemoteDevice {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for RemoteDevice {}

impl Hash for RemoteDevice {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl PartialOrd for RemoteDevice {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RemoteDevice {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id.cmp(&other.id)
    }
}

impl fmt::Display for RemoteDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.display_name {
            Some(name) => write!(f, "{} ({})", name, self.id),
            None => write!(f, "{}", self.id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn test_equality_by_address() {
        let a = RemoteDevice::new("AA:BB:CC:DD:EE:FF").with_name("Phone");
        let b = RemoteDevice::new("AA:BB:CC:DD:EE:FF");
        assert_eq!(a, b);

        let mut set = BTreeSet::new();
        set.insert(a);
        set.insert(b);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_from_address() {
        let device = RemoteDevice::from_address(" aa:bb:cc:dd:ee:ff ").unwrap();
        assert_eq!(device.id, "AA:BB:CC:DD:EE:FF");

        assert!(RemoteDevice::from_address("AA:BB:CC:DD:EE").is_err());
        assert!(RemoteDevice::from_address("AA:BB:CC:DD:EE:GG").is_err());
        assert!(matches!(
            RemoteDevice::from_address("phone"),
            Err(BluetoothError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_label_and_display() {
        let unnamed = RemoteDevice::new("11:22:33:44:55:66");
        assert_eq!(unnamed.label(), "11:22:33:44:55:66");
        assert_eq!(unnamed.to_string(), "11:22:33:44:55:66");

        let named = unnamed.with_name("Laptop");
        assert_eq!(named.label(), "Laptop");
        assert_eq!(named.to_string(), "Laptop (11:22:33:44:55:66)");
    }
}
