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

//! Error types for the Bluetooth layer.

use std::io;
use thiserror::Error;

use crate::bluetooth::Capability;

/// Errors returned by controller operations.
#[derive(Debug, Error)]
pub enum BluetoothError {
    /// A platform capability the operation needs was not granted.
    #[error("No {0} permission")]
    PermissionDenied(Capability),

    #[error("Bluetooth I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid device address: {0}")]
    InvalidAddress(String),
}

/// Errors that end a transfer channel's receive stream.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("Connection closed by remote")]
    Closed,

    #[error("Transfer failed: {0}")]
    Io(#[from] io::Error),
}
