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

//! BlueChat terminal client.

use anyhow::Result;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bluechat::bluetooth::{BluetoothAdapter, PermissionSet, RemoteDevice};
use bluechat::config::Config;
use bluechat::{ChatSession, SessionState};

const HELP: &str = "\
Commands:
  scan                 start device discovery
  stop                 stop device discovery
  devices              list discovered devices
  paired               list paired devices
  host                 wait for a peer to connect
  connect <n|address>  connect to a listed device or an address
  send <text>          send a message
  disconnect           close the connection or stop hosting
  dismiss              clear the last error
  quit                 exit";

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.filter)),
        )
        .init();

    info!("Starting BlueChat v{}...", env!("CARGO_PKG_VERSION"));

    let adapter = create_adapter(&config).await?;
    let session = ChatSession::new(
        adapter,
        Arc::new(PermissionSet::granted()),
        config.controller_settings(),
    )
    .await;
    let mut updates = session.subscribe();

    println!("{}", HELP);
    let mut view = View::default();
    view.render(&session.snapshot());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                if !handle_command(&session, &mut view, line.trim()).await {
                    break;
                }
            }
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = updates.borrow_and_update().clone();
                view.render(&state);
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    session.shutdown();
    info!("BlueChat stopped");
    Ok(())
}

#[cfg(feature = "bluez")]
async fn create_adapter(config: &Config) -> Result<Arc<dyn BluetoothAdapter>> {
    use bluechat::bluetooth::bluez::BluezAdapter;
    use std::time::Duration;

    let adapter = BluezAdapter::new(
        Duration::from_secs(config.bluetooth.discovery_timeout_secs),
        config.bluetooth.rfcomm_channel,
    )
    .await?;
    Ok(adapter)
}

/// Offline radio with one paired peer that echoes every message back.
#[cfg(not(feature = "bluez"))]
async fn create_adapter(config: &Config) -> Result<Arc<dyn BluetoothAdapter>> {
    use bluechat::bluetooth::sim::SimulatedAir;

    tracing::warn!("Built without the bluez feature, using a simulated radio");

    let air = SimulatedAir::new();
    let local = air.adapter("00:1A:7D:DA:71:01", config.bluetooth.device_name.clone());
    let peer = air.adapter("00:1A:7D:DA:71:02", "Echo Phone");
    let stranger = RemoteDevice::new("00:1A:7D:DA:71:03").with_name("Headset");

    local.set_bonded(vec![peer.identity()]);
    local.set_nearby(vec![peer.identity(), stranger]);

    tokio::spawn(echo::run(peer, config.controller_settings()));
    Ok(local)
}

#[cfg(not(feature = "bluez"))]
mod echo {
    use futures::StreamExt;
    use std::sync::Arc;
    use tracing::{debug, warn};

    use bluechat::bluetooth::sim::SimulatedAdapter;
    use bluechat::bluetooth::{BluetoothAdapter, ChatMessage, ControllerSettings, TransferChannel};

    /// Host the chat service forever, echoing every message of each peer.
    pub async fn run(adapter: Arc<SimulatedAdapter>, settings: ControllerSettings) {
        let name = adapter.identity().label().to_string();
        loop {
            let listener = match adapter
                .listen(&settings.service_name, settings.service_uuid)
                .await
            {
                Ok(listener) => listener,
                Err(e) => {
                    warn!("Echo peer cannot listen: {}", e);
                    return;
                }
            };
            let accepted = listener.accept().await;
            let _ = listener.close();
            let socket = match accepted {
                Ok(socket) => socket,
                Err(e) => {
                    warn!("Echo peer accept failed: {}", e);
                    continue;
                }
            };

            let channel = Arc::new(TransferChannel::new(
                socket,
                settings.wire_format,
                settings.read_buffer_size,
            ));
            let mut incoming = Box::pin(channel.clone().incoming());
            while let Some(Ok(message)) = incoming.next().await {
                let reply = ChatMessage::local(name.clone(), format!("echo: {}", message.body));
                channel.send_message(&reply).await;
            }
            channel.close();
            debug!("Echo peer connection ended");
        }
    }
}

/// Terminal rendering of state snapshots.
#[derive(Default)]
struct View {
    status: String,
    error: Option<String>,
    printed_messages: usize,
    /// Devices from the last `devices` or `paired` listing.
    listing: Vec<RemoteDevice>,
}

impl View {
    fn render(&mut self, state: &SessionState) {
        let status = status_line(state);
        if status != self.status {
            println!("[{}]", status);
            self.status = status;
        }

        if state.last_error != self.error {
            if let Some(error) = &state.last_error {
                println!("! {}", error);
            }
            self.error = state.last_error.clone();
        }

        for message in state.message_log.iter().skip(self.printed_messages) {
            let who = if message.origin_local { "you" } else { message.sender_name.as_str() };
            println!("<{}> {}", who, message.body);
        }
        self.printed_messages = state.message_log.len();
    }

    fn list(&mut self, title: &str, devices: Vec<RemoteDevice>) {
        println!("{} ({}):", title, devices.len());
        for (i, device) in devices.iter().enumerate() {
            println!("  {}. {}", i + 1, device);
        }
        self.listing = devices;
    }
}

fn status_line(state: &SessionState) -> String {
    let connection = if state.is_connected {
        "connected"
    } else if state.is_connecting {
        "connecting"
    } else if state.is_waiting_for_inbound {
        "waiting for peer"
    } else {
        "idle"
    };
    let discovery = if state.is_discovering {
        ", scanning"
    } else if state.is_discovery_finished {
        ", scan finished"
    } else {
        ""
    };
    format!(
        "{}{} | {} paired, {} found",
        connection,
        discovery,
        state.paired_devices.len(),
        state.scanned_devices.len()
    )
}

/// Resolve `connect` arguments: a listing index or a hardware address.
fn resolve_device(view: &View, state: &SessionState, arg: &str) -> Option<RemoteDevice> {
    if let Ok(index) = arg.parse::<usize>() {
        return index.checked_sub(1).and_then(|i| view.listing.get(i)).cloned();
    }
    match RemoteDevice::from_address(arg) {
        Ok(device) => Some(
            state
                .paired_devices
                .get(&device)
                .or_else(|| state.scanned_devices.get(&device))
                .cloned()
                .unwrap_or(device),
        ),
        Err(e) => {
            println!("{}", e);
            None
        }
    }
}

/// Run one command line. Returns false when the user asked to quit.
async fn handle_command(session: &ChatSession, view: &mut View, line: &str) -> bool {
    let (command, arg) = match line.split_once(' ') {
        Some((command, arg)) => (command, arg.trim()),
        None => (line, ""),
    };

    match command {
        "" => {}
        "scan" => session.start_scan().await,
        "stop" => session.stop_scan().await,
        "devices" => {
            let devices = session.snapshot().scanned_devices.iter().cloned().collect();
            view.list("Discovered devices", devices);
        }
        "paired" => {
            let devices = session.refresh_paired_devices().await.iter().cloned().collect();
            view.list("Paired devices", devices);
        }
        "host" => session.host_chat().await,
        "connect" => match resolve_device(view, &session.snapshot(), arg) {
            Some(device) => session.connect_to_device(&device).await,
            None => println!("Unknown device '{}'", arg),
        },
        "send" if arg.is_empty() => println!("Usage: send <text>"),
        "send" => {
            if session.send_message(arg).await.is_none() {
                println!("Not sent: no active connection");
            }
        }
        "disconnect" => {
            if session.snapshot().is_waiting_for_inbound {
                session.stop_listening_for_incoming_connections();
            } else {
                session.disconnect_from_device();
            }
        }
        "dismiss" => session.dismiss_error(),
        "help" => println!("{}", HELP),
        "quit" | "exit" => return false,
        other => println!("Unknown command '{}'. Type 'help'.", other),
    }
    true
}
