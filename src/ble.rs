//! `btleplug` transport: scanning, connecting, and wiring an Athena headset
//! to a [`StreamRouter`] and a [`ConnectionSequencer`].

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::control::ControlAccumulator;
use crate::error::{AthenaError, Result};
use crate::protocol::{Command, Preset, ATHENA_SENSOR_CHARACTERISTIC, CONTROL_CHARACTERISTIC};
use crate::router::{pump, reading_channels, ReadingReceivers, StreamRouter};
use crate::sequencer::{CommandTiming, ConnectionSequencer, SequencerState};
use crate::transport::{ControlChannel, DataChannel, NotificationStream};
use crate::types::{DeviceEvent, RawNotification};

// ── Config ────────────────────────────────────────────────────────────────────

/// Configuration for [`AthenaClient`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// BLE scan duration in seconds before giving up.  Default: `15`.
    pub scan_timeout_secs: u64,
    /// Match devices whose advertised name starts with this string.
    /// Default: `"Muse"`.
    pub name_prefix: String,
    /// Stream preset selected during the handshake.  Default: `p1045`.
    pub preset: Preset,
    /// Handshake pauses.  The defaults are what the firmware needs.
    pub timing: CommandTiming,
    /// Capacity of the [`DeviceEvent`] channel.  Default: `256`.
    pub channel_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            scan_timeout_secs: 15,
            name_prefix: "Muse".into(),
            preset: Preset::default(),
            timing: CommandTiming::default(),
            channel_capacity: 256,
        }
    }
}

// ── Transport adapters ────────────────────────────────────────────────────────

/// Control characteristic of a connected peripheral.
pub struct BleControl {
    peripheral: Peripheral,
    characteristic: Characteristic,
}

#[async_trait]
impl ControlChannel for BleControl {
    async fn write(&self, bytes: &[u8]) -> Result<()> {
        self.peripheral
            .write(&self.characteristic, bytes, WriteType::WithoutResponse)
            .await
            .map_err(|e| AthenaError::Transport {
                reason: "control write failed".into(),
                source: Some(Box::new(e)),
            })
    }
}

/// Sensor characteristic of a connected peripheral.
pub struct BleSensor {
    peripheral: Peripheral,
}

#[async_trait]
impl DataChannel for BleSensor {
    async fn notifications(&self) -> Result<NotificationStream> {
        let stream = self.peripheral.notifications().await?;
        Ok(Box::pin(stream.filter_map(|n| async move {
            (n.uuid == ATHENA_SENSOR_CHARACTERISTIC).then(|| RawNotification::now(n.value))
        })))
    }
}

// ── AthenaDevice ──────────────────────────────────────────────────────────────

/// A headset discovered during a BLE scan.
#[derive(Clone, Debug)]
pub struct AthenaDevice {
    /// Advertised device name (e.g. `"MuseS-AB12"`).
    pub name: String,
    /// Platform BLE identifier: a UUID on macOS / Windows, a MAC address on Linux.
    pub id: String,
    pub(crate) peripheral: Peripheral,
    pub(crate) adapter: Adapter,
}

// ── AthenaClient ──────────────────────────────────────────────────────────────

/// Everything a connection produces: typed readings and device events.
#[derive(Debug)]
pub struct AthenaStreams {
    pub readings: ReadingReceivers,
    pub events: mpsc::Receiver<DeviceEvent>,
}

/// BLE client for Athena-firmware Muse headsets.
pub struct AthenaClient {
    config: ClientConfig,
}

impl AthenaClient {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    /// Scan for `scan_timeout_secs` and return every matching headset.
    pub async fn scan_all(&self) -> Result<Vec<AthenaDevice>> {
        let adapter = first_adapter().await?;

        info!("scan_all: scanning for {} s …", self.config.scan_timeout_secs);
        adapter.start_scan(ScanFilter::default()).await?;
        tokio::time::sleep(Duration::from_secs(self.config.scan_timeout_secs)).await;
        adapter.stop_scan().await.ok();

        let mut found = vec![];
        for p in adapter.peripherals().await? {
            if let Ok(Some(props)) = p.properties().await {
                if let Some(name) = props.local_name {
                    if name.starts_with(&self.config.name_prefix) {
                        let id = p.id().to_string();
                        info!("scan_all: found {name}  id={id}");
                        found.push(AthenaDevice {
                            name,
                            id,
                            peripheral: p,
                            adapter: adapter.clone(),
                        });
                    }
                }
            }
        }
        info!("scan_all: {} device(s) found", found.len());
        Ok(found)
    }

    /// Connect to a device returned by [`AthenaClient::scan_all`].
    pub async fn connect_to(&self, device: AthenaDevice) -> Result<(AthenaStreams, AthenaHandle)> {
        self.setup_peripheral(device.peripheral, device.name, device.adapter)
            .await
    }

    /// Connect to the first matching headset that shows up.
    pub async fn connect(&self) -> Result<(AthenaStreams, AthenaHandle)> {
        let adapter = first_adapter().await?;

        info!(
            "Scanning for Muse devices (timeout: {} s) …",
            self.config.scan_timeout_secs
        );
        adapter.start_scan(ScanFilter::default()).await?;
        let peripheral = self.find_first(&adapter).await?;
        adapter.stop_scan().await.ok();

        let props = peripheral.properties().await?.unwrap_or_default();
        let device_name = props.local_name.unwrap_or_else(|| "Unknown".into());
        info!("Found device: {device_name}");

        self.setup_peripheral(peripheral, device_name, adapter).await
    }

    async fn setup_peripheral(
        &self,
        peripheral: Peripheral,
        device_name: String,
        adapter: Adapter,
    ) -> Result<(AthenaStreams, AthenaHandle)> {
        // BlueZ's Device1.Connect can block forever on a bad link.
        tokio::time::timeout(Duration::from_secs(10), peripheral.connect())
            .await
            .map_err(|_| AthenaError::Timeout {
                operation: "BLE connect()",
                secs: 10,
            })??;

        // BlueZ reports the link before its GATT cache is filled.
        #[cfg(target_os = "linux")]
        tokio::time::sleep(Duration::from_millis(600)).await;

        tokio::time::timeout(Duration::from_secs(15), peripheral.discover_services())
            .await
            .map_err(|_| AthenaError::Timeout {
                operation: "discover_services()",
                secs: 15,
            })??;
        info!("Connected and services discovered: {device_name}");

        let chars: BTreeSet<Characteristic> = peripheral.characteristics();
        let find_char = |uuid: Uuid| -> Result<Characteristic> {
            chars
                .iter()
                .find(|c| c.uuid == uuid)
                .cloned()
                .ok_or(AthenaError::MissingCharacteristic(uuid))
        };

        // Classic firmware has no universal sensor characteristic.
        let sensor_char = find_char(ATHENA_SENSOR_CHARACTERISTIC)?;
        let control_char = find_char(CONTROL_CHARACTERISTIC)?;
        peripheral.subscribe(&control_char).await?;
        peripheral.subscribe(&sensor_char).await?;

        let cancel = CancellationToken::new();
        let (event_tx, event_rx) = mpsc::channel::<DeviceEvent>(self.config.channel_capacity);
        let _ = event_tx.send(DeviceEvent::Connected(device_name.clone())).await;

        spawn_disconnect_watcher(adapter, peripheral.id(), cancel.clone(), event_tx.clone());
        spawn_control_reader(peripheral.clone(), cancel.clone(), event_tx.clone());

        // ── Sensor data ───────────────────────────────────────────────────────
        let (senders, readings) = reading_channels();
        let sensor = BleSensor {
            peripheral: peripheral.clone(),
        };
        let stream = sensor.notifications().await?;
        let data_cancel = cancel.clone();
        tokio::spawn(async move {
            info!("Athena: notification stream subscribed, waiting for data…");
            let mut router = StreamRouter::new(senders);
            let total = pump(stream, &mut router, data_cancel.clone()).await;
            info!(
                "Athena: data task finished ({} packets, {} unknown tags, {} truncated)",
                total.packets, total.unknown_tags, total.partial
            );
            if !data_cancel.is_cancelled() {
                data_cancel.cancel();
                let _ = event_tx.send(DeviceEvent::Disconnected).await;
            }
        });

        let sequencer = ConnectionSequencer::new(
            BleControl {
                peripheral: peripheral.clone(),
                characteristic: control_char,
            },
            self.config.preset,
            self.config.timing,
            cancel.clone(),
        );

        let handle = AthenaHandle {
            peripheral,
            sequencer: Arc::new(sequencer),
            cancel,
        };
        let streams = AthenaStreams {
            readings,
            events: event_rx,
        };
        Ok((streams, handle))
    }

    /// Poll until the first matching peripheral appears or the timeout expires.
    async fn find_first(&self, adapter: &Adapter) -> Result<Peripheral> {
        let prefix = &self.config.name_prefix;
        let secs = self.config.scan_timeout_secs;

        let result = tokio::time::timeout(Duration::from_secs(secs), async {
            loop {
                let peripherals = adapter.peripherals().await.unwrap_or_default();
                for p in peripherals {
                    if let Ok(Some(props)) = p.properties().await {
                        if let Some(name) = &props.local_name {
                            if name.starts_with(prefix.as_str()) {
                                return p;
                            }
                        }
                    }
                }
                tokio::time::sleep(Duration::from_millis(250)).await;
            }
        })
        .await;

        result.map_err(|_| AthenaError::DeviceNotFound {
            prefix: prefix.clone(),
            secs,
        })
    }
}

async fn first_adapter() -> Result<Adapter> {
    let manager = Manager::new().await?;
    let adapter = manager
        .adapters()
        .await?
        .into_iter()
        .next()
        .ok_or(AthenaError::NoAdapter)?;
    wait_powered_on(&adapter).await;
    Ok(adapter)
}

/// macOS: CBCentralManager ignores scan requests until it reaches poweredOn.
#[cfg(target_os = "macos")]
async fn wait_powered_on(adapter: &Adapter) {
    use btleplug::api::CentralState;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        match adapter.adapter_state().await {
            Ok(CentralState::PoweredOn) => break,
            Ok(state) if tokio::time::Instant::now() >= deadline => {
                warn!("macOS: adapter still in state {state:?} after 3 s, proceeding anyway");
                break;
            }
            Ok(state) => debug!("macOS: adapter state = {state:?}, waiting…"),
            Err(e) => {
                warn!("macOS: adapter_state() error: {e}");
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    tokio::time::sleep(Duration::from_millis(300)).await;
}

#[cfg(not(target_os = "macos"))]
async fn wait_powered_on(_adapter: &Adapter) {}

/// Fire `cancel` and emit [`DeviceEvent::Disconnected`] when the adapter
/// reports that `peripheral_id` dropped.
fn spawn_disconnect_watcher(
    adapter: Adapter,
    peripheral_id: btleplug::platform::PeripheralId,
    cancel: CancellationToken,
    tx: mpsc::Sender<DeviceEvent>,
) {
    tokio::spawn(async move {
        let mut events = match adapter.events().await {
            Ok(events) => events,
            Err(e) => {
                warn!("Disconnect watcher: could not subscribe to adapter events: {e}");
                return;
            }
        };
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                next = events.next() => match next {
                    Some(event) => event,
                    None => break,
                },
            };
            if let CentralEvent::DeviceDisconnected(id) = event {
                if id == peripheral_id {
                    info!("Disconnect watcher: device {id:?} disconnected.");
                    if !cancel.is_cancelled() {
                        cancel.cancel();
                        let _ = tx.send(DeviceEvent::Disconnected).await;
                    }
                    break;
                }
            }
        }
    });
}

/// Reassemble JSON replies from the control characteristic into
/// [`DeviceEvent::Control`].
fn spawn_control_reader(
    peripheral: Peripheral,
    cancel: CancellationToken,
    tx: mpsc::Sender<DeviceEvent>,
) {
    tokio::spawn(async move {
        let mut notifications = match peripheral.notifications().await {
            Ok(n) => n,
            Err(e) => {
                warn!("Athena: could not get control notifications: {e}");
                return;
            }
        };
        let mut acc = ControlAccumulator::new();
        loop {
            let notif = tokio::select! {
                _ = cancel.cancelled() => break,
                next = notifications.next() => match next {
                    Some(n) => n,
                    None => break,
                },
            };
            if notif.uuid != CONTROL_CHARACTERISTIC {
                continue;
            }
            if let Some(resp) = acc.push_notification(&notif.value) {
                debug!("Athena control reply: {}", resp.raw);
                if tx.send(DeviceEvent::Control(resp)).await.is_err() {
                    break;
                }
            }
        }
    });
}

// ── AthenaHandle ──────────────────────────────────────────────────────────────

/// Command side of an active connection.
///
/// Cloning is cheap; every clone shares the same serialised command queue.
#[derive(Clone)]
pub struct AthenaHandle {
    peripheral: Peripheral,
    sequencer: Arc<ConnectionSequencer<BleControl>>,
    cancel: CancellationToken,
}

impl AthenaHandle {
    /// Run the start-up handshake (`v4 s h <preset> dc001 dc001 L1`).
    pub async fn start(&self) -> Result<()> {
        self.sequencer.start().await
    }

    /// Pause streaming (`h`).
    pub async fn pause(&self) -> Result<()> {
        self.sequencer.pause().await
    }

    /// Resume streaming (`dc001`).
    pub async fn resume(&self) -> Result<()> {
        self.sequencer.resume().await
    }

    /// Halt streaming for good.
    pub async fn stop(&self) -> Result<()> {
        self.sequencer.stop().await
    }

    /// Send a command from the fixed table by name, e.g. `"status"`.
    pub async fn command(&self, name: &str) -> Result<()> {
        self.sequencer.send_named(name).await
    }

    /// Request firmware / hardware info (`v1`).
    pub async fn request_device_info(&self) -> Result<()> {
        self.sequencer.send(Command::DeviceInfo).await
    }

    pub fn state(&self) -> SequencerState {
        self.sequencer.state()
    }

    /// Check the link at the adapter level.
    pub async fn is_connected(&self) -> bool {
        self.peripheral.is_connected().await.unwrap_or(false)
    }

    /// Abort pending commands, stop the background tasks, and drop the link.
    pub async fn disconnect(&self) -> Result<()> {
        self.cancel.cancel();
        self.peripheral.disconnect().await?;
        Ok(())
    }
}
