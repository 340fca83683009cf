//! Public reading types produced by [`crate::router::StreamRouter`] and the
//! device events produced by the BLE adapter.

/// One raw sensor notification as delivered by the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct RawNotification {
    /// Notification bytes, header included.
    pub data: Vec<u8>,
    /// Arrival wall-clock time in milliseconds since the Unix epoch.
    pub received_at: f64,
}

impl RawNotification {
    pub fn new(data: Vec<u8>, received_at: f64) -> Self {
        Self { data, received_at }
    }

    /// Stamp `data` with the current wall clock.
    pub fn now(data: Vec<u8>) -> Self {
        Self::new(data, crate::clock::now_ms())
    }

    /// Rolling counter from the notification header, if present.
    pub fn counter(&self) -> Option<u8> {
        self.data
            .get(crate::protocol::NOTIFICATION_COUNTER_OFFSET)
            .copied()
    }
}

/// EEG samples for one electrode from one bioelectric packet.
///
/// All eight electrodes decoded from the same packet carry the same
/// `timestamp`, so channels stay aligned.
#[derive(Debug, Clone, PartialEq)]
pub struct EegReading {
    /// Electrode index, see [`crate::protocol::EEG_CHANNEL_NAMES`].
    pub electrode: usize,
    /// Rolling counter of the notification the packet arrived in.
    pub index: u16,
    /// Synthesized time of the first sample, ms since Unix epoch.
    pub timestamp: f64,
    /// Voltage samples in µV, oldest first.
    pub samples: [f64; 2],
}

/// A single 3-axis measurement.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct XyzSample {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl XyzSample {
    pub(crate) fn from_slice(v: &[f64]) -> Self {
        let at = |i: usize| v.get(i).copied().unwrap_or_default();
        Self {
            x: at(0),
            y: at(1),
            z: at(2),
        }
    }
}

/// One inertial sample: linear acceleration plus angular rate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImuSample {
    /// Rolling counter of the notification the packet arrived in.
    pub index: u16,
    /// Synthesized sample time, ms since Unix epoch.
    pub timestamp: f64,
    /// Acceleration in G.
    pub accel: XyzSample,
    /// Angular rate in °/s.
    pub gyro: XyzSample,
}

/// One optical sample instant: all four optical channels at one time.
#[derive(Debug, Clone, PartialEq)]
pub struct OpticalReading {
    /// Rolling counter of the notification the packet arrived in.
    pub index: u16,
    /// Sample position within the packet (0–2), oldest first.  This is a
    /// time position, not a sensor channel.
    pub channel: usize,
    /// Synthesized time of this sample, ms since Unix epoch.  Samples of one
    /// packet are spaced by one nominal sample period.
    pub timestamp: f64,
    /// Raw 20-bit readings divided by 32768, one per optical channel in the
    /// order of [`crate::protocol::OPTICAL_CHANNEL_NAMES`].
    pub samples: [f64; 4],
}

/// Power / battery housekeeping packet.
///
/// The ten words are passed through untouched; their physical meaning has not
/// been established, so no field is interpreted as a charge percentage.
#[derive(Debug, Clone, PartialEq)]
pub struct PowerReading {
    /// Arrival time of the carrying notification, ms since Unix epoch.
    pub timestamp: f64,
    pub values: [u16; 10],
}

/// A parsed control/status response from the control characteristic.
///
/// The headset replies to `v4`, `v1`, `s` and friends with a JSON object split
/// across several notifications; [`crate::control::ControlAccumulator`]
/// reassembles them.
#[derive(Debug, Clone)]
pub struct ControlResponse {
    /// The raw JSON text.
    pub raw: String,
    /// Key-value pairs from the parsed object.
    pub fields: serde_json::Map<String, serde_json::Value>,
}

/// Connection-level events emitted alongside the reading channels.
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    /// The link is up and services were discovered.  Carries the advertised name.
    Connected(String),
    /// A complete JSON reply from the control characteristic.
    Control(ControlResponse),
    /// The link dropped.  No further readings follow on this connection.
    Disconnected,
}
