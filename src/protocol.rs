//! GATT UUIDs, wire constants, and control-command framing for Athena headsets.
//!
//! All UUIDs belong to the Muse vendor namespace
//! `273eXXXX-4c4d-454d-96be-f03bac821358`.

use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

use crate::error::{AthenaError, Result};

// ── Service ──────────────────────────────────────────────────────────────────

/// Primary GATT service UUID advertised by Muse devices.
pub const MUSE_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000fe8d_0000_1000_8000_00805f9b34fb);

// ── Characteristics ───────────────────────────────────────────────────────────

/// Bidirectional control channel.
///
/// The host writes length-prefixed ASCII commands (e.g. `"v4"`, `"h"`, `"p1045"`)
/// and receives JSON status fragments in response notifications.
/// See [`encode_command`] and [`decode_response`] for the wire format.
pub const CONTROL_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x273e0001_4c4d_454d_96be_f03bac821358);

/// Athena universal sensor characteristic.
///
/// All sensor data (EEG, IMU, optical, battery) is multiplexed on this single
/// characteristic using tag-based binary packets.  Its absence means the
/// headset runs Classic firmware, which this crate does not speak.
pub const ATHENA_SENSOR_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x273e0013_4c4d_454d_96be_f03bac821358);

// ── Notification framing ──────────────────────────────────────────────────────

/// Byte offset of the first tag in every sensor notification.
///
/// Bytes 0 and 1 are a length and a rolling counter; bytes 2–8 are observed
/// on the wire but not interpreted.  Empirical, not vendor-documented.
pub const NOTIFICATION_HEADER_LEN: usize = 9;

/// Byte offset of the rolling per-notification counter.
pub const NOTIFICATION_COUNTER_OFFSET: usize = 1;

/// Opaque sub-header bytes between a tag byte and its payload.
pub const PACKET_SUBHEADER_LEN: usize = 4;

// ── Scaling ───────────────────────────────────────────────────────────────────

/// EEG voltage scale in µV per raw LSB.
///
/// `µV = (raw₁₄ − EEG_OFFSET) × EEG_SCALE`
pub const EEG_SCALE: f64 = 0.0885;

/// Offset-binary zero point of the 14-bit EEG ADC.
pub const EEG_OFFSET: f64 = 8192.0;

/// Accelerometer scale in G per LSB (±2 G over a signed 16-bit range).
pub const ACCEL_SCALE: f64 = 6.10352e-5;

/// Gyroscope scale in °/s per LSB.  Negative: Athena reports the opposite
/// rotation sense to the Classic firmware.
pub const GYRO_SCALE: f64 = -7.4768e-3;

/// Divisor that normalises 20-bit optical readings.
pub const OPTICAL_DIVISOR: f64 = 32768.0;

// ── Stream geometry ───────────────────────────────────────────────────────────

/// EEG channels carried by one bioelectric packet.
pub const EEG_CHANNELS: usize = 8;

/// Samples per EEG channel in one packet.
pub const EEG_SAMPLES_PER_PACKET: usize = 2;

/// IMU samples (accel + gyro triplets) in one packet.
pub const IMU_SAMPLES_PER_PACKET: usize = 3;

/// Optical value groups in one packet.
pub const OPTICAL_GROUPS_PER_PACKET: usize = 3;

/// Values in one optical group.
pub const OPTICAL_VALUES_PER_GROUP: usize = 4;

/// Raw 16-bit words in one power packet.
pub const POWER_VALUES: usize = 10;

/// Electrode names in channel order.
///
/// The first four share positions with Classic hardware; the rest are
/// Athena-only inputs.
pub const EEG_CHANNEL_NAMES: [&str; EEG_CHANNELS] =
    ["TP9", "AF7", "AF8", "TP10", "FPz", "AUX_R", "AUX_L", "AUX"];

/// Optical channel names, in the order of the four values of each sample.
///
/// Each packet holds three consecutive samples; every sample carries all four
/// channels (`raw[sample * 4 + channel]`).
pub const OPTICAL_CHANNEL_NAMES: [&str; OPTICAL_VALUES_PER_GROUP] =
    ["ambient", "infrared", "red", "extra"];

/// Nominal sample rate for a tag's high nibble, in Hz.
pub fn frequency_for_class(class: u8) -> Option<f64> {
    match class {
        0x1 => Some(256.0),
        0x2 => Some(128.0),
        0x3 => Some(64.0),
        0x4 => Some(52.0),
        0x5 => Some(32.0),
        0x6 => Some(16.0),
        0x7 => Some(10.0),
        0x8 => Some(1.0),
        0x9 => Some(0.1),
        _ => None,
    }
}

// ── Presets ───────────────────────────────────────────────────────────────────

/// Device-side stream configuration selected before streaming starts.
///
/// Each preset enables a different combination of sensor kinds and rates.
/// `P1045` is what the reference Athena clients use and is the default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Preset {
    P1034,
    P1035,
    P1041,
    #[default]
    P1045,
}

impl Preset {
    pub const ALL: [Preset; 4] = [Preset::P1034, Preset::P1035, Preset::P1041, Preset::P1045];

    /// ASCII command that selects this preset.
    pub fn command(self) -> &'static str {
        match self {
            Preset::P1034 => "p1034",
            Preset::P1035 => "p1035",
            Preset::P1041 => "p1041",
            Preset::P1045 => "p1045",
        }
    }
}

impl fmt::Display for Preset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.command())
    }
}

impl FromStr for Preset {
    type Err = AthenaError;

    fn from_str(s: &str) -> Result<Self> {
        Preset::ALL
            .into_iter()
            .find(|p| p.command() == s)
            .ok_or_else(|| AthenaError::UnknownCommand(s.to_owned()))
    }
}

// ── Commands ──────────────────────────────────────────────────────────────────

/// One entry of the fixed control-command table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// `v4`: protocol version query; opens the handshake.
    Version,
    /// `s`: status query.
    Status,
    /// `h`: halt streaming.
    Halt,
    /// `pNNNN`: select a stream preset.
    Preset(Preset),
    /// `dc001`: start streaming.
    StartStreaming,
    /// `L1`: set the front indicator light.
    Indicator,
    /// `v1`: firmware / hardware info.
    DeviceInfo,
}

/// Name → command lookup used by [`Command::from_name`].
const COMMAND_TABLE: &[(&str, Command)] = &[
    ("version", Command::Version),
    ("status", Command::Status),
    ("halt", Command::Halt),
    ("preset-p1034", Command::Preset(Preset::P1034)),
    ("preset-p1035", Command::Preset(Preset::P1035)),
    ("preset-p1041", Command::Preset(Preset::P1041)),
    ("preset-p1045", Command::Preset(Preset::P1045)),
    ("start", Command::StartStreaming),
    ("indicator", Command::Indicator),
    ("info", Command::DeviceInfo),
];

impl Command {
    /// Look up a command by its table name.
    ///
    /// Asking for a name outside the fixed table is a caller bug and fails
    /// with [`AthenaError::UnknownCommand`].
    pub fn from_name(name: &str) -> Result<Command> {
        COMMAND_TABLE
            .iter()
            .find(|(n, _)| *n == name)
            .map(|&(_, cmd)| cmd)
            .ok_or_else(|| AthenaError::UnknownCommand(name.to_owned()))
    }

    /// Names accepted by [`Command::from_name`], in table order.
    pub fn names() -> impl Iterator<Item = &'static str> {
        COMMAND_TABLE.iter().map(|(n, _)| *n)
    }

    /// The ASCII text written to the control characteristic.
    pub fn ascii(self) -> &'static str {
        match self {
            Command::Version => "v4",
            Command::Status => "s",
            Command::Halt => "h",
            Command::Preset(p) => p.command(),
            Command::StartStreaming => "dc001",
            Command::Indicator => "L1",
            Command::DeviceInfo => "v1",
        }
    }

    /// Framed bytes ready to write; see [`encode_command`].
    pub fn encode(self) -> Vec<u8> {
        encode_command(self.ascii())
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.ascii())
    }
}

/// Encode a text command for the control characteristic.
///
/// The headset expects a length-prefixed frame:
/// ```text
/// byte 0     : payload length (= command.len() + 1 for the trailing '\n')
/// bytes 1..N : ASCII command string
/// byte N+1   : '\n' terminator
/// ```
///
/// ```
/// # use athena_rs::protocol::encode_command;
/// assert_eq!(encode_command("h"), &[0x02, b'h', b'\n']);
/// ```
pub fn encode_command(cmd: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(cmd.len() + 2);
    bytes.push((cmd.len() + 1) as u8);
    bytes.extend_from_slice(cmd.as_bytes());
    bytes.push(b'\n');
    bytes
}

/// Decode a control-characteristic notification into its text fragment.
///
/// Responses use the same framing as commands: the first byte is the payload
/// length, the rest is a (possibly partial) JSON fragment.  Reassemble
/// fragments with [`crate::control::ControlAccumulator`].
///
/// Returns an empty string if `bytes` is empty.
pub fn decode_response(bytes: &[u8]) -> String {
    let Some((&len, rest)) = bytes.split_first() else {
        return String::new();
    };
    let end = usize::from(len).min(rest.len());
    String::from_utf8_lossy(&rest[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_commands_with_length_and_newline() {
        assert_eq!(encode_command("v4"), b"\x03v4\n");
        assert_eq!(encode_command("dc001"), b"\x06dc001\n");
        assert_eq!(Command::Preset(Preset::P1045).encode(), b"\x06p1045\n");
    }

    #[test]
    fn decodes_response_fragment() {
        assert_eq!(decode_response(b"\x05{\"rc\""), "{\"rc\"");
        assert_eq!(decode_response(b""), "");
        // Declared length longer than the buffer is clamped.
        assert_eq!(decode_response(b"\x10ab"), "ab");
    }

    #[test]
    fn unknown_command_name_is_rejected() {
        assert!(matches!(
            Command::from_name("reboot"),
            Err(AthenaError::UnknownCommand(name)) if name == "reboot"
        ));
        assert_eq!(Command::from_name("halt").unwrap(), Command::Halt);
    }

    #[test]
    fn every_table_name_resolves() {
        for name in Command::names() {
            assert!(Command::from_name(name).is_ok(), "{name}");
        }
    }

    #[test]
    fn presets_round_trip_through_text() {
        for p in Preset::ALL {
            assert_eq!(p.command().parse::<Preset>().unwrap(), p);
        }
        assert!("p21".parse::<Preset>().is_err());
    }

    #[test]
    fn frequency_classes() {
        assert_eq!(frequency_for_class(0x1), Some(256.0));
        assert_eq!(frequency_for_class(0x4), Some(52.0));
        assert_eq!(frequency_for_class(0x0), None);
        assert_eq!(frequency_for_class(0xf), None);
    }
}
