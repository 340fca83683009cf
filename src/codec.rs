//! Tag-dispatched decoder for Athena sensor notifications.
//!
//! Athena multiplexes every sensor onto one characteristic
//! ([`crate::protocol::ATHENA_SENSOR_CHARACTERISTIC`]).  Each notification is
//! a 9-byte header followed by back-to-back packets:
//!
//! ```text
//! [0..8]  notification header (byte 1 = rolling counter, rest unused here)
//! [9..]   packets, repeated:
//!           byte 0     : tag
//!           bytes 1-4  : sub-header (skipped)
//!           bytes 5+   : payload, length fixed by the tag
//! ```
//!
//! The tag's high nibble is the nominal sample-rate class, the low nibble the
//! data type.  Only the tags listed below are decoded:
//!
//! | Tag | Sensor | Payload | Fields | Entries |
//! |---|---|---|---|---|
//! | `0x11`, `0x12` | EEG | 28 B | 16 × u14 | 1 × 16 µV |
//! | `0x13` | DRL / REF | 7 B | u14 | 1 × 2 µV |
//! | `0x47` | IMU | 36 B | 18 × i16 | 3 × (accel, gyro) |
//! | `0x34`, `0x35` | Optical | 30 B | 12 × u20 | 3 × 4 normalised |
//! | `0x88`, `0x98` | Battery | 20 B | 10 × u16 | 1 × 10 raw |
//!
//! Anything else is [`PacketKind::Unknown`]: the cursor advances one byte and
//! decoding carries on, so an unclassified packet never hides the packets
//! after it.

use std::collections::BTreeMap;
use std::fmt;

use log::debug;

use crate::bits::{extract_signed, extract_unsigned};
use crate::protocol::{
    frequency_for_class, ACCEL_SCALE, EEG_CHANNELS, EEG_OFFSET, EEG_SAMPLES_PER_PACKET,
    EEG_SCALE, GYRO_SCALE, IMU_SAMPLES_PER_PACKET, NOTIFICATION_HEADER_LEN,
    OPTICAL_DIVISOR, OPTICAL_GROUPS_PER_PACKET, OPTICAL_VALUES_PER_GROUP,
    PACKET_SUBHEADER_LEN, POWER_VALUES,
};

// ── Tags ──────────────────────────────────────────────────────────────────────

/// The closed set of decodable packet types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TagType {
    Eeg4,
    Eeg8,
    Reference,
    Optical4,
    Optical8,
    Imu,
    Battery,
}

impl TagType {
    /// Payload length in bytes, excluding tag and sub-header.
    pub fn payload_len(self) -> usize {
        match self {
            TagType::Eeg4 | TagType::Eeg8 => 28,
            TagType::Reference => 7,
            TagType::Optical4 | TagType::Optical8 => 30,
            TagType::Imu => 36,
            TagType::Battery => 20,
        }
    }

    /// Samples per channel carried by one packet.
    pub fn sample_count(self) -> usize {
        match self {
            TagType::Eeg4 | TagType::Eeg8 => EEG_SAMPLES_PER_PACKET,
            TagType::Reference | TagType::Battery => 1,
            TagType::Optical4 | TagType::Optical8 => OPTICAL_GROUPS_PER_PACKET,
            TagType::Imu => IMU_SAMPLES_PER_PACKET,
        }
    }

    pub fn kind(self) -> PacketKind {
        match self {
            TagType::Eeg4 | TagType::Eeg8 => PacketKind::Bioelectric,
            TagType::Reference => PacketKind::Reference,
            TagType::Optical4 | TagType::Optical8 => PacketKind::Optical,
            TagType::Imu => PacketKind::Inertial,
            TagType::Battery => PacketKind::Power,
        }
    }
}

/// A packet tag byte: `(frequency class << 4) | data type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tag(pub u8);

impl Tag {
    /// High nibble: nominal sample-rate class.
    pub fn frequency_class(self) -> u8 {
        self.0 >> 4
    }

    /// Low nibble: data-type class.
    pub fn data_class(self) -> u8 {
        self.0 & 0x0f
    }

    /// Nominal sample rate in Hz, when the high nibble maps to one.
    pub fn frequency_hz(self) -> Option<f64> {
        frequency_for_class(self.frequency_class())
    }

    /// The packet type for the tag bytes this decoder understands.
    ///
    /// Matching is on the whole byte, not just the type nibble: an EEG type
    /// nibble at an unexpected rate is still unknown.
    pub fn tag_type(self) -> Option<TagType> {
        match self.0 {
            0x11 => Some(TagType::Eeg4),
            0x12 => Some(TagType::Eeg8),
            0x13 => Some(TagType::Reference),
            0x34 => Some(TagType::Optical4),
            0x35 => Some(TagType::Optical8),
            0x47 => Some(TagType::Imu),
            0x88 | 0x98 => Some(TagType::Battery),
            _ => None,
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02x}", self.0)
    }
}

// ── Decoded output ────────────────────────────────────────────────────────────

/// What [`decode`] found at a tag offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PacketKind {
    Bioelectric,
    Reference,
    Inertial,
    Optical,
    Power,
    /// Tag byte not in the decode table; skipped.
    Unknown,
    /// Known tag whose payload runs past the end of the buffer; skipped.
    Partial,
}

impl PacketKind {
    pub fn name(self) -> &'static str {
        match self {
            PacketKind::Bioelectric => "bioelectric",
            PacketKind::Reference => "reference",
            PacketKind::Inertial => "inertial",
            PacketKind::Optical => "optical",
            PacketKind::Power => "power",
            PacketKind::Unknown => "unknown",
            PacketKind::Partial => "partial",
        }
    }
}

impl fmt::Display for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Physical meaning of an [`Entry`]'s values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    /// 8 channels × 2 samples, channel-major, µV.
    Bioelectric,
    /// DRL and REF electrode levels, µV.
    Reference,
    /// x, y, z acceleration in G.
    InertialLinear,
    /// x, y, z angular rate in °/s.
    InertialAngular,
    /// Four normalised optical values.
    Optical,
    /// Ten raw 16-bit words.
    Power,
}

/// One decoded value group.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub kind: EntryKind,
    pub values: Vec<f64>,
}

impl Entry {
    fn new(kind: EntryKind, values: Vec<f64>) -> Self {
        Self { kind, values }
    }
}

/// Result of decoding the packet at one tag offset.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedPacket {
    /// Where the next tag is expected.  Always greater than the input offset.
    pub next_offset: usize,
    pub kind: PacketKind,
    pub entries: Vec<Entry>,
    /// Samples per channel in this packet; 0 for unknown or partial packets.
    pub sample_count: usize,
    /// Nominal sample rate from the tag's high nibble; 0 when unmapped.
    pub frequency_hz: f64,
}

impl DecodedPacket {
    fn skipped(kind: PacketKind, tag_offset: usize) -> Self {
        Self {
            next_offset: tag_offset + 1,
            kind,
            entries: Vec::new(),
            sample_count: 0,
            frequency_hz: 0.0,
        }
    }
}

// ── Decoding ──────────────────────────────────────────────────────────────────

/// Decode the packet whose tag byte `tag` sits at `tag_offset` in `data`.
///
/// Pure and total: unknown tags and payloads running past the buffer are
/// reported as [`PacketKind::Unknown`] / [`PacketKind::Partial`] with no
/// entries and `next_offset = tag_offset + 1`.
pub fn decode(data: &[u8], tag: u8, tag_offset: usize) -> DecodedPacket {
    let tag = Tag(tag);
    let Some(tag_type) = tag.tag_type() else {
        debug!(
            "Athena: unknown tag {tag} (type=0x{:x}) at offset {tag_offset}",
            tag.data_class()
        );
        return DecodedPacket::skipped(PacketKind::Unknown, tag_offset);
    };

    let payload_start = tag_offset + 1 + PACKET_SUBHEADER_LEN;
    let end = payload_start + tag_type.payload_len();
    if end > data.len() {
        debug!(
            "Athena: truncated {tag} packet at offset {tag_offset} (needs {end} B, have {})",
            data.len()
        );
        return DecodedPacket::skipped(PacketKind::Partial, tag_offset);
    }
    let payload = &data[payload_start..end];

    let entries = match tag_type {
        TagType::Eeg4 | TagType::Eeg8 => decode_eeg(payload),
        TagType::Reference => decode_reference(payload),
        TagType::Imu => decode_imu(payload),
        TagType::Optical4 | TagType::Optical8 => decode_optical(payload),
        TagType::Battery => decode_power(payload),
    };

    DecodedPacket {
        next_offset: end,
        kind: tag_type.kind(),
        entries,
        sample_count: tag_type.sample_count(),
        frequency_hz: tag.frequency_hz().unwrap_or(0.0),
    }
}

fn eeg_microvolts(raw: u32) -> f64 {
    (f64::from(raw) - EEG_OFFSET) * EEG_SCALE
}

// 14-bit offset-binary, channel-major: raw[ch * 2 + s].
fn decode_eeg(payload: &[u8]) -> Vec<Entry> {
    let values: Vec<f64> = extract_unsigned(payload, 14)
        .into_iter()
        .take(EEG_CHANNELS * EEG_SAMPLES_PER_PACKET)
        .map(eeg_microvolts)
        .collect();
    vec![Entry::new(EntryKind::Bioelectric, values)]
}

// Only the first two 14-bit fields (DRL, REF) carry data.
fn decode_reference(payload: &[u8]) -> Vec<Entry> {
    let values: Vec<f64> = extract_unsigned(payload, 14)
        .into_iter()
        .take(2)
        .map(eeg_microvolts)
        .collect();
    vec![Entry::new(EntryKind::Reference, values)]
}

// 3 samples × (accel xyz, gyro xyz), i16 LE.
fn decode_imu(payload: &[u8]) -> Vec<Entry> {
    let raw = extract_signed(payload, 16);
    raw.chunks_exact(6)
        .take(IMU_SAMPLES_PER_PACKET)
        .flat_map(|s| {
            let accel = s[..3].iter().map(|&v| f64::from(v) * ACCEL_SCALE).collect();
            let gyro = s[3..].iter().map(|&v| f64::from(v) * GYRO_SCALE).collect();
            [
                Entry::new(EntryKind::InertialLinear, accel),
                Entry::new(EntryKind::InertialAngular, gyro),
            ]
        })
        .collect()
}

// 3 groups × 4 values, u20 LE, normalised.
fn decode_optical(payload: &[u8]) -> Vec<Entry> {
    let raw = extract_unsigned(payload, 20);
    raw.chunks_exact(OPTICAL_VALUES_PER_GROUP)
        .take(OPTICAL_GROUPS_PER_PACKET)
        .map(|g| {
            let values = g.iter().map(|&v| f64::from(v) / OPTICAL_DIVISOR).collect();
            Entry::new(EntryKind::Optical, values)
        })
        .collect()
}

fn decode_power(payload: &[u8]) -> Vec<Entry> {
    let values = extract_unsigned(payload, 16)
        .into_iter()
        .take(POWER_VALUES)
        .map(f64::from)
        .collect();
    vec![Entry::new(EntryKind::Power, values)]
}

// ── Offline scanning ──────────────────────────────────────────────────────────

/// Per-kind packet counts and every entry found in one notification.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanSummary {
    pub counts: BTreeMap<PacketKind, usize>,
    pub entries: Vec<Entry>,
}

impl ScanSummary {
    pub fn count(&self, kind: PacketKind) -> usize {
        self.counts.get(&kind).copied().unwrap_or(0)
    }
}

/// Iterator over the packets of one notification, starting at the fixed
/// header offset.  Yields `(tag_offset, packet)` pairs.
pub struct Packets<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Packets<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            offset: NOTIFICATION_HEADER_LEN,
        }
    }
}

impl Iterator for Packets<'_> {
    type Item = (usize, DecodedPacket);

    fn next(&mut self) -> Option<Self::Item> {
        let tag_offset = self.offset;
        let &tag = self.data.get(tag_offset)?;
        let packet = decode(self.data, tag, tag_offset);
        self.offset = packet.next_offset;
        Some((tag_offset, packet))
    }
}

/// Walk a whole notification the way the live router does and tally what is
/// inside.  Used for offline inspection of captured notifications.
pub fn scan_buffer(data: &[u8]) -> ScanSummary {
    let mut summary = ScanSummary::default();
    for (_, packet) in Packets::new(data) {
        *summary.counts.entry(packet.kind).or_default() += 1;
        summary.entries.extend(packet.entries);
    }
    summary
}
