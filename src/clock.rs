//! Per-stream timestamp synthesis.
//!
//! Athena packets carry no timestamps, and the rolling counter in the
//! notification header is shared by every sensor multiplexed on the
//! characteristic.  Each stream therefore keeps its own [`StreamClock`] and
//! advances it by exactly one packet interval per packet:
//!
//! ```text
//! interval_ms = 1000 / frequency_hz × samples_per_packet
//! ```
//!
//! The clock re-anchors to `now − interval` on its first packet, after more
//! than [`RECALIBRATION_GAP_MS`] of silence on the stream, and whenever the
//! wall clock has moved more than [`RECALIBRATION_GAP_MS`] past the last
//! synthesized timestamp.  A stream delivered slower than its nominal rate
//! therefore never lags the wall clock by much more than the gap.

use std::time::{SystemTime, UNIX_EPOCH};

use log::debug;

/// Silence, or lag behind the wall clock, after which a stream clock
/// re-anchors, in ms.
pub const RECALIBRATION_GAP_MS: f64 = 500.0;

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64() * 1000.0)
        .unwrap_or_default()
}

/// Streams that get a synthesized timebase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Bioelectric,
    Inertial,
    Optical,
}

impl StreamKind {
    pub const ALL: [StreamKind; 3] = [
        StreamKind::Bioelectric,
        StreamKind::Inertial,
        StreamKind::Optical,
    ];

    fn slot(self) -> usize {
        match self {
            StreamKind::Bioelectric => 0,
            StreamKind::Inertial => 1,
            StreamKind::Optical => 2,
        }
    }
}

/// Timebase state for one stream.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StreamClock {
    /// Device counter seen with the last packet.  Recorded, never used for timing.
    pub last_sample_index: Option<u16>,
    /// Last synthesized timestamp (ms since Unix epoch).
    pub last_timestamp: Option<f64>,
    /// Wall-clock arrival of the last packet (ms since Unix epoch).
    pub last_arrival: Option<f64>,
}

impl StreamClock {
    /// Advance by one packet interval, or re-anchor to `now − interval`.
    ///
    /// Re-anchoring happens when `now` is more than [`RECALIBRATION_GAP_MS`]
    /// past the last timestamp or past the last arrival.  It may land below
    /// the previous timestamp when a burst ran the clock ahead of the wall.
    pub fn tick(&mut self, sample_index: u16, interval_ms: f64, now: f64) -> f64 {
        let ts = match (self.last_timestamp, self.last_arrival) {
            (Some(prev), Some(arrived))
                if now - prev <= RECALIBRATION_GAP_MS && now - arrived <= RECALIBRATION_GAP_MS =>
            {
                prev + interval_ms
            }
            (Some(prev), arrived) => {
                debug!(
                    "stream clock: re-anchoring ({:.0} ms behind the wall, {:.0} ms silence)",
                    now - prev,
                    arrived.map_or(0.0, |a| now - a)
                );
                now - interval_ms
            }
            (None, _) => now - interval_ms,
        };
        self.last_sample_index = Some(sample_index);
        self.last_timestamp = Some(ts);
        self.last_arrival = Some(now);
        ts
    }

    pub fn reset(&mut self) {
        *self = StreamClock::default();
    }
}

/// One [`StreamClock`] per [`StreamKind`], scoped to a single connection.
#[derive(Debug, Clone, Default)]
pub struct TimestampSynthesizer {
    clocks: [StreamClock; 3],
}

impl TimestampSynthesizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Timestamp for the next packet of `kind`, using the current wall clock.
    pub fn next_timestamp(
        &mut self,
        kind: StreamKind,
        sample_index: u16,
        samples_per_packet: usize,
        frequency_hz: f64,
    ) -> f64 {
        self.next_timestamp_at(kind, sample_index, samples_per_packet, frequency_hz, now_ms())
    }

    /// Same as [`Self::next_timestamp`] with an explicit `now` (ms since epoch).
    pub fn next_timestamp_at(
        &mut self,
        kind: StreamKind,
        sample_index: u16,
        samples_per_packet: usize,
        frequency_hz: f64,
        now: f64,
    ) -> f64 {
        let interval = packet_interval_ms(samples_per_packet, frequency_hz);
        self.clocks[kind.slot()].tick(sample_index, interval, now)
    }

    pub fn clock(&self, kind: StreamKind) -> &StreamClock {
        &self.clocks[kind.slot()]
    }

    /// Forget every stream's timebase.  Call on disconnect.
    pub fn reset(&mut self) {
        self.clocks.iter_mut().for_each(StreamClock::reset);
    }
}

/// Duration covered by one packet, in ms.  Zero for an unknown rate.
pub fn packet_interval_ms(samples_per_packet: usize, frequency_hz: f64) -> f64 {
    if frequency_hz > 0.0 {
        1000.0 / frequency_hz * samples_per_packet as f64
    } else {
        0.0
    }
}
