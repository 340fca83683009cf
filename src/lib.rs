//! # athena-rs
//!
//! Decoder and connection sequencer for the tag-multiplexed sensor stream of
//! [Interaxon Muse](https://choosemuse.com/) S headsets running the
//! **Athena** firmware.
//!
//! Athena sends every sensor over one BLE characteristic.  Each notification
//! holds back-to-back packets tagged by sensor type and rate, with samples
//! packed at odd bit widths:
//!
//! | Sensor | Tags | Width | Per packet | Unit |
//! |---|---|---|---|---|
//! | EEG | `0x11`, `0x12` | 14-bit | 8 ch × 2 samples | µV |
//! | DRL/REF | `0x13` | 14-bit | 2 | µV |
//! | IMU | `0x47` | i16 | 3 × (accel, gyro) | G, °/s |
//! | Optical | `0x34`, `0x35` | 20-bit | 3 × 4 | normalised |
//! | Battery | `0x88`, `0x98` | u16 | 10 | raw |
//!
//! ## Quick start
//!
//! ```no_run
//! # #[cfg(feature = "ble")]
//! # async fn demo() -> athena_rs::error::Result<()> {
//! use athena_rs::prelude::*;
//!
//! let client = AthenaClient::new(ClientConfig::default());
//! let (mut streams, handle) = client.connect().await?;
//! handle.start().await?;
//!
//! while let Some(r) = streams.readings.eeg.recv().await {
//!     println!("{} {:.0} ms {:?}", EEG_CHANNEL_NAMES[r.electrode], r.timestamp, r.samples);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Offline decoding
//!
//! The decoder is pure and needs no transport:
//!
//! ```
//! use athena_rs::codec::{scan_buffer, PacketKind};
//!
//! let mut notification = vec![0u8; 9];                 // header
//! notification.extend([0x47, 0, 0, 0, 0]);             // IMU tag + sub-header
//! notification.extend([0u8; 36]);                      // payload
//! let summary = scan_buffer(&notification);
//! assert_eq!(summary.count(PacketKind::Inertial), 1);
//! ```
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`bits`] | LSB-first odd-width integer extraction |
//! | [`codec`] | Tag table, per-packet decoding, offline scanning |
//! | [`clock`] | Per-stream timestamp synthesis |
//! | [`router`] | Notification → typed reading channels |
//! | [`sequencer`] | Serialised command queue and the start-up handshake |
//! | [`control`] | JSON reply reassembly for the control characteristic |
//! | [`transport`] | The two link operations the core depends on |
//! | [`protocol`] | UUIDs, constants, command table and framing |
//! | `ble` | `btleplug` transport (feature `ble`) |

pub mod bits;
pub mod clock;
pub mod codec;
pub mod control;
pub mod error;
pub mod protocol;
pub mod router;
pub mod sequencer;
pub mod transport;
pub mod types;

#[cfg(feature = "ble")]
pub mod ble;

// ── Prelude ───────────────────────────────────────────────────────────────────

/// Convenience re-exports for downstream crates.
pub mod prelude {
    #[cfg(feature = "ble")]
    pub use crate::ble::{AthenaClient, AthenaDevice, AthenaHandle, AthenaStreams, ClientConfig};

    pub use crate::codec::{decode, scan_buffer, DecodedPacket, Entry, EntryKind, PacketKind};
    pub use crate::error::{AthenaError, Result};
    pub use crate::router::{reading_channels, ReadingReceivers, StreamRouter};
    pub use crate::sequencer::{CommandTiming, ConnectionSequencer, SequencerState};
    pub use crate::types::{
        ControlResponse, DeviceEvent, EegReading, ImuSample, OpticalReading, PowerReading,
        RawNotification, XyzSample,
    };

    pub use crate::protocol::{Command, Preset, EEG_CHANNEL_NAMES, OPTICAL_CHANNEL_NAMES};
}
