//! Error types for the Athena client.
//!
//! Only transport and programmer errors live here.  Unknown tags and
//! truncated payloads are normal stream conditions and are reported through
//! [`crate::codec::PacketKind`] instead.

use thiserror::Error;
use uuid::Uuid;

/// Result alias used across the crate.
pub type Result<T, E = AthenaError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum AthenaError {
    /// A write or subscription on the link failed.  Fatal to the connection.
    #[error("transport failure: {reason}")]
    Transport {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The link reported disconnection; no further commands are issued.
    #[error("device disconnected")]
    Disconnected,

    /// A command name outside the fixed command table was requested.
    #[error("unknown command `{0}`")]
    UnknownCommand(String),

    #[error("no Bluetooth adapter found")]
    NoAdapter,

    #[error("no Muse device matching `{prefix}` found within {secs} s")]
    DeviceNotFound { prefix: String, secs: u64 },

    /// The headset does not expose the Athena universal sensor characteristic.
    #[error("characteristic {0} not found")]
    MissingCharacteristic(Uuid),

    #[error("{operation} timed out after {secs} s")]
    Timeout { operation: &'static str, secs: u64 },

    #[cfg(feature = "ble")]
    #[error(transparent)]
    Ble(#[from] btleplug::Error),
}

impl AthenaError {
    /// Build a [`AthenaError::Transport`] without an underlying source.
    pub fn transport(reason: impl Into<String>) -> Self {
        AthenaError::Transport {
            reason: reason.into(),
            source: None,
        }
    }

    /// `true` when the connection is gone and a fresh connect is required.
    pub fn is_fatal(&self) -> bool {
        match self {
            AthenaError::Transport { .. } | AthenaError::Disconnected => true,
            #[cfg(feature = "ble")]
            AthenaError::Ble(_) => true,
            _ => false,
        }
    }
}
