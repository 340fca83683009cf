//! The two link operations the core needs from a transport.
//!
//! The decoder and sequencer never talk to Bluetooth directly; they see a
//! [`ControlChannel`] to write commands to and a [`DataChannel`] that yields
//! sensor notifications.  [`crate::ble`] implements both over `btleplug`;
//! tests implement them with in-memory fakes.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::error::Result;
use crate::types::RawNotification;

/// Boxed stream of sensor notifications.
pub type NotificationStream = Pin<Box<dyn Stream<Item = RawNotification> + Send>>;

/// Write side of the control characteristic.
///
/// Implementations need not tolerate overlapping writes; callers go through
/// [`crate::sequencer::CommandQueue`], which serialises them.
#[async_trait]
pub trait ControlChannel: Send + Sync {
    /// Write one framed command.
    async fn write(&self, bytes: &[u8]) -> Result<()>;
}

/// Read side of the sensor characteristic.
#[async_trait]
pub trait DataChannel: Send + Sync {
    /// Start delivering sensor notifications in arrival order.
    async fn notifications(&self) -> Result<NotificationStream>;
}

#[async_trait]
impl<T: ControlChannel + ?Sized> ControlChannel for std::sync::Arc<T> {
    async fn write(&self, bytes: &[u8]) -> Result<()> {
        (**self).write(bytes).await
    }
}
