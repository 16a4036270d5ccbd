//! The wireless link as seen by the session worker.

#[cfg(feature = "ble")]
mod btle;

#[cfg(feature = "ble")]
pub use btle::BtleTransport;

use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Raw notification payloads from the command characteristic. The channel
/// closing means the link is gone.
pub type Notifications = mpsc::Receiver<Vec<u8>>;

pub const NOTIFICATION_BUFFER: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub address: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    WithResponse,
    WithoutResponse,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no bluetooth adapter available")]
    NoAdapter,
    #[error("device {0} was not discovered")]
    UnknownDevice(String),
    #[error("characteristic {0} not found on device")]
    MissingCharacteristic(String),
    #[error("not connected")]
    NotConnected,
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("{0}")]
    Backend(String),
}

/// Discovery, connection and characteristic I/O for a single device.
///
/// Implementations run on the session worker's thread, one call at a time.
#[allow(async_fn_in_trait)]
pub trait Transport: Send + 'static {
    async fn discover(&mut self, timeout: Duration)
        -> Result<Vec<DiscoveredDevice>, TransportError>;

    async fn connect(&mut self, address: &str) -> Result<(), TransportError>;

    async fn subscribe(&mut self) -> Result<Notifications, TransportError>;

    async fn write(&mut self, payload: &[u8], mode: WriteMode) -> Result<(), TransportError>;

    async fn disconnect(&mut self) -> Result<(), TransportError>;
}
