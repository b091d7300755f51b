//! Adapter capability consumed by the scanner and the GATT session manager.
//!
//! Everything here is fallible and may block for as long as the radio
//! takes; callers wrap every call in a timeout.

use crate::domain::errors::Result;
use crate::domain::extractor::RawAdvertisement;
use async_trait::async_trait;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawService {
    pub uuid: String,
    pub handle: u16,
    /// Adapter-supplied description, if any.
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawCharacteristic {
    pub uuid: String,
    pub handle: u16,
    pub service_handle: u16,
    pub description: Option<String>,
    /// Lowercase capability names: "read", "write", "notify", ...
    pub properties: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDescriptor {
    pub uuid: String,
    pub handle: u16,
    pub characteristic_handle: u16,
    pub description: Option<String>,
}

/// Flat attribute layout of a connected device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GattLayout {
    pub services: Vec<RawService>,
    pub characteristics: Vec<RawCharacteristic>,
    pub descriptors: Vec<RawDescriptor>,
}

#[async_trait]
pub trait BleAdapter: Send + Sync {
    /// Listens for `window` and returns whatever was advertised.
    async fn discover(&self, window: Duration) -> Result<Vec<RawAdvertisement>>;

    /// Opens a connection to `address`.
    async fn connect(&self, address: &str, timeout: Duration) -> Result<Box<dyn GattSession>>;
}

/// A live connection. Only the GATT session manager holds these.
#[async_trait]
pub trait GattSession: Send {
    async fn layout(&mut self) -> Result<GattLayout>;

    async fn read_characteristic(&mut self, handle: u16) -> Result<Vec<u8>>;

    async fn read_descriptor(&mut self, handle: u16) -> Result<Vec<u8>>;

    /// Re-establishes the link if it dropped.
    async fn reconnect(&mut self) -> Result<()>;

    async fn disconnect(&mut self) -> Result<()>;
}
