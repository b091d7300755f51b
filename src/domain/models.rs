//! Observation and GATT data model shared by the pipeline, the store and
//! the correlation engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Stored in place of a byte field the adapter reported but left empty.
pub const NO_VALUE: &str = "(none)";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressType {
    Public,
    Random,
}

impl AddressType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Random => "random",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "public" => Some(Self::Public),
            "random" => Some(Self::Random),
            _ => None,
        }
    }
}

/// Byte field that may be omitted by the adapter, reported empty, or carry data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AdvertisedField {
    #[default]
    Omitted,
    Empty,
    Value(String),
}

impl AdvertisedField {
    /// Column representation: `NULL` for omitted, [`NO_VALUE`] for empty.
    pub fn as_stored(&self) -> Option<&str> {
        match self {
            Self::Omitted => None,
            Self::Empty => Some(NO_VALUE),
            Self::Value(value) => Some(value),
        }
    }

    pub fn from_stored(value: Option<String>) -> Self {
        match value {
            None => Self::Omitted,
            Some(value) if value.is_empty() || value == NO_VALUE => Self::Empty,
            Some(value) => Self::Value(value),
        }
    }

    /// The payload, if there is one worth comparing.
    pub fn value(&self) -> Option<&str> {
        match self {
            Self::Value(value) => Some(value),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceFlags {
    pub paired: Option<bool>,
    pub bonded: Option<bool>,
    pub trusted: Option<bool>,
    pub blocked: Option<bool>,
    pub legacy_pairing: Option<bool>,
    pub connected: Option<bool>,
    pub services_resolved: Option<bool>,
}

/// Everything that identifies a device record. Two observations with equal
/// attributes are the same stored device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceAttributes {
    pub address: String,
    pub address2: Option<String>,
    pub name: Option<String>,
    pub name2: Option<String>,
    pub address_type: Option<AddressType>,
    pub alias: Option<String>,
    pub appearance: Option<u16>,
    pub flags: DeviceFlags,
    pub tx_power: Option<i16>,
    /// Comma-joined, first-seen order, no duplicates.
    pub uuids: Option<String>,
    /// Resolved company names, comma-joined.
    pub manufacturers: Option<String>,
    /// Company id to hex payload.
    pub manufacturer_data: BTreeMap<u16, String>,
    pub service_data: AdvertisedField,
    pub advertising_flags: AdvertisedField,
    pub advertising_data: AdvertisedField,
    /// 24-bit Bluetooth Classic class of device.
    pub class_of_device: Option<u32>,
    pub modalias: Option<String>,
    pub icon: Option<String>,
    pub device_type: Option<String>,
}

impl DeviceAttributes {
    /// Manufacturer payloads as one comma-joined hex string, ordered by company id.
    pub fn manufacturer_binary(&self) -> Option<String> {
        if self.manufacturer_data.is_empty() {
            return None;
        }
        let joined = self
            .manufacturer_data
            .values()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(",");
        Some(joined)
    }

    /// Company ids matching [`manufacturer_binary`](Self::manufacturer_binary) order.
    pub fn manufacturer_ids(&self) -> Option<String> {
        if self.manufacturer_data.is_empty() {
            return None;
        }
        let joined = self
            .manufacturer_data
            .keys()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",");
        Some(joined)
    }
}

/// One sighting of a device's advertisement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceObservation {
    pub attributes: DeviceAttributes,
    /// Signal strength at capture time. Never part of identity.
    pub rssi: Option<i16>,
    pub timestamp: DateTime<Utc>,
    pub geolocation: Option<String>,
}

impl DeviceObservation {
    pub fn address(&self) -> &str {
        &self.attributes.address
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sighting {
    pub timestamp: DateTime<Utc>,
    pub geolocation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "encoding", content = "value", rename_all = "lowercase")]
pub enum GattValue {
    Text(String),
    Hex(String),
}

impl GattValue {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Text(value) | Self::Hex(value) => value,
        }
    }

    pub fn encoding(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Hex(_) => "hex",
        }
    }

    pub fn from_stored(encoding: Option<&str>, value: String) -> Self {
        match encoding {
            Some("hex") => Self::Hex(value),
            _ => Self::Text(value),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GattService {
    pub uuid: String,
    pub description: String,
    pub handle: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GattCharacteristic {
    pub uuid: String,
    pub description: String,
    pub handle: u16,
    pub service_handle: u16,
    pub properties: BTreeSet<String>,
    pub value: Option<GattValue>,
}

impl GattCharacteristic {
    pub fn is_readable(&self) -> bool {
        self.properties.contains("read")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GattDescriptor {
    pub uuid: String,
    pub description: String,
    pub handle: u16,
    pub characteristic_handle: u16,
    pub value: Option<GattValue>,
}

/// Flat service/characteristic/descriptor lists joined by handle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GattTree {
    pub services: Vec<GattService>,
    pub characteristics: Vec<GattCharacteristic>,
    pub descriptors: Vec<GattDescriptor>,
}

impl GattTree {
    pub fn is_empty(&self) -> bool {
        self.services.is_empty() && self.characteristics.is_empty() && self.descriptors.is_empty()
    }

    pub fn service(&self, handle: u16) -> Option<&GattService> {
        self.services.iter().find(|s| s.handle == handle)
    }

    pub fn characteristics_of(&self, service_handle: u16) -> impl Iterator<Item = &GattCharacteristic> {
        self.characteristics
            .iter()
            .filter(move |c| c.service_handle == service_handle)
    }

    pub fn descriptors_of(&self, characteristic_handle: u16) -> impl Iterator<Item = &GattDescriptor> {
        self.descriptors
            .iter()
            .filter(move |d| d.characteristic_handle == characteristic_handle)
    }
}

/// A stored device as the correlation engine sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct KnownDevice {
    pub id: i64,
    pub attributes: DeviceAttributes,
    /// GATT snapshot recorded for the device's address, if any.
    pub gatt: Option<Arc<GattTree>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GattOutcome {
    Done,
    Abandoned,
}

/// Terminal result of a GATT session. `Abandoned` carries an empty tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattResolution {
    pub address: String,
    pub outcome: GattOutcome,
    pub attempts: u32,
    pub tree: GattTree,
}

/// Events flowing from the scan and GATT subsystems into the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    DeviceObserved(DeviceObservation),
    GattResolved(GattResolution),
}
