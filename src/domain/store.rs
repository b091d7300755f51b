//! Persistence boundary used by the pipeline and the correlation engine.

use crate::domain::errors::Result;
use crate::domain::models::{DeviceObservation, GattTree, KnownDevice, Sighting};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Tables the store exposes for generic queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Devices,
    Sightings,
    DeviceSightings,
    Services,
    Characteristics,
    Descriptors,
    DeviceCharacteristics,
    CharacteristicDescriptors,
}

impl Table {
    pub const ALL: [Table; 8] = [
        Table::Devices,
        Table::Sightings,
        Table::DeviceSightings,
        Table::Services,
        Table::Characteristics,
        Table::Descriptors,
        Table::DeviceCharacteristics,
        Table::CharacteristicDescriptors,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Devices => "ble_device",
            Self::Sightings => "time",
            Self::DeviceSightings => "ble_device_time",
            Self::Services => "ble_service",
            Self::Characteristics => "ble_characteristic",
            Self::Descriptors => "ble_descriptor",
            Self::DeviceCharacteristics => "ble_device_char",
            Self::CharacteristicDescriptors => "ble_char_desc",
        }
    }
}

/// A row as column name to JSON value. Blobs are rendered as hex.
pub type Record = serde_json::Map<String, serde_json::Value>;

/// Row ids written by one [`ObservationStore::insert_gatt_tree`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GattTreeIds {
    pub service_ids: Vec<i64>,
    pub characteristic_ids: Vec<i64>,
    pub descriptor_ids: Vec<i64>,
}

/// Append-only, content-addressed storage of observations and GATT snapshots.
///
/// Inserting a record whose full attribute tuple already exists returns the
/// existing id.
#[async_trait]
pub trait ObservationStore: Send + Sync {
    /// Stores the device (deduplicated) and records the sighting.
    async fn insert_observation(&self, observation: &DeviceObservation) -> Result<i64>;

    async fn insert_gatt_tree(&self, address: &str, tree: &GattTree) -> Result<GattTreeIds>;

    /// Ids of rows whose `attribute` column equals `value`.
    async fn query_by_attribute(&self, table: Table, attribute: &str, value: &str)
        -> Result<Vec<i64>>;

    async fn query_paged(&self, table: Table, offset: u64, limit: u64) -> Result<Vec<Record>>;

    async fn get_columns(&self, table: Table) -> Result<Vec<String>>;

    async fn count(&self, table: Table) -> Result<u64>;

    /// Device with its address's GATT snapshot.
    async fn known_device(&self, id: i64) -> Result<Option<KnownDevice>>;

    /// Devices ordered by id, each with its address's GATT snapshot.
    async fn known_devices_paged(&self, offset: u64, limit: u64) -> Result<Vec<KnownDevice>>;

    async fn gatt_tree(&self, address: &str) -> Result<GattTree>;

    async fn sightings(&self, device_id: i64) -> Result<Vec<Sighting>>;

    /// Every `(address, timestamp)` pair across all sightings.
    async fn sighting_times(&self) -> Result<Vec<(String, DateTime<Utc>)>>;

    /// Devices whose name contains `fragment`.
    async fn search_by_name(&self, fragment: &str) -> Result<Vec<i64>>;

    /// Sets the geolocation of every sighting in `[from, to]`. Returns the number updated.
    async fn set_geolocation(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        geolocation: &str,
    ) -> Result<u64>;
}
