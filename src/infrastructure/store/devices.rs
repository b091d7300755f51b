//! [`ObservationStore`] on top of [`Database`].

use super::{format_timestamp, parse_timestamp, to_i64, to_u64, Database};
use crate::domain::errors::{Error, Result};
use crate::domain::models::{
    AddressType, AdvertisedField, DeviceAttributes, DeviceFlags, DeviceObservation,
    GattCharacteristic, GattDescriptor, GattService, GattTree, GattValue, KnownDevice, Sighting,
};
use crate::domain::store::{GattTreeIds, ObservationStore, Record, Table};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::{Value, ValueRef};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

fn text(value: Option<&str>) -> Value {
    match value {
        Some(v) => Value::Text(v.to_string()),
        None => Value::Null,
    }
}

fn integer<T: Into<i64>>(value: Option<T>) -> Value {
    match value {
        Some(v) => Value::Integer(v.into()),
        None => Value::Null,
    }
}

fn boolean(value: Option<bool>) -> Value {
    integer(value.map(i64::from))
}

fn gatt_value(value: &Option<GattValue>) -> (Value, Value) {
    match value {
        Some(v) => (text(Some(v.as_str())), text(Some(v.encoding()))),
        None => (Value::Null, Value::Null),
    }
}

/// Returns the id of the row matching every column (NULL-safe), inserting it first if absent.
fn insert_unique(conn: &Connection, table: &str, columns: &[(&str, Value)]) -> Result<i64> {
    let predicate = columns
        .iter()
        .enumerate()
        .map(|(i, (name, _))| format!("{} IS ?{}", name, i + 1))
        .collect::<Vec<_>>()
        .join(" AND ");
    let existing: Option<i64> = conn
        .query_row(
            &format!("SELECT id FROM {} WHERE {} LIMIT 1", table, predicate),
            params_from_iter(columns.iter().map(|(_, v)| v)),
            |row| row.get(0),
        )
        .optional()?;
    if let Some(id) = existing {
        return Ok(id);
    }

    let names = columns
        .iter()
        .map(|(name, _)| *name)
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = (1..=columns.len())
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ");
    conn.execute(
        &format!("INSERT INTO {} ({}) VALUES ({})", table, names, placeholders),
        params_from_iter(columns.iter().map(|(_, v)| v)),
    )?;
    Ok(conn.last_insert_rowid())
}

fn device_columns(attributes: &DeviceAttributes) -> Vec<(&'static str, Value)> {
    let flags = &attributes.flags;
    vec![
        ("name", text(attributes.name.as_deref())),
        ("name2", text(attributes.name2.as_deref())),
        ("address", text(Some(attributes.address.as_str()))),
        ("address2", text(attributes.address2.as_deref())),
        (
            "addresstype",
            text(attributes.address_type.map(|t| t.as_str())),
        ),
        ("alias", text(attributes.alias.as_deref())),
        ("appearance", integer(attributes.appearance)),
        ("paired", boolean(flags.paired)),
        ("bonded", boolean(flags.bonded)),
        ("trusted", boolean(flags.trusted)),
        ("blocked", boolean(flags.blocked)),
        ("legacypairing", boolean(flags.legacy_pairing)),
        ("connected", boolean(flags.connected)),
        ("uuids", text(attributes.uuids.as_deref())),
        ("manufacturers", text(attributes.manufacturers.as_deref())),
        (
            "manufacturer_ids",
            text(attributes.manufacturer_ids().as_deref()),
        ),
        (
            "manufacturer_binary",
            text(attributes.manufacturer_binary().as_deref()),
        ),
        ("servicedata", text(attributes.service_data.as_stored())),
        (
            "advertisingflags",
            text(attributes.advertising_flags.as_stored()),
        ),
        (
            "advertisingdata",
            text(attributes.advertising_data.as_stored()),
        ),
        ("txpower", integer(attributes.tx_power)),
        ("servicesresolved", boolean(flags.services_resolved)),
        ("class_of_device", integer(attributes.class_of_device)),
        ("modalias", text(attributes.modalias.as_deref())),
        ("icon", text(attributes.icon.as_deref())),
        ("device_type", text(attributes.device_type.as_deref())),
    ]
}

fn manufacturer_data(ids: Option<String>, binary: Option<String>) -> BTreeMap<u16, String> {
    match (ids, binary) {
        (Some(ids), Some(binary)) => ids
            .split(',')
            .zip(binary.split(','))
            .filter_map(|(id, payload)| Some((id.trim().parse().ok()?, payload.to_string())))
            .collect(),
        _ => BTreeMap::new(),
    }
}

fn row_to_device(row: &Row) -> rusqlite::Result<(i64, DeviceAttributes)> {
    let bool_at = |name: &str| -> rusqlite::Result<Option<bool>> {
        Ok(row.get::<_, Option<i64>>(name)?.map(|v| v != 0))
    };
    let address_type: Option<String> = row.get("addresstype")?;
    let appearance: Option<i64> = row.get("appearance")?;
    let tx_power: Option<i64> = row.get("txpower")?;
    let class_of_device: Option<i64> = row.get("class_of_device")?;

    let attributes = DeviceAttributes {
        address: row.get("address")?,
        address2: row.get("address2")?,
        name: row.get("name")?,
        name2: row.get("name2")?,
        address_type: address_type.as_deref().and_then(AddressType::parse),
        alias: row.get("alias")?,
        appearance: appearance.and_then(|v| u16::try_from(v).ok()),
        flags: DeviceFlags {
            paired: bool_at("paired")?,
            bonded: bool_at("bonded")?,
            trusted: bool_at("trusted")?,
            blocked: bool_at("blocked")?,
            legacy_pairing: bool_at("legacypairing")?,
            connected: bool_at("connected")?,
            services_resolved: bool_at("servicesresolved")?,
        },
        tx_power: tx_power.and_then(|v| i16::try_from(v).ok()),
        uuids: row.get("uuids")?,
        manufacturers: row.get("manufacturers")?,
        manufacturer_data: manufacturer_data(
            row.get("manufacturer_ids")?,
            row.get("manufacturer_binary")?,
        ),
        service_data: AdvertisedField::from_stored(row.get("servicedata")?),
        advertising_flags: AdvertisedField::from_stored(row.get("advertisingflags")?),
        advertising_data: AdvertisedField::from_stored(row.get("advertisingdata")?),
        class_of_device: class_of_device.and_then(|v| u32::try_from(v).ok()),
        modalias: row.get("modalias")?,
        icon: row.get("icon")?,
        device_type: row.get("device_type")?,
    };
    Ok((row.get("id")?, attributes))
}

fn handle(value: i64) -> u16 {
    u16::try_from(value).unwrap_or_default()
}

fn properties(value: Option<String>) -> BTreeSet<String> {
    value
        .unwrap_or_default()
        .split(',')
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

/// Latest stored snapshot per handle for one address.
fn load_gatt_tree(conn: &Connection, address: &str) -> Result<GattTree> {
    let mut services: BTreeMap<u16, GattService> = BTreeMap::new();
    let mut characteristics: BTreeMap<u16, GattCharacteristic> = BTreeMap::new();

    let mut stmt = conn.prepare(
        "SELECT s.uuid, s.description, s.handle,
                c.uuid, c.description, c.handle, c.properties, c.value, c.value_encoding
         FROM ble_device_char dc
         JOIN ble_service s ON s.id = dc.service_id
         LEFT JOIN ble_characteristic c ON c.id = dc.char_id
         WHERE dc.device_address = ?1
         ORDER BY dc.id",
    )?;
    let mut rows = stmt.query(params![address])?;
    while let Some(row) = rows.next()? {
        let service = GattService {
            uuid: row.get(0)?,
            description: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
            handle: handle(row.get(2)?),
        };
        let service_handle = service.handle;
        services.insert(service_handle, service);

        let char_uuid: Option<String> = row.get(3)?;
        if let Some(uuid) = char_uuid {
            let value: Option<String> = row.get(7)?;
            let encoding: Option<String> = row.get(8)?;
            let characteristic = GattCharacteristic {
                uuid,
                description: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
                handle: handle(row.get(5)?),
                service_handle,
                properties: properties(row.get(6)?),
                value: value.map(|v| GattValue::from_stored(encoding.as_deref(), v)),
            };
            characteristics.insert(characteristic.handle, characteristic);
        }
    }

    let mut descriptors: BTreeMap<u16, GattDescriptor> = BTreeMap::new();
    let mut stmt = conn.prepare(
        "SELECT c.handle, d.uuid, d.description, d.handle, d.value, d.value_encoding
         FROM ble_char_desc cd
         JOIN ble_characteristic c ON c.id = cd.char_id
         JOIN ble_descriptor d ON d.id = cd.desc_id
         WHERE cd.device_address = ?1
         ORDER BY cd.id",
    )?;
    let mut rows = stmt.query(params![address])?;
    while let Some(row) = rows.next()? {
        let value: Option<String> = row.get(4)?;
        let encoding: Option<String> = row.get(5)?;
        let descriptor = GattDescriptor {
            uuid: row.get(1)?,
            description: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
            handle: handle(row.get(3)?),
            characteristic_handle: handle(row.get(0)?),
            value: value.map(|v| GattValue::from_stored(encoding.as_deref(), v)),
        };
        descriptors.insert(descriptor.handle, descriptor);
    }

    Ok(GattTree {
        services: services.into_values().collect(),
        characteristics: characteristics.into_values().collect(),
        descriptors: descriptors.into_values().collect(),
    })
}

fn column_names(conn: &Connection, table: Table) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table.name()))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>("name"))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(names)
}

fn json_value(value: ValueRef<'_>) -> serde_json::Value {
    match value {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => serde_json::Value::from(i),
        ValueRef::Real(f) => serde_json::Value::from(f),
        ValueRef::Text(t) => serde_json::Value::from(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => serde_json::Value::from(hex::encode(b)),
    }
}

fn known_devices(conn: &Connection, rows: Vec<(i64, DeviceAttributes)>) -> Result<Vec<KnownDevice>> {
    let mut trees: HashMap<String, Option<Arc<GattTree>>> = HashMap::new();
    let mut devices = Vec::with_capacity(rows.len());
    for (id, attributes) in rows {
        let gatt = match trees.get(&attributes.address) {
            Some(tree) => tree.clone(),
            None => {
                let tree = load_gatt_tree(conn, &attributes.address)?;
                let tree = (!tree.is_empty()).then(|| Arc::new(tree));
                trees.insert(attributes.address.clone(), tree.clone());
                tree
            }
        };
        devices.push(KnownDevice {
            id,
            attributes,
            gatt,
        });
    }
    Ok(devices)
}

fn like_pattern(fragment: &str) -> String {
    let escaped = fragment
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{}%", escaped)
}

#[async_trait]
impl ObservationStore for Database {
    async fn insert_observation(&self, observation: &DeviceObservation) -> Result<i64> {
        if observation.attributes.address.is_empty() {
            return Err(Error::MissingAddress);
        }
        let columns = device_columns(&observation.attributes);
        let timestamp = format_timestamp(&observation.timestamp);
        let geolocation = observation.geolocation.clone();

        self.execute(move |conn| {
            let tx = conn.transaction()?;
            let device_id = insert_unique(&tx, Table::Devices.name(), &columns)?;
            let time_id = insert_unique(
                &tx,
                Table::Sightings.name(),
                &[
                    ("timestamp", Value::Text(timestamp)),
                    ("geolocation", text(geolocation.as_deref())),
                ],
            )?;
            insert_unique(
                &tx,
                Table::DeviceSightings.name(),
                &[
                    ("device_id", Value::Integer(device_id)),
                    ("time_id", Value::Integer(time_id)),
                ],
            )?;
            tx.commit()?;
            Ok(device_id)
        })
        .await
    }

    async fn insert_gatt_tree(&self, address: &str, tree: &GattTree) -> Result<GattTreeIds> {
        let address = address.to_string();
        let tree = tree.clone();

        self.execute(move |conn| {
            let tx = conn.transaction()?;
            let mut ids = GattTreeIds::default();

            for service in &tree.services {
                let service_id = insert_unique(
                    &tx,
                    Table::Services.name(),
                    &[
                        ("uuid", text(Some(service.uuid.as_str()))),
                        ("description", text(Some(service.description.as_str()))),
                        ("handle", Value::Integer(i64::from(service.handle))),
                    ],
                )?;
                ids.service_ids.push(service_id);

                let mut linked_any = false;
                for characteristic in tree.characteristics_of(service.handle) {
                    let (value, encoding) = gatt_value(&characteristic.value);
                    let properties = characteristic
                        .properties
                        .iter()
                        .map(String::as_str)
                        .collect::<Vec<_>>()
                        .join(", ");
                    let char_id = insert_unique(
                        &tx,
                        Table::Characteristics.name(),
                        &[
                            ("uuid", text(Some(characteristic.uuid.as_str()))),
                            ("description", text(Some(characteristic.description.as_str()))),
                            ("handle", Value::Integer(i64::from(characteristic.handle))),
                            ("properties", Value::Text(properties)),
                            ("value", value),
                            ("value_encoding", encoding),
                        ],
                    )?;
                    ids.characteristic_ids.push(char_id);
                    insert_unique(
                        &tx,
                        Table::DeviceCharacteristics.name(),
                        &[
                            ("device_address", Value::Text(address.clone())),
                            ("service_id", Value::Integer(service_id)),
                            ("char_id", Value::Integer(char_id)),
                        ],
                    )?;
                    linked_any = true;

                    for descriptor in tree.descriptors_of(characteristic.handle) {
                        let (value, encoding) = gatt_value(&descriptor.value);
                        let desc_id = insert_unique(
                            &tx,
                            Table::Descriptors.name(),
                            &[
                                ("uuid", text(Some(descriptor.uuid.as_str()))),
                                ("description", text(Some(descriptor.description.as_str()))),
                                ("handle", Value::Integer(i64::from(descriptor.handle))),
                                ("value", value),
                                ("value_encoding", encoding),
                            ],
                        )?;
                        ids.descriptor_ids.push(desc_id);
                        insert_unique(
                            &tx,
                            Table::CharacteristicDescriptors.name(),
                            &[
                                ("device_address", Value::Text(address.clone())),
                                ("char_id", Value::Integer(char_id)),
                                ("desc_id", Value::Integer(desc_id)),
                            ],
                        )?;
                    }
                }

                if !linked_any {
                    insert_unique(
                        &tx,
                        Table::DeviceCharacteristics.name(),
                        &[
                            ("device_address", Value::Text(address.clone())),
                            ("service_id", Value::Integer(service_id)),
                            ("char_id", Value::Null),
                        ],
                    )?;
                }
            }

            tx.commit()?;
            Ok(ids)
        })
        .await
    }

    async fn query_by_attribute(
        &self,
        table: Table,
        attribute: &str,
        value: &str,
    ) -> Result<Vec<i64>> {
        let attribute = attribute.to_string();
        let value = value.to_string();

        self.execute(move |conn| {
            if !column_names(conn, table)?.contains(&attribute) {
                return Err(Error::InvalidColumn {
                    table: table.name().to_string(),
                    column: attribute,
                });
            }
            let mut stmt = conn.prepare(&format!(
                "SELECT id FROM {} WHERE {} = ?1 ORDER BY id",
                table.name(),
                attribute
            ))?;
            let ids = stmt
                .query_map(params![value], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<i64>>>()?;
            Ok(ids)
        })
        .await
    }

    async fn query_paged(&self, table: Table, offset: u64, limit: u64) -> Result<Vec<Record>> {
        let offset = to_i64(offset)?;
        let limit = to_i64(limit)?;

        self.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT * FROM {} ORDER BY id LIMIT ?1 OFFSET ?2",
                table.name()
            ))?;
            let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
            let mut rows = stmt.query(params![limit, offset])?;
            let mut records = Vec::new();
            while let Some(row) = rows.next()? {
                let mut record = Record::new();
                for (index, name) in names.iter().enumerate() {
                    record.insert(name.clone(), json_value(row.get_ref(index)?));
                }
                records.push(record);
            }
            Ok(records)
        })
        .await
    }

    async fn get_columns(&self, table: Table) -> Result<Vec<String>> {
        self.execute(move |conn| column_names(conn, table)).await
    }

    async fn count(&self, table: Table) -> Result<u64> {
        self.execute(move |conn| {
            let count: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM {}", table.name()),
                [],
                |row| row.get(0),
            )?;
            Ok(to_u64(count))
        })
        .await
    }

    async fn known_device(&self, id: i64) -> Result<Option<KnownDevice>> {
        self.execute(move |conn| {
            let row = conn
                .query_row(
                    "SELECT * FROM ble_device WHERE id = ?1",
                    params![id],
                    row_to_device,
                )
                .optional()?;
            match row {
                Some(row) => Ok(known_devices(conn, vec![row])?.pop()),
                None => Ok(None),
            }
        })
        .await
    }

    async fn known_devices_paged(&self, offset: u64, limit: u64) -> Result<Vec<KnownDevice>> {
        let offset = to_i64(offset)?;
        let limit = to_i64(limit)?;

        self.execute(move |conn| {
            let mut stmt =
                conn.prepare("SELECT * FROM ble_device ORDER BY id LIMIT ?1 OFFSET ?2")?;
            let rows = stmt
                .query_map(params![limit, offset], row_to_device)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            known_devices(conn, rows)
        })
        .await
    }

    async fn gatt_tree(&self, address: &str) -> Result<GattTree> {
        let address = address.to_string();
        self.execute(move |conn| load_gatt_tree(conn, &address)).await
    }

    async fn sightings(&self, device_id: i64) -> Result<Vec<Sighting>> {
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT t.timestamp, t.geolocation
                 FROM ble_device_time dt
                 JOIN time t ON t.id = dt.time_id
                 WHERE dt.device_id = ?1
                 ORDER BY t.timestamp",
            )?;
            let raw = stmt
                .query_map(params![device_id], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            raw.into_iter()
                .map(|(timestamp, geolocation)| {
                    Ok(Sighting {
                        timestamp: parse_timestamp(&timestamp)?,
                        geolocation,
                    })
                })
                .collect()
        })
        .await
    }

    async fn sighting_times(&self) -> Result<Vec<(String, DateTime<Utc>)>> {
        self.execute(|conn| {
            let mut stmt = conn.prepare(
                "SELECT d.address, t.timestamp
                 FROM ble_device_time dt
                 JOIN ble_device d ON d.id = dt.device_id
                 JOIN time t ON t.id = dt.time_id",
            )?;
            let raw = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            raw.into_iter()
                .map(|(address, timestamp)| Ok((address, parse_timestamp(&timestamp)?)))
                .collect()
        })
        .await
    }

    async fn search_by_name(&self, fragment: &str) -> Result<Vec<i64>> {
        let pattern = like_pattern(fragment);
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id FROM ble_device
                 WHERE name LIKE ?1 ESCAPE '\\' OR name2 LIKE ?1 ESCAPE '\\'
                 ORDER BY id",
            )?;
            let ids = stmt
                .query_map(params![pattern], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<i64>>>()?;
            Ok(ids)
        })
        .await
    }

    async fn set_geolocation(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        geolocation: &str,
    ) -> Result<u64> {
        let from = format_timestamp(&from);
        let to = format_timestamp(&to);
        let geolocation = geolocation.to_string();
        self.execute(move |conn| {
            let changed = conn.execute(
                "UPDATE time SET geolocation = ?1 WHERE timestamp >= ?2 AND timestamp <= ?3",
                params![geolocation, from, to],
            )?;
            Ok(changed as u64)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn observation(address: &str, name: &str, hour: u32) -> DeviceObservation {
        let mut attributes = DeviceAttributes {
            address: address.to_string(),
            name: Some(name.to_string()),
            uuids: Some("0000180f-0000-1000-8000-00805f9b34fb".to_string()),
            service_data: AdvertisedField::Empty,
            ..Default::default()
        };
        attributes.manufacturer_data.insert(76, "1219".to_string());
        DeviceObservation {
            attributes,
            rssi: Some(-70),
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).unwrap(),
            geolocation: None,
        }
    }

    fn sample_tree() -> GattTree {
        GattTree {
            services: vec![
                GattService {
                    uuid: "0000180f-0000-1000-8000-00805f9b34fb".into(),
                    description: "Battery Service".into(),
                    handle: 10,
                },
                GattService {
                    uuid: "00001801-0000-1000-8000-00805f9b34fb".into(),
                    description: "Generic Attribute Profile".into(),
                    handle: 1,
                },
            ],
            characteristics: vec![GattCharacteristic {
                uuid: "00002a19-0000-1000-8000-00805f9b34fb".into(),
                description: "Battery Level".into(),
                handle: 11,
                service_handle: 10,
                properties: BTreeSet::from(["read".to_string(), "notify".to_string()]),
                value: Some(GattValue::Hex("64".into())),
            }],
            descriptors: vec![GattDescriptor {
                uuid: "00002902-0000-1000-8000-00805f9b34fb".into(),
                description: "Client Characteristic Configuration".into(),
                handle: 12,
                characteristic_handle: 11,
                value: Some(GattValue::Hex("0000".into())),
            }],
        }
    }

    #[tokio::test]
    async fn test_identical_insert_returns_same_id() {
        let db = Database::open_in_memory().unwrap();
        let obs = observation("AA:BB:CC:DD:EE:01", "Tag", 8);

        let first = db.insert_observation(&obs).await.unwrap();
        let second = db.insert_observation(&obs).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(db.count(Table::Devices).await.unwrap(), 1);
        assert_eq!(db.count(Table::DeviceSightings).await.unwrap(), 1);

        // rssi and time do not make a new device, only a new sighting
        let mut later = obs.clone();
        later.rssi = Some(-40);
        later.timestamp = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap();
        assert_eq!(db.insert_observation(&later).await.unwrap(), first);
        assert_eq!(db.count(Table::Devices).await.unwrap(), 1);
        assert_eq!(db.sightings(first).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_device_round_trip() {
        let db = Database::open_in_memory().unwrap();
        let mut obs = observation("AA:BB:CC:DD:EE:02", "Pixel 7", 8);
        obs.attributes.address_type = Some(AddressType::Random);
        obs.attributes.flags.legacy_pairing = Some(false);
        obs.attributes.class_of_device = Some(0x5A020C);
        let id = db.insert_observation(&obs).await.unwrap();

        let device = db.known_device(id).await.unwrap().unwrap();
        assert_eq!(device.attributes, obs.attributes);
        assert!(device.gatt.is_none());
        assert!(db.known_device(id + 100).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_gatt_tree_round_trip() {
        let db = Database::open_in_memory().unwrap();
        let address = "AA:BB:CC:DD:EE:03";
        let id = db
            .insert_observation(&observation(address, "Band", 8))
            .await
            .unwrap();

        let ids = db.insert_gatt_tree(address, &sample_tree()).await.unwrap();
        assert_eq!(ids.service_ids.len(), 2);
        assert_eq!(ids.descriptor_ids.len(), 1);
        let again = db.insert_gatt_tree(address, &sample_tree()).await.unwrap();
        assert_eq!(ids, again);

        let mut expected = sample_tree();
        expected.services.sort_by_key(|s| s.handle);
        assert_eq!(db.gatt_tree(address).await.unwrap(), expected);

        let device = db.known_device(id).await.unwrap().unwrap();
        assert_eq!(device.gatt.as_deref(), Some(&expected));
    }

    #[tokio::test]
    async fn test_query_by_attribute_checks_column() {
        let db = Database::open_in_memory().unwrap();
        let id = db
            .insert_observation(&observation("AA:BB:CC:DD:EE:04", "Watch", 8))
            .await
            .unwrap();

        let ids = db
            .query_by_attribute(Table::Devices, "address", "AA:BB:CC:DD:EE:04")
            .await
            .unwrap();
        assert_eq!(ids, vec![id]);

        let err = db
            .query_by_attribute(Table::Devices, "name; DROP TABLE time", "x")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidColumn { .. }));
    }

    #[tokio::test]
    async fn test_query_paged_records() {
        let db = Database::open_in_memory().unwrap();
        for i in 0..5 {
            db.insert_observation(&observation(&format!("AA:BB:CC:DD:EE:1{}", i), "Dev", 8))
                .await
                .unwrap();
        }
        let page = db.query_paged(Table::Devices, 3, 10).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0]["address"], "AA:BB:CC:DD:EE:13");
        assert_eq!(page[0]["servicedata"], "(none)");
        assert!(db.get_columns(Table::Devices).await.unwrap().contains(&"uuids".to_string()));
    }

    #[tokio::test]
    async fn test_search_and_geolocation() {
        let db = Database::open_in_memory().unwrap();
        let id = db
            .insert_observation(&observation("AA:BB:CC:DD:EE:05", "Galaxy Buds", 8))
            .await
            .unwrap();
        db.insert_observation(&observation("AA:BB:CC:DD:EE:06", "100%_pure", 9))
            .await
            .unwrap();

        assert_eq!(db.search_by_name("buds").await.unwrap(), vec![id]);
        assert_eq!(db.search_by_name("%_").await.unwrap().len(), 1);

        let from = Utc.with_ymd_and_hms(2024, 5, 1, 7, 30, 0).unwrap();
        let to = Utc.with_ymd_and_hms(2024, 5, 1, 8, 30, 0).unwrap();
        assert_eq!(db.set_geolocation(from, to, "Lab").await.unwrap(), 1);
        let sightings = db.sightings(id).await.unwrap();
        assert_eq!(sightings[0].geolocation.as_deref(), Some("Lab"));
    }
}
