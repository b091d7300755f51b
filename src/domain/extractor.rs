//! Attribute extraction: raw adapter property bag into a [`DeviceObservation`].
//!
//! Extraction is pure. Diagnostics come back as [`ExtractionWarning`]s for
//! the caller to log; only a missing address is an error.

use crate::domain::classifier;
use crate::domain::errors::{Error, ExtractionWarning, Result};
use crate::domain::models::{
    AddressType, AdvertisedField, DeviceAttributes, DeviceFlags, DeviceObservation,
};
use crate::domain::reference::ReferenceData;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Property keys the extractor maps to fields. Anything else is reported.
pub const RECOGNIZED_PROPERTIES: &[&str] = &[
    "Class",
    "Modalias",
    "Icon",
    "Name",
    "Address",
    "AddressType",
    "Alias",
    "Appearance",
    "Paired",
    "Bonded",
    "Trusted",
    "Blocked",
    "LegacyPairing",
    "RSSI",
    "Connected",
    "UUIDs",
    "ManufacturerData",
    "ServiceData",
    "AdvertisingFlags",
    "AdvertisingData",
    "TxPower",
    "ServicesResolved",
    "Adapter",
];

/// A single adapter-reported property value.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Text(String),
    TextList(Vec<String>),
    Bytes(Vec<u8>),
    /// Numeric keys, e.g. company id or AD type.
    IdBytes(BTreeMap<u16, Vec<u8>>),
    /// String keys, e.g. service UUID.
    KeyedBytes(BTreeMap<String, Vec<u8>>),
}

pub type PropertyBag = BTreeMap<String, PropertyValue>;

/// What the adapter hands back for one advertisement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawAdvertisement {
    /// Address as reported by the adapter's device handle.
    pub address: String,
    /// Name as reported by the adapter's device handle.
    pub name: Option<String>,
    pub properties: PropertyBag,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub observation: DeviceObservation,
    pub warnings: Vec<ExtractionWarning>,
}

/// Maps property bags to observations using the shared lookup tables.
#[derive(Debug, Clone)]
pub struct AttributeExtractor {
    reference: Arc<ReferenceData>,
}

impl AttributeExtractor {
    pub fn new(reference: Arc<ReferenceData>) -> Self {
        Self { reference }
    }

    pub fn reference(&self) -> &Arc<ReferenceData> {
        &self.reference
    }

    pub fn extract(
        &self,
        advertisement: &RawAdvertisement,
        timestamp: DateTime<Utc>,
    ) -> Result<Extraction> {
        let props = &advertisement.properties;
        let primary_address = non_empty(Some(advertisement.address.trim()));

        let mut reader = PropertyReader {
            props,
            address: primary_address.clone().unwrap_or_default(),
            warnings: Vec::new(),
        };

        let name2 = reader.text("Name");
        let address2 = reader.text("Address");
        let address = primary_address
            .or_else(|| address2.clone())
            .ok_or(Error::MissingAddress)?;
        reader.address = address.clone();

        let name = non_empty(advertisement.name.as_deref()).or_else(|| name2.clone());

        let address_type = reader.text("AddressType").and_then(|raw| {
            let parsed = AddressType::parse(&raw);
            if parsed.is_none() {
                reader.malformed("AddressType", "public or random");
            }
            parsed
        });

        let flags = DeviceFlags {
            paired: reader.boolean("Paired"),
            bonded: reader.boolean("Bonded"),
            trusted: reader.boolean("Trusted"),
            blocked: reader.boolean("Blocked"),
            legacy_pairing: reader.boolean("LegacyPairing"),
            connected: reader.boolean("Connected"),
            services_resolved: reader.boolean("ServicesResolved"),
        };

        let manufacturer_data: BTreeMap<u16, String> = reader
            .id_bytes("ManufacturerData")
            .unwrap_or_default()
            .into_iter()
            .map(|(id, bytes)| (id, hex::encode(bytes)))
            .collect();
        let manufacturers = self
            .reference
            .manufacturers
            .resolve(manufacturer_data.keys().copied());

        let mut attributes = DeviceAttributes {
            address,
            address2,
            name,
            name2,
            address_type,
            alias: reader.text("Alias"),
            appearance: reader.integer("Appearance"),
            flags,
            tx_power: reader.integer("TxPower"),
            uuids: reader.uuids(),
            manufacturers,
            manufacturer_data,
            service_data: reader.keyed_field("ServiceData"),
            advertising_flags: reader.bytes_field("AdvertisingFlags"),
            advertising_data: reader.keyed_field("AdvertisingData"),
            class_of_device: reader.integer::<u32>("Class").map(|cod| cod & 0x00FF_FFFF),
            modalias: reader.text("Modalias"),
            icon: reader.text("Icon"),
            device_type: None,
        };
        let rssi = reader.integer("RSSI");

        let mut warnings = reader.warnings;

        let unrecognized: Vec<String> = props
            .keys()
            .filter(|key| !RECOGNIZED_PROPERTIES.contains(&key.as_str()))
            .cloned()
            .collect();
        if !unrecognized.is_empty() {
            warnings.push(ExtractionWarning::UnrecognizedProperties {
                address: attributes.address.clone(),
                keys: unrecognized,
            });
        }

        if let (Some(primary), Some(redundant)) = (&attributes.name, &attributes.name2) {
            if primary != redundant {
                warnings.push(ExtractionWarning::IdentityMismatch {
                    field: "Name",
                    primary: primary.clone(),
                    redundant: redundant.clone(),
                });
            }
        }
        if let Some(redundant) = &attributes.address2 {
            if &attributes.address != redundant {
                warnings.push(ExtractionWarning::IdentityMismatch {
                    field: "Address",
                    primary: attributes.address.clone(),
                    redundant: redundant.clone(),
                });
            }
        }

        attributes.device_type = classifier::classify(&attributes, &self.reference.class_of_device);

        Ok(Extraction {
            observation: DeviceObservation {
                attributes,
                rssi,
                timestamp,
                geolocation: None,
            },
            warnings,
        })
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value.filter(|v| !v.is_empty()).map(str::to_string)
}

/// Typed access to the bag, recording a warning for every shape mismatch.
struct PropertyReader<'a> {
    props: &'a PropertyBag,
    address: String,
    warnings: Vec<ExtractionWarning>,
}

impl PropertyReader<'_> {
    fn malformed(&mut self, key: &str, expected: &'static str) {
        self.warnings.push(ExtractionWarning::MalformedProperty {
            address: self.address.clone(),
            key: key.to_string(),
            expected,
        });
    }

    fn text(&mut self, key: &str) -> Option<String> {
        match self.props.get(key)? {
            PropertyValue::Text(value) => Some(value.clone()),
            _ => {
                self.malformed(key, "text");
                None
            }
        }
    }

    fn boolean(&mut self, key: &str) -> Option<bool> {
        match self.props.get(key)? {
            PropertyValue::Bool(value) => Some(*value),
            _ => {
                self.malformed(key, "bool");
                None
            }
        }
    }

    fn integer<T: TryFrom<i64>>(&mut self, key: &str) -> Option<T> {
        match self.props.get(key)? {
            PropertyValue::Int(value) => match T::try_from(*value) {
                Ok(value) => Some(value),
                Err(_) => {
                    self.malformed(key, "integer in range");
                    None
                }
            },
            _ => {
                self.malformed(key, "integer");
                None
            }
        }
    }

    fn id_bytes(&mut self, key: &str) -> Option<BTreeMap<u16, Vec<u8>>> {
        match self.props.get(key)? {
            PropertyValue::IdBytes(map) => Some(map.clone()),
            _ => {
                self.malformed(key, "byte map");
                None
            }
        }
    }

    /// Deduplicated in first-seen order, comma-joined.
    fn uuids(&mut self) -> Option<String> {
        let list = match self.props.get("UUIDs")? {
            PropertyValue::TextList(list) => list,
            _ => {
                self.malformed("UUIDs", "text list");
                return None;
            }
        };
        let mut ordered: Vec<String> = Vec::with_capacity(list.len());
        for uuid in list {
            let uuid = uuid.trim().to_ascii_lowercase();
            if !uuid.is_empty() && !ordered.contains(&uuid) {
                ordered.push(uuid);
            }
        }
        if ordered.is_empty() {
            None
        } else {
            Some(ordered.join(","))
        }
    }

    fn bytes_field(&mut self, key: &str) -> AdvertisedField {
        match self.props.get(key) {
            None => AdvertisedField::Omitted,
            Some(PropertyValue::Bytes(bytes)) if bytes.is_empty() => AdvertisedField::Empty,
            Some(PropertyValue::Bytes(bytes)) => AdvertisedField::Value(hex::encode(bytes)),
            Some(_) => {
                self.malformed(key, "bytes");
                AdvertisedField::Omitted
            }
        }
    }

    /// `key=hex` pairs joined by commas, keys in ascending order.
    fn keyed_field(&mut self, key: &str) -> AdvertisedField {
        let pairs: Vec<(String, &Vec<u8>)> = match self.props.get(key) {
            None => return AdvertisedField::Omitted,
            Some(PropertyValue::KeyedBytes(map)) => {
                map.iter().map(|(k, v)| (k.to_ascii_lowercase(), v)).collect()
            }
            Some(PropertyValue::IdBytes(map)) => {
                map.iter().map(|(k, v)| (format!("{:#04x}", k), v)).collect()
            }
            Some(_) => {
                self.malformed(key, "byte map");
                return AdvertisedField::Omitted;
            }
        };
        if pairs.is_empty() {
            return AdvertisedField::Empty;
        }
        let joined = pairs
            .into_iter()
            .map(|(k, v)| format!("{}={}", k, hex::encode(v)))
            .collect::<Vec<_>>()
            .join(",");
        AdvertisedField::Value(joined)
    }
}
