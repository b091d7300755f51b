//! The attribute weight table: which device attributes are compared, how,
//! and how much each one counts.

use crate::domain::models::{AdvertisedField, KnownDevice};
use crate::domain::similarity::{AttributeValue, Similarity};
use std::collections::BTreeMap;

pub type Accessor = fn(&KnownDevice) -> Option<AttributeValue>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeRole {
    /// Identifies the reference group; skipped when scoring across addresses.
    GroupingKey,
    Feature,
}

#[derive(Clone, Copy)]
pub struct AttributeSpec {
    pub name: &'static str,
    pub weight: f64,
    pub similarity: Similarity,
    pub role: AttributeRole,
    accessor: Accessor,
}

impl AttributeSpec {
    /// Comparable value of this attribute, `None` when the device lacks it.
    pub fn value(&self, device: &KnownDevice) -> Option<AttributeValue> {
        (self.accessor)(device)
    }
}

impl std::fmt::Debug for AttributeSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttributeSpec")
            .field("name", &self.name)
            .field("weight", &self.weight)
            .field("similarity", &self.similarity)
            .field("role", &self.role)
            .finish()
    }
}

/// Attribute values of one device keyed by attribute name.
pub type AttributeMap = BTreeMap<&'static str, AttributeValue>;

fn text(value: Option<&str>) -> Option<AttributeValue> {
    value
        .filter(|v| !v.is_empty())
        .map(|v| AttributeValue::Text(v.to_string()))
}

fn advertised(field: &AdvertisedField) -> Option<AttributeValue> {
    text(field.value())
}

fn spec(
    name: &'static str,
    weight: f64,
    similarity: Similarity,
    role: AttributeRole,
    accessor: Accessor,
) -> AttributeSpec {
    AttributeSpec {
        name,
        weight,
        similarity,
        role,
        accessor,
    }
}

/// Scored attributes in display order. Signal strength is never scored.
fn standard_entries() -> Vec<AttributeSpec> {
    vec![
        spec("name", 0.2, Similarity::Text, AttributeRole::Feature, |d| {
            text(d.attributes.name.as_deref())
        }),
        spec("name2", 0.2, Similarity::Text, AttributeRole::Feature, |d| {
            text(d.attributes.name2.as_deref())
        }),
        spec("address", 10.0, Similarity::Exact, AttributeRole::GroupingKey, |d| {
            text(Some(d.attributes.address.as_str()))
        }),
        spec("address2", 10.0, Similarity::Exact, AttributeRole::GroupingKey, |d| {
            text(d.attributes.address2.as_deref())
        }),
        spec("addresstype", 0.0, Similarity::Exact, AttributeRole::Feature, |d| {
            d.attributes
                .address_type
                .map(|t| AttributeValue::Text(t.as_str().to_string()))
        }),
        spec("alias", 0.7, Similarity::Text, AttributeRole::Feature, |d| {
            text(d.attributes.alias.as_deref())
        }),
        spec("appearance", 0.3, Similarity::Numeric, AttributeRole::Feature, |d| {
            d.attributes
                .appearance
                .map(|a| AttributeValue::Number(f64::from(a)))
        }),
        spec("legacypairing", 0.5, Similarity::Numeric, AttributeRole::Feature, |d| {
            d.attributes
                .flags
                .legacy_pairing
                .map(|p| AttributeValue::Number(if p { 1.0 } else { 0.0 }))
        }),
        spec("uuids", 1.0, Similarity::Uuids, AttributeRole::Feature, |d| {
            text(d.attributes.uuids.as_deref())
        }),
        spec("manufacturers", 0.7, Similarity::Text, AttributeRole::Feature, |d| {
            text(d.attributes.manufacturers.as_deref())
        }),
        spec("manufacturer_binary", 0.9, Similarity::Hex, AttributeRole::Feature, |d| {
            d.attributes.manufacturer_binary().map(AttributeValue::Text)
        }),
        spec("servicedata", 0.6, Similarity::Uuids, AttributeRole::Feature, |d| {
            advertised(&d.attributes.service_data)
        }),
        spec("advertisingflags", 0.4, Similarity::Hex, AttributeRole::Feature, |d| {
            advertised(&d.attributes.advertising_flags)
        }),
        spec("class_of_device", 0.3, Similarity::Text, AttributeRole::Feature, |d| {
            d.attributes
                .class_of_device
                .map(|c| AttributeValue::Text(c.to_string()))
        }),
        spec("modalias", 0.6, Similarity::Text, AttributeRole::Feature, |d| {
            text(d.attributes.modalias.as_deref())
        }),
        spec("icon", 0.7, Similarity::Text, AttributeRole::Feature, |d| {
            text(d.attributes.icon.as_deref())
        }),
        spec("services", 10.0, Similarity::GattServices, AttributeRole::Feature, |d| {
            d.gatt
                .as_ref()
                .filter(|tree| !tree.services.is_empty())
                .map(|tree| AttributeValue::Gatt(tree.clone()))
        }),
    ]
}

#[derive(Debug, Clone)]
pub struct AttributeWeightTable {
    entries: Vec<AttributeSpec>,
}

impl Default for AttributeWeightTable {
    fn default() -> Self {
        Self::standard()
    }
}

impl AttributeWeightTable {
    pub fn standard() -> Self {
        Self {
            entries: standard_entries(),
        }
    }

    /// Same table with one attribute re-weighted. Unknown names are ignored.
    pub fn with_weight(mut self, name: &str, weight: f64) -> Self {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.name == name) {
            entry.weight = weight.max(0.0);
        }
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = &AttributeSpec> {
        self.entries.iter()
    }

    pub fn get(&self, name: &str) -> Option<&AttributeSpec> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Non-null attribute values of `device`, grouping keys included only on request.
    pub fn attribute_map(&self, device: &KnownDevice, include_grouping_keys: bool) -> AttributeMap {
        self.entries
            .iter()
            .filter(|e| include_grouping_keys || e.role == AttributeRole::Feature)
            .filter_map(|e| e.value(device).map(|v| (e.name, v)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::DeviceAttributes;

    fn device() -> KnownDevice {
        KnownDevice {
            id: 1,
            attributes: DeviceAttributes {
                address: "AA:BB:CC:DD:EE:FF".into(),
                name: Some("Pixel 7".into()),
                name2: Some(String::new()),
                service_data: AdvertisedField::Empty,
                ..Default::default()
            },
            gatt: None,
        }
    }

    #[test]
    fn test_weights_match_table() {
        let table = AttributeWeightTable::standard();
        assert_eq!(table.iter().count(), 17);
        assert_eq!(table.get("services").map(|e| e.weight), Some(10.0));
        assert_eq!(table.get("addresstype").map(|e| e.weight), Some(0.0));
        assert_eq!(
            table.get("address").map(|e| e.role),
            Some(AttributeRole::GroupingKey)
        );
        assert!(table.get("rssi").is_none());
    }

    #[test]
    fn test_attribute_map_skips_empty_values() {
        let table = AttributeWeightTable::standard();
        let map = table.attribute_map(&device(), false);
        assert_eq!(
            map.keys().copied().collect::<Vec<_>>(),
            vec!["name"]
        );

        let with_keys = table.attribute_map(&device(), true);
        assert!(with_keys.contains_key("address"));
        assert!(!with_keys.contains_key("servicedata"));
    }

    #[test]
    fn test_with_weight() {
        let table = AttributeWeightTable::standard()
            .with_weight("name", 2.5)
            .with_weight("missing", 1.0);
        assert_eq!(table.get("name").map(|e| e.weight), Some(2.5));
    }
}
