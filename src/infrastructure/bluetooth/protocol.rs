//! GATT protocol helpers
//!
//! UUID normalisation, assigned-number descriptions, value decoding and
//! the conversion of an adapter layout into a [`GattTree`].

use crate::domain::models::{GattCharacteristic, GattDescriptor, GattService, GattTree, GattValue};
use crate::infrastructure::bluetooth::adapter::GattLayout;
use std::collections::BTreeSet;
use uuid::Uuid;

/// Suffix of every 16/32-bit UUID expanded onto the Bluetooth base UUID.
pub const BASE_UUID_SUFFIX: &str = "-0000-1000-8000-00805f9b34fb";

/// Generic Access service UUID
pub const GENERIC_ACCESS_UUID: &str = "00001800-0000-1000-8000-00805f9b34fb";

/// Device Name characteristic UUID
pub const DEVICE_NAME_UUID: &str = "00002a00-0000-1000-8000-00805f9b34fb";

/// Appearance characteristic UUID
pub const APPEARANCE_UUID: &str = "00002a01-0000-1000-8000-00805f9b34fb";

pub const READ_PROPERTY: &str = "read";

const UNKNOWN: &str = "Unknown";

/// Short SIG-assigned numbers and their names.
const ASSIGNED_NUMBERS: &[(u16, &str)] = &[
    // Services
    (0x1800, "Generic Access Profile"),
    (0x1801, "Generic Attribute Profile"),
    (0x1805, "Current Time Service"),
    (0x1809, "Health Thermometer"),
    (0x180A, "Device Information"),
    (0x180D, "Heart Rate"),
    (0x180F, "Battery Service"),
    (0x1812, "Human Interface Device"),
    (0x1816, "Cycling Speed and Cadence"),
    (0x181C, "User Data"),
    // Characteristics
    (0x2A00, "Device Name"),
    (0x2A01, "Appearance"),
    (0x2A04, "Peripheral Preferred Connection Parameters"),
    (0x2A05, "Service Changed"),
    (0x2A19, "Battery Level"),
    (0x2A23, "System ID"),
    (0x2A24, "Model Number String"),
    (0x2A25, "Serial Number String"),
    (0x2A26, "Firmware Revision String"),
    (0x2A27, "Hardware Revision String"),
    (0x2A28, "Software Revision String"),
    (0x2A29, "Manufacturer Name String"),
    (0x2A2B, "Current Time"),
    (0x2A37, "Heart Rate Measurement"),
    (0x2A38, "Body Sensor Location"),
    (0x2A4A, "HID Information"),
    (0x2A4B, "Report Map"),
    (0x2A4D, "Report"),
    (0x2A50, "PnP ID"),
    (0x2AA6, "Central Address Resolution"),
    (0x2B29, "Client Supported Features"),
    (0x2B2A, "Database Hash"),
    // Descriptors
    (0x2900, "Characteristic Extended Properties"),
    (0x2901, "Characteristic User Description"),
    (0x2902, "Client Characteristic Configuration"),
    (0x2903, "Server Characteristic Configuration"),
    (0x2904, "Characteristic Presentation Format"),
    (0x2908, "Report Reference"),
];

/// Lowercase hyphenated 128-bit form. Short forms are expanded onto the base UUID.
pub fn normalize_uuid(raw: &str) -> String {
    let trimmed = raw.trim().to_ascii_lowercase();
    let digits = trimmed.strip_prefix("0x").unwrap_or(&trimmed);
    let is_hex = !digits.is_empty() && digits.chars().all(|c| c.is_ascii_hexdigit());

    match digits.len() {
        4 if is_hex => format!("0000{}{}", digits, BASE_UUID_SUFFIX),
        8 if is_hex => format!("{}{}", digits, BASE_UUID_SUFFIX),
        _ => match Uuid::parse_str(digits) {
            Ok(uuid) => uuid.hyphenated().to_string(),
            Err(_) => trimmed,
        },
    }
}

/// 16-bit assigned number of a base-derived UUID.
pub fn short_uuid(uuid: &str) -> Option<u16> {
    let normalized = normalize_uuid(uuid);
    let head = normalized.strip_suffix(BASE_UUID_SUFFIX)?;
    let short = head.strip_prefix("0000")?;
    u16::from_str_radix(short, 16).ok()
}

pub fn describe(uuid: &str) -> Option<&'static str> {
    let short = short_uuid(uuid)?;
    ASSIGNED_NUMBERS
        .iter()
        .find(|(number, _)| *number == short)
        .map(|(_, name)| *name)
}

fn description(uuid: &str, supplied: Option<String>) -> String {
    supplied
        .filter(|d| !d.trim().is_empty() && d != UNKNOWN)
        .or_else(|| describe(uuid).map(str::to_string))
        .unwrap_or_else(|| UNKNOWN.to_string())
}

/// Printable UTF-8 becomes text, anything else hex.
pub fn decode_value(bytes: &[u8]) -> GattValue {
    match std::str::from_utf8(bytes) {
        Ok(text) if !text.is_empty() && text.chars().all(|c| !c.is_control()) => {
            GattValue::Text(text.to_string())
        }
        _ => GattValue::Hex(hex::encode(bytes)),
    }
}

/// Builds the tree for a layout. Values are left empty.
///
/// When the device exposes Device Name or Appearance under a service handle
/// nobody announced, and no Generic Access service exists, one is
/// synthesised at that handle.
pub fn build_tree(layout: GattLayout) -> GattTree {
    let mut services: Vec<GattService> = layout
        .services
        .into_iter()
        .map(|s| {
            let uuid = normalize_uuid(&s.uuid);
            GattService {
                description: description(&uuid, s.description),
                uuid,
                handle: s.handle,
            }
        })
        .collect();

    let characteristics: Vec<GattCharacteristic> = layout
        .characteristics
        .into_iter()
        .map(|c| {
            let uuid = normalize_uuid(&c.uuid);
            GattCharacteristic {
                description: description(&uuid, c.description),
                uuid,
                handle: c.handle,
                service_handle: c.service_handle,
                properties: c.properties.into_iter().map(|p| p.to_ascii_lowercase()).collect(),
                value: None,
            }
        })
        .collect();

    let descriptors: Vec<GattDescriptor> = layout
        .descriptors
        .into_iter()
        .map(|d| {
            let uuid = normalize_uuid(&d.uuid);
            GattDescriptor {
                description: description(&uuid, d.description),
                uuid,
                handle: d.handle,
                characteristic_handle: d.characteristic_handle,
                value: None,
            }
        })
        .collect();

    let has_generic_access = services.iter().any(|s| s.uuid == GENERIC_ACCESS_UUID);
    if !has_generic_access {
        let announced: BTreeSet<u16> = services.iter().map(|s| s.handle).collect();
        let orphan_handles: BTreeSet<u16> = characteristics
            .iter()
            .filter(|c| c.uuid == DEVICE_NAME_UUID || c.uuid == APPEARANCE_UUID)
            .map(|c| c.service_handle)
            .filter(|handle| !announced.contains(handle))
            .collect();
        for handle in orphan_handles {
            services.push(GattService {
                uuid: GENERIC_ACCESS_UUID.to_string(),
                description: "Generic Access Profile".to_string(),
                handle,
            });
        }
    }

    services.sort_by_key(|s| s.handle);

    GattTree {
        services,
        characteristics,
        descriptors,
    }
}
