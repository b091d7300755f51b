//! Device type heuristics.
//!
//! Apple and Microsoft devices are recognised by the first byte of their
//! manufacturer payload. Windows devices follow the Connected Devices
//! Platform beacon layout:
//! <https://learn.microsoft.com/en-us/openspecs/windows_protocols/ms-cdp/77b446d0-8cea-4821-ad21-fabdf4d9a569>
//!
//! The rule order and byte positions are load-bearing. Rule 1 lists `07`
//! twice; the AirTag match always wins, so "iPad" is unreachable.

use crate::domain::models::DeviceAttributes;
use crate::domain::reference::ClassOfDeviceTable;

pub const APPLE: &str = "Apple, Inc.";
pub const MICROSOFT: &str = "Microsoft";

/// Returns the device type label for `attributes`, or `None` if no rule matches.
pub fn classify(attributes: &DeviceAttributes, cod_table: &ClassOfDeviceTable) -> Option<String> {
    if let Some(label) = classify_by_manufacturer(attributes) {
        return Some(label.to_string());
    }

    if let Some(cod) = attributes.class_of_device.filter(|cod| *cod != 0) {
        if let Some(label) = cod_table.describe(cod) {
            return Some(label);
        }
    }

    attributes
        .icon
        .as_deref()
        .and_then(classify_by_icon)
        .map(str::to_string)
}

fn classify_by_manufacturer(attributes: &DeviceAttributes) -> Option<&'static str> {
    let binary = attributes.manufacturer_binary()?;
    if binary.len() < 4 {
        return None;
    }
    let lead = binary.get(0..2)?;

    match attributes.manufacturers.as_deref() {
        Some(APPLE) => match lead {
            "12" | "07" => Some("Apple AirTag"),
            "02" => Some("Mac"),
            "06" => Some("iPhone"),
            #[allow(unreachable_patterns)]
            "07" => Some("iPad"),
            _ => None,
        },
        Some(MICROSOFT) => match lead {
            "01" => Some("XBox"),
            "09" => Some("Windows Desktop"),
            "0a" => Some("Windows Phone"),
            "0c" => Some("Windows IoT"),
            "0d" => Some("Surface Hub"),
            "0e" => Some("Windows laptop"),
            "0f" => Some("Windows tablet"),
            _ => None,
        },
        _ => None,
    }
}

fn classify_by_icon(icon: &str) -> Option<&'static str> {
    match icon {
        "phone" => Some("Phone"),
        "computer" => Some("Computer"),
        "audio-headset" | "audio-headphones" => Some("Headphones"),
        "audio-card" => Some("Audio card"),
        "input-mouse" => Some("Mouse"),
        "printer" => Some("Printer"),
        "input-keyboard" => Some("Keyboard"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_manufacturer(name: &str, id: u16, payload: &str) -> DeviceAttributes {
        let mut attributes = DeviceAttributes {
            address: "AA:BB:CC:DD:EE:FF".to_string(),
            manufacturers: Some(name.to_string()),
            ..Default::default()
        };
        attributes.manufacturer_data.insert(id, payload.to_string());
        attributes
    }

    #[test]
    fn test_apple_payloads() {
        let table = ClassOfDeviceTable::builtin();
        let label = |payload| classify(&with_manufacturer(APPLE, 76, payload), &table);
        assert_eq!(label("1219").as_deref(), Some("Apple AirTag"));
        assert_eq!(label("0719").as_deref(), Some("Apple AirTag"));
        assert_eq!(label("0205").as_deref(), Some("Mac"));
        assert_eq!(label("0605").as_deref(), Some("iPhone"));
        assert_eq!(label("1005"), None);
    }

    #[test]
    fn test_microsoft_payloads() {
        let table = ClassOfDeviceTable::builtin();
        let label = |payload| classify(&with_manufacturer(MICROSOFT, 6, payload), &table);
        assert_eq!(label("0a20").as_deref(), Some("Windows Phone"));
        assert_eq!(label("0109").as_deref(), Some("XBox"));
        assert_eq!(label("0920").as_deref(), Some("Windows Desktop"));
        assert_eq!(label("0f20").as_deref(), Some("Windows tablet"));
    }

    #[test]
    fn test_short_payload_is_ignored() {
        let table = ClassOfDeviceTable::builtin();
        let mut attributes = with_manufacturer(APPLE, 76, "12");
        assert_eq!(classify(&attributes, &table), None);

        attributes.icon = Some("phone".to_string());
        assert_eq!(classify(&attributes, &table).as_deref(), Some("Phone"));
    }

    #[test]
    fn test_class_of_device_before_icon() {
        let table = ClassOfDeviceTable::builtin();
        let attributes = DeviceAttributes {
            class_of_device: Some(0x240404),
            icon: Some("audio-card".to_string()),
            ..Default::default()
        };
        assert_eq!(
            classify(&attributes, &table).as_deref(),
            Some("Audio/Video Wearable Headset Device")
        );
    }

    #[test]
    fn test_icons() {
        let table = ClassOfDeviceTable::builtin();
        let label = |icon: &str| {
            let attributes = DeviceAttributes {
                icon: Some(icon.to_string()),
                ..Default::default()
            };
            classify(&attributes, &table)
        };
        assert_eq!(label("input-mouse").as_deref(), Some("Mouse"));
        assert_eq!(label("audio-headphones").as_deref(), Some("Headphones"));
        assert_eq!(label("input-keyboard").as_deref(), Some("Keyboard"));
        assert_eq!(label("camera-video"), None);
    }

    #[test]
    fn test_nothing_known() {
        let table = ClassOfDeviceTable::builtin();
        assert_eq!(classify(&DeviceAttributes::default(), &table), None);
    }
}
