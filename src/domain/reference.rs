//! Assigned-numbers lookup tables.
//!
//! Built once at startup, then shared read-only behind an `Arc`. The
//! built-in tables cover the common vendors and the full class-of-device
//! layout; larger tables can be loaded from JSON files shaped like the
//! Bluetooth SIG assigned-numbers documents.

use crate::domain::errors::{Error, Result};
use crate::domain::settings::ReferenceSettings;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

const BUILTIN_COMPANIES: &[(u16, &str)] = &[
    (0x0000, "Ericsson Technology Licensing"),
    (0x0001, "Nokia Mobile Phones"),
    (0x0002, "Intel Corp."),
    (0x0003, "IBM Corp."),
    (0x0004, "Toshiba Corp."),
    (0x0006, "Microsoft"),
    (0x000A, "Qualcomm Technologies International, Ltd. (QTIL)"),
    (0x000D, "Texas Instruments Inc."),
    (0x000F, "Broadcom Corporation"),
    (0x004C, "Apple, Inc."),
    (0x0059, "Nordic Semiconductor ASA"),
    (0x0075, "Samsung Electronics Co. Ltd."),
    (0x0087, "Garmin International, Inc."),
    (0x009E, "Bose Corporation"),
    (0x00C4, "LG Electronics"),
    (0x012D, "Sony Corporation"),
    (0x0171, "Amazon.com Services LLC"),
];

const BUILTIN_SERVICE_CLASSES: &[(u8, &str)] = &[
    (13, "Limited Discoverable Mode"),
    (14, "LE audio"),
    (15, "Reserved for future use"),
    (16, "Positioning (Location identification)"),
    (17, "Networking (LAN, Ad hoc, ...)"),
    (18, "Rendering (Printing, Speakers, ...)"),
    (19, "Capturing (Scanner, Microphone, ...)"),
    (20, "Object Transfer (v-Inbox, v-Folder, ...)"),
    (21, "Audio (Speaker, Microphone, Headset service, ...)"),
    (22, "Telephony (Cordless telephony, Modem, Headset service, ...)"),
    (23, "Information (WEB-server, WAP-server, ...)"),
];

type MajorEntry = (u8, &'static str, &'static [(u8, &'static str)]);

const BUILTIN_DEVICE_CLASSES: &[MajorEntry] = &[
    (0x00, "Miscellaneous", &[]),
    (
        0x01,
        "Computer (desktop, notebook, PDA, organizer, ...)",
        &[
            (0x00, "Uncategorized"),
            (0x01, "Desktop workstation"),
            (0x02, "Server-class computer"),
            (0x03, "Laptop"),
            (0x04, "Handheld PC/PDA (clamshell)"),
            (0x05, "Palm-size PC/PDA"),
            (0x06, "Wearable computer (watch size)"),
            (0x07, "Tablet"),
        ],
    ),
    (
        0x02,
        "Phone (cellular, cordless, pay phone, modem, ...)",
        &[
            (0x00, "Uncategorized"),
            (0x01, "Cellular"),
            (0x02, "Cordless"),
            (0x03, "Smartphone"),
            (0x04, "Wired modem or voice gateway"),
            (0x05, "Common ISDN access"),
        ],
    ),
    (
        0x03,
        "LAN/Network Access point",
        &[
            (0x00, "Fully available"),
            (0x08, "1% to 17% utilized"),
            (0x10, "17% to 33% utilized"),
            (0x18, "33% to 50% utilized"),
            (0x20, "50% to 67% utilized"),
            (0x28, "67% to 83% utilized"),
            (0x30, "83% to 99% utilized"),
            (0x38, "No service available"),
        ],
    ),
    (
        0x04,
        "Audio/Video (headset, speaker, stereo, video display, VCR, ...)",
        &[
            (0x00, "Uncategorized"),
            (0x01, "Wearable Headset Device"),
            (0x02, "Hands-free Device"),
            (0x04, "Microphone"),
            (0x05, "Loudspeaker"),
            (0x06, "Headphones"),
            (0x07, "Portable Audio"),
            (0x08, "Car audio"),
            (0x09, "Set-top box"),
            (0x0A, "HiFi Audio Device"),
            (0x0B, "VCR"),
            (0x0C, "Video Camera"),
            (0x0D, "Camcorder"),
            (0x0E, "Video Monitor"),
            (0x0F, "Video Display and Loudspeaker"),
            (0x10, "Video Conferencing"),
            (0x12, "Gaming/Toy"),
        ],
    ),
    (
        0x05,
        "Peripheral (mouse, joystick, keyboard, ...)",
        &[
            (0x00, "Uncategorized"),
            (0x01, "Joystick"),
            (0x02, "Gamepad"),
            (0x03, "Remote control"),
            (0x04, "Sensing device"),
            (0x05, "Digitizer tablet"),
            (0x06, "Card reader"),
            (0x07, "Digital pen"),
            (0x08, "Handheld scanner"),
            (0x09, "Handheld gestural input device"),
            (0x10, "Keyboard"),
            (0x20, "Pointing device"),
            (0x30, "Combo keyboard/pointing device"),
        ],
    ),
    (
        0x06,
        "Imaging (printing, scanner, camera, display, ...)",
        &[
            (0x04, "Display"),
            (0x08, "Camera"),
            (0x10, "Scanner"),
            (0x20, "Printer"),
        ],
    ),
    (
        0x07,
        "Wearable",
        &[
            (0x01, "Wristwatch"),
            (0x02, "Pager"),
            (0x03, "Jacket"),
            (0x04, "Helmet"),
            (0x05, "Glasses"),
            (0x06, "Pin"),
        ],
    ),
    (
        0x08,
        "Toy",
        &[
            (0x01, "Robot"),
            (0x02, "Vehicle"),
            (0x03, "Doll/Action figure"),
            (0x04, "Controller"),
            (0x05, "Game"),
        ],
    ),
    (
        0x09,
        "Health",
        &[
            (0x00, "Undefined"),
            (0x01, "Blood Pressure Monitor"),
            (0x02, "Thermometer"),
            (0x03, "Weighing Scale"),
            (0x04, "Glucose Meter"),
            (0x05, "Pulse Oximeter"),
            (0x06, "Heart/Pulse Rate Monitor"),
            (0x07, "Health Data Display"),
            (0x08, "Step Counter"),
            (0x09, "Body Composition Analyzer"),
            (0x0A, "Peak Flow Monitor"),
            (0x0B, "Medication Monitor"),
            (0x0C, "Knee Prosthesis"),
            (0x0D, "Ankle Prosthesis"),
            (0x0E, "Generic Health Manager"),
            (0x0F, "Personal Mobility Device"),
        ],
    ),
    (0x1F, "Uncategorized (device code not specified)", &[]),
];

#[derive(Debug, Deserialize)]
struct CompanyIdentifiersFile {
    company_identifiers: Vec<CompanyEntry>,
}

#[derive(Debug, Deserialize)]
struct CompanyEntry {
    value: u16,
    name: String,
}

#[derive(Debug, Deserialize)]
struct ClassOfDeviceFile {
    #[serde(default)]
    cod_services: Vec<ServiceClassEntry>,
    cod_device_class: Vec<MajorClassEntry>,
}

#[derive(Debug, Deserialize)]
struct ServiceClassEntry {
    bit: u8,
    name: String,
}

#[derive(Debug, Deserialize)]
struct MajorClassEntry {
    major: u8,
    name: String,
    #[serde(default)]
    minor: Vec<MinorClassEntry>,
}

#[derive(Debug, Deserialize)]
struct MinorClassEntry {
    value: u8,
    name: String,
}

/// Company identifier to vendor name.
#[derive(Debug, Clone)]
pub struct ManufacturerTable {
    names: BTreeMap<u16, String>,
}

impl ManufacturerTable {
    pub fn builtin() -> Self {
        let names = BUILTIN_COMPANIES
            .iter()
            .map(|(id, name)| (*id, (*name).to_string()))
            .collect();
        Self { names }
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let file: CompanyIdentifiersFile = read_json(path)?;
        let names = file
            .company_identifiers
            .into_iter()
            .map(|entry| (entry.value, entry.name))
            .collect();
        Ok(Self { names })
    }

    pub fn name(&self, company_id: u16) -> Option<&str> {
        self.names.get(&company_id).map(String::as_str)
    }

    /// Joins the names of the ids that resolve. `None` if none do.
    pub fn resolve<I>(&self, company_ids: I) -> Option<String>
    where
        I: IntoIterator<Item = u16>,
    {
        let names: Vec<&str> = company_ids
            .into_iter()
            .filter_map(|id| self.name(id))
            .collect();
        if names.is_empty() {
            None
        } else {
            Some(names.join(", "))
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[derive(Debug, Clone)]
struct MajorClass {
    name: String,
    minors: BTreeMap<u8, String>,
}

/// Decoded class-of-device fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassOfDevice(pub u32);

impl ClassOfDevice {
    pub fn minor(self) -> u8 {
        ((self.0 >> 2) & 0x3F) as u8
    }

    pub fn major(self) -> u8 {
        ((self.0 >> 8) & 0x1F) as u8
    }

    /// Set service-class bit positions, 13 through 23.
    pub fn service_bits(self) -> Vec<u8> {
        (13u8..=23).filter(|bit| self.0 & (1 << bit) != 0).collect()
    }
}

#[derive(Debug, Clone)]
pub struct ClassOfDeviceTable {
    majors: BTreeMap<u8, MajorClass>,
    services: BTreeMap<u8, String>,
}

impl ClassOfDeviceTable {
    pub fn builtin() -> Self {
        let majors = BUILTIN_DEVICE_CLASSES
            .iter()
            .map(|(major, name, minors)| {
                let minors = minors
                    .iter()
                    .map(|(value, name)| (*value, (*name).to_string()))
                    .collect();
                (
                    *major,
                    MajorClass {
                        name: (*name).to_string(),
                        minors,
                    },
                )
            })
            .collect();
        let services = BUILTIN_SERVICE_CLASSES
            .iter()
            .map(|(bit, name)| (*bit, (*name).to_string()))
            .collect();
        Self { majors, services }
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let file: ClassOfDeviceFile = read_json(path)?;
        let majors = file
            .cod_device_class
            .into_iter()
            .map(|entry| {
                let minors = entry.minor.into_iter().map(|m| (m.value, m.name)).collect();
                (
                    entry.major,
                    MajorClass {
                        name: entry.name,
                        minors,
                    },
                )
            })
            .collect();
        let services = file
            .cod_services
            .into_iter()
            .map(|entry| (entry.bit, entry.name))
            .collect();
        Ok(Self { majors, services })
    }

    /// "<major> <minor>" label, the major name cut before its parenthesised
    /// examples. `None` when either class is not in the table.
    pub fn describe(&self, class_of_device: u32) -> Option<String> {
        let cod = ClassOfDevice(class_of_device);
        let major = self.majors.get(&cod.major())?;
        let minor = major.minors.get(&cod.minor())?;
        let major_name = major
            .name
            .split_once(" (")
            .map_or(major.name.as_str(), |(head, _)| head);
        Some(format!("{} {}", major_name, minor))
    }

    pub fn service_classes(&self, class_of_device: u32) -> Vec<&str> {
        ClassOfDevice(class_of_device)
            .service_bits()
            .into_iter()
            .filter_map(|bit| self.services.get(&bit).map(String::as_str))
            .collect()
    }
}

/// All lookup tables, loaded once and shared.
#[derive(Debug, Clone)]
pub struct ReferenceData {
    pub manufacturers: ManufacturerTable,
    pub class_of_device: ClassOfDeviceTable,
}

impl ReferenceData {
    pub fn builtin() -> Self {
        Self {
            manufacturers: ManufacturerTable::builtin(),
            class_of_device: ClassOfDeviceTable::builtin(),
        }
    }

    /// Built-in tables, each replaced by its file when one is configured.
    pub fn load(settings: &ReferenceSettings) -> Result<Self> {
        let manufacturers = match &settings.manufacturers_file {
            Some(path) => ManufacturerTable::from_json_file(path)?,
            None => ManufacturerTable::builtin(),
        };
        let class_of_device = match &settings.class_of_device_file {
            Some(path) => ClassOfDeviceTable::from_json_file(path)?,
            None => ClassOfDeviceTable::builtin(),
        };
        tracing::debug!(
            manufacturers = manufacturers.len(),
            "Reference data loaded"
        );
        Ok(Self {
            manufacturers,
            class_of_device,
        })
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
    serde_json::from_str(&contents).map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_resolve_skips_unknown_ids() {
        let table = ManufacturerTable::builtin();
        assert_eq!(table.resolve([0x004C]).as_deref(), Some("Apple, Inc."));
        assert_eq!(table.resolve([0x00E0]), None);
        assert_eq!(
            table.resolve([0x0006, 0x00E0]).as_deref(),
            Some("Microsoft")
        );
    }

    #[test]
    fn test_class_of_device_fields() {
        // Smartphone with Telephony and Object Transfer services
        let cod = ClassOfDevice(0x5A020C);
        assert_eq!(cod.major(), 2);
        assert_eq!(cod.minor(), 3);
        assert_eq!(cod.service_bits(), vec![17, 19, 20, 22]);

        let table = ClassOfDeviceTable::builtin();
        assert_eq!(table.describe(0x5A020C).as_deref(), Some("Phone Smartphone"));
        assert_eq!(table.service_classes(0x5A020C).len(), 4);
        assert_eq!(table.describe(0x000000), None);
    }

    #[test]
    fn test_load_from_json_files() {
        let dir = tempfile::tempdir().unwrap();
        let companies = dir.path().join("companies.json");
        let mut file = fs::File::create(&companies).unwrap();
        write!(
            file,
            r#"{{"company_identifiers": [{{"value": 224, "name": "Google"}}]}}"#
        )
        .unwrap();

        let settings = ReferenceSettings {
            manufacturers_file: Some(companies),
            class_of_device_file: None,
        };
        let reference = ReferenceData::load(&settings).unwrap();
        assert_eq!(reference.manufacturers.name(0x00E0), Some("Google"));
        assert_eq!(reference.manufacturers.name(0x004C), None);
        assert!(reference.class_of_device.describe(0x000104).is_some());
    }

    #[test]
    fn test_load_reports_bad_file() {
        let settings = ReferenceSettings {
            manufacturers_file: Some("/nonexistent/companies.json".into()),
            class_of_device_file: None,
        };
        assert!(matches!(
            ReferenceData::load(&settings),
            Err(Error::Config(_))
        ));
    }
}
