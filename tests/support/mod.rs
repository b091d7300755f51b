//! Scripted adapter shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use ble_tracker::domain::errors::{Error, Result};
use ble_tracker::domain::extractor::{PropertyValue, RawAdvertisement};
use ble_tracker::domain::models::{DeviceAttributes, DeviceObservation};
use ble_tracker::infrastructure::bluetooth::adapter::{
    BleAdapter, GattLayout, GattSession, RawCharacteristic, RawDescriptor, RawService,
};
use chrono::{DateTime, TimeZone, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// What one connection attempt to an address does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    Fail,
    Succeed,
}

#[derive(Default)]
struct Script {
    advertisements: Vec<RawAdvertisement>,
    attempts: HashMap<String, VecDeque<Attempt>>,
    connects: HashMap<String, usize>,
}

/// Adapter whose discovery and connection outcomes are fixed up front.
///
/// Addresses without a script connect successfully.
#[derive(Clone, Default)]
pub struct ScriptedAdapter {
    script: Arc<Mutex<Script>>,
    connect_delay: Duration,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl ScriptedAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    pub fn advertise(self, advertisement: RawAdvertisement) -> Self {
        self.script.lock().unwrap().advertisements.push(advertisement);
        self
    }

    pub fn script(self, address: &str, attempts: &[Attempt]) -> Self {
        self.script
            .lock()
            .unwrap()
            .attempts
            .insert(address.to_string(), attempts.iter().copied().collect());
        self
    }

    pub fn connects(&self, address: &str) -> usize {
        self.script
            .lock()
            .unwrap()
            .connects
            .get(address)
            .copied()
            .unwrap_or(0)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BleAdapter for ScriptedAdapter {
    async fn discover(&self, window: Duration) -> Result<Vec<RawAdvertisement>> {
        tokio::time::sleep(window).await;
        Ok(self.script.lock().unwrap().advertisements.clone())
    }

    async fn connect(&self, address: &str, _timeout: Duration) -> Result<Box<dyn GattSession>> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.connect_delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let attempt = {
            let mut script = self.script.lock().unwrap();
            *script.connects.entry(address.to_string()).or_default() += 1;
            script
                .attempts
                .get_mut(address)
                .and_then(VecDeque::pop_front)
                .unwrap_or(Attempt::Succeed)
        };

        match attempt {
            Attempt::Fail => Err(Error::ConnectionFailed {
                address: address.to_string(),
                reason: "scripted failure".into(),
            }),
            Attempt::Succeed => Ok(Box::new(ScriptedSession)),
        }
    }
}

/// Battery service plus a Device Name characteristic with no announced service.
pub struct ScriptedSession;

#[async_trait]
impl GattSession for ScriptedSession {
    async fn layout(&mut self) -> Result<GattLayout> {
        Ok(GattLayout {
            services: vec![RawService {
                uuid: "0000180f-0000-1000-8000-00805f9b34fb".into(),
                handle: 10,
                description: None,
            }],
            characteristics: vec![
                RawCharacteristic {
                    uuid: "00002a00-0000-1000-8000-00805f9b34fb".into(),
                    handle: 3,
                    service_handle: 1,
                    description: None,
                    properties: vec!["read".into()],
                },
                RawCharacteristic {
                    uuid: "00002a19-0000-1000-8000-00805f9b34fb".into(),
                    handle: 11,
                    service_handle: 10,
                    description: None,
                    properties: vec!["read".into(), "notify".into()],
                },
            ],
            descriptors: vec![RawDescriptor {
                uuid: "00002902-0000-1000-8000-00805f9b34fb".into(),
                handle: 12,
                characteristic_handle: 11,
                description: None,
            }],
        })
    }

    async fn read_characteristic(&mut self, handle: u16) -> Result<Vec<u8>> {
        match handle {
            3 => Ok(b"Pixel 7".to_vec()),
            _ => Ok(vec![0x64]),
        }
    }

    async fn read_descriptor(&mut self, _handle: u16) -> Result<Vec<u8>> {
        Ok(vec![0x00, 0x00])
    }

    async fn reconnect(&mut self) -> Result<()> {
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        Ok(())
    }
}

pub fn advertisement(address: &str, name: &str) -> RawAdvertisement {
    let mut properties = BTreeMap::new();
    properties.insert("Address".to_string(), PropertyValue::Text(address.to_string()));
    properties.insert("Name".to_string(), PropertyValue::Text(name.to_string()));
    properties.insert(
        "UUIDs".to_string(),
        PropertyValue::TextList(vec!["0000180f-0000-1000-8000-00805f9b34fb".to_string()]),
    );
    RawAdvertisement {
        address: address.to_string(),
        name: Some(name.to_string()),
        properties,
    }
}

pub fn at_hour(hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 12, 1, 0, 0, 0).unwrap() + chrono::Duration::hours(i64::from(hour))
}

pub fn observation(address: &str, name: &str, at: DateTime<Utc>) -> DeviceObservation {
    let mut manufacturer_data = BTreeMap::new();
    manufacturer_data.insert(0x004C, "1005031c".to_string());
    DeviceObservation {
        attributes: DeviceAttributes {
            address: address.to_string(),
            name: Some(name.to_string()),
            uuids: Some("0000180f-0000-1000-8000-00805f9b34fb".to_string()),
            manufacturers: Some("Apple, Inc.".to_string()),
            manufacturer_data,
            ..Default::default()
        },
        rssi: Some(-60),
        timestamp: at,
        geolocation: None,
    }
}
