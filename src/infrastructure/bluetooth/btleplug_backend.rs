//! Adapter backend backed by `btleplug`.
//!
//! btleplug does not expose attribute handles, so sessions number the
//! services, characteristics and descriptors in discovery order.

use crate::domain::errors::{Error, Result};
use crate::domain::extractor::{PropertyBag, PropertyValue, RawAdvertisement};
use crate::infrastructure::bluetooth::adapter::{
    BleAdapter, GattLayout, GattSession, RawCharacteristic, RawDescriptor, RawService,
};
use async_trait::async_trait;
use btleplug::api::{
    AddressType as BtAddressType, Central, CharPropFlags, Characteristic, Descriptor,
    Manager as _, Peripheral as _, PeripheralProperties, ScanFilter,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, trace, warn};

const PROPERTY_NAMES: &[(CharPropFlags, &str)] = &[
    (CharPropFlags::BROADCAST, "broadcast"),
    (CharPropFlags::READ, "read"),
    (CharPropFlags::WRITE_WITHOUT_RESPONSE, "write-without-response"),
    (CharPropFlags::WRITE, "write"),
    (CharPropFlags::NOTIFY, "notify"),
    (CharPropFlags::INDICATE, "indicate"),
    (CharPropFlags::AUTHENTICATED_SIGNED_WRITES, "authenticated-signed-writes"),
    (CharPropFlags::EXTENDED_PROPERTIES, "extended-properties"),
];

/// The first adapter the platform reports.
pub struct BtleplugAdapter {
    adapter: Adapter,
}

impl BtleplugAdapter {
    pub async fn first_available() -> Result<Self> {
        let manager = Manager::new()
            .await
            .map_err(|e| Error::AdapterUnavailable(e.to_string()))?;
        let adapter = manager
            .adapters()
            .await
            .map_err(|e| Error::AdapterUnavailable(e.to_string()))?
            .into_iter()
            .next()
            .ok_or_else(|| Error::AdapterUnavailable("no bluetooth adapter found".into()))?;

        match adapter.adapter_info().await {
            Ok(info) => info!("Using bluetooth adapter {}", info),
            Err(e) => debug!("Adapter info unavailable: {}", e),
        }
        Ok(Self { adapter })
    }

    async fn find_peripheral(&self, address: &str) -> Result<Option<Peripheral>> {
        let peripherals = self
            .adapter
            .peripherals()
            .await
            .map_err(|e| Error::AdapterUnavailable(e.to_string()))?;
        Ok(peripherals
            .into_iter()
            .find(|p| p.address().to_string().eq_ignore_ascii_case(address)))
    }
}

#[async_trait]
impl BleAdapter for BtleplugAdapter {
    async fn discover(&self, window: Duration) -> Result<Vec<RawAdvertisement>> {
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| Error::AdapterUnavailable(e.to_string()))?;
        sleep(window).await;

        let peripherals = self.adapter.peripherals().await;
        if let Err(e) = self.adapter.stop_scan().await {
            debug!("stop_scan failed: {}", e);
        }
        let peripherals = peripherals.map_err(|e| Error::AdapterUnavailable(e.to_string()))?;

        let mut advertisements = Vec::with_capacity(peripherals.len());
        for peripheral in peripherals {
            match peripheral.properties().await {
                Ok(Some(properties)) => {
                    advertisements.push(to_advertisement(&peripheral, properties))
                }
                Ok(None) => trace!(address = %peripheral.address(), "No properties yet"),
                Err(e) => debug!(address = %peripheral.address(), "Properties unavailable: {}", e),
            }
        }
        Ok(advertisements)
    }

    async fn connect(&self, address: &str, connect_timeout: Duration) -> Result<Box<dyn GattSession>> {
        let peripheral = self
            .find_peripheral(address)
            .await?
            .ok_or_else(|| Error::ConnectionFailed {
                address: address.to_string(),
                reason: "device not in range".into(),
            })?;

        let session = BtleplugSession {
            peripheral,
            address: address.to_string(),
            connect_timeout,
            characteristics: HashMap::new(),
            descriptors: HashMap::new(),
        };
        session.ensure_connected().await?;
        Ok(Box::new(session))
    }
}

fn to_advertisement(peripheral: &Peripheral, properties: PeripheralProperties) -> RawAdvertisement {
    let mut bag = PropertyBag::new();
    bag.insert(
        "Address".into(),
        PropertyValue::Text(properties.address.to_string()),
    );
    if let Some(address_type) = properties.address_type {
        let kind = match address_type {
            BtAddressType::Public => "public",
            BtAddressType::Random => "random",
        };
        bag.insert("AddressType".into(), PropertyValue::Text(kind.into()));
    }
    if let Some(name) = &properties.local_name {
        bag.insert("Name".into(), PropertyValue::Text(name.clone()));
    }
    if let Some(rssi) = properties.rssi {
        bag.insert("RSSI".into(), PropertyValue::Int(i64::from(rssi)));
    }
    if let Some(tx_power) = properties.tx_power_level {
        bag.insert("TxPower".into(), PropertyValue::Int(i64::from(tx_power)));
    }
    if let Some(class) = properties.class {
        bag.insert("Class".into(), PropertyValue::Int(i64::from(class)));
    }
    if !properties.manufacturer_data.is_empty() {
        let data: BTreeMap<u16, Vec<u8>> = properties.manufacturer_data.into_iter().collect();
        bag.insert("ManufacturerData".into(), PropertyValue::IdBytes(data));
    }
    if !properties.service_data.is_empty() {
        let data: BTreeMap<String, Vec<u8>> = properties
            .service_data
            .into_iter()
            .map(|(uuid, bytes)| (uuid.to_string(), bytes))
            .collect();
        bag.insert("ServiceData".into(), PropertyValue::KeyedBytes(data));
    }
    if !properties.services.is_empty() {
        let uuids = properties.services.iter().map(|u| u.to_string()).collect();
        bag.insert("UUIDs".into(), PropertyValue::TextList(uuids));
    }

    RawAdvertisement {
        address: peripheral.address().to_string(),
        name: properties.local_name,
        properties: bag,
    }
}

struct BtleplugSession {
    peripheral: Peripheral,
    address: String,
    connect_timeout: Duration,
    characteristics: HashMap<u16, Characteristic>,
    descriptors: HashMap<u16, Descriptor>,
}

impl BtleplugSession {
    fn failed(&self, reason: impl ToString) -> Error {
        Error::ConnectionFailed {
            address: self.address.clone(),
            reason: reason.to_string(),
        }
    }

    async fn ensure_connected(&self) -> Result<()> {
        if self.peripheral.is_connected().await.unwrap_or(false) {
            return Ok(());
        }
        match timeout(self.connect_timeout, self.peripheral.connect()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(self.failed(e)),
            Err(_) => Err(Error::ReadTimeout {
                address: self.address.clone(),
                operation: "connect",
                timeout: self.connect_timeout,
            }),
        }
    }

    fn read_failed(&self, handle: u16, reason: impl ToString) -> Error {
        Error::ReadFailed {
            address: self.address.clone(),
            handle,
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl GattSession for BtleplugSession {
    async fn layout(&mut self) -> Result<GattLayout> {
        self.peripheral
            .discover_services()
            .await
            .map_err(|e| self.failed(e))?;

        self.characteristics.clear();
        self.descriptors.clear();
        let mut layout = GattLayout::default();
        let mut next_handle: u16 = 0;
        let mut allocate = || {
            next_handle = next_handle.wrapping_add(1);
            next_handle
        };

        for service in self.peripheral.services() {
            let service_handle = allocate();
            layout.services.push(RawService {
                uuid: service.uuid.to_string(),
                handle: service_handle,
                description: None,
            });

            for characteristic in &service.characteristics {
                let char_handle = allocate();
                layout.characteristics.push(RawCharacteristic {
                    uuid: characteristic.uuid.to_string(),
                    handle: char_handle,
                    service_handle,
                    description: None,
                    properties: PROPERTY_NAMES
                        .iter()
                        .filter(|(flag, _)| characteristic.properties.contains(*flag))
                        .map(|(_, name)| name.to_string())
                        .collect(),
                });

                for descriptor in &characteristic.descriptors {
                    let desc_handle = allocate();
                    layout.descriptors.push(RawDescriptor {
                        uuid: descriptor.uuid.to_string(),
                        handle: desc_handle,
                        characteristic_handle: char_handle,
                        description: None,
                    });
                    self.descriptors.insert(desc_handle, descriptor.clone());
                }
                self.characteristics.insert(char_handle, characteristic.clone());
            }
        }

        Ok(layout)
    }

    async fn read_characteristic(&mut self, handle: u16) -> Result<Vec<u8>> {
        let characteristic = self
            .characteristics
            .get(&handle)
            .ok_or_else(|| self.read_failed(handle, "unknown characteristic handle"))?;
        self.peripheral
            .read(characteristic)
            .await
            .map_err(|e| self.read_failed(handle, e))
    }

    async fn read_descriptor(&mut self, handle: u16) -> Result<Vec<u8>> {
        let descriptor = self
            .descriptors
            .get(&handle)
            .ok_or_else(|| self.read_failed(handle, "unknown descriptor handle"))?;
        self.peripheral
            .read_descriptor(descriptor)
            .await
            .map_err(|e| self.read_failed(handle, e))
    }

    async fn reconnect(&mut self) -> Result<()> {
        self.ensure_connected().await
    }

    async fn disconnect(&mut self) -> Result<()> {
        if !self.peripheral.is_connected().await.unwrap_or(false) {
            return Ok(());
        }
        if let Err(e) = self.peripheral.disconnect().await {
            warn!(address = %self.address, "Disconnect failed: {}", e);
            return Err(self.failed(e));
        }
        Ok(())
    }
}
