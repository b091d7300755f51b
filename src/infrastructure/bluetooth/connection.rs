//! BLE Connection Module
//!
//! Walks one device's GATT database: connect, enumerate, read values.

use crate::domain::errors::{Error, Result};
use crate::domain::models::GattTree;
use crate::domain::settings::GattSettings;
use crate::infrastructure::bluetooth::adapter::{BleAdapter, GattSession};
use crate::infrastructure::bluetooth::protocol;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{debug, info, warn};

/// Configuration for connection behavior
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Upper bound for connect and reconnect
    pub connect_timeout: Duration,
    /// Upper bound for enumeration and each value read
    pub read_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::from(&GattSettings::default())
    }
}

impl From<&GattSettings> for ConnectionConfig {
    fn from(settings: &GattSettings) -> Self {
        Self {
            connect_timeout: settings.connect_timeout(),
            read_timeout: settings.read_timeout(),
        }
    }
}

/// Progress reported while a device is walked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnumerationStage {
    Connecting,
    Enumerating,
    ReadingValues,
}

#[derive(Debug, Clone, Copy)]
enum ReadTarget {
    Characteristic(u16),
    Descriptor(u16),
}

impl ReadTarget {
    fn handle(&self) -> u16 {
        match self {
            Self::Characteristic(handle) | Self::Descriptor(handle) => *handle,
        }
    }
}

/// BLE Connection handler
pub struct BleConnection {
    adapter: Arc<dyn BleAdapter>,
    config: ConnectionConfig,
}

impl BleConnection {
    /// Create a new connection handler
    pub fn new(adapter: Arc<dyn BleAdapter>, config: ConnectionConfig) -> Self {
        Self { adapter, config }
    }

    /// Connect to `address` and return its full GATT tree with values.
    ///
    /// Any error is a failed attempt. The session is always disconnected.
    pub async fn enumerate<F>(&self, address: &str, mut on_stage: F) -> Result<GattTree>
    where
        F: FnMut(EnumerationStage) + Send,
    {
        info!(address = %address, "Connecting for GATT enumeration");

        // Step 1: Connect
        on_stage(EnumerationStage::Connecting);
        let connect_timeout = self.config.connect_timeout;
        let mut session = with_timeout(
            address,
            "connect",
            connect_timeout,
            self.adapter.connect(address, connect_timeout),
        )
        .await?;

        let result = self.walk(address, session.as_mut(), &mut on_stage).await;

        if let Err(e) = session.disconnect().await {
            debug!(address = %address, "Disconnect failed: {}", e);
        }

        result
    }

    async fn walk<F>(
        &self,
        address: &str,
        session: &mut dyn GattSession,
        on_stage: &mut F,
    ) -> Result<GattTree>
    where
        F: FnMut(EnumerationStage) + Send,
    {
        // Step 2: Enumerate services, characteristics and descriptors
        on_stage(EnumerationStage::Enumerating);
        let layout =
            with_timeout(address, "enumerate", self.config.read_timeout, session.layout()).await?;
        let mut tree = protocol::build_tree(layout);
        debug!(
            address = %address,
            services = tree.services.len(),
            characteristics = tree.characteristics.len(),
            descriptors = tree.descriptors.len(),
            "GATT layout discovered"
        );

        // Step 3: Read every readable characteristic and every descriptor
        on_stage(EnumerationStage::ReadingValues);
        for index in 0..tree.characteristics.len() {
            if !tree.characteristics[index].is_readable() {
                continue;
            }
            let target = ReadTarget::Characteristic(tree.characteristics[index].handle);
            tree.characteristics[index].value = self
                .read_with_retry(address, session, target)
                .await?
                .map(|bytes| protocol::decode_value(&bytes));
        }

        for index in 0..tree.descriptors.len() {
            let target = ReadTarget::Descriptor(tree.descriptors[index].handle);
            tree.descriptors[index].value = self
                .read_with_retry(address, session, target)
                .await?
                .map(|bytes| protocol::decode_value(&bytes));
        }

        info!(address = %address, "GATT enumeration complete");
        Ok(tree)
    }

    /// One read, and after a failure one reconnect plus one more read.
    ///
    /// `Ok(None)` means the value stays absent. A failed reconnect fails the attempt.
    async fn read_with_retry(
        &self,
        address: &str,
        session: &mut dyn GattSession,
        target: ReadTarget,
    ) -> Result<Option<Vec<u8>>> {
        match self.read_once(address, session, target).await {
            Ok(bytes) => return Ok(Some(bytes)),
            Err(e) => {
                debug!(address = %address, handle = target.handle(), "Read failed, reconnecting: {}", e);
            }
        }

        with_timeout(
            address,
            "reconnect",
            self.config.connect_timeout,
            session.reconnect(),
        )
        .await?;

        match self.read_once(address, session, target).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) => {
                warn!(address = %address, handle = target.handle(), "Giving up on value: {}", e);
                Ok(None)
            }
        }
    }

    async fn read_once(
        &self,
        address: &str,
        session: &mut dyn GattSession,
        target: ReadTarget,
    ) -> Result<Vec<u8>> {
        let timeout = self.config.read_timeout;
        match target {
            ReadTarget::Characteristic(handle) => {
                with_timeout(address, "characteristic read", timeout, session.read_characteristic(handle))
                    .await
            }
            ReadTarget::Descriptor(handle) => {
                with_timeout(address, "descriptor read", timeout, session.read_descriptor(handle)).await
            }
        }
    }
}

async fn with_timeout<T, Fut>(
    address: &str,
    operation: &'static str,
    timeout: Duration,
    future: Fut,
) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match time::timeout(timeout, future).await {
        Ok(result) => result,
        Err(_) => Err(Error::ReadTimeout {
            address: address.to_string(),
            operation,
            timeout,
        }),
    }
}
