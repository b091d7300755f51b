//! BLE Scanner Module
//!
//! Continuous discovery loop. Every advertisement becomes one
//! [`PipelineEvent::DeviceObserved`].

use crate::domain::errors::ExtractionWarning;
use crate::domain::extractor::AttributeExtractor;
use crate::domain::models::PipelineEvent;
use crate::domain::settings::ScanSettings;
use crate::infrastructure::bluetooth::adapter::BleAdapter;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Counters reported when the loop ends
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    pub cycles: u64,
    pub observations: u64,
    pub adapter_errors: u64,
    pub rejected: u64,
}

/// BLE Scanner feeding observations to the pipeline
pub struct BleScanner {
    adapter: Arc<dyn BleAdapter>,
    extractor: AttributeExtractor,
    event_sender: mpsc::UnboundedSender<PipelineEvent>,
    scan_window: Duration,
    backoff: Duration,
}

impl BleScanner {
    /// Create a new scanner
    pub fn new(
        adapter: Arc<dyn BleAdapter>,
        extractor: AttributeExtractor,
        event_sender: mpsc::UnboundedSender<PipelineEvent>,
        settings: &ScanSettings,
    ) -> Self {
        Self {
            adapter,
            extractor,
            event_sender,
            scan_window: settings.scan_window(),
            backoff: settings.backoff(),
        }
    }

    /// Scan until `cancel` fires or the event receiver goes away.
    ///
    /// Adapter errors never end the loop. Cancellation takes effect once the
    /// running discovery window ends. Consumes the scanner so the adapter
    /// handle is released on return.
    pub async fn run(self, cancel: CancellationToken) -> ScanStats {
        info!(window = ?self.scan_window, "Starting BLE scan loop");
        let mut stats = ScanStats::default();

        while !cancel.is_cancelled() {
            // A window is never cut short: the adapter stops scanning at its end.
            let discovered = self.adapter.discover(self.scan_window).await;
            stats.cycles += 1;

            let advertisements = match discovered {
                Ok(advertisements) => advertisements,
                Err(e) => {
                    stats.adapter_errors += 1;
                    warn!("Discovery failed, retrying in {:?}: {}", self.backoff, e);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.backoff) => continue,
                    }
                }
            };

            trace!(count = advertisements.len(), "Discovery cycle finished");
            let now = Utc::now();
            for advertisement in &advertisements {
                let extraction = match self.extractor.extract(advertisement, now) {
                    Ok(extraction) => extraction,
                    Err(e) => {
                        stats.rejected += 1;
                        debug!("Advertisement dropped: {}", e);
                        continue;
                    }
                };

                for warning in &extraction.warnings {
                    log_warning(warning);
                }

                stats.observations += 1;
                if self
                    .event_sender
                    .send(PipelineEvent::DeviceObserved(extraction.observation))
                    .is_err()
                {
                    info!("Observation receiver dropped, stopping scan loop");
                    return stats;
                }
            }
        }

        info!(
            cycles = stats.cycles,
            observations = stats.observations,
            "BLE scan loop stopped"
        );
        stats
    }
}

fn log_warning(warning: &ExtractionWarning) {
    match warning {
        ExtractionWarning::UnrecognizedProperties { address, .. } => {
            warn!(address = %address, "{}", warning)
        }
        ExtractionWarning::MalformedProperty { address, .. } => {
            warn!(address = %address, "{}", warning)
        }
        ExtractionWarning::IdentityMismatch { .. } => warn!("{}", warning),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::errors::{Error, Result};
    use crate::domain::extractor::{PropertyValue, RawAdvertisement};
    use crate::domain::reference::ReferenceData;
    use crate::infrastructure::bluetooth::adapter::GattSession;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Notify;

    /// Fails on every other cycle.
    struct AlternatingAdapter {
        calls: AtomicU32,
    }

    #[async_trait]
    impl BleAdapter for AlternatingAdapter {
        async fn discover(&self, _window: Duration) -> Result<Vec<RawAdvertisement>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call % 2 == 1 {
                return Err(Error::AdapterUnavailable("radio off".into()));
            }
            let mut advertisement = RawAdvertisement {
                address: "AA:BB:CC:11:22:33".into(),
                ..Default::default()
            };
            advertisement
                .properties
                .insert("Name".into(), PropertyValue::Text("Pixel 7".into()));
            Ok(vec![advertisement])
        }

        async fn connect(&self, address: &str, _timeout: Duration) -> Result<Box<dyn GattSession>> {
            Err(Error::ConnectionFailed {
                address: address.to_string(),
                reason: "not supported".into(),
            })
        }
    }

    #[tokio::test]
    async fn test_scan_survives_adapter_errors() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let adapter = Arc::new(AlternatingAdapter {
            calls: AtomicU32::new(0),
        });
        let settings = ScanSettings {
            scan_window_ms: 1,
            backoff_ms: 1,
        };
        let extractor = AttributeExtractor::new(Arc::new(ReferenceData::builtin()));
        let scanner = BleScanner::new(adapter, extractor, tx, &settings);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(scanner.run(cancel.clone()));

        for _ in 0..2 {
            match rx.recv().await {
                Some(PipelineEvent::DeviceObserved(observation)) => {
                    assert_eq!(observation.address(), "AA:BB:CC:11:22:33");
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
        cancel.cancel();

        let stats = handle.await.unwrap();
        assert!(stats.adapter_errors >= 1);
        assert!(stats.observations >= 2);
    }

    /// Records how many scan windows were opened and closed.
    struct WindowAdapter {
        started: AtomicU32,
        stopped: AtomicU32,
        window_open: Notify,
    }

    #[async_trait]
    impl BleAdapter for WindowAdapter {
        async fn discover(&self, window: Duration) -> Result<Vec<RawAdvertisement>> {
            self.started.fetch_add(1, Ordering::SeqCst);
            self.window_open.notify_one();
            tokio::time::sleep(window).await;
            self.stopped.fetch_add(1, Ordering::SeqCst);
            Ok(Vec::new())
        }

        async fn connect(&self, address: &str, _timeout: Duration) -> Result<Box<dyn GattSession>> {
            Err(Error::ConnectionFailed {
                address: address.to_string(),
                reason: "not supported".into(),
            })
        }
    }

    #[tokio::test]
    async fn test_cancel_mid_window_still_stops_scanning() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let adapter = Arc::new(WindowAdapter {
            started: AtomicU32::new(0),
            stopped: AtomicU32::new(0),
            window_open: Notify::new(),
        });
        let settings = ScanSettings {
            scan_window_ms: 100,
            backoff_ms: 1,
        };
        let extractor = AttributeExtractor::new(Arc::new(ReferenceData::builtin()));
        let scanner = BleScanner::new(adapter.clone(), extractor, tx, &settings);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(scanner.run(cancel.clone()));
        adapter.window_open.notified().await;
        cancel.cancel();

        let stats = handle.await.unwrap();
        assert_eq!(stats.cycles, 1);
        assert_eq!(adapter.started.load(Ordering::SeqCst), 1);
        assert_eq!(adapter.stopped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_scan_stops_when_receiver_dropped() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let adapter = Arc::new(AlternatingAdapter {
            calls: AtomicU32::new(0),
        });
        let extractor = AttributeExtractor::new(Arc::new(ReferenceData::builtin()));
        let scanner = BleScanner::new(adapter, extractor, tx, &ScanSettings::default());

        let stats = scanner.run(CancellationToken::new()).await;
        assert_eq!(stats.observations, 1);
    }
}
