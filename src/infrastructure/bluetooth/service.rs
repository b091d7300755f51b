//! Tracker Service Module
//!
//! Wires the scan loop, the GATT session manager and the store together
//! and owns the shutdown order.

use crate::domain::errors::{Error, Result};
use crate::domain::extractor::AttributeExtractor;
use crate::domain::models::{DeviceObservation, GattOutcome, GattTree, PipelineEvent};
use crate::domain::reference::ReferenceData;
use crate::domain::settings::{GattSettings, ScanSettings, Settings};
use crate::domain::store::ObservationStore;
use crate::infrastructure::bluetooth::adapter::BleAdapter;
use crate::infrastructure::bluetooth::scanner::{BleScanner, ScanStats};
use crate::infrastructure::bluetooth::session::GattSessionManager;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Counters reported by [`RunningPipeline::stop`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub scan: ScanStats,
    pub observations_stored: u64,
    pub gatt_trees_stored: u64,
    pub gatt_abandoned: u64,
    /// Writes still waiting for the store at shutdown.
    pub pending_writes: usize,
    /// Writes evicted because the buffer was full.
    pub dropped_writes: u64,
}

#[derive(Debug, Clone)]
enum PendingWrite {
    Observation(DeviceObservation),
    GattTree { address: String, tree: GattTree },
}

impl PendingWrite {
    fn address(&self) -> &str {
        match self {
            Self::Observation(observation) => observation.address(),
            Self::GattTree { address, .. } => address,
        }
    }
}

/// Writes held back while the store is unavailable, oldest first.
#[derive(Debug)]
struct WriteBuffer {
    pending: VecDeque<PendingWrite>,
    capacity: usize,
    dropped: u64,
}

impl WriteBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            capacity: capacity.max(1),
            dropped: 0,
        }
    }

    fn len(&self) -> usize {
        self.pending.len()
    }

    fn push(&mut self, write: PendingWrite) {
        if self.pending.len() >= self.capacity {
            if let Some(evicted) = self.pending.pop_front() {
                self.dropped += 1;
                error!(
                    address = %evicted.address(),
                    capacity = self.capacity,
                    "Write buffer full, dropping oldest pending write"
                );
            }
        }
        self.pending.push_back(write);
    }

    /// Applies pending writes in order until the store refuses one.
    async fn flush<S: ObservationStore + ?Sized>(&mut self, store: &S, stats: &mut PipelineStats) {
        while let Some(write) = self.pending.front() {
            match apply(store, write).await {
                Ok(()) => {
                    count_stored(write, stats);
                    self.pending.pop_front();
                }
                Err(Error::StoreUnavailable(reason)) => {
                    debug!(pending = self.pending.len(), "Store still unavailable: {}", reason);
                    break;
                }
                Err(e) => {
                    error!(address = %write.address(), "Discarding write the store rejected: {}", e);
                    self.pending.pop_front();
                }
            }
        }
    }

    /// Writes now if nothing is queued ahead, otherwise keeps order.
    async fn write<S: ObservationStore + ?Sized>(
        &mut self,
        store: &S,
        write: PendingWrite,
        stats: &mut PipelineStats,
    ) {
        if !self.pending.is_empty() {
            self.push(write);
            self.flush(store, stats).await;
            return;
        }

        match apply(store, &write).await {
            Ok(()) => count_stored(&write, stats),
            Err(Error::StoreUnavailable(reason)) => {
                warn!(address = %write.address(), "Store unavailable, buffering write: {}", reason);
                self.push(write);
            }
            Err(e) => error!(address = %write.address(), "Store rejected write: {}", e),
        }
    }
}

async fn apply<S: ObservationStore + ?Sized>(store: &S, write: &PendingWrite) -> Result<()> {
    match write {
        PendingWrite::Observation(observation) => {
            let id = store.insert_observation(observation).await?;
            debug!(address = %observation.address(), id, "Observation stored");
        }
        PendingWrite::GattTree { address, tree } => {
            store.insert_gatt_tree(address, tree).await?;
            debug!(address = %address, "GATT tree stored");
        }
    }
    Ok(())
}

fn count_stored(write: &PendingWrite, stats: &mut PipelineStats) {
    match write {
        PendingWrite::Observation(_) => stats.observations_stored += 1,
        PendingWrite::GattTree { .. } => stats.gatt_trees_stored += 1,
    }
}

/// Main service coordinating discovery, enumeration and persistence
pub struct TrackerService<S: ObservationStore + 'static> {
    adapter: Arc<dyn BleAdapter>,
    store: Arc<S>,
    reference: Arc<ReferenceData>,
    scan: ScanSettings,
    gatt: GattSettings,
    pending_capacity: usize,
}

impl<S: ObservationStore + 'static> TrackerService<S> {
    /// Create a new tracker service
    pub fn new(
        adapter: Arc<dyn BleAdapter>,
        store: Arc<S>,
        reference: Arc<ReferenceData>,
        settings: &Settings,
    ) -> Self {
        Self {
            adapter,
            store,
            reference,
            scan: settings.scan.clone(),
            gatt: settings.gatt.clone(),
            pending_capacity: settings.store.pending_capacity,
        }
    }

    /// Spawn the pipeline. Every event is also forwarded to `observer`, if given.
    pub fn start(&self, observer: Option<mpsc::UnboundedSender<PipelineEvent>>) -> RunningPipeline {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let scan_cancel = CancellationToken::new();
        let gatt_cancel = CancellationToken::new();
        let consumer_cancel = CancellationToken::new();

        let gatt = self.gatt.enabled.then(|| {
            Arc::new(GattSessionManager::start(
                self.adapter.clone(),
                &self.gatt,
                event_tx.clone(),
                gatt_cancel.clone(),
            ))
        });

        let scanner = BleScanner::new(
            self.adapter.clone(),
            AttributeExtractor::new(self.reference.clone()),
            event_tx,
            &self.scan,
        );
        let scan_handle = tokio::spawn(scanner.run(scan_cancel.clone()));

        let consumer = Consumer {
            store: self.store.clone(),
            gatt: gatt.clone(),
            observer,
            buffer: WriteBuffer::new(self.pending_capacity),
            stats: PipelineStats::default(),
        };
        let consumer_handle = tokio::spawn(consumer.run(event_rx, consumer_cancel.clone()));

        info!(gatt_enabled = self.gatt.enabled, "Tracker pipeline started");

        RunningPipeline {
            scan_cancel,
            consumer_cancel,
            gatt,
            scan_handle,
            consumer_handle,
        }
    }
}

struct Consumer<S: ObservationStore + 'static> {
    store: Arc<S>,
    gatt: Option<Arc<GattSessionManager>>,
    observer: Option<mpsc::UnboundedSender<PipelineEvent>>,
    buffer: WriteBuffer,
    stats: PipelineStats,
}

impl<S: ObservationStore + 'static> Consumer<S> {
    async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<PipelineEvent>,
        cancel: CancellationToken,
    ) -> PipelineStats {
        let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if self.buffer.len() > 0 {
                        self.buffer.flush(self.store.as_ref(), &mut self.stats).await;
                    }
                }
                event = events.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => break,
                },
            }
        }

        // Drain what the producers sent before they stopped.
        while let Ok(event) = events.try_recv() {
            self.handle(event).await;
        }
        self.buffer.flush(self.store.as_ref(), &mut self.stats).await;

        self.stats.pending_writes = self.buffer.len();
        self.stats.dropped_writes = self.buffer.dropped;
        if self.stats.pending_writes > 0 {
            warn!(pending = self.stats.pending_writes, "Store unavailable at shutdown, writes lost");
        }
        self.stats
    }

    async fn handle(&mut self, event: PipelineEvent) {
        match &event {
            PipelineEvent::DeviceObserved(observation) => {
                self.buffer
                    .write(
                        self.store.as_ref(),
                        PendingWrite::Observation(observation.clone()),
                        &mut self.stats,
                    )
                    .await;
                if let Some(gatt) = &self.gatt {
                    gatt.submit(observation.address()).await;
                }
            }
            PipelineEvent::GattResolved(resolution) => match resolution.outcome {
                GattOutcome::Done => {
                    self.buffer
                        .write(
                            self.store.as_ref(),
                            PendingWrite::GattTree {
                                address: resolution.address.clone(),
                                tree: resolution.tree.clone(),
                            },
                            &mut self.stats,
                        )
                        .await;
                }
                GattOutcome::Abandoned => {
                    self.stats.gatt_abandoned += 1;
                    debug!(address = %resolution.address, "Nothing to store for abandoned session");
                }
            },
        }

        if let Some(observer) = &self.observer {
            if observer.send(event).is_err() {
                debug!("Pipeline observer dropped");
                self.observer = None;
            }
        }
    }
}

/// Handle to a started pipeline
pub struct RunningPipeline {
    scan_cancel: CancellationToken,
    consumer_cancel: CancellationToken,
    gatt: Option<Arc<GattSessionManager>>,
    scan_handle: JoinHandle<ScanStats>,
    consumer_handle: JoinHandle<PipelineStats>,
}

impl RunningPipeline {
    pub fn gatt(&self) -> Option<&GattSessionManager> {
        self.gatt.as_deref()
    }

    /// Stops scanning, lets running GATT sessions finish, then drains and flushes.
    pub async fn stop(self) -> PipelineStats {
        info!("Stopping tracker pipeline...");

        // Step 1: No new observations
        self.scan_cancel.cancel();
        let scan = match self.scan_handle.await {
            Ok(stats) => stats,
            Err(e) => {
                error!("Scan task failed: {}", e);
                ScanStats::default()
            }
        };

        // Step 2: No new sessions, wait for running ones
        if let Some(gatt) = &self.gatt {
            gatt.shutdown().await;
        }

        // Step 3: Persist everything already emitted
        self.consumer_cancel.cancel();
        let mut stats = match self.consumer_handle.await {
            Ok(stats) => stats,
            Err(e) => {
                error!("Consumer task failed: {}", e);
                PipelineStats::default()
            }
        };
        stats.scan = scan;

        info!(
            observations = stats.observations_stored,
            gatt_trees = stats.gatt_trees_stored,
            abandoned = stats.gatt_abandoned,
            "Tracker pipeline stopped"
        );
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::DeviceAttributes;
    use crate::domain::store::Table;
    use chrono::Utc;

    fn observation(address: &str) -> PendingWrite {
        PendingWrite::Observation(DeviceObservation {
            attributes: DeviceAttributes {
                address: address.to_string(),
                ..Default::default()
            },
            rssi: None,
            timestamp: Utc::now(),
            geolocation: None,
        })
    }

    #[test]
    fn test_write_buffer_evicts_oldest() {
        let mut buffer = WriteBuffer::new(2);
        buffer.push(observation("A"));
        buffer.push(observation("B"));
        buffer.push(observation("C"));

        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.dropped, 1);
        let addresses: Vec<&str> = buffer.pending.iter().map(PendingWrite::address).collect();
        assert_eq!(addresses, vec!["B", "C"]);
    }

    #[tokio::test]
    async fn test_flush_writes_in_order() {
        let store = crate::infrastructure::store::Database::open_in_memory().unwrap();
        let mut buffer = WriteBuffer::new(10);
        let mut stats = PipelineStats::default();
        buffer.push(observation("A"));
        buffer.push(observation("B"));

        buffer.flush(&store, &mut stats).await;

        assert_eq!(buffer.len(), 0);
        assert_eq!(stats.observations_stored, 2);
    }

    #[tokio::test]
    async fn test_rejected_write_does_not_block_the_rest() {
        let store = crate::infrastructure::store::Database::open_in_memory().unwrap();
        store
            .execute(|conn| {
                conn.execute_batch(
                    "CREATE TRIGGER reject_bad BEFORE INSERT ON ble_device
                     WHEN NEW.address = 'BAD'
                     BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
                )?;
                Ok(())
            })
            .await
            .unwrap();

        let mut buffer = WriteBuffer::new(10);
        let mut stats = PipelineStats::default();
        buffer.push(observation("A"));
        buffer.push(observation("BAD"));
        buffer.push(observation("C"));

        buffer.flush(&store, &mut stats).await;

        assert_eq!(buffer.len(), 0);
        assert_eq!(stats.observations_stored, 2);
        assert_eq!(store.count(Table::Devices).await.unwrap(), 2);
    }
}
