//! GATT Session Manager
//!
//! Connects to each submitted address at most once per process, with a
//! bounded number of attempts and a bounded number of concurrent sessions.
//!
//! ```text
//! Pending -> Connecting -> Enumerating -> ReadingValues -> Done
//!    ^                                          |
//!    +------------ Failed(n), n < max ----------+
//!                  Failed(n), n = max -> Abandoned
//! ```

use crate::domain::models::{GattOutcome, GattResolution, GattTree, PipelineEvent};
use crate::domain::settings::GattSettings;
use crate::infrastructure::bluetooth::adapter::BleAdapter;
use crate::infrastructure::bluetooth::connection::{BleConnection, ConnectionConfig, EnumerationStage};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Pending,
    Connecting,
    Enumerating,
    ReadingValues,
    Done,
    /// Number of failed attempts so far.
    Failed(u32),
    Abandoned,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Abandoned)
    }
}

impl From<EnumerationStage> for SessionState {
    fn from(stage: EnumerationStage) -> Self {
        match stage {
            EnumerationStage::Connecting => Self::Connecting,
            EnumerationStage::Enumerating => Self::Enumerating,
            EnumerationStage::ReadingValues => Self::ReadingValues,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct AddressState {
    state: SessionState,
    failures: u32,
}

type StateMap = Arc<Mutex<HashMap<String, AddressState>>>;

fn lock(states: &StateMap) -> MutexGuard<'_, HashMap<String, AddressState>> {
    match states.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn set_state(states: &StateMap, address: &str, state: SessionState) {
    if let Some(entry) = lock(states).get_mut(address) {
        entry.state = state;
    }
}

struct Worker {
    connection: BleConnection,
    states: StateMap,
    queue: mpsc::Sender<String>,
    events: mpsc::UnboundedSender<PipelineEvent>,
    max_tries: u32,
    cancel: CancellationToken,
}

impl Worker {
    async fn attempt(self: Arc<Self>, address: String, permit: OwnedSemaphorePermit) {
        let result = self
            .connection
            .enumerate(&address, |stage| set_state(&self.states, &address, stage.into()))
            .await;
        drop(permit);

        match result {
            Ok(tree) => {
                let attempts = {
                    let mut states = lock(&self.states);
                    match states.get_mut(&address) {
                        Some(entry) => {
                            entry.state = SessionState::Done;
                            entry.failures + 1
                        }
                        None => 1,
                    }
                };
                info!(address = %address, attempts, "GATT session done");
                self.emit(GattResolution {
                    address,
                    outcome: GattOutcome::Done,
                    attempts,
                    tree,
                });
            }
            Err(e) => {
                let failures = {
                    let mut states = lock(&self.states);
                    match states.get_mut(&address) {
                        Some(entry) => {
                            entry.failures += 1;
                            entry.state = SessionState::Failed(entry.failures);
                            entry.failures
                        }
                        None => self.max_tries,
                    }
                };

                if failures < self.max_tries {
                    warn!(address = %address, failures, max_tries = self.max_tries, "GATT attempt failed, retrying: {}", e);
                    set_state(&self.states, &address, SessionState::Pending);
                    self.requeue(address).await;
                } else {
                    warn!(address = %address, failures, "GATT session abandoned: {}", e);
                    set_state(&self.states, &address, SessionState::Abandoned);
                    self.emit(GattResolution {
                        address,
                        outcome: GattOutcome::Abandoned,
                        attempts: failures,
                        tree: GattTree::default(),
                    });
                }
            }
        }
    }

    async fn requeue(&self, address: String) {
        tokio::select! {
            _ = self.cancel.cancelled() => {
                debug!(address = %address, "Shutdown before retry could be queued");
            }
            sent = self.queue.send(address.clone()) => {
                if let Err(e) = sent {
                    debug!(address = %e.0, "Session queue closed, retry dropped");
                }
            }
        }
    }

    fn emit(&self, resolution: GattResolution) {
        if self.events.send(PipelineEvent::GattResolved(resolution)).is_err() {
            debug!("Event receiver dropped, GATT resolution discarded");
        }
    }
}

/// Owns every live connection. Cheap to share behind an `Arc`.
pub struct GattSessionManager {
    states: StateMap,
    queue: mpsc::Sender<String>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl GattSessionManager {
    /// Spawn the dispatcher. `cancel` stops new sessions; running ones finish or time out.
    pub fn start(
        adapter: Arc<dyn BleAdapter>,
        settings: &GattSettings,
        events: mpsc::UnboundedSender<PipelineEvent>,
        cancel: CancellationToken,
    ) -> Self {
        let cancel = cancel.child_token();
        let states: StateMap = Arc::new(Mutex::new(HashMap::new()));
        let (queue_tx, queue_rx) = mpsc::channel(settings.queue_capacity.max(1));
        let tracker = TaskTracker::new();

        let worker = Arc::new(Worker {
            connection: BleConnection::new(adapter, ConnectionConfig::from(settings)),
            states: states.clone(),
            queue: queue_tx.clone(),
            events,
            max_tries: settings.max_tries.max(1),
            cancel: cancel.clone(),
        });

        let permits = Arc::new(Semaphore::new(settings.concurrency.max(1)));
        tracker.spawn(dispatch(
            worker,
            queue_rx,
            permits,
            tracker.clone(),
            cancel.clone(),
        ));

        info!(
            concurrency = settings.concurrency,
            max_tries = settings.max_tries,
            "GATT session manager started"
        );

        Self {
            states,
            queue: queue_tx,
            cancel,
            tracker,
        }
    }

    /// Queue `address` for enumeration unless it was ever submitted before.
    ///
    /// Returns whether the address was queued. Waits only while the queue is full.
    pub async fn submit(&self, address: &str) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }

        {
            let mut states = lock(&self.states);
            if states.contains_key(address) {
                return false;
            }
            states.insert(
                address.to_string(),
                AddressState {
                    state: SessionState::Pending,
                    failures: 0,
                },
            );
        }

        debug!(address = %address, "Queued for GATT enumeration");
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            sent = self.queue.send(address.to_string()) => sent.is_ok(),
        }
    }

    pub fn state(&self, address: &str) -> Option<SessionState> {
        lock(&self.states).get(address).map(|entry| entry.state)
    }

    /// Addresses currently between submission and a terminal state.
    pub fn in_progress(&self) -> usize {
        lock(&self.states)
            .values()
            .filter(|entry| !entry.state.is_terminal())
            .count()
    }

    /// Stop dispatching and wait for running sessions.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!("GATT session manager stopped");
    }
}

async fn dispatch(
    worker: Arc<Worker>,
    mut queue: mpsc::Receiver<String>,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    cancel: CancellationToken,
) {
    loop {
        // A permit is taken before an address so queued work waits in the channel.
        let permit = tokio::select! {
            _ = cancel.cancelled() => break,
            permit = permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let address = tokio::select! {
            _ = cancel.cancelled() => break,
            address = queue.recv() => match address {
                Some(address) => address,
                None => break,
            },
        };

        tracker.spawn(worker.clone().attempt(address, permit));
    }
    debug!("GATT dispatcher exiting");
}
