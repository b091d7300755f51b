//! Correlation engine: ranks stored devices by how likely they are the same
//! physical device as a reference group.
//!
//! A reference group is every stored record sharing one address. Candidates
//! are scored against each member and the scores averaged; the device table
//! is walked in offset windows scored concurrently.

use crate::domain::attributes::{AttributeMap, AttributeWeightTable};
use crate::domain::errors::{Error, Result};
use crate::domain::models::{KnownDevice, Sighting};
use crate::domain::settings::CorrelationSettings;
use crate::domain::similarity::AttributeValue;
use crate::domain::store::{ObservationStore, Table};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info};

/// Default minimum sighting span for [`CorrelationEngine::most_seen_devices`].
pub const MOST_SEEN_SPAN_HOURS: i64 = 24;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchOptions {
    /// Minimum averaged score to report.
    pub threshold: f64,
    /// Devices fetched and scored per task.
    pub chunk_size: u64,
    /// Chunks scored at the same time.
    pub max_workers: usize,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self::from(&CorrelationSettings::default())
    }
}

impl From<&CorrelationSettings> for SearchOptions {
    fn from(settings: &CorrelationSettings) -> Self {
        Self {
            threshold: settings.threshold,
            chunk_size: settings.chunk_size,
            max_workers: settings.max_workers,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SimilarityMatch {
    pub device_id: i64,
    pub score: f64,
}

/// One row of a pairwise comparison.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeComparison {
    pub name: &'static str,
    pub weight: f64,
    pub left: Option<AttributeValue>,
    pub right: Option<AttributeValue>,
    /// `None` unless both sides have a value.
    pub similarity: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceComparison {
    pub left_id: i64,
    pub right_id: i64,
    pub score: f64,
    pub attributes: Vec<AttributeComparison>,
}

/// A stored device with everything recorded about it.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceReport {
    pub device: KnownDevice,
    pub sightings: Vec<Sighting>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SeenAddress {
    pub address: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub sightings: usize,
}

impl SeenAddress {
    pub fn span(&self) -> Duration {
        self.last_seen - self.first_seen
    }
}

/// Weighted mean similarity of `candidate` to the attributes in `original`.
///
/// Only attributes present on both sides count, so missing data never
/// lowers the score. Zero total weight scores 0.
pub fn score_device_pair(
    table: &AttributeWeightTable,
    original: &AttributeMap,
    candidate: &KnownDevice,
) -> f64 {
    let mut weighted = 0.0;
    let mut total_weight = 0.0;

    for spec in table.iter() {
        if spec.weight <= 0.0 {
            continue;
        }
        let Some(left) = original.get(spec.name) else {
            continue;
        };
        let Some(right) = spec.value(candidate) else {
            continue;
        };
        weighted += spec.weight * spec.similarity.score(left, &right);
        total_weight += spec.weight;
    }

    if total_weight > 0.0 {
        weighted / total_weight
    } else {
        0.0
    }
}

fn score_chunk(
    table: &AttributeWeightTable,
    group: &[AttributeMap],
    exclude: &HashSet<i64>,
    candidates: &[KnownDevice],
    threshold: f64,
) -> Vec<SimilarityMatch> {
    if group.is_empty() {
        return Vec::new();
    }
    candidates
        .iter()
        .filter(|candidate| !exclude.contains(&candidate.id))
        .filter_map(|candidate| {
            let sum: f64 = group
                .iter()
                .map(|original| score_device_pair(table, original, candidate))
                .sum();
            let score = sum / group.len() as f64;
            (score >= threshold).then_some(SimilarityMatch {
                device_id: candidate.id,
                score,
            })
        })
        .collect()
}

fn rank(matches: &mut [SimilarityMatch]) {
    matches.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then(a.device_id.cmp(&b.device_id))
    });
}

pub struct CorrelationEngine<S: ObservationStore + 'static> {
    store: Arc<S>,
    table: Arc<AttributeWeightTable>,
}

impl<S: ObservationStore + 'static> CorrelationEngine<S> {
    pub fn new(store: Arc<S>, table: AttributeWeightTable) -> Self {
        Self {
            store,
            table: Arc::new(table),
        }
    }

    pub fn table(&self) -> &AttributeWeightTable {
        &self.table
    }

    async fn require_device(&self, id: i64) -> Result<KnownDevice> {
        self.store
            .known_device(id)
            .await?
            .ok_or(Error::UnknownDevice(id))
    }

    /// Every stored record sharing the address of device `id`.
    pub async fn reference_group(&self, id: i64) -> Result<Vec<KnownDevice>> {
        let device = self.require_device(id).await?;
        let ids = self
            .store
            .query_by_attribute(Table::Devices, "address", &device.attributes.address)
            .await?;

        let mut group = Vec::with_capacity(ids.len());
        for member_id in ids {
            if member_id == id {
                continue;
            }
            if let Some(member) = self.store.known_device(member_id).await? {
                group.push(member);
            }
        }
        group.insert(0, device);
        Ok(group)
    }

    /// Devices resembling the reference group of device `id`, best first.
    pub async fn find_similar_devices(
        &self,
        id: i64,
        options: SearchOptions,
    ) -> Result<Vec<SimilarityMatch>> {
        let group = self.reference_group(id).await?;
        self.find_similar_to_group(&group, options).await
    }

    /// Devices outside `group` whose averaged score reaches the threshold.
    pub async fn find_similar_to_group(
        &self,
        group: &[KnownDevice],
        options: SearchOptions,
    ) -> Result<Vec<SimilarityMatch>> {
        let maps: Arc<Vec<AttributeMap>> = Arc::new(
            group
                .iter()
                .map(|device| self.table.attribute_map(device, false))
                .collect(),
        );
        let exclude: Arc<HashSet<i64>> = Arc::new(group.iter().map(|device| device.id).collect());

        let total = self.store.count(Table::Devices).await?;
        let chunk_size = options.chunk_size.max(1);
        let permits = Arc::new(Semaphore::new(options.max_workers.max(1)));
        let mut tasks = JoinSet::new();

        debug!(
            total,
            chunk_size,
            group = group.len(),
            "Scoring device table"
        );

        let mut offset = 0;
        while offset < total {
            let permit = permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| Error::TaskFailed(e.to_string()))?;
            let store = self.store.clone();
            let table = self.table.clone();
            let maps = maps.clone();
            let exclude = exclude.clone();
            let threshold = options.threshold;

            tasks.spawn(async move {
                let _permit = permit;
                let candidates = store.known_devices_paged(offset, chunk_size).await?;
                tokio::task::spawn_blocking(move || {
                    score_chunk(&table, &maps, &exclude, &candidates, threshold)
                })
                .await
                .map_err(|e| Error::TaskFailed(e.to_string()))
            });
            offset += chunk_size;
        }

        let mut matches = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let chunk = joined.map_err(|e| Error::TaskFailed(e.to_string()))??;
            matches.extend(chunk);
        }
        rank(&mut matches);

        info!(
            candidates = total,
            matches = matches.len(),
            threshold = options.threshold,
            "Similarity search finished"
        );
        Ok(matches)
    }

    /// Attribute-by-attribute breakdown of two stored devices.
    pub async fn compare_devices(&self, left_id: i64, right_id: i64) -> Result<DeviceComparison> {
        let left = self.require_device(left_id).await?;
        let right = self.require_device(right_id).await?;

        let attributes = self
            .table
            .iter()
            .map(|spec| {
                let left_value = spec.value(&left);
                let right_value = spec.value(&right);
                let similarity = match (&left_value, &right_value) {
                    (Some(a), Some(b)) => Some(spec.similarity.score(a, b)),
                    _ => None,
                };
                AttributeComparison {
                    name: spec.name,
                    weight: spec.weight,
                    left: left_value,
                    right: right_value,
                    similarity,
                }
            })
            .collect();

        let original = self.table.attribute_map(&left, false);
        Ok(DeviceComparison {
            left_id,
            right_id,
            score: score_device_pair(&self.table, &original, &right),
            attributes,
        })
    }

    pub async fn get_device(&self, id: i64) -> Result<DeviceReport> {
        let device = self.require_device(id).await?;
        let sightings = self.store.sightings(id).await?;
        Ok(DeviceReport { device, sightings })
    }

    pub async fn devices_by_attribute(&self, attribute: &str, value: &str) -> Result<Vec<i64>> {
        self.store
            .query_by_attribute(Table::Devices, attribute, value)
            .await
    }

    pub async fn search_devices(&self, name_fragment: &str) -> Result<Vec<i64>> {
        self.store.search_by_name(name_fragment).await
    }

    /// Addresses whose first and last sightings are at least `min_span` apart,
    /// longest span first.
    pub async fn most_seen_devices(&self, min_span: Duration) -> Result<Vec<SeenAddress>> {
        let mut seen: BTreeMap<String, SeenAddress> = BTreeMap::new();
        for (address, timestamp) in self.store.sighting_times().await? {
            seen.entry(address.clone())
                .and_modify(|entry| {
                    entry.first_seen = entry.first_seen.min(timestamp);
                    entry.last_seen = entry.last_seen.max(timestamp);
                    entry.sightings += 1;
                })
                .or_insert(SeenAddress {
                    address,
                    first_seen: timestamp,
                    last_seen: timestamp,
                    sightings: 1,
                });
        }

        let mut result: Vec<SeenAddress> = seen
            .into_values()
            .filter(|entry| entry.span() >= min_span)
            .collect();
        result.sort_by(|a, b| b.span().cmp(&a.span()).then(a.address.cmp(&b.address)));
        Ok(result)
    }
}
