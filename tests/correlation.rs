mod support;

use ble_tracker::domain::attributes::AttributeWeightTable;
use ble_tracker::domain::correlation::{CorrelationEngine, SearchOptions};
use ble_tracker::domain::errors::Error;
use ble_tracker::domain::store::{ObservationStore, Table};
use ble_tracker::infrastructure::store::Database;
use std::sync::Arc;
use support::{at_hour, observation};

async fn populated_store() -> (Arc<Database>, i64, i64, i64) {
    let store = Arc::new(Database::open_in_memory().unwrap());

    let original = store
        .insert_observation(&observation("AA:AA:AA:AA:AA:01", "Pixel 7", at_hour(0)))
        .await
        .unwrap();
    // Same device after address randomisation.
    let duplicate = store
        .insert_observation(&observation("5A:3C:11:22:33:44", "Pixel 7", at_hour(1)))
        .await
        .unwrap();

    let mut unrelated = observation("CC:CC:CC:CC:CC:03", "Fitbit Charge", at_hour(2));
    unrelated.attributes.uuids = Some("0000fe9f-0000-1000-8000-00805f9b34fb".into());
    unrelated.attributes.manufacturer_data.clear();
    unrelated.attributes.manufacturer_data.insert(0x0006, "0109".into());
    unrelated.attributes.manufacturers = Some("Microsoft".into());
    let unrelated = store.insert_observation(&unrelated).await.unwrap();

    (store, original, duplicate, unrelated)
}

#[tokio::test]
async fn test_exact_duplicate_ranks_first() {
    let (store, original, duplicate, unrelated) = populated_store().await;
    let engine = CorrelationEngine::new(store, AttributeWeightTable::standard());

    let matches = engine
        .find_similar_devices(original, SearchOptions::default())
        .await
        .unwrap();

    assert_eq!(matches[0].device_id, duplicate);
    assert_eq!(matches[0].score, 1.0);
    assert!(matches.iter().all(|m| m.device_id != original));
    if let Some(other) = matches.iter().find(|m| m.device_id == unrelated) {
        assert!(other.score < 1.0);
    }
}

#[tokio::test]
async fn test_chunking_does_not_change_results() {
    let (store, original, _, _) = populated_store().await;
    for i in 0..7 {
        store
            .insert_observation(&observation(
                &format!("DD:DD:DD:DD:DD:{i:02}"),
                &format!("Pixel {i}"),
                at_hour(3),
            ))
            .await
            .unwrap();
    }
    let engine = CorrelationEngine::new(store, AttributeWeightTable::standard());

    let whole = engine
        .find_similar_devices(
            original,
            SearchOptions {
                threshold: 0.0,
                chunk_size: 100,
                max_workers: 1,
            },
        )
        .await
        .unwrap();
    let chunked = engine
        .find_similar_devices(
            original,
            SearchOptions {
                threshold: 0.0,
                chunk_size: 2,
                max_workers: 3,
            },
        )
        .await
        .unwrap();

    assert_eq!(whole, chunked);
    assert_eq!(whole.len(), 9);
}

#[tokio::test]
async fn test_threshold_filters_candidates() {
    let (store, original, duplicate, _) = populated_store().await;
    let engine = CorrelationEngine::new(store, AttributeWeightTable::standard());

    let matches = engine
        .find_similar_devices(
            original,
            SearchOptions {
                threshold: 0.99,
                ..SearchOptions::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].device_id, duplicate);
}

#[tokio::test]
async fn test_group_members_share_the_address() {
    let (store, original, duplicate, _) = populated_store().await;
    // Same address, different name: a second record in the reference group.
    let sibling = store
        .insert_observation(&observation("AA:AA:AA:AA:AA:01", "Pixel 7 Pro", at_hour(4)))
        .await
        .unwrap();
    let engine = CorrelationEngine::new(store, AttributeWeightTable::standard());

    let group = engine.reference_group(original).await.unwrap();
    let ids: Vec<i64> = group.iter().map(|d| d.id).collect();
    assert_eq!(ids, vec![original, sibling]);

    let matches = engine
        .find_similar_devices(original, SearchOptions::default())
        .await
        .unwrap();
    assert!(matches.iter().all(|m| m.device_id != sibling));
    assert_eq!(matches[0].device_id, duplicate);
    assert!(matches[0].score < 1.0);
}

#[tokio::test]
async fn test_unknown_device_is_an_error() {
    let (store, _, _, _) = populated_store().await;
    let engine = CorrelationEngine::new(store, AttributeWeightTable::standard());

    let result = engine
        .find_similar_devices(999, SearchOptions::default())
        .await;
    assert!(matches!(result, Err(Error::UnknownDevice(999))));
}

#[tokio::test]
async fn test_compare_devices_breakdown() {
    let (store, original, duplicate, _) = populated_store().await;
    let engine = CorrelationEngine::new(store, AttributeWeightTable::standard());

    let comparison = engine.compare_devices(original, duplicate).await.unwrap();

    assert_eq!(comparison.score, 1.0);
    assert!(comparison.attributes.iter().all(|row| row.name != "rssi"));
    let address = comparison
        .attributes
        .iter()
        .find(|row| row.name == "address")
        .unwrap();
    assert_eq!(address.similarity, Some(0.0));
    let name = comparison
        .attributes
        .iter()
        .find(|row| row.name == "name")
        .unwrap();
    assert_eq!(name.similarity, Some(1.0));
    let alias = comparison
        .attributes
        .iter()
        .find(|row| row.name == "alias")
        .unwrap();
    assert_eq!(alias.similarity, None);
}

#[tokio::test]
async fn test_identical_inserts_share_an_id() {
    let store = Database::open_in_memory().unwrap();
    let first = store
        .insert_observation(&observation("AA:AA:AA:AA:AA:01", "Pixel 7", at_hour(0)))
        .await
        .unwrap();
    let second = store
        .insert_observation(&observation("AA:AA:AA:AA:AA:01", "Pixel 7", at_hour(5)))
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(store.count(Table::Devices).await.unwrap(), 1);
    assert_eq!(store.sightings(first).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_most_seen_devices() {
    let (store, _, _, _) = populated_store().await;
    store
        .insert_observation(&observation("AA:AA:AA:AA:AA:01", "Pixel 7", at_hour(30)))
        .await
        .unwrap();
    let engine = CorrelationEngine::new(store, AttributeWeightTable::standard());

    let seen = engine
        .most_seen_devices(chrono::Duration::hours(24))
        .await
        .unwrap();

    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].address, "AA:AA:AA:AA:AA:01");
    assert_eq!(seen[0].sightings, 2);
    assert_eq!(seen[0].span(), chrono::Duration::hours(30));
}
