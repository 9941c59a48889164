// tests/store_upsert.rs
//
// Dedup/upsert semantics, channel independence and durability of JsonStore.

use chrono::Utc;
use listing_relay::error::PersistenceError;
use listing_relay::ingest::types::{AuthorType, RawListing};
use listing_relay::store::{AnnouncementStore, JsonStore, Status, UpsertStats};
use std::fs;

fn listing(id: &str, price: Option<u64>) -> RawListing {
    RawListing {
        external_id: id.into(),
        title: format!("Объявление {id}"),
        description: "Состояние отличное, торг уместен".into(),
        price,
        url: format!("https://board.example/item/{id}"),
        image_urls: vec![format!("https://img.board.example/{id}.jpg")],
        location: None,
        author_type: AuthorType::Private,
        category: "auto".into(),
    }
}

#[tokio::test]
async fn unchanged_price_is_duplicate_and_untouched() {
    let store = JsonStore::in_memory();
    store.upsert_batch(vec![listing("1", Some(1000))]).await.unwrap();
    let before = store.get("1").await.unwrap().unwrap();

    let stats = store.upsert_batch(vec![listing("1", Some(1000))]).await.unwrap();
    assert_eq!(stats, UpsertStats { new: 0, updated: 0, duplicate: 1 });

    let after = store.get("1").await.unwrap().unwrap();
    assert_eq!(after, before);
    assert_eq!(after.last_price, None);
}

#[tokio::test]
async fn price_change_marks_updated() {
    let store = JsonStore::in_memory();
    store.upsert_batch(vec![listing("1", Some(1000))]).await.unwrap();
    let stats = store.upsert_batch(vec![listing("1", Some(1200))]).await.unwrap();
    assert_eq!(stats.updated, 1);

    let a = store.get("1").await.unwrap().unwrap();
    assert_eq!(a.status, Status::Updated);
    assert_eq!(a.last_price, Some(1000));
    assert_eq!(a.price, Some(1200));
    assert!(a.last_updated_at >= a.first_seen_at);
}

#[tokio::test]
async fn channels_are_independent() {
    let store = JsonStore::in_memory();
    store
        .upsert_batch(vec![listing("1", Some(10)), listing("2", Some(20))])
        .await
        .unwrap();

    store.mark_published("1", "vk", "555", Utc::now()).await.unwrap();

    let vk: Vec<String> = store
        .pending_for_channel("vk")
        .await
        .unwrap()
        .into_iter()
        .map(|a| a.external_id)
        .collect();
    assert_eq!(vk, vec!["2".to_string()]);

    let tg = store.pending_for_channel("telegram").await.unwrap();
    assert_eq!(tg.len(), 2);
    assert!(tg[0].first_seen_at <= tg[1].first_seen_at);

    let a = store.get("1").await.unwrap().unwrap();
    assert!(a.is_published_to("vk"));
    assert!(!a.channel_state.contains_key("telegram"));
    assert_eq!(a.channel_state["vk"].post_id.as_deref(), Some("555"));

    let stats = store.stats().await.unwrap();
    assert_eq!(stats.total, 2);
    assert_eq!(stats.new, 2);
    assert_eq!(stats.published.get("vk"), Some(&1));
}

#[tokio::test]
async fn state_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state").join("announcements.json");

    {
        let store = JsonStore::open(&path).await.unwrap();
        store.upsert_batch(vec![listing("1", Some(1000))]).await.unwrap();
        store.mark_published("1", "telegram", "77", Utc::now()).await.unwrap();
    }
    assert!(path.exists());
    assert!(!path.with_file_name("announcements.json.tmp").exists());

    let store = JsonStore::open(&path).await.unwrap();
    let a = store.get("1").await.unwrap().unwrap();
    assert!(a.is_published_to("telegram"));
    assert_eq!(a.content_hash.len(), 64);

    let stats = store.upsert_batch(vec![listing("1", Some(1000))]).await.unwrap();
    assert_eq!(stats.duplicate, 1);
}

#[tokio::test]
async fn failed_write_rolls_back_whole_batch() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("state");
    let path = blocker.join("announcements.json");

    let store = JsonStore::open(&path).await.unwrap();
    store.upsert_batch(vec![listing("1", Some(1000))]).await.unwrap();

    // Replace the state directory with a regular file: every later write fails.
    fs::remove_dir_all(&blocker).unwrap();
    fs::write(&blocker, b"not a directory").unwrap();

    let err = store
        .upsert_batch(vec![listing("1", Some(900)), listing("2", Some(5000))])
        .await
        .unwrap_err();
    assert!(matches!(err, PersistenceError::Io { .. }));

    // Nothing from the failed batch is visible.
    assert!(store.get("2").await.unwrap().is_none());
    let a = store.get("1").await.unwrap().unwrap();
    assert_eq!(a.price, Some(1000));
    assert_eq!(a.status, Status::New);

    let err = store
        .mark_published("1", "vk", "1", Utc::now())
        .await
        .unwrap_err();
    assert!(matches!(err, PersistenceError::Io { .. }));
    assert!(!store.get("1").await.unwrap().unwrap().is_published_to("vk"));
}

#[tokio::test]
async fn filtered_records_are_never_pending() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("announcements.json");
    {
        let store = JsonStore::open(&path).await.unwrap();
        store
            .upsert_batch(vec![listing("1", Some(10)), listing("2", Some(20))])
            .await
            .unwrap();
    }

    // Mark one record as filtered the way an admin tool would: edit the file.
    let mut doc: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
    doc["1"]["status"] = serde_json::json!("filtered");
    fs::write(&path, serde_json::to_vec(&doc).unwrap()).unwrap();

    let store = JsonStore::open(&path).await.unwrap();
    let pending: Vec<String> = store
        .pending_for_channel("vk")
        .await
        .unwrap()
        .into_iter()
        .map(|a| a.external_id)
        .collect();
    assert_eq!(pending, vec!["2".to_string()]);
    assert_eq!(store.stats().await.unwrap().filtered, 1);
}

#[tokio::test]
async fn corrupt_file_is_an_error_not_an_empty_store() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("announcements.json");
    fs::write(&path, b"{ not json").unwrap();
    assert!(matches!(
        JsonStore::open(&path).await,
        Err(PersistenceError::Serde(_))
    ));
}
