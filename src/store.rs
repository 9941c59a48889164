// src/store.rs
//! Canonical announcement storage with dedup and price-change detection.
//!
//! `JsonStore` keeps every announcement in memory and mirrors it to a JSON
//! file keyed by external id. All writes go through one async mutex: the
//! change is applied to a staged copy, the copy is persisted (temp file +
//! rename) and only then swapped in. A failed write leaves nothing visible.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;

use crate::error::PersistenceError;
use crate::ingest::types::{AuthorType, RawListing};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    New,
    Updated,
    Duplicate,
    Filtered,
}

impl Status {
    /// Only fresh or re-priced records go out.
    pub fn is_publishable(self) -> bool {
        matches!(self, Status::New | Status::Updated)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelState {
    pub published: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Announcement {
    pub external_id: String,
    pub title: String,
    pub description: String,
    pub price: Option<u64>,
    pub category: String,
    pub url: String,
    #[serde(default)]
    pub image_urls: Vec<String>,
    #[serde(default)]
    pub location: Option<String>,
    pub author_type: AuthorType,
    pub content_hash: String,
    pub status: Status,
    #[serde(default)]
    pub channel_state: HashMap<String, ChannelState>,
    pub first_seen_at: DateTime<Utc>,
    #[serde(default)]
    pub last_price: Option<u64>,
    pub last_updated_at: DateTime<Utc>,
}

impl Announcement {
    pub fn from_listing(l: RawListing, now: DateTime<Utc>) -> Self {
        let content_hash = content_hash(&l.external_id, &l.title, &l.description);
        Self {
            external_id: l.external_id,
            title: l.title,
            description: l.description,
            price: l.price,
            category: l.category,
            url: l.url,
            image_urls: l.image_urls,
            location: l.location,
            author_type: l.author_type,
            content_hash,
            status: Status::New,
            channel_state: HashMap::new(),
            first_seen_at: now,
            last_price: None,
            last_updated_at: now,
        }
    }

    pub fn is_published_to(&self, channel: &str) -> bool {
        self.channel_state
            .get(channel)
            .is_some_and(|s| s.published)
    }
}

/// sha256 hex of `id_title_description[:100 chars]`.
pub fn content_hash(external_id: &str, title: &str, description: &str) -> String {
    use sha2::{Digest, Sha256};
    let head: String = description.chars().take(100).collect();
    let mut hasher = Sha256::new();
    hasher.update(external_id.as_bytes());
    hasher.update(b"_");
    hasher.update(title.as_bytes());
    hasher.update(b"_");
    hasher.update(head.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for b in digest.iter() {
        use std::fmt::Write as _;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertStats {
    pub new: usize,
    pub updated: usize,
    pub duplicate: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub total: usize,
    pub new: usize,
    pub updated: usize,
    pub duplicate: usize,
    pub filtered: usize,
    /// channel id -> announcements published there
    pub published: BTreeMap<String, usize>,
}

#[async_trait]
pub trait AnnouncementStore: Send + Sync {
    /// Insert or re-price a whole batch atomically.
    async fn upsert_batch(&self, batch: Vec<RawListing>) -> Result<UpsertStats, PersistenceError>;

    /// Publishable records not yet on `channel`, oldest first.
    async fn pending_for_channel(&self, channel: &str) -> Result<Vec<Announcement>, PersistenceError>;

    /// Record a successful send. Touches only `channel`'s entry.
    async fn mark_published(
        &self,
        external_id: &str,
        channel: &str,
        post_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), PersistenceError>;

    async fn get(&self, external_id: &str) -> Result<Option<Announcement>, PersistenceError>;

    async fn stats(&self) -> Result<StoreStats, PersistenceError>;
}

type Records = BTreeMap<String, Announcement>;

pub struct JsonStore {
    path: Option<PathBuf>,
    records: Mutex<Records>,
}

impl JsonStore {
    /// Load `path` if it exists; a missing file starts an empty store.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let path = path.into();
        let records = match fs::read_to_string(&path).await {
            Ok(s) if s.trim().is_empty() => Records::new(),
            Ok(s) => serde_json::from_str(&s)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Records::new(),
            Err(e) => return Err(io_err(&path, e)),
        };
        tracing::info!(target: "store", path = %path.display(), records = records.len(), "store loaded");
        Ok(Self {
            path: Some(path),
            records: Mutex::new(records),
        })
    }

    /// Non-persistent store.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            records: Mutex::new(Records::new()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    async fn persist(&self, records: &Records) -> Result<(), PersistenceError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).await.map_err(|e| io_err(dir, e))?;
        }
        let body = serde_json::to_vec(records)?;
        let tmp = tmp_path(path);
        fs::write(&tmp, body).await.map_err(|e| io_err(&tmp, e))?;
        if let Err(e) = fs::rename(&tmp, path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(io_err(path, e));
        }
        Ok(())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

fn io_err(path: &Path, source: std::io::Error) -> PersistenceError {
    PersistenceError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Apply one listing to the staged records.
fn upsert_one(staged: &mut Records, listing: RawListing, now: DateTime<Utc>, stats: &mut UpsertStats) {
    match staged.get_mut(&listing.external_id) {
        None => {
            let a = Announcement::from_listing(listing, now);
            staged.insert(a.external_id.clone(), a);
            stats.new += 1;
        }
        Some(existing) => match listing.price {
            Some(p) if existing.price != Some(p) => {
                existing.last_price = existing.price;
                existing.price = Some(p);
                existing.status = Status::Updated;
                existing.last_updated_at = now;
                stats.updated += 1;
            }
            _ => stats.duplicate += 1,
        },
    }
}

#[async_trait]
impl AnnouncementStore for JsonStore {
    async fn upsert_batch(&self, batch: Vec<RawListing>) -> Result<UpsertStats, PersistenceError> {
        let mut records = self.records.lock().await;
        let mut staged = records.clone();
        let mut stats = UpsertStats::default();
        for listing in batch {
            upsert_one(&mut staged, listing, Utc::now(), &mut stats);
        }

        if stats.new + stats.updated > 0 {
            if let Err(e) = self.persist(&staged).await {
                counter!("store_write_errors_total").increment(1);
                tracing::error!(target: "store", error = %e, "batch rolled back");
                return Err(e);
            }
            *records = staged;
        }

        counter!("store_upsert_total", "result" => "new").increment(stats.new as u64);
        counter!("store_upsert_total", "result" => "updated").increment(stats.updated as u64);
        counter!("store_upsert_total", "result" => "duplicate").increment(stats.duplicate as u64);
        gauge!("store_announcements").set(records.len() as f64);
        tracing::debug!(target: "store", new = stats.new, updated = stats.updated, duplicate = stats.duplicate, "batch upserted");
        Ok(stats)
    }

    async fn pending_for_channel(&self, channel: &str) -> Result<Vec<Announcement>, PersistenceError> {
        let records = self.records.lock().await;
        let mut out: Vec<Announcement> = records
            .values()
            .filter(|a| a.status.is_publishable() && !a.is_published_to(channel))
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            a.first_seen_at
                .cmp(&b.first_seen_at)
                .then_with(|| a.external_id.cmp(&b.external_id))
        });
        Ok(out)
    }

    async fn mark_published(
        &self,
        external_id: &str,
        channel: &str,
        post_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), PersistenceError> {
        let mut records = self.records.lock().await;
        let Some(a) = records.get_mut(external_id) else {
            return Err(PersistenceError::NotFound(external_id.to_string()));
        };
        // Changed in place; only this entry is restored if the write fails.
        let previous = a.channel_state.insert(
            channel.to_string(),
            ChannelState {
                published: true,
                post_id: Some(post_id.to_string()),
                published_at: Some(at),
            },
        );
        let previous_updated = std::mem::replace(&mut a.last_updated_at, at);

        if let Err(e) = self.persist(&records).await {
            counter!("store_write_errors_total").increment(1);
            if let Some(a) = records.get_mut(external_id) {
                match previous {
                    Some(st) => a.channel_state.insert(channel.to_string(), st),
                    None => a.channel_state.remove(channel),
                };
                a.last_updated_at = previous_updated;
            }
            return Err(e);
        }
        Ok(())
    }

    async fn get(&self, external_id: &str) -> Result<Option<Announcement>, PersistenceError> {
        Ok(self.records.lock().await.get(external_id).cloned())
    }

    async fn stats(&self) -> Result<StoreStats, PersistenceError> {
        let records = self.records.lock().await;
        let mut s = StoreStats {
            total: records.len(),
            ..StoreStats::default()
        };
        for a in records.values() {
            match a.status {
                Status::New => s.new += 1,
                Status::Updated => s.updated += 1,
                Status::Duplicate => s.duplicate += 1,
                Status::Filtered => s.filtered += 1,
            }
            for (ch, st) in &a.channel_state {
                if st.published {
                    *s.published.entry(ch.clone()).or_default() += 1;
                }
            }
        }
        Ok(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing(id: &str, price: Option<u64>) -> RawListing {
        RawListing {
            external_id: id.into(),
            title: format!("Lot {id}"),
            description: "Хорошее состояние, один владелец".into(),
            price,
            url: format!("https://board.example/item/{id}"),
            image_urls: vec![],
            location: None,
            author_type: AuthorType::Private,
            category: "auto".into(),
        }
    }

    #[test]
    fn hash_uses_first_hundred_chars_of_description() {
        let long_a = format!("{}{}", "a".repeat(100), "tail one");
        let long_b = format!("{}{}", "a".repeat(100), "tail two");
        assert_eq!(content_hash("1", "t", &long_a), content_hash("1", "t", &long_b));
        assert_ne!(content_hash("1", "t", "x"), content_hash("2", "t", "x"));
        assert_eq!(content_hash("1", "t", "x").len(), 64);
    }

    #[tokio::test]
    async fn duplicate_inside_one_batch_resolves_to_one_record() {
        let store = JsonStore::in_memory();
        let stats = store
            .upsert_batch(vec![listing("1", Some(1000)), listing("1", Some(1200))])
            .await
            .unwrap();
        assert_eq!(stats, UpsertStats { new: 1, updated: 1, duplicate: 0 });
        let a = store.get("1").await.unwrap().unwrap();
        assert_eq!(a.price, Some(1200));
        assert_eq!(a.last_price, Some(1000));
    }

    #[tokio::test]
    async fn null_price_is_a_duplicate() {
        let store = JsonStore::in_memory();
        store.upsert_batch(vec![listing("1", Some(500))]).await.unwrap();
        let stats = store.upsert_batch(vec![listing("1", None)]).await.unwrap();
        assert_eq!(stats.duplicate, 1);
        let a = store.get("1").await.unwrap().unwrap();
        assert_eq!(a.price, Some(500));
        assert_eq!(a.status, Status::New);
    }

    #[tokio::test]
    async fn mark_published_unknown_id_is_not_found() {
        let store = JsonStore::in_memory();
        let err = store
            .mark_published("nope", "vk", "1", Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, PersistenceError::NotFound(_)));
    }

    #[tokio::test]
    async fn failed_state_write_restores_only_that_entry() {
        let dir = tempfile::tempdir().unwrap();
        let state_dir = dir.path().join("state");
        let path = state_dir.join("announcements.json");
        let store = JsonStore::open(&path).await.unwrap();
        store
            .upsert_batch(vec![listing("1", Some(1000)), listing("2", Some(2000))])
            .await
            .unwrap();
        store.mark_published("1", "vk", "10", Utc::now()).await.unwrap();

        // One line of compact JSON, not a pretty-printed dump.
        let on_disk = std::fs::read_to_string(&path).unwrap();
        assert!(!on_disk.contains('\n'));

        std::fs::remove_dir_all(&state_dir).unwrap();
        std::fs::write(&state_dir, b"not a dir").unwrap();
        let err = store
            .mark_published("1", "telegram", "20", Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, PersistenceError::Io { .. }));

        let a = store.get("1").await.unwrap().unwrap();
        assert!(a.is_published_to("vk"));
        assert!(!a.channel_state.contains_key("telegram"));
        assert_eq!(store.pending_for_channel("telegram").await.unwrap().len(), 2);
    }

    #[test]
    fn tmp_path_sits_next_to_target() {
        assert_eq!(
            tmp_path(Path::new("state/announcements.json")),
            PathBuf::from("state/announcements.json.tmp")
        );
    }
}
