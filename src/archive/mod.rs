pub mod migrator;
pub mod object_store;

use std::collections::{BTreeSet, HashMap};
use std::io::{Read, Write};
use std::sync::Arc;

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

use crate::bloom::BloomFilter;
use crate::codec::StoredAuction;
use crate::metrics_const::{COLD_LOOKUPS, COLD_MONTHS_WRITTEN};
use object_store::ObjectStore;

const MASTER_KEY: &str = "index/master_bloom_0.bin";

/// Sizing for the hierarchical bloom index: the master filter covers every
/// archived uuid, the per-tag filters narrow a positive hit to a handful of
/// month blobs.
#[derive(Debug, Clone, Copy)]
pub struct BloomSizing {
    pub master_capacity: u64,
    pub master_fpr: f64,
    pub tag_capacity: u64,
    pub tag_fpr: f64,
}

impl Default for BloomSizing {
    fn default() -> Self {
        BloomSizing {
            master_capacity: 100_000_000,
            master_fpr: 0.001,
            tag_capacity: 1_000_000,
            tag_fpr: 0.01,
        }
    }
}

/// Per-tag index object: the tag's bloom filter plus the months that have a
/// blob, persisted together under `index/{tag}/bloom.bin`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagIndex {
    pub filter: BloomFilter,
    pub months: BTreeSet<(i32, u32)>,
}

/// Object-store keys never contain path separators from the tag itself.
pub fn sanitize_tag(tag: &str) -> String {
    if tag.is_empty() {
        return "unknown".to_string();
    }
    tag.replace(['/', '\\'], "_")
}

fn blob_key(tag: &str, year: i32, month: u32) -> String {
    format!("auctions/{}/{}/{:02}.blob", sanitize_tag(tag), year, month)
}

fn tag_index_key(tag: &str) -> String {
    format!("index/{}/bloom.bin", sanitize_tag(tag))
}

/// Blob payload: bincode-packed rows behind an LZ4 size-prepended block,
/// gzipped on the outside.
fn encode_blob(rows: &[StoredAuction]) -> Result<Vec<u8>> {
    let packed = bincode::serde::encode_to_vec(rows, bincode::config::standard())
        .context("failed to pack month rows")?;
    let framed = lz4_flex::block::compress_prepend_size(&packed);
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&framed)?;
    Ok(encoder.finish()?)
}

fn decode_blob(bytes: &[u8]) -> Result<Vec<StoredAuction>> {
    let mut framed = Vec::new();
    GzDecoder::new(bytes)
        .read_to_end(&mut framed)
        .context("month blob is not valid gzip")?;
    let packed = lz4_flex::block::decompress_size_prepended(&framed)
        .context("month blob has a corrupt lz4 frame")?;
    let (rows, _) = bincode::serde::decode_from_slice(&packed, bincode::config::standard())
        .context("month blob rows failed to decode")?;
    Ok(rows)
}

/// The cold tier: immutable month-sized blobs per tag, found again through
/// the master and per-tag bloom filters.
///
/// Blob and filter writes are not transactional; a reader racing an update
/// may see the blob before the refreshed filter, which only affects the
/// lookup-by-uuid path and resolves on the next filter load.
#[derive(Debug)]
pub struct ColdStore {
    objects: Arc<dyn ObjectStore>,
    sizing: BloomSizing,
    master: RwLock<Option<BloomFilter>>,
    tag_indexes: RwLock<HashMap<String, TagIndex>>,
    tag_locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ColdStore {
    pub fn new(objects: Arc<dyn ObjectStore>) -> Self {
        Self::with_sizing(objects, BloomSizing::default())
    }

    pub fn with_sizing(objects: Arc<dyn ObjectStore>, sizing: BloomSizing) -> Self {
        ColdStore {
            objects,
            sizing,
            master: RwLock::new(None),
            tag_indexes: RwLock::new(HashMap::new()),
            tag_locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    fn tag_lock(&self, tag: &str) -> Arc<Mutex<()>> {
        self.tag_locks
            .lock()
            .expect("tag lock registry poisoned")
            .entry(sanitize_tag(tag))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn load_master(&self) -> Result<BloomFilter> {
        if let Some(master) = self.master.read().await.clone() {
            return Ok(master);
        }
        let loaded = match self.objects.get(MASTER_KEY).await? {
            Some(bytes) => BloomFilter::deserialize(&bytes)?,
            None => BloomFilter::with_capacity(self.sizing.master_capacity, self.sizing.master_fpr),
        };
        *self.master.write().await = Some(loaded.clone());
        Ok(loaded)
    }

    async fn load_tag_index(&self, tag: &str) -> Result<Option<TagIndex>> {
        let sanitized = sanitize_tag(tag);
        if let Some(index) = self.tag_indexes.read().await.get(&sanitized) {
            return Ok(Some(index.clone()));
        }
        match self.objects.get(&tag_index_key(tag)).await? {
            Some(bytes) => {
                let (index, _): (TagIndex, _) =
                    bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                        .context("corrupt tag index")?;
                self.tag_indexes
                    .write()
                    .await
                    .insert(sanitized, index.clone());
                Ok(Some(index))
            }
            None => Ok(None),
        }
    }

    async fn persist_tag_index(&self, tag: &str, index: &TagIndex) -> Result<()> {
        let bytes = bincode::serde::encode_to_vec(index, bincode::config::standard())
            .context("failed to serialize tag index")?;
        self.objects
            .put(&tag_index_key(tag), bytes, &HashMap::new())
            .await?;
        self.tag_indexes
            .write()
            .await
            .insert(sanitize_tag(tag), index.clone());
        Ok(())
    }

    /// Seals one `(tag, month)` of rows into an immutable blob and unions the
    /// uuids into both bloom levels. Per-tag updates are serialized in
    /// process; across processes the filter objects are last-writer-wins.
    pub async fn store_month(
        &self,
        tag: &str,
        year: i32,
        month: u32,
        rows: &[StoredAuction],
    ) -> Result<()> {
        let guard = self.tag_lock(tag);
        let _held = guard.lock().await;

        let body = encode_blob(rows)?;
        let metadata = HashMap::from([
            ("count".to_string(), rows.len().to_string()),
            ("tag".to_string(), sanitize_tag(tag)),
            ("year".to_string(), year.to_string()),
            ("month".to_string(), month.to_string()),
        ]);
        self.objects
            .put(&blob_key(tag, year, month), body, &metadata)
            .await?;

        // the month's uuids are hashed once into a delta per filter level,
        // then OR-ed into the existing filters
        let mut tag_delta =
            BloomFilter::with_capacity(self.sizing.tag_capacity, self.sizing.tag_fpr);
        let mut master_delta =
            BloomFilter::with_capacity(self.sizing.master_capacity, self.sizing.master_fpr);
        for row in rows {
            tag_delta.add(&row.uuid);
            master_delta.add(&row.uuid);
        }

        let mut index = self.load_tag_index(tag).await?.unwrap_or_else(|| TagIndex {
            filter: BloomFilter::with_capacity(self.sizing.tag_capacity, self.sizing.tag_fpr),
            months: BTreeSet::new(),
        });
        index.filter.merge(&tag_delta)?;
        index.months.insert((year, month));
        self.persist_tag_index(tag, &index).await?;

        // the master filter is shared across tags, so the write lock spans
        // load, union and persist to keep concurrent tag seals from losing
        // each other's bits
        {
            let mut master_guard = self.master.write().await;
            let mut master = match master_guard.take() {
                Some(master) => master,
                None => match self.objects.get(MASTER_KEY).await? {
                    Some(bytes) => BloomFilter::deserialize(&bytes)?,
                    None => BloomFilter::with_capacity(
                        self.sizing.master_capacity,
                        self.sizing.master_fpr,
                    ),
                },
            };
            master.merge(&master_delta)?;
            self.objects
                .put(MASTER_KEY, master.serialize()?, &HashMap::new())
                .await?;
            *master_guard = Some(master);
        }

        metrics::counter!(COLD_MONTHS_WRITTEN).increment(1);
        info!(tag, year, month, rows = rows.len(), "sealed month into cold store");
        Ok(())
    }

    /// The whole month, or empty when no blob exists.
    pub async fn get_month(&self, tag: &str, year: i32, month: u32) -> Result<Vec<StoredAuction>> {
        match self.objects.get(&blob_key(tag, year, month)).await? {
            Some(bytes) => decode_blob(&bytes),
            None => Ok(vec![]),
        }
    }

    pub async fn month_exists(&self, tag: &str, year: i32, month: u32) -> Result<bool> {
        self.objects.exists(&blob_key(tag, year, month)).await
    }

    /// Archived months for a tag, oldest first.
    pub async fn months(&self, tag: &str) -> Result<Vec<(i32, u32)>> {
        Ok(self
            .load_tag_index(tag)
            .await?
            .map(|index| index.months.into_iter().collect())
            .unwrap_or_default())
    }

    /// Master-filter check only. `false` is authoritative; `true` still
    /// needs the per-tag narrowing of [`ColdStore::lookup`].
    pub async fn may_contain(&self, uuid: &Uuid) -> Result<bool> {
        Ok(self.load_master().await?.may_contain(uuid))
    }

    /// Every tag that has an index object, discovered from the store so other
    /// writer processes' tags are visible too.
    async fn known_tags(&self) -> Result<Vec<String>> {
        let mut tags: BTreeSet<String> = self.tag_indexes.read().await.keys().cloned().collect();
        for key in self.objects.list("index/").await? {
            if let Some(tag) = key
                .strip_prefix("index/")
                .and_then(|rest| rest.strip_suffix("/bloom.bin"))
            {
                tags.insert(tag.to_string());
            }
        }
        Ok(tags.into_iter().collect())
    }

    /// Point lookup across the whole archive: master filter, then per-tag
    /// filters, then newest-first blob scans of the months a matching tag
    /// has. Returns every stored version found for the uuid.
    pub async fn lookup(&self, uuid: &Uuid) -> Result<Vec<StoredAuction>> {
        metrics::counter!(COLD_LOOKUPS).increment(1);
        if !self.may_contain(uuid).await? {
            return Ok(vec![]);
        }
        for tag in self.known_tags().await? {
            let Some(index) = self.load_tag_index(&tag).await? else {
                continue;
            };
            if !index.filter.may_contain(uuid) {
                continue;
            }
            let mut found = Vec::new();
            for (year, month) in index.months.iter().rev() {
                match self.get_month(&tag, *year, *month).await {
                    Ok(rows) => {
                        found.extend(rows.into_iter().filter(|r| r.uuid == *uuid));
                    }
                    Err(err) => {
                        warn!(tag, year, month, "failed to scan month blob: {err:#}");
                    }
                }
            }
            if !found.is_empty() {
                return Ok(found);
            }
        }
        Ok(vec![])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::object_store::LocalObjectStore;
    use crate::codec::{encode, StoredAuction};
    use crate::types::{Auction, Bid};
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn test_sizing() -> BloomSizing {
        BloomSizing {
            master_capacity: 10_000,
            master_fpr: 0.001,
            tag_capacity: 1_000,
            tag_fpr: 0.01,
        }
    }

    fn cold_store(dir: &TempDir) -> ColdStore {
        let objects = Arc::new(LocalObjectStore::new(dir.path()).unwrap());
        ColdStore::with_sizing(objects, test_sizing())
    }

    fn stored(tag: &str, day: u32) -> StoredAuction {
        let uuid = Uuid::new_v4();
        let end = Utc.with_ymd_and_hms(2023, 1, day, 12, 0, 0).unwrap();
        let auction = Auction {
            uuid,
            tag: tag.into(),
            item_name: "Item".into(),
            category: "MISC".into(),
            tier: "RARE".into(),
            bin: false,
            starting_bid: 10,
            highest_bid_amount: 100,
            seller: Uuid::new_v4(),
            profile_id: Uuid::new_v4(),
            coop_members: vec![],
            start: end - chrono::Duration::days(1),
            end,
            item_created_at: end,
            item_bytes: vec![],
            flat_nbt: BTreeMap::new(),
            enchantments: BTreeMap::new(),
            count: 1,
            bids: vec![Bid {
                auction_uuid: uuid,
                bidder: Uuid::new_v4(),
                profile_id: None,
                amount: 100,
                timestamp: end,
            }],
        };
        encode(&auction, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
    }

    #[test]
    fn test_sanitize_tag() {
        assert_eq!(sanitize_tag("ENCHANTED_BOOK"), "ENCHANTED_BOOK");
        assert_eq!(sanitize_tag("a/b\\c"), "a_b_c");
        assert_eq!(sanitize_tag(""), "unknown");
    }

    #[test]
    fn test_blob_roundtrip() {
        let rows = vec![stored("X", 1), stored("X", 2)];
        let decoded = decode_blob(&encode_blob(&rows).unwrap()).unwrap();
        assert_eq!(decoded, rows);
    }

    #[tokio::test]
    async fn test_store_month_then_get_month() {
        let dir = TempDir::new().unwrap();
        let cold = cold_store(&dir);
        let rows = vec![stored("X", 1), stored("X", 2)];

        assert!(!cold.month_exists("X", 2023, 1).await.unwrap());
        cold.store_month("X", 2023, 1, &rows).await.unwrap();
        assert!(cold.month_exists("X", 2023, 1).await.unwrap());

        let read_back = cold.get_month("X", 2023, 1).await.unwrap();
        assert_eq!(read_back, rows);
        assert_eq!(cold.months("X").await.unwrap(), vec![(2023, 1)]);
        // absent months read as empty
        assert!(cold.get_month("X", 2023, 2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lookup_through_bloom_hierarchy() {
        let dir = TempDir::new().unwrap();
        let cold = cold_store(&dir);
        let rows = vec![stored("X", 1), stored("X", 2)];
        let other = vec![stored("Y", 3)];
        cold.store_month("X", 2023, 1, &rows).await.unwrap();
        cold.store_month("Y", 2023, 1, &other).await.unwrap();

        let hit = cold.lookup(&rows[1].uuid).await.unwrap();
        assert_eq!(hit.len(), 1);
        assert_eq!(hit[0], rows[1]);

        assert!(cold.lookup(&Uuid::new_v4()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_filters_survive_process_restart() {
        let dir = TempDir::new().unwrap();
        let rows = vec![stored("X", 1)];
        cold_store(&dir)
            .store_month("X", 2023, 1, &rows)
            .await
            .unwrap();

        // a fresh instance over the same objects reloads both filter levels
        let reopened = cold_store(&dir);
        assert!(reopened.may_contain(&rows[0].uuid).await.unwrap());
        let hit = reopened.lookup(&rows[0].uuid).await.unwrap();
        assert_eq!(hit.len(), 1);
    }
}
