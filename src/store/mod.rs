pub mod keys;
pub mod rocks;

use std::path::Path;

use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::codec::{self, StoredAuction, StoredBid};
use crate::error::{ArchiveError, Result};
use crate::filter::Predicate;
use crate::metrics_const::{
    AUCTIONS_INSERTED, AUCTIONS_SKIPPED_EXISTING, BIDS_INSERTED, RETROFIT_APPLIED, RETROFIT_MISSED,
};
use crate::time_bucket;
use crate::types::{aggregate_prices, combine_versions, epoch, Auction, Bid, SummaryRecord};
use keys::{AuctionKey, BidKey};
use rocks::{BatchOp, RocksDbStore};

const AUCTIONS_CF: &str = "auctions";
const BY_UUID_CF: &str = "auctions_by_uuid";
const BY_SELLER_CF: &str = "auctions_by_seller";
const BY_ITEM_UID_CF: &str = "auctions_by_item_uid";
const BY_BIDDER_CF: &str = "auctions_by_bidder";
const BIDS_CF: &str = "bids";
const BIDS_BY_AUCTION_CF: &str = "bids_by_auction";
const SUMMARIES_CF: &str = "summaries";

const ALL_CFS: &[&str] = &[
    AUCTIONS_CF,
    BY_UUID_CF,
    BY_SELLER_CF,
    BY_ITEM_UID_CF,
    BY_BIDDER_CF,
    BIDS_CF,
    BIDS_BY_AUCTION_CF,
    SUMMARIES_CF,
];

/// How far back a "sold" event may reach for its matching "listed" row.
const RETROFIT_WINDOW: Duration = Duration::days(14);
const SELLER_LOOKBACK: Duration = Duration::days(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    SkippedExisting,
}

/// The live tier: auction and bid tables plus their secondary indexes over
/// one embedded wide-column store. Partitioning follows `(tag, time_key)`
/// with `(is_sold, end DESC, uuid DESC)` clustering, so tag-scoped
/// time-range scans touch exactly the buckets they need.
#[derive(Debug, Clone)]
pub struct HotStore {
    db: RocksDbStore,
}

impl HotStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self {
            db: RocksDbStore::open(path, ALL_CFS)?,
        })
    }

    fn primary_key(stored: &StoredAuction) -> AuctionKey {
        AuctionKey {
            tag: stored.tag.clone(),
            time_key: stored.time_key,
            is_sold: stored.is_sold,
            end_millis: stored.end,
            uuid: stored.uuid,
        }
    }

    fn index_ops(stored: &StoredAuction, primary: &[u8], ops: &mut Vec<BatchOp>) {
        ops.push(BatchOp::Put {
            cf: BY_UUID_CF,
            key: keys::by_uuid_key(&stored.uuid, primary),
            value: primary.to_vec(),
        });
        ops.push(BatchOp::Put {
            cf: BY_SELLER_CF,
            key: keys::by_seller_key(&stored.seller, stored.end, &stored.uuid),
            value: primary.to_vec(),
        });
        ops.push(BatchOp::Put {
            cf: BY_ITEM_UID_CF,
            key: keys::by_item_uid_key(stored.item_uid, &stored.uuid),
            value: primary.to_vec(),
        });
        ops.push(BatchOp::Put {
            cf: BY_BIDDER_CF,
            key: keys::by_bidder_key(&stored.highest_bidder, &stored.uuid),
            value: primary.to_vec(),
        });
    }

    fn bid_ops(bids: &[StoredBid], ops: &mut Vec<BatchOp>) -> Result<()> {
        for bid in bids {
            let bid_key = BidKey {
                bidder: bid.bidder,
                timestamp_millis: bid.timestamp,
                auction_uuid: bid.auction_uuid,
                amount: bid.amount,
            }
            .encode();
            ops.push(BatchOp::Put {
                cf: BIDS_CF,
                key: bid_key.clone(),
                value: codec::encode_bid(bid)?,
            });
            ops.push(BatchOp::Put {
                cf: BIDS_BY_AUCTION_CF,
                key: keys::bids_by_auction_key(&bid.auction_uuid, &bid_key),
                value: bid_key,
            });
        }
        Ok(())
    }

    /// True when a row already occupies the coordinate with the same seller,
    /// which is the idempotency contract for at-least-once delivery.
    fn exists_with_seller(&self, key: &AuctionKey, seller: &Uuid) -> Result<bool> {
        match self.db.get(AUCTIONS_CF, &key.encode())? {
            Some(bytes) => Ok(codec::decode_value(&bytes)?.seller == *seller),
            None => Ok(false),
        }
    }

    /// Inserts one auction with its bids as a single atomic batch. A
    /// duplicate delivery of the same row is skipped.
    pub fn insert(&self, auction: &Auction, now: DateTime<Utc>) -> Result<InsertOutcome> {
        let stored = codec::encode(auction, now);
        let key = Self::primary_key(&stored);
        if self.exists_with_seller(&key, &stored.seller)? {
            metrics::counter!(AUCTIONS_SKIPPED_EXISTING).increment(1);
            return Ok(InsertOutcome::SkippedExisting);
        }

        let primary = key.encode();
        let mut ops = vec![BatchOp::Put {
            cf: AUCTIONS_CF,
            key: primary.clone(),
            value: codec::encode_value(&stored)?,
        }];
        Self::index_ops(&stored, &primary, &mut ops);
        Self::bid_ops(&stored.bids, &mut ops)?;
        self.db.apply(ops)?;
        metrics::counter!(AUCTIONS_INSERTED).increment(1);
        Ok(InsertOutcome::Inserted)
    }

    /// Micro-batch insert for ingest: every record must share one tag, sparse
    /// "sold" records are retrofitted from their earlier "listed" versions,
    /// and the whole group lands in one write batch.
    pub fn insert_batch_same_tag(
        &self,
        mut batch: Vec<Auction>,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let Some(first_tag) = batch.first().map(|a| a.tag.clone()) else {
            return Ok(0);
        };
        if batch.iter().any(|a| a.tag != first_tag) {
            return Err(ArchiveError::InvalidInput(format!(
                "mixed tags in single-tag batch (expected {first_tag})"
            )));
        }

        for auction in &mut batch {
            self.retrofit(auction, now)?;
        }

        let mut ops = Vec::new();
        let mut inserted = 0usize;
        for auction in &batch {
            let stored = codec::encode(auction, now);
            let key = Self::primary_key(&stored);
            if self.exists_with_seller(&key, &stored.seller)? {
                metrics::counter!(AUCTIONS_SKIPPED_EXISTING).increment(1);
                continue;
            }
            let primary = key.encode();
            ops.push(BatchOp::Put {
                cf: AUCTIONS_CF,
                key: primary.clone(),
                value: codec::encode_value(&stored)?,
            });
            Self::index_ops(&stored, &primary, &mut ops);
            Self::bid_ops(&stored.bids, &mut ops)?;
            inserted += 1;
        }
        if !ops.is_empty() {
            self.db.apply(ops)?;
        }
        metrics::counter!(AUCTIONS_INSERTED).increment(inserted as u64);
        Ok(inserted)
    }

    /// Standalone bid rows (the backfill flattens bids out of their auctions
    /// and writes them grouped by bidder).
    pub fn insert_bids(&self, bids: &[Bid]) -> Result<()> {
        let stored: Vec<StoredBid> = bids
            .iter()
            .map(|b| StoredBid {
                auction_uuid: b.auction_uuid,
                bidder: b.bidder,
                profile_id: b.profile_id.unwrap_or(b.bidder),
                amount: b.amount,
                timestamp: codec::millis(b.timestamp),
            })
            .collect();
        let mut ops = Vec::new();
        Self::bid_ops(&stored, &mut ops)?;
        self.db.apply(ops)?;
        metrics::counter!(BIDS_INSERTED).increment(stored.len() as u64);
        Ok(())
    }

    /// Fills listing metadata into a sparse "sold" record from a prior
    /// "listed" version of the same auction in a nearby bucket. Best effort:
    /// a miss is logged and counted, never fatal.
    fn retrofit(&self, auction: &mut Auction, now: DateTime<Utc>) -> Result<()> {
        if auction.start != epoch() || auction.end <= now - RETROFIT_WINDOW {
            return Ok(());
        }
        let current = time_bucket::bucket(&auction.tag, now);
        let window = (current - 1)..=(current + 2);
        let earlier = self
            .get_stored_by_uuid(&auction.uuid)?
            .into_iter()
            .find(|s| s.start != 0 && window.contains(&s.time_key));

        match earlier {
            Some(listed) => {
                auction.start = codec::from_millis(listed.start);
                if auction.count == 0 {
                    auction.count = listed.count;
                }
                if auction.item_created_at == epoch() {
                    auction.item_created_at = codec::from_millis(listed.item_created_at);
                }
                if auction.item_name.is_empty() {
                    auction.item_name = listed.item_name;
                }
                if auction.profile_id.is_nil() {
                    auction.profile_id = listed.profile_id;
                }
                if auction.starting_bid == 0 {
                    auction.starting_bid = listed.starting_bid;
                }
                auction.bin |= listed.bin;
                metrics::counter!(RETROFIT_APPLIED).increment(1);
            }
            None => {
                metrics::counter!(RETROFIT_MISSED).increment(1);
                debug!(auction = %auction.uuid, tag = %auction.tag, "no listed version to retrofit from");
            }
        }
        Ok(())
    }

    /// Tag-scoped time-range scan: buckets walked newest-first, each bucket
    /// clustered newest-first, stopping at `limit`.
    pub fn range(
        &self,
        tag: &str,
        t0: DateTime<Utc>,
        t1: DateTime<Utc>,
        is_sold: Option<bool>,
        limit: usize,
    ) -> Result<Vec<Auction>> {
        Ok(self
            .range_stored(tag, t0, t1, is_sold, limit)?
            .into_iter()
            .map(codec::decode)
            .collect())
    }

    pub fn range_stored(
        &self,
        tag: &str,
        t0: DateTime<Utc>,
        t1: DateTime<Utc>,
        is_sold: Option<bool>,
        limit: usize,
    ) -> Result<Vec<StoredAuction>> {
        let t0_ms = codec::millis(t0);
        let t1_ms = codec::millis(t1);
        let b0 = time_bucket::bucket_floor(tag, t0);
        let b1 = time_bucket::bucket_floor(tag, t1);

        let mut out: Vec<StoredAuction> = Vec::new();
        for b in (b0..=b1).rev() {
            let mut per_bucket: Vec<StoredAuction> = Vec::new();
            for sold in sold_states(is_sold) {
                let prefix = AuctionKey::prefix(tag, b, sold);
                for (key_bytes, value) in self.db.scan_prefix(AUCTIONS_CF, &prefix, usize::MAX)? {
                    let key = AuctionKey::decode(&key_bytes)?;
                    if key.end_millis > t1_ms {
                        continue;
                    }
                    // clustering is end-descending: nothing older follows
                    if key.end_millis <= t0_ms {
                        break;
                    }
                    per_bucket.push(codec::decode_value(&value)?);
                }
            }
            per_bucket.sort_by_key(|s| std::cmp::Reverse(s.end));
            for stored in per_bucket {
                out.push(stored);
                if out.len() >= limit {
                    return Ok(out);
                }
            }
        }
        Ok(out)
    }

    fn get_stored_by_uuid(&self, uuid: &Uuid) -> Result<Vec<StoredAuction>> {
        let entries = self
            .db
            .scan_prefix(BY_UUID_CF, &keys::by_uuid_prefix(uuid), usize::MAX)?;
        let primary_keys: Vec<Vec<u8>> = entries.into_iter().map(|(_, v)| v).collect();
        if primary_keys.is_empty() {
            return Ok(vec![]);
        }
        let rows = self.db.multi_get(AUCTIONS_CF, &primary_keys)?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows.into_iter().flatten() {
            out.push(codec::decode_value(&row)?);
        }
        Ok(out)
    }

    /// Every stored version of an auction; both the "listed" and the "sold"
    /// ingestion of one auction may be present.
    pub fn get_by_uuid(&self, uuid: &Uuid) -> Result<Vec<Auction>> {
        Ok(self
            .get_stored_by_uuid(uuid)?
            .into_iter()
            .map(codec::decode)
            .collect())
    }

    pub fn get_combined(&self, uuid: &Uuid) -> Result<Option<Auction>> {
        Ok(combine_versions(self.get_by_uuid(uuid)?))
    }

    /// Every auction of one physical item, via the numeric item uid derived
    /// from NBT.
    pub fn get_by_item_uid(&self, item_uid: i64, limit: usize) -> Result<Vec<Auction>> {
        let mut prefix = Vec::with_capacity(8);
        prefix.extend_from_slice(&(item_uid as u64).to_be_bytes());
        let entries = self.db.scan_prefix(BY_ITEM_UID_CF, &prefix, limit)?;
        let primary_keys: Vec<Vec<u8>> = entries.into_iter().map(|(_, v)| v).collect();
        if primary_keys.is_empty() {
            return Ok(vec![]);
        }
        let rows = self.db.multi_get(AUCTIONS_CF, &primary_keys)?;
        let mut out = Vec::new();
        for row in rows.into_iter().flatten() {
            out.push(codec::decode(codec::decode_value(&row)?));
        }
        Ok(out)
    }

    /// Auctions by a seller that ended within 30 days before `before`.
    pub fn recent_by_seller(
        &self,
        seller: &Uuid,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Auction>> {
        let before_ms = codec::millis(before);
        let floor_ms = codec::millis(before - SELLER_LOOKBACK);
        let seek = keys::by_seller_seek(seller, before_ms);
        let seller_prefix = seller.as_bytes().to_vec();

        let mut primary_keys = Vec::new();
        let mut cursor = seek;
        while primary_keys.len() < limit {
            let Some((key_bytes, value)) = self.db.first_at_or_after(BY_SELLER_CF, &cursor)? else {
                break;
            };
            if !key_bytes.starts_with(&seller_prefix) {
                break;
            }
            let end = keys::by_seller_end(&key_bytes)?;
            if end < floor_ms {
                break;
            }
            primary_keys.push(value);
            cursor = key_bytes;
            cursor.push(0);
        }
        if primary_keys.is_empty() {
            return Ok(vec![]);
        }

        let rows = self.db.multi_get(AUCTIONS_CF, &primary_keys)?;
        let mut out = Vec::new();
        for row in rows.into_iter().flatten() {
            out.push(codec::decode(codec::decode_value(&row)?));
        }
        Ok(out)
    }

    /// One day's price aggregate for a tag under a compiled filter, over sold
    /// auctions only.
    pub fn daily_aggregate(
        &self,
        tag: &str,
        filter: &Predicate,
        day_start: DateTime<Utc>,
    ) -> Result<crate::types::PriceSummary> {
        let rows = self.range(
            tag,
            day_start,
            day_start + Duration::days(1),
            Some(true),
            usize::MAX,
        )?;
        let prices: Vec<i64> = rows
            .iter()
            .filter(|a| filter(a))
            .map(|a| a.highest_bid_amount)
            .collect();
        Ok(aggregate_prices(&prices))
    }

    pub fn read_summaries(
        &self,
        tag: &str,
        filter_key: &str,
        after: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<SummaryRecord>> {
        let prefix = keys::summary_prefix(tag, filter_key);
        let mut out = Vec::new();
        for (key_bytes, value) in self.db.scan_prefix(SUMMARIES_CF, &prefix, usize::MAX)? {
            let day = keys::summary_day(&key_bytes)?;
            if day <= after.timestamp() || day > until.timestamp() {
                continue;
            }
            let (record, _): (SummaryRecord, _) =
                bincode::serde::decode_from_slice(&value, bincode::config::standard())
                    .context("corrupt summary row")?;
            out.push(record);
        }
        Ok(out)
    }

    /// Append-only per `(tag, filter_key, end_day)`; concurrent identical
    /// writes are harmless.
    pub fn write_summary(&self, record: &SummaryRecord) -> Result<()> {
        let key = keys::summary_key(&record.tag, &record.filter_key, record.end.timestamp());
        let value = bincode::serde::encode_to_vec(record, bincode::config::standard())
            .context("failed to serialize summary row")?;
        self.db.put(SUMMARIES_CF, &key, &value)?;
        Ok(())
    }

    /// Removes rows (plus index entries and bid rows) after a verified
    /// migration to the cold tier. Batched per call.
    pub fn delete_rows(&self, rows: &[StoredAuction]) -> Result<usize> {
        let mut ops = Vec::new();
        for stored in rows {
            let primary = Self::primary_key(stored).encode();
            ops.push(BatchOp::Delete {
                cf: AUCTIONS_CF,
                key: primary.clone(),
            });
            ops.push(BatchOp::Delete {
                cf: BY_UUID_CF,
                key: keys::by_uuid_key(&stored.uuid, &primary),
            });
            ops.push(BatchOp::Delete {
                cf: BY_SELLER_CF,
                key: keys::by_seller_key(&stored.seller, stored.end, &stored.uuid),
            });
            ops.push(BatchOp::Delete {
                cf: BY_ITEM_UID_CF,
                key: keys::by_item_uid_key(stored.item_uid, &stored.uuid),
            });
            ops.push(BatchOp::Delete {
                cf: BY_BIDDER_CF,
                key: keys::by_bidder_key(&stored.highest_bidder, &stored.uuid),
            });
            for bid in &stored.bids {
                let bid_key = BidKey {
                    bidder: bid.bidder,
                    timestamp_millis: bid.timestamp,
                    auction_uuid: bid.auction_uuid,
                    amount: bid.amount,
                }
                .encode();
                ops.push(BatchOp::Delete {
                    cf: BIDS_CF,
                    key: bid_key.clone(),
                });
                ops.push(BatchOp::Delete {
                    cf: BIDS_BY_AUCTION_CF,
                    key: keys::bids_by_auction_key(&bid.auction_uuid, &bid_key),
                });
            }
        }
        let count = rows.len();
        self.db.apply(ops)?;
        Ok(count)
    }

    /// Enumerates every tag with at least one row, by seeking past each tag
    /// partition instead of scanning it.
    pub fn distinct_tags(&self) -> Result<Vec<String>> {
        let mut tags = Vec::new();
        let mut cursor: Vec<u8> = Vec::new();
        while let Some((key_bytes, _)) = self.db.first_at_or_after(AUCTIONS_CF, &cursor)? {
            let Some(sep) = key_bytes.iter().position(|b| *b == 0) else {
                warn!("auction key without tag terminator, stopping tag scan");
                break;
            };
            let tag = String::from_utf8(key_bytes[..sep].to_vec())
                .map_err(|e| ArchiveError::Other(e.into()))?;
            // skip to the first key ordered after every key of this tag
            cursor = key_bytes[..sep].to_vec();
            cursor.push(1);
            tags.push(tag);
        }
        Ok(tags)
    }

    pub fn size_bytes(&self) -> Result<u64> {
        Ok(self.db.size_bytes(AUCTIONS_CF)?)
    }
}

fn sold_states(is_sold: Option<bool>) -> Vec<bool> {
    match is_sold {
        Some(v) => vec![v],
        None => vec![false, true],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn test_store() -> (HotStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = HotStore::open(dir.path()).unwrap();
        (store, dir)
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap()
    }

    fn sold_auction(tag: &str, end: DateTime<Utc>, amount: i64) -> Auction {
        let uuid = Uuid::new_v4();
        Auction {
            uuid,
            tag: tag.into(),
            item_name: "Test Item".into(),
            category: "WEAPON".into(),
            tier: "LEGENDARY".into(),
            bin: false,
            starting_bid: 100,
            highest_bid_amount: amount,
            seller: Uuid::new_v4(),
            profile_id: Uuid::new_v4(),
            coop_members: vec![],
            start: end - Duration::days(3),
            end,
            item_created_at: end - Duration::days(30),
            item_bytes: vec![],
            flat_nbt: BTreeMap::new(),
            enchantments: BTreeMap::new(),
            count: 1,
            bids: vec![Bid {
                auction_uuid: uuid,
                bidder: Uuid::new_v4(),
                profile_id: None,
                amount,
                timestamp: end,
            }],
        }
    }

    fn accept_all() -> Predicate {
        std::sync::Arc::new(|_: &Auction| true)
    }

    #[test]
    fn test_insert_then_get_by_uuid() {
        let (store, _dir) = test_store();
        let end = Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap();
        let auction = sold_auction("DIAMOND_SWORD", end, 1_000_000);

        assert_eq!(
            store.insert(&auction, now()).unwrap(),
            InsertOutcome::Inserted
        );
        let versions = store.get_by_uuid(&auction.uuid).unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].highest_bid_amount, 1_000_000);

        let combined = store.get_combined(&auction.uuid).unwrap().unwrap();
        assert_eq!(combined.bids.len(), 1);
    }

    #[test]
    fn test_duplicate_insert_is_skipped() {
        let (store, _dir) = test_store();
        let end = Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap();
        let auction = sold_auction("DIAMOND_SWORD", end, 500);

        store.insert(&auction, now()).unwrap();
        assert_eq!(
            store.insert(&auction, now()).unwrap(),
            InsertOutcome::SkippedExisting
        );
        assert_eq!(store.get_by_uuid(&auction.uuid).unwrap().len(), 1);
    }

    #[test]
    fn test_range_orders_newest_first_and_honors_limit() {
        let (store, _dir) = test_store();
        let base = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        for day in 0..5 {
            let a = sold_auction("HYPERION", base + Duration::days(day), 100 + day);
            store.insert(&a, now()).unwrap();
        }

        let rows = store
            .range(
                "HYPERION",
                base - Duration::hours(1),
                base + Duration::days(10),
                Some(true),
                3,
            )
            .unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows[0].end > rows[1].end && rows[1].end > rows[2].end);
        assert_eq!(rows[0].highest_bid_amount, 104);
    }

    #[test]
    fn test_range_excludes_lower_bound_includes_upper() {
        let (store, _dir) = test_store();
        let t = Utc.with_ymd_and_hms(2024, 6, 10, 12, 0, 0).unwrap();
        let a = sold_auction("HYPERION", t, 42);
        store.insert(&a, now()).unwrap();

        // (t0, t1] with t0 == end excludes the row
        assert!(store
            .range("HYPERION", t, t + Duration::hours(1), Some(true), 10)
            .unwrap()
            .is_empty());
        // t1 == end includes it
        assert_eq!(
            store
                .range("HYPERION", t - Duration::hours(1), t, Some(true), 10)
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn test_insert_batch_rejects_mixed_tags() {
        let (store, _dir) = test_store();
        let end = Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap();
        let batch = vec![
            sold_auction("HYPERION", end, 1),
            sold_auction("DIAMOND_SWORD", end, 2),
        ];
        assert!(matches!(
            store.insert_batch_same_tag(batch, now()),
            Err(ArchiveError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_retrofit_fills_sold_event_from_listed_version() {
        let (store, _dir) = test_store();
        let now = Utc::now();
        let end = now - Duration::days(1);

        // listed version carries full metadata
        let mut listed = sold_auction("HYPERION", end, 0);
        listed.bids.clear();
        listed.highest_bid_amount = 0;
        listed.starting_bid = 5_000;
        listed.item_name = "Hyperion".into();
        store.insert(&listed, now - Duration::days(2)).unwrap();

        // sold event for the same uuid arrives sparse
        let mut sold = listed.clone();
        sold.start = epoch();
        sold.item_created_at = epoch();
        sold.item_name = String::new();
        sold.starting_bid = 0;
        sold.profile_id = Uuid::nil();
        sold.highest_bid_amount = 9_000;
        sold.bids = vec![Bid {
            auction_uuid: sold.uuid,
            bidder: Uuid::new_v4(),
            profile_id: None,
            amount: 9_000,
            timestamp: end,
        }];

        store.insert_batch_same_tag(vec![sold.clone()], now).unwrap();

        let combined = store.get_combined(&listed.uuid).unwrap().unwrap();
        assert_eq!(combined.starting_bid, 5_000);
        assert_eq!(combined.item_name, "Hyperion");
        assert_ne!(combined.start, epoch());
        assert_eq!(combined.highest_bid_amount, 9_000);
    }

    #[test]
    fn test_recent_by_seller_window() {
        let (store, _dir) = test_store();
        let before = Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap();
        let seller = Uuid::new_v4();

        let mut recent = sold_auction("HYPERION", before - Duration::days(5), 10);
        recent.seller = seller;
        let mut old = sold_auction("HYPERION", before - Duration::days(45), 20);
        old.seller = seller;
        let mut future = sold_auction("HYPERION", before + Duration::days(1), 30);
        future.seller = seller;
        for a in [&recent, &old, &future] {
            store.insert(a, now()).unwrap();
        }

        let rows = store.recent_by_seller(&seller, before, 10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].uuid, recent.uuid);
    }

    #[test]
    fn test_daily_aggregate_counts_only_matching_sold_rows() {
        let (store, _dir) = test_store();
        let day = Utc.with_ymd_and_hms(2024, 6, 15, 0, 0, 0).unwrap();
        for amount in [100, 200, 300] {
            let a = sold_auction("HYPERION", day + Duration::hours(6), amount);
            store.insert(&a, now()).unwrap();
        }
        let summary = store
            .daily_aggregate("HYPERION", &accept_all(), day)
            .unwrap();
        assert_eq!(summary.volume, 3);
        assert_eq!(summary.max, 300);
        assert_eq!(summary.median, 200);
    }

    #[test]
    fn test_delete_rows_removes_row_and_indexes() {
        let (store, _dir) = test_store();
        let end = Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap();
        let auction = sold_auction("HYPERION", end, 777);
        store.insert(&auction, now()).unwrap();

        let stored = store
            .range_stored(
                "HYPERION",
                end - Duration::days(1),
                end + Duration::days(1),
                None,
                10,
            )
            .unwrap();
        assert_eq!(stored.len(), 1);

        store.delete_rows(&stored).unwrap();
        assert!(store.get_by_uuid(&auction.uuid).unwrap().is_empty());
        assert!(store
            .range("HYPERION", end - Duration::days(1), end + Duration::days(1), None, 10)
            .unwrap()
            .is_empty());
        assert!(store
            .recent_by_seller(&auction.seller, end + Duration::days(1), 10)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_get_by_item_uid_follows_the_item_across_auctions() {
        let (store, _dir) = test_store();
        let end = Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap();
        let mut first = sold_auction("HYPERION", end, 100);
        first
            .flat_nbt
            .insert("uid".to_string(), "deadbeef".to_string());
        let mut resold = sold_auction("HYPERION", end + Duration::days(3), 200);
        resold
            .flat_nbt
            .insert("uid".to_string(), "deadbeef".to_string());
        store.insert(&first, now()).unwrap();
        store.insert(&resold, now()).unwrap();

        let rows = store.get_by_item_uid(0xdeadbeef, 10).unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn test_distinct_tags_enumerates_each_once() {
        let (store, _dir) = test_store();
        let end = Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap();
        for tag in ["AXE", "AXE", "SWORD", "WAND"] {
            store.insert(&sold_auction(tag, end, 1), now()).unwrap();
        }
        let tags = store.distinct_tags().unwrap();
        assert_eq!(tags, vec!["AXE", "SWORD", "WAND"]);
    }

    #[test]
    fn test_summary_rows_roundtrip() {
        let (store, _dir) = test_store();
        let day = Utc.with_ymd_and_hms(2024, 6, 15, 0, 0, 0).unwrap();
        let record = SummaryRecord {
            tag: "HYPERION".into(),
            filter_key: "TierMYTHIC".into(),
            filters: BTreeMap::new(),
            start: day - Duration::days(1),
            end: day,
            max: 10,
            min: 1,
            median: 5,
            mean: 5,
            mode: 5,
            volume: 3,
        };
        store.write_summary(&record).unwrap();

        let rows = store
            .read_summaries(
                "HYPERION",
                "TierMYTHIC",
                day - Duration::days(7),
                day + Duration::days(1),
            )
            .unwrap();
        assert_eq!(rows, vec![record]);
    }
}
