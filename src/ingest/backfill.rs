use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use sqlx::{PgPool, Row};
use tracing::{info, warn};
use uuid::Uuid;

use crate::cache::{migration_offset_key, CacheClient};
use crate::ingest::offset::ImportOffset;
use crate::ingest::queue::{WorkItem, WorkQueue};
use crate::store::HotStore;
use crate::types::{Auction, Bid};

/// Rows per page of the source database.
pub const PAGE_SIZE: i64 = 2_500;
/// Auctions per single-tag micro-batch.
const TAG_BATCH: usize = 12;
/// Bids per single-bidder micro-batch.
const BIDDER_BATCH: usize = 3;
/// The checkpoint trails the enqueue frontier by this many pages so it can
/// never pass in-flight work.
const CHECKPOINT_LAG_PAGES: i64 = 5;

const AUCTION_QUEUE_HIGH_WATERMARK: i64 = 500;
const BID_QUEUE_HIGH_WATERMARK: i64 = 200;

/// Pages the legacy relational store into the hot store by primary-key
/// windows, micro-batching per tag and per bidder onto the work queues.
/// Restart picks up from the persisted offset.
pub struct HistoricalMigrator {
    pool: PgPool,
    hot: Arc<HotStore>,
    auction_queue: WorkQueue,
    bid_queue: WorkQueue,
    offset: Arc<ImportOffset>,
    cache: Arc<dyn CacheClient>,
    page_size: i64,
}

impl HistoricalMigrator {
    pub fn new(
        pool: PgPool,
        hot: Arc<HotStore>,
        auction_queue: WorkQueue,
        bid_queue: WorkQueue,
        offset: Arc<ImportOffset>,
        cache: Arc<dyn CacheClient>,
    ) -> Self {
        Self {
            pool,
            hot,
            auction_queue,
            bid_queue,
            offset,
            cache,
            page_size: PAGE_SIZE,
        }
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        let max_id: Option<i64> = sqlx::query_scalar("SELECT MAX(id) FROM auctions")
            .fetch_one(&self.pool)
            .await?;
        let Some(max_id) = max_id else {
            info!("source database is empty, nothing to backfill");
            return Ok(());
        };

        let mut window_start = self.offset.get();
        let mut rows_enqueued: i64 = 0;
        info!(from = window_start, to = max_id, "historical backfill starting");

        while window_start <= max_id {
            let window_end = window_start + self.page_size;
            let page = self.fetch_page(window_start, window_end).await?;
            rows_enqueued += page.len() as i64;
            self.enqueue_page(page, window_end);
            window_start = window_end;
            self.apply_backpressure().await;
        }

        if let Err(err) = self
            .cache
            .set_i64(&migration_offset_key("auctions"), rows_enqueued)
            .await
        {
            warn!("failed to record migration row count: {err}");
        }
        info!(
            offset = self.offset.get(),
            rows = rows_enqueued,
            "historical backfill caught up"
        );
        Ok(())
    }

    async fn fetch_page(&self, from: i64, to: i64) -> anyhow::Result<Vec<Auction>> {
        let rows = sqlx::query(
            r#"SELECT a.id, a.uuid, a.tag, a.item_name, a.category, a.tier, a.bin,
                      a.starting_bid, a.highest_bid_amount, a.seller, a.profile_id,
                      a.coop_members, a.start, a."end", a.item_created_at, a.item_bytes,
                      a.flat_nbt, a.enchantments, a.count
               FROM auctions a
               WHERE a.id >= $1 AND a.id < $2
               ORDER BY a.id"#,
        )
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        let mut auctions = Vec::with_capacity(rows.len());
        let mut source_ids = Vec::with_capacity(rows.len());
        for row in rows {
            match Self::auction_from_row(&row) {
                Ok((source_id, auction)) => {
                    source_ids.push(source_id);
                    auctions.push(auction);
                }
                Err(err) => warn!("skipping unreadable source row: {err:#}"),
            }
        }

        if !source_ids.is_empty() {
            let bid_rows = sqlx::query(
                r#"SELECT b.auction_id, b.bidder, b.profile_id, b.amount, b.timestamp
                   FROM bids b
                   WHERE b.auction_id = ANY($1)"#,
            )
            .bind(&source_ids)
            .fetch_all(&self.pool)
            .await?;

            let mut by_auction: HashMap<i64, Vec<Bid>> = HashMap::new();
            let id_to_uuid: HashMap<i64, Uuid> = source_ids
                .iter()
                .zip(auctions.iter())
                .map(|(id, a)| (*id, a.uuid))
                .collect();
            for row in bid_rows {
                let auction_id: i64 = row.get("auction_id");
                let Some(auction_uuid) = id_to_uuid.get(&auction_id) else {
                    continue;
                };
                by_auction.entry(auction_id).or_default().push(Bid {
                    auction_uuid: *auction_uuid,
                    bidder: row.get("bidder"),
                    profile_id: row.get("profile_id"),
                    amount: row.get("amount"),
                    timestamp: row.get::<DateTime<Utc>, _>("timestamp"),
                });
            }
            for (id, auction) in source_ids.iter().zip(auctions.iter_mut()) {
                if let Some(bids) = by_auction.remove(id) {
                    auction.bids = bids;
                }
            }
        }

        Ok(auctions)
    }

    fn auction_from_row(row: &sqlx::postgres::PgRow) -> anyhow::Result<(i64, Auction)> {
        let coop_raw: Option<serde_json::Value> = row.try_get("coop_members")?;
        let flat_nbt_raw: Option<serde_json::Value> = row.try_get("flat_nbt")?;
        let enchant_raw: Option<serde_json::Value> = row.try_get("enchantments")?;
        let auction = Auction {
            uuid: row.try_get("uuid")?,
            tag: row
                .try_get::<Option<String>, _>("tag")?
                .unwrap_or_else(|| "unknown".to_string()),
            item_name: row.try_get::<Option<String>, _>("item_name")?.unwrap_or_default(),
            category: row.try_get::<Option<String>, _>("category")?.unwrap_or_default(),
            tier: row.try_get::<Option<String>, _>("tier")?.unwrap_or_default(),
            bin: row.try_get("bin")?,
            starting_bid: row.try_get("starting_bid")?,
            highest_bid_amount: row.try_get("highest_bid_amount")?,
            seller: row.try_get("seller")?,
            profile_id: row
                .try_get::<Option<Uuid>, _>("profile_id")?
                .unwrap_or(Uuid::nil()),
            coop_members: coop_raw
                .map(serde_json::from_value)
                .transpose()?
                .unwrap_or_default(),
            start: row.try_get("start")?,
            end: row.try_get("end")?,
            item_created_at: row.try_get("item_created_at")?,
            item_bytes: row
                .try_get::<Option<Vec<u8>>, _>("item_bytes")?
                .unwrap_or_default(),
            flat_nbt: flat_nbt_raw
                .map(serde_json::from_value::<BTreeMap<String, String>>)
                .transpose()?
                .unwrap_or_default(),
            enchantments: enchant_raw
                .map(serde_json::from_value::<BTreeMap<String, i32>>)
                .transpose()?
                .unwrap_or_default(),
            count: row.try_get("count")?,
            bids: vec![],
        };
        Ok((row.try_get("id")?, auction))
    }

    /// Turns one page into queue work: per-tag auction micro-batches, then
    /// per-bidder bid micro-batches, then the trailing checkpoint thunk.
    fn enqueue_page(&self, page: Vec<Auction>, window_end: i64) {
        let mut bids: Vec<Bid> = Vec::new();
        let mut by_tag: HashMap<String, Vec<Auction>> = HashMap::new();
        for auction in page {
            bids.extend(auction.bids.iter().cloned());
            by_tag.entry(auction.tag.clone()).or_default().push(auction);
        }

        for (_, group) in by_tag {
            for chunk in group.chunks(TAG_BATCH) {
                let hot = self.hot.clone();
                let batch: Vec<Auction> = chunk.to_vec();
                self.auction_queue.enqueue(WorkItem::new("backfill_auctions", move || {
                    let hot = hot.clone();
                    let batch = batch.clone();
                    async move {
                        hot.insert_batch_same_tag(batch, Utc::now())?;
                        Ok(())
                    }
                    .boxed()
                }));
            }
        }

        let mut by_bidder: HashMap<Uuid, Vec<Bid>> = HashMap::new();
        for bid in bids {
            by_bidder.entry(bid.bidder).or_default().push(bid);
        }
        for (_, group) in by_bidder {
            for chunk in group.chunks(BIDDER_BATCH) {
                let hot = self.hot.clone();
                let batch: Vec<Bid> = chunk.to_vec();
                self.bid_queue.enqueue(WorkItem::new("backfill_bids", move || {
                    let hot = hot.clone();
                    let batch = batch.clone();
                    async move {
                        hot.insert_bids(&batch)?;
                        Ok(())
                    }
                    .boxed()
                }));
            }
        }

        // the checkpoint runs after the page's inserts were enqueued and
        // trails by five pages, so a crash never skips in-flight rows
        let checkpoint = (window_end - CHECKPOINT_LAG_PAGES * self.page_size).max(0);
        let offset = self.offset.clone();
        self.auction_queue.enqueue(WorkItem::new("backfill_checkpoint", move || {
            let offset = offset.clone();
            async move {
                offset.set(checkpoint).await;
                Ok(())
            }
            .boxed()
        }));
    }

    /// Brief pauses while either queue is over its high-watermark keep the
    /// pager from outrunning the insert workers.
    async fn apply_backpressure(&self) {
        while self.auction_queue.depth() > AUCTION_QUEUE_HIGH_WATERMARK
            || self.bid_queue.depth() > BID_QUEUE_HIGH_WATERMARK
        {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}
