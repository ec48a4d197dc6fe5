pub mod tier;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, DurationRound, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::archive::ColdStore;
use crate::codec;
use crate::error::{ArchiveError, Result};
use crate::filter::{self, Predicate};
use crate::metrics_const::{SUMMARY_DAYS_CACHED, SUMMARY_DAYS_COMPUTED};
use crate::players::PlayerNameApi;
use crate::store::HotStore;
use crate::types::{combine_versions, Auction, AuctionPreview, PriceSummary, SummaryRecord};
use tier::TierRouter;

const OVERVIEW_SIZE: usize = 12;
const OVERVIEW_FALLBACK: Duration = Duration::days(14);
const SUMMARY_DEFAULT_WINDOW: Duration = Duration::days(7);

/// Read side of the service: fans queries out over the right buckets and
/// tiers, applies compiled filters, and memoizes daily aggregates so a
/// repeated price query becomes a single partition read.
#[derive(Debug, Clone)]
pub struct QueryEngine {
    hot: Arc<HotStore>,
    cold: Option<Arc<ColdStore>>,
    router: TierRouter,
    players: Arc<dyn PlayerNameApi>,
}

impl QueryEngine {
    pub fn new(
        hot: Arc<HotStore>,
        cold: Option<Arc<ColdStore>>,
        players: Arc<dyn PlayerNameApi>,
        retention_months: u32,
    ) -> Self {
        let router = TierRouter::new(hot.clone(), cold.clone(), retention_months);
        Self {
            hot,
            cold,
            router,
            players,
        }
    }

    /// Every stored version of an auction, spanning both tiers.
    pub async fn versions(&self, uuid: &Uuid) -> Result<Vec<Auction>> {
        let mut versions = self.hot.get_by_uuid(uuid)?;
        if let Some(cold) = &self.cold {
            versions.extend(cold.lookup(uuid).await?.into_iter().map(codec::decode));
        }
        Ok(versions)
    }

    /// The combined view of an auction, or `None` when no tier has it.
    pub async fn combined(&self, uuid: &Uuid) -> Result<Option<Auction>> {
        Ok(combine_versions(self.versions(uuid).await?))
    }

    /// Filtered lazy scan over `(t0, t1]`, newest first, spanning tiers.
    pub async fn filtered(
        &self,
        tag: &str,
        filters: &BTreeMap<String, String>,
        t0: DateTime<Utc>,
        t1: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Auction>> {
        let predicate = filter::compile(filters)?;
        self.router
            .filtered_scan(tag, t0, t1, Some(true), Some(&predicate), limit)
            .await
    }

    /// Windowed price summary, `days` clamped to `[0, 2]`.
    pub async fn price_summary(
        &self,
        tag: &str,
        filters: &BTreeMap<String, String>,
        days: f64,
    ) -> Result<PriceSummary> {
        let days = days.clamp(0.0, 2.0);
        let now = Utc::now();
        let t0 = now - Duration::milliseconds((days * 24.0 * 3600.0 * 1000.0) as i64);
        let rows = self.filtered(tag, filters, t0, now, usize::MAX).await?;
        let prices: Vec<i64> = rows.iter().map(|a| a.highest_bid_amount).collect();
        Ok(crate::types::aggregate_prices(&prices))
    }

    /// Daily aggregates for `(tag, filter)` over the requested window.
    ///
    /// Day rows already in the summary table are reused; missing days are
    /// computed in sequence from the hot store and written back. Two
    /// concurrent misses may both compute a day; the row is idempotent by
    /// `(tag, filter_key, end_day)` so the race is harmless.
    pub async fn summary(
        &self,
        tag: &str,
        filters: &BTreeMap<String, String>,
    ) -> Result<Vec<SummaryRecord>> {
        let now = Utc::now();
        let (start, end) = filter::time_bounds(filters, now, SUMMARY_DEFAULT_WINDOW)?;
        let end = end
            .min(now)
            .duration_trunc(Duration::days(1))
            .map_err(|e| ArchiveError::InvalidInput(format!("bad summary window: {e}")))?;
        let start = start
            .duration_trunc(Duration::days(1))
            .map_err(|e| ArchiveError::InvalidInput(format!("bad summary window: {e}")))?;

        let key = filter::filter_key(filters);
        let mut cached = self.hot.read_summaries(tag, &key, start, end)?;
        metrics::counter!(SUMMARY_DAYS_CACHED).increment(cached.len() as u64);

        let have: std::collections::BTreeSet<i64> =
            cached.iter().map(|r| r.end.timestamp()).collect();
        let predicate = filter::compile(filters)?;

        let mut day_end = start + Duration::days(1);
        while day_end <= end {
            if !have.contains(&day_end.timestamp()) {
                let day_start = day_end - Duration::days(1);
                let aggregate = self.hot.daily_aggregate(tag, &predicate, day_start)?;
                let record = SummaryRecord {
                    tag: tag.to_string(),
                    filter_key: key.clone(),
                    filters: filters.clone(),
                    start: day_start,
                    end: day_end,
                    max: aggregate.max,
                    min: aggregate.min,
                    median: aggregate.median,
                    mean: aggregate.mean,
                    mode: aggregate.mode,
                    volume: aggregate.volume,
                };
                self.hot.write_summary(&record)?;
                metrics::counter!(SUMMARY_DAYS_COMPUTED).increment(1);
                debug!(tag, day = %day_end, "computed missing summary day");
                cached.push(record);
            }
            day_end += Duration::days(1);
        }

        cached.sort_by_key(|r| r.end);
        Ok(cached)
    }

    /// The twelve most recent sold auctions: the last hour first, widened to
    /// two weeks when the hour is quiet. Bidder names resolve through the
    /// player-name collaborator in one batch.
    pub async fn recent_overview(
        &self,
        tag: &str,
        filters: &BTreeMap<String, String>,
    ) -> Result<Vec<AuctionPreview>> {
        let predicate = filter::compile(filters)?;
        let now = Utc::now();
        let mut rows = self
            .router
            .filtered_scan(
                tag,
                now - Duration::hours(1),
                now,
                Some(true),
                Some(&predicate),
                OVERVIEW_SIZE,
            )
            .await?;
        if rows.len() < OVERVIEW_SIZE {
            rows = self
                .router
                .filtered_scan(
                    tag,
                    now - OVERVIEW_FALLBACK,
                    now,
                    Some(true),
                    Some(&predicate),
                    OVERVIEW_SIZE,
                )
                .await?;
        }

        let sellers: Vec<Uuid> = rows.iter().map(|a| a.seller).collect();
        let names = self.players.names(&sellers).await.unwrap_or_default();

        Ok(rows
            .into_iter()
            .map(|a| AuctionPreview {
                uuid: a.uuid,
                item_name: a.item_name.clone(),
                price: a.highest_bid_amount,
                end: a.end,
                seller: a.seller,
                player_name: names.get(&a.seller).cloned(),
            })
            .collect())
    }

    /// Auctions a seller ended in the 30 days before `before`.
    pub fn recent_by_seller(
        &self,
        seller: &Uuid,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Auction>> {
        self.hot.recent_by_seller(seller, before, limit)
    }
}
