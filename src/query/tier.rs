use std::sync::Arc;

use chrono::{DateTime, Datelike, Months, TimeZone, Utc};
use tracing::warn;

use crate::archive::ColdStore;
use crate::codec;
use crate::error::Result;
use crate::filter::Predicate;
use crate::metrics_const::COLD_READ_ERRORS;
use crate::store::HotStore;
use crate::time_bucket;
use crate::types::Auction;

/// Routes a `(tag, time range)` scan across the storage tiers: buckets whose
/// window starts inside the retention horizon read from the hot store, older
/// buckets from their enclosing cold month blob. Results come back
/// newest-first with the filter applied, stopping at `limit`.
#[derive(Debug, Clone)]
pub struct TierRouter {
    hot: Arc<HotStore>,
    cold: Option<Arc<ColdStore>>,
    retention_months: u32,
}

impl TierRouter {
    pub fn new(hot: Arc<HotStore>, cold: Option<Arc<ColdStore>>, retention_months: u32) -> Self {
        Self {
            hot,
            cold,
            retention_months,
        }
    }

    fn retention_horizon(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_sub_months(Months::new(self.retention_months))
            .unwrap_or(now)
    }

    /// The scan works a tier segment at a time, newest first, and stops as
    /// soon as `limit` rows have passed the filter, so a satisfied query
    /// never touches the archive. A failed cold read degrades that month to
    /// empty instead of failing the whole query.
    pub async fn filtered_scan(
        &self,
        tag: &str,
        t0: DateTime<Utc>,
        t1: DateTime<Utc>,
        is_sold: Option<bool>,
        filter: Option<&Predicate>,
        limit: usize,
    ) -> Result<Vec<Auction>> {
        let horizon = self.retention_horizon(Utc::now());

        // first bucket that still lives in the hot tier; with the cold tier
        // disabled the hot store serves the whole range
        let split = match &self.cold {
            Some(_) if t0 < horizon => {
                let mut b = time_bucket::bucket_floor(tag, t0);
                let last = time_bucket::bucket_floor(tag, t1);
                while b <= last && time_bucket::date_of(tag, b) < horizon {
                    b += 1;
                }
                Some(b)
            }
            _ => None,
        };

        let mut out: Vec<Auction> = Vec::new();

        // hot segment: everything from the split bucket's window start up
        let hot_floor = match split {
            Some(b) if b > time_bucket::bucket_floor(tag, t1) => None,
            Some(b) => Some(t0.max(time_bucket::date_of(tag, b) - chrono::Duration::milliseconds(1))),
            None => Some(t0),
        };
        if let Some(floor) = hot_floor {
            for auction in self.hot.range(tag, floor, t1, is_sold, usize::MAX)? {
                if Self::accept(filter, &auction) {
                    out.push(auction);
                    if out.len() >= limit {
                        return Ok(out);
                    }
                }
            }
        }

        // cold segment: month blobs under the split, newest month first
        if let (Some(cold), Some(split_bucket)) = (&self.cold, split) {
            let boundary = time_bucket::date_of(tag, split_bucket);
            let boundary_ms = codec::millis(boundary);
            let t0_ms = codec::millis(t0);
            let t1_ms = codec::millis(t1);

            // every calendar month the cold span touches, by end timestamp
            let mut months: Vec<(i32, u32)> = Vec::new();
            let mut cursor = chrono::Utc
                .with_ymd_and_hms(t0.year(), t0.month(), 1, 0, 0, 0)
                .unwrap();
            while cursor < boundary && cursor <= t1 {
                months.push((cursor.year(), cursor.month()));
                cursor = cursor
                    .checked_add_months(Months::new(1))
                    .expect("month cursor overflow");
            }

            for (year, month) in months.into_iter().rev() {
                // a month the migrator has not sealed yet is still hot
                let sealed = match cold.month_exists(tag, year, month).await {
                    Ok(sealed) => sealed,
                    Err(err) => {
                        metrics::counter!(COLD_READ_ERRORS).increment(1);
                        warn!(tag, year, month, "cold tier head failed: {err:#}");
                        false
                    }
                };
                let mut rows: Vec<Auction> = if sealed {
                    match cold.get_month(tag, year, month).await {
                        Ok(stored) => stored
                            .into_iter()
                            .filter(|s| s.end > t0_ms && s.end <= t1_ms && s.end < boundary_ms)
                            .filter(|s| is_sold.map(|v| s.is_sold == v).unwrap_or(true))
                            .map(codec::decode)
                            .collect(),
                        Err(err) => {
                            metrics::counter!(COLD_READ_ERRORS).increment(1);
                            warn!(
                                tag,
                                year, month, "cold tier read failed, treating month as empty: {err:#}"
                            );
                            Vec::new()
                        }
                    }
                } else {
                    let month_start = chrono::Utc
                        .with_ymd_and_hms(year, month, 1, 0, 0, 0)
                        .unwrap();
                    let month_end = month_start.checked_add_months(Months::new(1)).unwrap();
                    let floor = t0.max(month_start - chrono::Duration::milliseconds(1));
                    let ceil = codec::from_millis(
                        boundary_ms
                            .min(t1_ms + 1)
                            .min(codec::millis(month_end))
                            - 1,
                    );
                    self.hot
                        .range(tag, floor, ceil, is_sold, usize::MAX)?
                        .into_iter()
                        .filter(|a| codec::millis(a.end) < boundary_ms)
                        .collect()
                };
                rows.sort_by_key(|a| std::cmp::Reverse(a.end));
                for auction in rows {
                    if Self::accept(filter, &auction) {
                        out.push(auction);
                        if out.len() >= limit {
                            return Ok(out);
                        }
                    }
                }
            }
        }

        Ok(out)
    }

    fn accept(filter: Option<&Predicate>, auction: &Auction) -> bool {
        filter.map(|pred| pred(auction)).unwrap_or(true)
    }
}
