use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Months, TimeZone, Utc};
use rand::seq::SliceRandom;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::archive::ColdStore;
use crate::codec::StoredAuction;
use crate::error::{ArchiveError, Result};
use crate::metrics_const::{MONTHS_MIGRATED, ROWS_MIGRATED, VERIFICATION_FAILURES};
use crate::store::HotStore;

/// First month the game economy produced data.
const FIRST_YEAR: i32 = 2019;
const FIRST_MONTH: u32 = 1;

const VERIFY_SAMPLES: usize = 10;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MigrationReport {
    pub months_written: usize,
    pub rows_migrated: usize,
    pub verification_failures: usize,
}

/// Moves fully-elapsed months older than the retention window from the hot
/// store into the cold archive. Deletion of hot rows happens only after the
/// sealed blob has been read back and verified; a failed verification leaves
/// the hot rows untouched. Progress is implicit in which blobs exist, so the
/// migrator is restartable at any point.
pub struct ArchiveMigrator {
    hot: Arc<HotStore>,
    cold: Arc<ColdStore>,
    retention_months: u32,
    dry_run: bool,
}

impl ArchiveMigrator {
    pub fn new(hot: Arc<HotStore>, cold: Arc<ColdStore>, retention_months: u32, dry_run: bool) -> Self {
        Self {
            hot,
            cold,
            retention_months,
            dry_run,
        }
    }

    fn month_start(year: i32, month: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).unwrap()
    }

    fn next_month(year: i32, month: u32) -> (i32, u32) {
        if month == 12 {
            (year + 1, 1)
        } else {
            (year, month + 1)
        }
    }

    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<MigrationReport> {
        let cutoff = now
            .checked_sub_months(Months::new(self.retention_months))
            .unwrap_or(now);
        let mut report = MigrationReport::default();

        for tag in self.hot.distinct_tags()? {
            let (mut year, mut month) = (FIRST_YEAR, FIRST_MONTH);
            loop {
                let (next_year, next_month) = Self::next_month(year, month);
                if Self::month_start(next_year, next_month) > cutoff {
                    break;
                }
                match self.migrate_month(&tag, year, month).await {
                    Ok(Some(rows)) => {
                        report.months_written += 1;
                        report.rows_migrated += rows;
                    }
                    Ok(None) => {}
                    Err(ArchiveError::VerificationFailed(reason)) => {
                        error!(tag, year, month, "verification failed, hot rows kept: {reason}");
                        report.verification_failures += 1;
                        metrics::counter!(VERIFICATION_FAILURES).increment(1);
                    }
                    Err(err) => return Err(err),
                }
                (year, month) = (next_year, next_month);
            }
        }

        info!(
            months = report.months_written,
            rows = report.rows_migrated,
            failures = report.verification_failures,
            dry_run = self.dry_run,
            "archive migration pass finished"
        );
        Ok(report)
    }

    /// One `(tag, month)` unit of work: seal, verify, delete. `None` means
    /// there was nothing to do (already archived, or no rows).
    async fn migrate_month(&self, tag: &str, year: i32, month: u32) -> Result<Option<usize>> {
        if self.cold.month_exists(tag, year, month).await? {
            return Ok(None);
        }
        let start = Self::month_start(year, month);
        let (next_year, next_month) = Self::next_month(year, month);
        let end = Self::month_start(next_year, next_month);
        // the scan interval is (t0, t1]; shift by 1ms to cover [start, end)
        let rows = self.hot.range_stored(
            tag,
            start - Duration::milliseconds(1),
            end - Duration::milliseconds(1),
            None,
            usize::MAX,
        )?;
        if rows.is_empty() {
            return Ok(None);
        }

        self.cold.store_month(tag, year, month, &rows).await?;
        self.verify(tag, year, month, &rows).await?;

        if self.dry_run {
            info!(tag, year, month, rows = rows.len(), "dry run: keeping hot rows");
        } else {
            self.hot.delete_rows(&rows)?;
        }
        metrics::counter!(MONTHS_MIGRATED).increment(1);
        metrics::counter!(ROWS_MIGRATED).increment(rows.len() as u64);
        Ok(Some(rows.len()))
    }

    /// Reads the sealed blob back and proves it holds exactly what the hot
    /// store held: equal counts, equal uuid multisets, and up to ten random
    /// rows matching field-for-field on the sale-critical columns.
    async fn verify(
        &self,
        tag: &str,
        year: i32,
        month: u32,
        expected: &[StoredAuction],
    ) -> Result<()> {
        let actual = self.cold.get_month(tag, year, month).await?;
        if actual.len() != expected.len() {
            return Err(ArchiveError::VerificationFailed(format!(
                "row count mismatch: wrote {}, read {}",
                expected.len(),
                actual.len()
            )));
        }

        let expected_ids: Vec<Uuid> = sorted_ids(expected);
        let actual_ids: Vec<Uuid> = sorted_ids(&actual);
        if expected_ids != actual_ids {
            let missing: BTreeSet<_> = expected_ids
                .iter()
                .filter(|id| actual_ids.binary_search(id).is_err())
                .collect();
            return Err(ArchiveError::VerificationFailed(format!(
                "uuid sets differ, {} missing from blob",
                missing.len()
            )));
        }

        let mut candidates: Vec<&StoredAuction> = expected.iter().collect();
        candidates.shuffle(&mut rand::thread_rng());
        for sample in candidates.into_iter().take(VERIFY_SAMPLES) {
            let Some(read) = actual.iter().find(|r| {
                r.uuid == sample.uuid && r.is_sold == sample.is_sold && r.end == sample.end
            }) else {
                return Err(ArchiveError::VerificationFailed(format!(
                    "sampled row {} not found in blob",
                    sample.uuid
                )));
            };
            if read.highest_bid_amount != sample.highest_bid_amount
                || read.seller != sample.seller
                || read.end != sample.end
                || read.tag != sample.tag
            {
                return Err(ArchiveError::VerificationFailed(format!(
                    "sampled row {} differs between hot store and blob",
                    sample.uuid
                )));
            }
        }
        Ok(())
    }

    /// Background loop: one pass per interval (nominally 24h).
    pub async fn run_loop(self: Arc<Self>, interval: StdDuration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = self.run_once(Utc::now()).await {
                warn!("archive migration pass failed: {err}");
            }
        }
    }
}

fn sorted_ids(rows: &[StoredAuction]) -> Vec<Uuid> {
    let mut ids: Vec<Uuid> = rows.iter().map(|r| r.uuid).collect();
    ids.sort();
    ids
}
