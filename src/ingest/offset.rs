use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use tracing::{info, warn};

use crate::cache::{CacheClient, CacheError, IMPORT_OFFSET_KEY};
use crate::metrics_const::IMPORT_OFFSET;

/// The process-wide backfill checkpoint: every source row with id below the
/// offset has been enqueued for insertion.
///
/// The in-memory value only moves forward. Writes through to the cache are
/// debounced to once per `10 · batch_size` rows so the hot path stays off
/// the network; the gauge tracks every advance.
#[derive(Debug)]
pub struct ImportOffset {
    current: AtomicI64,
    persisted: AtomicI64,
    cache: Arc<dyn CacheClient>,
    debounce: i64,
}

impl ImportOffset {
    pub async fn load(cache: Arc<dyn CacheClient>, batch_size: i64) -> Self {
        let stored = match cache.get_i64(IMPORT_OFFSET_KEY).await {
            Ok(value) => value,
            Err(CacheError::NotFound) => 0,
            Err(err) => {
                warn!("failed to load import offset, starting from 0: {err}");
                0
            }
        };
        info!(offset = stored, "loaded import offset");
        metrics::gauge!(IMPORT_OFFSET).set(stored as f64);
        Self {
            current: AtomicI64::new(stored),
            persisted: AtomicI64::new(stored),
            cache,
            debounce: 10 * batch_size,
        }
    }

    pub fn get(&self) -> i64 {
        self.current.load(Ordering::SeqCst)
    }

    /// Advances the offset. Regressions are ignored so the checkpoint stays
    /// monotone even when late thunks complete out of order.
    pub async fn set(&self, offset: i64) {
        let previous = self.current.fetch_max(offset, Ordering::SeqCst);
        if offset <= previous {
            return;
        }
        metrics::gauge!(IMPORT_OFFSET).set(offset as f64);

        let persisted = self.persisted.load(Ordering::SeqCst);
        if (offset - persisted).abs() <= self.debounce {
            return;
        }
        if let Err(err) = self.cache.set_i64(IMPORT_OFFSET_KEY, offset).await {
            warn!(offset, "failed to persist import offset: {err}");
            return;
        }
        self.persisted.store(offset, Ordering::SeqCst);
    }

    /// Unconditional write-through, used by the manual checkpoint endpoint
    /// and on shutdown.
    pub async fn flush(&self) -> Result<(), CacheError> {
        let current = self.get();
        self.cache.set_i64(IMPORT_OFFSET_KEY, current).await?;
        self.persisted.store(current, Ordering::SeqCst);
        Ok(())
    }

    /// Manual override from the operations endpoint. Still monotone.
    pub async fn set_and_flush(&self, offset: i64) -> Result<i64, CacheError> {
        self.current.fetch_max(offset, Ordering::SeqCst);
        self.flush().await?;
        Ok(self.get())
    }
}
