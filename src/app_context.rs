use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{info, warn};

use crate::archive::migrator::ArchiveMigrator;
use crate::archive::object_store::S3ObjectStore;
use crate::archive::ColdStore;
use crate::cache::{CacheClient, MockCacheClient, RedisCache};
use crate::config::Config;
use crate::ingest::backfill::PAGE_SIZE;
use crate::ingest::ImportOffset;
use crate::players::{HttpPlayerApi, NoopPlayerApi, PlayerNameApi};
use crate::query::QueryEngine;
use crate::store::HotStore;

/// Shared handles for the API and the background services. Everything is
/// constructed once from config; services receive explicit clones instead of
/// reaching for globals.
pub struct AppContext {
    pub config: Config,
    pub hot: Arc<HotStore>,
    pub cold: Option<Arc<ColdStore>>,
    pub engine: QueryEngine,
    pub cache: Arc<dyn CacheClient>,
    pub import_offset: Arc<ImportOffset>,
    pub migrator: Option<Arc<ArchiveMigrator>>,
    pub sql: Option<PgPool>,
}

impl AppContext {
    pub async fn new(config: Config) -> Result<Self> {
        let hot = Arc::new(HotStore::open(config.store_path_buf()).context("opening hot store")?);

        let cold = match &config.s3_bucket {
            Some(bucket) => {
                let objects = S3ObjectStore::new(
                    bucket.clone(),
                    config.aws_region.clone(),
                    config.s3_operation_timeout(),
                )
                .await
                .context("building S3 client")?;
                Some(Arc::new(ColdStore::new(Arc::new(objects))))
            }
            None => {
                warn!("S3_BUCKET_NAME unset, cold tier disabled");
                None
            }
        };

        let cache: Arc<dyn CacheClient> = match &config.redis_host {
            Some(host) => {
                let addr = if host.starts_with("redis://") {
                    host.clone()
                } else {
                    format!("redis://{host}")
                };
                Arc::new(
                    RedisCache::new(addr)
                        .await
                        .map_err(|e| anyhow::anyhow!("connecting to redis: {e}"))?,
                )
            }
            None => {
                warn!("REDIS_HOST unset, using in-memory cache");
                Arc::new(MockCacheClient::new())
            }
        };

        let players: Arc<dyn PlayerNameApi> = match &config.player_api_url {
            Some(url) => Arc::new(HttpPlayerApi::new(url.clone())),
            None => Arc::new(NoopPlayerApi),
        };

        let sql = match &config.database_url {
            Some(url) => Some(
                PgPoolOptions::new()
                    .max_connections(10)
                    .connect(url)
                    .await
                    .context("connecting to the legacy database")?,
            ),
            None => None,
        };

        let import_offset = Arc::new(ImportOffset::load(cache.clone(), PAGE_SIZE).await);

        let migrator = cold.as_ref().map(|cold| {
            Arc::new(ArchiveMigrator::new(
                hot.clone(),
                cold.clone(),
                config.retention_months,
                config.archive_dry_run,
            ))
        });

        let engine = QueryEngine::new(hot.clone(), cold.clone(), players, config.retention_months);

        info!(
            retention_months = config.retention_months,
            cold_tier = cold.is_some(),
            sql = sql.is_some(),
            "application context ready"
        );

        Ok(Self {
            config,
            hot,
            cold,
            engine,
            cache,
            import_offset,
            migrator,
            sql,
        })
    }
}
