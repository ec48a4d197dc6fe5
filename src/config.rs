use std::{fs, path::PathBuf, time::Duration};

use anyhow::Result;
use envconfig::Envconfig;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    // Kafka configuration
    #[envconfig(from = "KAFKA_HOSTS", default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "sky-auctions")]
    pub kafka_consumer_group: String,

    #[envconfig(from = "TOPIC_SOLD_AUCTION", default = "SOLD_AUCTION")]
    pub topic_sold_auction: String,

    #[envconfig(from = "TOPIC_NEW_AUCTION", default = "NEW_AUCTION")]
    pub topic_new_auction: String,

    #[envconfig(default = "400")]
    pub consumer_batch_size: usize,

    // Hot store
    #[envconfig(default = "/var/lib/auction-archive/hot")]
    pub store_path: String,

    // Cache (import offset, migration cursors); unset falls back to the
    // in-memory client, losing checkpoints across restarts
    #[envconfig(from = "REDIS_HOST")]
    pub redis_host: Option<String>,

    // Cold tier; unset disables archiving and the tier router serves
    // everything from the hot store
    #[envconfig(from = "S3_BUCKET_NAME")]
    pub s3_bucket: Option<String>,

    #[envconfig(default = "us-east-1")]
    pub aws_region: String,

    #[envconfig(default = "120")]
    pub s3_operation_timeout_secs: u64,

    #[envconfig(from = "RETENTION_MONTHS", default = "3")]
    pub retention_months: u32,

    #[envconfig(default = "24")]
    pub migration_interval_hours: u64,

    #[envconfig(default = "false")]
    pub archive_dry_run: bool,

    // Ingest
    #[envconfig(default = "100")]
    pub ingest_workers: usize,

    #[envconfig(default = "10")]
    pub insert_parallelism: usize,

    // Legacy relational source for the historical backfill and the restore
    // endpoints; unset disables both
    #[envconfig(from = "DATABASE_URL")]
    pub database_url: Option<String>,

    #[envconfig(from = "PLAYER_API_URL")]
    pub player_api_url: Option<String>,

    // HTTP server
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "8000")]
    pub port: u16,
}

impl Config {
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    /// The hot store path must exist and be writable before anything spins up.
    pub fn validate(&self) -> Result<()> {
        if let Err(e) = fs::create_dir_all(&self.store_path) {
            return Err(anyhow::anyhow!(
                "cannot create hot store directory '{}': {}",
                self.store_path,
                e
            ));
        }
        let probe = self.store_path_buf().join(".write_test");
        if let Err(e) = fs::write(&probe, b"test") {
            return Err(anyhow::anyhow!(
                "hot store path '{}' is not writable: {}",
                self.store_path,
                e
            ));
        }
        fs::remove_file(probe).ok();
        Ok(())
    }

    pub fn store_path_buf(&self) -> PathBuf {
        PathBuf::from(&self.store_path)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn migration_interval(&self) -> Duration {
        Duration::from_secs(self.migration_interval_hours * 3600)
    }

    pub fn s3_operation_timeout(&self) -> Duration {
        Duration::from_secs(self.s3_operation_timeout_secs)
    }
}
