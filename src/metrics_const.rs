pub const AUCTIONS_INSERTED: &str = "auction_archive_auctions_inserted_total";
pub const AUCTIONS_SKIPPED_EXISTING: &str = "auction_archive_auctions_skipped_existing_total";
pub const BIDS_INSERTED: &str = "auction_archive_bids_inserted_total";
pub const RETROFIT_APPLIED: &str = "auction_archive_retrofit_applied_total";
pub const RETROFIT_MISSED: &str = "auction_archive_retrofit_missed_total";

pub const INGEST_QUEUE_DEPTH: &str = "auction_archive_ingest_queue_depth";
pub const INGEST_ITEMS_RETRIED: &str = "auction_archive_ingest_items_retried_total";
pub const INGEST_BATCHES_CONSUMED: &str = "auction_archive_ingest_batches_consumed_total";
pub const INGEST_EVENTS_RECEIVED: &str = "auction_archive_ingest_events_received_total";
pub const INGEST_PARSE_ERRORS: &str = "auction_archive_ingest_parse_errors_total";
pub const IMPORT_OFFSET: &str = "auction_archive_import_offset";

pub const SUMMARY_DAYS_COMPUTED: &str = "auction_archive_summary_days_computed_total";
pub const SUMMARY_DAYS_CACHED: &str = "auction_archive_summary_days_cached_total";

pub const COLD_MONTHS_WRITTEN: &str = "auction_archive_cold_months_written_total";
pub const COLD_LOOKUPS: &str = "auction_archive_cold_lookups_total";
pub const COLD_READ_ERRORS: &str = "auction_archive_cold_read_errors_total";
pub const VERIFICATION_FAILURES: &str = "auction_archive_verification_failures_total";
pub const MONTHS_MIGRATED: &str = "auction_archive_months_migrated_total";
pub const ROWS_MIGRATED: &str = "auction_archive_rows_migrated_total";

pub const STORE_READ_OPS: &str = "auction_archive_store_read_operations_total";
pub const STORE_WRITE_OPS: &str = "auction_archive_store_write_operations_total";
pub const STORE_ERRORS: &str = "auction_archive_store_errors_total";
pub const STORE_BATCH_SIZE: &str = "auction_archive_store_batch_size";
pub const STORE_SIZE_BYTES: &str = "auction_archive_store_size_bytes";
