pub mod backfill;
pub mod consumer;
pub mod offset;
pub mod queue;

pub use backfill::HistoricalMigrator;
pub use consumer::{BusConsumer, LiveConsumer};
pub use offset::ImportOffset;
pub use queue::{WorkItem, WorkQueue};
