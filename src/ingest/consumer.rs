use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use futures::{stream, TryStreamExt};
use rdkafka::{
    consumer::{Consumer, StreamConsumer},
    error::KafkaError,
    ClientConfig, Message,
};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::metrics_const::{INGEST_BATCHES_CONSUMED, INGEST_EVENTS_RECEIVED, INGEST_PARSE_ERRORS};
use crate::store::HotStore;
use crate::types::{Auction, Bid};

/// Auctions per single-tag micro-batch in the live path.
const TAG_GROUP_SIZE: usize = 10;
/// Bids per single-bidder micro-batch.
const BIDDER_GROUP_SIZE: usize = 20;

#[derive(Debug, thiserror::Error)]
pub enum RecvErr {
    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("Serde error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Received empty payload")]
    Empty,
}

/// Consumer over the `SOLD_AUCTION` and `NEW_AUCTION` topics with manual
/// offset stores, so a failed batch is redelivered by the bus.
#[derive(Clone)]
pub struct BusConsumer {
    inner: Arc<Inner>,
}

struct Inner {
    consumer: StreamConsumer,
}

impl BusConsumer {
    pub fn new(config: &Config) -> Result<Self, KafkaError> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.kafka_hosts)
            .set("group.id", &config.kafka_consumer_group)
            .set("auto.offset.reset", "earliest")
            .set("enable.auto.offset.store", "false");

        let consumer: StreamConsumer = client_config.create()?;
        consumer.subscribe(&[
            config.topic_sold_auction.as_str(),
            config.topic_new_auction.as_str(),
        ])?;
        Ok(Self {
            inner: Arc::new(Inner { consumer }),
        })
    }

    pub async fn recv(&self) -> Result<(Auction, MessageOffset), RecvErr> {
        let message = self.inner.consumer.recv().await?;
        let offset = MessageOffset {
            handle: Arc::downgrade(&self.inner),
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
        };

        let Some(payload) = message.payload() else {
            // poison pills are stored immediately so they never redeliver
            offset.store().ok();
            return Err(RecvErr::Empty);
        };
        match serde_json::from_slice(payload) {
            Ok(auction) => Ok((auction, offset)),
            Err(err) => {
                offset.store().ok();
                Err(RecvErr::Serde(err))
            }
        }
    }
}

pub struct MessageOffset {
    handle: Weak<Inner>,
    topic: String,
    partition: i32,
    offset: i64,
}

impl MessageOffset {
    pub fn store(&self) -> Result<(), KafkaError> {
        if let Some(inner) = self.handle.upgrade() {
            inner
                .consumer
                .store_offset(&self.topic, self.partition, self.offset)?;
        }
        Ok(())
    }
}

/// The live half of the ingest pipeline: batches of up to `batch_size`
/// events, each batch written through two bounded fan-outs (auctions grouped
/// by tag, bids grouped by bidder). Offsets are stored only after the whole
/// batch landed, leaning on redelivery for the failure path.
pub struct LiveConsumer {
    consumer: BusConsumer,
    hot: Arc<HotStore>,
    batch_size: usize,
    parallelism: usize,
}

impl LiveConsumer {
    pub fn new(consumer: BusConsumer, hot: Arc<HotStore>, config: &Config) -> Self {
        Self {
            consumer,
            hot,
            batch_size: config.consumer_batch_size,
            parallelism: config.insert_parallelism,
        }
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        info!(batch_size = self.batch_size, "live consumer started");
        loop {
            let (batch, offsets) = self.next_batch().await?;
            if batch.is_empty() {
                continue;
            }
            metrics::counter!(INGEST_BATCHES_CONSUMED).increment(1);
            metrics::counter!(INGEST_EVENTS_RECEIVED).increment(batch.len() as u64);

            match self.insert_sells(batch).await {
                Ok(()) => {
                    for offset in &offsets {
                        if let Err(err) = offset.store() {
                            warn!("failed to store consumer offset: {err}");
                        }
                    }
                }
                Err(err) => {
                    // skip the offset store: the bus redelivers the batch
                    error!("batch insert failed, awaiting redelivery: {err:#}");
                }
            }
        }
    }

    async fn next_batch(&self) -> anyhow::Result<(Vec<Auction>, Vec<MessageOffset>)> {
        let mut batch = Vec::with_capacity(self.batch_size);
        let mut offsets = Vec::with_capacity(self.batch_size);
        let deadline = tokio::time::sleep(Duration::from_secs(1));
        tokio::pin!(deadline);

        while batch.len() < self.batch_size {
            tokio::select! {
                received = self.consumer.recv() => match received {
                    Ok((auction, offset)) => {
                        batch.push(auction);
                        offsets.push(offset);
                    }
                    Err(RecvErr::Empty) => {
                        metrics::counter!(INGEST_PARSE_ERRORS).increment(1);
                        warn!("received empty auction event");
                    }
                    Err(RecvErr::Serde(err)) => {
                        metrics::counter!(INGEST_PARSE_ERRORS).increment(1);
                        warn!("failed to parse auction event: {err}");
                    }
                    Err(RecvErr::Kafka(err)) => {
                        return Err(err.into());
                    }
                },
                _ = &mut deadline => break,
            }
        }
        Ok((batch, offsets))
    }

    pub async fn insert_sells(&self, batch: Vec<Auction>) -> anyhow::Result<()> {
        insert_sells(self.hot.clone(), batch, self.parallelism).await
    }
}

/// Two bounded fan-outs per batch: one over per-tag auction groups, one over
/// per-bidder bid groups. A failing group fails the batch.
pub async fn insert_sells(
    hot: Arc<HotStore>,
    batch: Vec<Auction>,
    parallelism: usize,
) -> anyhow::Result<()> {
    let now = Utc::now();

    let mut bids: Vec<Bid> = Vec::new();
    let mut by_tag: HashMap<String, Vec<Auction>> = HashMap::new();
    for auction in batch {
        bids.extend(auction.bids.iter().cloned());
        by_tag.entry(auction.tag.clone()).or_default().push(auction);
    }

    let auction_jobs: Vec<Vec<Auction>> = by_tag
        .into_values()
        .flat_map(|group| {
            group
                .chunks(TAG_GROUP_SIZE)
                .map(|c| c.to_vec())
                .collect::<Vec<_>>()
        })
        .collect();
    stream::iter(auction_jobs.into_iter().map(Ok::<_, anyhow::Error>))
        .try_for_each_concurrent(parallelism, |job| {
            let hot = hot.clone();
            async move {
                hot.insert_batch_same_tag(job, now)?;
                Ok(())
            }
        })
        .await?;

    let mut by_bidder: HashMap<Uuid, Vec<Bid>> = HashMap::new();
    for bid in bids {
        by_bidder.entry(bid.bidder).or_default().push(bid);
    }
    let bid_jobs: Vec<Vec<Bid>> = by_bidder
        .into_values()
        .flat_map(|group| {
            group
                .chunks(BIDDER_GROUP_SIZE)
                .map(|c| c.to_vec())
                .collect::<Vec<_>>()
        })
        .collect();
    stream::iter(bid_jobs.into_iter().map(Ok::<_, anyhow::Error>))
        .try_for_each_concurrent(parallelism, |job| {
            let hot = hot.clone();
            async move {
                hot.insert_bids(&job)?;
                Ok(())
            }
        })
        .await?;

    Ok(())
}
