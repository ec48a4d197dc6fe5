use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

/// The upstream occasionally sends the literal `"unknown"` (or garbage) where
/// a profile uuid belongs; those collapse to the sentinel instead of failing
/// the whole message.
fn lenient_uuid<'de, D>(deserializer: D) -> std::result::Result<Uuid, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw
        .and_then(|s| Uuid::parse_str(&s).ok())
        .unwrap_or(Uuid::nil()))
}

fn lenient_uuid_opt<'de, D>(deserializer: D) -> std::result::Result<Option<Uuid>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    lenient_uuid(deserializer).map(|u| if u.is_nil() { None } else { Some(u) })
}

/// A single bid on an auction. `profile_id` falls back to the bidder when the
/// source omitted it or sent the literal `"unknown"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bid {
    pub auction_uuid: Uuid,
    pub bidder: Uuid,
    #[serde(default, deserialize_with = "lenient_uuid_opt")]
    pub profile_id: Option<Uuid>,
    pub amount: i64,
    pub timestamp: DateTime<Utc>,
}

/// The primary entity: one auction of one item stack, with its bid history
/// and the flattened view of the item's NBT attribute tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Auction {
    pub uuid: Uuid,
    pub tag: String,
    #[serde(default)]
    pub item_name: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub tier: String,
    #[serde(default)]
    pub bin: bool,
    #[serde(default)]
    pub starting_bid: i64,
    #[serde(default)]
    pub highest_bid_amount: i64,
    #[serde(default = "Uuid::nil")]
    pub seller: Uuid,
    #[serde(default = "Uuid::nil", deserialize_with = "lenient_uuid")]
    pub profile_id: Uuid,
    #[serde(default)]
    pub coop_members: Vec<Uuid>,
    #[serde(default = "epoch")]
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(default = "epoch")]
    pub item_created_at: DateTime<Utc>,
    #[serde(default)]
    pub item_bytes: Vec<u8>,
    /// String→string view of the item NBT, including the synthetic `uid`,
    /// `uuid` and `color` keys.
    #[serde(default)]
    pub flat_nbt: BTreeMap<String, String>,
    #[serde(default)]
    pub enchantments: BTreeMap<String, i32>,
    #[serde(default)]
    pub count: i32,
    #[serde(default)]
    pub bids: Vec<Bid>,
}

impl Auction {
    pub fn highest_bid(&self) -> Option<&Bid> {
        self.bids.iter().max_by_key(|b| b.amount)
    }
}

/// Memoized daily aggregate, keyed `(tag, filter_key)` with `end` clustering.
/// Immutable once written for a finalized day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryRecord {
    pub tag: String,
    pub filter_key: String,
    pub filters: BTreeMap<String, String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub max: i64,
    pub min: i64,
    pub median: i64,
    pub mean: i64,
    pub mode: i64,
    pub volume: i64,
}

/// Windowed price summary served by the price endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PriceSummary {
    pub max: i64,
    pub min: i64,
    pub median: i64,
    pub mean: i64,
    pub mode: i64,
    pub volume: i64,
}

/// One row of the recent-overview listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuctionPreview {
    pub uuid: Uuid,
    pub item_name: String,
    pub price: i64,
    pub end: DateTime<Utc>,
    pub seller: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub player_name: Option<String>,
}

/// Price aggregate over a set of sale prices: lower median, first-seen mode,
/// arithmetic mean. Zeroes on empty input.
pub fn aggregate_prices(prices: &[i64]) -> PriceSummary {
    if prices.is_empty() {
        return PriceSummary::default();
    }
    let mut sorted = prices.to_vec();
    sorted.sort_unstable();

    let mut counts: BTreeMap<i64, usize> = BTreeMap::new();
    let mut mode = prices[0];
    let mut mode_count = 0usize;
    for &p in prices {
        let c = counts.entry(p).or_insert(0);
        *c += 1;
        if *c > mode_count {
            mode_count = *c;
            mode = p;
        }
    }

    let sum: i128 = sorted.iter().map(|&p| p as i128).sum();
    PriceSummary {
        max: *sorted.last().unwrap(),
        min: sorted[0],
        median: sorted[sorted.len() / 2],
        mean: (sum / sorted.len() as i128) as i64,
        mode,
        volume: prices.len() as i64,
    }
}

/// Folds multiple stored versions of one auction (a "listed" row and a "sold"
/// row typically both exist) into a single view.
///
/// Versions where `seller == uuid` are a known corruption marker and are
/// dropped. Bids are unioned under the amount as the dedup key; the listing
/// metadata fields are taken from the first version carrying a non-default
/// value.
pub fn combine_versions(mut versions: Vec<Auction>) -> Option<Auction> {
    versions.retain(|v| v.seller != v.uuid);
    if versions.is_empty() {
        return None;
    }
    versions.sort_by_key(|v| (v.end, v.start));

    let mut iter = versions.into_iter();
    let mut combined = iter.next().unwrap();
    for v in iter {
        for bid in v.bids {
            if !combined.bids.iter().any(|b| b.amount == bid.amount) {
                combined.bids.push(bid);
            }
        }
        if combined.coop_members.is_empty() {
            combined.coop_members = v.coop_members;
        }
        if combined.starting_bid == 0 {
            combined.starting_bid = v.starting_bid;
        }
        if combined.category.is_empty() {
            combined.category = v.category;
        }
        if combined.start == epoch() {
            combined.start = v.start;
        }
        if combined.profile_id.is_nil() {
            combined.profile_id = v.profile_id;
        }
        if combined.highest_bid_amount < v.highest_bid_amount {
            combined.highest_bid_amount = v.highest_bid_amount;
        }
        if combined.item_name.is_empty() {
            combined.item_name = v.item_name;
        }
    }
    combined.bids.sort_by_key(|b| b.timestamp);
    Some(combined)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn auction(uuid: Uuid, end: DateTime<Utc>) -> Auction {
        Auction {
            uuid,
            tag: "HYPERION".into(),
            item_name: String::new(),
            category: String::new(),
            tier: String::new(),
            bin: false,
            starting_bid: 0,
            highest_bid_amount: 0,
            seller: Uuid::new_v4(),
            profile_id: Uuid::nil(),
            coop_members: vec![],
            start: epoch(),
            end,
            item_created_at: epoch(),
            item_bytes: vec![],
            flat_nbt: BTreeMap::new(),
            enchantments: BTreeMap::new(),
            count: 1,
            bids: vec![],
        }
    }

    #[test]
    fn test_aggregate_prices_on_empty_input_is_all_zeroes() {
        let s = aggregate_prices(&[]);
        assert_eq!(s.max, 0);
        assert_eq!(s.volume, 0);
    }

    #[test]
    fn test_aggregate_prices_lower_median_and_first_seen_mode() {
        let s = aggregate_prices(&[10, 30, 20, 40]);
        // lower median of [10, 20, 30, 40] is the element at index 2
        assert_eq!(s.median, 30);
        assert_eq!(s.mean, 25);
        // every price occurs once, mode is the first seen
        assert_eq!(s.mode, 10);
        assert_eq!(s.max, 40);
        assert_eq!(s.min, 10);
        assert_eq!(s.volume, 4);
    }

    #[test]
    fn test_combine_versions_unions_bids_by_amount() {
        let uuid = Uuid::new_v4();
        let end = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let mut listed = auction(uuid, end);
        listed.starting_bid = 100;
        listed.start = Utc.with_ymd_and_hms(2024, 5, 25, 0, 0, 0).unwrap();
        listed.bids.push(Bid {
            auction_uuid: uuid,
            bidder: Uuid::new_v4(),
            profile_id: None,
            amount: 500,
            timestamp: end,
        });
        let mut sold = auction(uuid, end);
        sold.highest_bid_amount = 800;
        sold.bids.push(Bid {
            auction_uuid: uuid,
            bidder: Uuid::new_v4(),
            profile_id: None,
            amount: 500,
            timestamp: end,
        });
        sold.bids.push(Bid {
            auction_uuid: uuid,
            bidder: Uuid::new_v4(),
            profile_id: None,
            amount: 800,
            timestamp: end,
        });

        let combined = combine_versions(vec![sold, listed]).unwrap();
        assert_eq!(combined.bids.len(), 2);
        assert_eq!(combined.starting_bid, 100);
        assert_eq!(combined.highest_bid_amount, 800);
        assert_ne!(combined.start, epoch());
    }

    #[test]
    fn test_combine_versions_drops_corrupted_rows() {
        let uuid = Uuid::new_v4();
        let end = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let mut corrupt = auction(uuid, end);
        corrupt.seller = uuid;
        assert!(combine_versions(vec![corrupt]).is_none());
    }
}
