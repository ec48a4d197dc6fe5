use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::time_bucket;
use crate::types::{epoch, Auction, Bid};

/// The row shape persisted in the hot store and inside cold-tier blobs.
/// Timestamps are epoch milliseconds so keys and values agree bit-for-bit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredAuction {
    pub uuid: Uuid,
    pub tag: String,
    pub item_name: String,
    pub category: String,
    pub tier: String,
    pub bin: bool,
    pub starting_bid: i64,
    pub highest_bid_amount: i64,
    pub seller: Uuid,
    pub profile_id: Uuid,
    pub highest_bidder: Uuid,
    pub coop_members: Vec<Uuid>,
    pub start: i64,
    pub end: i64,
    pub item_created_at: i64,
    pub item_bytes: Vec<u8>,
    pub flat_nbt: BTreeMap<String, String>,
    pub enchantments: BTreeMap<String, i32>,
    pub count: i32,
    pub color: String,
    pub item_uid: i64,
    pub item_uuid: Uuid,
    pub is_sold: bool,
    pub time_key: i16,
    pub bids: Vec<StoredBid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredBid {
    pub auction_uuid: Uuid,
    pub bidder: Uuid,
    pub profile_id: Uuid,
    pub amount: i64,
    pub timestamp: i64,
}

pub fn millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

pub fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(epoch)
}

/// The `unknown` enchantment name collides across unrelated modded items;
/// suffixing the level keeps the map entries apart.
fn enchantment_key(name: &str, level: i32) -> String {
    if name == "unknown" {
        format!("unknown_{level}")
    } else {
        name.to_string()
    }
}

fn parse_item_uid(flat_nbt: &BTreeMap<String, String>) -> i64 {
    flat_nbt
        .get("uid")
        .and_then(|uid| i64::from_str_radix(uid, 16).ok())
        .filter(|uid| *uid > 0)
        // a small positive random keeps the secondary index usable for
        // items predating uid tracking
        .unwrap_or_else(|| rand::random::<u16>() as i64 + 1)
}

fn derive_item_uuid(flat_nbt: &BTreeMap<String, String>, item_uid: i64) -> Uuid {
    flat_nbt
        .get("uuid")
        .and_then(|s| Uuid::parse_str(s).ok())
        .unwrap_or_else(|| Uuid::from_u64_pair(0, item_uid as u64))
}

/// The hot store indexes on the highest bidder and rejects the all-zero
/// uuid, so bid-less auctions get a synthetic bidder derived from the
/// auction id (deterministic, never nil).
fn synthetic_bidder(auction_uuid: Uuid) -> Uuid {
    let (hi, lo) = auction_uuid.as_u64_pair();
    Uuid::from_u64_pair(hi | 1 << 63, lo | 1)
}

fn normalize_profile(profile: Uuid, fallback: Uuid) -> Uuid {
    if profile.is_nil() {
        fallback
    } else {
        profile
    }
}

/// Canonical conversion from the ingest record to the stored record,
/// computing every derived field. Fields absent on "sold" ingress events
/// (start, starting bid, item metadata) stay default here and are filled by
/// the retrofit pass on insert.
pub fn encode(a: &Auction, now: DateTime<Utc>) -> StoredAuction {
    let item_uid = parse_item_uid(&a.flat_nbt);
    let highest_bidder = a
        .highest_bid()
        .map(|b| b.bidder)
        .unwrap_or_else(|| synthetic_bidder(a.uuid));
    let highest_bid_amount = a
        .bids
        .iter()
        .map(|b| b.amount)
        .max()
        .unwrap_or(a.highest_bid_amount);

    let mut enchantments = BTreeMap::new();
    for (name, level) in &a.enchantments {
        enchantments.insert(enchantment_key(name, *level), *level);
    }

    StoredAuction {
        uuid: a.uuid,
        tag: a.tag.clone(),
        item_name: a.item_name.clone(),
        category: a.category.clone(),
        tier: a.tier.clone(),
        bin: a.bin,
        starting_bid: a.starting_bid,
        highest_bid_amount,
        seller: a.seller,
        profile_id: normalize_profile(a.profile_id, a.seller),
        highest_bidder,
        coop_members: a.coop_members.clone(),
        start: millis(a.start),
        end: millis(a.end),
        item_created_at: millis(a.item_created_at),
        item_bytes: a.item_bytes.clone(),
        flat_nbt: a.flat_nbt.clone(),
        enchantments,
        count: a.count,
        color: a.flat_nbt.get("color").cloned().unwrap_or_default(),
        item_uid,
        item_uuid: derive_item_uuid(&a.flat_nbt, item_uid),
        is_sold: highest_bid_amount > 0 && a.end <= now,
        time_key: time_bucket::bucket(&a.tag, a.end),
        bids: a
            .bids
            .iter()
            .map(|b| StoredBid {
                auction_uuid: a.uuid,
                bidder: b.bidder,
                profile_id: normalize_profile(b.profile_id.unwrap_or(Uuid::nil()), b.bidder),
                amount: b.amount,
                timestamp: millis(b.timestamp),
            })
            .collect(),
    }
}

pub fn decode(s: StoredAuction) -> Auction {
    Auction {
        uuid: s.uuid,
        tag: s.tag,
        item_name: s.item_name,
        category: s.category,
        tier: s.tier,
        bin: s.bin,
        starting_bid: s.starting_bid,
        highest_bid_amount: s.highest_bid_amount,
        seller: s.seller,
        profile_id: s.profile_id,
        coop_members: s.coop_members,
        start: from_millis(s.start),
        end: from_millis(s.end),
        item_created_at: from_millis(s.item_created_at),
        item_bytes: s.item_bytes,
        flat_nbt: s.flat_nbt,
        enchantments: s.enchantments,
        count: s.count,
        bids: s
            .bids
            .into_iter()
            .map(|b| Bid {
                auction_uuid: b.auction_uuid,
                bidder: b.bidder,
                profile_id: Some(b.profile_id),
                amount: b.amount,
                timestamp: from_millis(b.timestamp),
            })
            .collect(),
    }
}

pub fn encode_value(s: &StoredAuction) -> anyhow::Result<Vec<u8>> {
    Ok(bincode::serde::encode_to_vec(
        s,
        bincode::config::standard(),
    )?)
}

pub fn decode_value(bytes: &[u8]) -> anyhow::Result<StoredAuction> {
    let (s, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
    Ok(s)
}

pub fn encode_bid(b: &StoredBid) -> anyhow::Result<Vec<u8>> {
    Ok(bincode::serde::encode_to_vec(
        b,
        bincode::config::standard(),
    )?)
}

pub fn decode_bid(bytes: &[u8]) -> anyhow::Result<StoredBid> {
    let (b, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
    Ok(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_auction() -> Auction {
        let uuid = Uuid::new_v4();
        let end = Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap();
        let mut flat_nbt = BTreeMap::new();
        flat_nbt.insert("uid".to_string(), "1a2b3c4d".to_string());
        flat_nbt.insert("color".to_string(), "0:0:170".to_string());
        let mut enchantments = BTreeMap::new();
        enchantments.insert("sharpness".to_string(), 7);
        Auction {
            uuid,
            tag: "DIAMOND_SWORD".into(),
            item_name: "Withered Diamond Sword".into(),
            category: "WEAPON".into(),
            tier: "LEGENDARY".into(),
            bin: false,
            starting_bid: 1000,
            highest_bid_amount: 0,
            seller: Uuid::new_v4(),
            profile_id: Uuid::new_v4(),
            coop_members: vec![Uuid::new_v4()],
            start: Utc.with_ymd_and_hms(2024, 6, 10, 12, 0, 0).unwrap(),
            end,
            item_created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            item_bytes: vec![1, 2, 3],
            flat_nbt,
            enchantments,
            count: 1,
            bids: vec![Bid {
                auction_uuid: uuid,
                bidder: Uuid::new_v4(),
                profile_id: None,
                amount: 1_000_000,
                timestamp: end,
            }],
        }
    }

    #[test]
    fn test_roundtrip_preserves_bids_enchantments_and_nbt() {
        let a = sample_auction();
        let now = Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap();
        let decoded = decode(encode(&a, now));

        assert_eq!(decoded.uuid, a.uuid);
        assert_eq!(decoded.flat_nbt, a.flat_nbt);
        assert_eq!(decoded.enchantments, a.enchantments);
        assert_eq!(decoded.bids.len(), 1);
        assert_eq!(decoded.bids[0].amount, 1_000_000);
        // profile defaults are legally rewritten
        assert_eq!(decoded.bids[0].profile_id, Some(a.bids[0].bidder));
        assert_eq!(decoded.end, a.end);
    }

    #[test]
    fn test_derived_fields() {
        let a = sample_auction();
        let now = Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap();
        let s = encode(&a, now);

        assert_eq!(s.item_uid, 0x1a2b3c4d);
        assert_eq!(s.color, "0:0:170");
        assert_eq!(s.highest_bid_amount, 1_000_000);
        assert_eq!(s.highest_bidder, a.bids[0].bidder);
        assert!(s.is_sold);
        assert_eq!(s.item_uuid, Uuid::from_u64_pair(0, 0x1a2b3c4d));
    }

    #[test]
    fn test_auction_without_bids_gets_synthetic_bidder() {
        let mut a = sample_auction();
        a.bids.clear();
        a.highest_bid_amount = 0;
        let now = Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap();
        let s = encode(&a, now);

        assert!(!s.highest_bidder.is_nil());
        assert!(!s.is_sold);
        // deterministic per auction id
        assert_eq!(s.highest_bidder, encode(&a, now).highest_bidder);
    }

    #[test]
    fn test_unended_auction_is_not_sold() {
        let a = sample_auction();
        let before_end = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        assert!(!encode(&a, before_end).is_sold);
    }

    #[test]
    fn test_unknown_enchantment_gets_level_suffix() {
        let mut a = sample_auction();
        a.enchantments.insert("unknown".to_string(), 3);
        let now = Utc::now();
        let s = encode(&a, now);
        assert!(s.enchantments.contains_key("unknown_3"));
        assert!(s.enchantments.contains_key("sharpness"));
    }

    #[test]
    fn test_missing_uid_falls_back_to_small_positive() {
        let mut a = sample_auction();
        a.flat_nbt.remove("uid");
        let s = encode(&a, Utc::now());
        assert!(s.item_uid > 0);
        assert!(s.item_uid <= u16::MAX as i64 + 1);
    }

    #[test]
    fn test_value_roundtrip() {
        let a = sample_auction();
        let s = encode(&a, Utc::now());
        let bytes = encode_value(&s).unwrap();
        assert_eq!(decode_value(&bytes).unwrap(), s);
    }
}
