use anyhow::{bail, Context, Result};
use uuid::Uuid;

/// Key encodings for every column family.
///
/// All multi-byte integers are big-endian so byte order equals numeric order.
/// Descending clustering dimensions (`end DESC`, uuid tiebreak) store the
/// complement, which makes an ascending RocksDB iteration walk newest-first.
/// Tags never contain NUL, so a `0x00` terminator keeps `SWORD` from
/// prefix-matching `SWORD_2`.

const TAG_SEP: u8 = 0x00;

fn push_tag(buf: &mut Vec<u8>, tag: &str) {
    buf.extend_from_slice(tag.as_bytes());
    buf.push(TAG_SEP);
}

fn complement_u64(v: u64) -> u64 {
    u64::MAX - v
}

fn complement_uuid(uuid: &Uuid) -> [u8; 16] {
    let mut bytes = *uuid.as_bytes();
    for b in &mut bytes {
        *b = !*b;
    }
    bytes
}

fn uncomplement_uuid(bytes: &[u8]) -> Result<Uuid> {
    let mut raw: [u8; 16] = bytes.try_into().context("short uuid in key")?;
    for b in &mut raw {
        *b = !*b;
    }
    Ok(Uuid::from_bytes(raw))
}

/// Shifts an i16 into unsigned space so negative buckets sort first.
fn order_i16(v: i16) -> u16 {
    (v as u16) ^ 0x8000
}

fn unorder_i16(v: u16) -> i16 {
    (v ^ 0x8000) as i16
}

/// Primary coordinate of an auction row: partition `(tag, time_key)`,
/// clustering `(is_sold ASC, end DESC, uuid DESC)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuctionKey {
    pub tag: String,
    pub time_key: i16,
    pub is_sold: bool,
    pub end_millis: i64,
    pub uuid: Uuid,
}

impl AuctionKey {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.tag.len() + 28);
        push_tag(&mut buf, &self.tag);
        buf.extend_from_slice(&order_i16(self.time_key).to_be_bytes());
        buf.push(self.is_sold as u8);
        buf.extend_from_slice(&complement_u64(self.end_millis as u64).to_be_bytes());
        buf.extend_from_slice(&complement_uuid(&self.uuid));
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let sep = bytes
            .iter()
            .position(|b| *b == TAG_SEP)
            .context("auction key missing tag terminator")?;
        let tag = String::from_utf8(bytes[..sep].to_vec()).context("auction key tag not utf-8")?;
        let rest = &bytes[sep + 1..];
        if rest.len() != 27 {
            bail!("auction key has unexpected length {}", bytes.len());
        }
        let time_key = unorder_i16(u16::from_be_bytes(rest[0..2].try_into().unwrap()));
        let is_sold = rest[2] != 0;
        let end_millis = complement_u64(u64::from_be_bytes(rest[3..11].try_into().unwrap())) as i64;
        let uuid = uncomplement_uuid(&rest[11..27])?;
        Ok(AuctionKey {
            tag,
            time_key,
            is_sold,
            end_millis,
            uuid,
        })
    }

    /// Prefix covering one `(tag, time_key, is_sold)` clustering run.
    pub fn prefix(tag: &str, time_key: i16, is_sold: bool) -> Vec<u8> {
        let mut buf = Vec::with_capacity(tag.len() + 4);
        push_tag(&mut buf, tag);
        buf.extend_from_slice(&order_i16(time_key).to_be_bytes());
        buf.push(is_sold as u8);
        buf
    }

    /// Prefix covering a whole tag partition.
    pub fn tag_prefix(tag: &str) -> Vec<u8> {
        let mut buf = Vec::with_capacity(tag.len() + 1);
        push_tag(&mut buf, tag);
        buf
    }
}

/// `auctions_by_uuid`: uuid + primary key, value = primary key bytes.
pub fn by_uuid_key(uuid: &Uuid, primary: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16 + primary.len());
    buf.extend_from_slice(uuid.as_bytes());
    buf.extend_from_slice(primary);
    buf
}

pub fn by_uuid_prefix(uuid: &Uuid) -> Vec<u8> {
    uuid.as_bytes().to_vec()
}

/// `auctions_by_seller`: seller + ¬end + uuid, value = primary key bytes.
pub fn by_seller_key(seller: &Uuid, end_millis: i64, uuid: &Uuid) -> Vec<u8> {
    let mut buf = Vec::with_capacity(40);
    buf.extend_from_slice(seller.as_bytes());
    buf.extend_from_slice(&complement_u64(end_millis as u64).to_be_bytes());
    buf.extend_from_slice(uuid.as_bytes());
    buf
}

/// Seek position inside a seller run: first entry with `end < before`.
pub fn by_seller_seek(seller: &Uuid, before_millis: i64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(24);
    buf.extend_from_slice(seller.as_bytes());
    buf.extend_from_slice(&complement_u64(before_millis.saturating_sub(1) as u64).to_be_bytes());
    buf
}

pub fn by_seller_end(bytes: &[u8]) -> Result<i64> {
    if bytes.len() < 24 {
        bail!("seller index key too short");
    }
    Ok(complement_u64(u64::from_be_bytes(bytes[16..24].try_into().unwrap())) as i64)
}

/// `auctions_by_item_uid`: item uid + uuid, value = primary key bytes.
pub fn by_item_uid_key(item_uid: i64, uuid: &Uuid) -> Vec<u8> {
    let mut buf = Vec::with_capacity(24);
    buf.extend_from_slice(&(item_uid as u64).to_be_bytes());
    buf.extend_from_slice(uuid.as_bytes());
    buf
}

/// `auctions_by_bidder`: highest bidder + uuid, value = primary key bytes.
pub fn by_bidder_key(bidder: &Uuid, uuid: &Uuid) -> Vec<u8> {
    let mut buf = Vec::with_capacity(32);
    buf.extend_from_slice(bidder.as_bytes());
    buf.extend_from_slice(uuid.as_bytes());
    buf
}

/// `bids`: partition by bidder, clustered `timestamp DESC`, then auction and
/// amount to keep distinct bids apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BidKey {
    pub bidder: Uuid,
    pub timestamp_millis: i64,
    pub auction_uuid: Uuid,
    pub amount: i64,
}

impl BidKey {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(48);
        buf.extend_from_slice(self.bidder.as_bytes());
        buf.extend_from_slice(&complement_u64(self.timestamp_millis as u64).to_be_bytes());
        buf.extend_from_slice(self.auction_uuid.as_bytes());
        buf.extend_from_slice(&(self.amount as u64).to_be_bytes());
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 48 {
            bail!("bid key has unexpected length {}", bytes.len());
        }
        Ok(BidKey {
            bidder: Uuid::from_slice(&bytes[0..16]).unwrap(),
            timestamp_millis: complement_u64(u64::from_be_bytes(
                bytes[16..24].try_into().unwrap(),
            )) as i64,
            auction_uuid: Uuid::from_slice(&bytes[24..40]).unwrap(),
            amount: u64::from_be_bytes(bytes[40..48].try_into().unwrap()) as i64,
        })
    }
}

/// `bids_by_auction`: auction uuid + bid key, value = bid key bytes.
pub fn bids_by_auction_key(auction_uuid: &Uuid, bid_key: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16 + bid_key.len());
    buf.extend_from_slice(auction_uuid.as_bytes());
    buf.extend_from_slice(bid_key);
    buf
}

/// `summaries`: partition `(tag, filter_key)`, clustered by day (ascending).
pub fn summary_key(tag: &str, filter_key: &str, day_start_secs: i64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(tag.len() + filter_key.len() + 10);
    push_tag(&mut buf, tag);
    buf.extend_from_slice(filter_key.as_bytes());
    buf.push(TAG_SEP);
    buf.extend_from_slice(&(day_start_secs as u64).to_be_bytes());
    buf
}

pub fn summary_prefix(tag: &str, filter_key: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(tag.len() + filter_key.len() + 2);
    push_tag(&mut buf, tag);
    buf.extend_from_slice(filter_key.as_bytes());
    buf.push(TAG_SEP);
    buf
}

pub fn summary_day(bytes: &[u8]) -> Result<i64> {
    if bytes.len() < 8 {
        bail!("summary key too short");
    }
    Ok(u64::from_be_bytes(bytes[bytes.len() - 8..].try_into().unwrap()) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auction_key_roundtrip() {
        let key = AuctionKey {
            tag: "DIAMOND_SWORD".into(),
            time_key: 283,
            is_sold: true,
            end_millis: 1_718_452_800_000,
            uuid: Uuid::new_v4(),
        };
        assert_eq!(AuctionKey::decode(&key.encode()).unwrap(), key);
    }

    #[test]
    fn test_auction_keys_order_newest_first_within_prefix() {
        let uuid = Uuid::new_v4();
        let older = AuctionKey {
            tag: "X".into(),
            time_key: 10,
            is_sold: true,
            end_millis: 1_000,
            uuid,
        };
        let newer = AuctionKey {
            end_millis: 2_000,
            ..older.clone()
        };
        // complemented end: the newer row encodes smaller, so it iterates first
        assert!(newer.encode() < older.encode());
    }

    #[test]
    fn test_tag_terminator_prevents_prefix_bleed() {
        let a = AuctionKey::tag_prefix("SWORD");
        let b = AuctionKey::tag_prefix("SWORD_2");
        assert!(!b.starts_with(&a));
    }

    #[test]
    fn test_negative_time_keys_sort_before_positive() {
        let neg = AuctionKey::prefix("X", -3, false);
        let pos = AuctionKey::prefix("X", 3, false);
        assert!(neg < pos);
    }

    #[test]
    fn test_bid_key_roundtrip_and_order() {
        let key = BidKey {
            bidder: Uuid::new_v4(),
            timestamp_millis: 1_700_000_000_000,
            auction_uuid: Uuid::new_v4(),
            amount: 5_000_000,
        };
        assert_eq!(BidKey::decode(&key.encode()).unwrap(), key);

        let later = BidKey {
            timestamp_millis: key.timestamp_millis + 1,
            ..key.clone()
        };
        assert!(later.encode() < key.encode());
    }

    #[test]
    fn test_seller_seek_starts_strictly_before_cutoff() {
        let seller = Uuid::new_v4();
        let uuid = Uuid::new_v4();
        let at_cutoff = by_seller_key(&seller, 5_000, &uuid);
        let below = by_seller_key(&seller, 4_999, &uuid);
        let seek = by_seller_seek(&seller, 5_000);
        assert!(seek > at_cutoff[..24].to_vec());
        assert!(seek <= below[..24].to_vec());
        assert_eq!(by_seller_end(&below).unwrap(), 4_999);
    }

    #[test]
    fn test_summary_key_day_extraction() {
        let key = summary_key("HYPERION", "TierMYTHIC", 1_718_409_600);
        assert!(key.starts_with(&summary_prefix("HYPERION", "TierMYTHIC")));
        assert_eq!(summary_day(&key).unwrap(), 1_718_409_600);
    }
}
