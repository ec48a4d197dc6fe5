use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use uuid::Uuid;

use crate::error::ArchiveError;
use crate::types::Auction;

/// Compiled filter expression. The query layer only ever consumes this
/// opaque predicate; the raw string map is what summary keys derive from.
pub type Predicate = Arc<dyn Fn(&Auction) -> bool + Send + Sync>;

/// Filter names that scope the time range instead of matching rows.
pub const END_AFTER: &str = "EndAfter";
pub const END_BEFORE: &str = "EndBefore";

fn is_time_bound(key: &str) -> bool {
    key == END_AFTER || key == END_BEFORE
}

/// Cache key for memoized summaries: filter names and values concatenated in
/// key order, with the time bounds excluded so a sliding window reuses rows.
pub fn filter_key(filters: &BTreeMap<String, String>) -> String {
    let mut key = String::new();
    for (name, value) in filters {
        if is_time_bound(name) {
            continue;
        }
        key.push_str(name);
        key.push_str(value);
    }
    key
}

pub fn parse_time(value: &str) -> Result<DateTime<Utc>, ArchiveError> {
    if let Ok(secs) = value.parse::<i64>() {
        return Utc
            .timestamp_opt(secs, 0)
            .single()
            .ok_or_else(|| ArchiveError::InvalidInput(format!("timestamp out of range: {value}")));
    }
    value
        .parse::<DateTime<Utc>>()
        .map_err(|_| ArchiveError::InvalidInput(format!("unparseable time filter: {value}")))
}

/// Extracts the `(EndAfter, EndBefore]` window, defaulting the upper bound to
/// `now` and the lower to `default_window` before it.
pub fn time_bounds(
    filters: &BTreeMap<String, String>,
    now: DateTime<Utc>,
    default_window: chrono::Duration,
) -> Result<(DateTime<Utc>, DateTime<Utc>), ArchiveError> {
    let end = match filters.get(END_BEFORE) {
        Some(v) => parse_time(v)?,
        None => now,
    };
    let start = match filters.get(END_AFTER) {
        Some(v) => parse_time(v)?,
        None => end - default_window,
    };
    if start > end {
        return Err(ArchiveError::InvalidInput(
            "EndAfter is later than EndBefore".to_string(),
        ));
    }
    Ok((start, end))
}

fn parse_bool(value: &str) -> Result<bool, ArchiveError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        other => Err(ArchiveError::InvalidInput(format!(
            "expected boolean, got {other}"
        ))),
    }
}

/// Compiles the raw `key=value` map into a predicate over auctions.
///
/// Reserved names match typed fields; anything else matches the flattened
/// NBT attribute of the same name. Time bounds are handled by the scan range
/// and are ignored here.
pub fn compile(filters: &BTreeMap<String, String>) -> Result<Predicate, ArchiveError> {
    let mut clauses: Vec<Predicate> = Vec::new();
    for (name, value) in filters {
        if is_time_bound(name) {
            continue;
        }
        let clause: Predicate = match name.as_str() {
            "Tier" | "Rarity" => {
                let want = value.to_ascii_uppercase();
                Arc::new(move |a: &Auction| a.tier.eq_ignore_ascii_case(&want))
            }
            "Category" => {
                let want = value.to_ascii_uppercase();
                Arc::new(move |a: &Auction| a.category.eq_ignore_ascii_case(&want))
            }
            "Bin" => {
                let want = parse_bool(value)?;
                Arc::new(move |a: &Auction| a.bin == want)
            }
            "Seller" => {
                let want = Uuid::parse_str(value).map_err(|_| {
                    ArchiveError::InvalidInput(format!("invalid seller uuid: {value}"))
                })?;
                Arc::new(move |a: &Auction| a.seller == want)
            }
            "ItemName" => {
                let want = value.clone();
                Arc::new(move |a: &Auction| a.item_name.contains(&want))
            }
            "Enchantment" => {
                let want = value.clone();
                Arc::new(move |a: &Auction| a.enchantments.contains_key(&want))
            }
            "EnchantLvl" => {
                let want: i32 = value.parse().map_err(|_| {
                    ArchiveError::InvalidInput(format!("invalid enchantment level: {value}"))
                })?;
                Arc::new(move |a: &Auction| a.enchantments.values().any(|lvl| *lvl == want))
            }
            _ => {
                let key = name.clone();
                let want = value.clone();
                Arc::new(move |a: &Auction| a.flat_nbt.get(&key) == Some(&want))
            }
        };
        clauses.push(clause);
    }
    Ok(Arc::new(move |a: &Auction| {
        clauses.iter().all(|clause| clause(a))
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::epoch;
    use std::collections::BTreeMap;

    fn auction_with(tier: &str, bin: bool) -> Auction {
        Auction {
            uuid: Uuid::new_v4(),
            tag: "HYPERION".into(),
            item_name: "Hyperion".into(),
            category: "WEAPON".into(),
            tier: tier.into(),
            bin,
            starting_bid: 0,
            highest_bid_amount: 0,
            seller: Uuid::new_v4(),
            profile_id: Uuid::nil(),
            coop_members: vec![],
            start: epoch(),
            end: Utc::now(),
            item_created_at: epoch(),
            item_bytes: vec![],
            flat_nbt: BTreeMap::new(),
            enchantments: BTreeMap::new(),
            count: 1,
            bids: vec![],
        }
    }

    #[test]
    fn test_filter_key_sorted_and_excludes_time_bounds() {
        let mut filters = BTreeMap::new();
        filters.insert("Tier".to_string(), "MYTHIC".to_string());
        filters.insert("Bin".to_string(), "true".to_string());
        filters.insert(END_AFTER.to_string(), "1700000000".to_string());
        filters.insert(END_BEFORE.to_string(), "1700100000".to_string());
        assert_eq!(filter_key(&filters), "BintrueTierMYTHIC");
    }

    #[test]
    fn test_compile_matches_tier_case_insensitively() {
        let mut filters = BTreeMap::new();
        filters.insert("Tier".to_string(), "mythic".to_string());
        let pred = compile(&filters).unwrap();
        assert!(pred(&auction_with("MYTHIC", false)));
        assert!(!pred(&auction_with("LEGENDARY", false)));
    }

    #[test]
    fn test_compile_conjoins_clauses() {
        let mut filters = BTreeMap::new();
        filters.insert("Tier".to_string(), "MYTHIC".to_string());
        filters.insert("Bin".to_string(), "true".to_string());
        let pred = compile(&filters).unwrap();
        assert!(pred(&auction_with("MYTHIC", true)));
        assert!(!pred(&auction_with("MYTHIC", false)));
    }

    #[test]
    fn test_unknown_key_matches_flat_nbt() {
        let mut filters = BTreeMap::new();
        filters.insert("modifier".to_string(), "withered".to_string());
        let pred = compile(&filters).unwrap();
        let mut a = auction_with("MYTHIC", false);
        assert!(!pred(&a));
        a.flat_nbt
            .insert("modifier".to_string(), "withered".to_string());
        assert!(pred(&a));
    }

    #[test]
    fn test_malformed_bool_is_invalid_input() {
        let mut filters = BTreeMap::new();
        filters.insert("Bin".to_string(), "maybe".to_string());
        assert!(matches!(
            compile(&filters),
            Err(ArchiveError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_time_bounds_parse_unix_seconds_and_dates() {
        let now = Utc::now();
        let mut filters = BTreeMap::new();
        filters.insert(END_AFTER.to_string(), "1700000000".to_string());
        filters.insert(END_BEFORE.to_string(), "2023-11-20T00:00:00Z".to_string());
        let (t0, t1) = time_bounds(&filters, now, chrono::Duration::days(7)).unwrap();
        assert_eq!(t0.timestamp(), 1_700_000_000);
        assert_eq!(t1, "2023-11-20T00:00:00Z".parse::<DateTime<Utc>>().unwrap());
    }

    #[test]
    fn test_inverted_time_bounds_rejected() {
        let now = Utc::now();
        let mut filters = BTreeMap::new();
        filters.insert(END_AFTER.to_string(), "1700100000".to_string());
        filters.insert(END_BEFORE.to_string(), "1700000000".to_string());
        assert!(time_bounds(&filters, now, chrono::Duration::days(7)).is_err());
    }
}
