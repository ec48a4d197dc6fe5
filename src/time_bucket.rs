use chrono::{DateTime, Duration, TimeZone, Utc};
use once_cell::sync::Lazy;
use rand::Rng;

/// Origin of the bucket axis. Buckets count fixed-width windows from here.
static BUCKET_EPOCH: Lazy<DateTime<Utc>> =
    Lazy::new(|| Utc.with_ymd_and_hms(2019, 1, 1, 0, 0, 0).unwrap());

/// Cutoff below which high-volume tags carry corrupted legacy timestamps.
static LEGACY_CUTOFF: Lazy<DateTime<Utc>> =
    Lazy::new(|| Utc.with_ymd_and_hms(2000, 6, 1, 0, 0, 0).unwrap());

const WEEK_MS: i64 = 7 * 24 * 3600 * 1000;
const HALF_DAY_MS: i64 = 12 * 3600 * 1000;

/// The two tags with enough volume to need half-day partitions instead of
/// weekly ones. The empty tag covers rows ingested before tags existed.
fn is_high_volume(tag: &str) -> bool {
    tag == "ENCHANTED_BOOK" || tag == "unknown" || tag.is_empty()
}

pub fn bucket_width_ms(tag: &str) -> i64 {
    if is_high_volume(tag) {
        HALF_DAY_MS
    } else {
        WEEK_MS
    }
}

/// Maps `(tag, end_time)` to the partition bucket.
///
/// Deterministic except for the legacy fixup: pre-2000-06 timestamps on
/// high-volume tags are garbage from the earliest imports and get scattered
/// into a random small bucket so they cannot pile onto bucket zero.
pub fn bucket(tag: &str, t: DateTime<Utc>) -> i16 {
    if is_high_volume(tag) && t < *LEGACY_CUTOFF {
        return rand::thread_rng().gen_range(0..10);
    }
    bucket_floor(tag, t)
}

/// Bucket of `t` without the legacy fixup. Scan endpoints must stay
/// deterministic even when a caller passes a pre-2000 lower bound, and
/// extreme dates saturate instead of wrapping the i16.
pub fn bucket_floor(tag: &str, t: DateTime<Utc>) -> i16 {
    let elapsed = t.signed_duration_since(*BUCKET_EPOCH).num_milliseconds();
    elapsed
        .div_euclid(bucket_width_ms(tag))
        .clamp(i16::MIN as i64, i16::MAX as i64) as i16
}

/// Nominal start of a bucket's window.
pub fn date_of(tag: &str, b: i16) -> DateTime<Utc> {
    *BUCKET_EPOCH + Duration::milliseconds(b as i64 * bucket_width_ms(tag))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_is_monotone_for_fixed_tag() {
        let t1 = Utc.with_ymd_and_hms(2023, 3, 1, 0, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2023, 9, 1, 0, 0, 0).unwrap();
        let t3 = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        for tag in ["DIAMOND_SWORD", "ENCHANTED_BOOK"] {
            assert!(bucket(tag, t1) <= bucket(tag, t2));
            assert!(bucket(tag, t2) <= bucket(tag, t3));
        }
    }

    #[test]
    fn test_high_volume_tags_use_narrow_buckets() {
        let t = Utc.with_ymd_and_hms(2023, 6, 15, 13, 0, 0).unwrap();
        let wide = bucket("DIAMOND_SWORD", t);
        let narrow = bucket("ENCHANTED_BOOK", t);
        // 12h buckets advance 14x faster than weekly ones
        assert!(narrow as i32 > wide as i32 * 10);
    }

    #[test]
    fn test_bucket_roundtrips_through_date_of() {
        let t = Utc.with_ymd_and_hms(2024, 2, 10, 8, 30, 0).unwrap();
        for tag in ["HYPERION", "ENCHANTED_BOOK"] {
            let b = bucket(tag, t);
            let start = date_of(tag, b);
            assert!(start <= t);
            assert!(t < start + Duration::milliseconds(bucket_width_ms(tag)));
            assert_eq!(bucket(tag, start), b);
        }
    }

    #[test]
    fn test_legacy_dates_land_in_a_small_bucket() {
        let ancient = Utc.with_ymd_and_hms(1970, 1, 1, 0, 0, 1).unwrap();
        for _ in 0..50 {
            let b = bucket("ENCHANTED_BOOK", ancient);
            assert!((0..10).contains(&b));
        }
    }

    #[test]
    fn test_legacy_fixup_only_applies_to_high_volume_tags() {
        let ancient = Utc.with_ymd_and_hms(1970, 1, 1, 0, 0, 1).unwrap();
        // Ordinary tags keep the deterministic (negative) bucket.
        assert_eq!(bucket("HYPERION", ancient), bucket("HYPERION", ancient));
        assert!(bucket("HYPERION", ancient) < 0);
    }
}
