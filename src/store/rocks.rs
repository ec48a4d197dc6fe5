use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rocksdb::{
    BlockBasedOptions, BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, Direction,
    IteratorMode, MultiThreaded, Options, WriteBatch, WriteOptions,
};

use crate::metrics_const::{STORE_BATCH_SIZE, STORE_ERRORS, STORE_READ_OPS, STORE_WRITE_OPS};

/// One mutation inside an atomic write batch, tagged with its column family.
#[derive(Debug)]
pub enum BatchOp {
    Put {
        cf: &'static str,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        cf: &'static str,
        key: Vec<u8>,
    },
}

/// Thin wrapper over a multi-CF RocksDB: the column families are the tables
/// and indexes of the wide-column layout, and every key is an order-preserving
/// byte encoding so prefix iteration doubles as a clustering scan.
#[derive(Debug, Clone)]
pub struct RocksDbStore {
    pub(crate) db: Arc<DBWithThreadMode<MultiThreaded>>,
}

fn store_options() -> Options {
    let mut opts = Options::default();
    opts.create_if_missing(true);
    opts.create_missing_column_families(true);

    // Point lookups dominate the exists-check and the uuid indexes.
    let mut block_opts = BlockBasedOptions::default();
    block_opts.set_bloom_filter(10.0, false);
    block_opts.set_cache_index_and_filter_blocks(true);
    opts.set_block_based_table_factory(&block_opts);

    opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
    opts.increase_parallelism(std::cmp::max(2, num_cpus()) as i32);
    opts
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
}

impl RocksDbStore {
    pub fn open<P: AsRef<Path>>(path: P, column_families: &[&'static str]) -> Result<Self> {
        let descriptors: Vec<ColumnFamilyDescriptor> = column_families
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect();
        let db = DBWithThreadMode::<MultiThreaded>::open_cf_descriptors(
            &store_options(),
            path.as_ref(),
            descriptors,
        )
        .context("failed to open hot store")?;
        Ok(Self { db: Arc::new(db) })
    }

    pub fn cf(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .with_context(|| format!("column family not found: {name}"))
    }

    pub fn get(&self, cf_name: &'static str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        metrics::counter!(STORE_READ_OPS, &[("column_family", cf_name)]).increment(1);
        let cf = self.cf(cf_name)?;
        let result = self.db.get_cf(&cf, key).context("hot store read failed");
        if result.is_err() {
            metrics::counter!(STORE_ERRORS).increment(1);
        }
        result
    }

    pub fn multi_get(&self, cf_name: &'static str, keys: &[Vec<u8>]) -> Result<Vec<Option<Vec<u8>>>> {
        metrics::counter!(STORE_READ_OPS, &[("column_family", cf_name)]).increment(1);
        let cf = self.cf(cf_name)?;
        let keyed: Vec<_> = keys.iter().map(|k| (&cf, k.as_slice())).collect();
        self.db
            .multi_get_cf(keyed)
            .into_iter()
            .map(|r| r.context("hot store multi-get failed"))
            .collect()
    }

    pub fn put(&self, cf_name: &'static str, key: &[u8], value: &[u8]) -> Result<()> {
        metrics::counter!(STORE_WRITE_OPS, &[("column_family", cf_name)]).increment(1);
        let cf = self.cf(cf_name)?;
        self.db
            .put_cf(&cf, key, value)
            .context("hot store write failed")
    }

    /// Applies every mutation atomically in one unsynced write batch.
    pub fn apply(&self, ops: Vec<BatchOp>) -> Result<()> {
        metrics::histogram!(STORE_BATCH_SIZE).record(ops.len() as f64);
        let mut batch = WriteBatch::default();
        for op in &ops {
            match op {
                BatchOp::Put { cf, key, value } => {
                    let handle = self.cf(cf)?;
                    batch.put_cf(&handle, key, value);
                }
                BatchOp::Delete { cf, key } => {
                    let handle = self.cf(cf)?;
                    batch.delete_cf(&handle, key);
                }
            }
        }
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(false);
        let result = self
            .db
            .write_opt(batch, &write_opts)
            .context("hot store batch write failed");
        if result.is_err() {
            metrics::counter!(STORE_ERRORS).increment(1);
        }
        metrics::counter!(STORE_WRITE_OPS, &[("column_family", "batch")]).increment(1);
        result
    }

    /// Collects `(key, value)` pairs under `prefix`, in key order, up to
    /// `limit` (`usize::MAX` for unbounded).
    pub fn scan_prefix(
        &self,
        cf_name: &'static str,
        prefix: &[u8],
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        metrics::counter!(STORE_READ_OPS, &[("column_family", cf_name)]).increment(1);
        let cf = self.cf(cf_name)?;
        let mut out = Vec::new();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(prefix, Direction::Forward));
        for entry in iter {
            let (key, value) = entry.context("hot store iterator failed")?;
            if !key.starts_with(prefix) {
                break;
            }
            out.push((key.to_vec(), value.to_vec()));
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    /// Seek-based iteration for callers that skip ranges themselves (e.g.
    /// enumerating distinct key prefixes). Returns the first entry at or
    /// after `start`, if any.
    pub fn first_at_or_after(
        &self,
        cf_name: &'static str,
        start: &[u8],
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let cf = self.cf(cf_name)?;
        let mut iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(start, Direction::Forward));
        match iter.next() {
            Some(entry) => {
                let (key, value) = entry.context("hot store iterator failed")?;
                Ok(Some((key.to_vec(), value.to_vec())))
            }
            None => Ok(None),
        }
    }

    pub fn size_bytes(&self, cf_name: &'static str) -> Result<u64> {
        let cf = self.cf(cf_name)?;
        Ok(self
            .db
            .property_int_value_cf(&cf, "rocksdb.total-sst-files-size")?
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const TEST_CF: &str = "test_cf";

    fn test_store() -> (RocksDbStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = RocksDbStore::open(dir.path(), &[TEST_CF]).unwrap();
        (store, dir)
    }

    #[test]
    fn test_put_get_roundtrip() {
        let (store, _dir) = test_store();
        store.put(TEST_CF, b"k", b"v").unwrap();
        assert_eq!(store.get(TEST_CF, b"k").unwrap().unwrap(), b"v");
        assert!(store.get(TEST_CF, b"missing").unwrap().is_none());
    }

    #[test]
    fn test_apply_is_atomic_across_cfs() {
        let dir = TempDir::new().unwrap();
        let store = RocksDbStore::open(dir.path(), &["a", "b"]).unwrap();
        store
            .apply(vec![
                BatchOp::Put {
                    cf: "a",
                    key: b"k1".to_vec(),
                    value: b"v1".to_vec(),
                },
                BatchOp::Put {
                    cf: "b",
                    key: b"k2".to_vec(),
                    value: b"v2".to_vec(),
                },
            ])
            .unwrap();
        assert_eq!(store.get("a", b"k1").unwrap().unwrap(), b"v1");
        assert_eq!(store.get("b", b"k2").unwrap().unwrap(), b"v2");

        store
            .apply(vec![BatchOp::Delete {
                cf: "a",
                key: b"k1".to_vec(),
            }])
            .unwrap();
        assert!(store.get("a", b"k1").unwrap().is_none());
    }

    #[test]
    fn test_scan_prefix_respects_prefix_and_limit() {
        let (store, _dir) = test_store();
        store.put(TEST_CF, b"aa1", b"1").unwrap();
        store.put(TEST_CF, b"aa2", b"2").unwrap();
        store.put(TEST_CF, b"aa3", b"3").unwrap();
        store.put(TEST_CF, b"bb1", b"4").unwrap();

        let all = store.scan_prefix(TEST_CF, b"aa", usize::MAX).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].0, b"aa1");

        let limited = store.scan_prefix(TEST_CF, b"aa", 2).unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[test]
    fn test_first_at_or_after_seeks() {
        let (store, _dir) = test_store();
        store.put(TEST_CF, b"b", b"1").unwrap();
        store.put(TEST_CF, b"d", b"2").unwrap();
        let (key, _) = store.first_at_or_after(TEST_CF, b"c").unwrap().unwrap();
        assert_eq!(key, b"d");
        assert!(store.first_at_or_after(TEST_CF, b"e").unwrap().is_none());
    }

    #[test]
    fn test_unknown_cf_is_an_error() {
        let (store, _dir) = test_store();
        assert!(store.put("nope", b"k", b"v").is_err());
    }
}
