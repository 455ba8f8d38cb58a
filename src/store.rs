use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde_json::Value;

use crate::identity::STORE_SCHEMA_VERSION;
use crate::merge::{row_revision, DataRow};
use crate::RevisionRange;

// ---

/// Well-known keys of the `metadata` sub-store.
pub mod metadata_keys {
    pub const IMPROVEMENT_DIRECTION: &str = "improvement_direction";
    pub const UNITS: &str = "units";

    /// RFC 3339 timestamp of the last remote fetch that returned "not found".
    pub const MISSING_TIMESTAMP: &str = "missingTimestamp";

    /// RFC 3339 timestamp of the last write. Never consulted here; kept for
    /// external evictors.
    pub const ACCESS_TIME: &str = "_accessTime";
}

/// Revision used as an ordered map key. Total order over f64 so the data
/// sub-store iterates in numeric revision order.
#[derive(Clone, Copy, Debug, PartialEq)]
struct RevisionKey(f64);

impl Eq for RevisionKey {}

impl PartialOrd for RevisionKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RevisionKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

// ---

/// The three sub-stores backing one timeseries identity.
#[derive(Default)]
struct StoreInner {
    /// Key: revision.
    data: BTreeMap<RevisionKey, DataRow>,

    metadata: BTreeMap<String, Value>,

    /// Key: column name. Value: sorted, disjoint ranges.
    ranges: BTreeMap<String, Vec<RevisionRange>>,
}

/// The persistent store for one timeseries identity.
///
/// Embedded in-memory engine: a [`parking_lot::RwLock`] around three ordered
/// maps. Transactions are synchronous and scoped; a read-write transaction
/// buffers its writes and applies them on [`WriteTransaction::commit`], so a
/// transaction dropped early leaves the store untouched. Exclusive guards
/// give the single-writer, linearizable semantics the rest of the crate
/// relies on.
pub struct TimeseriesStore {
    name: String,
    inner: RwLock<StoreInner>,
}

impl TimeseriesStore {
    fn new(name: String) -> Self {
        Self {
            name,
            inner: RwLock::new(StoreInner::default()),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn read(&self) -> ReadTransaction<'_> {
        ReadTransaction {
            inner: self.inner.read(),
        }
    }

    pub fn read_write(&self) -> WriteTransaction<'_> {
        WriteTransaction {
            inner: self.inner.write(),
            rows: Vec::new(),
            metadata: Vec::new(),
            ranges: Vec::new(),
        }
    }
}

// ---

pub struct ReadTransaction<'a> {
    inner: RwLockReadGuard<'a, StoreInner>,
}

impl ReadTransaction<'_> {
    pub fn all_rows(&self) -> Vec<DataRow> {
        self.inner.data.values().cloned().collect()
    }

    /// Rows whose revision lies in the inclusive `range`.
    pub fn rows_in_range(&self, range: &RevisionRange) -> Vec<DataRow> {
        if range.is_empty() {
            return Vec::new();
        }
        self.inner
            .data
            .range(RevisionKey(range.min)..=RevisionKey(range.max))
            .map(|(_, row)| row.clone())
            .collect()
    }

    pub fn metadata(&self, key: &str) -> Option<Value> {
        self.inner.metadata.get(key).cloned()
    }

    /// The stored availability list for `column`; empty if none recorded.
    pub fn column_ranges(&self, column: &str) -> Vec<RevisionRange> {
        self.inner.ranges.get(column).cloned().unwrap_or_default()
    }
}

// ---

pub struct WriteTransaction<'a> {
    inner: RwLockWriteGuard<'a, StoreInner>,
    rows: Vec<(RevisionKey, DataRow)>,
    metadata: Vec<(String, Value)>,
    ranges: Vec<(String, Vec<RevisionRange>)>,
}

impl WriteTransaction<'_> {
    /// The committed row at `revision`, if any. Does not see this
    /// transaction's own buffered writes.
    pub fn row(&self, revision: f64) -> Option<&DataRow> {
        self.inner.data.get(&RevisionKey(revision))
    }

    /// Buffers a row write. Rows lacking a numeric `revision` are dropped.
    pub fn put_row(&mut self, row: DataRow) {
        match row_revision(&row) {
            Some(revision) => self.rows.push((RevisionKey(revision), row)),
            None => log::warn!("dropping row without a revision key"),
        }
    }

    pub fn metadata(&self, key: &str) -> Option<Value> {
        self.inner.metadata.get(key).cloned()
    }

    pub fn put_metadata(&mut self, key: impl Into<String>, value: Value) {
        self.metadata.push((key.into(), value));
    }

    pub fn column_ranges(&self, column: &str) -> Vec<RevisionRange> {
        self.inner.ranges.get(column).cloned().unwrap_or_default()
    }

    pub fn put_column_ranges(&mut self, column: impl Into<String>, ranges: Vec<RevisionRange>) {
        self.ranges.push((column.into(), ranges));
    }

    /// Applies all buffered writes atomically.
    pub fn commit(mut self) {
        for (key, row) in std::mem::take(&mut self.rows) {
            self.inner.data.insert(key, row);
        }
        for (key, value) in std::mem::take(&mut self.metadata) {
            self.inner.metadata.insert(key, value);
        }
        for (column, ranges) in std::mem::take(&mut self.ranges) {
            self.inner.ranges.insert(column, ranges);
        }
    }
}

// ---

/// Process-wide map from store name to open store. Stores are created on
/// first access.
#[derive(Default)]
pub struct StoreRegistry {
    stores: Mutex<ahash::HashMap<String, Arc<TimeseriesStore>>>,
}

impl StoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self, name: &str) -> Arc<TimeseriesStore> {
        let mut stores = self.stores.lock();
        if let Some(store) = stores.get(name) {
            return Arc::clone(store);
        }
        log::debug!("creating store {name:?} (schema v{STORE_SCHEMA_VERSION})");
        let store = Arc::new(TimeseriesStore::new(name.to_owned()));
        stores.insert(name.to_owned(), Arc::clone(&store));
        store
    }
}

// ---
