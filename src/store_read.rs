use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use crate::identity::columns;
use crate::merge::DataRow;
use crate::store::{metadata_keys, TimeseriesStore};
use crate::RevisionRange;

// ---

/// Everything the cache knows about one request, clipped to its range.
#[derive(Clone, Debug, Default)]
pub struct CachedResult {
    pub improvement_direction: Option<Value>,
    pub units: Option<Value>,

    /// RFC 3339 timestamp of the last negative result, if any.
    pub missing_timestamp: Option<String>,

    /// For each requested column with cached coverage: the intersection of
    /// its first overlapping stored range with the request range. Columns
    /// with no overlap are absent.
    pub available_range_by_col: BTreeMap<String, RevisionRange>,

    /// Cached rows in the request range; `None` when no requested column has
    /// any coverage.
    pub data: Option<Vec<DataRow>>,
}

/// Reads rows, metadata and per-column availability in one read transaction.
///
/// `read_all` is set when the request carried neither revision bound, in
/// which case every stored row is returned rather than a clipped scan.
pub fn read_cached(
    store: &TimeseriesStore,
    request_range: &RevisionRange,
    read_all: bool,
    request_columns: &BTreeSet<String>,
) -> CachedResult {
    let txn = store.read();

    let rows = if read_all {
        txn.all_rows()
    } else {
        txn.rows_in_range(request_range)
    };

    let mut result = CachedResult {
        improvement_direction: txn.metadata(metadata_keys::IMPROVEMENT_DIRECTION),
        units: txn.metadata(metadata_keys::UNITS),
        missing_timestamp: txn
            .metadata(metadata_keys::MISSING_TIMESTAMP)
            .and_then(|value| value.as_str().map(str::to_owned)),
        ..Default::default()
    };

    for column in request_columns {
        if column == columns::REVISION {
            continue;
        }
        let overlap = txn
            .column_ranges(column)
            .iter()
            .map(|stored| stored.intersection(request_range))
            .find(|intersection| !intersection.is_empty());
        if let Some(overlap) = overlap {
            result.available_range_by_col.insert(column.clone(), overlap);
        }
    }

    log::debug!(
        "cache read for {:?}: {} rows, {} columns available",
        store.name(),
        rows.len(),
        result.available_range_by_col.len()
    );

    if !result.available_range_by_col.is_empty() {
        result.data = Some(rows);
    }
    result
}

// ---
