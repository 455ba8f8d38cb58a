use serde_json::Value;

use crate::identity::columns;

// ---

/// One data point: a mapping from column name to primitive value. Always
/// carries a `revision` entry.
pub type DataRow = serde_json::Map<String, Value>;

/// The `revision` field of a row, or `None` if absent or non-numeric.
#[inline]
pub fn row_revision(row: &DataRow) -> Option<f64> {
    row.get(columns::REVISION).and_then(Value::as_f64)
}

/// The smallest index `i` such that `key(rows[i]) >= lo`, or `rows.len()` if
/// no such index exists. Returns 0 on an empty slice.
#[inline]
pub fn find_low_index_in_sorted<T>(rows: &[T], key: impl Fn(&T) -> f64, lo: f64) -> usize {
    rows.partition_point(|row| key(row) < lo)
}

/// Merges each input row into `target`, which is kept sorted ascending by the
/// numeric `key` column. Rows with an existing key are shallow-merged
/// field-wise (last write wins); new keys are inserted at their sort
/// position. Rows lacking the key column are ignored.
pub fn merge_row_arrays(key: &str, target: &mut Vec<DataRow>, inputs: &[&[DataRow]]) {
    for input in inputs {
        for row in *input {
            let Some(row_key) = row.get(key).and_then(Value::as_f64) else {
                continue;
            };
            let index = find_low_index_in_sorted(
                target,
                |existing| {
                    existing
                        .get(key)
                        .and_then(Value::as_f64)
                        .unwrap_or(f64::NEG_INFINITY)
                },
                row_key,
            );
            let key_exists = target
                .get(index)
                .is_some_and(|existing| existing.get(key).and_then(Value::as_f64) == Some(row_key));
            if key_exists {
                let existing = &mut target[index];
                for (name, value) in row {
                    existing.insert(name.clone(), value.clone());
                }
            } else {
                target.insert(index, row.clone());
            }
        }
    }
}

// ---
