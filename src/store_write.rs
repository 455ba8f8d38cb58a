use std::collections::BTreeSet;

use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::identity::columns;
use crate::merge::{row_revision, DataRow};
use crate::store::{metadata_keys, TimeseriesStore};
use crate::RevisionRange;

// ---

pub(crate) fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .expect("RFC 3339 formatting of UTC time cannot fail")
}

/// Writes the merged result of one request back to the store, in a single
/// read-write transaction:
///
/// * `_accessTime` is bumped;
/// * each row is shallow-merged over any stored row at the same revision;
/// * for every data column, the actually-covered range
///   `[request.min, last_row.revision]` is merged into the stored
///   availability list (`revision` is the key and `alert` intentionally stays
///   unlisted so it is refetched every time);
/// * the remaining metadata keys are put as-is.
///
/// A result with no rows updates no ranges.
pub fn write_result(
    store: &TimeseriesStore,
    request_min: f64,
    result_columns: &BTreeSet<String>,
    rows: &[DataRow],
    metadata: &[(String, Value)],
) {
    let mut txn = store.read_write();
    txn.put_metadata(metadata_keys::ACCESS_TIME, Value::from(now_rfc3339()));

    for row in rows {
        let Some(revision) = row_revision(row) else {
            continue;
        };
        let merged = match txn.row(revision) {
            Some(existing) => {
                let mut merged = existing.clone();
                for (name, value) in row {
                    merged.insert(name.clone(), value.clone());
                }
                merged
            }
            None => row.clone(),
        };
        txn.put_row(merged);
    }

    if let Some(last_revision) = rows.last().and_then(row_revision) {
        let covered = RevisionRange::new(request_min, last_revision);
        for column in result_columns {
            if column == columns::REVISION || column == columns::ALERT {
                continue;
            }
            let mut ranges = txn.column_ranges(column);
            covered.merge_into_array(&mut ranges);
            txn.put_column_ranges(column.clone(), ranges);
        }
    }

    for (key, value) in metadata {
        txn.put_metadata(key.clone(), value.clone());
    }

    txn.commit();
    log::debug!("wrote {} rows to {:?}", rows.len(), store.name());
}

/// Records a negative result (remote 404) so the retry window can suppress
/// refetches of a timeseries that does not exist.
pub fn write_missing_timestamp(store: &TimeseriesStore) {
    let now = Value::from(now_rfc3339());
    let mut txn = store.read_write();
    txn.put_metadata(metadata_keys::ACCESS_TIME, now.clone());
    txn.put_metadata(metadata_keys::MISSING_TIMESTAMP, now);
    txn.commit();
    log::debug!("recorded missing timeseries for {:?}", store.name());
}

// ---

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreRegistry;

    fn row(pairs: &[(&str, f64)]) -> DataRow {
        pairs
            .iter()
            .map(|(name, value)| ((*name).to_owned(), Value::from(*value)))
            .collect()
    }

    fn result_columns(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|c| (*c).to_owned()).collect()
    }

    #[test]
    fn extends_column_ranges_to_covered_range() {
        let registry = StoreRegistry::new();
        let store = registry.open("timeseries/s/m/b//");

        let rows = vec![row(&[("revision", 10.0), ("avg", 1.0)])];
        write_result(
            &store,
            0.0,
            &result_columns(&["revision", "avg", "alert"]),
            &rows,
            &[],
        );

        let txn = store.read();
        assert_eq!(
            txn.column_ranges("avg"),
            vec![RevisionRange::new(0.0, 10.0)]
        );
        // The key column and alerts are never marked available.
        assert!(txn.column_ranges("revision").is_empty());
        assert!(txn.column_ranges("alert").is_empty());
        assert!(txn.metadata(metadata_keys::ACCESS_TIME).is_some());
    }

    #[test]
    fn rows_merge_over_existing_fields() {
        let registry = StoreRegistry::new();
        let store = registry.open("timeseries/s/m/b//");

        write_result(
            &store,
            0.0,
            &result_columns(&["revision", "avg"]),
            &[row(&[("revision", 10.0), ("avg", 1.0)])],
            &[],
        );
        write_result(
            &store,
            0.0,
            &result_columns(&["revision", "count"]),
            &[row(&[("revision", 10.0), ("count", 7.0)])],
            &[],
        );

        let txn = store.read();
        let rows = txn.all_rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("avg"), Some(&Value::from(1.0)));
        assert_eq!(rows[0].get("count"), Some(&Value::from(7.0)));
    }

    #[test]
    fn empty_result_updates_no_ranges() {
        let registry = StoreRegistry::new();
        let store = registry.open("timeseries/s/m/b//");

        write_result(&store, 0.0, &result_columns(&["revision", "avg"]), &[], &[]);

        let txn = store.read();
        assert!(txn.column_ranges("avg").is_empty());
        // Access time is still bumped.
        assert!(txn.metadata(metadata_keys::ACCESS_TIME).is_some());
    }

    #[test]
    fn missing_timestamp_is_recorded() {
        let registry = StoreRegistry::new();
        let store = registry.open("timeseries/s/m/b//");

        write_missing_timestamp(&store);

        let txn = store.read();
        let stored = txn.metadata(metadata_keys::MISSING_TIMESTAMP).unwrap();
        let parsed = OffsetDateTime::parse(stored.as_str().unwrap(), &Rfc3339);
        assert!(parsed.is_ok());
    }
}
