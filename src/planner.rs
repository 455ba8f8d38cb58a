use std::collections::{BTreeMap, BTreeSet};

use smallvec::smallvec;

use crate::identity::columns;
use crate::RevisionRange;

// ---

/// A remote fetch the planner decided is necessary: one sub-range × column
/// subset. Materialized into a [`crate::TimeseriesSlice`] once the in-flight
/// coalescer has had its say.
#[derive(Clone, Debug, PartialEq)]
pub struct PlannedSlice {
    pub revision_range: RevisionRange,
    pub columns: BTreeSet<String>,
}

fn column_set<'a>(names: impl IntoIterator<Item = &'a str>) -> BTreeSet<String> {
    names.into_iter().map(str::to_owned).collect()
}

/// Computes the minimal set of remote slices not already covered by the
/// cache.
///
/// `available` maps each requested column to its cached coverage clipped to
/// the request range (see [`crate::store_read::read_cached`]). `alert` never
/// appears there, which is what forces a live fetch for alerts on every
/// request; `histogram` is split off into dedicated slices.
pub fn plan_slices(
    request_range: &RevisionRange,
    request_columns: &BTreeSet<String>,
    available: &BTreeMap<String, RevisionRange>,
) -> Vec<PlannedSlice> {
    let mut remaining = request_columns.clone();
    let mut slices = Vec::new();

    // Histograms are heavyweight: one dedicated slice per missing sub-range.
    if remaining.remove(columns::HISTOGRAM) {
        let missing = match available.get(columns::HISTOGRAM) {
            Some(cached) => request_range.difference(cached),
            None => smallvec![*request_range],
        };
        for revision_range in missing {
            slices.push(PlannedSlice {
                revision_range,
                columns: column_set([columns::REVISION, columns::HISTOGRAM]),
            });
        }
    }

    // Columns whose cached coverage spans the whole request drop out.
    // `revision` is the key, not data; `alert` is never considered cached.
    remaining.retain(|column| {
        column == columns::REVISION
            || column == columns::ALERT
            || available
                .get(column)
                .is_none_or(|cached| cached.duration() != request_range.duration())
    });

    // Everything cached: no network traffic needed.
    if remaining.iter().all(|column| column == columns::REVISION) {
        log::debug!("request fully cached, {} histogram slices", slices.len());
        return slices;
    }

    // One fetch per gap in the common coverage of the remaining columns. A
    // column with no coverage at all empties the intersection, so the whole
    // request range is fetched for the group.
    let mut common: Option<RevisionRange> = None;
    for column in remaining.iter().filter(|column| *column != columns::REVISION) {
        let cached = available
            .get(column)
            .copied()
            .unwrap_or(RevisionRange::EMPTY);
        common = Some(match common {
            None => cached,
            Some(acc) => acc.intersection(&cached),
        });
    }
    let common = common.unwrap_or(RevisionRange::EMPTY);

    let mut slice_columns = remaining;
    slice_columns.insert(columns::REVISION.to_owned());
    for revision_range in request_range.difference(&common) {
        slices.push(PlannedSlice {
            revision_range,
            columns: slice_columns.clone(),
        });
    }

    log::debug!(
        "planned {} slices for request range {request_range}",
        slices.len()
    );
    slices
}

// ---

#[cfg(test)]
mod tests {
    use super::*;

    fn range(min: f64, max: f64) -> RevisionRange {
        RevisionRange::new(min, max)
    }

    #[test]
    fn cold_cache_is_one_slice() {
        let slices = plan_slices(
            &range(0.0, 100.0),
            &column_set(["revision", "avg"]),
            &BTreeMap::new(),
        );
        assert_eq!(
            slices,
            vec![PlannedSlice {
                revision_range: range(0.0, 100.0),
                columns: column_set(["revision", "avg"]),
            }]
        );
    }

    #[test]
    fn fully_cached_needs_no_slices() {
        let available = BTreeMap::from([("avg".to_owned(), range(0.0, 100.0))]);
        let slices = plan_slices(
            &range(0.0, 100.0),
            &column_set(["revision", "avg"]),
            &available,
        );
        assert!(slices.is_empty());
    }

    #[test]
    fn partial_cache_fetches_the_gap() {
        let available = BTreeMap::from([("avg".to_owned(), range(50.0, 100.0))]);
        let slices = plan_slices(
            &range(50.0, 200.0),
            &column_set(["revision", "avg"]),
            &available,
        );
        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0].revision_range, range(100.0, 200.0));
    }

    #[test]
    fn alert_always_fetches() {
        let available = BTreeMap::from([("avg".to_owned(), range(0.0, 100.0))]);
        let slices = plan_slices(
            &range(0.0, 100.0),
            &column_set(["revision", "avg", "alert"]),
            &available,
        );
        // avg is served from cache; only the alerts go over the wire.
        assert_eq!(
            slices,
            vec![PlannedSlice {
                revision_range: range(0.0, 100.0),
                columns: column_set(["revision", "alert"]),
            }]
        );
    }

    #[test]
    fn histograms_get_their_own_slices() {
        let available = BTreeMap::from([
            ("avg".to_owned(), range(0.0, 100.0)),
            ("histogram".to_owned(), range(0.0, 50.0)),
        ]);
        let slices = plan_slices(
            &range(0.0, 100.0),
            &column_set(["revision", "avg", "histogram"]),
            &available,
        );
        assert_eq!(
            slices,
            vec![PlannedSlice {
                revision_range: range(50.0, 100.0),
                columns: column_set(["revision", "histogram"]),
            }]
        );
    }

    #[test]
    fn hole_in_the_middle_yields_two_slices() {
        let available = BTreeMap::from([("avg".to_owned(), range(40.0, 60.0))]);
        let slices = plan_slices(
            &range(0.0, 100.0),
            &column_set(["revision", "avg"]),
            &available,
        );
        assert_eq!(slices.len(), 2);
        assert_eq!(slices[0].revision_range, range(0.0, 40.0));
        assert_eq!(slices[1].revision_range, range(60.0, 100.0));
    }

    #[test]
    fn uncached_column_forces_full_group_fetch() {
        // `count` has no coverage, so the group intersection is empty and the
        // whole request range is fetched for both columns.
        let available = BTreeMap::from([("avg".to_owned(), range(0.0, 60.0))]);
        let slices = plan_slices(
            &range(0.0, 100.0),
            &column_set(["revision", "avg", "count"]),
            &available,
        );
        assert_eq!(
            slices,
            vec![PlannedSlice {
                revision_range: range(0.0, 100.0),
                columns: column_set(["revision", "avg", "count"]),
            }]
        );
    }

    #[test]
    fn planned_coverage_spans_the_request() {
        // Union of cached availability and planned slices covers the request
        // for every data column, and planned slices never overlap.
        let available = BTreeMap::from([("avg".to_owned(), range(20.0, 70.0))]);
        let request = range(0.0, 100.0);
        let slices = plan_slices(&request, &column_set(["revision", "avg"]), &available);

        let mut covered = vec![available["avg"]];
        for slice in &slices {
            for existing in &covered {
                assert!(slice
                    .revision_range
                    .intersection(existing)
                    .duration()
                    .abs()
                    <= f64::EPSILON);
            }
            slice.revision_range.merge_into_array(&mut covered);
        }
        assert_eq!(covered, vec![request]);
    }
}
