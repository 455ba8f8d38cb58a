use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt as _};
use itertools::Itertools as _;
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::identity::{columns, TimeseriesIdentity, DEFAULT_STATISTIC};
use crate::inflight::{InflightRegistry, RequestState};
use crate::merge::{merge_row_arrays, row_revision, DataRow};
use crate::planner::plan_slices;
use crate::slice::{SliceResponse, TimeseriesSlice, Transport, MAX_RETRIES, STATUS_NOT_FOUND};
use crate::store::{metadata_keys, StoreRegistry, TimeseriesStore};
use crate::store_read::read_cached;
use crate::store_write::{write_missing_timestamp, write_result};
use crate::{RequestError, RevisionRange};

// ---

/// Refetch suppression window after a remote "not found": 2.8 days.
pub const MISSING_RETRY_WINDOW: Duration = Duration::from_secs(241_920);

/// Snapshots per request are few and small; this only smooths the handoff to
/// a slow consumer.
const SNAPSHOT_CHANNEL_CAPACITY: usize = 8;

#[derive(Clone, Debug)]
pub struct CacheConfig {
    /// Target of slice fetches, and the base of result-channel names.
    pub api_url: String,
    pub method: String,
    pub max_retries: u32,
    pub missing_retry_window: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            api_url: "/api/timeseries2".to_owned(),
            method: "POST".to_owned(),
            max_retries: MAX_RETRIES,
            missing_retry_window: MISSING_RETRY_WINDOW,
        }
    }
}

// ---

/// A parsed inbound request: one timeseries, a revision range and a column
/// set.
#[derive(Clone, Debug, PartialEq)]
pub struct TimeseriesRequest {
    pub identity: TimeseriesIdentity,
    pub statistic: String,

    /// Always contains `revision`.
    pub columns: BTreeSet<String>,

    pub min_revision: Option<i64>,
    pub max_revision: Option<i64>,
}

impl TimeseriesRequest {
    /// Builds a request from decoded form pairs. Unknown keys are ignored;
    /// `columns` is required, everything else has defaults.
    pub fn from_form_pairs<K, V>(
        pairs: impl IntoIterator<Item = (K, V)>,
    ) -> Result<Self, RequestError>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut test_suite = String::new();
        let mut measurement = String::new();
        let mut bot = String::new();
        let mut test_case = String::new();
        let mut build_type = String::new();
        let mut statistic = String::new();
        let mut columns_param: Option<String> = None;
        let mut min_revision = None;
        let mut max_revision = None;

        fn parse_revision(param: &'static str, value: &str) -> Result<i64, RequestError> {
            value
                .parse()
                .map_err(|_| RequestError::InvalidParameter {
                    param,
                    value: value.to_owned(),
                })
        }

        for (key, value) in pairs {
            let value = value.as_ref();
            match key.as_ref() {
                "test_suite" => test_suite = value.to_owned(),
                "measurement" => measurement = value.to_owned(),
                "bot" => bot = value.to_owned(),
                "test_case" => test_case = value.to_owned(),
                "build_type" => build_type = value.to_owned(),
                "statistic" => statistic = value.to_owned(),
                "columns" => columns_param = Some(value.to_owned()),
                "min_revision" => min_revision = Some(parse_revision("min_revision", value)?),
                "max_revision" => max_revision = Some(parse_revision("max_revision", value)?),
                _ => {}
            }
        }

        let columns_param = columns_param
            .filter(|param| !param.is_empty())
            .ok_or(RequestError::MissingParameter("columns"))?;
        let mut column_names: BTreeSet<String> = columns_param
            .split(',')
            .filter(|name| !name.is_empty())
            .map(str::to_owned)
            .collect();
        column_names.insert(columns::REVISION.to_owned());

        if statistic.is_empty() {
            statistic = DEFAULT_STATISTIC.to_owned();
        }

        Ok(Self {
            identity: TimeseriesIdentity::new(test_suite, measurement, bot, test_case, build_type)?,
            statistic,
            columns: column_names,
            min_revision,
            max_revision,
        })
    }

    /// The inclusive revision range, with defaults 0 and the unbounded
    /// sentinel.
    pub fn revision_range(&self) -> RevisionRange {
        RevisionRange::new(
            self.min_revision.unwrap_or(0) as f64,
            self.max_revision.map_or(f64::INFINITY, |max| max as f64),
        )
    }

    /// Whether neither revision bound was given, in which case the cache
    /// reader returns every stored row.
    pub fn is_unbounded(&self) -> bool {
        self.min_revision.is_none() && self.max_revision.is_none()
    }

    /// Canonical form-encoded body for this request.
    pub fn form_body(&self) -> String {
        let mut body = url::form_urlencoded::Serializer::new(String::new());
        body.append_pair("test_suite", &self.identity.test_suite);
        body.append_pair("measurement", &self.identity.measurement);
        body.append_pair("bot", &self.identity.bot);
        body.append_pair("statistic", &self.statistic);
        body.append_pair("columns", &self.columns.iter().join(","));
        if !self.identity.build_type.is_empty() {
            body.append_pair("build_type", &self.identity.build_type);
        }
        if !self.identity.test_case.is_empty() {
            body.append_pair("test_case", &self.identity.test_case);
        }
        if let Some(min_revision) = self.min_revision {
            body.append_pair("min_revision", &min_revision.to_string());
        }
        if let Some(max_revision) = self.max_revision {
            body.append_pair("max_revision", &max_revision.to_string());
        }
        body.finish()
    }

    /// Name of the side-channel carrying snapshots after the initial HTTP
    /// response.
    pub fn channel_name(&self, url: &str) -> String {
        format!("{url}?{}", self.form_body())
    }
}

// ---

/// One element of the result stream: the cached state, then one increment
/// per completed slice.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize)]
pub struct Snapshot {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub improvement_direction: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub units: Option<Value>,

    #[serde(rename = "missingTimestamp", skip_serializing_if = "Option::is_none")]
    pub missing_timestamp: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,

    /// The full merged dataset as of this snapshot. Grows monotonically
    /// across a request's snapshots.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<DataRow>>,
}

// ---

/// The cache itself: a store registry, an in-flight registry and a transport.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct TimeseriesCache {
    config: Arc<CacheConfig>,
    stores: Arc<StoreRegistry>,
    inflight: Arc<InflightRegistry>,
    transport: Arc<dyn Transport>,
}

impl TimeseriesCache {
    pub fn new(transport: Arc<dyn Transport>, config: CacheConfig) -> Self {
        Self {
            config: Arc::new(config),
            stores: Arc::new(StoreRegistry::new()),
            inflight: Arc::new(InflightRegistry::new()),
            transport,
        }
    }

    #[inline]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// The persistent store backing `identity`, created on first access.
    /// This is also the hook for external evictors, which watch each store's
    /// `_accessTime`.
    pub fn store(&self, identity: &TimeseriesIdentity) -> Arc<TimeseriesStore> {
        self.stores.open(&identity.store_name())
    }

    /// Streams snapshots for `request`: the cached state first, then one
    /// merged increment per slice in completion order.
    ///
    /// The generator runs detached from the returned stream: dropping the
    /// stream does not cancel pending fetches or their cache write-backs.
    pub fn respond(&self, request: TimeseriesRequest) -> ReceiverStream<Snapshot> {
        let (tx, rx) = mpsc::channel(SNAPSHOT_CHANNEL_CAPACITY);
        tokio::spawn(generate(self.clone(), request, tx));
        ReceiverStream::new(rx)
    }
}

// ---

fn within_retry_window(missing_timestamp: Option<&str>, window: Duration) -> bool {
    let Some(timestamp) = missing_timestamp else {
        return false;
    };
    // Unparsable timestamps are treated like old ones.
    let Ok(recorded) = OffsetDateTime::parse(timestamp, &Rfc3339) else {
        return false;
    };
    let age = OffsetDateTime::now_utc() - recorded;
    age < window
}

async fn generate(
    cache: TimeseriesCache,
    request: TimeseriesRequest,
    tx: mpsc::Sender<Snapshot>,
) {
    let store = cache.stores.open(&request.identity.store_name());
    let request_range = request.revision_range();

    let state = RequestState::new(store.name(), request.statistic.clone());
    let _guard = cache.inflight.register(Arc::clone(&state));

    let cached = read_cached(
        &store,
        &request_range,
        request.is_unbounded(),
        &request.columns,
    );
    let mut merged_data: Vec<DataRow> = cached.data.clone().unwrap_or_default();

    let _ = tx
        .send(Snapshot {
            improvement_direction: cached.improvement_direction.clone(),
            units: cached.units.clone(),
            missing_timestamp: cached.missing_timestamp.clone(),
            data: cached.data,
            ..Default::default()
        })
        .await;

    if within_retry_window(
        cached.missing_timestamp.as_deref(),
        cache.config.missing_retry_window,
    ) {
        log::debug!(
            "{:?} recently reported missing, skipping fetch",
            store.name()
        );
        return;
    }

    let planned = plan_slices(&request_range, &request.columns, &cached.available_range_by_col);
    let (planned, borrowed) = cache.inflight.coalesce(&state, planned);

    let own: Vec<Arc<TimeseriesSlice>> = planned
        .into_iter()
        .map(|slice| {
            Arc::new(TimeseriesSlice::new(
                &request.identity,
                &request.statistic,
                slice.revision_range,
                slice.columns,
                &cache.config.api_url,
                &cache.config.method,
                cache.config.max_retries,
                Arc::clone(&cache.transport),
            ))
        })
        .collect();
    state.set_slices(own.clone());

    let mut responses: FuturesUnordered<_> = own
        .iter()
        .chain(borrowed.iter())
        .map(|slice| {
            let slice = Arc::clone(slice);
            async move { slice.response().await }
        })
        .collect();

    let mut result_columns = BTreeSet::new();
    while let Some(response) = responses.next().await {
        match response {
            SliceResponse::Error { status, .. } if status == STATUS_NOT_FOUND => {
                // Negative result: remember it, emit nothing.
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    write_missing_timestamp(&store);
                });
            }
            SliceResponse::Error { error, status } => {
                let _ = tx
                    .send(Snapshot {
                        error: Some(error),
                        status: Some(status),
                        data: Some(merged_data.clone()),
                        ..Default::default()
                    })
                    .await;
            }
            SliceResponse::Data {
                columns: response_columns,
                data,
            } => {
                if response_columns.iter().any(|column| column == columns::ALERT) {
                    // Alerts may have been nudged server-side: drop any stale
                    // ones in the request range before merging the new set.
                    for row in &mut merged_data {
                        if row_revision(row).is_some_and(|rev| request_range.contains(rev)) {
                            row.remove(columns::ALERT);
                        }
                    }
                }

                result_columns.extend(response_columns.iter().cloned());

                let rows: Vec<DataRow> = data
                    .into_iter()
                    .filter(|row| {
                        row_revision(row).is_some_and(|rev| request_range.contains(rev))
                    })
                    .collect();
                merge_row_arrays(columns::REVISION, &mut merged_data, &[&rows]);

                let _ = tx
                    .send(Snapshot {
                        columns: Some(response_columns),
                        data: Some(merged_data.clone()),
                        ..Default::default()
                    })
                    .await;
            }
        }
    }

    if !merged_data.is_empty() {
        let mut metadata = Vec::new();
        if let Some(direction) = cached.improvement_direction {
            metadata.push((metadata_keys::IMPROVEMENT_DIRECTION.to_owned(), direction));
        }
        if let Some(units) = cached.units {
            metadata.push((metadata_keys::UNITS.to_owned(), units));
        }

        let store = Arc::clone(&store);
        let request_min = request_range.min;
        tokio::spawn(async move {
            write_result(&store, request_min, &result_columns, &merged_data, &metadata);
        });
    }
}

// ---

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Iterator<Item = (&'a str, &'a str)> + 'a {
        pairs.iter().copied()
    }

    #[test]
    fn missing_columns_is_malformed() {
        let result = TimeseriesRequest::from_form_pairs(pairs(&[
            ("test_suite", "suite"),
            ("measurement", "measure"),
            ("bot", "bot"),
        ]));
        assert_eq!(result, Err(RequestError::MissingParameter("columns")));
    }

    #[test]
    fn defaults_are_applied() {
        let request = TimeseriesRequest::from_form_pairs(pairs(&[
            ("test_suite", "suite"),
            ("measurement", "measure"),
            ("bot", "bot"),
            ("columns", "avg"),
        ]))
        .unwrap();

        assert_eq!(request.statistic, "avg");
        // `revision` is implied even when not listed.
        assert!(request.columns.contains("revision"));
        assert!(request.is_unbounded());
        assert_eq!(
            request.revision_range(),
            RevisionRange::new(0.0, f64::INFINITY)
        );
        assert_eq!(
            request.identity.store_name(),
            "timeseries/suite/measure/bot//"
        );
    }

    #[test]
    fn bad_revision_is_rejected() {
        let result = TimeseriesRequest::from_form_pairs(pairs(&[
            ("test_suite", "suite"),
            ("measurement", "measure"),
            ("bot", "bot"),
            ("columns", "revision,avg"),
            ("min_revision", "not-a-number"),
        ]));
        assert_eq!(
            result,
            Err(RequestError::InvalidParameter {
                param: "min_revision",
                value: "not-a-number".to_owned(),
            })
        );
    }

    #[test]
    fn channel_name_is_url_plus_body() {
        let request = TimeseriesRequest::from_form_pairs(pairs(&[
            ("test_suite", "suite"),
            ("measurement", "measure"),
            ("bot", "bot"),
            ("columns", "revision,avg"),
            ("min_revision", "10"),
            ("max_revision", "20"),
        ]))
        .unwrap();

        assert_eq!(
            request.channel_name("/api/timeseries2"),
            "/api/timeseries2?test_suite=suite&measurement=measure&bot=bot\
             &statistic=avg&columns=avg%2Crevision&min_revision=10&max_revision=20"
        );
    }

    #[test]
    fn retry_window() {
        let now = OffsetDateTime::now_utc();
        let fresh = (now - time::Duration::hours(1)).format(&Rfc3339).unwrap();
        let stale = (now - time::Duration::days(3)).format(&Rfc3339).unwrap();

        assert!(within_retry_window(Some(&fresh), MISSING_RETRY_WINDOW));
        assert!(!within_retry_window(Some(&stale), MISSING_RETRY_WINDOW));
        assert!(!within_retry_window(None, MISSING_RETRY_WINDOW));
        assert!(!within_retry_window(Some("garbage"), MISSING_RETRY_WINDOW));
    }
}
