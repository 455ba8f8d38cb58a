use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use itertools::Itertools as _;
use serde_json::Value;

use crate::identity::TimeseriesIdentity;
use crate::merge::DataRow;
use crate::RevisionRange;

// ---

pub const STATUS_OK: u16 = 200;
pub const STATUS_NOT_FOUND: u16 = 404;
pub const STATUS_SERVER_ERROR: u16 = 500;

/// Retries on top of the initial attempt, so 4 fetches at most.
pub const MAX_RETRIES: u32 = 3;

/// A decoded backend response: HTTP status plus JSON body.
#[derive(Clone, Debug, PartialEq)]
pub struct FetchResponse {
    pub status: u16,
    pub body: Value,
}

impl FetchResponse {
    pub fn new(status: u16, body: Value) -> Self {
        Self { status, body }
    }
}

/// Transport-level failure (no HTTP response at all).
#[derive(thiserror::Error, Debug, Clone)]
#[error("transport: {0}")]
pub struct TransportError(pub String);

/// The seam to the remote backend. Implementations own connection handling
/// and the content-type of the form-encoded `body`.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        url: &str,
        method: &str,
        body: &str,
    ) -> Result<FetchResponse, TransportError>;
}

// ---

/// What a fired slice resolves to.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
#[serde(untagged)]
pub enum SliceResponse {
    Data {
        columns: Vec<String>,
        data: Vec<DataRow>,
    },
    Error {
        error: String,
        status: u16,
    },
}

// ---

/// One pending remote fetch: a sub-range × column subset of one timeseries.
///
/// Lazy-fired: nothing happens until the first [`Self::response`] call, and
/// every call after that (including from other requests that borrowed this
/// slice) observes the same memoized response.
pub struct TimeseriesSlice {
    pub test_suite: String,
    pub measurement: String,
    pub bot: String,
    pub statistic: String,
    pub test_case: String,
    pub build_type: String,

    pub revision_range: RevisionRange,

    /// Always contains `revision`.
    pub columns: BTreeSet<String>,

    url: String,
    method: String,
    max_retries: u32,
    retries: AtomicU32,

    transport: Arc<dyn Transport>,
    response: tokio::sync::OnceCell<SliceResponse>,
}

impl std::fmt::Debug for TimeseriesSlice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeseriesSlice")
            .field("test_suite", &self.test_suite)
            .field("measurement", &self.measurement)
            .field("bot", &self.bot)
            .field("statistic", &self.statistic)
            .field("revision_range", &self.revision_range)
            .field("columns", &self.columns)
            .finish_non_exhaustive()
    }
}

impl TimeseriesSlice {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        identity: &TimeseriesIdentity,
        statistic: impl Into<String>,
        revision_range: RevisionRange,
        columns: BTreeSet<String>,
        url: impl Into<String>,
        method: impl Into<String>,
        max_retries: u32,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            test_suite: identity.test_suite.clone(),
            measurement: identity.measurement.clone(),
            bot: identity.bot.clone(),
            statistic: statistic.into(),
            test_case: identity.test_case.clone(),
            build_type: identity.build_type.clone(),
            revision_range,
            columns,
            url: url.into(),
            method: method.into(),
            max_retries,
            retries: AtomicU32::new(0),
            transport,
            response: tokio::sync::OnceCell::new(),
        }
    }

    /// Strict equality over all identity fields plus statistic.
    pub fn same_series(&self, other: &Self) -> bool {
        self.test_suite == other.test_suite
            && self.measurement == other.measurement
            && self.bot == other.bot
            && self.statistic == other.statistic
            && self.test_case == other.test_case
            && self.build_type == other.build_type
    }

    /// The form-encoded wire body.
    ///
    /// `build_type` and `test_case` are omitted when empty, `min_revision`
    /// when zero, and `max_revision` when it is the unbounded sentinel.
    pub fn body(&self) -> String {
        let mut body = url::form_urlencoded::Serializer::new(String::new());
        body.append_pair("test_suite", &self.test_suite);
        body.append_pair("measurement", &self.measurement);
        body.append_pair("bot", &self.bot);
        body.append_pair("statistic", &self.statistic);
        body.append_pair("columns", &self.columns.iter().join(","));
        if !self.build_type.is_empty() {
            body.append_pair("build_type", &self.build_type);
        }
        if !self.test_case.is_empty() {
            body.append_pair("test_case", &self.test_case);
        }
        if !self.revision_range.is_empty() {
            if self.revision_range.min != 0.0 && self.revision_range.min.is_finite() {
                body.append_pair("min_revision", &(self.revision_range.min as i64).to_string());
            }
            if self.revision_range.max.is_finite() {
                body.append_pair("max_revision", &(self.revision_range.max as i64).to_string());
            }
        }
        body.finish()
    }

    /// The slice's memoized response, fetching on first access. Concurrent
    /// callers share a single in-flight fetch.
    pub async fn response(&self) -> SliceResponse {
        self.response.get_or_init(|| self.fetch()).await.clone()
    }

    async fn fetch(&self) -> SliceResponse {
        let body = self.body();
        loop {
            log::trace!(
                "fetching {} {} for {body:?}",
                self.method,
                self.url
            );
            let response = match self.transport.send(&self.url, &self.method, &body).await {
                Ok(response) => response,
                Err(err) => {
                    log::warn!("slice fetch failed: {err}");
                    return SliceResponse::Error {
                        error: err.to_string(),
                        status: 0,
                    };
                }
            };

            if response.status == STATUS_OK {
                return self.rows_from_table(response.body);
            }

            if response.status == STATUS_SERVER_ERROR {
                let attempt = self.retries.fetch_add(1, Ordering::Relaxed) + 1;
                if attempt <= self.max_retries {
                    log::debug!(
                        "server error for {:?}, retry {attempt}/{}",
                        self.measurement,
                        self.max_retries
                    );
                    continue;
                }
            }

            let error = response
                .body
                .get("error")
                .and_then(Value::as_str)
                .map(str::to_owned)
                .unwrap_or_else(|| format!("HTTP {}", response.status));
            return SliceResponse::Error {
                error,
                status: response.status,
            };
        }
    }

    /// Rewrites the backend's 2-D `data` table into row objects keyed by the
    /// requested columns (positional zip). The response's own `columns` field
    /// is ignored in favor of the requested set.
    fn rows_from_table(&self, body: Value) -> SliceResponse {
        let columns: Vec<String> = self.columns.iter().cloned().collect();
        let table = match body.get("data").and_then(Value::as_array) {
            Some(table) => table.clone(),
            None => Vec::new(),
        };
        let data = table
            .into_iter()
            .filter_map(|row| {
                let cells = row.as_array()?.clone();
                Some(
                    columns
                        .iter()
                        .cloned()
                        .zip(cells)
                        .collect::<DataRow>(),
                )
            })
            .collect();
        SliceResponse::Data { columns, data }
    }
}

// ---

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;

    struct ScriptedTransport {
        responses: Mutex<VecDeque<FetchResponse>>,
        calls: AtomicU32,
    }

    impl ScriptedTransport {
        fn new(responses: Vec<FetchResponse>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::Relaxed)
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(
            &self,
            _url: &str,
            _method: &str,
            _body: &str,
        ) -> Result<FetchResponse, TransportError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            self.responses
                .lock()
                .pop_front()
                .ok_or_else(|| TransportError("script exhausted".to_owned()))
        }
    }

    fn slice(
        range: RevisionRange,
        columns: &[&str],
        transport: Arc<dyn Transport>,
    ) -> TimeseriesSlice {
        let identity =
            TimeseriesIdentity::new("suite", "measure", "bot", "case", "").unwrap();
        TimeseriesSlice::new(
            &identity,
            "avg",
            range,
            columns.iter().map(|c| (*c).to_owned()).collect(),
            "/api/timeseries2",
            "POST",
            MAX_RETRIES,
            transport,
        )
    }

    #[test]
    fn wire_body_omits_defaults() {
        let transport = ScriptedTransport::new(vec![]);
        let s = slice(
            RevisionRange::new(0.0, f64::INFINITY),
            &["avg", "revision"],
            transport,
        );
        assert_eq!(
            s.body(),
            "test_suite=suite&measurement=measure&bot=bot&statistic=avg\
             &columns=avg%2Crevision&test_case=case"
        );
    }

    #[test]
    fn wire_body_bounded() {
        let transport = ScriptedTransport::new(vec![]);
        let s = slice(
            RevisionRange::new(50.0, 100.0),
            &["avg", "revision"],
            transport,
        );
        assert!(s.body().ends_with("&min_revision=50&max_revision=100"));
    }

    #[tokio::test]
    async fn response_zips_requested_columns() {
        let transport = ScriptedTransport::new(vec![FetchResponse::new(
            STATUS_OK,
            json!({"data": [[1.0, 10.0], [2.0, 20.0]], "columns": ["ignored", "names"]}),
        )]);
        let s = slice(
            RevisionRange::new(0.0, 100.0),
            &["avg", "revision"],
            transport,
        );

        match s.response().await {
            SliceResponse::Data { columns, data } => {
                assert_eq!(columns, vec!["avg", "revision"]);
                assert_eq!(data.len(), 2);
                assert_eq!(data[0].get("avg"), Some(&Value::from(1.0)));
                assert_eq!(data[0].get("revision"), Some(&Value::from(10.0)));
            }
            other => panic!("expected data, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn response_is_memoized() {
        let transport = ScriptedTransport::new(vec![FetchResponse::new(
            STATUS_OK,
            json!({"data": [], "columns": []}),
        )]);
        let s = slice(
            RevisionRange::new(0.0, 100.0),
            &["avg", "revision"],
            Arc::clone(&transport) as Arc<dyn Transport>,
        );

        let first = s.response().await;
        let second = s.response().await;
        assert_eq!(first, second);
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn retries_server_errors_then_succeeds() {
        let transport = ScriptedTransport::new(vec![
            FetchResponse::new(STATUS_SERVER_ERROR, json!({})),
            FetchResponse::new(STATUS_SERVER_ERROR, json!({})),
            FetchResponse::new(STATUS_OK, json!({"data": [[5.0, 50.0]]})),
        ]);
        let s = slice(
            RevisionRange::new(0.0, 100.0),
            &["avg", "revision"],
            Arc::clone(&transport) as Arc<dyn Transport>,
        );

        assert!(matches!(s.response().await, SliceResponse::Data { .. }));
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let transport = ScriptedTransport::new(vec![
            FetchResponse::new(STATUS_SERVER_ERROR, json!({}));
            4
        ]);
        let s = slice(
            RevisionRange::new(0.0, 100.0),
            &["avg", "revision"],
            Arc::clone(&transport) as Arc<dyn Transport>,
        );

        match s.response().await {
            SliceResponse::Error { status, .. } => assert_eq!(status, STATUS_SERVER_ERROR),
            other => panic!("expected error, got {other:?}"),
        }
        assert_eq!(transport.calls(), 4);
    }

    #[tokio::test]
    async fn non_retryable_errors_surface_immediately() {
        let transport = ScriptedTransport::new(vec![FetchResponse::new(
            403,
            json!({"error": "forbidden"}),
        )]);
        let s = slice(
            RevisionRange::new(0.0, 100.0),
            &["avg", "revision"],
            Arc::clone(&transport) as Arc<dyn Transport>,
        );

        assert_eq!(
            s.response().await,
            SliceResponse::Error {
                error: "forbidden".to_owned(),
                status: 403,
            }
        );
        assert_eq!(transport.calls(), 1);
    }
}
