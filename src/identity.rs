use crate::RequestError;

/// Column names with special semantics.
pub mod columns {
    /// Primary key. Never fetched alone, never marked available.
    pub const REVISION: &str = "revision";

    /// Always refetched; never recorded in the availability map, so every
    /// request that asks for alerts produces a live fetch.
    pub const ALERT: &str = "alert";

    /// Heavyweight payloads; always requested in dedicated slices.
    pub const HISTOGRAM: &str = "histogram";
}

pub const DEFAULT_STATISTIC: &str = "avg";

/// Version of the persistent store layout: three sub-stores
/// (`data`, `metadata`, `ranges`) per identity.
pub const STORE_SCHEMA_VERSION: u32 = 1;

/// The tuple that names one timeseries, and therefore one persistent store
/// instance.
///
/// `test_case` and `build_type` default to the empty string; the other three
/// fields are required.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct TimeseriesIdentity {
    pub test_suite: String,
    pub measurement: String,
    pub bot: String,
    pub test_case: String,
    pub build_type: String,
}

impl TimeseriesIdentity {
    pub fn new(
        test_suite: impl Into<String>,
        measurement: impl Into<String>,
        bot: impl Into<String>,
        test_case: impl Into<String>,
        build_type: impl Into<String>,
    ) -> Result<Self, RequestError> {
        let identity = Self {
            test_suite: test_suite.into(),
            measurement: measurement.into(),
            bot: bot.into(),
            test_case: test_case.into(),
            build_type: build_type.into(),
        };

        if identity.test_suite.is_empty() {
            return Err(RequestError::MissingParameter("test_suite"));
        }
        if identity.measurement.is_empty() {
            return Err(RequestError::MissingParameter("measurement"));
        }
        if identity.bot.is_empty() {
            return Err(RequestError::MissingParameter("bot"));
        }

        Ok(identity)
    }

    /// The name of the persistent store instance backing this timeseries.
    pub fn store_name(&self) -> String {
        format!(
            "timeseries/{}/{}/{}/{}/{}",
            self.test_suite, self.measurement, self.bot, self.test_case, self.build_type
        )
    }
}

impl std::fmt::Display for TimeseriesIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.store_name().fmt(f)
    }
}
