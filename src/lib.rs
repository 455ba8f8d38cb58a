//! A client-side timeseries cache and request coalescer.
//!
//! Sits between a page and a remote analytics backend. For a given
//! timeseries identity and a requested revision range × column set, it
//! returns data as fast as possible while minimizing network traffic:
//!
//! * previously fetched rows and per-column available ranges persist in a
//!   local keyed store ([`TimeseriesStore`]);
//! * each incoming request is split into the minimal set of remote slices
//!   not already cached ([`plan_slices`]);
//! * overlapping in-flight requests for the same timeseries share slices
//!   instead of re-fetching them ([`InflightRegistry`]);
//! * partial results stream to the caller as each slice resolves, merged
//!   incrementally with cached data ([`TimeseriesCache::respond`]).

mod identity;
mod inflight;
mod merge;
mod planner;
mod range;
mod request;
mod slice;
mod store;
mod store_read;
mod store_write;

pub use self::identity::{
    columns, TimeseriesIdentity, DEFAULT_STATISTIC, STORE_SCHEMA_VERSION,
};
pub use self::inflight::{InflightGuard, InflightRegistry, RequestState};
pub use self::merge::{find_low_index_in_sorted, merge_row_arrays, row_revision, DataRow};
pub use self::planner::{plan_slices, PlannedSlice};
pub use self::range::RevisionRange;
pub use self::request::{
    CacheConfig, Snapshot, TimeseriesCache, TimeseriesRequest, MISSING_RETRY_WINDOW,
};
pub use self::slice::{
    FetchResponse, SliceResponse, TimeseriesSlice, Transport, TransportError, MAX_RETRIES,
    STATUS_NOT_FOUND, STATUS_OK, STATUS_SERVER_ERROR,
};
pub use self::store::{
    metadata_keys, ReadTransaction, StoreRegistry, TimeseriesStore, WriteTransaction,
};
pub use self::store_read::{read_cached, CachedResult};
pub use self::store_write::{write_missing_timestamp, write_result};

// ---

/// The ways an inbound request can be malformed.
///
/// Everything that can go wrong *after* parsing — transient server errors,
/// negative results, other remote failures — flows through the snapshot
/// stream as data instead (see [`SliceResponse`] and [`Snapshot`]).
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("missing required parameter: {0}")]
    MissingParameter(&'static str),

    #[error("invalid value for {param}: {value:?}")]
    InvalidParameter {
        param: &'static str,
        value: String,
    },
}
