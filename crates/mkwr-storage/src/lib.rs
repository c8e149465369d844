//! Page fetching and immutable snapshot storage for MKWR.

mod fetch;
mod snapshot;

pub use fetch::{
    retry, FetchError, FetchedPage, HttpClientConfig, HttpFetcher, PageSource, RetryPolicy,
    DEFAULT_BASE_URL,
};
pub use snapshot::{
    decode_sequence, encode_sequence, RecordFilter, SnapshotError, SnapshotId, SnapshotStore,
    DEFAULT_KEEP_SNAPSHOTS, SCHEMA_VERSION, SNAPSHOT_EXTENSION,
};

pub use reqwest::StatusCode;
