//! Durable record storage, fingerprinting and HTTP fetch utilities for portwatch.

pub mod atomic;
pub mod fetch;
pub mod fingerprint;
pub mod lock;
pub mod query;
pub mod store;

pub use atomic::write_atomic;
pub use fetch::{FetchError, FetchedResponse, HttpClientConfig, HttpFetcher};
pub use fingerprint::{FingerprintPolicy, NameSequencePolicy};
pub use lock::{DirLock, RUN_LOCK_FILE, STORE_LOCK_FILE};
pub use query::{
    export_rows, facets, statistics, ExportRow, FacetCount, Facets, RecordQuery, StoreStatistics,
};
pub use store::{InsertOutcome, RecordStore, StoreError, RECORDS_FILE};

pub const CRATE_NAME: &str = "portwatch-storage";
