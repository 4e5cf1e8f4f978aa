//! HTTP transport and durable dedupe storage for fundwatch.

pub mod http;
pub mod store;

pub use http::{
    FetchError, FetchedResponse, FixtureTransport, HttpClientConfig, HttpFetcher, HttpTransport,
    RecordedRequest, DEFAULT_USER_AGENT,
};
pub use store::{DedupeStore, DeliveryUpdate, SeenUpdate, SqliteDedupeStore, StoreError};

pub const CRATE_NAME: &str = "fundwatch-storage";
