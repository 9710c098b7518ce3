//! # Data Retrieval Module
//!
//! HTTP transports for the ingestors, compiled with the `retrieve` feature.
//!
//! ## Contained Modules:
//!
//! - **`ky_http`**: a generic `ApiClient` built on `reqwest` and
//!   `reqwest-middleware`, with retries and exponential backoff.
//! - **`http_sources`**: `HttpChangeFeed`, `HttpCursorSeed` and
//!   `HttpLiveNotifyTransport`, the implementations of the ingestor transport
//!   traits against the real endpoints.

/// Generic HTTP API client with retry middleware.
pub mod ky_http;
/// Feed, cursor seed and live-notify transports over HTTP.
pub mod http_sources;

pub use http_sources::{HttpChangeFeed, HttpCursorSeed, HttpLiveNotifyTransport};
pub use ky_http::{ApiClient, ApiResponse, ClientOptions};
