//! # HTTP Retrieval Utilities
//!
//! An asynchronous API client wrapper around `reqwest`, with middleware support
//! for exponential backoff retries and standardized response handling. Every
//! HTTP transport of the crate is built on it.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, Url};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware, RequestBuilder};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::{IngestError, IngestResult};

/// A standardized container for API responses.
///
/// Wraps the deserialized data along with metadata about the HTTP transaction.
#[derive(Debug)]
pub struct ApiResponse<T> {
    /// The successfully deserialized response body, if any.
    pub data: Option<T>,
    /// The raw error body returned by the server if the request failed.
    pub error_body: Option<String>,
    /// The numeric HTTP status code.
    pub status: u16,
    /// Indicates if the status code was in the 2xx range.
    pub success: bool,
    /// The headers returned by the server.
    pub headers: HeaderMap,
}

impl<T> ApiResponse<T> {
    /// The body of a 2xx response, or an `Http` error carrying the status and
    /// error body.
    pub fn into_result(self) -> IngestResult<T> {
        if !self.success {
            return Err(IngestError::Http {
                status: self.status,
                body: self.error_body.unwrap_or_default(),
            });
        }
        self.data
            .ok_or_else(|| IngestError::Protocol(format!("HTTP {} without a body", self.status)))
    }
}

/// Transport settings shared by every request of one client.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub timeout: Duration,
    pub user_agent: String,
    /// Retries of transient failures (connect errors, 5xx, 429) per request.
    pub max_retries: u32,
    /// Headers added to every request.
    pub default_headers: BTreeMap<String, String>,
    /// Sent as `Authorization: Bearer <token>` when present.
    pub auth_token: Option<String>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: concat!("lib_feed/", env!("CARGO_PKG_VERSION")).to_string(),
            max_retries: 0,
            default_headers: BTreeMap::new(),
            auth_token: None,
        }
    }
}

/// A flexible asynchronous HTTP client.
///
/// Built on top of `reqwest_middleware`, it handles base URLs, default headers,
/// authentication tokens and automatic retries.
pub struct ApiClient {
    /// The underlying middleware-enabled client.
    inner: ClientWithMiddleware,
    /// The base URL to which all relative paths are joined.
    base_url: Url,
    /// An optional Bearer token used for authorization.
    auth_token: Option<String>,
}

impl ApiClient {
    /// Creates a new `ApiClient` with a retry policy.
    ///
    /// # Errors
    /// `Config` when `base_url` is not an absolute URL, a default header is
    /// invalid, or the underlying client cannot be built.
    pub fn new(base_url: &str, options: ClientOptions) -> IngestResult<Self> {
        let url = Url::parse(base_url)?;

        let mut headers = HeaderMap::new();
        for (name, value) in &options.default_headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| IngestError::Config(format!("invalid header name {}: {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| IngestError::Config(format!("invalid value for header {}: {}", name, e)))?;
            headers.insert(name, value);
        }

        let http = reqwest::Client::builder()
            .timeout(options.timeout)
            .user_agent(options.user_agent.as_str())
            .default_headers(headers)
            .build()
            .map_err(|e| IngestError::Config(format!("cannot build HTTP client: {}", e)))?;

        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(options.max_retries);
        let client = ClientBuilder::new(http)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Ok(Self {
            inner: client,
            base_url: url,
            auth_token: options.auth_token,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Joins `path` onto the base URL and appends `query` pairs.
    ///
    /// An absolute `path` replaces the base URL.
    pub fn url(&self, path: &str, query: &[(&str, &str)]) -> IngestResult<Url> {
        let mut url = self.base_url.join(path)?;
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }

    fn prepare(&self, method: Method, url: Url, headers: Option<HeaderMap>) -> RequestBuilder {
        let mut req = self.inner.request(method, url);
        if let Some(h) = headers {
            req = req.headers(h);
        }
        if let Some(token) = &self.auth_token {
            req = req.header(AUTHORIZATION, format!("Bearer {}", token));
        }
        req
    }

    /// Performs a request with an optional JSON body.
    pub async fn request<T, B>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        headers: Option<HeaderMap>,
        body: Option<B>,
    ) -> IngestResult<ApiResponse<T>>
    where
        T: DeserializeOwned,
        B: Serialize,
    {
        let url = self.url(path, query)?;
        let mut req = self.prepare(method, url, headers);

        if let Some(b) = body {
            let json_body = serde_json::to_string(&b)?;
            req = req.header(CONTENT_TYPE, "application/json").body(json_body);
        }

        Self::execute(req).await
    }

    /// GET with query parameters, JSON response.
    pub async fn get_json<T>(&self, path: &str, query: &[(&str, &str)]) -> IngestResult<ApiResponse<T>>
    where
        T: DeserializeOwned,
    {
        self.request::<T, ()>(Method::GET, path, query, None, None).await
    }

    /// POST with an `application/x-www-form-urlencoded` body, JSON response.
    pub async fn post_form<T>(
        &self,
        path: &str,
        form: &[(&str, &str)],
        headers: Option<HeaderMap>,
    ) -> IngestResult<ApiResponse<T>>
    where
        T: DeserializeOwned,
    {
        let url = self.url(path, &[])?;
        let encoded = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(form.iter())
            .finish();

        let req = self
            .prepare(Method::POST, url, headers)
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(encoded);

        Self::execute(req).await
    }

    async fn execute<T>(req: RequestBuilder) -> IngestResult<ApiResponse<T>>
    where
        T: DeserializeOwned,
    {
        let response: reqwest::Response = req.send().await?;
        let status = response.status();
        let resp_headers = response.headers().clone();

        if status.is_success() {
            let data = response.json::<T>().await?;
            Ok(ApiResponse {
                data: Some(data),
                error_body: None,
                status: status.as_u16(),
                success: true,
                headers: resp_headers,
            })
        } else {
            // Keep the error body for the log line.
            let error_text = response.text().await.ok();
            Ok(ApiResponse {
                data: None,
                error_body: error_text,
                status: status.as_u16(),
                success: false,
                headers: resp_headers,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_joins_and_encodes_query() {
        let client = ApiClient::new("https://feed.example/api/", ClientOptions::default()).unwrap();
        let url = client.url("public-stash-tabs", &[("id", "1-2 3")]).unwrap();
        assert_eq!(url.as_str(), "https://feed.example/api/public-stash-tabs?id=1-2+3");

        let absolute = client.url("https://live.example/s/9", &[]).unwrap();
        assert_eq!(absolute.as_str(), "https://live.example/s/9");
    }

    #[test]
    fn test_relative_base_is_config_error() {
        let err = ApiClient::new("not a url", ClientOptions::default()).err().unwrap();
        assert!(matches!(err, IngestError::Config(_)));
    }

    #[test]
    fn test_invalid_default_header_is_rejected() {
        let mut options = ClientOptions::default();
        options.default_headers.insert("bad header".into(), "x".into());
        assert!(ApiClient::new("https://feed.example/", options).is_err());
    }

    #[test]
    fn test_into_result_maps_status() {
        let resp: ApiResponse<u8> = ApiResponse {
            data: None,
            error_body: Some("slow down".into()),
            status: 429,
            success: false,
            headers: HeaderMap::new(),
        };
        assert_eq!(
            resp.into_result().unwrap_err(),
            IngestError::Http {
                status: 429,
                body: "slow down".into()
            }
        );
    }
}
