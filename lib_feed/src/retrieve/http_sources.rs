//! HTTP implementations of the feed, seed and live-notify transports.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, COOKIE};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::{IngestError, IngestResult};
use crate::ingestors::change_feed::{ChangeFeedSource, CursorSeed};
use crate::ingestors::live_notify::{BootstrapReply, LiveNotifyTransport, NotifyReply};
use crate::model::change_id::ChangeId;
use crate::model::feed_page::FeedPage;
use crate::retrieve::ky_http::{ApiClient, ClientOptions};

/// `GET <feed_url>?id=<cursor>`.
pub struct HttpChangeFeed {
    client: ApiClient,
}

impl HttpChangeFeed {
    pub fn new(feed_url: &str, options: ClientOptions) -> IngestResult<Self> {
        Ok(Self {
            client: ApiClient::new(feed_url, options)?,
        })
    }
}

#[async_trait]
impl ChangeFeedSource for HttpChangeFeed {
    async fn fetch_page(&self, cursor: &ChangeId) -> IngestResult<FeedPage> {
        let mut query = Vec::with_capacity(1);
        if !cursor.is_empty() {
            query.push(("id", cursor.as_str()));
        }
        self.client.get_json::<FeedPage>("", &query).await?.into_result()
    }

    fn describe(&self) -> String {
        self.client.base_url().to_string()
    }
}

/// A read-only endpoint whose JSON body carries a recent cursor in `field`.
pub struct HttpCursorSeed {
    name: String,
    field: String,
    client: ApiClient,
}

impl HttpCursorSeed {
    pub fn new(
        name: impl Into<String>,
        url: &str,
        field: impl Into<String>,
        options: ClientOptions,
    ) -> IngestResult<Self> {
        Ok(Self {
            name: name.into(),
            field: field.into(),
            client: ApiClient::new(url, options)?,
        })
    }
}

#[async_trait]
impl CursorSeed for HttpCursorSeed {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn fetch_cursor(&self) -> IngestResult<ChangeId> {
        let body: Value = self.client.get_json("", &[]).await?.into_result()?;
        body.get(&self.field)
            .and_then(Value::as_str)
            .map(ChangeId::from)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| IngestError::Bootstrap(format!("{}: no '{}' in response", self.name, self.field)))
    }
}

/// Live-notify transport: a GET bootstrap and form-encoded POST exchanges.
///
/// `session_uri_template` must contain `{id}`, which is replaced by the session
/// id returned from the bootstrap request.
pub struct HttpLiveNotifyTransport {
    client: ApiClient,
    session_uri_template: String,
    extra_headers: HeaderMap,
}

impl HttpLiveNotifyTransport {
    pub fn new(
        bootstrap_url: &str,
        session_uri_template: impl Into<String>,
        cookies: &BTreeMap<String, String>,
        options: ClientOptions,
    ) -> IngestResult<Self> {
        let session_uri_template = session_uri_template.into();
        if !session_uri_template.contains("{id}") {
            return Err(IngestError::Config(format!(
                "session URI template {} has no {{id}} placeholder",
                session_uri_template
            )));
        }

        let mut extra_headers = HeaderMap::new();
        if !cookies.is_empty() {
            let cookie = cookies
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join("; ");
            let value = HeaderValue::from_str(&cookie)
                .map_err(|e| IngestError::Config(format!("invalid cookie value: {}", e)))?;
            extra_headers.insert(COOKIE, value);
        }

        Ok(Self {
            client: ApiClient::new(bootstrap_url, options)?,
            session_uri_template,
            extra_headers,
        })
    }
}

#[async_trait]
impl LiveNotifyTransport for HttpLiveNotifyTransport {
    async fn bootstrap(&self) -> IngestResult<BootstrapReply> {
        self.client
            .request::<BootstrapReply, ()>(reqwest::Method::GET, "", &[], Some(self.extra_headers.clone()), None)
            .await?
            .into_result()
    }

    fn session_uri(&self, session_id: &str) -> Option<String> {
        let id = session_id.trim();
        if id.is_empty() {
            return None;
        }
        Some(self.session_uri_template.replace("{id}", id))
    }

    async fn exchange(&self, session_uri: &str, token: &str) -> IngestResult<NotifyReply> {
        self.client
            .post_form::<NotifyReply>(session_uri, &[("id", token)], Some(self.extra_headers.clone()))
            .await?
            .into_result()
    }

    fn describe(&self) -> String {
        self.client.base_url().to_string()
    }
}
