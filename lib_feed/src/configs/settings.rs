//! # Ingestion Settings
//!
//! Everything the engine needs to be wired up, as one serde tree. Every field
//! has a default, so a JSON file only has to name what it changes. Durations are
//! given in milliseconds.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::core::decode_queue::QueuePolicy;
use crate::core::diff_tracker::{RefreshMode, TrackerOptions};
use crate::core::registry::QueryIdentity;
use crate::error::{IngestError, IngestResult};
use crate::ingestors::change_feed::PollerOptions;
use crate::ingestors::live_notify::LiveNotifyOptions;
use crate::model::change_id::ChangeId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IngestSettings {
    pub feed_url: String,
    /// Tried in order when there is no cursor yet.
    pub seeds: Vec<SeedSettings>,
    /// Resume from this cursor and skip the seed chain.
    pub initial_cursor: Option<String>,
    pub poll_interval_ms: u64,
    pub min_request_interval_ms: u64,
    pub queue: QueuePolicy,
    /// Pending raw listings above which the decode backlog is reported.
    pub backlog_warn_threshold: u64,
    pub http: HttpSettings,
    pub tracker: TrackerSettings,
    /// Live-notify session, disabled when absent.
    pub live: Option<LiveNotifySettings>,
    pub registry_identity: QueryIdentity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedSettings {
    pub name: String,
    pub url: String,
    #[serde(default = "default_cursor_field")]
    pub cursor_field: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpSettings {
    pub timeout_ms: u64,
    pub user_agent: String,
    pub max_retries: u32,
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TrackerModeSetting {
    #[default]
    Manual,
    Periodic,
    Live,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TrackerSettings {
    pub mode: TrackerModeSetting,
    /// Only used by `periodic`.
    pub period_ms: u64,
    pub retry_delay_ms: u64,
    pub replay: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LiveNotifySettings {
    pub bootstrap_url: String,
    /// Must contain `{id}`.
    pub session_uri_template: String,
    pub cookies: BTreeMap<String, String>,
    pub headers: BTreeMap<String, String>,
    pub poll_delay_ms: u64,
    pub replay: usize,
    pub league: Option<String>,
}

fn default_cursor_field() -> String {
    "next_change_id".to_string()
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            feed_url: "https://api.pathofexile.com/public-stash-tabs".to_string(),
            seeds: vec![
                SeedSettings {
                    name: "poe.ninja".to_string(),
                    url: "https://poe.ninja/api/data/getstats".to_string(),
                    cursor_field: default_cursor_field(),
                },
                SeedSettings {
                    name: "trade-change-ids".to_string(),
                    url: "https://www.pathofexile.com/api/trade/data/change-ids".to_string(),
                    cursor_field: "psapi".to_string(),
                },
            ],
            initial_cursor: None,
            poll_interval_ms: 2_000,
            min_request_interval_ms: 1_000,
            queue: QueuePolicy::default(),
            backlog_warn_threshold: 50_000,
            http: HttpSettings::default(),
            tracker: TrackerSettings::default(),
            live: None,
            registry_identity: QueryIdentity::Structural,
        }
    }
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            user_agent: concat!("lib_feed/", env!("CARGO_PKG_VERSION")).to_string(),
            max_retries: 0,
            headers: BTreeMap::new(),
        }
    }
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            mode: TrackerModeSetting::Manual,
            period_ms: 10_000,
            retry_delay_ms: 5_000,
            replay: 1,
        }
    }
}

impl Default for LiveNotifySettings {
    fn default() -> Self {
        Self {
            bootstrap_url: String::new(),
            session_uri_template: String::new(),
            cookies: BTreeMap::new(),
            headers: BTreeMap::new(),
            poll_delay_ms: 1_000,
            replay: 16,
            league: None,
        }
    }
}

impl IngestSettings {
    pub fn from_json_str(json: &str) -> IngestResult<Self> {
        let settings: Self =
            serde_json::from_str(json).map_err(|e| IngestError::Config(format!("invalid settings: {}", e)))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: impl AsRef<Path>) -> IngestResult<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .map_err(|e| IngestError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> IngestResult<()> {
        if self.feed_url.trim().is_empty() {
            return Err(IngestError::Config("feedUrl is empty".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(IngestError::Config("pollIntervalMs must be positive".into()));
        }
        if let QueuePolicy::Bounded(0) = self.queue {
            return Err(IngestError::Config("bounded queue needs a capacity".into()));
        }
        if self.tracker.mode == TrackerModeSetting::Periodic && self.tracker.period_ms == 0 {
            return Err(IngestError::Config("tracker.periodMs must be positive".into()));
        }
        if let Some(live) = &self.live {
            if live.bootstrap_url.trim().is_empty() {
                return Err(IngestError::Config("live.bootstrapUrl is empty".into()));
            }
            if !live.session_uri_template.contains("{id}") {
                return Err(IngestError::Config("live.sessionUriTemplate needs an {id} placeholder".into()));
            }
        }
        Ok(())
    }

    pub fn poller_options(&self) -> PollerOptions {
        PollerOptions {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            min_request_interval: Duration::from_millis(self.min_request_interval_ms),
            initial_cursor: self
                .initial_cursor
                .as_deref()
                .map(ChangeId::from)
                .filter(|c| !c.is_empty()),
        }
    }

    pub fn tracker_options(&self) -> TrackerOptions {
        TrackerOptions {
            mode: self.tracker.refresh_mode(),
            retry_delay: Duration::from_millis(self.tracker.retry_delay_ms),
            replay: self.tracker.replay,
        }
    }

    #[cfg(feature = "retrieve")]
    pub fn client_options(&self) -> crate::retrieve::ky_http::ClientOptions {
        self.http.client_options(&BTreeMap::new())
    }
}

impl HttpSettings {
    /// Client options with `extra` headers layered over the configured ones.
    #[cfg(feature = "retrieve")]
    pub fn client_options(&self, extra: &BTreeMap<String, String>) -> crate::retrieve::ky_http::ClientOptions {
        let mut headers = self.headers.clone();
        headers.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        crate::retrieve::ky_http::ClientOptions {
            timeout: Duration::from_millis(self.timeout_ms),
            user_agent: self.user_agent.clone(),
            max_retries: self.max_retries,
            default_headers: headers,
            auth_token: None,
        }
    }
}

impl TrackerSettings {
    pub fn refresh_mode(&self) -> RefreshMode {
        match self.mode {
            TrackerModeSetting::Manual => RefreshMode::Manual,
            TrackerModeSetting::Periodic => RefreshMode::Periodic(Duration::from_millis(self.period_ms)),
            TrackerModeSetting::Live => RefreshMode::Live,
        }
    }
}

impl LiveNotifySettings {
    pub fn live_options(&self) -> LiveNotifyOptions {
        LiveNotifyOptions {
            poll_delay: Duration::from_millis(self.poll_delay_ms),
            replay: self.replay,
            league: self.league.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let settings = IngestSettings::from_json_str(
            r#"{
                "pollIntervalMs": 500,
                "queue": { "kind": "unbounded" },
                "tracker": { "mode": "periodic", "periodMs": 250 },
                "initialCursor": "1-2-3"
            }"#,
        )
        .unwrap();

        assert_eq!(settings.poll_interval_ms, 500);
        assert_eq!(settings.queue, QueuePolicy::Unbounded);
        assert_eq!(settings.min_request_interval_ms, 1_000);
        assert_eq!(settings.seeds.len(), 2);
        assert_eq!(
            settings.tracker_options().mode,
            RefreshMode::Periodic(Duration::from_millis(250))
        );
        assert_eq!(settings.poller_options().initial_cursor, Some(ChangeId::new("1-2-3")));
    }

    #[test]
    fn test_live_template_must_have_placeholder() {
        let err = IngestSettings::from_json_str(
            r#"{ "live": { "bootstrapUrl": "http://x/search", "sessionUriTemplate": "http://x/live" } }"#,
        )
        .unwrap_err();
        assert!(matches!(err, IngestError::Config(_)));
    }

    #[test]
    fn test_seed_cursor_field_defaults() {
        let settings =
            IngestSettings::from_json_str(r#"{ "seeds": [ { "name": "a", "url": "http://a/" } ] }"#).unwrap();
        assert_eq!(settings.seeds[0].cursor_field, "next_change_id");
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "registryIdentity": "reference", "backlogWarnThreshold": 10 }}"#).unwrap();

        let settings = IngestSettings::from_file(file.path()).unwrap();
        assert_eq!(settings.registry_identity, QueryIdentity::Reference);
        assert_eq!(settings.backlog_warn_threshold, 10);
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = IngestSettings::from_file("/definitely/not/here.json").unwrap_err();
        assert!(matches!(err, IngestError::Config(_)));
    }
}
