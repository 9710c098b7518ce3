use clap::Parser;
use lib_feed::{IngestSettings, Query, QueuePolicy, TrackerModeSetting};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[clap(about = "Listing change-feed ingestion server", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "FEED_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "FEED_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "FEED_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "FEED_URL", help = "Change feed endpoint.")]
    pub feed_url: Option<String>,

    #[clap(long, env = "FEED_INITIAL_CURSOR", help = "Resume from this change id instead of asking the seed sources.")]
    pub initial_cursor: Option<String>,

    #[clap(long, env = "FEED_POLL_INTERVAL_MS", help = "Milliseconds between scheduled feed polls.")]
    pub poll_interval_ms: Option<u64>,

    #[clap(long, env = "FEED_MIN_REQUEST_INTERVAL_MS", help = "Minimum milliseconds between two feed requests.")]
    pub min_request_interval_ms: Option<u64>,

    #[clap(long, env = "FEED_QUEUE_CAPACITY", help = "Decode queue capacity in batches; 0 selects an unbounded queue.")]
    pub queue_capacity: Option<usize>,

    #[clap(long, env = "FEED_BACKLOG_WARN_THRESHOLD", help = "Pending listings above which the decode backlog is reported.")]
    pub backlog_warn_threshold: Option<u64>,

    #[clap(long, env = "FEED_TRACKER_MODE", help = "Refresh mode of query trackers (manual, periodic, live).")]
    pub tracker_mode: Option<String>,

    #[clap(long, env = "FEED_TRACKER_PERIOD_MS", help = "Refresh period in milliseconds for periodic trackers.")]
    pub tracker_period_ms: Option<u64>,

    #[clap(long, env = "FEED_TRACKER_RETRY_DELAY_MS", help = "Milliseconds before a failed tracker is restarted.")]
    pub tracker_retry_delay_ms: Option<u64>,

    #[clap(long, env = "FEED_STATUS_INTERVAL_SECONDS", help = "Seconds between status log lines.")]
    pub status_interval_seconds: Option<u64>,

    /// Engine settings, file only.
    #[clap(skip)]
    pub ingest: Option<IngestSettings>,

    /// Queries registered at startup, file only.
    #[clap(skip)]
    pub queries: Option<Vec<Query>>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            feed_url: other.feed_url.or(self.feed_url),
            initial_cursor: other.initial_cursor.or(self.initial_cursor),
            poll_interval_ms: other.poll_interval_ms.or(self.poll_interval_ms),
            min_request_interval_ms: other.min_request_interval_ms.or(self.min_request_interval_ms),
            queue_capacity: other.queue_capacity.or(self.queue_capacity),
            backlog_warn_threshold: other.backlog_warn_threshold.or(self.backlog_warn_threshold),
            tracker_mode: other.tracker_mode.or(self.tracker_mode),
            tracker_period_ms: other.tracker_period_ms.or(self.tracker_period_ms),
            tracker_retry_delay_ms: other.tracker_retry_delay_ms.or(self.tracker_retry_delay_ms),
            status_interval_seconds: other.status_interval_seconds.or(self.status_interval_seconds),
            ingest: other.ingest.or(self.ingest),
            queries: other.queries.or(self.queries),
        }
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| PathBuf::from("./logs"))
    }

    pub fn log_level(&self) -> String {
        self.log_level.clone().unwrap_or_else(|| "info".to_string())
    }

    pub fn queries(&self) -> Vec<Query> {
        self.queries.clone().unwrap_or_default()
    }

    /// Engine settings from the file section with the flat overrides applied.
    pub fn to_settings(&self) -> anyhow::Result<IngestSettings> {
        let mut settings = self.ingest.clone().unwrap_or_default();

        if let Some(url) = &self.feed_url {
            settings.feed_url = url.clone();
        }
        if let Some(cursor) = &self.initial_cursor {
            settings.initial_cursor = Some(cursor.clone());
        }
        if let Some(ms) = self.poll_interval_ms {
            settings.poll_interval_ms = ms;
        }
        if let Some(ms) = self.min_request_interval_ms {
            settings.min_request_interval_ms = ms;
        }
        if let Some(capacity) = self.queue_capacity {
            settings.queue = match capacity {
                0 => QueuePolicy::Unbounded,
                n => QueuePolicy::Bounded(n),
            };
        }
        if let Some(threshold) = self.backlog_warn_threshold {
            settings.backlog_warn_threshold = threshold;
        }
        if let Some(mode) = &self.tracker_mode {
            settings.tracker.mode = match mode.to_lowercase().as_str() {
                "manual" => TrackerModeSetting::Manual,
                "periodic" => TrackerModeSetting::Periodic,
                "live" => TrackerModeSetting::Live,
                other => anyhow::bail!("unknown tracker mode: {}", other),
            };
        }
        if let Some(ms) = self.tracker_period_ms {
            settings.tracker.period_ms = ms;
        }
        if let Some(ms) = self.tracker_retry_delay_ms {
            settings.tracker.retry_delay_ms = ms;
        }

        settings.validate()?;
        Ok(settings)
    }
}

fn defaults() -> Config {
    Config {
        log_dir: Some(PathBuf::from("./logs")),
        log_level: Some("info".to_string()),
        status_interval_seconds: Some(60),
        ..Default::default()
    }
}

/// Layers the JSON file named by `cli` (or `server_feed.conf`) between the
/// defaults and `cli`.
pub fn resolve_config(cli: Config) -> Config {
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from("server_feed.conf"));

    let mut current_config = defaults();

    if config_file_path.exists() {
        match fs::read_to_string(&config_file_path) {
            Ok(config_str) => match serde_json::from_str::<Config>(&config_str) {
                Ok(file_config) => current_config = current_config.merge(file_config),
                Err(e) => log::warn!(
                    "Failed to parse config file {}: {}. Falling back to other sources.",
                    config_file_path.display(),
                    e
                ),
            },
            Err(e) => log::warn!(
                "Failed to read config file {}: {}. Falling back to other sources.",
                config_file_path.display(),
                e
            ),
        }
    } else {
        log::info!(
            "Config file not found at {}. Using defaults and environment/CLI variables.",
            config_file_path.display()
        );
    }

    // clap already folded the environment into the CLI values.
    current_config.merge(cli)
}

/// defaults ← JSON file ← environment/CLI.
pub fn load_config() -> Config {
    resolve_config(Config::parse())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_cli_overrides_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "logLevel": "debug",
                "pollIntervalMs": 700,
                "queries": [ {{ "league": "Standard", "nameContains": "ring" }} ],
                "ingest": {{ "feedUrl": "http://file/feed", "minRequestIntervalMs": 300 }}
            }}"#
        )
        .unwrap();

        let cli = Config::parse_from([
            "server_feed",
            "--config-path",
            file.path().to_str().unwrap(),
            "--poll-interval-ms",
            "900",
            "--queue-capacity",
            "0",
        ]);
        let config = resolve_config(cli);

        assert_eq!(config.log_level(), "debug");
        assert_eq!(config.log_dir(), PathBuf::from("./logs"));
        assert_eq!(config.queries().len(), 1);

        let settings = config.to_settings().unwrap();
        assert_eq!(settings.feed_url, "http://file/feed");
        assert_eq!(settings.poll_interval_ms, 900);
        assert_eq!(settings.min_request_interval_ms, 300);
        assert_eq!(settings.queue, QueuePolicy::Unbounded);
    }

    #[test]
    fn test_unknown_tracker_mode_is_rejected() {
        let config = Config {
            tracker_mode: Some("sometimes".into()),
            ..Default::default()
        };
        assert!(config.to_settings().is_err());
    }
}
