use anyhow::{Context, Result, bail};
use clap::Parser;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use lib_common::core::{JobSettings, LeaderboardKeys};
use lib_common::feeds::FundaQuery;

const DEFAULT_CONFIG_FILE: &str = "leaderboard.conf";
const DEFAULT_BOARD: &str = "funda:Makelaar:top10=/amsterdam/tuin/";
const DEFAULT_RECONNECT_DELAY_SECONDS: u64 = 5;

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[clap(about = "Makelaar leaderboard aggregation worker", version)]
#[serde(rename_all = "camelCase")]
pub struct WorkerConfig {
    #[clap(long, env = "LEADERBOARD_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "LEADERBOARD_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "LEADERBOARD_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "LEADERBOARD_REDIS_URL", help = "Redis connection URL.")]
    pub redis_url: Option<String>,

    #[clap(long, env = "LEADERBOARD_REDIS_DB", help = "Redis database index the key events are read from.")]
    pub redis_db: Option<i64>,

    #[clap(long, env = "LEADERBOARD_RECONNECT_DELAY_SECONDS", help = "Pause before re-subscribing to key events after a dropped connection.")]
    pub reconnect_delay_seconds: Option<u64>,

    #[clap(long, env = "LEADERBOARD_ENABLE_KEYSPACE_EVENTS", help = "Issue CONFIG SET notify-keyspace-events at startup (true/false).")]
    pub enable_keyspace_events: Option<bool>,

    #[clap(long, env = "LEADERBOARD_FEED_URL", help = "Base URL of the listing feed.")]
    pub feed_base_url: Option<String>,

    #[clap(long, env = "LEADERBOARD_API_KEY", help = "Partner API key of the listing feed.")]
    pub api_key: Option<String>,

    #[clap(long, env = "LEADERBOARD_SEARCH_TYPE", help = "Listing type to search (koop or huur).")]
    pub search_type: Option<String>,

    #[clap(long, env = "LEADERBOARD_PAGE_SIZE", help = "Records per feed page.")]
    pub page_size: Option<u32>,

    #[clap(long, env = "LEADERBOARD_HTTP_TIMEOUT_SECONDS", help = "Per-request HTTP timeout in seconds.")]
    pub http_timeout_seconds: Option<u64>,

    #[clap(long, env = "LEADERBOARD_HTTP_MAX_RETRIES", help = "Retries of transient HTTP failures.")]
    pub http_max_retries: Option<u32>,

    #[clap(long, env = "LEADERBOARD_RATE_LIMIT_CALLS", help = "Feed calls admitted per rate-limit window.")]
    pub rate_limit_calls: Option<u64>,

    #[clap(long, env = "LEADERBOARD_RATE_LIMIT_WINDOW_SECONDS", help = "Rate-limit window in seconds.")]
    pub rate_limit_window_seconds: Option<u64>,

    #[clap(long, env = "LEADERBOARD_LOCK_TTL_SECONDS", help = "Expiry of the processing lock in seconds.")]
    pub lock_ttl_seconds: Option<u64>,

    #[clap(long, env = "LEADERBOARD_TTL_MINUTES", help = "Minutes a finished leaderboard lives before it is recomputed.")]
    pub leaderboard_ttl_minutes: Option<u64>,

    #[clap(long, env = "LEADERBOARD_BOARDS", value_delimiter = ',', help = "Leaderboards as <key prefix>=<search area>, comma separated.")]
    pub boards: Option<Vec<String>>,
}

impl WorkerConfig {
    // Merge two configs, where 'other' overrides 'self' for Some values
    fn merge(self, other: WorkerConfig) -> WorkerConfig {
        WorkerConfig {
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            redis_url: other.redis_url.or(self.redis_url),
            redis_db: other.redis_db.or(self.redis_db),
            reconnect_delay_seconds: other.reconnect_delay_seconds.or(self.reconnect_delay_seconds),
            enable_keyspace_events: other.enable_keyspace_events.or(self.enable_keyspace_events),
            feed_base_url: other.feed_base_url.or(self.feed_base_url),
            api_key: other.api_key.or(self.api_key),
            search_type: other.search_type.or(self.search_type),
            page_size: other.page_size.or(self.page_size),
            http_timeout_seconds: other.http_timeout_seconds.or(self.http_timeout_seconds),
            http_max_retries: other.http_max_retries.or(self.http_max_retries),
            rate_limit_calls: other.rate_limit_calls.or(self.rate_limit_calls),
            rate_limit_window_seconds: other.rate_limit_window_seconds.or(self.rate_limit_window_seconds),
            lock_ttl_seconds: other.lock_ttl_seconds.or(self.lock_ttl_seconds),
            leaderboard_ttl_minutes: other.leaderboard_ttl_minutes.or(self.leaderboard_ttl_minutes),
            boards: other.boards.or(self.boards),
        }
    }

    fn defaults() -> WorkerConfig {
        let job = JobSettings::default();
        let feed = FundaQuery::default();
        WorkerConfig {
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            redis_url: Some("redis://127.0.0.1:6379/0".to_string()),
            redis_db: Some(0),
            reconnect_delay_seconds: Some(DEFAULT_RECONNECT_DELAY_SECONDS),
            enable_keyspace_events: Some(false),
            feed_base_url: Some(feed.base_url),
            search_type: Some(feed.search_type),
            page_size: Some(feed.page_size),
            http_timeout_seconds: Some(feed.timeout.as_secs()),
            http_max_retries: Some(feed.max_retries),
            rate_limit_calls: Some(job.rate_limit),
            rate_limit_window_seconds: Some(job.rate_window.as_secs()),
            lock_ttl_seconds: Some(job.lock_ttl.as_secs()),
            leaderboard_ttl_minutes: Some(job.leaderboard_ttl.as_secs() / 60),
            boards: Some(vec![DEFAULT_BOARD.to_string()]),
            ..Default::default()
        }
    }

    /// Validates the merged values into the settings the worker runs with.
    pub fn resolve(self) -> Result<WorkerSettings> {
        let defaults = WorkerConfig::defaults();
        let c = defaults.merge(self);

        let api_key = c.api_key.filter(|k| !k.trim().is_empty()).context(
            "No feed API key configured (--api-key, LEADERBOARD_API_KEY or apiKey in the config file)",
        )?;

        let mut boards = Vec::new();
        for entry in c.boards.unwrap_or_default() {
            boards.push(BoardSettings::parse(&entry)?);
        }
        if boards.is_empty() {
            bail!("No leaderboards configured");
        }

        let page_size = c.page_size.unwrap_or(100);
        if page_size == 0 {
            bail!("Page size must be at least 1");
        }
        let rate_limit = c.rate_limit_calls.unwrap_or(100);
        if rate_limit == 0 {
            bail!("Rate limit must admit at least 1 call per window");
        }
        let rate_window_seconds = c.rate_limit_window_seconds.unwrap_or(60);
        if rate_window_seconds == 0 {
            bail!("Rate-limit window must be at least 1 second");
        }
        let lock_ttl_seconds = c.lock_ttl_seconds.unwrap_or(300);
        if lock_ttl_seconds == 0 {
            bail!("Lock TTL must be at least 1 second");
        }
        let reconnect_delay_seconds = c.reconnect_delay_seconds.unwrap_or(DEFAULT_RECONNECT_DELAY_SECONDS);
        if reconnect_delay_seconds == 0 {
            bail!("Reconnect delay must be at least 1 second");
        }

        Ok(WorkerSettings {
            log_dir: c.log_dir.unwrap_or_else(|| PathBuf::from("./logs")),
            log_level: c.log_level.unwrap_or_else(|| "info".to_string()),
            redis_url: c.redis_url.unwrap_or_default(),
            redis_db: c.redis_db.unwrap_or(0),
            reconnect_delay: Duration::from_secs(reconnect_delay_seconds),
            enable_keyspace_events: c.enable_keyspace_events.unwrap_or(false),
            feed: FundaQuery {
                base_url: c.feed_base_url.unwrap_or_default(),
                api_key,
                search_type: c.search_type.unwrap_or_else(|| "koop".to_string()),
                page_size,
                timeout: Duration::from_secs(c.http_timeout_seconds.unwrap_or(30)),
                max_retries: c.http_max_retries.unwrap_or(3),
                ..Default::default()
            },
            job: JobSettings {
                lock_ttl: Duration::from_secs(lock_ttl_seconds),
                leaderboard_ttl: Duration::from_secs(c.leaderboard_ttl_minutes.unwrap_or(720) * 60),
                rate_limit,
                rate_window: Duration::from_secs(rate_window_seconds),
            },
            boards,
        })
    }
}

/// One leaderboard the worker maintains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardSettings {
    pub keys: LeaderboardKeys,
    pub area: String,
}

impl BoardSettings {
    /// Parses `<key prefix>=<search area>`.
    pub fn parse(entry: &str) -> Result<Self> {
        let Some((prefix, area)) = entry.split_once('=') else {
            bail!("Invalid leaderboard '{}', expected <key prefix>=<search area>", entry);
        };
        let (prefix, area) = (prefix.trim(), area.trim());
        if prefix.is_empty() || area.is_empty() {
            bail!("Invalid leaderboard '{}', prefix and area must not be empty", entry);
        }
        Ok(Self {
            keys: LeaderboardKeys::new(prefix),
            area: area.to_string(),
        })
    }
}

/// Fully resolved worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub log_dir: PathBuf,
    pub log_level: String,
    pub redis_url: String,
    pub redis_db: i64,
    /// Pause between key-event subscription attempts.
    pub reconnect_delay: Duration,
    pub enable_keyspace_events: bool,
    /// Feed settings shared by all boards; the area is set per board.
    pub feed: FundaQuery,
    pub job: JobSettings,
    pub boards: Vec<BoardSettings>,
}

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[clap(about = "Makelaar leaderboard read API", version)]
#[serde(rename_all = "camelCase")]
pub struct ApiConfig {
    #[clap(long, env = "LEADERBOARD_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "LEADERBOARD_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "LEADERBOARD_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "LEADERBOARD_REDIS_URL", help = "Redis connection URL.")]
    pub redis_url: Option<String>,

    #[clap(long, env = "LEADERBOARD_PORT", help = "Port the read API listens on.")]
    pub port: Option<u16>,

    #[clap(long, env = "LEADERBOARD_KEY", help = "Key of the leaderboard to serve.")]
    pub leaderboard_key: Option<String>,

    #[clap(long, env = "LEADERBOARD_TOP_N", help = "Number of entries returned.")]
    pub top_n: Option<usize>,
}

impl ApiConfig {
    fn merge(self, other: ApiConfig) -> ApiConfig {
        ApiConfig {
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            redis_url: other.redis_url.or(self.redis_url),
            port: other.port.or(self.port),
            leaderboard_key: other.leaderboard_key.or(self.leaderboard_key),
            top_n: other.top_n.or(self.top_n),
        }
    }

    /// Fills defaults into the merged values.
    pub fn resolve(self) -> ApiSettings {
        ApiSettings {
            log_dir: self.log_dir.unwrap_or_else(|| PathBuf::from("./logs")),
            log_level: self.log_level.unwrap_or_else(|| "info".to_string()),
            redis_url: self
                .redis_url
                .unwrap_or_else(|| "redis://127.0.0.1:6379/0".to_string()),
            port: self.port.unwrap_or(8080),
            leaderboard_key: self
                .leaderboard_key
                .unwrap_or_else(|| "funda:Makelaar:top10".to_string()),
            top_n: self.top_n.unwrap_or(10),
        }
    }
}

/// Fully resolved read API configuration.
#[derive(Debug, Clone)]
pub struct ApiSettings {
    pub log_dir: PathBuf,
    pub log_level: String,
    pub redis_url: String,
    pub port: u16,
    pub leaderboard_key: String,
    pub top_n: usize,
}

/// Reads a JSON config file. A missing file is not an error; an unreadable
/// or malformed one is logged and skipped.
fn read_config_file<T: DeserializeOwned>(path: &Path) -> Option<T> {
    if !path.exists() {
        log::info!("Config file not found at {}. Using defaults and environment/CLI variables.", path.display());
        return None;
    }
    let config_str = match fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            log::warn!("Failed to read config file {}: {}. Falling back to other sources.", path.display(), e);
            return None;
        }
    };
    match serde_json::from_str::<T>(&config_str) {
        Ok(c) => Some(c),
        Err(e) => {
            log::warn!("Failed to parse config file {}: {}. Falling back to other sources.", path.display(), e);
            None
        }
    }
}

/// Layers the config file under already parsed CLI/env values.
pub fn layer_worker_config(cli: WorkerConfig) -> WorkerConfig {
    let path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
    let file = read_config_file::<WorkerConfig>(&path).unwrap_or_default();
    file.merge(cli)
}

/// Same as [`layer_worker_config`] for the read API.
pub fn layer_api_config(cli: ApiConfig) -> ApiConfig {
    let path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
    let file = read_config_file::<ApiConfig>(&path).unwrap_or_default();
    file.merge(cli)
}

/// Defaults < config file < environment/CLI, for the worker.
pub fn load_worker_config() -> Result<WorkerSettings> {
    // Let a .env file feed the `env =` attributes
    let _ = dotenvy::dotenv();
    layer_worker_config(WorkerConfig::parse()).resolve()
}

/// Defaults < config file < environment/CLI, for the read API.
pub fn load_api_config() -> ApiSettings {
    let _ = dotenvy::dotenv();
    layer_api_config(ApiConfig::parse()).resolve()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(json: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_worker_defaults_need_only_an_api_key() {
        let settings = WorkerConfig {
            api_key: Some("KEY".to_string()),
            ..Default::default()
        }
        .resolve()
        .unwrap();

        assert_eq!(settings.job.lock_ttl, Duration::from_secs(300));
        assert_eq!(settings.job.leaderboard_ttl, Duration::from_secs(720 * 60));
        assert_eq!(settings.job.rate_limit, 100);
        assert_eq!(settings.job.rate_window, Duration::from_secs(60));
        assert_eq!(settings.feed.page_size, 100);
        assert_eq!(settings.reconnect_delay, Duration::from_secs(5));
        assert_eq!(settings.boards.len(), 1);
        assert_eq!(settings.boards[0].keys.leaderboard, "funda:Makelaar:top10");
        assert_eq!(settings.boards[0].area, "/amsterdam/tuin/");
        assert!(!settings.enable_keyspace_events);
    }

    #[test]
    fn test_worker_without_api_key_is_rejected() {
        assert!(WorkerConfig::default().resolve().is_err());
        let blank = WorkerConfig {
            api_key: Some("  ".to_string()),
            ..Default::default()
        };
        assert!(blank.resolve().is_err());
    }

    #[test]
    fn test_cli_overrides_file_overrides_defaults() {
        let file = write_config(
            r#"{"apiKey": "FROM_FILE", "pageSize": 10, "rateLimitCalls": 50, "boards": ["a:b=/utrecht/"]}"#,
        );
        let path = file.path().to_string_lossy().to_string();
        let cli = WorkerConfig::try_parse_from([
            "worker_leaderboard",
            "--config-path",
            path.as_str(),
            "--page-size",
            "40",
        ])
        .unwrap();

        let settings = layer_worker_config(cli).resolve().unwrap();

        assert_eq!(settings.feed.api_key, "FROM_FILE");
        assert_eq!(settings.feed.page_size, 40);
        assert_eq!(settings.job.rate_limit, 50);
        assert_eq!(settings.boards[0].keys.checkpoint, "a:b:progress");
        assert_eq!(settings.boards[0].area, "/utrecht/");
    }

    #[test]
    fn test_malformed_file_falls_back_to_cli() {
        let file = write_config("{ not json");
        let path = file.path().to_string_lossy().to_string();
        let cli = WorkerConfig::try_parse_from([
            "worker_leaderboard",
            "--config-path",
            path.as_str(),
            "--api-key",
            "CLI",
        ])
        .unwrap();

        let settings = layer_worker_config(cli).resolve().unwrap();
        assert_eq!(settings.feed.api_key, "CLI");
    }

    #[test]
    fn test_zero_limits_are_rejected() {
        let with = |f: fn(&mut WorkerConfig)| {
            let mut config = WorkerConfig {
                api_key: Some("KEY".to_string()),
                ..Default::default()
            };
            f(&mut config);
            config.resolve()
        };

        assert!(with(|_| {}).is_ok());
        assert!(with(|c| c.page_size = Some(0)).is_err());
        assert!(with(|c| c.rate_limit_calls = Some(0)).is_err());
        assert!(with(|c| c.rate_limit_window_seconds = Some(0)).is_err());
        assert!(with(|c| c.lock_ttl_seconds = Some(0)).is_err());
        assert!(with(|c| c.reconnect_delay_seconds = Some(0)).is_err());
    }

    #[test]
    fn test_board_entries_are_validated() {
        let board = BoardSettings::parse("x:y = /rotterdam/ ").unwrap();
        assert_eq!(board.keys.lock, "x:y:lock");
        assert_eq!(board.area, "/rotterdam/");

        assert!(BoardSettings::parse("no-separator").is_err());
        assert!(BoardSettings::parse("=/area/").is_err());
    }

    #[test]
    fn test_api_defaults_and_file_values() {
        let file = write_config(r#"{"port": 9100, "topN": 5}"#);
        let path = file.path().to_string_lossy().to_string();
        let cli = ApiConfig::try_parse_from(["server_leaderboard", "--config-path", path.as_str()]).unwrap();

        let settings = layer_api_config(cli).resolve();
        assert_eq!(settings.port, 9100);
        assert_eq!(settings.top_n, 5);
        assert_eq!(settings.leaderboard_key, "funda:Makelaar:top10");
    }
}
