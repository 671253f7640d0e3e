use chrono::FixedOffset;
use clap::Parser;
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "GATEWAY_PORT", default_value = "3001")]
    pub port: u16,

    #[clap(long, env = "GATEWAY_CONFIG_PATH")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "GATEWAY_LOG_DIR", default_value = "./logs")]
    pub log_dir: PathBuf,

    #[clap(long, env = "GATEWAY_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// How many log files from previous runs to keep.
    #[clap(long, env = "GATEWAY_LOG_RETENTION", default_value = "3")]
    pub log_retention: usize,

    /// SQLite file holding the event log and derived session state.
    #[clap(long, env = "GATEWAY_DB_PATH", default_value = "./session_gateway.db")]
    pub db_path: PathBuf,

    /// Host the imaging host's API and socket are reachable on.
    #[clap(long, env = "NINA_HOST", default_value = "localhost")]
    pub nina_host: String,

    #[clap(long, env = "NINA_API_PORT", default_value = "1888")]
    pub nina_api_port: u16,

    /// Handshake/request timeout towards the imaging host, in seconds.
    #[clap(long, env = "NINA_TIMEOUT_SECS", default_value = "10")]
    pub nina_timeout_secs: u64,

    /// Reconnect attempts before the maxReconnectReached condition is
    /// surfaced. Retries continue at the capped delay regardless.
    #[clap(long, env = "NINA_RETRY_ATTEMPTS", default_value = "10")]
    pub nina_retry_attempts: u32,

    /// UTC offset applied to upstream timestamps that carry no timezone.
    #[clap(long, env = "NINA_TIMEZONE_OFFSET", default_value = "-05:00")]
    pub nina_timezone_offset: String,

    #[clap(long, env = "GATEWAY_MAX_DASHBOARD_CLIENTS", default_value = "100")]
    pub max_dashboard_clients: usize,

    /// How many events to retain per session for quick client replay.
    #[clap(long, env = "GATEWAY_EVENT_REPLAY_WINDOW", default_value = "20")]
    pub event_replay_window: usize,

    #[clap(long, env = "TLS_CERT_PATH")]
    pub tls_cert_path: Option<PathBuf>,

    #[clap(long, env = "TLS_KEY_PATH")]
    pub tls_key_path: Option<PathBuf>,
}

impl Config {
    /// WebSocket endpoint of the imaging host's event stream.
    pub fn nina_socket_url(&self) -> String {
        format!("ws://{}:{}/v2/socket", self.nina_host, self.nina_api_port)
    }

    /// Base URL of the imaging host's HTTP API.
    pub fn nina_http_base(&self) -> String {
        format!("http://{}:{}/", self.nina_host, self.nina_api_port)
    }

    pub fn nina_timeout(&self) -> Duration {
        Duration::from_secs(self.nina_timeout_secs)
    }

    /// The configured offset as a `FixedOffset`. Falls back to -05:00 when
    /// the configured string does not parse.
    pub fn timezone_offset(&self) -> FixedOffset {
        match crate::gateway_logic::normalizer::parse_utc_offset(&self.nina_timezone_offset) {
            Some(offset) => offset,
            None => {
                log::warn!(
                    "Invalid ninaTimezoneOffset '{}', falling back to -05:00",
                    self.nina_timezone_offset
                );
                FixedOffset::west_opt(5 * 3600).unwrap_or_else(|| FixedOffset::east_opt(0).unwrap())
            }
        }
    }
}

pub fn load_config() -> Config {
    let cli_config = Config::parse();

    let config_from_file = cli_config.config_path.as_ref().and_then(|path| {
        fs::read_to_string(path)
            .ok()
            .and_then(|c| serde_json::from_str::<Config>(&c).ok())
    });

    if let Some(file_config) = config_from_file {
        // Command-line arguments override file configuration
        Config {
            port: cli_config.port,
            config_path: cli_config.config_path,
            log_dir: cli_config.log_dir,
            log_level: cli_config.log_level,
            log_retention: cli_config.log_retention,
            db_path: cli_config.db_path,
            nina_host: cli_config.nina_host,
            nina_api_port: cli_config.nina_api_port,
            nina_timeout_secs: cli_config.nina_timeout_secs,
            nina_retry_attempts: cli_config.nina_retry_attempts,
            nina_timezone_offset: cli_config.nina_timezone_offset,
            max_dashboard_clients: cli_config.max_dashboard_clients,
            event_replay_window: cli_config.event_replay_window,
            tls_cert_path: cli_config.tls_cert_path.or(file_config.tls_cert_path),
            tls_key_path: cli_config.tls_key_path.or(file_config.tls_key_path),
        }
    } else {
        cli_config
    }
}
