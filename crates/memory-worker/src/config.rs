// memory-worker/crates/memory-worker/src/config.rs

use anyhow::{Context, Result};
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

/// Directory fragments that indicate the data directory is synced by a cloud
/// storage client. SQLite in WAL mode does not survive those well.
const CLOUD_SYNC_MARKERS: &[&str] = &[
    "Dropbox",
    "OneDrive",
    "Google Drive",
    "GoogleDrive",
    "iCloud",
    "Mobile Documents",
    "Box Sync",
];

#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub api_host: String,
    pub api_port: u16,

    // Model subprocess
    pub query_bin: String,
    pub query_args: Vec<String>,
    pub model: String,
    pub query_timeout_seconds: u64,
    pub ready_timeout_seconds: u64,
    pub kill_grace_seconds: u64,

    // Queue and sessions
    pub max_retries: i32,
    pub consumer_error_backoff_ms: u64,
    pub stale_session_threshold_ms: i64,
    pub stuck_item_threshold_ms: i64,
    pub watchdog_interval_seconds: u64,
    pub history_limit: usize,

    // Pipeline
    pub context_observation_limit: usize,
    pub store_intermediates: bool,
    pub strict_parse: bool,
    pub skip_tools: Vec<String>,

    // Vector sync
    pub chroma_enabled: bool,
    pub chroma_url: String,
    pub chroma_collection_prefix: String,
    pub embeddings_url: Option<String>,
    pub embeddings_model: String,
    pub vector_request_timeout_seconds: u64,
    pub breaker_failure_threshold: u32,
    pub breaker_cooldown_seconds: u64,

    // Startup coordination
    pub spawn_lock_stale_ms: u64,
    pub readiness_timeout_seconds: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            warn!("Failed to load .env file: {}. Using system environment variables.", e);
        } else {
            info!("Loaded environment variables from .env file");
        }

        let data_dir = match env::var("MEMORY_WORKER_DATA_DIR") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => Self::default_data_dir()?,
        };
        let db_path = env::var("MEMORY_WORKER_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("memory.db"));

        let query_args = env::var("QUERY_ARGS")
            .map(|raw| split_list(&raw, ' '))
            .unwrap_or_default();
        let skip_tools = env::var("SKIP_TOOLS")
            .map(|raw| split_list(&raw, ','))
            .unwrap_or_else(|_| Self::default_skip_tools());

        let embeddings_url = env::var("EMBEDDINGS_URL").ok().filter(|url| !url.is_empty());

        Ok(Self {
            data_dir,
            db_path,
            api_host: env::var("API_HOST").unwrap_or_else(|_| "127.0.0.1".into()),
            api_port: env::var("API_PORT").unwrap_or_else(|_| "37777".into()).parse()?,
            query_bin: env::var("QUERY_BIN").unwrap_or_else(|_| "memory-query".into()),
            query_args,
            model: env::var("MEMORY_MODEL").unwrap_or_else(|_| "claude-haiku".into()),
            query_timeout_seconds: env::var("QUERY_TIMEOUT_SECONDS")
                .unwrap_or_else(|_| "300".into())
                .parse()?,
            ready_timeout_seconds: env::var("READY_TIMEOUT_SECONDS")
                .unwrap_or_else(|_| "10".into())
                .parse()?,
            kill_grace_seconds: env::var("KILL_GRACE_SECONDS")
                .unwrap_or_else(|_| "5".into())
                .parse()?,
            max_retries: env::var("MAX_RETRIES").unwrap_or_else(|_| "3".into()).parse()?,
            consumer_error_backoff_ms: env::var("CONSUMER_ERROR_BACKOFF_MS")
                .unwrap_or_else(|_| "1000".into())
                .parse()?,
            stale_session_threshold_ms: env::var("STALE_SESSION_THRESHOLD_MS")
                .unwrap_or_else(|_| "3600000".into())
                .parse()?,
            stuck_item_threshold_ms: env::var("STUCK_ITEM_THRESHOLD_MS")
                .unwrap_or_else(|_| "300000".into())
                .parse()?,
            watchdog_interval_seconds: env::var("WATCHDOG_INTERVAL_SECONDS")
                .unwrap_or_else(|_| "30".into())
                .parse()?,
            history_limit: env::var("HISTORY_LIMIT").unwrap_or_else(|_| "50".into()).parse()?,
            context_observation_limit: env::var("CONTEXT_OBSERVATION_LIMIT")
                .unwrap_or_else(|_| "10".into())
                .parse()?,
            store_intermediates: parse_bool(
                &env::var("STORE_INTERMEDIATES").unwrap_or_else(|_| "false".into()),
            )
            .context("STORE_INTERMEDIATES must be true or false")?,
            strict_parse: parse_bool(&env::var("STRICT_PARSE").unwrap_or_else(|_| "false".into()))
                .context("STRICT_PARSE must be true or false")?,
            skip_tools,
            chroma_enabled: parse_bool(
                &env::var("CHROMA_ENABLED").unwrap_or_else(|_| "true".into()),
            )
            .context("CHROMA_ENABLED must be true or false")?,
            chroma_url: env::var("CHROMA_URL").unwrap_or_else(|_| "http://127.0.0.1:8000".into()),
            chroma_collection_prefix: env::var("CHROMA_COLLECTION_PREFIX")
                .unwrap_or_else(|_| "cm".into()),
            embeddings_url,
            embeddings_model: env::var("EMBEDDINGS_MODEL")
                .unwrap_or_else(|_| "text-embedding".into()),
            vector_request_timeout_seconds: env::var("VECTOR_REQUEST_TIMEOUT_SECONDS")
                .unwrap_or_else(|_| "10".into())
                .parse()?,
            breaker_failure_threshold: env::var("BREAKER_FAILURE_THRESHOLD")
                .unwrap_or_else(|_| "3".into())
                .parse()?,
            breaker_cooldown_seconds: env::var("BREAKER_COOLDOWN_SECONDS")
                .unwrap_or_else(|_| "60".into())
                .parse()?,
            spawn_lock_stale_ms: env::var("SPAWN_LOCK_STALE_MS")
                .unwrap_or_else(|_| "10000".into())
                .parse()?,
            readiness_timeout_seconds: env::var("READINESS_TIMEOUT_SECONDS")
                .unwrap_or_else(|_| "30".into())
                .parse()?,
        })
    }

    fn default_data_dir() -> Result<PathBuf> {
        let home = env::var("HOME")
            .or_else(|_| env::var("USERPROFILE"))
            .context("Neither MEMORY_WORKER_DATA_DIR nor HOME is set")?;
        Ok(PathBuf::from(home).join(".memory-worker"))
    }

    fn default_skip_tools() -> Vec<String> {
        ["ListMcpResourcesTool", "SlashCommand", "Skill", "TodoWrite", "AskUserQuestion"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    pub fn print_config(&self) {
        info!("Current Configuration:");
        info!("- Data Dir: {}", self.data_dir.display());
        info!("- Database: {}", self.db_path.display());
        info!("- API: {}:{}", self.api_host, self.api_port);
        info!("- Query Binary: {} {:?}", self.query_bin, self.query_args);
        info!("- Model: {}", self.model);
        info!(
            "- Query Timeout: {}s (ready {}s, kill grace {}s)",
            self.query_timeout_seconds, self.ready_timeout_seconds, self.kill_grace_seconds
        );
        info!("- Max Retries: {}", self.max_retries);
        info!("- Stale Session Threshold: {}ms", self.stale_session_threshold_ms);
        info!("- Stuck Item Threshold: {}ms", self.stuck_item_threshold_ms);
        info!("- Strict Parse: {}", self.strict_parse);
        info!("- Store Intermediates: {}", self.store_intermediates);
        info!("- Skip Tools: {:?}", self.skip_tools);
        if self.chroma_enabled {
            info!("- Chroma: {} (prefix {})", self.chroma_url, self.chroma_collection_prefix);
        } else {
            info!("- Chroma: disabled");
        }
        info!(
            "- Circuit Breaker: {} failures, {}s cooldown",
            self.breaker_failure_threshold, self.breaker_cooldown_seconds
        );
    }

    pub fn api_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.api_host, self.api_port)
            .parse()
            .with_context(|| format!("Invalid API address {}:{}", self.api_host, self.api_port))
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.api_host, self.api_port)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_seconds)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_seconds)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_seconds)
    }

    pub fn consumer_error_backoff(&self) -> Duration {
        Duration::from_millis(self.consumer_error_backoff_ms)
    }

    pub fn breaker_cooldown(&self) -> Duration {
        Duration::from_secs(self.breaker_cooldown_seconds)
    }

    pub fn spawn_lock_stale(&self) -> Duration {
        Duration::from_millis(self.spawn_lock_stale_ms)
    }

    pub fn spawn_lock_key(&self) -> String {
        self.api_port.to_string()
    }

    pub fn should_skip_tool(&self, tool_name: &str) -> bool {
        self.skip_tools.iter().any(|t| t == tool_name)
    }

    /// Name of the cloud sync client that appears to own the data dir, if any.
    pub fn cloud_sync_provider(&self) -> Option<&'static str> {
        let path = self.data_dir.to_string_lossy();
        CLOUD_SYNC_MARKERS
            .iter()
            .copied()
            .find(|marker| path.contains(marker))
    }

    /// Defaults suitable for tests: everything under `data_dir`, vector sync off.
    pub fn for_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            db_path: data_dir.join("memory.db"),
            data_dir,
            api_host: "127.0.0.1".to_string(),
            api_port: 37777,
            query_bin: "memory-query".to_string(),
            query_args: Vec::new(),
            model: "claude-haiku".to_string(),
            query_timeout_seconds: 300,
            ready_timeout_seconds: 10,
            kill_grace_seconds: 5,
            max_retries: 3,
            consumer_error_backoff_ms: 1000,
            stale_session_threshold_ms: 3_600_000,
            stuck_item_threshold_ms: 300_000,
            watchdog_interval_seconds: 30,
            history_limit: 50,
            context_observation_limit: 10,
            store_intermediates: false,
            strict_parse: false,
            skip_tools: Self::default_skip_tools(),
            chroma_enabled: false,
            chroma_url: "http://127.0.0.1:8000".to_string(),
            chroma_collection_prefix: "cm".to_string(),
            embeddings_url: None,
            embeddings_model: "text-embedding".to_string(),
            vector_request_timeout_seconds: 10,
            breaker_failure_threshold: 3,
            breaker_cooldown_seconds: 60,
            spawn_lock_stale_ms: 10_000,
            readiness_timeout_seconds: 30,
        }
    }
}

fn split_list(raw: &str, separator: char) -> Vec<String> {
    raw.split(separator)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(anyhow::anyhow!("Invalid boolean value: {}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_config() -> Config {
        Config::for_data_dir("/tmp/memory-worker-test")
    }

    // ===== Configuration Structure Tests =====

    #[test]
    fn test_config_creation_with_default_values() {
        let config = create_test_config();

        assert_eq!(config.db_path, PathBuf::from("/tmp/memory-worker-test/memory.db"));
        assert_eq!(config.api_port, 37777);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.breaker_failure_threshold, 3);
        assert_eq!(config.kill_grace(), Duration::from_secs(5));
        assert_eq!(config.spawn_lock_stale(), Duration::from_secs(10));
        assert!(!config.chroma_enabled);
    }

    #[test]
    fn test_api_addr_and_base_url() {
        let config = create_test_config();
        assert_eq!(config.api_addr().unwrap().port(), 37777);
        assert_eq!(config.base_url(), "http://127.0.0.1:37777");
        assert_eq!(config.spawn_lock_key(), "37777");
    }

    #[test]
    fn test_invalid_api_host_is_an_error() {
        let mut config = create_test_config();
        config.api_host = "not a host".to_string();
        assert!(config.api_addr().is_err());
    }

    // ===== Helper Tests =====

    #[test]
    fn test_skip_tools() {
        let config = create_test_config();
        assert!(config.should_skip_tool("TodoWrite"));
        assert!(!config.should_skip_tool("Edit"));
    }

    #[test]
    fn test_cloud_sync_detection() {
        let config = Config::for_data_dir("/Users/me/Library/Mobile Documents/worker");
        assert_eq!(config.cloud_sync_provider(), Some("Mobile Documents"));
        assert_eq!(create_test_config().cloud_sync_provider(), None);
    }

    #[test]
    fn test_split_list_and_parse_bool() {
        assert_eq!(split_list("a, b,,c ", ','), vec!["a", "b", "c"]);
        assert!(split_list("", ',').is_empty());
        assert!(parse_bool("Yes").unwrap());
        assert!(!parse_bool("0").unwrap());
        assert!(parse_bool("maybe").is_err());
    }
}
