use std::str::FromStr;
use std::time::Duration;

use crate::error::{AppError, Result};

pub const SALES_API_URL: &str = "https://api.phygitals.com/api/marketplace/sales";

/// Address of the marketplace's automated claw machine. Sales touching it are
/// machine-initiated.
pub const CLAW_MACHINE_ADDRESS: &str = "62Q9eeDY3eM8A5CnprBGYMPShdBjAzdpBdr71QHsS8dS";

pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko)";

/// Backward date searches start here when the source cannot report its size.
pub const FALLBACK_SEARCH_START_PAGE: u32 = 10_000;

/// Channel capacity for worker → coordinator events.
pub const CHANNEL_CAPACITY: usize = 1024;

/// Retry-After headers above this are ignored.
pub const MAX_RETRY_AFTER_SECS: u64 = 600;

#[derive(Debug, Clone)]
pub struct Config {
    pub api_url: String,
    pub user_agent: String,
    pub log_level: String,
    pub db_path: String,
    pub progress_path: String,
    /// Records requested per page (PAGE_SIZE)
    pub page_size: u32,
    /// Per-request timeout (FETCH_TIMEOUT_SECS)
    pub fetch_timeout: Duration,
    /// Retries after the first attempt for transient / rate-limited fetches (FETCH_MAX_RETRIES)
    pub fetch_max_retries: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    /// Pause between consecutive page fetches inside one worker (PAGE_DELAY_MS)
    pub page_delay: Duration,
    /// Buffered records that trigger a flush (FLUSH_THRESHOLD)
    pub flush_threshold: usize,
    /// Consecutive empty pages after which a worker assumes the end of data (MAX_EMPTY_PAGES)
    pub max_empty_pages: u32,
    /// Upper page bound when neither the CLI nor the source provides one (MAX_PAGES)
    pub max_pages: u32,
    pub workers: usize,
    /// Where backward date searches begin when the source reports no total (SEARCH_START_PAGE)
    pub search_start_page: u32,
    /// Probe ceiling for the date locator (SEARCH_MAX_PROBES)
    pub search_max_probes: u32,
    pub db_max_connections: u32,
    pub db_acquire_timeout: Duration,
    /// Retries for transient storage errors (DB_WRITE_RETRIES)
    pub db_write_retries: u32,
    /// Addresses whose sales are machine-initiated (MACHINE_ADDRESSES, comma-separated)
    pub machine_addresses: Vec<String>,
    /// Optional port for the read-only status server (STATUS_PORT)
    pub status_port: Option<u16>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let status_port = match std::env::var("STATUS_PORT") {
            Ok(v) if !v.trim().is_empty() => Some(v.trim().parse::<u16>().map_err(|_| {
                AppError::Config("STATUS_PORT must be a valid port number".to_string())
            })?),
            _ => None,
        };

        let machine_addresses: Vec<String> = std::env::var("MACHINE_ADDRESSES")
            .unwrap_or_else(|_| CLAW_MACHINE_ADDRESS.to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let cfg = Self {
            api_url: std::env::var("SALES_API_URL").unwrap_or_else(|_| SALES_API_URL.to_string()),
            user_agent: std::env::var("USER_AGENT")
                .unwrap_or_else(|_| DEFAULT_USER_AGENT.to_string()),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            db_path: std::env::var("DB_PATH").unwrap_or_else(|_| "harvest.db".to_string()),
            progress_path: std::env::var("PROGRESS_PATH")
                .unwrap_or_else(|_| "scraping_progress.json".to_string()),
            page_size: env_or("PAGE_SIZE", 10)?,
            fetch_timeout: Duration::from_secs(env_or("FETCH_TIMEOUT_SECS", 30)?),
            fetch_max_retries: env_or("FETCH_MAX_RETRIES", 3)?,
            retry_base_delay: Duration::from_millis(env_or("RETRY_BASE_DELAY_MS", 1_000)?),
            retry_max_delay: Duration::from_millis(env_or("RETRY_MAX_DELAY_MS", 30_000)?),
            page_delay: Duration::from_millis(env_or("PAGE_DELAY_MS", 100)?),
            flush_threshold: env_or("FLUSH_THRESHOLD", 100)?,
            max_empty_pages: env_or("MAX_EMPTY_PAGES", 25)?,
            max_pages: env_or("MAX_PAGES", 1_000)?,
            workers: env_or("WORKERS", 1)?,
            search_start_page: env_or("SEARCH_START_PAGE", FALLBACK_SEARCH_START_PAGE)?,
            search_max_probes: env_or("SEARCH_MAX_PROBES", 50)?,
            db_max_connections: env_or("DB_MAX_CONNECTIONS", 10)?,
            db_acquire_timeout: Duration::from_secs(env_or("DB_ACQUIRE_TIMEOUT_SECS", 30)?),
            db_write_retries: env_or("DB_WRITE_RETRIES", 3)?,
            machine_addresses,
            status_port,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.page_size == 0 {
            return Err(AppError::Config("PAGE_SIZE must be at least 1".to_string()));
        }
        if self.flush_threshold == 0 {
            return Err(AppError::Config("FLUSH_THRESHOLD must be at least 1".to_string()));
        }
        if self.workers == 0 {
            return Err(AppError::Config("WORKERS must be at least 1".to_string()));
        }
        if self.db_max_connections == 0 {
            return Err(AppError::Config("DB_MAX_CONNECTIONS must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Read `key` from the environment, falling back to `default` when unset.
/// A set-but-unparsable value is a configuration error rather than a silent default.
fn env_or<T: FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map_err(|_| AppError::Config(format!("{key} has an invalid value: {raw:?}"))),
        _ => Ok(default),
    }
}

#[cfg(test)]
impl Config {
    /// Small, fast settings for unit tests: no pacing, millisecond backoff.
    pub fn for_tests(db_path: &str, progress_path: &str) -> Self {
        Self {
            api_url: "http://127.0.0.1:9/sales".to_string(),
            user_agent: "harvester-tests".to_string(),
            log_level: "debug".to_string(),
            db_path: db_path.to_string(),
            progress_path: progress_path.to_string(),
            page_size: 10,
            fetch_timeout: Duration::from_secs(5),
            fetch_max_retries: 2,
            retry_base_delay: Duration::from_millis(1),
            retry_max_delay: Duration::from_millis(5),
            page_delay: Duration::ZERO,
            flush_threshold: 100,
            max_empty_pages: 25,
            max_pages: 1_000,
            workers: 1,
            search_start_page: FALLBACK_SEARCH_START_PAGE,
            search_max_probes: 50,
            db_max_connections: 4,
            db_acquire_timeout: Duration::from_secs(5),
            db_write_retries: 2,
            machine_addresses: vec![CLAW_MACHINE_ADDRESS.to_string()],
            status_port: None,
        }
    }
}
