use std::env;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub store_url: String,
    pub store_api_key: String,
    pub ehr_base_url: String,
    pub ehr_api_key: String,
    /// Token-bucket capacity for the EHR gateway.
    pub ehr_rate_limit_burst: u32,
    /// Tokens replenished per second.
    pub ehr_rate_limit_per_second: f64,
    /// Hard cap on concurrently in-flight EHR calls.
    pub ehr_max_concurrent: u32,
    /// Requests waiting for admission beyond this bound fail fast.
    pub ehr_queue_depth: u32,
    /// Per-request timeout for outbound HTTP calls, in seconds.
    pub http_timeout_seconds: u64,
    /// Base delay for exponential backoff against the EHR, in milliseconds.
    pub ehr_backoff_base_ms: u64,
    /// Maximum attempts for retryable EHR operations.
    pub ehr_max_attempts: u32,
    /// TTL for the external-appointment read cache, in seconds.
    pub ehr_cache_ttl_seconds: u64,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let config = Self {
            store_url: env::var("STORE_URL").unwrap_or_else(|_| {
                warn!("STORE_URL not set, using empty value");
                String::new()
            }),
            store_api_key: env::var("STORE_API_KEY").unwrap_or_else(|_| {
                warn!("STORE_API_KEY not set, using empty value");
                String::new()
            }),
            ehr_base_url: env::var("EHR_BASE_URL").unwrap_or_else(|_| {
                warn!("EHR_BASE_URL not set, using empty value");
                String::new()
            }),
            ehr_api_key: env::var("EHR_API_KEY").unwrap_or_else(|_| {
                warn!("EHR_API_KEY not set, using empty value");
                String::new()
            }),
            ehr_rate_limit_burst: parse_env("EHR_RATE_LIMIT_BURST", 10),
            ehr_rate_limit_per_second: parse_env("EHR_RATE_LIMIT_PER_SECOND", 5.0),
            ehr_max_concurrent: parse_env("EHR_MAX_CONCURRENT", 4),
            ehr_queue_depth: parse_env("EHR_QUEUE_DEPTH", 64),
            http_timeout_seconds: parse_env("HTTP_TIMEOUT_SECONDS", 15),
            ehr_backoff_base_ms: parse_env("EHR_BACKOFF_BASE_MS", 500),
            ehr_max_attempts: parse_env("EHR_MAX_ATTEMPTS", 4),
            ehr_cache_ttl_seconds: parse_env("EHR_CACHE_TTL_SECONDS", 60),
        };

        if !config.is_configured() {
            warn!("Application not fully configured - missing environment variables");
        }

        config
    }

    pub fn is_configured(&self) -> bool {
        !self.store_url.is_empty() && !self.store_api_key.is_empty()
    }

    pub fn is_ehr_configured(&self) -> bool {
        !self.ehr_base_url.is_empty() && !self.ehr_api_key.is_empty()
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("{} is not a valid value, using default", name);
            default
        }),
        Err(_) => default,
    }
}
