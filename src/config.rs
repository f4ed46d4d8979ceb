//! Environment-driven configuration.
//!
//! All tunables live in one [`Settings`] struct created at startup and
//! shared through the process; no component reads the environment on its
//! own. Every field has a default so tests can build settings directly and
//! override only what they exercise.

use std::time::Duration;

use crate::upstream::http::UpstreamConfig;

/// Proxy-wide settings.
///
/// See the env-var table in the repository docs for the full surface; the
/// defaults match the original deployment's.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Upstream service base URL, no trailing slash
    pub upstream_base_url: String,

    /// Upstream credential, sent as `x-api-key`
    pub upstream_api_key: Option<String>,

    /// Sustained upstream requests per second
    pub upstream_rate_limit_rps: u32,

    /// Per-request upstream timeout (seconds)
    pub upstream_timeout_secs: u64,

    /// Retries for retryable upstream failures
    pub retry_attempts: u32,

    /// Exponential backoff base (milliseconds)
    pub retry_backoff_base_ms: u64,

    /// Graph-store freshness window (hours)
    pub freshness_window_hours: u64,

    /// TTL for `paper:*:full` entries (seconds)
    pub cache_paper_ttl_secs: u64,

    /// TTL for relation views and pages (seconds)
    pub cache_relation_ttl_secs: u64,

    /// TTL for search results (seconds)
    pub cache_search_ttl_secs: u64,

    /// TTL for negative entries (seconds)
    pub cache_negative_ttl_secs: u64,

    /// Single-flight token TTL (seconds)
    pub single_flight_ttl_secs: u64,

    /// Waiter poll interval while another fetch is in flight (ms)
    pub single_flight_poll_ms: u64,

    /// Total waiter budget before falling through to a redundant fetch (ms)
    pub single_flight_wait_ms: u64,

    /// Relation size at which the background ingestor takes over
    pub large_relation_threshold: u64,

    /// Page size for relation pagination
    pub relation_page_size: u64,

    /// Maximum pages per ingest run
    pub relation_page_cap: u64,

    /// Citations/references kept inline on the paper body
    pub inline_relation_cap: usize,

    /// Maximum ids per batch request
    pub batch_size_cap: usize,

    /// Read-path deadline (seconds)
    pub request_deadline_secs: u64,

    /// Top search results warmed in the background after a miss (0 = off)
    pub search_ingest_top_n: usize,

    /// Stagger between background search warms (ms)
    pub search_ingest_delay_step_ms: u64,

    /// Local results required before prefer-local search skips Upstream
    pub search_local_min_results: usize,

    /// Alias database path (binaries)
    pub alias_db_path: String,

    /// Graph database path (binaries)
    pub graph_db_path: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            upstream_base_url: "https://api.semanticscholar.org/graph/v1".to_string(),
            upstream_api_key: None,
            upstream_rate_limit_rps: 10,
            upstream_timeout_secs: 60,
            retry_attempts: 3,
            retry_backoff_base_ms: 500,
            freshness_window_hours: 24,
            cache_paper_ttl_secs: 3600,
            cache_relation_ttl_secs: 3600,
            cache_search_ttl_secs: 1800,
            cache_negative_ttl_secs: 300,
            single_flight_ttl_secs: 300,
            single_flight_poll_ms: 500,
            single_flight_wait_ms: 4000,
            large_relation_threshold: 100,
            relation_page_size: 100,
            relation_page_cap: 100,
            inline_relation_cap: 100,
            batch_size_cap: 500,
            request_deadline_secs: 10,
            search_ingest_top_n: 3,
            search_ingest_delay_step_ms: 150,
            search_local_min_results: 3,
            alias_db_path: "data/aliases.db".to_string(),
            graph_db_path: "data/graph.db".to_string(),
        }
    }
}

impl Settings {
    /// Build settings from the environment, falling back to defaults for
    /// anything unset or unparsable.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            upstream_base_url: env_string("UPSTREAM_BASE_URL", d.upstream_base_url),
            upstream_api_key: std::env::var("UPSTREAM_API_KEY").ok().filter(|s| !s.is_empty()),
            upstream_rate_limit_rps: env_parse("UPSTREAM_RATE_LIMIT_RPS", d.upstream_rate_limit_rps),
            upstream_timeout_secs: env_parse("UPSTREAM_TIMEOUT_SECS", d.upstream_timeout_secs),
            retry_attempts: env_parse("RETRY_ATTEMPTS", d.retry_attempts),
            retry_backoff_base_ms: env_parse("RETRY_BACKOFF_BASE_MS", d.retry_backoff_base_ms),
            freshness_window_hours: env_parse("FRESHNESS_WINDOW_HOURS", d.freshness_window_hours),
            cache_paper_ttl_secs: env_parse("CACHE_PAPER_TTL_SECS", d.cache_paper_ttl_secs),
            cache_relation_ttl_secs: env_parse("CACHE_RELATION_TTL_SECS", d.cache_relation_ttl_secs),
            cache_search_ttl_secs: env_parse("CACHE_SEARCH_TTL_SECS", d.cache_search_ttl_secs),
            cache_negative_ttl_secs: env_parse("CACHE_NEGATIVE_TTL_SECS", d.cache_negative_ttl_secs),
            single_flight_ttl_secs: env_parse("SINGLE_FLIGHT_TTL_SECS", d.single_flight_ttl_secs),
            single_flight_poll_ms: env_parse("SINGLE_FLIGHT_POLL_MS", d.single_flight_poll_ms),
            single_flight_wait_ms: env_parse("SINGLE_FLIGHT_WAIT_MS", d.single_flight_wait_ms),
            large_relation_threshold: env_parse("LARGE_RELATION_THRESHOLD", d.large_relation_threshold),
            relation_page_size: env_parse("RELATION_PAGE_SIZE", d.relation_page_size),
            relation_page_cap: env_parse("RELATION_PAGE_CAP", d.relation_page_cap),
            inline_relation_cap: env_parse("INLINE_RELATION_CAP", d.inline_relation_cap),
            batch_size_cap: env_parse("BATCH_SIZE_CAP", d.batch_size_cap),
            request_deadline_secs: env_parse("REQUEST_DEADLINE_SECS", d.request_deadline_secs),
            search_ingest_top_n: env_parse("SEARCH_INGEST_TOP_N", d.search_ingest_top_n),
            search_ingest_delay_step_ms: env_parse(
                "SEARCH_INGEST_DELAY_STEP_MS",
                d.search_ingest_delay_step_ms,
            ),
            search_local_min_results: env_parse(
                "SEARCH_LOCAL_MIN_RESULTS",
                d.search_local_min_results,
            ),
            alias_db_path: env_string("ALIAS_DB_PATH", d.alias_db_path),
            graph_db_path: env_string("GRAPH_DB_PATH", d.graph_db_path),
        }
    }

    /// Connection settings for the HTTP upstream client.
    pub fn upstream_config(&self) -> UpstreamConfig {
        UpstreamConfig {
            base_url: self.upstream_base_url.clone(),
            api_key: self.upstream_api_key.clone(),
            timeout: Duration::from_secs(self.upstream_timeout_secs),
            rate_limit_rps: self.upstream_rate_limit_rps,
            retry_attempts: self.retry_attempts,
            retry_backoff_base: Duration::from_millis(self.retry_backoff_base_ms),
        }
    }

    pub fn freshness_window(&self) -> Duration {
        Duration::from_secs(self.freshness_window_hours * 3600)
    }

    pub fn paper_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_paper_ttl_secs)
    }

    pub fn relation_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_relation_ttl_secs)
    }

    pub fn search_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_search_ttl_secs)
    }

    pub fn negative_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_negative_ttl_secs)
    }

    pub fn single_flight_ttl(&self) -> Duration {
        Duration::from_secs(self.single_flight_ttl_secs)
    }

    pub fn single_flight_poll(&self) -> Duration {
        Duration::from_millis(self.single_flight_poll_ms)
    }

    pub fn single_flight_wait(&self) -> Duration {
        Duration::from_millis(self.single_flight_wait_ms)
    }

    pub fn request_deadline(&self) -> Duration {
        Duration::from_secs(self.request_deadline_secs)
    }
}

fn env_string(name: &str, default: String) -> String {
    std::env::var(name).ok().filter(|s| !s.is_empty()).unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let s = Settings::default();
        assert_eq!(s.batch_size_cap, 500);
        assert_eq!(s.large_relation_threshold, 100);
        assert_eq!(s.freshness_window(), Duration::from_secs(24 * 3600));
        assert!(s.negative_ttl() < s.paper_ttl());
        assert!(s.search_ttl() < s.paper_ttl());
    }

    #[test]
    fn test_upstream_config_mirrors_settings() {
        let mut s = Settings::default();
        s.upstream_rate_limit_rps = 42;
        s.retry_attempts = 5;
        let cfg = s.upstream_config();
        assert_eq!(cfg.rate_limit_rps, 42);
        assert_eq!(cfg.retry_attempts, 5);
        assert_eq!(cfg.base_url, s.upstream_base_url);
    }
}
