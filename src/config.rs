use std::path::PathBuf;
use std::time::Duration;

/// Retry/pacing knobs for the per-provider rate limiter.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Minimum wall-clock gap between consecutive sends to one provider.
    pub min_delay: Duration,
    /// Retries applied on top of the first attempt, `Transient` errors only.
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(750),
            max_retries: 3,
            backoff_base: Duration::from_millis(2000),
            backoff_cap: Duration::from_millis(30_000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Root for reports, decision logs, and the universe database.
    pub data_root: PathBuf,
    pub port: u16,
    pub rate: RateLimitConfig,
    /// Snapshot freshness window for non-forced silent refreshes.
    pub refresh_interval: Duration,
    /// Safety cutoff for a single report-generation run.
    pub generate_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_root: default_data_root(),
            port: 8080,
            rate: RateLimitConfig::default(),
            refresh_interval: Duration::from_millis(90_000),
            generate_timeout: Duration::from_millis(180_000),
        }
    }
}

impl Config {
    /// Build from environment variables.
    ///
    /// | Env Var | Default | Purpose |
    /// |---------|---------|---------|
    /// | `OPTSCAN_DATA_ROOT` | `~/.optscan` | Data directory |
    /// | `PORT` | `8080` | HTTP bind port |
    /// | `RATE_MIN_DELAY_MS` | `750` | Per-provider pacing gap |
    /// | `RATE_MAX_RETRIES` | `3` | Transient retry budget |
    /// | `RATE_BACKOFF_BASE_MS` | `2000` | Exponential backoff base |
    /// | `RATE_BACKOFF_CAP_MS` | `30000` | Backoff ceiling |
    /// | `REFRESH_INTERVAL_MS` | `90000` | Snapshot freshness window |
    /// | `GENERATE_TIMEOUT_MS` | `180000` | Report generation cutoff |
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            data_root: std::env::var("OPTSCAN_DATA_ROOT")
                .map_or(defaults.data_root, PathBuf::from),
            port: env_parse("PORT", defaults.port),
            rate: RateLimitConfig {
                min_delay: env_millis("RATE_MIN_DELAY_MS", defaults.rate.min_delay),
                max_retries: env_parse("RATE_MAX_RETRIES", defaults.rate.max_retries),
                backoff_base: env_millis("RATE_BACKOFF_BASE_MS", defaults.rate.backoff_base),
                backoff_cap: env_millis("RATE_BACKOFF_CAP_MS", defaults.rate.backoff_cap),
            },
            refresh_interval: env_millis("REFRESH_INTERVAL_MS", defaults.refresh_interval),
            generate_timeout: env_millis("GENERATE_TIMEOUT_MS", defaults.generate_timeout),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_millis(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .map_or(default, Duration::from_millis)
}

/// Default data directory: `~/.optscan`
fn default_data_root() -> PathBuf {
    std::env::var("HOME").map_or_else(|_| PathBuf::from("/tmp"), PathBuf::from)
        .join(".optscan")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = Config::default();
        assert_eq!(c.rate.min_delay, Duration::from_millis(750));
        assert_eq!(c.rate.max_retries, 3);
        assert_eq!(c.rate.backoff_base, Duration::from_millis(2000));
        assert_eq!(c.rate.backoff_cap, Duration::from_millis(30_000));
        assert_eq!(c.refresh_interval, Duration::from_millis(90_000));
        assert_eq!(c.generate_timeout, Duration::from_millis(180_000));
    }
}
