//! Configuration management
//!
//! Defaults are compiled in, optionally overlaid by a TOML file named by
//! `TRAVELBOT_CONFIG`, then by individual environment variables.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Adaptive cache limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Approximate byte budget before LRU eviction kicks in
    pub max_size_bytes: usize,
    pub max_entries: usize,
    pub default_ttl_secs: u64,
    pub sweep_interval_secs: u64,
    /// Share of entries evicted per pressure batch
    pub eviction_fraction: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size_bytes: 64 * 1024 * 1024, // 64MB
            max_entries: 100_000,
            default_ttl_secs: 300,
            sweep_interval_secs: 60,
            eviction_fraction: 0.2,
        }
    }
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// Durable store behind the caches
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    #[default]
    None,
    Memory,
    Sqlite {
        path: PathBuf,
    },
    Redis {
        url: String,
    },
}

/// Idle windows for the two conversation stores
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Web sessions
    pub web_idle_secs: u64,
    /// Bot chat turns
    pub chat_idle_secs: u64,
    pub max_history: usize,
    pub max_sessions: u64,
    pub sweep_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            web_idle_secs: 24 * 60 * 60,
            chat_idle_secs: 30 * 60,
            max_history: 20,
            max_sessions: 100_000,
            sweep_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorConfig {
    pub max_concurrent: usize,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self { max_concurrent: 50 }
    }
}

/// Default retry policy attached to every plan step
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub max_backoff_ms: u64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 1000,
            backoff_multiplier: 2.0,
            max_backoff_ms: 10_000,
            jitter: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Step timeout when neither the provider nor an override sets one
    pub default_timeout_ms: u64,
    /// Provider result TTL when the provider does not set one
    pub provider_cache_ttl_secs: u64,
    pub retry: RetryConfig,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 10_000,
            provider_cache_ttl_secs: 300,
            retry: RetryConfig::default(),
        }
    }
}

impl ExecutorConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn provider_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.provider_cache_ttl_secs)
    }
}

/// Per-category circuit breaker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub window_secs: u64,
    pub threshold: usize,
    pub cooldown_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            window_secs: 60,
            threshold: 10,
            cooldown_secs: 300,
        }
    }
}

impl BreakerConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

/// Randomized intent selection for learning experiments
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExplorationConfig {
    /// Probability of exploring instead of taking the top candidate
    pub rate: f64,
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// Confidence assigned to keyword matches
    pub keyword_confidence: f64,
    /// Confidence assigned to an intent declared by the caller
    pub declared_confidence: f64,
    pub exploration: Option<ExplorationConfig>,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            keyword_confidence: 0.75,
            declared_confidence: 0.8,
            exploration: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// Use the hybrid strategy when a planned step depends on another
    pub hybrid_on_dependencies: bool,
}

/// Operator overrides for a single provider
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderOverride {
    pub timeout_ms: Option<u64>,
    pub cache_ttl_secs: Option<u64>,
    pub priority: Option<i32>,
    pub critical: Option<bool>,
}

/// Orchestrator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Provider-level result cache
    pub cache: CacheConfig,
    pub backend: BackendConfig,
    pub sessions: SessionConfig,
    pub governor: GovernorConfig,
    pub executor: ExecutorConfig,
    pub breaker: BreakerConfig,
    pub analyzer: AnalyzerConfig,
    pub planner: PlannerConfig,
    pub providers: HashMap<String, ProviderOverride>,
    /// TTL of whole synthesized results (request replay)
    pub result_ttl_secs: u64,
    /// TTL of the stale copy used for degraded fallback
    pub fallback_ttl_secs: u64,
    pub max_message_chars: usize,
    pub max_travelers: u32,
    pub metrics_channel_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            backend: BackendConfig::default(),
            sessions: SessionConfig::default(),
            governor: GovernorConfig::default(),
            executor: ExecutorConfig::default(),
            breaker: BreakerConfig::default(),
            analyzer: AnalyzerConfig::default(),
            planner: PlannerConfig::default(),
            providers: HashMap::new(),
            result_ttl_secs: 300,
            fallback_ttl_secs: 24 * 60 * 60,
            max_message_chars: 4000,
            max_travelers: 50,
            metrics_channel_capacity: 1024,
        }
    }
}

impl Config {
    /// Load configuration from `TRAVELBOT_CONFIG` (if set) and environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("TRAVELBOT_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };

        if let Some(max) = env_parse::<usize>("TRAVELBOT_MAX_CONCURRENT") {
            config.governor.max_concurrent = max;
        }

        if let Ok(v) = std::env::var("TRAVELBOT_CACHE_ENABLED") {
            config.cache.enabled = v == "true" || v == "1";
        }

        if let Some(ttl) = env_parse::<u64>("TRAVELBOT_CACHE_TTL") {
            config.cache.default_ttl_secs = ttl;
            config.executor.provider_cache_ttl_secs = ttl;
        }

        if let Some(ttl) = env_parse::<u64>("TRAVELBOT_RESULT_TTL") {
            config.result_ttl_secs = ttl;
        }

        if let Some(ms) = env_parse::<u64>("TRAVELBOT_PROVIDER_TIMEOUT_MS") {
            config.executor.default_timeout_ms = ms;
        }

        if let Ok(url) = std::env::var("TRAVELBOT_REDIS_URL").or_else(|_| std::env::var("REDIS_URL")) {
            config.backend = BackendConfig::Redis { url };
        } else if let Ok(path) = std::env::var("TRAVELBOT_CACHE_DB") {
            let path = if path.is_empty() {
                default_cache_db_path()
            } else {
                PathBuf::from(path)
            };
            config.backend = BackendConfig::Sqlite { path };
        }

        config.validate()?;
        Ok(config)
    }

    /// Load a TOML config file; missing keys take defaults
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.governor.max_concurrent == 0 {
            return Err(ConfigError::Invalid("governor.max_concurrent must be > 0".into()));
        }
        if self.breaker.threshold == 0 {
            return Err(ConfigError::Invalid("breaker.threshold must be > 0".into()));
        }
        if !(self.cache.eviction_fraction > 0.0 && self.cache.eviction_fraction <= 1.0) {
            return Err(ConfigError::Invalid("cache.eviction_fraction must be in (0, 1]".into()));
        }
        if self.executor.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("executor.retry.max_attempts must be >= 1".into()));
        }
        if let Some(exploration) = &self.analyzer.exploration {
            if !(0.0..=1.0).contains(&exploration.rate) {
                return Err(ConfigError::Invalid("analyzer.exploration.rate must be in [0, 1]".into()));
            }
        }
        Ok(())
    }

    pub fn result_ttl(&self) -> Duration {
        Duration::from_secs(self.result_ttl_secs)
    }

    pub fn fallback_ttl(&self) -> Duration {
        Duration::from_secs(self.fallback_ttl_secs)
    }

    pub fn provider_override(&self, name: &str) -> Option<&ProviderOverride> {
        self.providers.get(name)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn default_cache_db_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("travelbot")
        .join("cache.db")
}
