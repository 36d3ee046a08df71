//! Failure Policy
//!
//! Error classification, per-category circuit breakers and the one-shot
//! degraded fallback used when a whole orchestration fails.
//!
//! Every failed provider step is classified into an [`ErrorCategory`] and
//! recorded. Each category keeps a sliding window of recent failure
//! timestamps; when `threshold` failures land inside `window`, the breaker for
//! that category opens and providers tagged with it are short-circuited until
//! the cool-down passes.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::cache::AdaptiveCache;
use crate::config::BreakerConfig;
use crate::error::{ErrorBody, OrchestratorError, ProviderError};
use crate::types::{Locale, OrchestrationResult, ResultMetadata};

/// Classification of errors for breaker bookkeeping and retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Connection, DNS or timeout trouble
    Network,
    /// Upstream rejected the call (4xx)
    UpstreamClient,
    /// Upstream broke (5xx)
    UpstreamServer,
    /// Persistence layer failure
    Storage,
    /// Bad input, retry won't help
    Validation,
    /// Upstream asked us to slow down
    RateLimit,
    Unknown,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 7] = [
        Self::Network,
        Self::UpstreamClient,
        Self::UpstreamServer,
        Self::Storage,
        Self::Validation,
        Self::RateLimit,
        Self::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::UpstreamClient => "upstream_client",
            Self::UpstreamServer => "upstream_server",
            Self::Storage => "storage",
            Self::Validation => "validation",
            Self::RateLimit => "rate_limit",
            Self::Unknown => "unknown",
        }
    }

    /// Whether the pipeline can continue around this failure
    pub fn recoverable(&self) -> bool {
        !matches!(self, Self::Validation)
    }

    /// Whether repeating the same call may succeed
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Self::Network | Self::UpstreamServer | Self::RateLimit | Self::Unknown
        )
    }

    /// Classify an opaque error from its message
    pub fn from_message(error: &str) -> Self {
        let lower = error.to_lowercase();

        if lower.contains("rate limit") || lower.contains("too many requests") || lower.contains("429") {
            Self::RateLimit
        } else if lower.contains("timeout")
            || lower.contains("timed out")
            || lower.contains("connection")
            || lower.contains("dns")
        {
            Self::Network
        } else if lower.contains("database") || lower.contains("disk") || lower.contains("storage") {
            Self::Storage
        } else if lower.contains("invalid") || lower.contains("validation") || lower.contains("400") {
            Self::Validation
        } else if lower.contains("unauthorized")
            || lower.contains("forbidden")
            || lower.contains("not found")
            || lower.contains("401")
            || lower.contains("403")
            || lower.contains("404")
        {
            Self::UpstreamClient
        } else if lower.contains("internal")
            || lower.contains("unavailable")
            || lower.contains("500")
            || lower.contains("502")
            || lower.contains("503")
        {
            Self::UpstreamServer
        } else {
            Self::Unknown
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a provider error
pub fn classify(error: &ProviderError) -> ErrorCategory {
    match error {
        ProviderError::Network(_) => ErrorCategory::Network,
        ProviderError::Upstream { status, .. } if *status == 429 => ErrorCategory::RateLimit,
        ProviderError::Upstream { status, .. } if (400..500).contains(status) => {
            ErrorCategory::UpstreamClient
        }
        ProviderError::Upstream { .. } => ErrorCategory::UpstreamServer,
        ProviderError::Storage(_) => ErrorCategory::Storage,
        ProviderError::Validation(_) => ErrorCategory::Validation,
        ProviderError::RateLimited(_) => ErrorCategory::RateLimit,
        ProviderError::Cancelled => ErrorCategory::Network,
        ProviderError::Other(message) => ErrorCategory::from_message(message),
    }
}

/// Breaker state for one category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
}

#[derive(Debug, Default)]
struct CategoryBreaker {
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    trips: u64,
}

impl CategoryBreaker {
    fn prune(&mut self, now: Instant, config: &BreakerConfig) {
        let window = config.window();
        while let Some(oldest) = self.failures.front() {
            if now.duration_since(*oldest) > window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }

    /// Reset to closed once the cool-down has passed
    fn refresh(&mut self, now: Instant, config: &BreakerConfig) -> bool {
        match self.opened_at {
            Some(opened) if now.duration_since(opened) >= config.cooldown() => {
                self.opened_at = None;
                self.failures.clear();
                true
            }
            _ => false,
        }
    }
}

/// Point-in-time view of the policy
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailurePolicyStats {
    pub open_categories: Vec<ErrorCategory>,
    pub recorded_failures: u64,
    pub short_circuits: u64,
    pub trips: u64,
    pub recoveries: u64,
    pub fallbacks_served: u64,
}

/// Circuit breakers plus the degraded-fallback pass
pub struct FailurePolicy {
    config: BreakerConfig,
    breakers: Mutex<HashMap<ErrorCategory, CategoryBreaker>>,
    fallback: Arc<AdaptiveCache<OrchestrationResult>>,
    recorded: AtomicU64,
    short_circuits: AtomicU64,
    recoveries: AtomicU64,
    fallbacks_served: AtomicU64,
}

impl FailurePolicy {
    pub fn new(config: BreakerConfig, fallback: Arc<AdaptiveCache<OrchestrationResult>>) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
            fallback,
            recorded: AtomicU64::new(0),
            short_circuits: AtomicU64::new(0),
            recoveries: AtomicU64::new(0),
            fallbacks_served: AtomicU64::new(0),
        }
    }

    /// Record a failure; returns true when this failure opened the breaker
    pub fn record(&self, category: ErrorCategory) -> bool {
        self.recorded.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        let threshold = self.config.threshold.max(1);

        let mut breakers = self.breakers.lock();
        let breaker = breakers.entry(category).or_default();
        breaker.refresh(now, &self.config);
        if breaker.opened_at.is_some() {
            return false;
        }

        breaker.prune(now, &self.config);
        breaker.failures.push_back(now);
        while breaker.failures.len() > threshold {
            breaker.failures.pop_front();
        }

        if breaker.failures.len() >= threshold {
            breaker.opened_at = Some(now);
            breaker.trips += 1;
            warn!(
                "Circuit breaker '{}' opened after {} failures within {:?}",
                category,
                breaker.failures.len(),
                self.config.window()
            );
            return true;
        }
        false
    }

    pub fn state(&self, category: ErrorCategory) -> BreakerState {
        let now = Instant::now();
        let mut breakers = self.breakers.lock();
        let Some(breaker) = breakers.get_mut(&category) else {
            return BreakerState::Closed;
        };
        if breaker.refresh(now, &self.config) {
            info!("Circuit breaker '{}' reset after cool-down", category);
        }
        if breaker.opened_at.is_some() {
            BreakerState::Open
        } else {
            BreakerState::Closed
        }
    }

    pub fn is_open(&self, category: ErrorCategory) -> bool {
        self.state(category) == BreakerState::Open
    }

    /// First open category among `tags`, if any. Counts a short-circuit.
    pub fn allow(&self, tags: &[ErrorCategory]) -> Result<(), ErrorCategory> {
        match tags.iter().copied().find(|tag| self.is_open(*tag)) {
            Some(open) => {
                self.short_circuits.fetch_add(1, Ordering::Relaxed);
                Err(open)
            }
            None => Ok(()),
        }
    }

    /// Force every breaker closed
    pub fn reset(&self) {
        self.breakers.lock().clear();
        info!("Circuit breakers reset");
    }

    /// Keep a long-lived copy of a good result for degraded replay
    pub async fn remember(&self, key: &str, result: &OrchestrationResult) {
        self.fallback.set_default(key, result.clone()).await;
    }

    /// One fallback pass: a stale cached result, else a localized error
    pub async fn recover(
        &self,
        fallback_key: &str,
        error: OrchestratorError,
        locale: Locale,
        metadata: ResultMetadata,
    ) -> OrchestrationResult {
        self.recoveries.fetch_add(1, Ordering::Relaxed);

        if error.is_retryable() {
            if let Some(stale) = self.fallback.get(fallback_key).await {
                self.fallbacks_served.fetch_add(1, Ordering::Relaxed);
                info!(
                    "Serving degraded fallback for {} after: {}",
                    metadata.request_id, error
                );
                return OrchestrationResult {
                    success: true,
                    data: stale.data,
                    error: None,
                    metadata: ResultMetadata {
                        degraded: true,
                        cache_hit: true,
                        ..metadata
                    },
                };
            }
        }

        warn!("Request {} failed: {}", metadata.request_id, error);
        OrchestrationResult {
            success: false,
            data: None,
            error: Some(ErrorBody::from_error(&error, locale)),
            metadata: ResultMetadata {
                degraded: true,
                ..metadata
            },
        }
    }

    pub fn stats(&self) -> FailurePolicyStats {
        let open_categories = ErrorCategory::ALL
            .iter()
            .copied()
            .filter(|c| self.is_open(*c))
            .collect();
        let trips = self.breakers.lock().values().map(|b| b.trips).sum();
        FailurePolicyStats {
            open_categories,
            recorded_failures: self.recorded.load(Ordering::Relaxed),
            short_circuits: self.short_circuits.load(Ordering::Relaxed),
            trips,
            recoveries: self.recoveries.load(Ordering::Relaxed),
            fallbacks_served: self.fallbacks_served.load(Ordering::Relaxed),
        }
    }
}
