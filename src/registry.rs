//! Capability Registry
//!
//! Providers implement [`Capability`] and are registered by name. The
//! registry resolves a capability to its best provider, wraps every invocation
//! with timing, and keeps rolling per-provider metrics for observability.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::analyzer::Analysis;
use crate::conversation::ConversationState;
use crate::error::ProviderError;
use crate::recovery::{classify, ErrorCategory};
use crate::types::{FailureKind, ProviderFailure, ProviderResult, Request};

/// Well-known capability names
pub mod capabilities {
    pub const FLIGHT_SEARCH: &str = "flight_search";
    pub const HOTEL_SEARCH: &str = "hotel_search";
    pub const ITINERARY_GENERATOR: &str = "itinerary_generator";
    pub const BUDGET_ANALYZER: &str = "budget_analyzer";
    pub const BOOKING_MANAGER: &str = "booking_manager";
    pub const CONVERSATION: &str = "conversation";
}

/// Everything a provider may read while serving one plan step
#[derive(Debug, Clone)]
pub struct ProviderContext {
    pub request: Arc<Request>,
    pub analysis: Arc<Analysis>,
    pub conversation: Arc<ConversationState>,
    /// Capability this invocation serves
    pub capability: String,
    /// Results of earlier steps (sequential and hybrid plans)
    pub prior_results: Vec<ProviderResult>,
    pub attempt: u32,
    /// Cancelled when the step times out or the orchestrator shuts down
    pub cancel: CancellationToken,
}

impl ProviderContext {
    /// Output of an earlier successful step, if any
    pub fn prior_output(&self, capability: &str) -> Option<&Value> {
        self.prior_results
            .iter()
            .find(|r| r.success && r.capability == capability)
            .and_then(|r| r.output.as_ref())
    }
}

/// A pluggable travel-domain provider
#[async_trait]
pub trait Capability: Send + Sync {
    /// Unique provider name
    fn name(&self) -> &str;

    /// Capabilities this provider can serve
    fn capabilities(&self) -> Vec<String>;

    /// Higher runs first and wins capability resolution
    fn priority(&self) -> i32 {
        0
    }

    /// Per-step timeout; `None` uses the global default
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// A failed critical step aborts a sequential plan
    fn critical(&self) -> bool {
        false
    }

    /// Capabilities whose results this provider wants to see first
    fn depends_on(&self) -> Vec<String> {
        Vec::new()
    }

    /// Breaker categories that short-circuit this provider
    fn breaker_tags(&self) -> Vec<ErrorCategory> {
        vec![
            ErrorCategory::Network,
            ErrorCategory::UpstreamServer,
            ErrorCategory::RateLimit,
        ]
    }

    /// TTL of cached results; `None` uses the executor default
    fn cache_ttl(&self) -> Option<Duration> {
        None
    }

    /// Whether results may be served from the provider cache
    fn cacheable(&self) -> bool {
        true
    }

    async fn invoke(&self, ctx: &ProviderContext) -> Result<Value, ProviderError>;
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Invalid provider '{name}': {reason}")]
    InvalidProvider { name: String, reason: String },
}

/// Outcome of a successful `register`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Added,
    /// A provider with the same name existed and was overwritten
    Replaced,
}

/// Rolling per-provider metrics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderMetrics {
    pub execution_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub timeout_count: u64,
    pub average_duration_ms: f64,
    pub last_error: Option<String>,
}

impl ProviderMetrics {
    fn observe(&mut self, duration_ms: u64) {
        self.execution_count += 1;
        let n = self.execution_count as f64;
        self.average_duration_ms += (duration_ms as f64 - self.average_duration_ms) / n;
    }

    pub fn success_rate(&self) -> f64 {
        if self.execution_count == 0 {
            return 0.0;
        }
        self.success_count as f64 / self.execution_count as f64
    }
}

/// Provider metadata for observability
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderInfo {
    pub name: String,
    pub capabilities: Vec<String>,
    pub priority: i32,
    pub critical: bool,
    pub timeout_ms: Option<u64>,
    pub metrics: ProviderMetrics,
}

/// A resolved provider
#[derive(Clone)]
pub struct ProviderHandle {
    pub name: String,
    pub priority: i32,
    pub provider: Arc<dyn Capability>,
}

struct Entry {
    provider: Arc<dyn Capability>,
    capabilities: Vec<String>,
    priority: i32,
    seq: u64,
    metrics: Arc<Mutex<ProviderMetrics>>,
}

/// Registry of capability providers
#[derive(Default)]
pub struct CapabilityRegistry {
    entries: RwLock<HashMap<String, Entry>>,
    next_seq: Mutex<u64>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider under its own name, capabilities and priority
    pub fn register(&self, provider: Arc<dyn Capability>) -> Result<Registration, RegistryError> {
        let name = provider.name().to_string();
        let capabilities = provider.capabilities();
        let priority = provider.priority();
        self.register_as(&name, provider, capabilities, priority)
    }

    /// Register a provider with explicit metadata
    pub fn register_as(
        &self,
        name: &str,
        provider: Arc<dyn Capability>,
        capabilities: Vec<String>,
        priority: i32,
    ) -> Result<Registration, RegistryError> {
        let invalid = |reason: &str| RegistryError::InvalidProvider {
            name: name.to_string(),
            reason: reason.to_string(),
        };
        if name.trim().is_empty() {
            return Err(invalid("name is blank"));
        }
        if capabilities.is_empty() || capabilities.iter().any(|c| c.trim().is_empty()) {
            return Err(invalid("no capabilities declared"));
        }
        if provider.timeout() == Some(Duration::ZERO) {
            return Err(invalid("timeout must be greater than zero"));
        }

        let seq = {
            let mut next = self.next_seq.lock();
            *next += 1;
            *next
        };
        let entry = Entry {
            provider,
            capabilities: capabilities.clone(),
            priority,
            seq,
            metrics: Arc::new(Mutex::new(ProviderMetrics::default())),
        };

        let replaced = self.entries.write().insert(name.to_string(), entry).is_some();
        if replaced {
            warn!("DuplicateNameWarning: provider '{}' replaced", name);
            Ok(Registration::Replaced)
        } else {
            info!(
                "Registered provider: {} (capabilities: {}, priority {})",
                name,
                capabilities.join(", "),
                priority
            );
            Ok(Registration::Added)
        }
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.entries.write().remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Capability>> {
        self.entries.read().get(name).map(|e| e.provider.clone())
    }

    /// Highest-priority provider serving `capability`; earliest registration wins ties
    pub fn provider_for(&self, capability: &str) -> Option<ProviderHandle> {
        let entries = self.entries.read();
        entries
            .iter()
            .filter(|(_, e)| e.capabilities.iter().any(|c| c == capability))
            .max_by(|(_, a), (_, b)| a.priority.cmp(&b.priority).then(b.seq.cmp(&a.seq)))
            .map(|(name, e)| ProviderHandle {
                name: name.clone(),
                priority: e.priority,
                provider: e.provider.clone(),
            })
    }

    /// Invoke a provider by name, timing the call and updating its metrics
    pub async fn execute(&self, name: &str, ctx: &ProviderContext) -> ProviderResult {
        let found = {
            let entries = self.entries.read();
            entries
                .get(name)
                .map(|e| (e.provider.clone(), e.metrics.clone()))
        };
        let Some((provider, metrics)) = found else {
            return ProviderResult::failure(
                &ctx.capability,
                name,
                ProviderFailure {
                    kind: FailureKind::Error,
                    category: ErrorCategory::Unknown,
                    message: format!("Unknown provider: {}", name),
                },
                0,
            );
        };

        let start = tokio::time::Instant::now();
        let outcome = provider.invoke(ctx).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        let mut metrics = metrics.lock();
        metrics.observe(duration_ms);
        match outcome {
            Ok(output) => {
                metrics.success_count += 1;
                debug!("Provider {} succeeded in {}ms", name, duration_ms);
                ProviderResult::success(&ctx.capability, name, output, duration_ms)
            }
            Err(e) => {
                metrics.failure_count += 1;
                metrics.last_error = Some(e.to_string());
                debug!("Provider {} failed in {}ms: {}", name, duration_ms, e);
                ProviderResult::failure(
                    &ctx.capability,
                    name,
                    ProviderFailure {
                        kind: FailureKind::Error,
                        category: classify(&e),
                        message: e.to_string(),
                    },
                    duration_ms,
                )
            }
        }
    }

    /// Account for an invocation abandoned by its timeout
    pub fn record_timeout(&self, name: &str, duration_ms: u64) {
        if let Some(entry) = self.entries.read().get(name) {
            let mut metrics = entry.metrics.lock();
            metrics.observe(duration_ms);
            metrics.failure_count += 1;
            metrics.timeout_count += 1;
            metrics.last_error = Some(format!("timed out after {}ms", duration_ms));
        }
    }

    pub fn metrics(&self, name: &str) -> Option<ProviderMetrics> {
        self.entries.read().get(name).map(|e| e.metrics.lock().clone())
    }

    /// Provider metadata, highest priority first
    pub fn list(&self) -> Vec<ProviderInfo> {
        let entries = self.entries.read();
        let mut infos: Vec<(u64, ProviderInfo)> = entries
            .iter()
            .map(|(name, e)| {
                (
                    e.seq,
                    ProviderInfo {
                        name: name.clone(),
                        capabilities: e.capabilities.clone(),
                        priority: e.priority,
                        critical: e.provider.critical(),
                        timeout_ms: e.provider.timeout().map(|t| t.as_millis() as u64),
                        metrics: e.metrics.lock().clone(),
                    },
                )
            })
            .collect();
        infos.sort_by(|(sa, a), (sb, b)| b.priority.cmp(&a.priority).then(sa.cmp(sb)));
        infos.into_iter().map(|(_, info)| info).collect()
    }

    /// Success rate across every provider
    pub fn success_rate(&self) -> f64 {
        let entries = self.entries.read();
        let (ok, total) = entries.values().fold((0u64, 0u64), |(ok, total), e| {
            let m = e.metrics.lock();
            (ok + m.success_count, total + m.execution_count)
        });
        if total == 0 {
            0.0
        } else {
            ok as f64 / total as f64
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
