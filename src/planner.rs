//! Execution Planner
//!
//! Turns an [`Analysis`] into an ordered, strategy-tagged [`ExecutionPlan`]:
//! one step per required capability that has a registered provider, sorted by
//! descending priority.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

use crate::analyzer::{Analysis, ComplexityLevel};
use crate::config::{Config, ExecutorConfig, PlannerConfig, ProviderOverride, RetryConfig};
use crate::recovery::ErrorCategory;
use crate::registry::CapabilityRegistry;

/// How the steps of a plan are run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// All steps concurrently; failures are independent
    Parallel,
    /// One at a time, each seeing earlier results
    Sequential,
    /// Independent steps concurrently, then dependent steps in order
    Hybrid,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Parallel => "parallel",
            Self::Sequential => "sequential",
            Self::Hybrid => "hybrid",
        }
    }
}

/// Retry policy configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Add jitter to prevent thundering herd
    pub add_jitter: bool,
    /// Jitter factor (0.0 - 1.0)
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_delay: Duration::from_millis(config.initial_backoff_ms),
            max_delay: Duration::from_millis(config.max_backoff_ms),
            backoff_multiplier: config.backoff_multiplier,
            add_jitter: config.jitter,
            jitter_factor: 0.2,
        }
    }

    /// No retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (0 = first retry)
    pub fn delay_for_attempt(&self, retry: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(retry as i32);
        let capped = base.min(self.max_delay.as_secs_f64());

        let delay = if self.add_jitter {
            let jitter = capped * self.jitter_factor * rand::thread_rng().gen_range(-1.0..=1.0);
            (capped + jitter).max(0.0)
        } else {
            capped
        };

        Duration::from_secs_f64(delay)
    }
}

/// One provider invocation within a plan
#[derive(Debug, Clone)]
pub struct PlanStep {
    pub capability: String,
    pub provider: String,
    pub priority: i32,
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub critical: bool,
    /// Planned capabilities this step wants to see first
    pub depends_on: Vec<String>,
    pub breaker_tags: Vec<ErrorCategory>,
    pub cacheable: bool,
    pub cache_ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub strategy: Strategy,
    pub steps: Vec<PlanStep>,
    /// Required capabilities with no registered provider
    pub skipped: Vec<String>,
}

impl ExecutionPlan {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn capabilities(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.capability.clone()).collect()
    }

    /// Split into independent steps and dependent steps in resolution order.
    ///
    /// A dependent step is placed once everything it depends on is placed;
    /// cycles fall back to priority order.
    pub fn partition(&self) -> (Vec<&PlanStep>, Vec<&PlanStep>) {
        let (independent, mut pending): (Vec<&PlanStep>, Vec<&PlanStep>) =
            self.steps.iter().partition(|s| s.depends_on.is_empty());

        let mut resolved: Vec<&str> = independent.iter().map(|s| s.capability.as_str()).collect();
        let mut ordered = Vec::with_capacity(pending.len());
        while !pending.is_empty() {
            let ready = pending
                .iter()
                .position(|s| s.depends_on.iter().all(|d| resolved.contains(&d.as_str())))
                .unwrap_or(0);
            let step = pending.remove(ready);
            resolved.push(step.capability.as_str());
            ordered.push(step);
        }
        (independent, ordered)
    }
}

/// Builds execution plans from analyzer output
pub struct ExecutionPlanner {
    executor: ExecutorConfig,
    planner: PlannerConfig,
    overrides: HashMap<String, ProviderOverride>,
}

impl ExecutionPlanner {
    pub fn new(config: &Config) -> Self {
        Self {
            executor: config.executor.clone(),
            planner: config.planner.clone(),
            overrides: config.providers.clone(),
        }
    }

    pub fn build(&self, analysis: &Analysis, registry: &CapabilityRegistry) -> ExecutionPlan {
        let default_retry = RetryPolicy::from_config(&self.executor.retry);
        let mut steps = Vec::new();
        let mut skipped = Vec::new();

        for capability in &analysis.required_capabilities {
            let Some(handle) = registry.provider_for(capability) else {
                warn!("No provider registered for capability '{}', skipping", capability);
                skipped.push(capability.clone());
                continue;
            };
            let provider = &handle.provider;
            let overrides = self.overrides.get(&handle.name);

            let timeout = overrides
                .and_then(|o| o.timeout_ms)
                .map(Duration::from_millis)
                .or_else(|| provider.timeout())
                .unwrap_or_else(|| self.executor.default_timeout());
            let cache_ttl = overrides
                .and_then(|o| o.cache_ttl_secs)
                .map(Duration::from_secs)
                .or_else(|| provider.cache_ttl())
                .unwrap_or_else(|| self.executor.provider_cache_ttl());

            steps.push(PlanStep {
                capability: capability.clone(),
                provider: handle.name.clone(),
                priority: overrides.and_then(|o| o.priority).unwrap_or(handle.priority),
                timeout,
                retry: default_retry.clone(),
                critical: overrides.and_then(|o| o.critical).unwrap_or_else(|| provider.critical()),
                depends_on: provider.depends_on(),
                breaker_tags: provider.breaker_tags(),
                cacheable: provider.cacheable(),
                cache_ttl,
            });
        }

        // Only dependencies on planned capabilities matter
        let planned: Vec<String> = steps.iter().map(|s| s.capability.clone()).collect();
        for step in &mut steps {
            let own = step.capability.clone();
            step.depends_on.retain(|d| *d != own && planned.contains(d));
        }

        steps.sort_by(|a, b| b.priority.cmp(&a.priority));

        let has_dependencies = steps.iter().any(|s| !s.depends_on.is_empty());
        let strategy = match analysis.complexity {
            ComplexityLevel::High => Strategy::Sequential,
            _ if self.planner.hybrid_on_dependencies && has_dependencies => Strategy::Hybrid,
            _ => Strategy::Parallel,
        };

        debug!(
            "Planned {} steps ({}) for intent {}, skipped {}",
            steps.len(),
            strategy.as_str(),
            analysis.intent.as_str(),
            skipped.len()
        );

        ExecutionPlan {
            strategy,
            steps,
            skipped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::IntentAnalyzer;
    use crate::conversation::ConversationState;
    use crate::error::ProviderError;
    use crate::registry::{Capability, ProviderContext};
    use crate::types::{DeclaredContext, Request};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::Arc;

    struct Stub {
        name: &'static str,
        capability: &'static str,
        priority: i32,
        timeout: Option<Duration>,
        depends_on: Vec<String>,
    }

    #[async_trait]
    impl Capability for Stub {
        fn name(&self) -> &str {
            self.name
        }

        fn capabilities(&self) -> Vec<String> {
            vec![self.capability.to_string()]
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        fn timeout(&self) -> Option<Duration> {
            self.timeout
        }

        fn depends_on(&self) -> Vec<String> {
            self.depends_on.clone()
        }

        async fn invoke(&self, _ctx: &ProviderContext) -> Result<Value, ProviderError> {
            Ok(Value::Null)
        }
    }

    fn stub(name: &'static str, capability: &'static str, priority: i32) -> Stub {
        Stub {
            name,
            capability,
            priority,
            timeout: None,
            depends_on: Vec::new(),
        }
    }

    fn analysis(context: DeclaredContext) -> Analysis {
        let request = Request::new("u1", "c1", "plan a trip").with_context(context);
        IntentAnalyzer::default().analyze(&request, &ConversationState::new("c1", "u1", 20))
    }

    fn full_registry() -> CapabilityRegistry {
        let registry = CapabilityRegistry::new();
        registry.register(Arc::new(stub("flights", "flight_search", 8))).unwrap();
        registry
            .register(Arc::new(Stub {
                timeout: Some(Duration::from_secs(3)),
                ..stub("hotels", "hotel_search", 6)
            }))
            .unwrap();
        registry.register(Arc::new(stub("itinerary", "itinerary_generator", 4))).unwrap();
        registry.register(Arc::new(stub("chat", "conversation", -10))).unwrap();
        registry
    }

    #[test]
    fn test_retry_backoff() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(10));
    }

    #[test]
    fn test_retry_jitter_bounded() {
        let policy = RetryPolicy {
            add_jitter: true,
            ..RetryPolicy::default()
        };
        for _ in 0..50 {
            let delay = policy.delay_for_attempt(0);
            assert!(delay >= Duration::from_millis(800) && delay <= Duration::from_millis(1200));
        }
    }

    #[test]
    fn test_parallel_plan_skips_missing() {
        let planner = ExecutionPlanner::new(&Config::default());
        let plan = planner.build(
            &analysis(DeclaredContext {
                intent: Some(crate::analyzer::Intent::FullTrip),
                destinations: vec!["Tokyo".into()],
                ..Default::default()
            }),
            &full_registry(),
        );

        assert_eq!(plan.strategy, Strategy::Parallel);
        assert_eq!(
            plan.capabilities(),
            vec!["flight_search", "hotel_search", "itinerary_generator", "conversation"]
        );
        assert_eq!(plan.skipped, vec!["budget_analyzer"]);
        assert_eq!(plan.steps[1].timeout, Duration::from_secs(3));
        assert_eq!(plan.steps[0].timeout, Duration::from_secs(10));
        assert_eq!(plan.steps[0].retry.max_attempts, 3);
    }

    #[test]
    fn test_high_complexity_is_sequential() {
        let planner = ExecutionPlanner::new(&Config::default());
        let plan = planner.build(
            &analysis(DeclaredContext {
                intent: Some(crate::analyzer::Intent::FullTrip),
                destinations: vec!["Tokyo".into(), "Kyoto".into()],
                multi_city: true,
                travelers: Some(12),
                ..Default::default()
            }),
            &full_registry(),
        );
        assert_eq!(plan.strategy, Strategy::Sequential);
    }

    #[test]
    fn test_overrides_apply() {
        let mut config = Config::default();
        config.providers.insert(
            "chat".into(),
            ProviderOverride {
                timeout_ms: Some(250),
                priority: Some(100),
                critical: Some(true),
                ..Default::default()
            },
        );
        let plan = ExecutionPlanner::new(&config).build(
            &analysis(DeclaredContext {
                intent: Some(crate::analyzer::Intent::FlightSearch),
                ..Default::default()
            }),
            &full_registry(),
        );
        assert_eq!(plan.steps[0].provider, "chat");
        assert_eq!(plan.steps[0].timeout, Duration::from_millis(250));
        assert!(plan.steps[0].critical);
    }

    #[test]
    fn test_hybrid_partition() {
        let registry = full_registry();
        registry
            .register(Arc::new(Stub {
                depends_on: vec!["flight_search".into(), "hotel_search".into(), "weather".into()],
                ..stub("budget", "budget_analyzer", 9)
            }))
            .unwrap();

        let config = Config {
            planner: PlannerConfig {
                hybrid_on_dependencies: true,
            },
            ..Config::default()
        };
        let plan = ExecutionPlanner::new(&config).build(
            &analysis(DeclaredContext {
                intent: Some(crate::analyzer::Intent::FullTrip),
                ..Default::default()
            }),
            &registry,
        );
        assert_eq!(plan.strategy, Strategy::Hybrid);

        let (independent, dependent) = plan.partition();
        assert_eq!(independent.len(), 4);
        assert_eq!(dependent.len(), 1);
        assert_eq!(dependent[0].capability, "budget_analyzer");
        assert_eq!(dependent[0].depends_on, vec!["flight_search", "hotel_search"]);
    }
}
