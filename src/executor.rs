//! Capability Executor
//!
//! Runs an [`ExecutionPlan`] against the registry.
//!
//! Every step goes through the same pipeline:
//! provider cache → circuit breakers → timed invocation with retries.
//! A failed step always becomes a failed [`ProviderResult`]; only a critical
//! failure in an ordered phase stops the plan, and it is reported once in
//! [`ExecutionOutcome::critical_failure`].

use futures_util::future::join_all;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::analyzer::Analysis;
use crate::cache::AdaptiveCache;
use crate::conversation::ConversationState;
use crate::error::{OrchestratorError, ProviderError};
use crate::planner::{ExecutionPlan, PlanStep, Strategy};
use crate::recovery::{ErrorCategory, FailurePolicy};
use crate::registry::{CapabilityRegistry, ProviderContext};
use crate::types::{FailureKind, ProviderFailure, ProviderResult, Request};

/// Shared inputs for one plan run
#[derive(Debug, Clone)]
pub struct ExecutionInput {
    pub request: Arc<Request>,
    pub analysis: Arc<Analysis>,
    pub conversation: Arc<ConversationState>,
}

/// Result of running a whole plan
#[derive(Debug, Clone, Default)]
pub struct ExecutionOutcome {
    /// In completion order for parallel phases, plan order otherwise
    pub results: Vec<ProviderResult>,
    pub cache_hits: u32,
    /// Provider calls actually made, retries included
    pub invocations: u32,
    /// The failed critical step that stopped the plan
    pub critical_failure: Option<OrchestratorError>,
    /// Steps never run because of the critical failure
    pub aborted: Vec<String>,
}

impl ExecutionOutcome {
    pub fn successes(&self) -> impl Iterator<Item = &ProviderResult> {
        self.results.iter().filter(|r| r.success)
    }

    pub fn any_success(&self) -> bool {
        self.results.iter().any(|r| r.success)
    }

    fn push(&mut self, run: StepRun) {
        if run.cache_hit {
            self.cache_hits += 1;
        }
        self.invocations += run.invocations;
        self.results.push(run.result);
    }
}

struct StepRun {
    result: ProviderResult,
    cache_hit: bool,
    invocations: u32,
}

/// Executes plans with timeouts, retries, breakers and result caching
pub struct CapabilityExecutor {
    registry: Arc<CapabilityRegistry>,
    policy: Arc<FailurePolicy>,
    cache: Arc<AdaptiveCache<ProviderResult>>,
    shutdown: CancellationToken,
    timeouts: AtomicU64,
}

impl CapabilityExecutor {
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        policy: Arc<FailurePolicy>,
        cache: Arc<AdaptiveCache<ProviderResult>>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            registry,
            policy,
            cache,
            shutdown,
            timeouts: AtomicU64::new(0),
        }
    }

    pub fn cache(&self) -> &Arc<AdaptiveCache<ProviderResult>> {
        &self.cache
    }

    pub fn timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }

    pub async fn execute(&self, plan: &ExecutionPlan, input: &ExecutionInput) -> ExecutionOutcome {
        let mut outcome = ExecutionOutcome::default();
        debug!(
            "Executing {} steps for {} ({})",
            plan.len(),
            input.request.request_id,
            plan.strategy.as_str()
        );

        match plan.strategy {
            Strategy::Parallel => {
                let steps: Vec<&PlanStep> = plan.steps.iter().collect();
                for run in self.run_parallel(&steps, input, &[]).await {
                    outcome.push(run);
                }
            }
            Strategy::Sequential => {
                let steps: Vec<&PlanStep> = plan.steps.iter().collect();
                self.run_sequential(&steps, input, &mut outcome).await;
            }
            Strategy::Hybrid => {
                let (independent, dependent) = plan.partition();
                for run in self.run_parallel(&independent, input, &[]).await {
                    outcome.push(run);
                }

                let critical = independent.iter().find_map(|step| {
                    outcome
                        .results
                        .iter()
                        .find(|r| !r.success && r.capability == step.capability && step.critical)
                        .map(|r| critical_error(step, r))
                });
                match critical {
                    Some(error) => {
                        warn!("Critical step failed, skipping {} dependent steps", dependent.len());
                        outcome.critical_failure = Some(error);
                        outcome.aborted = dependent.iter().map(|s| s.capability.clone()).collect();
                    }
                    None => self.run_sequential(&dependent, input, &mut outcome).await,
                }
            }
        }

        outcome
    }

    async fn run_parallel(
        &self,
        steps: &[&PlanStep],
        input: &ExecutionInput,
        prior: &[ProviderResult],
    ) -> Vec<StepRun> {
        join_all(steps.iter().map(|step| self.run_step(step, input, prior.to_vec()))).await
    }

    async fn run_sequential(
        &self,
        steps: &[&PlanStep],
        input: &ExecutionInput,
        outcome: &mut ExecutionOutcome,
    ) {
        for (i, step) in steps.iter().enumerate() {
            let run = self.run_step(step, input, outcome.results.clone()).await;
            let failed = !run.result.success;
            let error = failed.then(|| critical_error(step, &run.result));
            outcome.push(run);

            if failed && step.critical {
                outcome.critical_failure = error;
                outcome.aborted = steps[i + 1..].iter().map(|s| s.capability.clone()).collect();
                warn!(
                    "Critical step '{}' failed, aborting {} remaining steps",
                    step.capability,
                    outcome.aborted.len()
                );
                return;
            }
        }
    }

    async fn run_step(
        &self,
        step: &PlanStep,
        input: &ExecutionInput,
        prior: Vec<ProviderResult>,
    ) -> StepRun {
        let cache_key = step
            .cacheable
            .then(|| provider_cache_key(&step.capability, &input.analysis));

        if let Some(key) = &cache_key {
            if let Some(mut cached) = self.cache.get(key).await {
                cached.from_cache = true;
                cached.duration_ms = 0;
                return StepRun {
                    result: cached,
                    cache_hit: true,
                    invocations: 0,
                };
            }
        }

        if let Err(category) = self.policy.allow(&step.breaker_tags) {
            info!(
                "Circuit open for {}, short-circuiting {}",
                category, step.provider
            );
            return StepRun {
                result: ProviderResult::failure(
                    &step.capability,
                    &step.provider,
                    ProviderFailure {
                        kind: FailureKind::CircuitOpen,
                        category,
                        message: format!("circuit open for {}", category),
                    },
                    0,
                ),
                cache_hit: false,
                invocations: 0,
            };
        }

        let mut attempt = 0;
        let result = loop {
            attempt += 1;
            let cancel = self.shutdown.child_token();
            let ctx = ProviderContext {
                request: input.request.clone(),
                analysis: input.analysis.clone(),
                conversation: input.conversation.clone(),
                capability: step.capability.clone(),
                prior_results: prior.clone(),
                attempt,
                cancel: cancel.clone(),
            };

            let start = tokio::time::Instant::now();
            let mut result = match tokio::time::timeout(
                step.timeout,
                self.registry.execute(&step.provider, &ctx),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => {
                    // The invocation future is already dropped; tell spawned work too
                    cancel.cancel();
                    let elapsed = start.elapsed().as_millis() as u64;
                    self.timeouts.fetch_add(1, Ordering::Relaxed);
                    self.registry.record_timeout(&step.provider, elapsed);
                    warn!(
                        "Provider {} timed out after {:?} (attempt {})",
                        step.provider, step.timeout, attempt
                    );
                    ProviderResult::failure(
                        &step.capability,
                        &step.provider,
                        ProviderFailure {
                            kind: FailureKind::Timeout,
                            category: ErrorCategory::Network,
                            message: format!("timed out after {}ms", step.timeout.as_millis()),
                        },
                        elapsed,
                    )
                }
            };
            result.attempts = attempt;

            let Some(failure) = &result.error else {
                break result;
            };
            let category = failure.category;
            self.policy.record(category);

            let retry = category.retryable()
                && attempt < step.retry.max_attempts
                && !self.policy.is_open(category)
                && !self.shutdown.is_cancelled();
            if !retry {
                break result;
            }

            let delay = step.retry.delay_for_attempt(attempt - 1);
            debug!(
                "Retrying {} in {:?} after {} failure",
                step.provider, delay, category
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.cancelled() => break result,
            }
        };

        if result.success {
            if let Some(key) = &cache_key {
                self.cache.set(key, result.clone(), step.cache_ttl).await;
            }
        }

        StepRun {
            result,
            cache_hit: false,
            invocations: attempt,
        }
    }
}

/// Provider cache key over the context fields that shape a provider's answer
pub fn provider_cache_key(capability: &str, analysis: &Analysis) -> String {
    let query = &analysis.query;
    let destinations = query.destinations.join(",").to_lowercase();
    let origin = query.origin.clone().unwrap_or_default().to_lowercase();
    let dates = format!(
        "{}..{}",
        query.start_date.as_deref().unwrap_or_default(),
        query.end_date.as_deref().unwrap_or_default()
    );
    let budget = query.budget.map(|b| b.to_string()).unwrap_or_default();
    let travelers = query.travelers_or_default().to_string();
    let multi_city = query.multi_city.to_string();

    AdaptiveCache::<ProviderResult>::compute_key(&[
        capability,
        analysis.intent.as_str(),
        &destinations,
        &origin,
        &dates,
        &budget,
        &travelers,
        &multi_city,
    ])
}

fn critical_error(step: &PlanStep, result: &ProviderResult) -> OrchestratorError {
    match &result.error {
        Some(f) if f.kind == FailureKind::Timeout => OrchestratorError::ProviderTimeout {
            capability: step.capability.clone(),
            timeout_ms: step.timeout.as_millis() as u64,
        },
        Some(f) if f.kind == FailureKind::CircuitOpen => OrchestratorError::CircuitOpen(f.category),
        Some(f) => OrchestratorError::ProviderFailure {
            capability: step.capability.clone(),
            source: ProviderError::Other(f.message.clone()),
        },
        None => OrchestratorError::ProviderFailure {
            capability: step.capability.clone(),
            source: ProviderError::Other("no output".to_string()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::{Intent, IntentAnalyzer};
    use crate::config::{BreakerConfig, CacheConfig, Config, RetryConfig};
    use crate::planner::ExecutionPlanner;
    use crate::registry::Capability;
    use crate::types::DeclaredContext;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    enum Behaviour {
        Ok,
        Fail(ProviderError),
        Hang,
    }

    struct Scripted {
        name: &'static str,
        capability: &'static str,
        priority: i32,
        critical: bool,
        behaviour: Behaviour,
        calls: AtomicU32,
    }

    impl Scripted {
        fn new(name: &'static str, capability: &'static str, priority: i32, behaviour: Behaviour) -> Self {
            Self {
                name,
                capability,
                priority,
                critical: false,
                behaviour,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl Capability for Scripted {
        fn name(&self) -> &str {
            self.name
        }

        fn capabilities(&self) -> Vec<String> {
            vec![self.capability.to_string()]
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        fn critical(&self) -> bool {
            self.critical
        }

        fn timeout(&self) -> Option<Duration> {
            Some(Duration::from_millis(500))
        }

        async fn invoke(&self, ctx: &ProviderContext) -> Result<Value, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.behaviour {
                Behaviour::Ok => Ok(json!({ "from": self.name, "seen": ctx.prior_results.len() })),
                Behaviour::Fail(e) => Err(e.clone()),
                Behaviour::Hang => {
                    ctx.cancel.cancelled().await;
                    Err(ProviderError::Cancelled)
                }
            }
        }
    }

    struct Harness {
        registry: Arc<CapabilityRegistry>,
        policy: Arc<FailurePolicy>,
        executor: CapabilityExecutor,
        config: Config,
    }

    fn harness(max_attempts: u32, threshold: usize) -> Harness {
        let mut config = Config::default();
        config.executor.retry = RetryConfig {
            max_attempts,
            ..RetryConfig::default()
        };
        config.breaker = BreakerConfig {
            threshold,
            ..BreakerConfig::default()
        };
        let registry = Arc::new(CapabilityRegistry::new());
        let fallback = Arc::new(AdaptiveCache::new("fallback", CacheConfig::default()));
        let policy = Arc::new(FailurePolicy::new(config.breaker.clone(), fallback));
        let cache = Arc::new(AdaptiveCache::new("providers", CacheConfig::default()));
        let executor = CapabilityExecutor::new(
            registry.clone(),
            policy.clone(),
            cache,
            CancellationToken::new(),
        );
        Harness {
            registry,
            policy,
            executor,
            config,
        }
    }

    fn input(intent: Intent, context: DeclaredContext) -> ExecutionInput {
        let request = Request::new("u1", "c1", "plan my trip").with_context(DeclaredContext {
            intent: Some(intent),
            ..context
        });
        let conversation = ConversationState::new("c1", "u1", 20);
        let analysis = IntentAnalyzer::default().analyze(&request, &conversation);
        ExecutionInput {
            request: Arc::new(request),
            analysis: Arc::new(analysis),
            conversation: Arc::new(conversation),
        }
    }

    fn plan(h: &Harness, input: &ExecutionInput) -> ExecutionPlan {
        ExecutionPlanner::new(&h.config).build(&input.analysis, &h.registry)
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_failures_are_independent() {
        let h = harness(1, 100);
        h.registry
            .register(Arc::new(Scripted::new("flights", "flight_search", 5, Behaviour::Ok)))
            .unwrap();
        h.registry
            .register(Arc::new(Scripted::new(
                "hotels",
                "hotel_search",
                4,
                Behaviour::Fail(ProviderError::Upstream { status: 500, message: "boom".into() }),
            )))
            .unwrap();
        h.registry
            .register(Arc::new(Scripted::new("itinerary", "itinerary_generator", 3, Behaviour::Hang)))
            .unwrap();

        let input = input(Intent::FullTrip, DeclaredContext::default());
        let outcome = h.executor.execute(&plan(&h, &input), &input).await;

        assert_eq!(outcome.results.len(), 3);
        assert_eq!(outcome.successes().count(), 1);
        assert!(outcome.critical_failure.is_none());
        let timed_out = outcome
            .results
            .iter()
            .find(|r| r.capability == "itinerary_generator")
            .unwrap();
        assert!(timed_out.is_timeout());
        assert_eq!(h.executor.timeouts(), 1);
        assert_eq!(h.registry.metrics("itinerary").unwrap().timeout_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_critical_abort() {
        let h = harness(1, 100);
        h.registry
            .register(Arc::new(Scripted {
                critical: true,
                ..Scripted::new(
                    "flights",
                    "flight_search",
                    9,
                    Behaviour::Fail(ProviderError::Validation("no airport".into())),
                )
            }))
            .unwrap();
        let hotels = Arc::new(Scripted::new("hotels", "hotel_search", 1, Behaviour::Ok));
        h.registry.register(hotels.clone()).unwrap();

        let input = input(
            Intent::FullTrip,
            DeclaredContext {
                destinations: vec!["Rome".into(), "Milan".into()],
                multi_city: true,
                travelers: Some(12),
                ..Default::default()
            },
        );
        let plan = plan(&h, &input);
        assert_eq!(plan.strategy, Strategy::Sequential);

        let outcome = h.executor.execute(&plan, &input).await;
        assert_eq!(outcome.results.len(), 1);
        assert_eq!(outcome.aborted, vec!["hotel_search"]);
        assert_eq!(hotels.calls.load(Ordering::SeqCst), 0);
        assert!(matches!(
            outcome.critical_failure,
            Some(OrchestratorError::ProviderFailure { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_passes_prior_results() {
        let h = harness(1, 100);
        h.registry
            .register(Arc::new(Scripted::new("flights", "flight_search", 9, Behaviour::Ok)))
            .unwrap();
        h.registry
            .register(Arc::new(Scripted::new("hotels", "hotel_search", 1, Behaviour::Ok)))
            .unwrap();

        let input = input(
            Intent::FullTrip,
            DeclaredContext {
                multi_city: true,
                travelers: Some(12),
                ..Default::default()
            },
        );
        let outcome = h.executor.execute(&plan(&h, &input), &input).await;
        assert_eq!(outcome.results[0].output.as_ref().unwrap()["seen"], 0);
        assert_eq!(outcome.results[1].output.as_ref().unwrap()["seen"], 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_retryable_errors_only() {
        let h = harness(3, 100);
        let flaky = Arc::new(Scripted::new(
            "flights",
            "flight_search",
            1,
            Behaviour::Fail(ProviderError::Network("reset".into())),
        ));
        let invalid = Arc::new(Scripted::new(
            "hotels",
            "hotel_search",
            1,
            Behaviour::Fail(ProviderError::Validation("bad dates".into())),
        ));
        h.registry.register(flaky.clone()).unwrap();
        h.registry.register(invalid.clone()).unwrap();

        let input = input(Intent::FullTrip, DeclaredContext::default());
        let outcome = h.executor.execute(&plan(&h, &input), &input).await;

        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
        assert_eq!(invalid.calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.invocations, 4);
        let flights = outcome.results.iter().find(|r| r.provider == "flights").unwrap();
        assert_eq!(flights.attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_short_circuits() {
        let h = harness(1, 2);
        let flights = Arc::new(Scripted::new("flights", "flight_search", 1, Behaviour::Ok));
        h.registry.register(flights.clone()).unwrap();
        h.policy.record(ErrorCategory::UpstreamServer);
        h.policy.record(ErrorCategory::UpstreamServer);

        let input = input(Intent::FlightSearch, DeclaredContext::default());
        let outcome = h.executor.execute(&plan(&h, &input), &input).await;

        let result = &outcome.results[0];
        assert!(!result.success);
        assert_eq!(result.error.as_ref().unwrap().kind, FailureKind::CircuitOpen);
        assert_eq!(flights.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_provider_cache_hit() {
        let h = harness(1, 100);
        let flights = Arc::new(Scripted::new("flights", "flight_search", 1, Behaviour::Ok));
        h.registry.register(flights.clone()).unwrap();

        let input = input(
            Intent::FlightSearch,
            DeclaredContext {
                destinations: vec!["Tokyo".into()],
                ..Default::default()
            },
        );
        let plan = plan(&h, &input);
        let first = h.executor.execute(&plan, &input).await;
        let second = h.executor.execute(&plan, &input).await;

        assert_eq!(first.cache_hits, 0);
        assert_eq!(second.cache_hits, 1);
        assert_eq!(second.invocations, 0);
        assert!(second.results[0].from_cache);
        assert_eq!(second.results[0].output, first.results[0].output);
        assert_eq!(flights.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cache_key_ignores_message_wording() {
        let a = input(Intent::FlightSearch, DeclaredContext {
            destinations: vec!["Tokyo".into()],
            ..Default::default()
        });
        let b = input(Intent::FlightSearch, DeclaredContext {
            destinations: vec!["tokyo".into()],
            ..Default::default()
        });
        assert_eq!(
            provider_cache_key("flight_search", &a.analysis),
            provider_cache_key("flight_search", &b.analysis)
        );
        assert_ne!(
            provider_cache_key("flight_search", &a.analysis),
            provider_cache_key("hotel_search", &a.analysis)
        );
    }
}
