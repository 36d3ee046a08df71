//! Request Orchestrator
//!
//! The single inbound entry point. `handle` runs one request through
//! validation, admission, analysis, planning, execution and synthesis, and
//! always produces an [`OrchestrationResult`]; nothing below it can fail the
//! caller.

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::analyzer::{Analysis, IntentAnalyzer};
use crate::backend::{self, CacheBackend};
use crate::cache::{AdaptiveCache, ApproxSize, CacheStats};
use crate::config::{CacheConfig, Config};
use crate::conversation::{ConversationState, ConversationStore, TurnInput};
use crate::error::{ErrorBody, OrchestratorError};
use crate::executor::{CapabilityExecutor, ExecutionInput, ExecutionOutcome};
use crate::governor::{ConcurrencyGovernor, GovernorStats};
use crate::metrics::{MetricsCollector, MetricsSink, MetricsSnapshot, OrchestrationEvent, RequestEvent};
use crate::planner::{ExecutionPlan, ExecutionPlanner};
use crate::providers;
use crate::recovery::{FailurePolicy, FailurePolicyStats};
use crate::registry::{Capability, CapabilityRegistry, ProviderInfo, RegistryError};
use crate::synthesizer::ResultSynthesizer;
use crate::types::{Channel, Locale, OrchestrationResult, ProviderResult, Request, ResultMetadata};

/// Point-in-time view of every component
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorStats {
    pub governor: GovernorStats,
    pub result_cache: CacheStats,
    pub provider_cache: CacheStats,
    pub failure_policy: FailurePolicyStats,
    pub metrics: MetricsSnapshot,
    pub providers: Vec<ProviderInfo>,
    pub web_sessions: u64,
    pub chat_sessions: u64,
}

pub struct OrchestratorBuilder {
    config: Config,
    providers: Vec<Arc<dyn Capability>>,
    backend: Option<Arc<dyn CacheBackend>>,
    default_providers: bool,
}

impl OrchestratorBuilder {
    /// Register the built-in travel providers
    pub fn with_default_providers(mut self) -> Self {
        self.default_providers = true;
        self
    }

    pub fn provider(mut self, provider: Arc<dyn Capability>) -> Self {
        self.providers.push(provider);
        self
    }

    /// Back the caches with a durable store
    pub fn backend(mut self, backend: Arc<dyn CacheBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Wire everything up and start background sweepers.
    ///
    /// Must be called from within a tokio runtime.
    pub fn build(self) -> Result<Orchestrator, RegistryError> {
        let config = self.config;

        let registry = Arc::new(CapabilityRegistry::new());
        if self.default_providers {
            providers::register_defaults(&registry)?;
        }
        for provider in self.providers {
            registry.register(provider)?;
        }

        let provider_cache: Arc<AdaptiveCache<ProviderResult>> = layered_cache(
            "providers",
            config.executor.provider_cache_ttl_secs,
            &config.cache,
            &self.backend,
        );
        let results: Arc<AdaptiveCache<OrchestrationResult>> =
            layered_cache("results", config.result_ttl_secs, &config.cache, &self.backend);
        let fallback: Arc<AdaptiveCache<OrchestrationResult>> =
            layered_cache("fallback", config.fallback_ttl_secs, &config.cache, &self.backend);

        let shutdown = CancellationToken::new();
        let policy = Arc::new(FailurePolicy::new(config.breaker.clone(), fallback.clone()));
        let executor = CapabilityExecutor::new(
            registry.clone(),
            policy.clone(),
            provider_cache.clone(),
            shutdown.clone(),
        );

        let sessions = &config.sessions;
        let web_sessions = Arc::new(ConversationStore::new(
            "web",
            std::time::Duration::from_secs(sessions.web_idle_secs),
            sessions.max_history,
            sessions.max_sessions,
        ));
        let chat_sessions = Arc::new(ConversationStore::new(
            "chat",
            std::time::Duration::from_secs(sessions.chat_idle_secs),
            sessions.max_history,
            sessions.max_sessions,
        ));

        let metrics = MetricsCollector::new(1000);
        let (sink, metrics_task) = metrics.spawn(config.metrics_channel_capacity);

        let sweep_interval = std::time::Duration::from_secs(sessions.sweep_interval_secs.max(1));
        let mut tasks = vec![
            provider_cache.spawn_sweeper(shutdown.clone()),
            results.spawn_sweeper(shutdown.clone()),
            fallback.spawn_sweeper(shutdown.clone()),
            web_sessions.spawn_sweeper(sweep_interval, shutdown.clone()),
            chat_sessions.spawn_sweeper(sweep_interval, shutdown.clone()),
        ];
        if let Some(store) = &self.backend {
            tasks.push(backend::spawn_purger(
                store.clone(),
                config.cache.sweep_interval(),
                shutdown.clone(),
            ));
        }

        info!(
            "Orchestrator ready: {} providers, max {} concurrent",
            registry.len(),
            config.governor.max_concurrent
        );

        Ok(Orchestrator {
            analyzer: IntentAnalyzer::new(config.analyzer.clone()),
            planner: ExecutionPlanner::new(&config),
            governor: ConcurrencyGovernor::new(config.governor.max_concurrent),
            synthesizer: ResultSynthesizer::new(config.result_ttl()),
            registry,
            executor,
            policy,
            results,
            web_sessions,
            chat_sessions,
            metrics,
            sink,
            shutdown,
            tasks: Mutex::new(tasks),
            metrics_task: Mutex::new(Some(metrics_task)),
            config,
        })
    }
}

fn layered_cache<V>(
    name: &str,
    ttl_secs: u64,
    config: &CacheConfig,
    backend: &Option<Arc<dyn CacheBackend>>,
) -> Arc<AdaptiveCache<V>>
where
    V: Clone + ApproxSize + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    let cache = AdaptiveCache::new(
        name,
        CacheConfig {
            default_ttl_secs: ttl_secs,
            ..config.clone()
        },
    );
    let cache = match backend {
        Some(backend) => cache.with_backend(backend.clone()),
        None => cache,
    };
    Arc::new(cache)
}

/// Request orchestration engine
pub struct Orchestrator {
    config: Config,
    registry: Arc<CapabilityRegistry>,
    analyzer: IntentAnalyzer,
    planner: ExecutionPlanner,
    governor: ConcurrencyGovernor,
    executor: CapabilityExecutor,
    policy: Arc<FailurePolicy>,
    synthesizer: ResultSynthesizer,
    results: Arc<AdaptiveCache<OrchestrationResult>>,
    web_sessions: Arc<ConversationStore>,
    chat_sessions: Arc<ConversationStore>,
    metrics: MetricsCollector,
    sink: MetricsSink,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    metrics_task: Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn builder(config: Config) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            providers: Vec::new(),
            backend: None,
            default_providers: false,
        }
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Orchestrate one request
    pub async fn handle(&self, mut request: Request) -> OrchestrationResult {
        let start = Instant::now();
        if request.request_id.trim().is_empty() {
            request.request_id = uuid::Uuid::new_v4().to_string();
        }
        let locale = Locale::detect(&request.raw_message);

        if let Err(error) = self.validate(&request) {
            debug!("Rejected {}: {}", request.request_id, error);
            self.sink.emit(OrchestrationEvent::Rejected {
                request_id: request.request_id.clone(),
                code: error.code().to_string(),
            });
            return failed(&request, &error, locale, start);
        }

        let _permit = match self.governor.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                let error = OrchestratorError::ShuttingDown;
                self.sink.emit(OrchestrationEvent::Rejected {
                    request_id: request.request_id.clone(),
                    code: error.code().to_string(),
                });
                return failed(&request, &error, locale, start);
            }
        };

        let store = self.store_for(request.channel);
        let conversation = store
            .get_or_create(&request.conversation_id, &request.user_id)
            .await;
        let analysis = self.analyzer.analyze(&request, &conversation);
        let conversation = store
            .advance_turn(
                &request.conversation_id,
                &request.raw_message,
                analysis.slots.clone(),
                &TurnInput {
                    trip_intent: analysis.intent.is_trip(),
                    cancel: analysis.cancel,
                },
            )
            .await
            .unwrap_or(conversation);

        let key = result_key(&request, &analysis, &conversation);
        if let Some(cached) = self.results.get(&key).await {
            info!("Result cache hit for {}", request.request_id);
            let result = OrchestrationResult {
                metadata: ResultMetadata {
                    request_id: request.request_id.clone(),
                    response_time_ms: start.elapsed().as_millis() as u64,
                    cache_hit: true,
                    ..cached.metadata
                },
                ..cached
            };
            self.finish(&request, store, &result, 0, 0).await;
            return result;
        }

        let plan = self.planner.build(&analysis, &self.registry);
        let input = ExecutionInput {
            request: Arc::new(request.clone()),
            analysis: Arc::new(analysis),
            conversation: Arc::new(conversation),
        };
        let outcome = self.executor.execute(&plan, &input).await;

        let result = self.conclude(&key, &plan, &input, &outcome, start).await;
        let succeeded = outcome.successes().count() as u32;
        self.finish(&request, store, &result, plan.len() as u32, succeeded).await;
        result
    }

    /// Failure policy or synthesis, then result caching
    async fn conclude(
        &self,
        key: &str,
        plan: &ExecutionPlan,
        input: &ExecutionInput,
        outcome: &ExecutionOutcome,
        start: Instant,
    ) -> OrchestrationResult {
        let analysis: &Analysis = &input.analysis;
        let mut providers_used: Vec<String> = Vec::new();
        for result in outcome.successes() {
            if !providers_used.contains(&result.capability) {
                providers_used.push(result.capability.clone());
            }
        }
        let degraded = outcome.results.iter().any(|r| !r.success) || !plan.skipped.is_empty();
        let metadata = ResultMetadata {
            request_id: input.request.request_id.clone(),
            response_time_ms: 0,
            providers_used,
            strategy: Some(plan.strategy),
            cache_hit: outcome.any_success() && outcome.successes().all(|r| r.from_cache),
            degraded,
            intent: Some(analysis.intent),
            complexity: Some(analysis.complexity),
        };

        let escalation = match &outcome.critical_failure {
            Some(error) => Some(error.clone()),
            None if !outcome.any_success() => Some(OrchestratorError::AllProvidersFailed {
                attempted: plan.len(),
            }),
            None => None,
        };

        if let Some(error) = escalation {
            let mut result = self.policy.recover(key, error, analysis.locale, metadata).await;
            result.metadata.response_time_ms = start.elapsed().as_millis() as u64;
            return result;
        }

        let data = self
            .synthesizer
            .synthesize(analysis, plan, outcome, &input.conversation);
        let mut result = OrchestrationResult {
            success: true,
            data: Some(data.to_value()),
            error: None,
            metadata,
        };

        // Partial answers are not replayed
        if !degraded {
            self.results.set(key, result.clone(), self.config.result_ttl()).await;
        }
        self.policy.remember(key, &result).await;

        result.metadata.response_time_ms = start.elapsed().as_millis() as u64;
        result
    }

    /// Close the conversation turn and report the request
    async fn finish(
        &self,
        request: &Request,
        store: &ConversationStore,
        result: &OrchestrationResult,
        attempted: u32,
        succeeded: u32,
    ) {
        let reply = result
            .data
            .as_ref()
            .and_then(|d| d.get("reply"))
            .and_then(|r| r.as_str())
            .map(str::to_string)
            .or_else(|| result.error.as_ref().map(|e| e.message.clone()))
            .unwrap_or_default();
        store.complete_turn(&request.conversation_id, &reply).await;

        self.sink.emit(OrchestrationEvent::Request(RequestEvent {
            request_id: request.request_id.clone(),
            intent: result.metadata.intent,
            strategy: result.metadata.strategy,
            response_time_ms: result.metadata.response_time_ms,
            success: result.success,
            cache_hit: result.metadata.cache_hit,
            degraded: result.metadata.degraded,
            providers_attempted: attempted,
            providers_succeeded: succeeded,
            error_code: result.error.as_ref().map(|e| e.code.clone()),
        }));
    }

    fn validate(&self, request: &Request) -> Result<(), OrchestratorError> {
        let invalid = |msg: String| Err(OrchestratorError::Validation(msg));
        let message = request.raw_message.trim();
        let context = &request.declared_context;

        if request.user_id.trim().is_empty() {
            return invalid("userId is required".to_string());
        }
        if request.conversation_id.trim().is_empty() {
            return invalid("conversationId is required".to_string());
        }
        if message.is_empty() {
            return invalid("message is empty".to_string());
        }
        let chars = message.chars().count();
        if chars > self.config.max_message_chars {
            return invalid(format!(
                "message is {} characters, limit is {}",
                chars, self.config.max_message_chars
            ));
        }
        if let Some(travelers) = context.travelers {
            if travelers == 0 || travelers > self.config.max_travelers {
                return invalid(format!(
                    "travelers must be between 1 and {}",
                    self.config.max_travelers
                ));
            }
        }
        if let Some(budget) = context.budget {
            if !budget.is_finite() || budget < 0.0 {
                return invalid("budget must be a non-negative amount".to_string());
            }
        }
        Ok(())
    }

    fn store_for(&self, channel: Channel) -> &ConversationStore {
        match channel {
            Channel::Chat => self.chat_sessions.as_ref(),
            Channel::Web => self.web_sessions.as_ref(),
        }
    }

    /// Conversation state without counting an interaction
    pub async fn conversation(&self, channel: Channel, conversation_id: &str) -> Option<ConversationState> {
        self.store_for(channel).peek(conversation_id).await
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn stats(&self) -> OrchestratorStats {
        OrchestratorStats {
            governor: self.governor.stats(),
            result_cache: self.results.stats(),
            provider_cache: self.executor.cache().stats(),
            failure_policy: self.policy.stats(),
            metrics: self.metrics.snapshot(),
            providers: self.registry.list(),
            web_sessions: self.web_sessions.len(),
            chat_sessions: self.chat_sessions.len(),
        }
    }

    /// Stop sweepers, refuse new requests and cancel in-flight provider calls
    pub async fn shutdown(&self) {
        info!("Orchestrator shutting down");
        self.shutdown.cancel();
        self.governor.close();

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }
        if let Some(task) = self.metrics_task.lock().take() {
            task.abort();
        }
    }
}

/// Result cache key: user, normalized message and declared context, plus the
/// dialogue position (intent, merged query, flow state and collected slots)
/// the answer was computed for
pub fn result_key(request: &Request, analysis: &Analysis, conversation: &ConversationState) -> String {
    let mut context = request.declared_context.clone();
    context.destinations = context
        .destinations
        .iter()
        .map(|d| d.trim().to_lowercase())
        .collect();
    context.preferences.sort();
    let context = serde_json::to_string(&context).unwrap_or_default();

    let mut query = analysis.query.clone();
    query.destinations = query.destinations.iter().map(|d| d.trim().to_lowercase()).collect();
    query.preferences.sort();
    let query = serde_json::to_string(&query).unwrap_or_default();
    let state = serde_json::to_string(&conversation.current_state).unwrap_or_default();
    let slots = serde_json::to_string(&conversation.collected_data).unwrap_or_default();

    AdaptiveCache::<OrchestrationResult>::compute_key(&[
        &request.user_id,
        &request.normalized_message(),
        &context,
        analysis.intent.as_str(),
        &query,
        &state,
        &slots,
    ])
}

fn failed(
    request: &Request,
    error: &OrchestratorError,
    locale: Locale,
    start: Instant,
) -> OrchestrationResult {
    OrchestrationResult {
        success: false,
        data: None,
        error: Some(ErrorBody::from_error(error, locale)),
        metadata: ResultMetadata {
            request_id: request.request_id.clone(),
            response_time_ms: start.elapsed().as_millis() as u64,
            providers_used: Vec::new(),
            strategy: None,
            cache_hit: false,
            degraded: false,
            intent: None,
            complexity: None,
        },
    }
}
