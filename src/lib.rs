//! TravelBot Orchestrator
//!
//! Request orchestration and adaptive caching for a travel-planning chatbot.
//!
//! # Features
//!
//! - **Intent Analysis**: Hebrew/English keyword detection, slot extraction, complexity scoring
//! - **Execution Planning**: Parallel, sequential or hybrid plans from a capability registry
//! - **Bounded Execution**: Per-step timeouts, retry with backoff, real cancellation
//! - **Adaptive Caching**: SHA256 keys, TTL + LRU eviction, optional Redis/SQLite layer
//! - **Failure Policy**: Per-category circuit breakers with cached fallback results
//! - **Conversation State**: Idle-expiring web and chat sessions with slot-filling flow
//! - **Concurrency Governor**: FIFO admission with a hard in-flight limit
//! - **Metrics**: Latency percentiles, cache hit rate, provider success rate
//!
//! # Architecture
//!
//! ```text
//! Bot adapter ──► Orchestrator ──► Governor ──► Analyzer ──► Planner
//!                     │                                        │
//!                     │                                        ▼
//!                     ├── Result Cache (LRU + backend)      Executor ──► Providers
//!                     ├── Conversation Stores (web/chat)       │
//!                     ├── Failure Policy (breakers)  ◄─────────┤
//!                     ├── Metrics (event channel)              ▼
//!                     └──────────────────────────────────  Synthesizer
//! ```

pub mod analyzer;
pub mod backend;
pub mod cache;
pub mod config;
pub mod conversation;
pub mod error;
pub mod executor;
pub mod governor;
pub mod metrics;
pub mod orchestrator;
pub mod planner;
pub mod providers;
pub mod recovery;
pub mod registry;
pub mod synthesizer;
pub mod types;

pub use analyzer::{Analysis, ComplexityLevel, Intent, IntentAnalyzer, TripQuery};
pub use backend::{CacheBackend, MemoryBackend, RedisBackend, SqliteBackend};
pub use cache::{AdaptiveCache, CacheStats};
pub use config::Config;
pub use conversation::{ConversationState, ConversationStore, FlowState};
pub use error::{ErrorBody, OrchestratorError, ProviderError};
pub use executor::{CapabilityExecutor, ExecutionOutcome};
pub use governor::{ConcurrencyGovernor, GovernorStats};
pub use metrics::{MetricsCollector, MetricsSnapshot};
pub use orchestrator::{Orchestrator, OrchestratorBuilder, OrchestratorStats};
pub use planner::{ExecutionPlan, ExecutionPlanner, PlanStep, Strategy};
pub use recovery::{BreakerState, ErrorCategory, FailurePolicy};
pub use registry::{Capability, CapabilityRegistry, ProviderContext, Registration, RegistryError};
pub use synthesizer::{ResultSynthesizer, SynthesizedData};
pub use types::{
    AccountTier, Channel, DeclaredContext, Locale, OrchestrationResult, ProviderResult, Request,
    ResultMetadata,
};
