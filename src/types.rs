//! Core request/response types shared across the pipeline

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::analyzer::{ComplexityLevel, Intent};
use crate::cache::{json_size, ApproxSize};
use crate::error::ErrorBody;
use crate::planner::Strategy;
use crate::recovery::ErrorCategory;

/// Inbound channel a request arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// Bot adapters (Telegram, WhatsApp); short-lived turns
    Chat,
    /// Web client sessions
    #[default]
    Web,
}

/// Language used for user-facing text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Locale {
    He,
    #[default]
    En,
}

impl Locale {
    /// Hebrew if the text contains any Hebrew letter
    pub fn detect(text: &str) -> Self {
        if text.chars().any(is_hebrew) {
            Self::He
        } else {
            Self::En
        }
    }
}

pub(crate) fn is_hebrew(c: char) -> bool {
    ('\u{0590}'..='\u{05FF}').contains(&c)
}

/// Account tier used for request priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountTier {
    #[default]
    Standard,
    Premium,
    Vip,
}

/// Structured context supplied by the caller alongside the raw message
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DeclaredContext {
    pub intent: Option<Intent>,
    pub destinations: Vec<String>,
    pub origin: Option<String>,
    pub budget: Option<f64>,
    pub currency: Option<String>,
    pub travelers: Option<u32>,
    pub multi_city: bool,
    pub urgent: bool,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub flexible_dates: bool,
    pub account_tier: AccountTier,
    pub total_spend: f64,
    pub previous_bookings: u32,
    pub preferences: Vec<String>,
}

/// One inbound user message. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    #[serde(default)]
    pub request_id: String,
    pub user_id: String,
    pub conversation_id: String,
    pub raw_message: String,
    #[serde(default)]
    pub channel: Channel,
    #[serde(default)]
    pub declared_context: DeclaredContext,
}

impl Request {
    pub fn new(user_id: &str, conversation_id: &str, raw_message: &str) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            conversation_id: conversation_id.to_string(),
            raw_message: raw_message.to_string(),
            channel: Channel::default(),
            declared_context: DeclaredContext::default(),
        }
    }

    pub fn with_context(mut self, context: DeclaredContext) -> Self {
        self.declared_context = context;
        self
    }

    pub fn with_channel(mut self, channel: Channel) -> Self {
        self.channel = channel;
        self
    }

    /// Message with whitespace collapsed and case folded, used for cache keys
    pub fn normalized_message(&self) -> String {
        self.raw_message
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase()
    }
}

/// Why a provider step did not produce output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    CircuitOpen,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderFailure {
    pub kind: FailureKind,
    pub category: ErrorCategory,
    pub message: String,
}

/// Outcome of one executed plan step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderResult {
    pub capability: String,
    pub provider: String,
    pub success: bool,
    pub output: Option<Value>,
    pub error: Option<ProviderFailure>,
    pub duration_ms: u64,
    pub attempts: u32,
    #[serde(default)]
    pub from_cache: bool,
}

impl ProviderResult {
    pub fn success(capability: &str, provider: &str, output: Value, duration_ms: u64) -> Self {
        Self {
            capability: capability.to_string(),
            provider: provider.to_string(),
            success: true,
            output: Some(output),
            error: None,
            duration_ms,
            attempts: 1,
            from_cache: false,
        }
    }

    pub fn failure(
        capability: &str,
        provider: &str,
        failure: ProviderFailure,
        duration_ms: u64,
    ) -> Self {
        Self {
            capability: capability.to_string(),
            provider: provider.to_string(),
            success: false,
            output: None,
            error: Some(failure),
            duration_ms,
            attempts: 1,
            from_cache: false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(&self.error, Some(f) if f.kind == FailureKind::Timeout)
    }
}

impl ApproxSize for ProviderResult {
    fn approx_size(&self) -> usize {
        json_size(self)
    }
}

/// Bookkeeping attached to every orchestration result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultMetadata {
    pub request_id: String,
    pub response_time_ms: u64,
    pub providers_used: Vec<String>,
    pub strategy: Option<Strategy>,
    pub cache_hit: bool,
    #[serde(default)]
    pub degraded: bool,
    pub intent: Option<Intent>,
    pub complexity: Option<ComplexityLevel>,
}

/// What `Orchestrator::handle` returns to bot adapters and HTTP handlers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrationResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    pub metadata: ResultMetadata,
}

impl ApproxSize for OrchestrationResult {
    fn approx_size(&self) -> usize {
        json_size(self)
    }
}
