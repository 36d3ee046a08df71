//! Error Taxonomy
//!
//! Errors that can surface from the orchestration pipeline. Provider-level
//! failures are always folded into a [`ProviderResult`](crate::types::ProviderResult);
//! only the variants here ever reach `Orchestrator::handle`, and even those are
//! rendered into an `OrchestrationResult` instead of being returned as `Err`.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::recovery::ErrorCategory;
use crate::types::Locale;

/// Failure raised by a capability provider's `invoke`
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Upstream returned {status}: {message}")]
    Upstream { status: u16, message: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Rate limited: retry after {0:?}")]
    RateLimited(Option<Duration>),

    #[error("Cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

/// Errors that escape the executor and reach the orchestration boundary
#[derive(Debug, Clone, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Provider '{capability}' timed out after {timeout_ms}ms")]
    ProviderTimeout { capability: String, timeout_ms: u64 },

    #[error("Provider '{capability}' failed: {source}")]
    ProviderFailure {
        capability: String,
        #[source]
        source: ProviderError,
    },

    #[error("All {attempted} providers failed")]
    AllProvidersFailed { attempted: usize },

    #[error("Cache backend unavailable: {0}")]
    CacheBackendUnavailable(String),

    #[error("Circuit open for {0:?}")]
    CircuitOpen(ErrorCategory),

    #[error("Orchestrator is shutting down")]
    ShuttingDown,
}

impl OrchestratorError {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::ProviderTimeout { .. } => "provider_timeout",
            Self::ProviderFailure { .. } => "provider_failure",
            Self::AllProvidersFailed { .. } => "all_providers_failed",
            Self::CacheBackendUnavailable(_) => "cache_backend_unavailable",
            Self::CircuitOpen(_) => "circuit_open",
            Self::ShuttingDown => "shutting_down",
        }
    }

    /// Whether a later identical request could succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Validation(_))
    }

    /// Non-technical message shown to the traveller
    pub fn user_message(&self, locale: Locale) -> String {
        match (self, locale) {
            (Self::Validation(detail), Locale::He) => {
                format!("לא הצלחנו להבין את הבקשה: {}", detail)
            }
            (Self::Validation(detail), Locale::En) => {
                format!("We couldn't understand that request: {}", detail)
            }
            (Self::CircuitOpen(_), Locale::He) => {
                "חלק מהשירותים שלנו עמוסים כרגע. נסו שוב בעוד כמה דקות.".to_string()
            }
            (Self::CircuitOpen(_), Locale::En) => {
                "Some of our services are busy right now. Please try again in a few minutes."
                    .to_string()
            }
            (_, Locale::He) => {
                "מצטערים, משהו השתבש בזמן הכנת ההצעה שלכם. נסו שוב בעוד רגע.".to_string()
            }
            (_, Locale::En) => {
                "Sorry, something went wrong while putting your trip together. Please try again shortly."
                    .to_string()
            }
        }
    }
}

/// Support contact appended to every user-facing error
pub fn support_hint(locale: Locale) -> &'static str {
    match locale {
        Locale::He => "אם הבעיה נמשכת, פנו אלינו בכתובת support@travelbot.co.il",
        Locale::En => "If this keeps happening, contact us at support@travelbot.co.il",
    }
}

/// Error body of a failed `OrchestrationResult`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    pub support_hint: String,
    pub retryable: bool,
}

impl ErrorBody {
    pub fn from_error(error: &OrchestratorError, locale: Locale) -> Self {
        Self {
            code: error.code().to_string(),
            message: error.user_message(locale),
            support_hint: support_hint(locale).to_string(),
            retryable: error.is_retryable(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_not_retryable() {
        let err = OrchestratorError::Validation("empty message".to_string());
        assert!(!err.is_retryable());
        assert_eq!(err.code(), "validation_error");

        let err = OrchestratorError::AllProvidersFailed { attempted: 3 };
        assert!(err.is_retryable());
    }

    #[test]
    fn test_error_body_is_localized() {
        let err = OrchestratorError::AllProvidersFailed { attempted: 2 };

        let en = ErrorBody::from_error(&err, Locale::En);
        assert!(en.message.starts_with("Sorry"));
        assert!(en.support_hint.contains("support@"));

        let he = ErrorBody::from_error(&err, Locale::He);
        assert!(he.message.contains("מצטערים"));
        assert!(!he.message.contains("providers"));
    }
}
