use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

use crate::analyzer::Intent;
use crate::error::ProviderError;
use crate::recovery::ErrorCategory;
use crate::registry::{capabilities, Capability, ProviderContext};
use crate::types::Locale;

/// Conversational reply that keeps the dialogue going
#[derive(Debug, Clone, Copy, Default)]
pub struct ConversationProvider;

#[async_trait]
impl Capability for ConversationProvider {
    fn name(&self) -> &str {
        "conversation"
    }

    fn capabilities(&self) -> Vec<String> {
        vec![capabilities::CONVERSATION.to_string()]
    }

    fn priority(&self) -> i32 {
        -10
    }

    fn timeout(&self) -> Option<Duration> {
        Some(Duration::from_secs(2))
    }

    fn breaker_tags(&self) -> Vec<ErrorCategory> {
        Vec::new()
    }

    // Depends on per-conversation state
    fn cacheable(&self) -> bool {
        false
    }

    async fn invoke(&self, ctx: &ProviderContext) -> Result<Value, ProviderError> {
        let analysis = &ctx.analysis;
        let places = analysis.query.destinations.join(", ");

        let reply = match (analysis.intent, analysis.locale) {
            (Intent::Greeting, Locale::He) => "שלום! לאן נוסעים?".to_string(),
            (Intent::Greeting, Locale::En) => "Hi! Where are we travelling to?".to_string(),
            (Intent::GeneralInquiry, Locale::He) => "אשמח לעזור. ספרו לי עוד על הטיול.".to_string(),
            (Intent::GeneralInquiry, Locale::En) => "Happy to help. Tell me a bit more about your trip.".to_string(),
            (Intent::BookingManagement, Locale::He) => "אבדוק את ההזמנה שלכם.".to_string(),
            (Intent::BookingManagement, Locale::En) => "Let me look up your booking.".to_string(),
            (_, Locale::He) if !places.is_empty() => format!("הנה מה שמצאתי עבור {}.", places),
            (_, Locale::En) if !places.is_empty() => format!("Here's what I found for {}.", places),
            (_, Locale::He) => "בואו נתכנן את הטיול.".to_string(),
            (_, Locale::En) => "Let's plan your trip.".to_string(),
        };

        Ok(json!({
            "reply": reply,
            "intent": analysis.intent,
            "state": ctx.conversation.current_state,
            "collected": ctx.conversation.collected_data,
        }))
    }
}
