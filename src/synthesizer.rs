//! Result Synthesizer
//!
//! Merges successful provider outputs into one response body, scores its
//! completeness and derives rule-based recommendations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

use crate::analyzer::Analysis;
use crate::conversation::{slots, ConversationState, FlowState};
use crate::executor::ExecutionOutcome;
use crate::planner::ExecutionPlan;
use crate::recovery::ErrorCategory;
use crate::registry::capabilities;
use crate::types::{FailureKind, Locale};

/// Savings are flagged when the cheapest options undercut the budget by this much
const SAVINGS_THRESHOLD: f64 = 0.15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationKind {
    PotentialSavings,
    OverBudget,
    DateFlexibility,
    MultiDestinationRouting,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recommendation {
    #[serde(rename = "type")]
    pub kind: RecommendationKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GreetingTier {
    Cold,
    Warm,
    Hot,
}

impl GreetingTier {
    /// cold ≤ 1 interaction, warm 2-5, hot > 5
    pub fn from_interactions(count: u64) -> Self {
        match count {
            0..=1 => Self::Cold,
            2..=5 => Self::Warm,
            _ => Self::Hot,
        }
    }

    pub fn greeting(&self, locale: Locale) -> &'static str {
        match (self, locale) {
            (Self::Cold, Locale::He) => "ברוכים הבאים! נשמח לעזור לתכנן את הטיול שלכם.",
            (Self::Cold, Locale::En) => "Welcome! Happy to help you plan your trip.",
            (Self::Warm, Locale::He) => "טוב לראות אתכם שוב! הנה מה שמצאנו.",
            (Self::Warm, Locale::En) => "Good to see you again! Here's what we found.",
            (Self::Hot, Locale::He) => "שמחים שחזרתם! הכנו עבורכם את ההצעות הכי מתאימות.",
            (Self::Hot, Locale::En) => "Great to have you back! We've lined up our best picks for you.",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Personalization {
    pub tier: GreetingTier,
    pub greeting: String,
    pub interaction_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationBlock {
    pub state: FlowState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_question: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureSummary {
    pub capability: String,
    pub provider: String,
    pub kind: FailureKind,
    pub category: ErrorCategory,
}

/// The `data` body of a successful orchestration result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SynthesizedData {
    pub results: Map<String, Value>,
    pub completeness: u8,
    pub recommendations: Vec<Recommendation>,
    pub personalization: Personalization,
    pub conversation: ConversationBlock,
    pub failures: Vec<FailureSummary>,
    /// Text reply for chat channels
    pub reply: String,
    pub expires_at: DateTime<Utc>,
}

impl SynthesizedData {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

pub struct ResultSynthesizer {
    result_ttl: Duration,
}

impl ResultSynthesizer {
    pub fn new(result_ttl: Duration) -> Self {
        Self { result_ttl }
    }

    pub fn synthesize(
        &self,
        analysis: &Analysis,
        plan: &ExecutionPlan,
        outcome: &ExecutionOutcome,
        conversation: &ConversationState,
    ) -> SynthesizedData {
        let locale = analysis.locale;
        let mut results = Map::new();
        for result in outcome.successes() {
            if let Some(output) = &result.output {
                results.insert(result.capability.clone(), output.clone());
            }
        }

        let failures = outcome
            .results
            .iter()
            .filter(|r| !r.success)
            .filter_map(|r| {
                r.error.as_ref().map(|e| FailureSummary {
                    capability: r.capability.clone(),
                    provider: r.provider.clone(),
                    kind: e.kind,
                    category: e.category,
                })
            })
            .collect();

        let tier = GreetingTier::from_interactions(conversation.interaction_count);
        let personalization = Personalization {
            tier,
            greeting: tier.greeting(locale).to_string(),
            interaction_count: conversation.interaction_count,
        };

        let next_question = conversation
            .current_state
            .pending_slot()
            .map(|slot| question(slot, locale).to_string());
        let reply = results
            .get(capabilities::CONVERSATION)
            .and_then(|c| c.get("reply"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| next_question.clone())
            .unwrap_or_else(|| personalization.greeting.clone());

        let expires_at = Utc::now()
            + chrono::Duration::from_std(self.result_ttl).unwrap_or_else(|_| chrono::Duration::minutes(5));

        SynthesizedData {
            // Capabilities with no provider still count as expected
            completeness: completeness(plan.len() + plan.skipped.len(), results.len()),
            recommendations: recommendations(analysis, &results),
            results,
            personalization,
            conversation: ConversationBlock {
                state: conversation.current_state,
                next_question,
            },
            failures,
            reply,
            expires_at,
        }
    }
}

/// Percentage of expected result categories that came back
pub fn completeness(planned: usize, succeeded: usize) -> u8 {
    if planned == 0 {
        return 0;
    }
    ((succeeded.min(planned) * 100) / planned) as u8
}

/// Fixed recommendation rules over the merged results
pub fn recommendations(analysis: &Analysis, results: &Map<String, Value>) -> Vec<Recommendation> {
    let locale = analysis.locale;
    let query = &analysis.query;
    let mut out = Vec::new();

    if let (Some(budget), Some(total)) = (query.budget, estimated_total(results)) {
        if budget > 0.0 && total > budget {
            let amount = round2(total - budget);
            out.push(Recommendation {
                kind: RecommendationKind::OverBudget,
                message: match locale {
                    Locale::He => format!("האפשרויות הזולות ביותר חורגות מהתקציב ב-{}", amount),
                    Locale::En => format!("The cheapest options exceed your budget by {}", amount),
                },
                amount: Some(amount),
            });
        } else if budget > 0.0 && total <= budget * (1.0 - SAVINGS_THRESHOLD) {
            let amount = round2(budget - total);
            out.push(Recommendation {
                kind: RecommendationKind::PotentialSavings,
                message: match locale {
                    Locale::He => format!("אפשר לחסוך כ-{} לעומת התקציב שלכם", amount),
                    Locale::En => format!("You could save about {} against your budget", amount),
                },
                amount: Some(amount),
            });
        }
    }

    if !query.has_dates() || query.flexible_dates {
        out.push(Recommendation {
            kind: RecommendationKind::DateFlexibility,
            message: match locale {
                Locale::He => "גמישות בתאריכים יכולה להוזיל את הטיול משמעותית".to_string(),
                Locale::En => "Being flexible with dates can lower prices noticeably".to_string(),
            },
            amount: None,
        });
    }

    if query.is_multi_destination() {
        out.push(Recommendation {
            kind: RecommendationKind::MultiDestinationRouting,
            message: match locale {
                Locale::He => "כדאי לשקול טיסת open-jaw בין היעדים".to_string(),
                Locale::En => "Consider an open-jaw route between your destinations".to_string(),
            },
            amount: None,
        });
    }

    out
}

/// Budget analyzer total, else cheapest flight plus cheapest stay
fn estimated_total(results: &Map<String, Value>) -> Option<f64> {
    if let Some(total) = results
        .get(capabilities::BUDGET_ANALYZER)
        .and_then(|b| b.get("estimatedTotal"))
        .and_then(Value::as_f64)
    {
        return Some(total);
    }

    let flight = results
        .get(capabilities::FLIGHT_SEARCH)
        .and_then(|f| cheapest(f, "cheapestPrice", "offers", "price"));
    let hotel = results
        .get(capabilities::HOTEL_SEARCH)
        .and_then(|h| cheapest(h, "cheapestTotal", "hotels", "totalPrice"));

    match (flight, hotel) {
        (None, None) => None,
        (f, h) => Some(f.unwrap_or(0.0) + h.unwrap_or(0.0)),
    }
}

fn cheapest(output: &Value, summary: &str, list: &str, field: &str) -> Option<f64> {
    output.get(summary).and_then(Value::as_f64).or_else(|| {
        output
            .get(list)?
            .as_array()?
            .iter()
            .filter_map(|item| item.get(field).and_then(Value::as_f64))
            .reduce(f64::min)
    })
}

fn question(slot: &str, locale: Locale) -> &'static str {
    match (slot, locale) {
        (slots::DESTINATION, Locale::He) => "לאן תרצו לטוס?",
        (slots::DESTINATION, Locale::En) => "Where would you like to go?",
        (slots::DATES, Locale::He) => "באילו תאריכים?",
        (slots::DATES, Locale::En) => "When are you planning to travel?",
        (slots::BUDGET, Locale::He) => "מה התקציב שלכם?",
        (slots::BUDGET, Locale::En) => "What's your budget?",
        (_, Locale::He) => "יש לכם העדפות מיוחדות?",
        (_, Locale::En) => "Any preferences we should know about?",
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::{Intent, IntentAnalyzer};
    use crate::planner::{PlanStep, RetryPolicy, Strategy};
    use crate::types::{DeclaredContext, ProviderFailure, ProviderResult, Request};
    use serde_json::json;

    fn analysis(context: DeclaredContext) -> Analysis {
        let request = Request::new("u1", "c1", "trip").with_context(context);
        IntentAnalyzer::default().analyze(&request, &ConversationState::new("c1", "u1", 20))
    }

    fn step(capability: &str) -> PlanStep {
        PlanStep {
            capability: capability.to_string(),
            provider: capability.to_string(),
            priority: 0,
            timeout: Duration::from_secs(1),
            retry: RetryPolicy::none(),
            critical: false,
            depends_on: vec![],
            breaker_tags: vec![],
            cacheable: true,
            cache_ttl: Duration::from_secs(60),
        }
    }

    fn plan(caps: &[&str]) -> ExecutionPlan {
        ExecutionPlan {
            strategy: Strategy::Parallel,
            steps: caps.iter().map(|c| step(c)).collect(),
            skipped: vec![],
        }
    }

    fn failed(capability: &str) -> ProviderResult {
        ProviderResult::failure(
            capability,
            capability,
            ProviderFailure {
                kind: FailureKind::Error,
                category: ErrorCategory::UpstreamServer,
                message: "boom".into(),
            },
            5,
        )
    }

    #[test]
    fn test_completeness_proportional() {
        assert_eq!(completeness(5, 2), 40);
        assert_eq!(completeness(4, 4), 100);
        assert_eq!(completeness(0, 0), 0);
    }

    #[test]
    fn test_partial_results_merge() {
        let caps = ["flight_search", "hotel_search", "itinerary_generator", "budget_analyzer", "conversation"];
        let outcome = ExecutionOutcome {
            results: vec![
                ProviderResult::success("flight_search", "f", json!({"cheapestPrice": 900.0}), 3),
                failed("hotel_search"),
                failed("itinerary_generator"),
                failed("budget_analyzer"),
                ProviderResult::success("conversation", "c", json!({"reply": "Here you go"}), 1),
            ],
            ..Default::default()
        };
        let mut conversation = ConversationState::new("c1", "u1", 20);
        conversation.interaction_count = 3;

        let data = ResultSynthesizer::new(Duration::from_secs(300)).synthesize(
            &analysis(DeclaredContext {
                intent: Some(Intent::FullTrip),
                ..Default::default()
            }),
            &plan(&caps),
            &outcome,
            &conversation,
        );

        assert_eq!(data.completeness, 40);
        assert_eq!(data.results.len(), 2);
        assert_eq!(data.failures.len(), 3);
        assert_eq!(data.personalization.tier, GreetingTier::Warm);
        assert_eq!(data.reply, "Here you go");
        assert!(data.expires_at > Utc::now());

        let value = data.to_value();
        assert_eq!(value["completeness"], 40);
        assert_eq!(value["personalization"]["interactionCount"], 3);
        assert!(value["expiresAt"].is_string());
    }

    #[test]
    fn test_skipped_capability_lowers_completeness() {
        let outcome = ExecutionOutcome {
            results: vec![ProviderResult::success(
                "conversation",
                "c",
                json!({"reply": "Let me look up your booking."}),
                1,
            )],
            ..Default::default()
        };
        let mut booking_plan = plan(&["conversation"]);
        booking_plan.skipped = vec!["booking_manager".to_string()];

        let data = ResultSynthesizer::new(Duration::from_secs(300)).synthesize(
            &analysis(DeclaredContext {
                intent: Some(Intent::BookingManagement),
                ..Default::default()
            }),
            &booking_plan,
            &outcome,
            &ConversationState::new("c1", "u1", 20),
        );
        assert_eq!(data.completeness, 50);
    }

    #[test]
    fn test_savings_and_over_budget() {
        let mut results = Map::new();
        results.insert("flight_search".into(), json!({"offers": [{"price": 700.0}, {"price": 500.0}]}));
        results.insert("hotel_search".into(), json!({"cheapestTotal": 600.0}));

        let roomy = analysis(DeclaredContext {
            budget: Some(2000.0),
            start_date: Some("2026-11-01".into()),
            ..Default::default()
        });
        let recs = recommendations(&roomy, &results);
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].kind, RecommendationKind::PotentialSavings);
        assert_eq!(recs[0].amount, Some(900.0));

        let tight = analysis(DeclaredContext {
            budget: Some(1000.0),
            start_date: Some("2026-11-01".into()),
            ..Default::default()
        });
        let recs = recommendations(&tight, &results);
        assert_eq!(recs[0].kind, RecommendationKind::OverBudget);
        assert_eq!(recs[0].amount, Some(100.0));
    }

    #[test]
    fn test_date_and_routing_rules() {
        let query = analysis(DeclaredContext {
            destinations: vec!["Rome".into(), "Florence".into()],
            ..Default::default()
        });
        let kinds: Vec<_> = recommendations(&query, &Map::new()).into_iter().map(|r| r.kind).collect();
        assert_eq!(
            kinds,
            vec![RecommendationKind::DateFlexibility, RecommendationKind::MultiDestinationRouting]
        );
    }

    #[test]
    fn test_greeting_tiers() {
        assert_eq!(GreetingTier::from_interactions(1), GreetingTier::Cold);
        assert_eq!(GreetingTier::from_interactions(5), GreetingTier::Warm);
        assert_eq!(GreetingTier::from_interactions(6), GreetingTier::Hot);
        assert!(GreetingTier::Hot.greeting(Locale::He).contains("שמחים"));
    }
}
