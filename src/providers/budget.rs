use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

use super::hotel::nights;
use super::{seed, simulate_latency};
use crate::error::ProviderError;
use crate::registry::{capabilities, Capability, ProviderContext};

/// Food, transport and activities per traveller per day
const DAILY_SPEND: f64 = 85.0;

/// Trip cost estimate against the stated budget
#[derive(Debug, Clone, Default)]
pub struct BudgetAnalyzer {
    pub latency: Duration,
}

#[async_trait]
impl Capability for BudgetAnalyzer {
    fn name(&self) -> &str {
        "budget-analyzer"
    }

    fn capabilities(&self) -> Vec<String> {
        vec![capabilities::BUDGET_ANALYZER.to_string()]
    }

    fn priority(&self) -> i32 {
        2
    }

    fn depends_on(&self) -> Vec<String> {
        vec![
            capabilities::FLIGHT_SEARCH.to_string(),
            capabilities::HOTEL_SEARCH.to_string(),
        ]
    }

    async fn invoke(&self, ctx: &ProviderContext) -> Result<Value, ProviderError> {
        simulate_latency(self.latency, &ctx.cancel).await?;

        let query = &ctx.analysis.query;
        let travelers = query.travelers_or_default() as f64;
        let nights = nights(query) as f64;
        let destinations = query.destinations.join(",");
        let s = seed(&[&destinations]);

        // Prefer real quotes from earlier steps, else a rough estimate
        let flights = ctx
            .prior_output(capabilities::FLIGHT_SEARCH)
            .and_then(|f| f["cheapestPrice"].as_f64())
            .unwrap_or_else(|| (400 + s % 600) as f64 * travelers);
        let lodging = ctx
            .prior_output(capabilities::HOTEL_SEARCH)
            .and_then(|h| h["cheapestTotal"].as_f64())
            .unwrap_or_else(|| (90 + (s >> 16) % 150) as f64 * nights * (travelers / 2.0).ceil());
        let daily = DAILY_SPEND * travelers * nights;
        let total = flights + lodging + daily;

        let within_budget = query.budget.map(|b| total <= b);
        Ok(json!({
            "estimatedTotal": total,
            "budget": query.budget,
            "withinBudget": within_budget,
            "quoted": ctx.prior_output(capabilities::FLIGHT_SEARCH).is_some(),
            "breakdown": {
                "flights": flights,
                "lodging": lodging,
                "dailySpend": daily,
            },
        }))
    }
}
