use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

use super::hotel::nights;
use super::{seed, simulate_latency};
use crate::error::ProviderError;
use crate::registry::{capabilities, Capability, ProviderContext};

const ACTIVITIES: &[&str] = &[
    "Old town walking tour",
    "Local market visit",
    "Museum morning",
    "Sunset viewpoint",
    "Street food crawl",
    "Day trip to the countryside",
    "Cooking class",
    "Harbor cruise",
];

/// Day-by-day plan across the destinations
#[derive(Debug, Clone, Default)]
pub struct ItineraryGenerator {
    pub latency: Duration,
}

#[async_trait]
impl Capability for ItineraryGenerator {
    fn name(&self) -> &str {
        "itinerary-generator"
    }

    fn capabilities(&self) -> Vec<String> {
        vec![capabilities::ITINERARY_GENERATOR.to_string()]
    }

    fn priority(&self) -> i32 {
        4
    }

    async fn invoke(&self, ctx: &ProviderContext) -> Result<Value, ProviderError> {
        simulate_latency(self.latency, &ctx.cancel).await?;

        let query = &ctx.analysis.query;
        if query.destinations.is_empty() {
            return Err(ProviderError::Validation("no destination given".to_string()));
        }
        let total_days = nights(query).clamp(1, 14);
        let per_city = (total_days as usize).div_ceil(query.destinations.len());

        let mut days = Vec::new();
        for (day, destination) in query
            .destinations
            .iter()
            .flat_map(|d| std::iter::repeat(d).take(per_city))
            .take(total_days as usize)
            .enumerate()
        {
            let s = seed(&[destination, &day.to_string()]) as usize;
            let mut activities = vec![
                ACTIVITIES[s % ACTIVITIES.len()],
                ACTIVITIES[(s / 7 + 1) % ACTIVITIES.len()],
            ];
            activities.dedup();
            days.push(json!({
                "day": day + 1,
                "city": destination,
                "activities": activities,
            }));
        }

        Ok(json!({
            "days": days,
            "totalDays": total_days,
            "preferences": query.preferences,
        }))
    }
}
