use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

use super::{seed, simulate_latency};
use crate::error::ProviderError;
use crate::registry::{capabilities, Capability, ProviderContext};

const AIRLINES: &[&str] = &["El Al", "Lufthansa", "Turkish Airlines", "Wizz Air", "Emirates", "ITA Airways"];

/// Flight offers per destination
#[derive(Debug, Clone, Default)]
pub struct FlightSearch {
    pub latency: Duration,
}

impl FlightSearch {
    pub fn with_latency(latency: Duration) -> Self {
        Self { latency }
    }
}

#[async_trait]
impl Capability for FlightSearch {
    fn name(&self) -> &str {
        "flight-search"
    }

    fn capabilities(&self) -> Vec<String> {
        vec![capabilities::FLIGHT_SEARCH.to_string()]
    }

    fn priority(&self) -> i32 {
        8
    }

    async fn invoke(&self, ctx: &ProviderContext) -> Result<Value, ProviderError> {
        simulate_latency(self.latency, &ctx.cancel).await?;

        let query = &ctx.analysis.query;
        if query.destinations.is_empty() {
            return Err(ProviderError::Validation("no destination given".to_string()));
        }
        let origin = query.origin.clone().unwrap_or_else(|| "TLV".to_string());
        let travelers = query.travelers_or_default();
        let currency = query.currency.clone().unwrap_or_else(|| "USD".to_string());
        let departure = query.start_date.clone().unwrap_or_default();

        let mut offers = Vec::new();
        for destination in &query.destinations {
            let s = seed(&[&origin, destination, &departure]);
            let base = 250 + (s % 900) as u32;
            for i in 0..3u64 {
                let airline = AIRLINES[((s >> (i * 8)) as usize + i as usize) % AIRLINES.len()];
                let per_person = base + (i as u32) * 85;
                offers.push(json!({
                    "airline": airline,
                    "from": origin,
                    "to": destination,
                    "departure": departure,
                    "stops": i,
                    "price": (per_person * travelers) as f64,
                    "currency": currency,
                }));
            }
        }

        // Cheapest itinerary: the cheapest leg to every destination
        let cheapest: f64 = query
            .destinations
            .iter()
            .filter_map(|d| {
                offers
                    .iter()
                    .filter(|o| o["to"] == d.as_str())
                    .filter_map(|o| o["price"].as_f64())
                    .reduce(f64::min)
            })
            .sum();

        Ok(json!({
            "offers": offers,
            "cheapestPrice": cheapest,
            "currency": currency,
            "travelers": travelers,
        }))
    }
}
