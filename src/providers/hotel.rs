use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::{json, Value};
use std::time::Duration;

use super::{seed, simulate_latency};
use crate::analyzer::TripQuery;
use crate::error::ProviderError;
use crate::registry::{capabilities, Capability, ProviderContext};

const DEFAULT_NIGHTS: u32 = 5;
const NAMES: &[&str] = &["Grand", "Boutique", "Central", "Harbor", "Garden", "Plaza"];

/// Hotel options per destination
#[derive(Debug, Clone, Default)]
pub struct HotelSearch {
    pub latency: Duration,
}

impl HotelSearch {
    pub fn with_latency(latency: Duration) -> Self {
        Self { latency }
    }
}

/// Nights between ISO dates, else a default stay
pub(crate) fn nights(query: &TripQuery) -> u32 {
    let parse = |d: &Option<String>| {
        d.as_deref()
            .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
    };
    match (parse(&query.start_date), parse(&query.end_date)) {
        (Some(start), Some(end)) if end > start => (end - start).num_days().min(60) as u32,
        _ => DEFAULT_NIGHTS,
    }
}

#[async_trait]
impl Capability for HotelSearch {
    fn name(&self) -> &str {
        "hotel-search"
    }

    fn capabilities(&self) -> Vec<String> {
        vec![capabilities::HOTEL_SEARCH.to_string()]
    }

    fn priority(&self) -> i32 {
        6
    }

    async fn invoke(&self, ctx: &ProviderContext) -> Result<Value, ProviderError> {
        simulate_latency(self.latency, &ctx.cancel).await?;

        let query = &ctx.analysis.query;
        if query.destinations.is_empty() {
            return Err(ProviderError::Validation("no destination given".to_string()));
        }
        let nights = nights(query);
        let rooms = query.travelers_or_default().div_ceil(2);
        let per_city = (nights / query.destinations.len() as u32).max(1);

        let mut hotels = Vec::new();
        let mut cheapest_total = 0.0;
        for destination in &query.destinations {
            let s = seed(&[destination, &query.preferences.join(",")]);
            let mut city_min = f64::MAX;
            for i in 0..3u64 {
                let per_night = 70 + ((s >> (i * 10)) % 330) as u32;
                let total = (per_night * per_city * rooms) as f64;
                city_min = city_min.min(total);
                hotels.push(json!({
                    "name": format!("{} {}", NAMES[((s >> i) as usize) % NAMES.len()], destination),
                    "city": destination,
                    "pricePerNight": per_night as f64,
                    "nights": per_city,
                    "rooms": rooms,
                    "totalPrice": total,
                    "rating": 3.5 + ((s >> (i * 4)) % 15) as f64 / 10.0,
                }));
            }
            cheapest_total += city_min;
        }

        Ok(json!({
            "hotels": hotels,
            "cheapestTotal": cheapest_total,
            "nights": nights,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nights_from_dates() {
        let query = TripQuery {
            start_date: Some("2026-11-01".into()),
            end_date: Some("2026-11-08".into()),
            ..Default::default()
        };
        assert_eq!(nights(&query), 7);
        assert_eq!(nights(&TripQuery::default()), DEFAULT_NIGHTS);
    }
}
