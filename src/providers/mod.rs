//! Built-in providers
//!
//! Deterministic stand-ins for the supplier integrations. Prices and names are
//! derived from a hash of the query so repeated calls agree with each other.

mod budget;
mod conversation;
mod flight;
mod hotel;
mod itinerary;

pub use budget::BudgetAnalyzer;
pub use conversation::ConversationProvider;
pub use flight::FlightSearch;
pub use hotel::HotelSearch;
pub use itinerary::ItineraryGenerator;

use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::ProviderError;
use crate::registry::{CapabilityRegistry, RegistryError};

/// Register every built-in provider
pub fn register_defaults(registry: &CapabilityRegistry) -> Result<(), RegistryError> {
    registry.register(Arc::new(FlightSearch::default()))?;
    registry.register(Arc::new(HotelSearch::default()))?;
    registry.register(Arc::new(ItineraryGenerator::default()))?;
    registry.register(Arc::new(BudgetAnalyzer::default()))?;
    registry.register(Arc::new(ConversationProvider))?;
    Ok(())
}

/// Stable pseudo-random number for a query
pub(crate) fn seed(parts: &[&str]) -> u64 {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.to_lowercase().as_bytes());
        hasher.update(b"|");
    }
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

/// Simulated supplier latency that honours step cancellation
pub(crate) async fn simulate_latency(
    latency: Duration,
    cancel: &CancellationToken,
) -> Result<(), ProviderError> {
    if latency.is_zero() {
        return Ok(());
    }
    tokio::select! {
        _ = tokio::time::sleep(latency) => Ok(()),
        _ = cancel.cancelled() => Err(ProviderError::Cancelled),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_defaults() {
        let registry = CapabilityRegistry::new();
        register_defaults(&registry).unwrap();
        assert_eq!(registry.len(), 5);
        for capability in [
            "flight_search",
            "hotel_search",
            "itinerary_generator",
            "budget_analyzer",
            "conversation",
        ] {
            assert!(registry.provider_for(capability).is_some(), "{}", capability);
        }
        assert!(registry.provider_for("booking_manager").is_none());
    }

    #[test]
    fn test_seed_is_stable() {
        assert_eq!(seed(&["Tokyo", "2"]), seed(&["tokyo", "2"]));
        assert_ne!(seed(&["Tokyo"]), seed(&["Osaka"]));
    }
}
