//! Metrics & Monitoring
//!
//! The orchestrator reports each finished request as an [`OrchestrationEvent`]
//! on a bounded channel. A collector task folds events into counters and a
//! rolling latency window, and logs one structured line per request.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::analyzer::Intent;
use crate::planner::Strategy;

/// One finished request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestEvent {
    pub request_id: String,
    pub intent: Option<Intent>,
    pub strategy: Option<Strategy>,
    pub response_time_ms: u64,
    pub success: bool,
    pub cache_hit: bool,
    pub degraded: bool,
    pub providers_attempted: u32,
    pub providers_succeeded: u32,
    /// Error code when the request failed
    pub error_code: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestrationEvent {
    Request(RequestEvent),
    /// Admission refused before analysis
    Rejected { request_id: String, code: String },
}

/// Non-blocking sender half
#[derive(Clone)]
pub struct MetricsSink {
    tx: mpsc::Sender<OrchestrationEvent>,
}

impl MetricsSink {
    /// Never waits; a full channel drops the event
    pub fn emit(&self, event: OrchestrationEvent) {
        if let Err(e) = self.tx.try_send(event) {
            debug!("Metrics event dropped: {}", e);
        }
    }
}

/// Latency percentiles over the rolling window
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LatencyStats {
    pub p50_ms: u64,
    pub p90_ms: u64,
    pub p99_ms: u64,
    pub max_ms: u64,
    pub min_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub rejected: u64,
    pub degraded: u64,
    pub cache_hits: u64,
    /// Percent of requests answered from the result cache
    pub cache_hit_rate: f64,
    /// Percent of attempted provider steps that succeeded
    pub provider_success_rate: f64,
    pub avg_response_time_ms: f64,
    pub latency: LatencyStats,
    pub by_intent: HashMap<String, u64>,
    pub by_strategy: HashMap<String, u64>,
}

#[derive(Debug, Default)]
struct Totals {
    snapshot: MetricsSnapshot,
    providers_attempted: u64,
    providers_succeeded: u64,
    total_latency_ms: u64,
    latencies: VecDeque<u64>,
}

/// Folds events into aggregate metrics
#[derive(Clone)]
pub struct MetricsCollector {
    totals: Arc<RwLock<Totals>>,
    max_history: usize,
}

impl MetricsCollector {
    pub fn new(max_history: usize) -> Self {
        Self {
            totals: Arc::new(RwLock::new(Totals::default())),
            max_history: max_history.max(1),
        }
    }

    /// Create a sink and spawn the task that drains it into this collector
    pub fn spawn(&self, capacity: usize) -> (MetricsSink, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel(capacity.max(1));
        let collector = self.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                collector.record(&event);
            }
            debug!("Metrics collector stopped");
        });
        (MetricsSink { tx }, handle)
    }

    pub fn record(&self, event: &OrchestrationEvent) {
        let mut totals = self.totals.write();
        match event {
            OrchestrationEvent::Rejected { request_id, code } => {
                totals.snapshot.rejected += 1;
                info!(request_id = %request_id, code = %code, "Request rejected");
            }
            OrchestrationEvent::Request(e) => {
                totals.snapshot.total_requests += 1;
                if e.success {
                    totals.snapshot.successes += 1;
                } else {
                    totals.snapshot.failures += 1;
                }
                if e.degraded {
                    totals.snapshot.degraded += 1;
                }
                if e.cache_hit {
                    totals.snapshot.cache_hits += 1;
                }
                if let Some(intent) = e.intent {
                    *totals.snapshot.by_intent.entry(intent.as_str().to_string()).or_default() += 1;
                }
                if let Some(strategy) = e.strategy {
                    *totals
                        .snapshot
                        .by_strategy
                        .entry(strategy.as_str().to_string())
                        .or_default() += 1;
                }

                totals.providers_attempted += e.providers_attempted as u64;
                totals.providers_succeeded += e.providers_succeeded as u64;
                totals.total_latency_ms += e.response_time_ms;
                totals.latencies.push_back(e.response_time_ms);
                while totals.latencies.len() > self.max_history {
                    totals.latencies.pop_front();
                }

                let total = totals.snapshot.total_requests as f64;
                totals.snapshot.cache_hit_rate = totals.snapshot.cache_hits as f64 / total * 100.0;
                totals.snapshot.avg_response_time_ms = totals.total_latency_ms as f64 / total;
                totals.snapshot.provider_success_rate = if totals.providers_attempted > 0 {
                    totals.providers_succeeded as f64 / totals.providers_attempted as f64 * 100.0
                } else {
                    0.0
                };

                info!(
                    request_id = %e.request_id,
                    intent = e.intent.map(|i| i.as_str()).unwrap_or("none"),
                    strategy = e.strategy.map(|s| s.as_str()).unwrap_or("none"),
                    response_time_ms = e.response_time_ms,
                    success = e.success,
                    cache_hit = e.cache_hit,
                    cache_hit_rate = totals.snapshot.cache_hit_rate,
                    provider_success_rate = totals.snapshot.provider_success_rate,
                    "Request completed"
                );
            }
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let totals = self.totals.read();
        let mut snapshot = totals.snapshot.clone();
        snapshot.latency = latency_stats(&totals.latencies);
        snapshot
    }

    pub fn reset(&self) {
        *self.totals.write() = Totals::default();
        info!("Metrics reset");
    }
}

fn latency_stats(window: &VecDeque<u64>) -> LatencyStats {
    if window.is_empty() {
        return LatencyStats::default();
    }

    let mut latencies: Vec<u64> = window.iter().copied().collect();
    latencies.sort_unstable();

    let len = latencies.len();
    LatencyStats {
        p50_ms: latencies.get(len / 2).copied().unwrap_or(0),
        p90_ms: latencies.get(len * 90 / 100).copied().unwrap_or(0),
        p99_ms: latencies.get(len * 99 / 100).copied().unwrap_or(0),
        max_ms: latencies.last().copied().unwrap_or(0),
        min_ms: latencies.first().copied().unwrap_or(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(ms: u64, success: bool, cache_hit: bool) -> OrchestrationEvent {
        OrchestrationEvent::Request(RequestEvent {
            request_id: "r".into(),
            intent: Some(Intent::FullTrip),
            strategy: Some(Strategy::Parallel),
            response_time_ms: ms,
            success,
            cache_hit,
            degraded: false,
            providers_attempted: 4,
            providers_succeeded: if success { 4 } else { 1 },
            error_code: None,
        })
    }

    #[test]
    fn test_record_aggregates() {
        let collector = MetricsCollector::new(100);
        collector.record(&event(100, true, false));
        collector.record(&event(300, true, true));
        collector.record(&event(200, false, false));
        collector.record(&OrchestrationEvent::Rejected {
            request_id: "x".into(),
            code: "validation_error".into(),
        });

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.total_requests, 3);
        assert_eq!(snapshot.successes, 2);
        assert_eq!(snapshot.rejected, 1);
        assert!((snapshot.cache_hit_rate - 33.333).abs() < 0.01);
        assert_eq!(snapshot.avg_response_time_ms, 200.0);
        assert_eq!(snapshot.provider_success_rate, 75.0);
        assert_eq!(snapshot.by_intent["full_trip"], 3);
        assert_eq!(snapshot.latency.max_ms, 300);
        assert_eq!(snapshot.latency.min_ms, 100);
    }

    #[test]
    fn test_latency_window_bounded() {
        let collector = MetricsCollector::new(2);
        collector.record(&event(1000, true, false));
        collector.record(&event(10, true, false));
        collector.record(&event(20, true, false));
        assert_eq!(collector.snapshot().latency.max_ms, 20);
    }

    #[tokio::test]
    async fn test_sink_feeds_collector() {
        let collector = MetricsCollector::new(10);
        let (sink, handle) = collector.spawn(8);
        sink.emit(event(50, true, false));
        drop(sink);
        handle.await.unwrap();
        assert_eq!(collector.snapshot().total_requests, 1);
    }
}
