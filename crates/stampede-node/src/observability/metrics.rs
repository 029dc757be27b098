//! Prometheus metrics collection.
//!
//! Tracks how requests were served (leader, follower, bypass), how often
//! the wrapped handler actually ran, and how many executions are in flight.

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;
use std::sync::Arc;

/// Coalescing role labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RoleLabels {
    /// `leader`, `follower` or `bypass`
    pub role: String,
}

/// Global metrics state.
pub static METRICS: Lazy<MetricsState> = Lazy::new(MetricsState::new);

/// Metrics state container.
#[derive(Clone)]
pub struct MetricsState {
    /// Prometheus registry.
    pub registry: Arc<RwLock<Registry>>,
    /// Requests by coalescing role.
    pub requests_total: Family<RoleLabels, Counter>,
    /// Times the wrapped handler actually ran.
    pub handler_invocations_total: Counter,
    /// Handler executions currently running.
    pub in_flight: Gauge,
    /// Request duration by coalescing role (seconds).
    pub request_duration_seconds: Family<RoleLabels, Histogram>,
}

impl Default for MetricsState {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsState {
    /// Create a new metrics state with all metrics registered.
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let requests_total = Family::<RoleLabels, Counter>::default();
        registry.register(
            "stampede_requests",
            "Total requests by coalescing role",
            requests_total.clone(),
        );

        let handler_invocations_total = Counter::default();
        registry.register(
            "stampede_handler_invocations",
            "Total executions of the wrapped handler",
            handler_invocations_total.clone(),
        );

        let in_flight = Gauge::default();
        registry.register(
            "stampede_in_flight",
            "Handler executions currently running",
            in_flight.clone(),
        );

        let request_duration_seconds =
            Family::<RoleLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.001, 2.0, 16))
            });
        registry.register(
            "stampede_request_duration_seconds",
            "Request duration by coalescing role in seconds",
            request_duration_seconds.clone(),
        );

        Self {
            registry: Arc::new(RwLock::new(registry)),
            requests_total,
            handler_invocations_total,
            in_flight,
            request_duration_seconds,
        }
    }

    /// Record a served request.
    pub fn record_request(&self, role: &str, duration_secs: f64) {
        let labels = RoleLabels {
            role: role.to_string(),
        };

        self.requests_total.get_or_create(&labels).inc();
        self.request_duration_seconds
            .get_or_create(&labels)
            .observe(duration_secs);
    }

    /// Record one execution of the wrapped handler.
    pub fn record_invocation(&self) {
        self.handler_invocations_total.inc();
    }

    /// Counts a handler execution in the in-flight gauge until the guard
    /// is dropped.
    pub fn track_execution(&self) -> ExecutionGuard {
        self.in_flight.inc();
        ExecutionGuard {
            in_flight: self.in_flight.clone(),
        }
    }

    /// Encode metrics for Prometheus scraping.
    ///
    /// # Errors
    ///
    /// Returns the formatter error if encoding fails.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        let registry = self.registry.read();
        prometheus_client::encoding::text::encode(&mut buffer, &registry)?;
        Ok(buffer)
    }
}

/// Keeps one execution counted in `stampede_in_flight`.
#[must_use = "the execution stops being counted when the guard is dropped"]
#[derive(Debug)]
pub struct ExecutionGuard {
    in_flight: Gauge,
}

impl Drop for ExecutionGuard {
    fn drop(&mut self) {
        self.in_flight.dec();
    }
}
