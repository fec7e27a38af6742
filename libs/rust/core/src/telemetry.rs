//! Logging setup and federation counters.

use once_cell::sync::{Lazy, OnceCell};
use opentelemetry::metrics::{Counter, Histogram, Meter};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{FedError, Result};

static TRACING_INIT: OnceCell<()> = OnceCell::new();

/// Install the global subscriber once. `RUST_LOG` filters (default `info`);
/// `FEDSIM_JSON_LOG=1` switches to flattened JSON events.
pub fn init_tracing(service: &str) -> Result<()> {
    TRACING_INIT.get_or_try_init(|| {
        let json = std::env::var("FEDSIM_JSON_LOG").ok().map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false);
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let registry = tracing_subscriber::registry().with(env_filter);
        let res = if json {
            registry.with(fmt::layer().json().flatten_event(true).with_current_span(true).with_span_list(false)).try_init()
        } else {
            registry.with(fmt::layer().with_target(true).with_thread_ids(false).with_line_number(true)).try_init()
        };
        res.map_err(|e| FedError::config(format!("tracing init failed: {e}")))
    })?;
    info!(service, "tracing_initialized");
    Ok(())
}

pub struct FedMetrics {
    pub rounds_total: Counter<u64>,
    pub participants_total: Counter<u64>,
    pub failed_clients_total: Counter<u64>,
    pub degenerate_rounds_total: Counter<u64>,
    pub aggregation_latency_ms: Histogram<f64>,
}

static FED_METER: Lazy<Meter> = Lazy::new(|| opentelemetry::global::meter("fedsim"));

pub static FED_METRICS: Lazy<FedMetrics> = Lazy::new(|| FedMetrics {
    rounds_total: FED_METER.u64_counter("fedsim_rounds_total").with_description("Rounds that produced a new global model").build(),
    participants_total: FED_METER.u64_counter("fedsim_participants_total").with_description("Client updates folded into the global model").build(),
    failed_clients_total: FED_METER.u64_counter("fedsim_failed_clients_total").with_description("Selected clients dropped after a failed local step").build(),
    degenerate_rounds_total: FED_METER.u64_counter("fedsim_degenerate_rounds_total").with_description("Rounds where every selected client failed").build(),
    aggregation_latency_ms: FED_METER.f64_histogram("fedsim_aggregation_latency_ms").with_description("FedAvg aggregation latency ms").with_unit("ms").build(),
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init_tracing("fedsim-test").unwrap();
        init_tracing("fedsim-test").unwrap();
        FED_METRICS.rounds_total.add(1, &[]);
    }
}
