use lazy_static::lazy_static;
use prometheus::core::Collector;
use prometheus::{
    CounterVec, Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    Registry, TextEncoder,
};
use std::sync::OnceLock;
use tracing::warn;

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
}
static ACTIVE_SESSIONS: OnceLock<IntGauge> = OnceLock::new();
static QUEUE_DEPTH: OnceLock<IntGauge> = OnceLock::new();
static ITEMS_ENQUEUED: OnceLock<IntCounterVec> = OnceLock::new();
static PIPELINE_RUNS: OnceLock<IntCounterVec> = OnceLock::new();
static STAGE_LATENCY: OnceLock<HistogramVec> = OnceLock::new();
static PARSE_OUTCOMES: OnceLock<IntCounterVec> = OnceLock::new();
static VECTOR_SYNC: OnceLock<IntCounterVec> = OnceLock::new();
static BREAKER_OPENS: OnceLock<IntCounter> = OnceLock::new();
static QUERIES_KILLED: OnceLock<IntCounter> = OnceLock::new();
static MODEL_TOKENS: OnceLock<IntCounterVec> = OnceLock::new();
static MODEL_COST: OnceLock<CounterVec> = OnceLock::new();
static MODEL_LATENCY: OnceLock<HistogramVec> = OnceLock::new();

fn register<M>(cell: &OnceLock<M>, metric: prometheus::Result<M>)
where
    M: Collector + Clone + 'static,
{
    match metric {
        Ok(metric) => {
            if cell.set(metric.clone()).is_ok() {
                REGISTRY.register(Box::new(metric)).ok();
            }
        }
        Err(e) => warn!("Failed to create metric: {}", e),
    }
}

pub fn init_metrics() {
    register(
        &ACTIVE_SESSIONS,
        IntGauge::new("worker_active_sessions", "Sessions with a running consumer"),
    );
    register(
        &QUEUE_DEPTH,
        IntGauge::new("worker_queue_depth", "Queue items pending or processing"),
    );
    register(
        &ITEMS_ENQUEUED,
        IntCounterVec::new(
            prometheus::opts!("worker_items_enqueued_total", "Queue items accepted"),
            &["kind"],
        ),
    );
    register(
        &PIPELINE_RUNS,
        IntCounterVec::new(
            prometheus::opts!("worker_pipeline_runs_total", "Pipeline executions by outcome"),
            &["status"],
        ),
    );
    register(
        &STAGE_LATENCY,
        HistogramVec::new(
            HistogramOpts::new("worker_stage_duration_seconds", "Time spent per pipeline stage"),
            &["stage"],
        ),
    );
    register(
        &PARSE_OUTCOMES,
        IntCounterVec::new(
            prometheus::opts!("worker_parse_outcomes_total", "Field extractions by outcome"),
            &["outcome"],
        ),
    );
    register(
        &VECTOR_SYNC,
        IntCounterVec::new(
            prometheus::opts!("worker_vector_sync_total", "Vector index writes by outcome"),
            &["outcome"],
        ),
    );
    register(
        &BREAKER_OPENS,
        IntCounter::new("worker_breaker_opens_total", "Times the vector sync breaker opened"),
    );
    register(
        &QUERIES_KILLED,
        IntCounter::new("worker_queries_killed_total", "Model subprocesses killed"),
    );
    register(
        &MODEL_TOKENS,
        IntCounterVec::new(
            prometheus::opts!("worker_model_tokens_total", "Tokens reported by the model"),
            &["model", "direction"],
        ),
    );
    register(
        &MODEL_COST,
        CounterVec::new(
            prometheus::opts!("worker_model_cost_usd_total", "Model spend in USD"),
            &["model"],
        ),
    );
    register(
        &MODEL_LATENCY,
        HistogramVec::new(
            HistogramOpts::new("worker_model_call_seconds", "Wall-clock time per model call")
                .buckets(vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]),
            &["model"],
        ),
    );
}

pub fn set_active_sessions(count: i64) {
    if let Some(gauge) = ACTIVE_SESSIONS.get() {
        gauge.set(count);
    }
}

pub fn set_queue_depth(depth: i64) {
    if let Some(gauge) = QUEUE_DEPTH.get() {
        gauge.set(depth);
    }
}

pub fn inc_enqueued(kind: &str) {
    if let Some(counter) = ITEMS_ENQUEUED.get() {
        counter.with_label_values(&[kind]).inc();
    }
}

pub fn inc_pipeline_run(status: &str) {
    if let Some(counter) = PIPELINE_RUNS.get() {
        counter.with_label_values(&[status]).inc();
    }
}

pub fn observe_stage(stage: &str, seconds: f64) {
    if let Some(histogram) = STAGE_LATENCY.get() {
        histogram.with_label_values(&[stage]).observe(seconds);
    }
}

pub fn inc_parse_outcome(outcome: &str) {
    if let Some(counter) = PARSE_OUTCOMES.get() {
        counter.with_label_values(&[outcome]).inc();
    }
}

pub fn inc_vector_sync(outcome: &str) {
    if let Some(counter) = VECTOR_SYNC.get() {
        counter.with_label_values(&[outcome]).inc();
    }
}

pub fn inc_breaker_open() {
    if let Some(counter) = BREAKER_OPENS.get() {
        counter.inc();
    }
}

pub fn inc_query_killed() {
    if let Some(counter) = QUERIES_KILLED.get() {
        counter.inc();
    }
}

pub fn observe_model_call(
    model: &str,
    input_tokens: u64,
    output_tokens: u64,
    cost_usd: f64,
    seconds: f64,
) {
    if let Some(counter) = MODEL_TOKENS.get() {
        counter.with_label_values(&[model, "input"]).inc_by(input_tokens);
        counter.with_label_values(&[model, "output"]).inc_by(output_tokens);
    }
    if let Some(counter) = MODEL_COST.get() {
        if cost_usd > 0.0 {
            counter.with_label_values(&[model]).inc_by(cost_usd);
        }
    }
    if let Some(histogram) = MODEL_LATENCY.get() {
        histogram.with_label_values(&[model]).observe(seconds);
    }
}

/// Prometheus text exposition of everything registered.
pub fn gather_text() -> anyhow::Result<Vec<u8>> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_render_after_init() {
        init_metrics();
        init_metrics();
        inc_enqueued("observation");
        set_queue_depth(4);

        let text = String::from_utf8(gather_text().unwrap()).unwrap();
        assert!(text.contains("worker_items_enqueued_total"));
        assert!(text.contains("worker_queue_depth"));
    }
}
