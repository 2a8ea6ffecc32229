use once_cell::sync::Lazy;
use prometheus::{Encoder, Gauge, Histogram, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::Mutex;
use tokio::net::TcpListener;
use warp::Filter;

use crate::prober::ProbeOutcome;

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// Domains come from unauthenticated requests, so no series is keyed by them.
static LATENCY_GAUGE: Lazy<Gauge> = Lazy::new(|| {
    let opts = Opts::new("probe_connect_latency_milliseconds_current", "Time until the last successful probe connected");
    let gauge = Gauge::with_opts(opts).unwrap();
    REGISTRY.register(Box::new(gauge.clone())).unwrap();
    gauge
});

static OUTCOME_COUNTER: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("probe_outcome_total", "Total number of probes by outcome");
    let ctr = IntCounterVec::new(opts, &["outcome"]).unwrap();
    REGISTRY.register(Box::new(ctr.clone())).unwrap();
    ctr
});

// Only populated when latency history is enabled
static HISTOGRAM_INSTANCE: Lazy<Mutex<Option<Histogram>>> = Lazy::new(|| Mutex::new(None));

pub fn initialize_metrics(enable_latency_history: bool) {
    if enable_latency_history {
        let opts = Opts::new("probe_connect_latency_milliseconds", "Time until a probe connected");
        let hist = Histogram::with_opts(prometheus::HistogramOpts {
            common_opts: opts,
            buckets: vec![
                1.0, 5.0, 10.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2000.0, 5000.0, 10000.0, 15000.0,
            ],
        })
        .expect("creating histogram");

        REGISTRY.register(Box::new(hist.clone())).unwrap();

        if let Ok(mut guard) = HISTOGRAM_INSTANCE.lock() {
            *guard = Some(hist);
        }
    }
}

pub async fn serve_metrics(listener: TcpListener) {
    let metrics_route = warp::path!("metrics").map(move || {
        let encoder = TextEncoder::new();
        let mut buf = Vec::new();
        if let Err(e) = encoder.encode(&gather(), &mut buf) {
            tracing::error!("encoding metrics failed: {:?}", e);
        }
        warp::http::Response::builder()
            .header("Content-Type", encoder.format_type())
            .body(buf)
    });

    warp::serve(metrics_route).incoming(listener).run().await;
}

fn gather() -> Vec<prometheus::proto::MetricFamily> {
    // touch the lazies so empty series still show up
    Lazy::force(&LATENCY_GAUGE);
    Lazy::force(&OUTCOME_COUNTER);
    REGISTRY.gather()
}

/// Record a finished probe. `elapsed_ms` is only meaningful for connected probes.
pub fn observe_outcome(outcome: &ProbeOutcome, elapsed_ms: f64) {
    OUTCOME_COUNTER.with_label_values(&[outcome.label()]).inc();

    if let ProbeOutcome::Connected { .. } = outcome {
        LATENCY_GAUGE.set(elapsed_ms);

        if let Ok(guard) = HISTOGRAM_INSTANCE.lock() {
            if let Some(ref hist) = *guard {
                hist.observe(elapsed_ms);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prober::ProbeError;

    fn exposition() -> String {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&gather(), &mut buf).unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn counts_outcomes_without_per_domain_series() {
        let before = OUTCOME_COUNTER.with_label_values(&["failed"]).get();
        for domain in ["one.metrics.example", "two.metrics.example"] {
            let failed = ProbeOutcome::Failed {
                domain: domain.into(),
                port: 443,
                reason: ProbeError::InvalidQueryType("ZZZ".into()),
            };
            observe_outcome(&failed, 0.0);
        }

        // other tests may bump the same counter concurrently
        assert!(OUTCOME_COUNTER.with_label_values(&["failed"]).get() >= before + 2);
        let text = exposition();
        assert!(!text.contains("metrics.example"));
        assert!(!text.contains("target="));
    }

    #[test]
    fn connected_sets_unlabelled_latency_gauge() {
        let connected = ProbeOutcome::Connected {
            domain: "gauge.metrics.example".into(),
            port: 8443,
        };
        observe_outcome(&connected, 12.5);

        // server tests record connected outcomes in parallel, so only the unlabelled shape is stable
        let text = exposition();
        assert!(text.contains("\nprobe_connect_latency_milliseconds_current "));
        assert!(!text.contains("gauge.metrics.example"));
    }
}
