//! Process-wide metrics registry
//!
//! Deduplicated counters/gauges/histograms with label sets, exposed over HTTP
//! in the Prometheus text format. Re-registration with the same schema is
//! idempotent and returns the identical instrument; an incompatible schema is
//! a `schema-mismatch` error. The registry never panics.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use prometheus::{
    Encoder, GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{error, info, warn};

use crate::error::{OrchestratorError, Result};

/// Instrument kinds supported by the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstrumentKind {
    Counter,
    Gauge,
    Histogram,
}

impl InstrumentKind {
    fn as_str(&self) -> &'static str {
        match self {
            InstrumentKind::Counter => "counter",
            InstrumentKind::Gauge => "gauge",
            InstrumentKind::Histogram => "histogram",
        }
    }
}

/// A handle to a registered instrument. Clones share the same underlying
/// time series.
#[derive(Clone)]
pub enum Instrument {
    Counter(IntCounterVec),
    Gauge(GaugeVec),
    Histogram(HistogramVec),
}

impl Instrument {
    pub fn kind(&self) -> InstrumentKind {
        match self {
            Instrument::Counter(_) => InstrumentKind::Counter,
            Instrument::Gauge(_) => InstrumentKind::Gauge,
            Instrument::Histogram(_) => InstrumentKind::Histogram,
        }
    }

    pub fn as_counter(&self) -> Option<&IntCounterVec> {
        match self {
            Instrument::Counter(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_gauge(&self) -> Option<&GaugeVec> {
        match self {
            Instrument::Gauge(g) => Some(g),
            _ => None,
        }
    }

    pub fn as_histogram(&self) -> Option<&HistogramVec> {
        match self {
            Instrument::Histogram(h) => Some(h),
            _ => None,
        }
    }
}

struct Registered {
    instrument: Instrument,
    labels: Vec<String>,
}

/// Centralized, deduplicating metrics registry. Clones share the same
/// instrument table and listener state.
#[derive(Clone)]
pub struct MetricsRegistry {
    registry: Registry,
    instruments: Arc<DashMap<String, Registered>>,
    server_started: Arc<AtomicBool>,
}

impl MetricsRegistry {
    pub fn new() -> Arc<Self> {
        let registry = Registry::new();

        // Process start marker, required by the exposition contract
        let start = GaugeVec::new(
            Opts::new(
                "process_start_time_seconds",
                "Start time of the process since unix epoch in seconds",
            ),
            &[],
        )
        .expect("static instrument definition");
        let epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        start.with_label_values(&[]).set(epoch);
        if let Err(e) = registry.register(Box::new(start.clone())) {
            warn!(error = %e, "Failed to register process start gauge");
        }

        let instruments = DashMap::new();
        instruments.insert(
            "process_start_time_seconds".to_string(),
            Registered {
                instrument: Instrument::Gauge(start),
                labels: Vec::new(),
            },
        );

        Arc::new(Self {
            registry,
            instruments: Arc::new(instruments),
            server_started: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Get an existing instrument or create it.
    ///
    /// Idempotent for a matching (kind, labels) schema; incompatible
    /// re-registration fails without touching the existing instrument.
    pub fn get_or_create(
        &self,
        kind: InstrumentKind,
        name: &str,
        labels: &[&str],
        help: &str,
    ) -> Result<Instrument> {
        self.get_or_create_inner(kind, name, labels, help, None)
    }

    /// Histogram variant with explicit bucket boundaries
    pub fn get_or_create_histogram(
        &self,
        name: &str,
        labels: &[&str],
        help: &str,
        buckets: Vec<f64>,
    ) -> Result<HistogramVec> {
        let instrument =
            self.get_or_create_inner(InstrumentKind::Histogram, name, labels, help, Some(buckets))?;
        match instrument {
            Instrument::Histogram(h) => Ok(h),
            _ => unreachable!("histogram requested"),
        }
    }

    fn get_or_create_inner(
        &self,
        kind: InstrumentKind,
        name: &str,
        labels: &[&str],
        help: &str,
        buckets: Option<Vec<f64>>,
    ) -> Result<Instrument> {
        match self.instruments.entry(name.to_string()) {
            Entry::Occupied(existing) => {
                let registered = existing.get();
                if registered.instrument.kind() != kind {
                    return Err(OrchestratorError::SchemaMismatch {
                        name: name.to_string(),
                        detail: format!(
                            "registered as {}, requested {}",
                            registered.instrument.kind().as_str(),
                            kind.as_str()
                        ),
                    });
                }
                if registered.labels != labels {
                    return Err(OrchestratorError::SchemaMismatch {
                        name: name.to_string(),
                        detail: format!(
                            "registered labels {:?}, requested {:?}",
                            registered.labels, labels
                        ),
                    });
                }
                Ok(registered.instrument.clone())
            }
            Entry::Vacant(slot) => {
                let instrument = self.build_instrument(kind, name, labels, help, buckets)?;
                self.registry
                    .register(collector_for(&instrument))
                    .map_err(|e| OrchestratorError::SchemaMismatch {
                        name: name.to_string(),
                        detail: e.to_string(),
                    })?;
                slot.insert(Registered {
                    instrument: instrument.clone(),
                    labels: labels.iter().map(|l| l.to_string()).collect(),
                });
                Ok(instrument)
            }
        }
    }

    fn build_instrument(
        &self,
        kind: InstrumentKind,
        name: &str,
        labels: &[&str],
        help: &str,
        buckets: Option<Vec<f64>>,
    ) -> Result<Instrument> {
        let bad = |e: prometheus::Error| OrchestratorError::SchemaMismatch {
            name: name.to_string(),
            detail: e.to_string(),
        };
        let instrument = match kind {
            InstrumentKind::Counter => {
                Instrument::Counter(IntCounterVec::new(Opts::new(name, help), labels).map_err(bad)?)
            }
            InstrumentKind::Gauge => {
                Instrument::Gauge(GaugeVec::new(Opts::new(name, help), labels).map_err(bad)?)
            }
            InstrumentKind::Histogram => {
                let mut opts = HistogramOpts::new(name, help);
                if let Some(buckets) = buckets {
                    opts = opts.buckets(buckets);
                }
                Instrument::Histogram(HistogramVec::new(opts, labels).map_err(bad)?)
            }
        };
        Ok(instrument)
    }

    /// Render the current snapshot in the text exposition format
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            error!(error = %e, "Failed to encode metrics");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }

    /// Start the background HTTP listener serving `GET /metrics`.
    ///
    /// A second start attempt is a no-op, not an error.
    pub fn serve(&self, addr: SocketAddr) {
        if self
            .server_started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            info!(metrics_addr = %addr, "Metrics server already running");
            return;
        }

        let registry = self.clone();
        tokio::spawn(async move {
            let app = axum::Router::new().route(
                "/metrics",
                axum::routing::get(move || {
                    let registry = registry.clone();
                    async move {
                        (
                            [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
                            registry.render(),
                        )
                    }
                }),
            );
            match tokio::net::TcpListener::bind(addr).await {
                Ok(listener) => {
                    info!(metrics_addr = %addr, "Metrics server started");
                    if let Err(e) = axum::serve(listener, app).await {
                        error!(error = %e, "Metrics server error");
                    }
                }
                Err(e) => error!(metrics_addr = %addr, error = %e, "Failed to bind metrics server"),
            }
        });
    }
}

fn collector_for(instrument: &Instrument) -> Box<dyn prometheus::core::Collector> {
    match instrument {
        Instrument::Counter(c) => Box::new(c.clone()),
        Instrument::Gauge(g) => Box::new(g.clone()),
        Instrument::Histogram(h) => Box::new(h.clone()),
    }
}

/// Pre-registered instrument set of the orchestrator
#[derive(Clone)]
pub struct OrchestratorMetrics {
    pub vnf_instances_total: GaugeVec,
    pub vnf_cpu_usage: GaugeVec,
    pub vnf_memory_usage: GaugeVec,
    pub vnf_processing_latency: HistogramVec,
    pub scaling_actions_total: IntCounterVec,
    pub forecast_accuracy: HistogramVec,
    pub sfc_requests_total: IntCounterVec,
    pub drl_episode_reward: GaugeVec,
}

const LATENCY_BUCKETS_MS: &[f64] = &[
    1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0,
];

const ACCURACY_BUCKETS: &[f64] = &[0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8, 0.9, 0.95, 1.0];

impl OrchestratorMetrics {
    pub fn register(registry: &MetricsRegistry) -> Result<Self> {
        let gauge = |name: &str, labels: &[&str], help: &str| -> Result<GaugeVec> {
            Ok(registry
                .get_or_create(InstrumentKind::Gauge, name, labels, help)?
                .as_gauge()
                .cloned()
                .expect("gauge requested"))
        };
        let counter = |name: &str, labels: &[&str], help: &str| -> Result<IntCounterVec> {
            Ok(registry
                .get_or_create(InstrumentKind::Counter, name, labels, help)?
                .as_counter()
                .cloned()
                .expect("counter requested"))
        };

        Ok(Self {
            vnf_instances_total: gauge(
                "vnf_instances_total",
                &["vnf_type"],
                "Running VNF instances per type",
            )?,
            vnf_cpu_usage: gauge(
                "vnf_cpu_usage",
                &["vnf_type", "instance_id"],
                "CPU usage percent per VNF instance",
            )?,
            vnf_memory_usage: gauge(
                "vnf_memory_usage",
                &["vnf_type", "instance_id"],
                "Memory usage percent per VNF instance",
            )?,
            vnf_processing_latency: registry.get_or_create_histogram(
                "vnf_processing_latency",
                &["vnf_type", "instance_id"],
                "Processing latency per VNF instance in milliseconds",
                LATENCY_BUCKETS_MS.to_vec(),
            )?,
            scaling_actions_total: counter(
                "scaling_actions_total",
                &["vnf_type", "action"],
                "Scaling actions by type and outcome",
            )?,
            forecast_accuracy: registry.get_or_create_histogram(
                "forecast_accuracy",
                &["vnf_type", "metric"],
                "One-step-ahead forecast accuracy",
                ACCURACY_BUCKETS.to_vec(),
            )?,
            sfc_requests_total: counter(
                "sfc_requests_total",
                &["outcome"],
                "Chain requests by outcome",
            )?,
            drl_episode_reward: gauge(
                "drl_episode_reward",
                &[],
                "Cumulative reward of the last learning episode",
            )?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idempotent_registration() {
        let registry = MetricsRegistry::new();
        let first = registry
            .get_or_create(InstrumentKind::Counter, "a", &["type"], "test counter")
            .unwrap();
        let second = registry
            .get_or_create(InstrumentKind::Counter, "a", &["type"], "test counter")
            .unwrap();

        first.as_counter().unwrap().with_label_values(&["x"]).inc();
        second.as_counter().unwrap().with_label_values(&["x"]).inc();

        // Both handles address the same series
        let rendered = registry.render();
        assert!(rendered.contains("a{type=\"x\"} 2"));
    }

    #[test]
    fn test_schema_mismatch_rejected() {
        let registry = MetricsRegistry::new();
        registry
            .get_or_create(InstrumentKind::Counter, "b", &["type"], "test")
            .unwrap();

        let wrong_kind = registry.get_or_create(InstrumentKind::Gauge, "b", &["type"], "test");
        assert!(matches!(
            wrong_kind,
            Err(OrchestratorError::SchemaMismatch { .. })
        ));

        let wrong_labels =
            registry.get_or_create(InstrumentKind::Counter, "b", &["type", "zone"], "test");
        assert!(matches!(
            wrong_labels,
            Err(OrchestratorError::SchemaMismatch { .. })
        ));
    }

    #[test]
    fn test_exposition_lists_each_label_set_once() {
        let registry = MetricsRegistry::new();
        let counter = registry
            .get_or_create(InstrumentKind::Counter, "c", &["type"], "test")
            .unwrap();
        let handle = counter.as_counter().unwrap();
        handle.with_label_values(&["x"]).inc_by(3);
        handle.with_label_values(&["y"]).inc_by(3);

        let rendered = registry.render();
        assert!(rendered.contains("c{type=\"x\"} 3"));
        assert!(rendered.contains("c{type=\"y\"} 3"));
        assert!(rendered.contains("process_start_time_seconds"));
        assert_eq!(rendered.matches("\nc{").count(), 2);
    }

    #[test]
    fn test_orchestrator_metrics_register_twice() {
        let registry = MetricsRegistry::new();
        let first = OrchestratorMetrics::register(&registry).unwrap();
        let second = OrchestratorMetrics::register(&registry).unwrap();

        first
            .scaling_actions_total
            .with_label_values(&["firewall", "out"])
            .inc();
        second
            .scaling_actions_total
            .with_label_values(&["firewall", "out"])
            .inc();

        let rendered = registry.render();
        assert!(rendered.contains("scaling_actions_total{action=\"out\",vnf_type=\"firewall\"} 2"));
    }
}
