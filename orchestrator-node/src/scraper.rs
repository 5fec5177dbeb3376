//! Metrics scraper
//!
//! Periodically pulls per-instance counters through the instance driver's
//! scrape hook, updates the registry gauges, and appends per-type aggregates
//! into bounded ring buffers consumed by the forecaster and the scaling
//! controller.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time;
use tracing::{debug, instrument, warn};

use crate::config::ScraperConfig;
use crate::driver::InstanceDriver;
use crate::registry::OrchestratorMetrics;
use crate::types::{Aggregates, InstanceState, MetricKind, VnfType};

/// Bounded ring buffer of (timestamp, value) samples
#[derive(Debug)]
pub struct MetricSeries {
    window: usize,
    samples: VecDeque<(DateTime<Utc>, f64)>,
    total: u64,
}

impl MetricSeries {
    pub fn new(window: usize) -> Self {
        Self {
            window,
            samples: VecDeque::with_capacity(window),
            total: 0,
        }
    }

    /// Append a sample. Timestamps must be monotonic; a stale timestamp is
    /// dropped so a missed scrape cannot corrupt the series.
    pub fn push(&mut self, timestamp: DateTime<Utc>, value: f64) {
        if let Some((last, _)) = self.samples.back() {
            if timestamp <= *last {
                return;
            }
        }
        self.samples.push_back((timestamp, value));
        self.total += 1;
        while self.samples.len() > self.window {
            self.samples.pop_front();
        }
    }

    /// Samples ever accepted, including those already rotated out
    pub fn total_recorded(&self) -> u64 {
        self.total
    }

    pub fn values(&self) -> Vec<f64> {
        self.samples.iter().map(|(_, v)| *v).collect()
    }

    pub fn latest(&self) -> Option<f64> {
        self.samples.back().map(|(_, v)| *v)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Per-(type, metric) metric history owned by the scraper
pub struct HistoryStore {
    window: usize,
    series: DashMap<(VnfType, MetricKind), Mutex<MetricSeries>>,
    latest_aggregates: DashMap<VnfType, Aggregates>,
}

impl HistoryStore {
    pub fn new(window: usize) -> Arc<Self> {
        Arc::new(Self {
            window,
            series: DashMap::new(),
            latest_aggregates: DashMap::new(),
        })
    }

    pub fn record(&self, vnf: VnfType, metric: MetricKind, timestamp: DateTime<Utc>, value: f64) {
        let entry = self
            .series
            .entry((vnf, metric))
            .or_insert_with(|| Mutex::new(MetricSeries::new(self.window)));
        if let Ok(mut series) = entry.lock() {
            series.push(timestamp, value);
        };
    }

    /// Snapshot of the series values, oldest first
    pub fn values(&self, vnf: VnfType, metric: MetricKind) -> Vec<f64> {
        self.series
            .get(&(vnf, metric))
            .and_then(|entry| entry.lock().ok().map(|s| s.values()))
            .unwrap_or_default()
    }

    pub fn sample_count(&self, vnf: VnfType, metric: MetricKind) -> usize {
        self.series
            .get(&(vnf, metric))
            .and_then(|entry| entry.lock().ok().map(|s| s.len()))
            .unwrap_or(0)
    }

    /// Samples ever recorded for the series, including rotated-out ones
    pub fn total_recorded(&self, vnf: VnfType, metric: MetricKind) -> u64 {
        self.series
            .get(&(vnf, metric))
            .and_then(|entry| entry.lock().ok().map(|s| s.total_recorded()))
            .unwrap_or(0)
    }

    pub fn set_aggregates(&self, vnf: VnfType, aggregates: Aggregates) {
        self.latest_aggregates.insert(vnf, aggregates);
    }

    /// Most recent per-type aggregate, if any scrape has completed
    pub fn aggregates(&self, vnf: VnfType) -> Option<Aggregates> {
        self.latest_aggregates.get(&vnf).map(|a| *a)
    }
}

/// Periodic scraper task
pub struct MetricsScraper {
    driver: Arc<InstanceDriver>,
    history: Arc<HistoryStore>,
    metrics: OrchestratorMetrics,
    config: ScraperConfig,
    enabled_types: Vec<VnfType>,
}

impl MetricsScraper {
    pub fn new(
        driver: Arc<InstanceDriver>,
        history: Arc<HistoryStore>,
        metrics: OrchestratorMetrics,
        config: ScraperConfig,
        enabled_types: Vec<VnfType>,
    ) -> Self {
        Self {
            driver,
            history,
            metrics,
            config,
            enabled_types,
        }
    }

    /// Run the scrape loop until the task is cancelled
    #[instrument(skip(self))]
    pub async fn run(self) {
        let mut interval = time::interval(Duration::from_secs(self.config.interval));
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            self.scrape_once().await;
        }
    }

    /// One full scrape pass over every known instance
    pub async fn scrape_once(&self) {
        let now = Utc::now();
        for vnf in &self.enabled_types {
            let aggregates = self.scrape_type(*vnf).await;
            if let Some(aggregates) = aggregates {
                self.history
                    .record(*vnf, MetricKind::Cpu, now, aggregates.cpu_percent);
                self.history
                    .record(*vnf, MetricKind::Memory, now, aggregates.memory_percent);
                self.history
                    .record(*vnf, MetricKind::Latency, now, aggregates.latency_ms);
                self.history
                    .record(*vnf, MetricKind::Throughput, now, aggregates.throughput_rps);
                self.history.set_aggregates(*vnf, aggregates);
            }
            let count = self
                .driver
                .list(*vnf)
                .iter()
                .filter(|i| matches!(i.state, InstanceState::Active | InstanceState::Starting))
                .count();
            self.metrics
                .vnf_instances_total
                .with_label_values(&[vnf.as_str()])
                .set(count as f64);
        }
    }

    /// Scrape all instances of one type and aggregate the healthy ones
    async fn scrape_type(&self, vnf: VnfType) -> Option<Aggregates> {
        let instances = self.driver.list(vnf);
        let mut cpu_sum = 0.0;
        let mut memory_sum = 0.0;
        let mut latency_sum = 0.0;
        let mut throughput_sum = 0.0;
        let mut healthy = 0usize;

        for instance in instances {
            if !matches!(
                instance.state,
                InstanceState::Active | InstanceState::Draining
            ) {
                continue;
            }
            let timeout = Duration::from_secs(self.config.probe_timeout);
            let result = time::timeout(timeout, self.driver.scrape(instance.id)).await;
            let metrics = match result {
                Ok(Ok(fresh)) => {
                    let labels = [vnf.as_str().to_string(), instance.id.to_string()];
                    let labels: Vec<&str> = labels.iter().map(|s| s.as_str()).collect();
                    self.metrics
                        .vnf_cpu_usage
                        .with_label_values(&labels)
                        .set(fresh.cpu_percent);
                    self.metrics
                        .vnf_memory_usage
                        .with_label_values(&labels)
                        .set(fresh.memory_percent);
                    self.metrics
                        .vnf_processing_latency
                        .with_label_values(&labels)
                        .observe(fresh.latency_ms);
                    Some(fresh)
                }
                failure => {
                    match failure {
                        Ok(Err(e)) => debug!(instance = %instance.id, error = %e, "Scrape failed"),
                        _ => warn!(instance = %instance.id, "Scrape timed out"),
                    }
                    self.driver.record_probe_failure(instance.id);
                    // Last-known metrics carry the instance until it has
                    // missed N consecutive scrapes
                    self.driver
                        .get(instance.id)
                        .filter(|i| i.is_healthy(self.config.probe_failures))
                        .and_then(|i| i.last_metrics)
                }
            };

            if let Some(metrics) = metrics {
                cpu_sum += metrics.cpu_percent;
                memory_sum += metrics.memory_percent;
                latency_sum += metrics.latency_ms;
                throughput_sum += metrics.throughput_rps;
                healthy += 1;
            }
        }

        if healthy == 0 {
            return None;
        }
        Some(Aggregates {
            cpu_percent: cpu_sum / healthy as f64,
            memory_percent: memory_sum / healthy as f64,
            latency_ms: latency_sum / healthy as f64,
            throughput_rps: throughput_sum,
            sample_count: healthy,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap()
    }

    #[test]
    fn test_series_window_bound() {
        let mut series = MetricSeries::new(3);
        for i in 0..5 {
            series.push(ts(i), i as f64);
        }
        assert_eq!(series.len(), 3);
        assert_eq!(series.values(), vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_series_rejects_stale_timestamps() {
        let mut series = MetricSeries::new(8);
        series.push(ts(10), 1.0);
        series.push(ts(5), 2.0);
        series.push(ts(10), 3.0);
        assert_eq!(series.values(), vec![1.0]);
        series.push(ts(11), 4.0);
        assert_eq!(series.values(), vec![1.0, 4.0]);
    }

    #[test]
    fn test_history_store_round_trip() {
        let history = HistoryStore::new(4);
        for i in 0..6 {
            history.record(VnfType::Firewall, MetricKind::Cpu, ts(i), 10.0 * i as f64);
        }
        assert_eq!(
            history.values(VnfType::Firewall, MetricKind::Cpu),
            vec![20.0, 30.0, 40.0, 50.0]
        );
        assert_eq!(history.sample_count(VnfType::Firewall, MetricKind::Cpu), 4);
        assert_eq!(history.total_recorded(VnfType::Firewall, MetricKind::Cpu), 6);
        assert!(history.values(VnfType::Mail, MetricKind::Cpu).is_empty());
    }

    mod scrape {
        use super::*;
        use crate::config::{DriverConfig, OrchestratorConfig, RollingUpdateConfig};
        use crate::driver::{ContainerApi, InstanceDriver, SimulatedContainerApi};
        use crate::registry::{MetricsRegistry, OrchestratorMetrics};
        use crate::types::InstanceMetrics;

        async fn setup() -> (
            Arc<SimulatedContainerApi>,
            Arc<InstanceDriver>,
            Arc<HistoryStore>,
            MetricsScraper,
        ) {
            let api = SimulatedContainerApi::new();
            for vnf in VnfType::ALL {
                api.register_image(&format!("my-{vnf}-vnf"));
            }
            let driver = InstanceDriver::new(
                api.clone(),
                RollingUpdateConfig {
                    health_check_timeout: 2,
                    drain_timeout: 0,
                    grace_period: 0,
                },
                &DriverConfig {
                    image_prefix: "my-".into(),
                },
            );
            let history = HistoryStore::new(20);
            let registry = MetricsRegistry::new();
            let metrics = OrchestratorMetrics::register(&registry).unwrap();
            let scraper = MetricsScraper::new(
                Arc::clone(&driver),
                Arc::clone(&history),
                metrics,
                OrchestratorConfig::default().scraper,
                vec![VnfType::Firewall],
            );
            (api, driver, history, scraper)
        }

        #[tokio::test]
        async fn test_scrape_aggregates_by_mean_and_sum() {
            let (api, driver, history, scraper) = setup().await;
            let a = driver.create(VnfType::Firewall).await.unwrap();
            driver.wait_active(a.id).await.unwrap();
            let b = driver.create(VnfType::Firewall).await.unwrap();
            driver.wait_active(b.id).await.unwrap();

            api.set_stats(
                &a.container_id,
                InstanceMetrics {
                    cpu_percent: 40.0,
                    memory_percent: 30.0,
                    latency_ms: 100.0,
                    throughput_rps: 200.0,
                },
            );
            api.set_stats(
                &b.container_id,
                InstanceMetrics {
                    cpu_percent: 60.0,
                    memory_percent: 50.0,
                    latency_ms: 300.0,
                    throughput_rps: 300.0,
                },
            );
            scraper.scrape_once().await;

            let aggregates = history.aggregates(VnfType::Firewall).unwrap();
            assert_eq!(aggregates.cpu_percent, 50.0);
            assert_eq!(aggregates.memory_percent, 40.0);
            assert_eq!(aggregates.latency_ms, 200.0);
            assert_eq!(aggregates.throughput_rps, 500.0);
            assert_eq!(history.sample_count(VnfType::Firewall, MetricKind::Cpu), 1);
        }

        #[tokio::test]
        async fn test_failing_instance_excluded_after_three_misses() {
            let (api, driver, history, scraper) = setup().await;
            let good = driver.create(VnfType::Firewall).await.unwrap();
            driver.wait_active(good.id).await.unwrap();
            let bad = driver.create(VnfType::Firewall).await.unwrap();
            driver.wait_active(bad.id).await.unwrap();

            api.set_stats(
                &good.container_id,
                InstanceMetrics {
                    cpu_percent: 40.0,
                    memory_percent: 30.0,
                    latency_ms: 100.0,
                    throughput_rps: 200.0,
                },
            );
            // A dead container makes the scrape hook fail
            let bad_container = driver.get(bad.id).unwrap().container_id;
            api.destroy(&bad_container).await.unwrap();

            for _ in 0..3 {
                scraper.scrape_once().await;
            }
            assert_eq!(driver.get(bad.id).unwrap().failed_probes, 3);
            assert!(!driver.get(bad.id).unwrap().is_healthy(3));

            // Aggregates reflect the healthy instance alone
            let aggregates = history.aggregates(VnfType::Firewall).unwrap();
            assert_eq!(aggregates.sample_count, 1);
            assert_eq!(aggregates.cpu_percent, 40.0);
        }
    }
}
