//! Instance driver
//!
//! Owns the lifecycle of VNF instances on top of an opaque container
//! interface. Instances are created in `starting` state and promoted to
//! `active` only by a successful health probe; removal always goes through
//! `active -> draining -> removed`.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::{DriverConfig, RollingUpdateConfig};
use crate::error::{OrchestratorError, Result};
use crate::types::{Instance, InstanceMetrics, InstanceState, VnfType};

/// Resource limits passed to the container runtime
#[derive(Debug, Clone, Copy)]
pub struct ResourceLimits {
    pub cpu_millis: u64,
    pub memory_mb: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_millis: 1000,
            memory_mb: 512,
        }
    }
}

/// Runtime-reported container state
#[derive(Debug, Clone)]
pub struct ContainerState {
    pub running: bool,
    /// Reachable address of the instance's HTTP surface, if any
    pub address: Option<String>,
}

/// Opaque container interface. Any adapter satisfying this capability set
/// is acceptable; `stats` is the per-instance scrape hook.
#[async_trait]
pub trait ContainerApi: Send + Sync {
    async fn create(
        &self,
        image: &str,
        env: &HashMap<String, String>,
        limits: &ResourceLimits,
    ) -> Result<String>;

    async fn destroy(&self, container_id: &str) -> Result<()>;

    async fn inspect(&self, container_id: &str) -> Result<ContainerState>;

    /// Run a probe command inside the container; returns its exit code
    async fn exec_probe(&self, container_id: &str, command: &str) -> Result<i32>;

    /// Pull current resource counters for the container
    async fn stats(&self, container_id: &str) -> Result<InstanceMetrics>;
}

#[derive(Debug, Clone)]
struct SimContainer {
    image: String,
    running: bool,
    probes_seen: u32,
    stats: InstanceMetrics,
}

/// In-process container runtime used by demo mode and the test suites.
///
/// Health and load behavior are injectable: images can be declared missing,
/// probes can be delayed or failed forever, and per-container stats can be
/// set by tests or by the workload generator.
pub struct SimulatedContainerApi {
    images: DashMap<String, ()>,
    containers: DashMap<String, SimContainer>,
    sequence: AtomicU64,
    /// Probes a new container fails before turning healthy
    probe_delay: AtomicU64,
    /// Images whose containers never become healthy
    unhealthy_images: DashMap<String, ()>,
    /// Containers the runtime refuses to create beyond this count (0 = unbounded)
    capacity: AtomicU64,
}

impl SimulatedContainerApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            images: DashMap::new(),
            containers: DashMap::new(),
            sequence: AtomicU64::new(0),
            probe_delay: AtomicU64::new(0),
            unhealthy_images: DashMap::new(),
            capacity: AtomicU64::new(0),
        })
    }

    /// Make an image known to the runtime
    pub fn register_image(&self, image: &str) {
        self.images.insert(image.to_string(), ());
    }

    pub fn set_probe_delay(&self, probes: u64) {
        self.probe_delay.store(probes, Ordering::SeqCst);
    }

    pub fn mark_image_unhealthy(&self, image: &str) {
        self.unhealthy_images.insert(image.to_string(), ());
    }

    pub fn set_capacity(&self, max_containers: u64) {
        self.capacity.store(max_containers, Ordering::SeqCst);
    }

    /// Inject stats for a container, e.g. from a synthetic load profile
    pub fn set_stats(&self, container_id: &str, stats: InstanceMetrics) {
        if let Some(mut container) = self.containers.get_mut(container_id) {
            container.stats = stats;
        }
    }

    pub fn running_count(&self) -> usize {
        self.containers.iter().filter(|c| c.running).count()
    }

    pub fn has_image(&self, image: &str) -> bool {
        self.images.contains_key(image)
    }
}

#[async_trait]
impl ContainerApi for SimulatedContainerApi {
    async fn create(
        &self,
        image: &str,
        _env: &HashMap<String, String>,
        _limits: &ResourceLimits,
    ) -> Result<String> {
        if !self.images.contains_key(image) {
            return Err(OrchestratorError::ImageMissing(image.to_string()));
        }
        let capacity = self.capacity.load(Ordering::SeqCst);
        if capacity > 0 && self.running_count() as u64 >= capacity {
            return Err(OrchestratorError::InsufficientResources(format!(
                "runtime at capacity ({capacity})"
            )));
        }
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        let container_id = format!("{image}-{seq}");
        self.containers.insert(
            container_id.clone(),
            SimContainer {
                image: image.to_string(),
                running: true,
                probes_seen: 0,
                stats: InstanceMetrics {
                    cpu_percent: 20.0,
                    memory_percent: 25.0,
                    latency_ms: 50.0,
                    throughput_rps: 100.0,
                },
            },
        );
        Ok(container_id)
    }

    async fn destroy(&self, container_id: &str) -> Result<()> {
        match self.containers.get_mut(container_id) {
            Some(mut container) => {
                container.running = false;
                Ok(())
            }
            None => Ok(()),
        }
    }

    async fn inspect(&self, container_id: &str) -> Result<ContainerState> {
        let container = self
            .containers
            .get(container_id)
            .ok_or_else(|| OrchestratorError::TransientIo(format!("no such container {container_id}")))?;
        Ok(ContainerState {
            running: container.running,
            address: None,
        })
    }

    async fn exec_probe(&self, container_id: &str, _command: &str) -> Result<i32> {
        let mut container = self
            .containers
            .get_mut(container_id)
            .ok_or_else(|| OrchestratorError::TransientIo(format!("no such container {container_id}")))?;
        if !container.running {
            return Ok(1);
        }
        if self.unhealthy_images.contains_key(&container.image) {
            return Ok(1);
        }
        container.probes_seen += 1;
        if u64::from(container.probes_seen) <= self.probe_delay.load(Ordering::SeqCst) {
            return Ok(1);
        }
        Ok(0)
    }

    async fn stats(&self, container_id: &str) -> Result<InstanceMetrics> {
        let container = self
            .containers
            .get(container_id)
            .ok_or_else(|| OrchestratorError::TransientIo(format!("no such container {container_id}")))?;
        if !container.running {
            return Err(OrchestratorError::TransientIo(format!(
                "container {container_id} not running"
            )));
        }
        Ok(container.stats)
    }
}

/// Interval between health probes while an instance is starting
const PROBE_INTERVAL: Duration = Duration::from_millis(500);

/// Health probe command executed inside the container
const PROBE_COMMAND: &str = "/usr/local/bin/healthcheck";

/// Timeout for the external create call
const CREATE_TIMEOUT: Duration = Duration::from_secs(60);

/// Manages instance lifecycle over a [`ContainerApi`]. Clones share the
/// same instance table.
#[derive(Clone)]
pub struct InstanceDriver {
    api: Arc<dyn ContainerApi>,
    instances: Arc<DashMap<Uuid, Instance>>,
    rolling: RollingUpdateConfig,
    image_prefix: String,
    http: reqwest::Client,
}

impl InstanceDriver {
    pub fn new(
        api: Arc<dyn ContainerApi>,
        rolling: RollingUpdateConfig,
        driver_config: &DriverConfig,
    ) -> Arc<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()
            .unwrap_or_default();
        Arc::new(Self {
            api,
            instances: Arc::new(DashMap::new()),
            rolling,
            image_prefix: driver_config.image_prefix.clone(),
            http,
        })
    }

    pub fn image_for(&self, vnf: VnfType) -> String {
        format!("{}{}-vnf", self.image_prefix, vnf)
    }

    /// Launch a new instance. Returns immediately in `starting` state; the
    /// background probe promotes it to `active` or destroys it on timeout.
    #[instrument(skip(self))]
    pub async fn create(&self, vnf: VnfType) -> Result<Instance> {
        let image = self.image_for(vnf);
        let env = HashMap::from([("VNF_TYPE".to_string(), vnf.to_string())]);
        let limits = ResourceLimits::default();

        let container_id = time::timeout(CREATE_TIMEOUT, self.api.create(&image, &env, &limits))
            .await
            .map_err(|_| OrchestratorError::TransientIo(format!("create {image} timed out")))??;

        let instance = Instance {
            id: Uuid::new_v4(),
            vnf_type: vnf,
            container_id,
            state: InstanceState::Starting,
            created_at: Utc::now(),
            last_metrics: None,
            last_scraped: None,
            failed_probes: 0,
        };
        self.instances.insert(instance.id, instance.clone());
        info!(instance = %instance.id, vnf_type = %vnf, "Instance created, awaiting health");

        let driver = self.clone();
        let id = instance.id;
        tokio::spawn(async move {
            driver.probe_until_active(id).await;
        });

        Ok(instance)
    }

    /// Background probe loop for a starting instance
    async fn probe_until_active(&self, id: Uuid) {
        let deadline = time::Instant::now()
            + Duration::from_secs(self.rolling.health_check_timeout);
        loop {
            let Some(instance) = self.get(id) else { return };
            if instance.state != InstanceState::Starting {
                return;
            }
            if self.probe(&instance).await {
                if self
                    .transition(id, InstanceState::Starting, InstanceState::Active)
                    .is_ok()
                {
                    info!(instance = %id, vnf_type = %instance.vnf_type, "Instance active");
                }
                return;
            }
            if time::Instant::now() >= deadline {
                warn!(instance = %id, "Health probe deadline exceeded, destroying instance");
                if let Err(e) = self.destroy(id).await {
                    error!(instance = %id, error = %e, "Failed to destroy unhealthy instance");
                }
                return;
            }
            time::sleep(PROBE_INTERVAL).await;
        }
    }

    /// Probe instance health: HTTP when the runtime exposes an address,
    /// exec probe otherwise
    async fn probe(&self, instance: &Instance) -> bool {
        match self.api.inspect(&instance.container_id).await {
            Ok(state) if state.running => {
                if let Some(address) = state.address {
                    let url = format!("http://{address}/health");
                    matches!(
                        self.http.get(&url).send().await,
                        Ok(response) if response.status().is_success()
                    )
                } else {
                    matches!(
                        self.api.exec_probe(&instance.container_id, PROBE_COMMAND).await,
                        Ok(0)
                    )
                }
            }
            _ => false,
        }
    }

    /// Wait until the instance is active, or fail with `health-timeout`.
    /// The wait bound is T_h plus slack for the probe cadence.
    pub async fn wait_active(&self, id: Uuid) -> Result<()> {
        let deadline = time::Instant::now()
            + Duration::from_secs(self.rolling.health_check_timeout)
            + PROBE_INTERVAL * 4;
        loop {
            match self.get(id) {
                Some(instance) => match instance.state {
                    InstanceState::Active => return Ok(()),
                    InstanceState::Starting => {}
                    _ => return Err(OrchestratorError::HealthTimeout(id)),
                },
                None => return Err(OrchestratorError::HealthTimeout(id)),
            }
            if time::Instant::now() >= deadline {
                return Err(OrchestratorError::HealthTimeout(id));
            }
            time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Mark an active instance as draining. New traffic stops being directed
    /// to it immediately; [`complete_drain`](Self::complete_drain) finishes
    /// the removal.
    pub fn drain(&self, id: Uuid) -> Result<()> {
        self.transition(id, InstanceState::Active, InstanceState::Draining)
    }

    /// Wait out the drain timeout plus grace, then destroy the container
    #[instrument(skip(self))]
    pub async fn complete_drain(&self, id: Uuid) -> Result<()> {
        match self.get(id) {
            Some(instance) if instance.state == InstanceState::Draining => {}
            Some(_) => {
                return Err(OrchestratorError::InvalidAction(format!(
                    "complete_drain on non-draining instance {id}"
                )))
            }
            None => return Err(OrchestratorError::AlreadyDestroyed(id)),
        }
        let wait = self.rolling.drain_timeout + self.rolling.grace_period;
        debug!(instance = %id, wait_seconds = wait, "Draining instance");
        time::sleep(Duration::from_secs(wait)).await;
        self.destroy(id).await
    }

    /// Destroy the backing container. Idempotent.
    pub async fn destroy(&self, id: Uuid) -> Result<()> {
        let container_id = match self.get(id) {
            Some(instance) if instance.state != InstanceState::Removed => instance.container_id,
            _ => return Ok(()),
        };
        self.api.destroy(&container_id).await?;
        if let Some(mut instance) = self.instances.get_mut(&id) {
            instance.state = InstanceState::Removed;
        }
        info!(instance = %id, "Instance destroyed");
        Ok(())
    }

    /// Snapshot of known instances of one type, creation order
    pub fn list(&self, vnf: VnfType) -> Vec<Instance> {
        let mut instances: Vec<Instance> = self
            .instances
            .iter()
            .filter(|entry| entry.value().vnf_type == vnf)
            .map(|entry| entry.value().clone())
            .collect();
        instances.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        instances
    }

    pub fn get(&self, id: Uuid) -> Option<Instance> {
        self.instances.get(&id).map(|entry| entry.value().clone())
    }

    /// |active ∪ starting| for the pool-bound invariant
    pub fn live_count(&self, vnf: VnfType) -> usize {
        self.instances
            .iter()
            .filter(|entry| {
                let instance = entry.value();
                instance.vnf_type == vnf
                    && matches!(
                        instance.state,
                        InstanceState::Active | InstanceState::Starting
                    )
            })
            .count()
    }

    pub fn active_count(&self, vnf: VnfType) -> usize {
        self.instances
            .iter()
            .filter(|entry| {
                entry.value().vnf_type == vnf && entry.value().state == InstanceState::Active
            })
            .count()
    }

    /// Pull current counters for one instance through the scrape hook
    pub async fn scrape(&self, id: Uuid) -> Result<InstanceMetrics> {
        let container_id = self
            .get(id)
            .filter(|i| i.state != InstanceState::Removed)
            .map(|i| i.container_id)
            .ok_or(OrchestratorError::AlreadyDestroyed(id))?;
        let metrics = self.api.stats(&container_id).await?;
        if let Some(mut instance) = self.instances.get_mut(&id) {
            instance.last_metrics = Some(metrics);
            instance.last_scraped = Some(Utc::now());
            instance.failed_probes = 0;
        }
        Ok(metrics)
    }

    pub fn record_probe_failure(&self, id: Uuid) {
        if let Some(mut instance) = self.instances.get_mut(&id) {
            instance.failed_probes = instance.failed_probes.saturating_add(1);
        }
    }

    fn transition(&self, id: Uuid, from: InstanceState, to: InstanceState) -> Result<()> {
        let mut instance = self
            .instances
            .get_mut(&id)
            .ok_or(OrchestratorError::AlreadyDestroyed(id))?;
        if instance.state == InstanceState::Removed {
            return Err(OrchestratorError::AlreadyDestroyed(id));
        }
        if instance.state != from {
            return Err(OrchestratorError::InvalidAction(format!(
                "instance {id}: cannot go {:?} -> {:?}",
                instance.state, to
            )));
        }
        instance.state = to;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_rolling() -> RollingUpdateConfig {
        RollingUpdateConfig {
            health_check_timeout: 2,
            drain_timeout: 0,
            grace_period: 0,
        }
    }

    fn test_driver_config() -> DriverConfig {
        DriverConfig {
            image_prefix: "my-".into(),
        }
    }

    fn sim_with_catalog() -> Arc<SimulatedContainerApi> {
        let api = SimulatedContainerApi::new();
        for vnf in VnfType::ALL {
            api.register_image(&format!("my-{vnf}-vnf"));
        }
        api
    }

    #[tokio::test]
    async fn test_create_promotes_to_active() {
        let api = sim_with_catalog();
        let driver = InstanceDriver::new(api, test_rolling(), &test_driver_config());

        let instance = driver.create(VnfType::Firewall).await.unwrap();
        assert_eq!(instance.state, InstanceState::Starting);

        driver.wait_active(instance.id).await.unwrap();
        assert_eq!(driver.get(instance.id).unwrap().state, InstanceState::Active);
        assert_eq!(driver.live_count(VnfType::Firewall), 1);
    }

    #[tokio::test]
    async fn test_missing_image_is_reported() {
        let api = SimulatedContainerApi::new();
        let driver = InstanceDriver::new(api, test_rolling(), &test_driver_config());

        let result = driver.create(VnfType::Mail).await;
        assert!(matches!(result, Err(OrchestratorError::ImageMissing(_))));
    }

    #[tokio::test]
    async fn test_runtime_capacity_exhaustion() {
        let api = sim_with_catalog();
        api.set_capacity(1);
        let driver = InstanceDriver::new(api, test_rolling(), &test_driver_config());

        driver.create(VnfType::Firewall).await.unwrap();
        let second = driver.create(VnfType::Firewall).await;
        assert!(matches!(
            second,
            Err(OrchestratorError::InsufficientResources(_))
        ));
    }

    #[tokio::test]
    async fn test_health_timeout_destroys_instance() {
        let api = sim_with_catalog();
        api.mark_image_unhealthy("my-firewall-vnf");
        let driver = InstanceDriver::new(api.clone(), test_rolling(), &test_driver_config());

        let instance = driver.create(VnfType::Firewall).await.unwrap();
        let result = driver.wait_active(instance.id).await;
        assert!(matches!(result, Err(OrchestratorError::HealthTimeout(_))));
        assert_eq!(
            driver.get(instance.id).unwrap().state,
            InstanceState::Removed
        );
        assert_eq!(api.running_count(), 0);
    }

    #[tokio::test]
    async fn test_removal_goes_through_draining() {
        let api = sim_with_catalog();
        let driver = InstanceDriver::new(api, test_rolling(), &test_driver_config());

        let instance = driver.create(VnfType::Spamfilter).await.unwrap();
        driver.wait_active(instance.id).await.unwrap();

        driver.drain(instance.id).unwrap();
        assert_eq!(
            driver.get(instance.id).unwrap().state,
            InstanceState::Draining
        );

        driver.complete_drain(instance.id).await.unwrap();
        assert_eq!(
            driver.get(instance.id).unwrap().state,
            InstanceState::Removed
        );

        // Idempotent destroy
        driver.destroy(instance.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_drain_requires_active_state() {
        let api = sim_with_catalog();
        api.set_probe_delay(1_000);
        let driver = InstanceDriver::new(api, test_rolling(), &test_driver_config());

        let instance = driver.create(VnfType::Mail).await.unwrap();
        // Still starting; drain must be refused
        assert!(matches!(
            driver.drain(instance.id),
            Err(OrchestratorError::InvalidAction(_))
        ));
    }

    #[tokio::test]
    async fn test_scrape_updates_instance() {
        let api = sim_with_catalog();
        let driver = InstanceDriver::new(api.clone(), test_rolling(), &test_driver_config());

        let instance = driver.create(VnfType::Antivirus).await.unwrap();
        driver.wait_active(instance.id).await.unwrap();

        api.set_stats(
            &instance.container_id,
            InstanceMetrics {
                cpu_percent: 91.0,
                memory_percent: 44.0,
                latency_ms: 120.0,
                throughput_rps: 800.0,
            },
        );
        let metrics = driver.scrape(instance.id).await.unwrap();
        assert_eq!(metrics.cpu_percent, 91.0);
        let stored = driver.get(instance.id).unwrap();
        assert_eq!(stored.last_metrics.unwrap().latency_ms, 120.0);
        assert_eq!(stored.failed_probes, 0);
    }
}
