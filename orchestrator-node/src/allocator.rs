//! SFC allocator
//!
//! Maps typed chain requests onto running instances: reserve one instance per
//! VNF type, install flow rules along the chain, and activate the chain only
//! when every rule is installed and every instance is active. Any failure
//! rolls back reservations and rules before returning, so a rejected request
//! leaves no trace.

use chrono::Utc;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::agent::DrlAgent;
use crate::config::OrchestratorConfig;
use crate::driver::InstanceDriver;
use crate::error::{OrchestratorError, Result};
use crate::flow::{ChainIndex, FlowController};
use crate::registry::OrchestratorMetrics;
use crate::types::{
    ChainCategory, ChainDirection, ChainInstance, ChainRequest, ChainStatus, Instance,
    InstanceState, VnfType,
};

/// Flow priority derived from a request priority (1..=10); keeps chain rules
/// clear of the scaling controller's default-priority rules
pub fn flow_priority(request_priority: u8) -> u32 {
    100 + 10 * u32::from(request_priority)
}

/// Result of one allocation; bidirectional requests carry a second leg
#[derive(Debug, Clone)]
pub struct ChainAllocation {
    pub primary: ChainInstance,
    pub complementary: Option<ChainInstance>,
}

#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct AllocatorStats {
    pub total_requests: u64,
    pub successful: u64,
    pub failed: u64,
    pub active_chains: usize,
    pub average_allocation_ms: f64,
}

impl AllocatorStats {
    pub fn acceptance_ratio(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        self.successful as f64 / self.total_requests as f64
    }
}

#[derive(Default)]
struct StatsInner {
    total_requests: u64,
    successful: u64,
    failed: u64,
    total_allocation_ms: f64,
}

pub struct SfcAllocator {
    flow: Arc<FlowController>,
    driver: Arc<InstanceDriver>,
    agent: Option<Arc<DrlAgent>>,
    metrics: Option<OrchestratorMetrics>,
    chain_index: Arc<ChainIndex>,
    chains: DashMap<String, ChainInstance>,
    /// Per-instance concurrent-chain reservation counters
    reservations: Mutex<HashMap<Uuid, u32>>,
    reservation_cap: u32,
    catalog: HashMap<ChainCategory, (Vec<VnfType>, ChainDirection, f64)>,
    stats: Mutex<StatsInner>,
    /// In-flight requests by priority band (low, mid, high)
    pending: [AtomicU64; 3],
    /// Set on detected state corruption: existing chains are preserved but
    /// no new allocations are accepted
    safe_mode: std::sync::atomic::AtomicBool,
}

impl SfcAllocator {
    pub fn new(
        flow: Arc<FlowController>,
        driver: Arc<InstanceDriver>,
        agent: Option<Arc<DrlAgent>>,
        metrics: Option<OrchestratorMetrics>,
        config: &OrchestratorConfig,
    ) -> Result<Arc<Self>> {
        let chain_index = flow.chain_index();
        Ok(Arc::new(Self {
            flow,
            driver,
            agent,
            metrics,
            chain_index,
            chains: DashMap::new(),
            reservations: Mutex::new(HashMap::new()),
            reservation_cap: config.sfc.reservation_cap,
            catalog: config.chain_catalog()?,
            stats: Mutex::new(StatsInner::default()),
            pending: [AtomicU64::new(0), AtomicU64::new(0), AtomicU64::new(0)],
            safe_mode: std::sync::atomic::AtomicBool::new(false),
        }))
    }

    /// Classify a request from its metadata, most specific rule first
    pub fn classify(metadata: &HashMap<String, String>) -> ChainCategory {
        let flag = |key: &str| metadata.get(key).map(|v| v == "true").unwrap_or(false);
        if flag("saas_access") {
            ChainCategory::BranchCloudSaasAccess
        } else if flag("has_attachments") {
            ChainCategory::AttachmentRiskReduction
        } else if flag("compliance_required") {
            ChainCategory::OutboundDataProtectionCompliance
        } else if metadata.get("direction").map(|d| d == "inbound").unwrap_or(true) {
            ChainCategory::InboundUserProtection
        } else {
            ChainCategory::AuthAndAntiSpoofEnforcement
        }
    }

    /// Build a catalogued request from metadata
    pub fn build_request(
        &self,
        metadata: HashMap<String, String>,
        priority: u8,
    ) -> Result<ChainRequest> {
        let category = Self::classify(&metadata);
        let (chain, direction, _objective) = self
            .catalog
            .get(&category)
            .ok_or_else(|| OrchestratorError::Config(format!("no catalog entry for {category:?}")))?
            .clone();
        Ok(ChainRequest {
            request_id: format!("sfc-{}", Uuid::new_v4().simple()),
            category,
            direction,
            chain,
            priority: priority.clamp(1, 10),
            metadata,
            created_at: Utc::now(),
        })
    }

    /// Latency objective for a category, in milliseconds
    pub fn latency_objective(&self, category: ChainCategory) -> Option<f64> {
        self.catalog.get(&category).map(|(_, _, objective)| *objective)
    }

    /// Allocate a chain (both legs for bidirectional requests).
    /// All failures surface a reason code; partial state is always cleaned up.
    #[instrument(skip(self, request), fields(request_id = %request.request_id))]
    pub async fn allocate(&self, request: ChainRequest) -> Result<ChainAllocation> {
        if self.safe_mode.load(Ordering::SeqCst) {
            return Err(OrchestratorError::Fatal(
                "safe mode: new chain allocations are disabled".into(),
            ));
        }
        let band = priority_band(request.priority);
        self.pending[band].fetch_add(1, Ordering::SeqCst);
        let started = std::time::Instant::now();

        let outcome = self.allocate_inner(&request).await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.pending[band].fetch_sub(1, Ordering::SeqCst);

        let mut stats = self.stats.lock().expect("stats lock");
        stats.total_requests += 1;
        match &outcome {
            Ok(_) => {
                stats.successful += 1;
                stats.total_allocation_ms += elapsed_ms;
                drop(stats);
                self.count_outcome("accepted");
                if let Some(agent) = &self.agent {
                    agent.add_reward(agent.rewards().chain_satisfied);
                }
            }
            Err(e) => {
                stats.failed += 1;
                drop(stats);
                let outcome_label = match e {
                    OrchestratorError::Capacity(_) => "no_capacity",
                    _ => "failed",
                };
                self.count_outcome(outcome_label);
                if let Some(agent) = &self.agent {
                    agent.add_reward(agent.rewards().chain_dropped);
                }
            }
        }
        outcome
    }

    async fn allocate_inner(&self, request: &ChainRequest) -> Result<ChainAllocation> {
        let primary = self.allocate_leg(request, &request.chain, "")?;

        if request.direction != ChainDirection::Bidirectional {
            return Ok(ChainAllocation {
                primary,
                complementary: None,
            });
        }

        // Complementary leg: reversed chain unless the request overrides it
        let return_chain = match request.metadata.get("return_chain") {
            Some(spec) => parse_chain_override(spec)?,
            None => request.chain.iter().rev().cloned().collect(),
        };
        match self.allocate_leg(request, &return_chain, "-return") {
            Ok(complementary) => Ok(ChainAllocation {
                primary,
                complementary: Some(complementary),
            }),
            Err(e) => {
                // Both legs must succeed
                self.teardown(&primary.chain_id)?;
                Err(e)
            }
        }
    }

    /// One leg: target, reserve, install, activate; rollback on any failure
    fn allocate_leg(
        &self,
        request: &ChainRequest,
        chain: &[VnfType],
        suffix: &str,
    ) -> Result<ChainInstance> {
        let chain_id = format!("{}{}", request.request_id, suffix);

        // 1. Target one instance per VNF type via the load balancer
        let mut targets: Vec<(VnfType, Instance)> = Vec::with_capacity(chain.len());
        for vnf in chain {
            let instance = self.flow.next_instance(*vnf).ok_or_else(|| {
                OrchestratorError::Capacity(format!("no-capacity: no active {vnf} instance"))
            })?;
            targets.push((*vnf, instance));
        }

        // 2. Reserve atomically under one critical section
        {
            let mut reservations = self.reservations.lock().expect("reservations lock");
            let mut increments: HashMap<Uuid, u32> = HashMap::new();
            for (_, instance) in &targets {
                *increments.entry(instance.id).or_insert(0) += 1;
            }
            for (id, inc) in &increments {
                let current = reservations.get(id).copied().unwrap_or(0);
                if current + inc > self.reservation_cap {
                    return Err(OrchestratorError::Capacity(format!(
                        "no-capacity: instance {id} at reservation cap"
                    )));
                }
            }
            for (id, inc) in increments {
                *reservations.entry(id).or_insert(0) += inc;
            }
        }

        // 3. Install flow rules in chain order
        let priority = flow_priority(request.priority);
        let mut installed: Vec<Uuid> = Vec::with_capacity(targets.len());
        for (vnf, instance) in &targets {
            match self
                .flow
                .add_rule(*vnf, instance.id, priority, Some(chain_id.clone()))
            {
                Ok(rule) => installed.push(rule.flow_id),
                Err(e) => {
                    warn!(chain_id = %chain_id, vnf_type = %vnf, error = %e, "Rule install failed, rolling back");
                    self.rollback(&installed, &targets);
                    return Err(OrchestratorError::Capacity(format!(
                        "no-capacity: rule install for {vnf} failed"
                    )));
                }
            }
        }

        // 4. Active only when every referenced instance is active
        for (vnf, instance) in &targets {
            let current = self.driver.get(instance.id);
            if current.map(|i| i.state) != Some(InstanceState::Active) {
                self.rollback(&installed, &targets);
                return Err(OrchestratorError::Capacity(format!(
                    "no-capacity: {vnf} instance {} is not active",
                    instance.id
                )));
            }
        }

        for (vnf, instance) in &targets {
            self.chain_index.link(&chain_id, *vnf, instance.id);
        }

        let now = Utc::now();
        let chain_instance = ChainInstance {
            chain_id: chain_id.clone(),
            request: request.clone(),
            allocated: targets
                .iter()
                .map(|(vnf, instance)| (*vnf, instance.id))
                .collect(),
            flow_rules: installed,
            status: ChainStatus::Active,
            started_at: Some(now),
            stopped_at: None,
            latency_samples: Vec::new(),
        };
        self.chains.insert(chain_id.clone(), chain_instance.clone());
        info!(chain_id = %chain_id, hops = chain.len(), "Chain activated");
        Ok(chain_instance)
    }

    /// Undo installed rules and reservations of a failed leg
    fn rollback(&self, installed: &[Uuid], targets: &[(VnfType, Instance)]) {
        for flow_id in installed {
            if let Err(e) = self.flow.remove_rule(*flow_id) {
                warn!(flow_id = %flow_id, error = %e, "Rollback rule removal failed");
            }
        }
        let mut reservations = self.reservations.lock().expect("reservations lock");
        for (_, instance) in targets {
            if let Some(count) = reservations.get_mut(&instance.id) {
                *count = count.saturating_sub(1);
            }
        }
    }

    /// Tear down an active chain: rules out, reservations released
    #[instrument(skip(self))]
    pub fn teardown(&self, chain_id: &str) -> Result<()> {
        let mut chain = self
            .chains
            .get_mut(chain_id)
            .ok_or_else(|| OrchestratorError::InvalidAction(format!("unknown chain {chain_id}")))?;
        if chain.status != ChainStatus::Active {
            return Err(OrchestratorError::InvalidAction(format!(
                "chain {chain_id} is not active"
            )));
        }

        // Unlink first so the last-rule guard does not trip on our own rules
        for (vnf, instance_id) in &chain.allocated {
            self.chain_index.unlink(chain_id, *vnf, *instance_id);
        }
        for flow_id in &chain.flow_rules {
            if let Err(e) = self.flow.remove_rule(*flow_id) {
                warn!(chain_id, flow_id = %flow_id, error = %e, "Teardown rule removal failed");
            }
        }
        {
            let mut reservations = self.reservations.lock().expect("reservations lock");
            for (_, instance_id) in &chain.allocated {
                if let Some(count) = reservations.get_mut(instance_id) {
                    *count = count.saturating_sub(1);
                }
            }
        }
        chain.status = ChainStatus::TornDown;
        chain.stopped_at = Some(Utc::now());
        info!(chain_id, "Chain torn down");
        Ok(())
    }

    /// Record an observed end-to-end latency sample for a chain
    pub fn record_latency(&self, chain_id: &str, latency_ms: f64) {
        if let Some(mut chain) = self.chains.get_mut(chain_id) {
            chain.latency_samples.push(latency_ms);
        }
    }

    pub fn get_chain(&self, chain_id: &str) -> Option<ChainInstance> {
        self.chains.get(chain_id).map(|c| c.clone())
    }

    pub fn active_chains(&self) -> Vec<ChainInstance> {
        self.chains
            .iter()
            .filter(|entry| entry.value().status == ChainStatus::Active)
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Current reservation count for an instance
    pub fn reservation_count(&self, instance_id: Uuid) -> u32 {
        self.reservations
            .lock()
            .expect("reservations lock")
            .get(&instance_id)
            .copied()
            .unwrap_or(0)
    }

    /// In-flight request counts by priority band (low, mid, high)
    pub fn pending_by_band(&self) -> [u64; 3] {
        [
            self.pending[0].load(Ordering::SeqCst),
            self.pending[1].load(Ordering::SeqCst),
            self.pending[2].load(Ordering::SeqCst),
        ]
    }

    pub fn stats(&self) -> AllocatorStats {
        let inner = self.stats.lock().expect("stats lock");
        AllocatorStats {
            total_requests: inner.total_requests,
            successful: inner.successful,
            failed: inner.failed,
            active_chains: self.active_chains().len(),
            average_allocation_ms: if inner.successful > 0 {
                inner.total_allocation_ms / inner.successful as f64
            } else {
                0.0
            },
        }
    }

    /// Freeze new allocations after detected state corruption. Existing
    /// chains keep their rules and reservations.
    pub fn enter_safe_mode(&self) {
        if !self.safe_mode.swap(true, Ordering::SeqCst) {
            warn!("Entering safe mode: no new chain allocations will be accepted");
        }
    }

    pub fn in_safe_mode(&self) -> bool {
        self.safe_mode.load(Ordering::SeqCst)
    }

    fn count_outcome(&self, outcome: &str) {
        if let Some(metrics) = &self.metrics {
            metrics
                .sfc_requests_total
                .with_label_values(&[outcome])
                .inc();
        }
    }
}

fn priority_band(priority: u8) -> usize {
    match priority {
        0..=3 => 0,
        4..=7 => 1,
        _ => 2,
    }
}

/// Parse a comma-separated chain override from request metadata
fn parse_chain_override(spec: &str) -> Result<Vec<VnfType>> {
    spec.split(',')
        .map(|tag| {
            tag.trim()
                .parse::<VnfType>()
                .map_err(OrchestratorError::InvalidAction)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DriverConfig, RollingUpdateConfig};
    use crate::driver::SimulatedContainerApi;

    async fn setup() -> (Arc<InstanceDriver>, Arc<FlowController>, Arc<SfcAllocator>) {
        let api = SimulatedContainerApi::new();
        for vnf in VnfType::ALL {
            api.register_image(&format!("my-{vnf}-vnf"));
        }
        let driver = InstanceDriver::new(
            api,
            RollingUpdateConfig {
                health_check_timeout: 2,
                drain_timeout: 0,
                grace_period: 0,
            },
            &DriverConfig {
                image_prefix: "my-".into(),
            },
        );
        let flow = FlowController::new(Arc::clone(&driver), ChainIndex::new());
        let allocator = SfcAllocator::new(
            Arc::clone(&flow),
            Arc::clone(&driver),
            None,
            None,
            &OrchestratorConfig::default(),
        )
        .unwrap();
        (driver, flow, allocator)
    }

    async fn spawn_active(driver: &Arc<InstanceDriver>, vnf: VnfType) -> Instance {
        let instance = driver.create(vnf).await.unwrap();
        driver.wait_active(instance.id).await.unwrap();
        driver.get(instance.id).unwrap()
    }

    fn request(chain: Vec<VnfType>, direction: ChainDirection, priority: u8) -> ChainRequest {
        ChainRequest {
            request_id: format!("sfc-{}", Uuid::new_v4().simple()),
            category: ChainCategory::InboundUserProtection,
            direction,
            chain,
            priority,
            metadata: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_allocation_installs_rules_in_chain_order() {
        let (driver, flow, allocator) = setup().await;
        spawn_active(&driver, VnfType::Firewall).await;
        spawn_active(&driver, VnfType::Spamfilter).await;

        let allocation = allocator
            .allocate(request(
                vec![VnfType::Firewall, VnfType::Spamfilter],
                ChainDirection::Inbound,
                5,
            ))
            .await
            .unwrap();
        let chain = allocation.primary;
        assert_eq!(chain.status, ChainStatus::Active);
        assert_eq!(chain.flow_rules.len(), 2);

        let rules: Vec<_> = chain
            .flow_rules
            .iter()
            .map(|id| flow.get_rule(*id).unwrap())
            .collect();
        assert_eq!(rules[0].vnf_type, VnfType::Firewall);
        assert_eq!(rules[1].vnf_type, VnfType::Spamfilter);
        assert!(rules.iter().all(|r| r.chain_id.as_deref() == Some(chain.chain_id.as_str())));
        assert_eq!(rules[0].priority, flow_priority(5));
    }

    #[tokio::test]
    async fn test_missing_type_fails_fast() {
        let (driver, _flow, allocator) = setup().await;
        spawn_active(&driver, VnfType::Firewall).await;

        let result = allocator
            .allocate(request(
                vec![VnfType::Firewall, VnfType::EncryptionGateway],
                ChainDirection::Inbound,
                5,
            ))
            .await;
        assert!(matches!(result, Err(OrchestratorError::Capacity(_))));
        assert_eq!(allocator.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_rollback_restores_rules_and_reservations() {
        let (driver, flow, allocator) = setup().await;
        let firewall = spawn_active(&driver, VnfType::Firewall).await;
        let encryption = spawn_active(&driver, VnfType::EncryptionGateway).await;
        spawn_active(&driver, VnfType::Spamfilter).await;

        // Force a conflict on the second hop: pre-install a rule with the
        // same (instance, priority) the allocator will request
        flow.add_rule(
            VnfType::EncryptionGateway,
            encryption.id,
            flow_priority(5),
            None,
        )
        .unwrap();

        let reservations_before = allocator.reservation_count(firewall.id);
        let rules_before = flow.list_rules(None).len();

        let result = allocator
            .allocate(request(
                vec![
                    VnfType::Firewall,
                    VnfType::EncryptionGateway,
                    VnfType::Spamfilter,
                ],
                ChainDirection::Inbound,
                5,
            ))
            .await;
        assert!(matches!(result, Err(OrchestratorError::Capacity(_))));

        // No rules tagged with any chain id remain; counts are unchanged
        assert_eq!(flow.list_rules(None).len(), rules_before);
        assert!(flow
            .list_rules(None)
            .iter()
            .all(|r| r.chain_id.is_none()));
        assert_eq!(allocator.reservation_count(firewall.id), reservations_before);
        assert_eq!(allocator.reservation_count(encryption.id), 0);
    }

    #[tokio::test]
    async fn test_bidirectional_builds_reversed_leg() {
        let (driver, _flow, allocator) = setup().await;
        spawn_active(&driver, VnfType::Firewall).await;
        spawn_active(&driver, VnfType::Mail).await;

        let allocation = allocator
            .allocate(request(
                vec![VnfType::Firewall, VnfType::Mail],
                ChainDirection::Bidirectional,
                7,
            ))
            .await
            .unwrap();
        let complementary = allocation.complementary.unwrap();
        let leg_types: Vec<VnfType> = complementary
            .allocated
            .iter()
            .map(|(vnf, _)| *vnf)
            .collect();
        assert_eq!(leg_types, vec![VnfType::Mail, VnfType::Firewall]);
    }

    #[tokio::test]
    async fn test_teardown_releases_everything() {
        let (driver, flow, allocator) = setup().await;
        let firewall = spawn_active(&driver, VnfType::Firewall).await;

        let allocation = allocator
            .allocate(request(vec![VnfType::Firewall], ChainDirection::Inbound, 5))
            .await
            .unwrap();
        let chain_id = allocation.primary.chain_id.clone();
        assert_eq!(allocator.reservation_count(firewall.id), 1);

        allocator.teardown(&chain_id).unwrap();
        assert_eq!(allocator.reservation_count(firewall.id), 0);
        assert!(flow.list_rules(None).is_empty());
        assert_eq!(
            allocator.get_chain(&chain_id).unwrap().status,
            ChainStatus::TornDown
        );
    }

    #[tokio::test]
    async fn test_reservation_cap_enforced() {
        let api = SimulatedContainerApi::new();
        for vnf in VnfType::ALL {
            api.register_image(&format!("my-{vnf}-vnf"));
        }
        let driver = InstanceDriver::new(
            api,
            RollingUpdateConfig {
                health_check_timeout: 2,
                drain_timeout: 0,
                grace_period: 0,
            },
            &DriverConfig {
                image_prefix: "my-".into(),
            },
        );
        let flow = FlowController::new(Arc::clone(&driver), ChainIndex::new());
        let mut config = OrchestratorConfig::default();
        config.sfc.reservation_cap = 2;
        let allocator = SfcAllocator::new(
            Arc::clone(&flow),
            Arc::clone(&driver),
            None,
            None,
            &config,
        )
        .unwrap();
        spawn_active(&driver, VnfType::Firewall).await;

        // Distinct request priorities avoid rule conflicts; the third chain
        // hits the instance's reservation cap
        for priority in [1u8, 2] {
            let result = allocator
                .allocate(request(
                    vec![VnfType::Firewall],
                    ChainDirection::Inbound,
                    priority,
                ))
                .await;
            assert!(result.is_ok(), "priority {priority} should fit under the cap");
        }
        let overflow = allocator
            .allocate(request(vec![VnfType::Firewall], ChainDirection::Inbound, 3))
            .await;
        assert!(matches!(overflow, Err(OrchestratorError::Capacity(_))));
    }

    #[tokio::test]
    async fn test_safe_mode_rejects_new_allocations() {
        let (driver, _flow, allocator) = setup().await;
        spawn_active(&driver, VnfType::Firewall).await;

        allocator.enter_safe_mode();
        let result = allocator
            .allocate(request(vec![VnfType::Firewall], ChainDirection::Inbound, 5))
            .await;
        assert!(matches!(result, Err(OrchestratorError::Fatal(_))));
    }

    #[test]
    fn test_classification_precedence() {
        let meta = |pairs: &[(&str, &str)]| {
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<_, _>>()
        };
        assert_eq!(
            SfcAllocator::classify(&meta(&[("saas_access", "true"), ("has_attachments", "true")])),
            ChainCategory::BranchCloudSaasAccess
        );
        assert_eq!(
            SfcAllocator::classify(&meta(&[("has_attachments", "true")])),
            ChainCategory::AttachmentRiskReduction
        );
        assert_eq!(
            SfcAllocator::classify(&meta(&[("compliance_required", "true")])),
            ChainCategory::OutboundDataProtectionCompliance
        );
        assert_eq!(
            SfcAllocator::classify(&meta(&[("direction", "outbound")])),
            ChainCategory::AuthAndAntiSpoofEnforcement
        );
        assert_eq!(
            SfcAllocator::classify(&meta(&[])),
            ChainCategory::InboundUserProtection
        );
    }
}
