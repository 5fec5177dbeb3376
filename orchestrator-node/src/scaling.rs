//! Scaling controller
//!
//! Fuses threshold rules, forecasts, and the learning agent's suggestion into
//! one scaling decision per VNF type each control tick. Scale actions are
//! serialized per type, bounded globally, and suppressed during the per-type
//! cooldown; rolling updates never leave a serving type without an active
//! instance.

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::agent::{state_dimension, DrlAgent};
use crate::allocator::SfcAllocator;
use crate::config::{ControlLoopConfig, ForecastingConfig, OrchestratorConfig, ScalingThresholds};
use crate::driver::InstanceDriver;
use crate::flow::{ChainIndex, FlowController};
use crate::forecast::{Forecast, ForecastEngine};
use crate::registry::OrchestratorMetrics;
use crate::scraper::HistoryStore;
use crate::types::{AgentAction, Aggregates, InstanceState, MetricKind, ScalingPhase, VnfType};

/// Priority of load-balancing rules installed by the controller
const DEFAULT_FLOW_PRIORITY: u32 = 100;

/// Normalization caps for the agent state vector
const LATENCY_NORM_MS: f64 = 2000.0;
const BANDWIDTH_CAP_RPS: f64 = 10_000.0;
const PENDING_NORM: f64 = 10.0;

/// Metrics the forecaster is consulted about each tick
const FORECAST_METRICS: [MetricKind; 3] =
    [MetricKind::Cpu, MetricKind::Memory, MetricKind::Latency];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Out,
    In,
    Hold,
}

type TypeForecasts = HashMap<MetricKind, Forecast>;

/// Clones share all decision state; scale tasks run on clones of the
/// controller.
#[derive(Clone)]
pub struct ScalingController {
    driver: Arc<InstanceDriver>,
    flow: Arc<FlowController>,
    history: Arc<HistoryStore>,
    forecaster: Arc<ForecastEngine>,
    agent: Arc<DrlAgent>,
    allocator: Arc<SfcAllocator>,
    metrics: OrchestratorMetrics,
    chain_index: Arc<ChainIndex>,
    thresholds: ScalingThresholds,
    forecasting: ForecastingConfig,
    control: ControlLoopConfig,
    min_instances: usize,
    max_instances: usize,
    enabled_types: Vec<VnfType>,
    apply_suggestions: bool,
    episode_length: u64,
    checkpoint_interval: u64,
    cooldown_until: Arc<DashMap<VnfType, Instant>>,
    phases: Arc<DashMap<VnfType, ScalingPhase>>,
    type_locks: Arc<DashMap<VnfType, Arc<AsyncMutex<()>>>>,
    budget: Arc<Semaphore>,
    tick_count: Arc<AtomicU64>,
    previous: Arc<Mutex<Option<(Vec<f64>, AgentAction)>>>,
}

impl ScalingController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        driver: Arc<InstanceDriver>,
        flow: Arc<FlowController>,
        history: Arc<HistoryStore>,
        forecaster: Arc<ForecastEngine>,
        agent: Arc<DrlAgent>,
        allocator: Arc<SfcAllocator>,
        metrics: OrchestratorMetrics,
        config: &OrchestratorConfig,
        enabled_types: Vec<VnfType>,
    ) -> Arc<Self> {
        let chain_index = flow.chain_index();
        Arc::new(Self {
            driver,
            flow,
            history,
            forecaster,
            agent,
            allocator,
            metrics,
            chain_index,
            thresholds: config.scaling_thresholds,
            forecasting: config.forecasting,
            control: config.control_loop,
            min_instances: config.min_instances,
            max_instances: config.max_instances,
            enabled_types,
            apply_suggestions: config.drl_config.apply_suggestions,
            episode_length: config.drl_config.episode_length,
            checkpoint_interval: config.drl_config.checkpoint_interval,
            cooldown_until: Arc::new(DashMap::new()),
            phases: Arc::new(DashMap::new()),
            type_locks: Arc::new(DashMap::new()),
            budget: Arc::new(Semaphore::new(config.control_loop.max_concurrent_scales)),
            tick_count: Arc::new(AtomicU64::new(0)),
            previous: Arc::new(Mutex::new(None)),
        })
    }

    /// Control loop: one fused decision pass per tick interval
    #[instrument(skip(self))]
    pub async fn run(self: Arc<Self>) {
        let mut interval = time::interval(Duration::from_secs(self.control.tick_interval));
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            // Scale operations run detached; per-type locks and the global
            // budget serialize them against later ticks
            let _handles = self.tick().await;
        }
    }

    /// One evaluation pass. Returns handles of the dispatched scale
    /// operations so callers (tests, shutdown) can await completion.
    pub async fn tick(&self) -> Vec<JoinHandle<()>> {
        self.expire_cooldowns();
        self.audit_state();

        let forecasts = self.gather_forecasts().await;
        let state = self.build_state(&forecasts);
        let suggestion = self.agent.select_action(&state);

        self.close_transition(&state, suggestion);

        let mut handles = Vec::new();
        for vnf in self.enabled_types.clone() {
            if self.driver.live_count(vnf) < self.min_instances {
                let controller = self.clone();
                handles.push(tokio::spawn(async move {
                    controller.ensure_floor(vnf).await;
                }));
                continue;
            }
            match self.decide(vnf, &forecasts, suggestion) {
                Decision::Out => {
                    let controller = self.clone();
                    handles.push(tokio::spawn(async move {
                        controller.execute_scale_out(vnf).await;
                    }));
                }
                Decision::In => {
                    let controller = self.clone();
                    handles.push(tokio::spawn(async move {
                        controller.execute_scale_in(vnf).await;
                    }));
                }
                Decision::Hold => {}
            }
        }

        let tick = self.tick_count.fetch_add(1, Ordering::SeqCst) + 1;
        if tick % self.episode_length == 0 {
            let (episode, reward) = self.agent.end_episode();
            self.metrics
                .drl_episode_reward
                .with_label_values(&[])
                .set(reward);
            info!(episode, reward, "Episode closed");
            if episode % self.checkpoint_interval == 0 {
                if let Err(e) = self.agent.checkpoint() {
                    error!(error = %e, "Agent checkpoint failed");
                }
            }
        }

        handles
    }

    /// Detect instance-pool/flow-table corruption. A flow rule steering
    /// traffic at a removed instance means the tables have diverged: raise
    /// the alarm and freeze new chain allocations, preserving existing ones.
    fn audit_state(&self) {
        if self.allocator.in_safe_mode() {
            return;
        }
        for rule in self.flow.list_rules(None) {
            let valid = self
                .driver
                .get(rule.instance_id)
                .map(|i| i.state != InstanceState::Removed)
                .unwrap_or(false);
            if !valid {
                error!(
                    flow_id = %rule.flow_id,
                    instance = %rule.instance_id,
                    "ALARM: flow rule references a removed instance"
                );
                self.allocator.enter_safe_mode();
                return;
            }
        }
    }

    /// Cooldown phase decays back to steady once the timer expires
    fn expire_cooldowns(&self) {
        for vnf in &self.enabled_types {
            if self.phase(*vnf) == ScalingPhase::Cooldown && self.cooldown_expired(*vnf) {
                self.phases.insert(*vnf, ScalingPhase::Steady);
            }
        }
    }

    async fn gather_forecasts(&self) -> HashMap<VnfType, TypeForecasts> {
        let mut all = HashMap::new();
        for vnf in &self.enabled_types {
            let mut per_type = TypeForecasts::new();
            for metric in FORECAST_METRICS {
                let series = self.history.values(*vnf, metric);
                let total = self.history.total_recorded(*vnf, metric);
                match self.forecaster.forecast(*vnf, metric, &series, total).await {
                    Ok(forecast) => {
                        per_type.insert(metric, forecast);
                    }
                    // Forecast-unavailable is not an error at the control
                    // loop: threshold rules carry the decision alone
                    Err(_) => {}
                }
            }
            if !per_type.is_empty() {
                all.insert(*vnf, per_type);
            }
        }
        all
    }

    /// Observe the previous transition with its accumulated reward
    fn close_transition(&self, state: &[f64], suggestion: AgentAction) {
        let tick_reward = self.tick_reward();
        let mut previous = self.previous.lock().expect("transition lock");
        if let Some((prev_state, prev_action)) = previous.take() {
            let mut reward = self.agent.drain_pending_reward() + tick_reward;
            if matches!(prev_action, AgentAction::NoOp(_)) {
                reward += self.agent.rewards().no_op;
            }
            self.agent
                .observe(&prev_state, prev_action, reward, state, false);
        }
        *previous = Some((state.to_vec(), suggestion));
    }

    /// Environment-level reward shared by whatever action preceded this tick
    fn tick_reward(&self) -> f64 {
        let rewards = self.agent.rewards();
        let mut utilization_sum = 0.0;
        let mut observed = 0usize;
        let mut sla_violation = false;
        for vnf in &self.enabled_types {
            if let Some(aggregates) = self.history.aggregates(*vnf) {
                utilization_sum +=
                    (aggregates.cpu_percent + aggregates.memory_percent) / 2.0 / 100.0;
                observed += 1;
                if aggregates.latency_ms > self.thresholds.latency.upper {
                    sla_violation = true;
                }
            }
        }
        let mut reward = 0.0;
        if sla_violation {
            reward += rewards.sla_violation;
        } else if observed > 0 && utilization_sum / observed as f64 > 0.8 {
            reward += rewards.efficiency_bonus;
        }
        reward
    }

    fn decide(
        &self,
        vnf: VnfType,
        forecasts: &HashMap<VnfType, TypeForecasts>,
        suggestion: AgentAction,
    ) -> Decision {
        let Some(aggregates) = self.history.aggregates(vnf) else {
            return Decision::Hold;
        };

        let threshold_out = aggregates.cpu_percent > self.thresholds.cpu.upper
            || aggregates.memory_percent > self.thresholds.memory.upper
            || aggregates.latency_ms > self.thresholds.latency.upper;
        let threshold_in_band = aggregates.cpu_percent < self.thresholds.cpu.lower
            && aggregates.memory_percent < self.thresholds.memory.lower
            && aggregates.latency_ms < self.thresholds.latency.lower;
        let forecast_out = self.forecast_exceeds(vnf, forecasts);

        let cooldown_ok = self.cooldown_expired(vnf);
        let live = self.driver.live_count(vnf);
        let rewards = self.agent.rewards();

        // Agent suggestions are applied only when they respect the safety
        // rails; violations are penalized and suppressed for the cycle
        let mut agent_out = false;
        let mut agent_in = false;
        match suggestion {
            _ if !self.apply_suggestions => {}
            AgentAction::AllocateNew(t) if t == vnf => {
                if live >= self.max_instances {
                    self.agent.add_reward(rewards.invalid_action);
                } else if cooldown_ok {
                    agent_out = true;
                }
            }
            AgentAction::DrainOne(t) if t == vnf => {
                if live <= self.min_instances || self.last_active_serving_chains(vnf) {
                    self.agent.add_reward(rewards.invalid_action);
                } else if forecast_out {
                    // Teardown against a predicted load spike
                    self.agent.add_reward(rewards.unnecessary_teardown);
                } else if cooldown_ok && threshold_in_band {
                    agent_in = true;
                }
            }
            _ => {}
        }

        if !cooldown_ok {
            return Decision::Hold;
        }

        if (threshold_out || forecast_out || agent_out) && live < self.max_instances {
            return Decision::Out;
        }

        let rule_based_in = threshold_in_band && !forecast_out;
        if (rule_based_in || agent_in)
            && live > self.min_instances
            && !self.last_active_serving_chains(vnf)
        {
            return Decision::In;
        }

        Decision::Hold
    }

    /// Rule 2: any forecast value within the horizon exceeding its upper
    /// threshold with sufficient exceedance probability
    fn forecast_exceeds(&self, vnf: VnfType, forecasts: &HashMap<VnfType, TypeForecasts>) -> bool {
        let Some(per_type) = forecasts.get(&vnf) else {
            return false;
        };
        for (metric, forecast) in per_type {
            let upper = match metric {
                MetricKind::Cpu => self.thresholds.cpu.upper,
                MetricKind::Memory => self.thresholds.memory.upper,
                MetricKind::Latency => self.thresholds.latency.upper,
                MetricKind::Throughput => continue,
            };
            for step in 0..forecast.values.len() {
                if forecast.exceedance_probability(step, upper)
                    >= self.forecasting.confidence_threshold
                {
                    return true;
                }
            }
        }
        false
    }

    /// True when draining would leave chains of this type without any
    /// active instance
    fn last_active_serving_chains(&self, vnf: VnfType) -> bool {
        self.driver.active_count(vnf) <= 1 && self.chain_index.type_has_chains(vnf)
    }

    /// Bring a type up to min_instances; not a scale action, so it neither
    /// checks nor stamps the cooldown
    async fn ensure_floor(&self, vnf: VnfType) {
        let lock = self.type_lock(vnf);
        let _guard = lock.lock().await;
        while self.driver.live_count(vnf) < self.min_instances {
            match self.bring_up_instance(vnf).await {
                Ok(_) => {}
                Err(e) => {
                    warn!(vnf_type = %vnf, error = %e, "Floor instance failed to come up");
                    break;
                }
            }
        }
    }

    /// Rolling-update scale-out: create, await health, then route traffic
    #[instrument(skip(self))]
    async fn execute_scale_out(&self, vnf: VnfType) {
        let lock = self.type_lock(vnf);
        let _guard = lock.lock().await;
        let _permit = match self.budget.acquire().await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        // Cooldowns are re-checked under the pool lock to prevent duplicate
        // scale-out races
        if !self.cooldown_expired(vnf) || self.driver.live_count(vnf) >= self.max_instances {
            return;
        }
        self.phases.insert(vnf, ScalingPhase::ScalingOut);

        match self.bring_up_instance(vnf).await {
            Ok(instance_id) => {
                self.stamp_cooldown(vnf);
                self.metrics
                    .scaling_actions_total
                    .with_label_values(&[vnf.as_str(), "out"])
                    .inc();
                info!(vnf_type = %vnf, instance = %instance_id, "Scale-out complete");
            }
            Err(e) => {
                // Rolled back by the driver; the decision reverts to steady
                self.metrics
                    .scaling_actions_total
                    .with_label_values(&[vnf.as_str(), "failed"])
                    .inc();
                self.phases.insert(vnf, ScalingPhase::Steady);
                warn!(vnf_type = %vnf, error = %e, "Scale-out failed");
            }
        }
    }

    async fn bring_up_instance(&self, vnf: VnfType) -> crate::error::Result<Uuid> {
        let instance = self.driver.create(vnf).await?;
        self.driver.wait_active(instance.id).await?;
        // New rule first; the balancer starts routing to the new instance
        // before any old rule is ever removed
        self.flow
            .add_rule(vnf, instance.id, DEFAULT_FLOW_PRIORITY, None)?;
        Ok(instance.id)
    }

    /// Rolling-update scale-in: drain, unroute, wait, destroy
    #[instrument(skip(self))]
    async fn execute_scale_in(&self, vnf: VnfType) {
        let lock = self.type_lock(vnf);
        let _guard = lock.lock().await;
        let _permit = match self.budget.acquire().await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        if !self.cooldown_expired(vnf)
            || self.driver.live_count(vnf) <= self.min_instances
            || self.last_active_serving_chains(vnf)
        {
            return;
        }
        let Some(candidate) = self.drain_candidate(vnf) else {
            return;
        };
        self.phases.insert(vnf, ScalingPhase::ScalingIn);

        if let Err(e) = self.driver.drain(candidate) {
            warn!(vnf_type = %vnf, instance = %candidate, error = %e, "Drain refused");
            self.phases.insert(vnf, ScalingPhase::Steady);
            return;
        }
        for rule in self.flow.rules_for_instance(candidate) {
            if let Err(e) = self.flow.remove_rule(rule.flow_id) {
                warn!(flow_id = %rule.flow_id, error = %e, "Rule removal during scale-in failed");
            }
        }
        if let Err(e) = self.driver.complete_drain(candidate).await {
            warn!(instance = %candidate, error = %e, "Drain completion failed");
        }

        self.stamp_cooldown(vnf);
        self.metrics
            .scaling_actions_total
            .with_label_values(&[vnf.as_str(), "in"])
            .inc();
        info!(vnf_type = %vnf, instance = %candidate, "Scale-in complete");
    }

    /// Least-loaded active instance that no chain references. Instances
    /// carrying chains are never drained while an alternative exists.
    fn drain_candidate(&self, vnf: VnfType) -> Option<Uuid> {
        self.driver
            .list(vnf)
            .into_iter()
            .filter(|i| i.state == InstanceState::Active)
            .filter(|i| self.chain_index.chains_for_instance(i.id) == 0)
            .min_by(|a, b| {
                load_score(a.last_metrics.as_ref())
                    .total_cmp(&load_score(b.last_metrics.as_ref()))
            })
            .map(|i| i.id)
    }

    /// Normalized agent state: data-center headroom, per-type features,
    /// pending requests by priority band
    pub fn build_state(&self, forecasts: &HashMap<VnfType, TypeForecasts>) -> Vec<f64> {
        let mut state = Vec::with_capacity(state_dimension(self.enabled_types.len()));

        let mut cpu_sum = 0.0;
        let mut memory_sum = 0.0;
        let mut throughput_sum = 0.0;
        let mut observed = 0usize;
        let mut per_type: Vec<(usize, Option<Aggregates>)> = Vec::new();
        for vnf in &self.enabled_types {
            let aggregates = self.history.aggregates(*vnf);
            if let Some(a) = aggregates {
                cpu_sum += a.cpu_percent;
                memory_sum += a.memory_percent;
                throughput_sum += a.throughput_rps;
                observed += 1;
            }
            per_type.push((self.driver.live_count(*vnf), aggregates));
        }
        let denominator = observed.max(1) as f64;
        state.push((1.0 - cpu_sum / denominator / 100.0).clamp(0.0, 1.0));
        state.push((1.0 - memory_sum / denominator / 100.0).clamp(0.0, 1.0));
        state.push((1.0 - throughput_sum / BANDWIDTH_CAP_RPS).clamp(0.0, 1.0));

        for (vnf, (live, aggregates)) in self.enabled_types.iter().zip(per_type) {
            state.push((live as f64 / self.max_instances as f64).clamp(0.0, 1.0));
            let (cpu, memory, latency) = match aggregates {
                Some(a) => (a.cpu_percent, a.memory_percent, a.latency_ms),
                None => (0.0, 0.0, 0.0),
            };
            state.push((cpu / 100.0).clamp(0.0, 1.0));
            state.push((memory / 100.0).clamp(0.0, 1.0));
            state.push((latency / LATENCY_NORM_MS).clamp(0.0, 1.0));

            let cpu_forecast = forecasts
                .get(vnf)
                .and_then(|per_type| per_type.get(&MetricKind::Cpu));
            match cpu_forecast {
                Some(forecast) if !forecast.values.is_empty() => {
                    state.push((forecast.values[0] / 100.0).clamp(0.0, 1.0));
                    let width = forecast.upper[0] - forecast.lower[0];
                    state.push((width / 100.0).clamp(0.0, 1.0));
                }
                _ => {
                    state.push((cpu / 100.0).clamp(0.0, 1.0));
                    // Maximum uncertainty when no forecast is available
                    state.push(1.0);
                }
            }
        }

        for pending in self.allocator.pending_by_band() {
            state.push((pending as f64 / PENDING_NORM).clamp(0.0, 1.0));
        }
        state
    }

    pub fn phase(&self, vnf: VnfType) -> ScalingPhase {
        self.phases
            .get(&vnf)
            .map(|p| *p)
            .unwrap_or(ScalingPhase::Steady)
    }

    fn cooldown_expired(&self, vnf: VnfType) -> bool {
        self.cooldown_until
            .get(&vnf)
            .map(|deadline| Instant::now() >= *deadline)
            .unwrap_or(true)
    }

    fn stamp_cooldown(&self, vnf: VnfType) {
        self.cooldown_until.insert(
            vnf,
            Instant::now() + Duration::from_secs(self.control.cooldown),
        );
        self.phases.insert(vnf, ScalingPhase::Cooldown);
    }

    fn type_lock(&self, vnf: VnfType) -> Arc<AsyncMutex<()>> {
        self.type_locks
            .entry(vnf)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}

fn load_score(metrics: Option<&crate::types::InstanceMetrics>) -> f64 {
    match metrics {
        Some(m) => 0.4 * m.cpu_percent + 0.3 * m.memory_percent + 0.3 * m.latency_ms,
        None => 0.0,
    }
}
