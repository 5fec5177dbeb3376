use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use tracing::info;

use crate::error::{OrchestratorError, Result};
use crate::types::{ChainCategory, ChainDirection, VnfType};

/// Main configuration for the orchestrator control plane.
///
/// Loaded from a TOML file; unrecognized keys are rejected at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OrchestratorConfig {
    /// VNF types enabled for this run (closed catalog, see [`VnfType`])
    pub vnf_types: Vec<String>,
    /// Lower bound on instances per type
    pub min_instances: usize,
    /// Upper bound on instances per type
    pub max_instances: usize,
    /// Threshold rule values
    pub scaling_thresholds: ScalingThresholds,
    /// ARIMA forecasting parameters
    pub forecasting: ForecastingConfig,
    /// Rolling update timers
    pub rolling_update: RollingUpdateConfig,
    /// Metrics scraper parameters
    pub scraper: ScraperConfig,
    /// Learning agent hyperparameters
    pub drl_config: DrlConfig,
    /// Control loop cadence
    pub control_loop: ControlLoopConfig,
    /// HTTP listen ports
    pub http: HttpConfig,
    /// SFC allocator parameters and chain catalog
    pub sfc: SfcConfig,
    /// Container driver parameters
    pub driver: DriverConfig,
}

/// Upper/lower threshold pair for one metric
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ThresholdPair {
    pub upper: f64,
    pub lower: f64,
}

/// Threshold rule values driving reactive scaling
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScalingThresholds {
    /// CPU usage percent
    pub cpu: ThresholdPair,
    /// Memory usage percent
    pub memory: ThresholdPair,
    /// Processing latency in milliseconds
    pub latency: ThresholdPair,
}

/// Forecasting engine parameters
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ForecastingConfig {
    /// Ring buffer length W per (type, metric) series
    pub window_size: usize,
    /// Forecast horizon h in steps
    pub forecast_steps: usize,
    /// Exceedance probability required before a forecast may trigger scaling
    pub confidence_threshold: f64,
    /// Confidence level for forecast bounds
    pub confidence_level: f64,
}

/// Rolling update timers, in seconds
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RollingUpdateConfig {
    /// T_h: deadline for a new instance to pass its health probe
    pub health_check_timeout: u64,
    /// T_d: time a draining instance keeps serving in-flight traffic
    pub drain_timeout: u64,
    /// Extra grace after the drain timeout before destroy
    pub grace_period: u64,
}

/// Metrics scraper parameters
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScraperConfig {
    /// Scrape period in seconds
    pub interval: u64,
    /// Consecutive probe failures before an instance is marked unhealthy
    pub probe_failures: u32,
    /// Per-instance scrape timeout in seconds
    pub probe_timeout: u64,
}

/// Reward weights for the learning agent; see the decision loop for usage
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RewardWeights {
    pub chain_satisfied: f64,
    pub chain_dropped: f64,
    pub invalid_action: f64,
    pub unnecessary_teardown: f64,
    pub efficiency_bonus: f64,
    pub sla_violation: f64,
    pub no_op: f64,
}

impl Default for RewardWeights {
    fn default() -> Self {
        Self {
            chain_satisfied: 2.0,
            chain_dropped: -1.5,
            invalid_action: -1.0,
            unnecessary_teardown: -0.5,
            efficiency_bonus: 0.3,
            sla_violation: -0.8,
            no_op: -0.1,
        }
    }
}

/// Learning agent hyperparameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DrlConfig {
    pub learning_rate: f64,
    pub batch_size: usize,
    /// Replay buffer capacity
    pub memory_size: usize,
    pub gamma: f64,
    pub epsilon_start: f64,
    pub epsilon_min: f64,
    pub epsilon_decay: f64,
    /// Hard-sync period for the target network, in train steps
    pub target_update_freq: u64,
    /// Checkpoint artifact path
    pub model_path: String,
    /// Hidden layer width
    pub hidden_dim: usize,
    /// RNG seed for reproducible exploration
    pub seed: u64,
    /// When false the agent still observes and trains, but its suggestions
    /// are never applied (rule-only blending)
    pub apply_suggestions: bool,
    /// Control ticks per episode
    pub episode_length: u64,
    /// Checkpoint every this many episodes
    pub checkpoint_interval: u64,
    pub rewards: RewardWeights,
}

/// Control loop cadence, in seconds
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ControlLoopConfig {
    pub tick_interval: u64,
    /// T_c: per-type cooldown after any scale action
    pub cooldown: u64,
    /// Global bound on concurrent scale operations
    pub max_concurrent_scales: usize,
}

/// HTTP listen ports
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpConfig {
    pub metrics_port: u16,
    pub flow_port: u16,
}

/// One catalogued chain shape
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChainTemplate {
    /// Ordered VNF types
    pub chain: Vec<String>,
    pub direction: String,
    /// End-to-end latency objective in milliseconds
    pub latency_objective_ms: f64,
}

/// SFC allocator parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SfcConfig {
    /// Per-instance concurrent-chain reservation cap
    pub reservation_cap: u32,
    /// Chain catalog overrides, keyed by category tag
    #[serde(default)]
    pub request_types: HashMap<String, ChainTemplate>,
}

/// Container driver parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DriverConfig {
    /// Image name prefix; the image for a type is `{prefix}{type}-vnf`
    pub image_prefix: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            vnf_types: vec![
                "firewall".into(),
                "antivirus".into(),
                "spamfilter".into(),
                "encryption_gateway".into(),
                "content_filtering".into(),
                "mail".into(),
            ],
            min_instances: 1,
            max_instances: 5,
            scaling_thresholds: ScalingThresholds {
                cpu: ThresholdPair {
                    upper: 80.0,
                    lower: 30.0,
                },
                memory: ThresholdPair {
                    upper: 85.0,
                    lower: 40.0,
                },
                latency: ThresholdPair {
                    upper: 1000.0,
                    lower: 200.0,
                },
            },
            forecasting: ForecastingConfig {
                window_size: 20,
                forecast_steps: 3,
                confidence_threshold: 0.7,
                confidence_level: 0.95,
            },
            rolling_update: RollingUpdateConfig {
                health_check_timeout: 30,
                drain_timeout: 60,
                grace_period: 10,
            },
            scraper: ScraperConfig {
                interval: 15,
                probe_failures: 3,
                probe_timeout: 2,
            },
            drl_config: DrlConfig {
                learning_rate: 0.001,
                batch_size: 32,
                memory_size: 10_000,
                gamma: 0.99,
                epsilon_start: 1.0,
                epsilon_min: 0.01,
                epsilon_decay: 0.995,
                target_update_freq: 100,
                model_path: "models/drl_agent.json".into(),
                hidden_dim: 128,
                seed: 42,
                apply_suggestions: true,
                episode_length: 20,
                checkpoint_interval: 10,
                rewards: RewardWeights::default(),
            },
            control_loop: ControlLoopConfig {
                tick_interval: 60,
                cooldown: 120,
                max_concurrent_scales: 3,
            },
            http: HttpConfig {
                metrics_port: 9090,
                flow_port: 8080,
            },
            sfc: SfcConfig {
                reservation_cap: 64,
                request_types: HashMap::new(),
            },
            driver: DriverConfig {
                image_prefix: "my-".into(),
            },
        }
    }
}

impl OrchestratorConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            OrchestratorError::Config(format!(
                "cannot read {}: {e}",
                path.as_ref().display()
            ))
        })?;
        let config: OrchestratorConfig = toml::from_str(&raw)?;
        config.validate()?;
        info!(path = %path.as_ref().display(), "Configuration loaded");
        Ok(config)
    }

    /// Enabled VNF types, parsed and order-preserving
    pub fn enabled_types(&self) -> Result<Vec<VnfType>> {
        let mut types = Vec::with_capacity(self.vnf_types.len());
        for tag in &self.vnf_types {
            let vnf = VnfType::from_str(tag).map_err(OrchestratorError::Config)?;
            if types.contains(&vnf) {
                return Err(OrchestratorError::Config(format!(
                    "duplicate vnf type '{tag}'"
                )));
            }
            types.push(vnf);
        }
        Ok(types)
    }

    /// Chain catalog: configuration overrides on top of the built-in defaults
    pub fn chain_catalog(&self) -> Result<HashMap<ChainCategory, (Vec<VnfType>, ChainDirection, f64)>> {
        let mut catalog = default_chain_catalog();
        for (tag, template) in &self.sfc.request_types {
            let category = parse_category(tag)?;
            let mut chain = Vec::with_capacity(template.chain.len());
            for vnf in &template.chain {
                chain.push(VnfType::from_str(vnf).map_err(OrchestratorError::Config)?);
            }
            let direction = parse_direction(&template.direction)?;
            catalog.insert(category, (chain, direction, template.latency_objective_ms));
        }
        Ok(catalog)
    }

    /// Validate bounds and cross-field consistency
    pub fn validate(&self) -> Result<()> {
        if self.vnf_types.is_empty() {
            return Err(OrchestratorError::Config("vnf_types must not be empty".into()));
        }
        self.enabled_types()?;
        if self.min_instances == 0 {
            return Err(OrchestratorError::Config("min_instances must be >= 1".into()));
        }
        if self.min_instances > self.max_instances {
            return Err(OrchestratorError::Config(
                "min_instances must not exceed max_instances".into(),
            ));
        }
        for (name, pair) in [
            ("cpu", self.scaling_thresholds.cpu),
            ("memory", self.scaling_thresholds.memory),
            ("latency", self.scaling_thresholds.latency),
        ] {
            if pair.lower >= pair.upper {
                return Err(OrchestratorError::Config(format!(
                    "scaling_thresholds.{name}: lower must be below upper"
                )));
            }
        }
        if self.forecasting.window_size < 8 {
            return Err(OrchestratorError::Config(
                "forecasting.window_size must be >= 8".into(),
            ));
        }
        if self.forecasting.forecast_steps == 0 {
            return Err(OrchestratorError::Config(
                "forecasting.forecast_steps must be >= 1".into(),
            ));
        }
        if !(0.5..1.0).contains(&self.forecasting.confidence_level) {
            return Err(OrchestratorError::Config(
                "forecasting.confidence_level must be in [0.5, 1.0)".into(),
            ));
        }
        if self.drl_config.batch_size == 0 || self.drl_config.batch_size > self.drl_config.memory_size {
            return Err(OrchestratorError::Config(
                "drl_config.batch_size must be in [1, memory_size]".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.drl_config.gamma) {
            return Err(OrchestratorError::Config("drl_config.gamma must be in [0, 1]".into()));
        }
        if !(0.0..1.0).contains(&self.drl_config.epsilon_decay) {
            return Err(OrchestratorError::Config(
                "drl_config.epsilon_decay must be in (0, 1)".into(),
            ));
        }
        if self.drl_config.hidden_dim == 0 || self.drl_config.hidden_dim % 8 != 0 {
            return Err(OrchestratorError::Config(
                "drl_config.hidden_dim must be a positive multiple of 8".into(),
            ));
        }
        if self.control_loop.tick_interval == 0 {
            return Err(OrchestratorError::Config(
                "control_loop.tick_interval must be > 0".into(),
            ));
        }
        if self.control_loop.max_concurrent_scales == 0 {
            return Err(OrchestratorError::Config(
                "control_loop.max_concurrent_scales must be > 0".into(),
            ));
        }
        if self.http.metrics_port == 0 || self.http.flow_port == 0 {
            return Err(OrchestratorError::Config("listen ports must be non-zero".into()));
        }
        if self.http.metrics_port == self.http.flow_port {
            return Err(OrchestratorError::Config(
                "metrics_port and flow_port must differ".into(),
            ));
        }
        if self.sfc.reservation_cap == 0 {
            return Err(OrchestratorError::Config(
                "sfc.reservation_cap must be > 0".into(),
            ));
        }
        // Catalog overrides must parse
        self.chain_catalog()?;
        Ok(())
    }
}

fn parse_category(tag: &str) -> Result<ChainCategory> {
    let category = match tag {
        "inbound_user_protection" => ChainCategory::InboundUserProtection,
        "outbound_data_protection_compliance" => ChainCategory::OutboundDataProtectionCompliance,
        "auth_and_anti_spoof_enforcement" => ChainCategory::AuthAndAntiSpoofEnforcement,
        "attachment_risk_reduction" => ChainCategory::AttachmentRiskReduction,
        "branch_cloud_saas_access" => ChainCategory::BranchCloudSaasAccess,
        other => {
            return Err(OrchestratorError::Config(format!(
                "unknown sfc request type '{other}'"
            )))
        }
    };
    Ok(category)
}

fn parse_direction(tag: &str) -> Result<ChainDirection> {
    match tag {
        "inbound" => Ok(ChainDirection::Inbound),
        "outbound" => Ok(ChainDirection::Outbound),
        "bidirectional" => Ok(ChainDirection::Bidirectional),
        other => Err(OrchestratorError::Config(format!(
            "unknown chain direction '{other}'"
        ))),
    }
}

/// Built-in chain catalog for the five email-security categories
pub fn default_chain_catalog() -> HashMap<ChainCategory, (Vec<VnfType>, ChainDirection, f64)> {
    use ChainCategory::*;
    use VnfType::*;
    HashMap::from([
        (
            InboundUserProtection,
            (
                vec![Firewall, Antivirus, Spamfilter, Mail],
                ChainDirection::Inbound,
                100.0,
            ),
        ),
        (
            OutboundDataProtectionCompliance,
            (
                vec![Mail, ContentFiltering, EncryptionGateway, Firewall],
                ChainDirection::Outbound,
                200.0,
            ),
        ),
        (
            AuthAndAntiSpoofEnforcement,
            (
                vec![Firewall, Spamfilter, Mail],
                ChainDirection::Bidirectional,
                50.0,
            ),
        ),
        (
            AttachmentRiskReduction,
            (
                vec![Firewall, Antivirus, ContentFiltering, Mail],
                ChainDirection::Inbound,
                500.0,
            ),
        ),
        (
            BranchCloudSaasAccess,
            (
                vec![Firewall, EncryptionGateway, ContentFiltering],
                ChainDirection::Bidirectional,
                150.0,
            ),
        ),
    ])
}
