//! Common types used across the orchestrator

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Catalogued VNF types. Closed set; configuration enables a subset per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VnfType {
    Firewall,
    Antivirus,
    Spamfilter,
    EncryptionGateway,
    ContentFiltering,
    Mail,
}

impl VnfType {
    /// Full catalog, in canonical order
    pub const ALL: [VnfType; 6] = [
        VnfType::Firewall,
        VnfType::Antivirus,
        VnfType::Spamfilter,
        VnfType::EncryptionGateway,
        VnfType::ContentFiltering,
        VnfType::Mail,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            VnfType::Firewall => "firewall",
            VnfType::Antivirus => "antivirus",
            VnfType::Spamfilter => "spamfilter",
            VnfType::EncryptionGateway => "encryption_gateway",
            VnfType::ContentFiltering => "content_filtering",
            VnfType::Mail => "mail",
        }
    }
}

impl fmt::Display for VnfType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VnfType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "firewall" => Ok(VnfType::Firewall),
            "antivirus" => Ok(VnfType::Antivirus),
            "spamfilter" => Ok(VnfType::Spamfilter),
            "encryption_gateway" => Ok(VnfType::EncryptionGateway),
            "content_filtering" => Ok(VnfType::ContentFiltering),
            "mail" => Ok(VnfType::Mail),
            other => Err(format!("unknown vnf type '{other}'")),
        }
    }
}

/// Instance health state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    /// Launched, health probe not yet passed
    Starting,
    /// Healthy and eligible for traffic
    Active,
    /// Being removed; no new traffic directed to it
    Draining,
    /// Container destroyed
    Removed,
}

/// Last-observed per-instance metrics
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct InstanceMetrics {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub latency_ms: f64,
    pub throughput_rps: f64,
}

/// A running VNF instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    /// Stable instance identifier
    pub id: Uuid,
    /// VNF type
    pub vnf_type: VnfType,
    /// Backing container identifier assigned by the runtime
    pub container_id: String,
    /// Health state
    pub state: InstanceState,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last observed metrics, if any scrape succeeded
    pub last_metrics: Option<InstanceMetrics>,
    /// Timestamp of the last successful scrape
    pub last_scraped: Option<DateTime<Utc>>,
    /// Consecutive failed scrapes/probes
    pub failed_probes: u32,
}

impl Instance {
    /// Whether this instance's metrics participate in aggregates
    pub fn is_healthy(&self, max_failures: u32) -> bool {
        self.failed_probes < max_failures
    }
}

/// Metric names tracked per VNF type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Cpu,
    Memory,
    Latency,
    Throughput,
}

impl MetricKind {
    pub const ALL: [MetricKind; 4] = [
        MetricKind::Cpu,
        MetricKind::Memory,
        MetricKind::Latency,
        MetricKind::Throughput,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Cpu => "cpu",
            MetricKind::Memory => "memory",
            MetricKind::Latency => "latency",
            MetricKind::Throughput => "throughput",
        }
    }

    /// Throughput aggregates by sum, everything else by arithmetic mean
    pub fn aggregates_by_sum(&self) -> bool {
        matches!(self, MetricKind::Throughput)
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Flow rule status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowRuleStatus {
    Active,
    Removed,
}

/// A flow-steering rule directing traffic of a VNF type to one instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRule {
    pub flow_id: Uuid,
    pub vnf_type: VnfType,
    pub instance_id: Uuid,
    pub priority: u32,
    pub status: FlowRuleStatus,
    /// Chain that owns this rule, if it was installed by the allocator
    pub chain_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Traffic direction of a chain request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainDirection {
    /// Sender to server
    Inbound,
    /// Server to receiver
    Outbound,
    /// Both directions; a complementary chain is allocated as well
    Bidirectional,
}

/// Email-security chain categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainCategory {
    InboundUserProtection,
    OutboundDataProtectionCompliance,
    AuthAndAntiSpoofEnforcement,
    AttachmentRiskReduction,
    BranchCloudSaasAccess,
}

impl ChainCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainCategory::InboundUserProtection => "inbound_user_protection",
            ChainCategory::OutboundDataProtectionCompliance => {
                "outbound_data_protection_compliance"
            }
            ChainCategory::AuthAndAntiSpoofEnforcement => "auth_and_anti_spoof_enforcement",
            ChainCategory::AttachmentRiskReduction => "attachment_risk_reduction",
            ChainCategory::BranchCloudSaasAccess => "branch_cloud_saas_access",
        }
    }
}

/// A typed chain request. Immutable after construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainRequest {
    pub request_id: String,
    pub category: ChainCategory,
    pub direction: ChainDirection,
    /// Ordered VNF types the traffic must traverse
    pub chain: Vec<VnfType>,
    /// Priority 1 (lowest) to 10 (highest)
    pub priority: u8,
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
}

/// Chain instance status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainStatus {
    Allocating,
    Active,
    Failed,
    TornDown,
}

/// A realized chain: concrete instances and flow rules bound to a request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainInstance {
    pub chain_id: String,
    pub request: ChainRequest,
    /// VNF type -> allocated instance id, in chain order
    pub allocated: Vec<(VnfType, Uuid)>,
    /// Installed flow rule ids, in chain order
    pub flow_rules: Vec<Uuid>,
    pub status: ChainStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    /// Observed end-to-end latency samples in milliseconds
    pub latency_samples: Vec<f64>,
}

/// Discrete action space of the learning agent: three actions per VNF type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action", content = "vnf_type")]
pub enum AgentAction {
    AllocateNew(VnfType),
    DrainOne(VnfType),
    NoOp(VnfType),
}

impl AgentAction {
    /// Index within the 3K-sized action space for the given enabled types
    pub fn to_index(&self, types: &[VnfType]) -> Option<usize> {
        let (vnf, offset) = match self {
            AgentAction::AllocateNew(v) => (v, 0),
            AgentAction::DrainOne(v) => (v, 1),
            AgentAction::NoOp(v) => (v, 2),
        };
        types.iter().position(|t| t == vnf).map(|i| i * 3 + offset)
    }

    /// Decode an action index back into the tagged variant
    pub fn from_index(index: usize, types: &[VnfType]) -> Option<AgentAction> {
        let vnf = *types.get(index / 3)?;
        match index % 3 {
            0 => Some(AgentAction::AllocateNew(vnf)),
            1 => Some(AgentAction::DrainOne(vnf)),
            _ => Some(AgentAction::NoOp(vnf)),
        }
    }

    pub fn vnf_type(&self) -> VnfType {
        match self {
            AgentAction::AllocateNew(v) | AgentAction::DrainOne(v) | AgentAction::NoOp(v) => *v,
        }
    }
}

/// Per-type scaling state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingPhase {
    Steady,
    ScalingOut,
    ScalingIn,
    Cooldown,
}

/// Aggregated metrics for a VNF type at one scrape
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Aggregates {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub latency_ms: f64,
    pub throughput_rps: f64,
    /// Healthy instances contributing to the aggregate
    pub sample_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vnf_type_round_trip() {
        for vnf in VnfType::ALL {
            let parsed: VnfType = vnf.as_str().parse().unwrap();
            assert_eq!(parsed, vnf);
        }
        assert!("packet_shaper".parse::<VnfType>().is_err());
    }

    #[test]
    fn test_vnf_type_serde_tag() {
        let json = serde_json::to_string(&VnfType::EncryptionGateway).unwrap();
        assert_eq!(json, "\"encryption_gateway\"");
    }

    #[test]
    fn test_action_index_round_trip() {
        let types = vec![VnfType::Firewall, VnfType::Spamfilter, VnfType::Mail];
        for index in 0..types.len() * 3 {
            let action = AgentAction::from_index(index, &types).unwrap();
            assert_eq!(action.to_index(&types), Some(index));
        }
        assert!(AgentAction::from_index(9, &types).is_none());
    }

    #[test]
    fn test_instance_health_window() {
        let instance = Instance {
            id: Uuid::new_v4(),
            vnf_type: VnfType::Firewall,
            container_id: "c-1".into(),
            state: InstanceState::Active,
            created_at: Utc::now(),
            last_metrics: None,
            last_scraped: None,
            failed_probes: 2,
        };
        assert!(instance.is_healthy(3));
        assert!(!instance.is_healthy(2));
    }
}
