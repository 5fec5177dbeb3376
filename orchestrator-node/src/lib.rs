//! SFC Orchestrator Control Plane
//!
//! Provisions service function chains for email-security traffic: decides
//! how many instances of each VNF type to run, steers traffic between them,
//! and scales proactively from seasonal ARIMA forecasts blended with a
//! learning agent and rule-based thresholds.

pub mod agent;
pub mod allocator;
pub mod api;
pub mod config;
pub mod driver;
pub mod error;
pub mod flow;
pub mod forecast;
pub mod orchestrator;
pub mod registry;
pub mod scaling;
pub mod scraper;
pub mod selftest;
pub mod types;

// Re-export commonly used types
pub use agent::DrlAgent;
pub use allocator::{ChainAllocation, SfcAllocator};
pub use config::OrchestratorConfig;
pub use driver::{ContainerApi, InstanceDriver, SimulatedContainerApi};
pub use error::{OrchestratorError, Result};
pub use flow::{ChainIndex, FlowController};
pub use forecast::{Forecast, ForecastEngine};
pub use orchestrator::Orchestrator;
pub use registry::{MetricsRegistry, OrchestratorMetrics};
pub use scaling::ScalingController;
pub use scraper::{HistoryStore, MetricsScraper};
pub use types::{
    AgentAction, ChainInstance, ChainRequest, FlowRule, Instance, InstanceState, VnfType,
};
