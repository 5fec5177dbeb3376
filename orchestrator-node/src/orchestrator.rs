//! Component wiring and task lifecycle
//!
//! Builds the control plane from configuration and spawns one long-lived
//! task per duty: metrics exposition, flow API, scraper, control loop, and
//! the agent trainer.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{error, info};

use crate::agent::DrlAgent;
use crate::allocator::SfcAllocator;
use crate::api::{serve_flow_api, ApiState};
use crate::config::OrchestratorConfig;
use crate::driver::{ContainerApi, InstanceDriver};
use crate::error::Result;
use crate::flow::{ChainIndex, FlowController};
use crate::forecast::ForecastEngine;
use crate::registry::{MetricsRegistry, OrchestratorMetrics};
use crate::scaling::ScalingController;
use crate::scraper::{HistoryStore, MetricsScraper};
use crate::types::VnfType;

/// Interval between opportunistic train steps
const TRAIN_INTERVAL: Duration = Duration::from_secs(1);

/// A fully wired orchestrator control plane
pub struct Orchestrator {
    pub config: OrchestratorConfig,
    pub enabled_types: Vec<VnfType>,
    pub registry: Arc<MetricsRegistry>,
    pub metrics: OrchestratorMetrics,
    pub driver: Arc<InstanceDriver>,
    pub flow: Arc<FlowController>,
    pub history: Arc<HistoryStore>,
    pub forecaster: Arc<ForecastEngine>,
    pub agent: Arc<DrlAgent>,
    pub allocator: Arc<SfcAllocator>,
    pub controller: Arc<ScalingController>,
}

impl Orchestrator {
    /// Wire every component over the given container runtime adapter
    pub fn build(config: OrchestratorConfig, api: Arc<dyn ContainerApi>) -> Result<Self> {
        config.validate()?;
        let enabled_types = config.enabled_types()?;

        let registry = MetricsRegistry::new();
        let metrics = OrchestratorMetrics::register(&registry)?;
        let driver = InstanceDriver::new(api, config.rolling_update, &config.driver);
        let flow = FlowController::new(Arc::clone(&driver), ChainIndex::new());
        let history = HistoryStore::new(config.forecasting.window_size);
        let forecaster = ForecastEngine::new(config.forecasting, Some(metrics.clone()));
        let agent = Arc::new(DrlAgent::new(
            config.drl_config.clone(),
            enabled_types.clone(),
        ));
        let allocator = SfcAllocator::new(
            Arc::clone(&flow),
            Arc::clone(&driver),
            Some(Arc::clone(&agent)),
            Some(metrics.clone()),
            &config,
        )?;
        let controller = ScalingController::new(
            Arc::clone(&driver),
            Arc::clone(&flow),
            Arc::clone(&history),
            Arc::clone(&forecaster),
            Arc::clone(&agent),
            Arc::clone(&allocator),
            metrics.clone(),
            &config,
            enabled_types.clone(),
        );

        info!(
            vnf_types = ?enabled_types,
            min_instances = config.min_instances,
            max_instances = config.max_instances,
            "Orchestrator wired"
        );

        Ok(Self {
            config,
            enabled_types,
            registry,
            metrics,
            driver,
            flow,
            history,
            forecaster,
            agent,
            allocator,
            controller,
        })
    }

    /// Spawn the long-lived tasks. Returned handles stay alive for the
    /// lifetime of the process; dropping them does not cancel the tasks.
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let metrics_addr: SocketAddr = ([0, 0, 0, 0], self.config.http.metrics_port).into();
        self.registry.serve(metrics_addr);

        let flow_addr: SocketAddr = ([0, 0, 0, 0], self.config.http.flow_port).into();
        let api_state = ApiState {
            flow: Arc::clone(&self.flow),
            driver: Arc::clone(&self.driver),
        };
        handles.push(tokio::spawn(async move {
            if let Err(e) = serve_flow_api(api_state, flow_addr).await {
                error!(error = %e, "Flow API server failed");
            }
        }));

        let scraper = MetricsScraper::new(
            Arc::clone(&self.driver),
            Arc::clone(&self.history),
            self.metrics.clone(),
            self.config.scraper,
            self.enabled_types.clone(),
        );
        handles.push(tokio::spawn(scraper.run()));

        let controller = Arc::clone(&self.controller);
        handles.push(tokio::spawn(controller.run()));

        // Trainer: opportunistic optimization off the control-loop executor
        let agent = Arc::clone(&self.agent);
        handles.push(tokio::spawn(async move {
            let mut interval = time::interval(TRAIN_INTERVAL);
            loop {
                interval.tick().await;
                let trainer = Arc::clone(&agent);
                let result = tokio::task::spawn_blocking(move || trainer.train_step()).await;
                if let Err(e) = result {
                    error!(error = %e, "Train step panicked");
                }
            }
        }));

        handles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::SimulatedContainerApi;

    fn test_config() -> OrchestratorConfig {
        let mut config = OrchestratorConfig::default();
        config.drl_config.hidden_dim = 32;
        config.drl_config.model_path = "/nonexistent/model.json".into();
        config
    }

    #[tokio::test]
    async fn test_build_wires_all_components() {
        let api = SimulatedContainerApi::new();
        let orchestrator = Orchestrator::build(test_config(), api).unwrap();
        assert_eq!(orchestrator.enabled_types.len(), 6);
        assert_eq!(orchestrator.agent.action_dim(), 18);
    }

    #[tokio::test]
    async fn test_build_rejects_invalid_config() {
        let api = SimulatedContainerApi::new();
        let mut config = test_config();
        config.min_instances = 9;
        assert!(Orchestrator::build(config, api).is_err());
    }
}
