//! Integration tests for the orchestrator control plane
//!
//! Cross-component properties: pool bounds, rolling-update monotonicity,
//! flow-rule consistency, cooldown spacing, and registration idempotency.

use std::sync::Arc;
use std::time::Duration;

use orchestrator_node::config::{DriverConfig, OrchestratorConfig, RollingUpdateConfig};
use orchestrator_node::driver::SimulatedContainerApi;
use orchestrator_node::orchestrator::Orchestrator;
use orchestrator_node::registry::{InstrumentKind, MetricsRegistry};
use orchestrator_node::types::{Aggregates, InstanceState, ScalingPhase, VnfType};

fn test_config(types: &[VnfType]) -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.vnf_types = types.iter().map(|t| t.to_string()).collect();
    config.rolling_update = RollingUpdateConfig {
        health_check_timeout: 2,
        drain_timeout: 0,
        grace_period: 0,
    };
    config.driver = DriverConfig {
        image_prefix: "my-".into(),
    };
    config.drl_config.hidden_dim = 32;
    config.drl_config.model_path = "/nonexistent/model.json".into();
    config.drl_config.apply_suggestions = false;
    config
}

fn simulated_runtime() -> Arc<SimulatedContainerApi> {
    let api = SimulatedContainerApi::new();
    for vnf in VnfType::ALL {
        api.register_image(&format!("my-{vnf}-vnf"));
    }
    api
}

fn build(types: &[VnfType]) -> Orchestrator {
    Orchestrator::build(test_config(types), simulated_runtime()).unwrap()
}

async fn run_tick(orchestrator: &Orchestrator) {
    for handle in orchestrator.controller.tick().await {
        handle.await.unwrap();
    }
}

fn aggregates(cpu: f64, memory: f64, latency: f64) -> Aggregates {
    Aggregates {
        cpu_percent: cpu,
        memory_percent: memory,
        latency_ms: latency,
        throughput_rps: 100.0,
        sample_count: 1,
    }
}

mod pool_bounds {
    use super::*;

    #[tokio::test]
    async fn live_count_stays_within_bounds_under_pressure() {
        let orchestrator = build(&[VnfType::Firewall]);
        let min = orchestrator.config.min_instances;
        let max = orchestrator.config.max_instances;

        // Keep load high over many ticks; cooldown limits scale-outs but
        // the bound must hold at every observation
        for round in 0..4 {
            orchestrator
                .history
                .set_aggregates(VnfType::Firewall, aggregates(95.0, 90.0, 1500.0));
            run_tick(&orchestrator).await;
            let live = orchestrator.driver.live_count(VnfType::Firewall);
            assert!(
                live >= min && live <= max,
                "round {round}: live {live} outside [{min}, {max}]"
            );
        }
    }

    #[tokio::test]
    async fn scale_out_refused_at_max() {
        let mut config = test_config(&[VnfType::Mail]);
        config.max_instances = 1;
        let orchestrator =
            Orchestrator::build(config, simulated_runtime()).unwrap();

        run_tick(&orchestrator).await;
        orchestrator
            .history
            .set_aggregates(VnfType::Mail, aggregates(99.0, 99.0, 2000.0));
        run_tick(&orchestrator).await;
        assert_eq!(orchestrator.driver.live_count(VnfType::Mail), 1);
    }
}

mod rolling_update {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn serving_type_always_has_an_active_instance() {
        let orchestrator = build(&[VnfType::Firewall]);
        run_tick(&orchestrator).await;

        // An active chain pins the type
        let first = orchestrator.flow.next_instance(VnfType::Firewall).unwrap();
        orchestrator
            .flow
            .chain_index()
            .link("chain-ru", VnfType::Firewall, first.id);

        // Scale out: at every step next_instance returns an active instance
        orchestrator
            .history
            .set_aggregates(VnfType::Firewall, aggregates(95.0, 50.0, 100.0));
        let handles = orchestrator.controller.tick().await;
        for _ in 0..10 {
            if let Some(picked) = orchestrator.flow.next_instance(VnfType::Firewall) {
                assert_eq!(picked.state, InstanceState::Active);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(orchestrator.driver.live_count(VnfType::Firewall), 2);

        // Scale in after the cooldown: the draining instance is skipped and
        // one active instance remains throughout
        tokio::time::advance(Duration::from_secs(
            orchestrator.config.control_loop.cooldown + 1,
        ))
        .await;
        orchestrator
            .history
            .set_aggregates(VnfType::Firewall, aggregates(10.0, 10.0, 20.0));
        let handles = orchestrator.controller.tick().await;
        for _ in 0..10 {
            let picked = orchestrator
                .flow
                .next_instance(VnfType::Firewall)
                .expect("an active instance must exist during scale-in");
            assert_eq!(picked.state, InstanceState::Active);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(orchestrator.driver.active_count(VnfType::Firewall), 1);
    }
}

mod flow_consistency {
    use super::*;

    #[tokio::test]
    async fn active_rules_reference_live_instances_only() {
        let orchestrator = build(&[VnfType::Spamfilter]);
        run_tick(&orchestrator).await;

        orchestrator
            .history
            .set_aggregates(VnfType::Spamfilter, aggregates(95.0, 50.0, 100.0));
        run_tick(&orchestrator).await;

        for rule in orchestrator.flow.list_rules(None) {
            let instance = orchestrator.driver.get(rule.instance_id).unwrap();
            assert!(
                matches!(
                    instance.state,
                    InstanceState::Active | InstanceState::Draining
                ),
                "rule {} references instance in state {:?}",
                rule.flow_id,
                instance.state
            );
        }
    }
}

mod cooldown {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn consecutive_actions_separated_by_cooldown() {
        let orchestrator = build(&[VnfType::Firewall]);
        run_tick(&orchestrator).await;

        orchestrator
            .history
            .set_aggregates(VnfType::Firewall, aggregates(95.0, 90.0, 1500.0));
        run_tick(&orchestrator).await;
        assert_eq!(orchestrator.driver.live_count(VnfType::Firewall), 2);
        assert_eq!(
            orchestrator.controller.phase(VnfType::Firewall),
            ScalingPhase::Cooldown
        );

        // Just inside the cooldown window: still suppressed
        tokio::time::advance(Duration::from_secs(
            orchestrator.config.control_loop.cooldown - 1,
        ))
        .await;
        run_tick(&orchestrator).await;
        assert_eq!(orchestrator.driver.live_count(VnfType::Firewall), 2);

        // Past the window: the next action is allowed
        tokio::time::advance(Duration::from_secs(2)).await;
        run_tick(&orchestrator).await;
        assert_eq!(orchestrator.driver.live_count(VnfType::Firewall), 3);
    }
}

mod registration {
    use super::*;

    #[test]
    fn repeated_registration_does_not_change_exposition() {
        let registry = MetricsRegistry::new();
        let first = registry
            .get_or_create(InstrumentKind::Gauge, "g", &["zone"], "test gauge")
            .unwrap();
        first
            .as_gauge()
            .unwrap()
            .with_label_values(&["a"])
            .set(7.0);
        let before = registry.render();

        for _ in 0..5 {
            registry
                .get_or_create(InstrumentKind::Gauge, "g", &["zone"], "test gauge")
                .unwrap();
        }
        assert_eq!(registry.render(), before);
    }
}
