//! Scripted self-test scenarios for the `test1`/`test2`/`test3` subcommands.
//!
//! Each suite builds a fresh control plane over the simulated container
//! runtime with shortened timers, drives one end-to-end scenario, and
//! reports per-check outcomes. `testall` runs every suite.

use chrono::Utc;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::api::{create_flow_router, ApiState};
use crate::config::{DriverConfig, OrchestratorConfig, RollingUpdateConfig};
use crate::driver::SimulatedContainerApi;
use crate::error::{OrchestratorError, Result};
use crate::orchestrator::Orchestrator;
use crate::types::{ChainDirection, MetricKind, VnfType};

/// One verified assertion of a suite
#[derive(Debug)]
pub struct Check {
    pub name: &'static str,
    pub passed: bool,
    pub detail: String,
}

impl Check {
    fn new(name: &'static str, passed: bool, detail: impl Into<String>) -> Self {
        Self {
            name,
            passed,
            detail: detail.into(),
        }
    }
}

fn test_config(types: &[VnfType]) -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.vnf_types = types.iter().map(|t| t.to_string()).collect();
    config.rolling_update = RollingUpdateConfig {
        health_check_timeout: 5,
        drain_timeout: 0,
        grace_period: 0,
    };
    config.driver = DriverConfig {
        image_prefix: "my-".into(),
    };
    config.drl_config.hidden_dim = 32;
    config.drl_config.model_path = "/tmp/orchestrator-selftest-agent.json".into();
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

async fn run_tick(orchestrator: &Orchestrator) {
    for handle in orchestrator.controller.tick().await {
        let _ = handle.await;
    }
}

/// Suite 1: forecast-driven proactive scale-out.
/// A flat CPU series ramps sharply; the forecaster must predict the breach
/// and the controller must scale out before the current load crosses the
/// threshold.
pub async fn test1() -> Result<Vec<Check>> {
    info!("Running suite 1: proactive scale-out");
    let types = vec![VnfType::Firewall];
    let api = simulated_runtime();
    let orchestrator = Orchestrator::build(test_config(&types), api)?;
    let mut checks = Vec::new();

    run_tick(&orchestrator).await; // establish the instance floor
    checks.push(Check::new(
        "instance floor established",
        orchestrator.driver.live_count(VnfType::Firewall) == 1,
        format!("live={}", orchestrator.driver.live_count(VnfType::Firewall)),
    ));

    // Flat history with a sharp linear ramp at the end
    let mut series = vec![30.0; 15];
    series.extend([42.0, 54.0, 66.0, 78.0, 90.0]);
    let base = Utc::now() - chrono::Duration::seconds(600);
    for (i, value) in series.iter().enumerate() {
        orchestrator.history.record(
            VnfType::Firewall,
            MetricKind::Cpu,
            base + chrono::Duration::seconds(15 * i as i64),
            *value,
        );
    }
    let total = orchestrator
        .history
        .total_recorded(VnfType::Firewall, MetricKind::Cpu);
    let forecast = orchestrator
        .forecaster
        .forecast(VnfType::Firewall, MetricKind::Cpu, &series, total)
        .await?;
    let horizon = forecast.values.len() - 1;
    checks.push(Check::new(
        "forecast predicts threshold breach",
        forecast.values[horizon] > 80.0 && forecast.lower[horizon] > 70.0,
        format!(
            "point={:.1} lower={:.1}",
            forecast.values[horizon], forecast.lower[horizon]
        ),
    ));

    // Aggregates are still below thresholds; the forecast alone must act
    orchestrator.history.set_aggregates(
        VnfType::Firewall,
        crate::types::Aggregates {
            cpu_percent: 60.0,
            memory_percent: 50.0,
            latency_ms: 100.0,
            throughput_rps: 100.0,
            sample_count: 1,
        },
    );
    run_tick(&orchestrator).await;

    checks.push(Check::new(
        "proactive scale-out performed",
        orchestrator.driver.live_count(VnfType::Firewall) == 2,
        format!("live={}", orchestrator.driver.live_count(VnfType::Firewall)),
    ));
    checks.push(Check::new(
        "scale-out counted once",
        orchestrator
            .registry
            .render()
            .contains("scaling_actions_total{action=\"out\",vnf_type=\"firewall\"} 1"),
        "scaling_actions_total{vnf_type=\"firewall\",action=\"out\"}",
    ));
    checks.push(Check::new(
        "both instances carry active flow rules",
        orchestrator.flow.active_rule_count(VnfType::Firewall) == 2,
        format!("rules={}", orchestrator.flow.active_rule_count(VnfType::Firewall)),
    ));

    Ok(checks)
}

/// Suite 2: chain allocation, rollback atomicity, and safe scale-in.
pub async fn test2() -> Result<Vec<Check>> {
    info!("Running suite 2: allocation and rollback");
    let types = VnfType::ALL.to_vec();
    let api = simulated_runtime();
    let orchestrator = Orchestrator::build(test_config(&types), api)?;
    let mut checks = Vec::new();

    run_tick(&orchestrator).await;

    // Classification picks the inbound-protection chain from the catalog
    let metadata = HashMap::from([("direction".to_string(), "inbound".to_string())]);
    let request = orchestrator.allocator.build_request(metadata, 5)?;
    checks.push(Check::new(
        "request classified as inbound user protection",
        request.category == crate::types::ChainCategory::InboundUserProtection,
        format!("{:?}", request.category),
    ));
    let objective = orchestrator
        .allocator
        .latency_objective(request.category)
        .unwrap_or(0.0);
    let hops = request.chain.len();
    let allocation = orchestrator.allocator.allocate(request).await?;
    checks.push(Check::new(
        "catalogued chain allocated",
        allocation.primary.flow_rules.len() == hops,
        format!("rules={} hops={hops}", allocation.primary.flow_rules.len()),
    ));
    orchestrator
        .allocator
        .record_latency(&allocation.primary.chain_id, objective / 2.0);
    let within_objective = orchestrator
        .allocator
        .get_chain(&allocation.primary.chain_id)
        .map(|c| c.latency_samples.iter().all(|l| *l <= objective))
        .unwrap_or(false);
    checks.push(Check::new(
        "observed latency within the category objective",
        within_objective,
        format!("objective={objective}ms"),
    ));

    // Induce a conflict on the second hop and verify full rollback
    let encryption = orchestrator
        .flow
        .next_instance(VnfType::EncryptionGateway)
        .ok_or_else(|| OrchestratorError::Capacity("no encryption instance".into()))?;
    orchestrator.flow.add_rule(
        VnfType::EncryptionGateway,
        encryption.id,
        crate::allocator::flow_priority(8),
        None,
    )?;
    let rules_before = orchestrator.flow.list_rules(None).len();
    let conflicted = crate::types::ChainRequest {
        request_id: "sfc-selftest-2".into(),
        category: crate::types::ChainCategory::InboundUserProtection,
        direction: ChainDirection::Inbound,
        chain: types.clone(),
        priority: 8,
        metadata: HashMap::new(),
        created_at: Utc::now(),
    };
    let result = orchestrator.allocator.allocate(conflicted).await;
    checks.push(Check::new(
        "conflicted allocation rejected with no-capacity",
        matches!(result, Err(OrchestratorError::Capacity(_))),
        format!("{result:?}"),
    ));
    checks.push(Check::new(
        "rollback left no partial rules",
        orchestrator.flow.list_rules(None).len() == rules_before
            && !orchestrator
                .flow
                .list_rules(None)
                .iter()
                .any(|r| r.chain_id.as_deref() == Some("sfc-selftest-2")),
        format!("rules={}", orchestrator.flow.list_rules(None).len()),
    ));

    // Idle metrics must not drain the last spamfilter while the chain lives
    orchestrator.history.set_aggregates(
        VnfType::Spamfilter,
        crate::types::Aggregates {
            cpu_percent: 10.0,
            memory_percent: 15.0,
            latency_ms: 20.0,
            throughput_rps: 10.0,
            sample_count: 1,
        },
    );
    run_tick(&orchestrator).await;
    let active = orchestrator
        .driver
        .list(VnfType::Spamfilter)
        .into_iter()
        .filter(|i| i.state == crate::types::InstanceState::Active)
        .count();
    checks.push(Check::new(
        "last serving instance never drained",
        active >= 1
            && !orchestrator
                .registry
                .render()
                .contains("action=\"in\",vnf_type=\"spamfilter\""),
        format!("active={active}"),
    ));

    Ok(checks)
}

/// Suite 3: the flow API surface and round-robin load balancing over HTTP.
pub async fn test3() -> Result<Vec<Check>> {
    info!("Running suite 3: flow API surface");
    let types = vec![VnfType::Mail];
    let api = simulated_runtime();
    let orchestrator = Orchestrator::build(test_config(&types), api)?;
    let mut checks = Vec::new();

    run_tick(&orchestrator).await;
    let second = orchestrator.driver.create(VnfType::Mail).await?;
    orchestrator.driver.wait_active(second.id).await?;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .map_err(OrchestratorError::Io)?;
    let addr: SocketAddr = listener.local_addr().map_err(OrchestratorError::Io)?;
    let router = create_flow_router(ApiState {
        flow: Arc::clone(&orchestrator.flow),
        driver: Arc::clone(&orchestrator.driver),
    });
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()?;
    let base = format!("http://{addr}");

    let health = client.get(format!("{base}/health")).send().await?;
    checks.push(Check::new(
        "health endpoint responds",
        health.status().is_success(),
        format!("status={}", health.status()),
    ));

    let body = serde_json::json!({
        "vnf_type": "mail",
        "instance_id": second.id,
        "priority": 120,
    });
    let created = client
        .post(format!("{base}/flows"))
        .json(&body)
        .send()
        .await?;
    checks.push(Check::new(
        "flow rule created over HTTP",
        created.status().as_u16() == 201,
        format!("status={}", created.status()),
    ));
    let conflict = client
        .post(format!("{base}/flows"))
        .json(&body)
        .send()
        .await?;
    checks.push(Check::new(
        "duplicate rule returns 409",
        conflict.status().as_u16() == 409,
        format!("status={}", conflict.status()),
    ));

    let instances = client
        .get(format!("{base}/vnf/mail/instances"))
        .send()
        .await?
        .json::<Vec<crate::types::Instance>>()
        .await?;
    checks.push(Check::new(
        "instance listing reflects both instances",
        instances.len() == 2,
        format!("instances={}", instances.len()),
    ));

    // Round-robin alternates between the two active instances
    let mut seen = std::collections::HashSet::new();
    for _ in 0..4 {
        let picked = client
            .get(format!("{base}/load-balance/mail"))
            .send()
            .await?
            .json::<crate::types::Instance>()
            .await?;
        seen.insert(picked.id);
    }
    checks.push(Check::new(
        "round-robin covers both instances",
        seen.len() == 2,
        format!("distinct={}", seen.len()),
    ));

    let missing = client
        .get(format!("{base}/load-balance/firewall"))
        .send()
        .await?;
    checks.push(Check::new(
        "load-balance without instances returns 503",
        missing.status().as_u16() == 503,
        format!("status={}", missing.status()),
    ));

    Ok(checks)
}

/// Run the named suite(s); returns (passed, failed)
pub async fn run(which: &str) -> Result<(usize, usize)> {
    let mut checks = Vec::new();
    match which {
        "test1" => checks.extend(test1().await?),
        "test2" => checks.extend(test2().await?),
        "test3" => checks.extend(test3().await?),
        "testall" => {
            checks.extend(test1().await?);
            checks.extend(test2().await?);
            checks.extend(test3().await?);
        }
        other => {
            return Err(OrchestratorError::Config(format!(
                "unknown test suite '{other}'"
            )))
        }
    }

    let mut passed = 0;
    let mut failed = 0;
    for check in &checks {
        if check.passed {
            passed += 1;
            println!("PASS {} ({})", check.name, check.detail);
        } else {
            failed += 1;
            println!("FAIL {} ({})", check.name, check.detail);
        }
    }
    println!("{passed} passed, {failed} failed");
    Ok((passed, failed))
}
