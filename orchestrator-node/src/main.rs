use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};

use orchestrator_node::config::OrchestratorConfig;
use orchestrator_node::driver::SimulatedContainerApi;
use orchestrator_node::orchestrator::Orchestrator;
use orchestrator_node::selftest;
use orchestrator_node::types::VnfType;

/// SFC orchestrator control plane for email-security VNF chains
#[derive(Parser)]
#[command(name = "orchestrator-node", version, about)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, default_value = "orchestrator.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate configuration and resolve the VNF image catalog
    Build,
    /// Run the control plane
    Orchestrate,
    /// Proactive scale-out scenario
    Test1,
    /// Allocation atomicity and safe scale-in scenario
    Test2,
    /// Flow API and load-balancing scenario
    Test3,
    /// All test scenarios
    Testall,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "orchestrator_node=info".into()),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let config = match load_config(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Configuration error");
            return ExitCode::from(1);
        }
    };

    match cli.command {
        Command::Build => match build(&config) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!(error = %e, "Build failed");
                ExitCode::from(1)
            }
        },
        Command::Orchestrate => match orchestrate(config).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!(error = %e, "Runtime failure");
                ExitCode::from(2)
            }
        },
        Command::Test1 => run_suite("test1").await,
        Command::Test2 => run_suite("test2").await,
        Command::Test3 => run_suite("test3").await,
        Command::Testall => run_suite("testall").await,
    }
}

fn load_config(path: &PathBuf) -> anyhow::Result<OrchestratorConfig> {
    if path.exists() {
        Ok(OrchestratorConfig::from_file(path)?)
    } else {
        warn!(path = %path.display(), "Config file not found, using defaults");
        let config = OrchestratorConfig::default();
        config.validate()?;
        Ok(config)
    }
}

/// Validate the configuration and make sure every enabled VNF type resolves
/// to an image known to the runtime
fn build(config: &OrchestratorConfig) -> anyhow::Result<()> {
    let types = config.enabled_types()?;
    let api = SimulatedContainerApi::new();
    for vnf in VnfType::ALL {
        api.register_image(&format!("{}{vnf}-vnf", config.driver.image_prefix));
    }
    for vnf in &types {
        let image = format!("{}{vnf}-vnf", config.driver.image_prefix);
        if !api.has_image(&image) {
            anyhow::bail!("image {image} not available for {vnf}");
        }
        info!(vnf_type = %vnf, image = %image, "Image resolved");
    }
    config.chain_catalog()?;
    info!(vnf_types = types.len(), "Configuration valid");
    println!("configuration valid: {} vnf types", types.len());
    Ok(())
}

async fn orchestrate(config: OrchestratorConfig) -> anyhow::Result<()> {
    info!(
        "Starting SFC orchestrator v{}",
        env!("CARGO_PKG_VERSION")
    );

    let api = SimulatedContainerApi::new();
    for vnf in VnfType::ALL {
        api.register_image(&format!("{}{vnf}-vnf", config.driver.image_prefix));
    }

    let orchestrator =
        Orchestrator::build(config, api).context("failed to wire orchestrator")?;
    let _handles = orchestrator.start();

    info!(
        metrics_port = orchestrator.config.http.metrics_port,
        flow_port = orchestrator.config.http.flow_port,
        "Control plane running; Ctrl-C to stop"
    );
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown requested; in-flight drains will not be awaited");
    Ok(())
}

async fn run_suite(which: &str) -> ExitCode {
    match selftest::run(which).await {
        Ok((_, 0)) => ExitCode::SUCCESS,
        Ok((_, _failed)) => ExitCode::from(3),
        Err(e) => {
            error!(error = %e, "Test suite failed to run");
            ExitCode::from(2)
        }
    }
}
