//! ssh-agent-inject CLI Entry Point
//!
//! This is the main entry point for the ssh-agent-inject binary.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ssh_agent_inject::agent::connector::SocketAgentConnector;
use ssh_agent_inject::cli::config::{Config, LoggingConfig};
use ssh_agent_inject::inject::coordinator::{
    is_eligible, socket_path, target_user, InjectionCoordinator,
};
use ssh_agent_inject::inject::deploy::{Payload, PayloadDeployer};
use ssh_agent_inject::inject::relay::RelayEngine;
use ssh_agent_inject::runtime::adapter::RuntimeAdapter;
use ssh_agent_inject::runtime::docker::adapter::DockerAdapter;

#[derive(Parser)]
#[command(name = "ssh-agent-inject")]
#[command(author, version, about = "Forward the host ssh-agent into labelled containers")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Relay helper binary copied into containers
    #[arg(long, env = "SSH_AGENT_INJECT_PAYLOAD")]
    payload: Option<PathBuf>,

    /// Docker socket path
    #[arg(long)]
    docker_socket: Option<String>,

    /// Host ssh-agent socket (defaults to SSH_AUTH_SOCK)
    #[arg(long)]
    agent_socket: Option<PathBuf>,

    /// Verbose output on stderr
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch for containers and inject the agent (default)
    Run,
    /// Show Docker connectivity and eligible containers
    Status,
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default_config(),
    };
    if let Some(payload) = &cli.payload {
        config.payload.path = Some(payload.clone());
    }
    if let Some(socket) = &cli.docker_socket {
        config.runtime.docker_socket = Some(socket.clone());
    }
    if let Some(socket) = &cli.agent_socket {
        config.agent.socket = Some(socket.clone());
    }
    config.validate().context("Invalid configuration")?;

    init_logging(&config.logging, cli.verbose)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config, cli.verbose).await,
        Commands::Status => show_status(&config).await,
        Commands::Version => {
            show_version();
            Ok(())
        }
    }
}

fn init_logging(logging: &LoggingConfig, verbose: bool) -> Result<()> {
    let level = if verbose { "debug" } else { logging.level.as_str() };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .with_context(|| format!("Invalid log level: {}", level))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(verbose);

    let result = match logging.format.as_str() {
        "json" => builder.json().try_init(),
        "compact" => builder.compact().try_init(),
        "pretty" => builder.pretty().try_init(),
        "full" => builder.try_init(),
        other => bail!("Unknown log format: {}", other),
    };
    result.map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))
}

async fn run(config: Config, verbose: bool) -> Result<()> {
    let payload_path = config.payload_path()?;
    let payload = Payload::load(payload_path, config.payload.name.clone())?;
    info!(
        path = %payload_path.display(),
        size = payload.len(),
        digest = %payload.digest(),
        "Relay helper loaded"
    );

    let docker = DockerAdapter::connect(config.runtime.docker_socket.as_deref())
        .context("Failed to initialize Docker adapter")?;
    let runtime = Arc::new(docker);

    let connector = Arc::new(SocketAgentConnector::new(config.agent.socket.clone()));

    let deployer = PayloadDeployer::new(runtime.clone(), payload, config.payload.install_dir.clone())?;
    let relay = RelayEngine::new(
        runtime.clone(),
        connector,
        config.relay_settings(deployer.install_path(), verbose),
    );

    let coordinator =
        InjectionCoordinator::new(runtime, deployer, relay, config.discovery_settings());
    coordinator.run().await;

    Ok(())
}

async fn show_status(config: &Config) -> Result<()> {
    println!("Injector Status: checking...");

    let docker = match DockerAdapter::connect(config.runtime.docker_socket.as_deref()) {
        Ok(docker) => docker,
        Err(e) => {
            println!("  Docker: not available - {:#}", e);
            return Ok(());
        }
    };

    println!(
        "  Docker socket: {}",
        docker.socket_path().unwrap_or("local default")
    );
    match docker.version().await {
        Ok(version) => println!("  Docker: {} (connected)", version),
        Err(e) => {
            println!("  Docker: error - {:#}", e);
            return Ok(());
        }
    }

    let settings = config.discovery_settings();
    let containers = match docker.list_labeled(&settings.injection_label).await {
        Ok(containers) => containers,
        Err(e) => {
            println!("  Eligible containers: unknown - {:#}", e);
            return Ok(());
        }
    };

    let eligible: Vec<_> = containers
        .iter()
        .filter(|c| is_eligible(c, &settings.injection_label))
        .collect();
    println!("  Eligible containers: {}", eligible.len());

    for container in eligible {
        let user = target_user(&container.labels, &settings.user_label, &settings.default_user);
        let socket = match docker.inspect_env(&container.id).await {
            Ok(env) => {
                socket_path(&env, &settings.socket_env, &settings.default_socket_path).to_string()
            }
            Err(_) => "unknown".to_string(),
        };
        println!(
            "    {} ({}) user={} socket={}",
            short_id(&container.id),
            container.name,
            user,
            socket
        );
    }

    Ok(())
}

fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}

fn show_version() {
    println!("ssh-agent-inject {}", env!("CARGO_PKG_VERSION"));
    println!("Forwards the host ssh-agent into labelled containers");
}
