//! Access Broker - approval-gated temporary storage credentials

use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use access_broker::{
    cli::{Cli, Command},
    config::Config,
    server::Broker,
    setup_tracing,
    trust_roles::TrustRoleResolver,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match &cli.command {
        Some(Command::CheckConfig) => run_check_config(&cli),
        Some(Command::Serve { port, host }) => run_server(&cli, *port, host.clone()).await,
        None => run_server(&cli, None, None).await,
    }
}

/// Validate configuration and print the resolved settings
fn run_check_config(cli: &Cli) -> ExitCode {
    match check_config(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Configuration invalid: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn check_config(cli: &Cli) -> anyhow::Result<()> {
    let config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;
    config
        .validate()
        .context("configuration cannot serve requests")?;

    let roles = TrustRoleResolver::from_config(&config.access);
    println!("Configuration OK");
    println!("  issuer:       {}", config.identity.resolved_issuer());
    println!("  jwks uri:     {}", config.identity.resolved_jwks_uri());
    println!("  audience:     {}", config.identity.client_id);
    println!("  admin group:  {}", config.identity.admin_group);
    println!("  store:        {:?}", config.store.backend);
    println!("  sts endpoint: {}", config.federation.resolved_endpoint());
    println!("  trust roles:  {}", roles.len());
    Ok(())
}

/// Run the HTTP server
async fn run_server(cli: &Cli, port: Option<u16>, host: Option<String>) -> ExitCode {
    let config = match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(host) = host {
                config.server.host = host;
            }
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        trust_roles = config.access.trust_roles.len(),
        "Starting access broker"
    );

    let broker = match Broker::new(config) {
        Ok(b) => b,
        Err(e) => {
            error!("Failed to create broker: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = broker.run().await {
        error!("Broker error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Broker shutdown complete");
    ExitCode::SUCCESS
}
