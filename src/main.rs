//! TKE Gateway - tenant-facing edge process

use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use tke_gateway::{
    cli::{Cli, Command},
    config::Config,
    gateway::Gateway,
    proxy::{self, MatchKind},
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let result = match cli.command {
        Some(Command::CheckConfig) => check_config(&cli),
        Some(Command::Routes) => print_routes(&cli),
        Some(Command::Serve) | None => run_server(&cli).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Configuration with CLI overrides applied
fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config =
        Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(ref host) = cli.host {
        config.server.host = host.clone();
    }
    Ok(config)
}

fn check_config(cli: &Cli) -> anyhow::Result<()> {
    let config = load_config(cli)?;
    config.validate().context("Invalid configuration")?;
    let table = proxy::build_route_table(&config.components, config.server.request_timeout)
        .context("Invalid component configuration")?;

    println!("Configuration OK");
    println!("  issuer:     {}", config.oidc.issuer_url);
    println!(
        "  listener:   {}:{} (tls: {})",
        config.server.host,
        config.server.port,
        config.server.tls_enabled()
    );
    println!("  components: {}", config.components.enabled().count());
    println!("  routes:     {}", table.len());
    Ok(())
}

fn print_routes(cli: &Cli) -> anyhow::Result<()> {
    let config = load_config(cli)?;
    let table = proxy::build_route_table(&config.components, config.server.request_timeout)
        .context("Invalid component configuration")?;

    println!("{:<7} {:<48} {:<12} {:<10} TARGET", "MATCH", "PATH", "COMPONENT", "ACCESS");
    for route in table.routes() {
        let target = table
            .lookup(&route.path)
            .map(|(_, p)| format!("{} ({})", p.base(), p.mode_name()))
            .unwrap_or_default();
        println!(
            "{:<7} {:<48} {:<12} {:<10} {target}",
            if route.kind == MatchKind::Exact { "exact" } else { "prefix" },
            route.path,
            route.component.as_str(),
            if route.protected { "protected" } else { "public" },
        );
    }
    if config.components.platform.is_some() {
        println!("{:<7} {:<48} {:<12} {:<10}", "exact", "/webtty", "platform", "protected");
    }
    Ok(())
}

async fn run_server(cli: &Cli) -> anyhow::Result<()> {
    let config = load_config(cli)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        components = config.components.enabled().count(),
        "Starting TKE Gateway"
    );

    let gateway = Gateway::new(config)
        .await
        .context("Failed to create gateway")?;
    gateway.run().await.context("Gateway error")?;

    info!("Gateway shutdown complete");
    Ok(())
}
