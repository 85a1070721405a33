//! CI Join - exchange CI platform identity tokens for cluster credentials.

use std::path::Path;
use std::process::ExitCode;

use chrono::Utc;
use clap::Parser;
use tracing::{error, info};

use ci_join::{
    cli::{Cli, Command},
    config::Config,
    server, setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Some(Command::Check) => run_check(cli.config.as_deref()),
        Some(Command::Serve { port, host }) => run_server(cli.config.as_deref(), port, host).await,
        None => run_server(cli.config.as_deref(), None, None).await,
    }
}

/// Validate configuration and print a policy summary
fn run_check(path: Option<&Path>) -> ExitCode {
    let config = match Config::load(path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("❌ {e}");
            return ExitCode::FAILURE;
        }
    };

    let now = Utc::now();
    println!("✅ Configuration valid: {} polic(ies)\n", config.policies.len());
    for policy in &config.policies {
        let roles: Vec<&str> = policy.roles.iter().map(|r| r.as_str()).collect();
        let state = if policy.is_expired_at(now) { "EXPIRED" } else { "active" };
        println!("📜 {} [{state}]", policy.name);
        println!("   Provider: {} ({})", policy.provider, policy.organization_id);
        println!("   Roles: {}", roles.join(", "));
        println!("   Allow rules: {}", policy.allow.len());
        println!("   Expires: {}", policy.expires_at);
        if !policy.wildcard_rules().is_empty() {
            println!("   ⚠️  contains rules that admit any verified identity");
        }
        println!();
    }
    ExitCode::SUCCESS
}

async fn run_server(path: Option<&Path>, port: Option<u16>, host: Option<String>) -> ExitCode {
    let config = match Config::load(path) {
        Ok(mut config) => {
            // CLI overrides
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
        policies = config.policies.len(),
        "Starting CI join server"
    );

    if let Err(e) = server::run(config).await {
        error!("Server error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Shutdown complete");
    ExitCode::SUCCESS
}
