use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use citadel_agent::auth::{DeviceAuthFlow, DeviceAuthSession, DeviceToken};
use citadel_agent::{Config, Daemon, DeviceCode, Transport};

/// Citadel - node agent for GPU compute nodes
#[derive(Parser)]
#[command(name = "citadel", version, about)]
struct Cli {
    /// Config file (default: ~/.config/citadel/config.toml)
    #[arg(short, long, env = "CITADEL_CONFIG")]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the agent (default)
    Run {
        /// Authorize this device first and use the granted credentials
        #[arg(long)]
        login: bool,

        /// Request a fresh registration instead of reusing this machine's
        #[arg(long, requires = "login")]
        force_new: bool,
    },
    /// Authorize this device and print the grant
    Login {
        /// Request a fresh registration instead of reusing this machine's
        #[arg(long)]
        force_new: bool,
    },
    /// Print the resolved configuration
    ShowConfig,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,citadel_agent=info",
        1 => "info,citadel_agent=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load(cli.config.as_deref())?;
    tracing::debug!(?config, "loaded configuration");

    match cli.command.unwrap_or(Command::Run {
        login: false,
        force_new: false,
    }) {
        Command::Run { login, force_new } => {
            let device_code = DeviceCode::new();
            if login {
                let (session, token) = authorize(&config, force_new).await?;
                if let Some(transport) = Transport::from_token(&token) {
                    config.transport = Some(transport);
                }
                device_code.set(session.device_code).await;
            }

            tracing::info!(node_id = %config.node_id, "starting citadel agent");
            Daemon::new(config, device_code).run().await?;
            Ok(())
        }
        Command::Login { force_new } => {
            let (_, token) = authorize(&config, force_new).await?;
            print_grant(&token);
            Ok(())
        }
        Command::ShowConfig => {
            println!("{config:#?}");
            Ok(())
        }
    }
}

/// Run the device-code flow, prompting the operator on stdout
async fn authorize(
    config: &Config,
    force_new: bool,
) -> anyhow::Result<(DeviceAuthSession, DeviceToken)> {
    let mut flow = DeviceAuthFlow::new(&config.auth_url)?;
    let session = flow.start_flow(force_new).await?;

    println!();
    println!("To authorize this node, open:");
    println!("  {}", session.verification_uri_complete);
    println!("or visit {} and enter the code {}", session.verification_uri, session.user_code);
    println!();

    let token = flow
        .poll_for_token(&session.device_code, session.poll_interval())
        .await?;
    println!("Node authorized.");

    Ok((session, token))
}

fn print_grant(token: &DeviceToken) {
    if let Some(org_id) = &token.org_id {
        println!("Organization: {org_id}");
    }
    match Transport::from_token(token) {
        Some(transport) => println!("Broker transport: {}", transport.label()),
        None => println!("No broker credentials were granted."),
    }
    if let Some(nexus_url) = &token.nexus_url {
        println!("Mesh coordination server: {nexus_url}");
    }
}
