use anyhow::Context;
use certkeeper::config::{self, DEFAULT_CONFIG_FILE};
use certkeeper::factory::{cert_handler_from_configuration, monitor_from_configuration};
use certkeeper::{CRATE_NAME, MonitorEvent};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const ENV_FILTER_NAME: &str = "CERTKEEPER_LOG";

#[derive(Debug, Parser)]
#[command(version, about, long_about = "")]
struct CommandLineArguments {
    /// Path to the configuration file. Created with defaults if missing.
    #[arg(short, long, env = "CERTKEEPER_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
    /// Shorthand option to enable debug logging (logging can be fine-tuned via `CERTKEEPER_LOG` environment variable)
    #[clap(long, short, action)]
    verbose: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Watch the configured domains, issuing and renewing certificates until interrupted
    Run,
    /// Issue or renew the certificate for a single domain, if needed
    Issue {
        domain: String,
        /// Email of the ACME account to use
        #[arg(short, long, default_value = "")]
        email: String,
    },
}

fn log_event(event: &MonitorEvent) {
    match event {
        MonitorEvent::Error(e) => error!("Certificate check failed: {e:#}"),
        MonitorEvent::Generated { domain, email } => {
            info!("Issued a new certificate for {domain} ({email})");
        }
        MonitorEvent::Renewed { domain, email } => {
            info!("Renewed the certificate for {domain} ({email})");
        }
        MonitorEvent::Skipped { domain, .. } => info!("Certificate for {domain} is up to date"),
        MonitorEvent::Started => info!("{CRATE_NAME} started"),
        MonitorEvent::Stopped => info!("{CRATE_NAME} stopped"),
    }
}

async fn run(config: config::Configuration) -> anyhow::Result<()> {
    if config.domains.is_empty() {
        warn!("No domains configured, nothing to do until the configuration is changed");
    }
    let monitor = monitor_from_configuration(&config)
        .await
        .context("Setting up the certificate monitor failed")?;
    monitor.on(None, log_event);

    let stopper = monitor.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Interrupted, shutting down"),
            Err(e) => error!("Cannot listen for Ctrl-C, shutting down: {e}"),
        }
        stopper.stop();
    });
    monitor.start(config.check_frequency_minutes).await
}

async fn issue(config: config::Configuration, domain: String, email: String) -> anyhow::Result<()> {
    let handler = cert_handler_from_configuration(&config)
        .await
        .context("Setting up the certificate handler failed")?;
    let outcome = handler.generate_or_renew_certificate(&domain, &email).await?;
    println!("{domain}: {outcome}");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = CommandLineArguments::parse();
    let filter = EnvFilter::try_from_env(ENV_FILTER_NAME).unwrap_or_else(|_| {
        EnvFilter::try_from_env("RUST_LOG").unwrap_or_else(|_| {
            EnvFilter::new(if cli.verbose {
                "certkeeper=debug,info"
            } else {
                "info"
            })
        })
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();
    let config = config::load(&cli.config).context(format!(
        "Loading configuration {} failed",
        cli.config.display()
    ))?;
    match cli.command {
        Command::Run => run(config).await,
        Command::Issue { domain, email } => issue(config, domain, email).await,
    }
}
