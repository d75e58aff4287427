//! peripheral-client: command-line front end for the peripheral bridge.
//!
//! # Usage
//!
//! ```text
//! peripheral-client [OPTIONS] [COMMAND]
//!
//! Commands:
//!   watch     Print capabilities and scans until Ctrl+C (default)
//!   collect   Collect one payment and print the result
//!   init      Write the effective config to the config file
//!
//! Options:
//!   --config   <PATH>  Config file [default: platform config dir]
//!   --endpoint <URL>   Bridge STOMP endpoint, overrides the config file
//! ```
//!
//! | Variable              | Description                         |
//! |-----------------------|-------------------------------------|
//! | `PERIPHERAL_CONFIG`   | Same as `--config`                  |
//! | `PERIPHERAL_ENDPOINT` | Same as `--endpoint`                |
//! | `RUST_LOG`            | Log filter, `info` when unset       |

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use peripheral_client::infrastructure::storage;
use peripheral_client::{ClientConfig, PeripheralClient};
use peripheral_core::PaymentRequest;

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Talks to a local peripheral bridge over STOMP.
#[derive(Debug, Parser)]
#[command(
    name = "peripheral-client",
    about = "Scanner and payment terminal client for the peripheral bridge",
    version
)]
struct Cli {
    /// Path to `client.toml`.  A missing file means defaults.
    #[arg(long, env = "PERIPHERAL_CONFIG")]
    config: Option<PathBuf>,

    /// WebSocket URL of the bridge, e.g. `ws://127.0.0.1:9100/stomp`.
    #[arg(long, env = "PERIPHERAL_ENDPOINT")]
    endpoint: Option<String>,

    #[command(subcommand)]
    command: Option<CliCommand>,
}

#[derive(Debug, Subcommand, PartialEq)]
enum CliCommand {
    /// Print the capability announcement and every scan until Ctrl+C.
    Watch,
    /// Collect one payment.  Ctrl+C cancels it.
    Collect {
        /// Amount in minor units (cents).
        #[arg(long)]
        amount: u64,

        /// ISO 4217 currency code.
        #[arg(long, default_value = "EUR")]
        currency: String,

        /// Give up after this many seconds.
        #[arg(long, default_value_t = 60)]
        timeout_secs: u64,

        /// Allow the cardholder to request cashback.
        #[arg(long)]
        cashback: bool,
    },
    /// Write the effective config (file plus overrides) to the config file.
    Init {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

impl Cli {
    /// Loads the config file and applies command-line overrides.
    fn resolve_config(&self) -> anyhow::Result<ClientConfig> {
        let mut config =
            storage::load_config(self.config.as_deref()).context("could not load client config")?;
        if let Some(endpoint) = &self.endpoint {
            config.endpoint = endpoint.clone();
        }
        config.validate().context("invalid client config")?;
        Ok(config)
    }

    /// Where `init` writes: `--config`, else the platform default.
    fn config_path(&self) -> anyhow::Result<PathBuf> {
        match &self.config {
            Some(path) => Ok(path.clone()),
            None => storage::config_file_path().context("no platform config directory"),
        }
    }
}

// ── Commands ──────────────────────────────────────────────────────────────────

fn init(config: &ClientConfig, path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!("{} already exists; pass --force to overwrite", path.display());
    }
    storage::save_config(config, path)
        .with_context(|| format!("could not write {}", path.display()))?;
    println!("wrote {}", path.display());
    Ok(())
}

async fn watch(client: &PeripheralClient) -> anyhow::Result<()> {
    let capabilities = client.capabilities().on_capabilities(|snapshot| {
        println!(
            "device {}: scanner={} payment={}",
            snapshot.device_id,
            snapshot.scanner_available(),
            snapshot.payment_available()
        );
    });
    let scans = client.scanner().on_scan(|scan| {
        println!(
            "{}  {:<8} {}",
            scan.timestamp.to_rfc3339(),
            scan.symbology.as_str(),
            scan.barcode
        );
    });

    client.scanner().enable();
    info!("watching for scans; press Ctrl+C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("could not listen for Ctrl+C")?;

    client.scanner().disable();
    scans.unsubscribe();
    capabilities.unsubscribe();
    Ok(())
}

async fn collect(client: &PeripheralClient, request: PaymentRequest) -> anyhow::Result<()> {
    let payment = client.payment();
    let states = payment.on_state_change(|state| info!(%state, "payment state"));

    let pending = payment.collect(request);
    tokio::pin!(pending);
    let outcome = tokio::select! {
        outcome = &mut pending => outcome,
        _ = tokio::signal::ctrl_c() => {
            warn!("Ctrl+C received; cancelling payment");
            payment.cancel().await.context("could not cancel payment")?;
            pending.await
        }
    };
    states.unsubscribe();

    let result = outcome.context("payment failed")?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.resolve_config()?;

    if let Some(CliCommand::Init { force }) = cli.command {
        return init(&config, &cli.config_path()?, force);
    }

    // Build the request before connecting so bad input fails fast.
    let request = match &cli.command {
        Some(CliCommand::Collect {
            amount,
            currency,
            timeout_secs,
            cashback,
        }) => Some(
            PaymentRequest::new(*amount, currency)
                .and_then(|r| r.with_timeout(Duration::from_secs(*timeout_secs)))
                .map(|r| r.with_cashback(*cashback))
                .context("invalid payment request")?,
        ),
        _ => None,
    };

    info!(endpoint = %config.endpoint, "peripheral client starting");
    let client = PeripheralClient::new(&config);
    client
        .connect()
        .await
        .with_context(|| format!("could not connect to {}", config.endpoint))?;

    let outcome = match request {
        Some(request) => collect(&client, request).await,
        None => watch(&client).await,
    };

    client.disconnect().await;
    outcome
}

// ── Tests ─────────────────────────────────────────────────────────────────────
