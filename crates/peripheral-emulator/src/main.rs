//! Peripheral bridge emulator: entry point.
//!
//! Serves the bridge's STOMP topics on a WebSocket with a simulated scanner
//! and card terminal.  Each line typed on stdin becomes a barcode scan.
//!
//! # Usage
//!
//! ```text
//! peripheral-emulator [OPTIONS]
//!
//! Options:
//!   --ws-bind   <IP>     Address to bind [default: 127.0.0.1]
//!   --ws-port   <PORT>   WebSocket port [default: 9100]
//!   --device-id <ID>     deviceId in the announcement [default: emulator-001]
//!   --method    <NAME>   chip | contactless | swipe [default: chip]
//!   --decline            Decline every payment
//!   --step-ms   <MS>     Delay between payment steps, overrides the defaults
//! ```
//!
//! Scans on stdin are either `<barcode>` (EAN-13) or `<symbology> <barcode>`,
//! e.g. `qr https://example.com`.
//!
//! | Variable             | Default     | Description          |
//! |----------------------|-------------|----------------------|
//! | `PERIPHERAL_WS_BIND` | `127.0.0.1` | Same as `--ws-bind`  |
//! | `PERIPHERAL_WS_PORT` | `9100`      | Same as `--ws-port`  |
//! | `RUST_LOG`           | `info`      | Log filter           |

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use peripheral_core::Symbology;
use peripheral_emulator::domain::config::{DEFAULT_WS_PORT, SUPPORTED_METHODS};
use peripheral_emulator::{EmulatorConfig, EmulatorHandle, StepDelays};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Emulates a peripheral bridge with a scanner and a card terminal.
#[derive(Debug, Parser)]
#[command(
    name = "peripheral-emulator",
    about = "STOMP-over-WebSocket peripheral bridge emulator",
    version
)]
struct Cli {
    /// IP address to bind the WebSocket server to.
    #[arg(long, default_value = "127.0.0.1", env = "PERIPHERAL_WS_BIND")]
    ws_bind: String,

    /// WebSocket port.
    #[arg(long, default_value_t = DEFAULT_WS_PORT, env = "PERIPHERAL_WS_PORT")]
    ws_port: u16,

    #[arg(long, default_value = "emulator-001")]
    device_id: String,

    /// Card method reported on results.  `chip` adds the PIN steps.
    #[arg(long, default_value = "chip")]
    method: String,

    /// Decline every payment.
    #[arg(long)]
    decline: bool,

    /// Delay in milliseconds for every payment step.
    #[arg(long)]
    step_ms: Option<u64>,
}

impl Cli {
    /// # Errors
    ///
    /// Returns an error for a bad bind address or an unknown card method.
    fn into_config(self) -> anyhow::Result<EmulatorConfig> {
        let ws_bind_addr: SocketAddr = format!("{}:{}", self.ws_bind, self.ws_port)
            .parse()
            .with_context(|| {
                format!(
                    "invalid WebSocket bind address: '{}:{}'",
                    self.ws_bind, self.ws_port
                )
            })?;

        let method = self.method.to_ascii_lowercase();
        if !SUPPORTED_METHODS.contains(&method.as_str()) {
            anyhow::bail!(
                "unknown card method '{}', expected one of {}",
                self.method,
                SUPPORTED_METHODS.join(", ")
            );
        }

        Ok(EmulatorConfig {
            ws_bind_addr,
            device_id: self.device_id,
            decline: self.decline,
            method,
            steps: self
                .step_ms
                .map(|ms| StepDelays::uniform(Duration::from_millis(ms)))
                .unwrap_or_default(),
        })
    }
}

/// Splits a stdin line into a symbology and a barcode.
fn parse_scan_line(line: &str) -> Option<(Symbology, &str)> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match line.split_once(char::is_whitespace) {
        Some((symbology, barcode)) if !barcode.trim().is_empty() => {
            Some((Symbology::from_wire(symbology), barcode.trim()))
        }
        _ => Some((Symbology::Ean13, line)),
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Cli::parse().into_config()?;
    info!(
        "peripheral emulator starting: ws={}, device={}, method={}, decline={}",
        config.ws_bind_addr, config.device_id, config.method, config.decline
    );

    let emulator = EmulatorHandle::spawn(config).await?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if let Some((symbology, barcode)) = parse_scan_line(&line) {
                        if !emulator.trigger_scan(barcode, symbology) {
                            warn!("scanner is disabled; '{barcode}' not sent");
                        }
                    }
                }
                // stdin closed; keep serving until Ctrl+C
                Ok(None) => {
                    tokio::signal::ctrl_c()
                        .await
                        .context("could not listen for Ctrl+C")?;
                    break;
                }
                Err(e) => {
                    warn!("stdin read failed: {e}");
                }
            },
            signal = tokio::signal::ctrl_c() => {
                signal.context("could not listen for Ctrl+C")?;
                info!("received Ctrl+C; shutting down");
                break;
            }
        }
    }

    emulator.shutdown().await?;
    info!("peripheral emulator stopped");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> Cli {
        let mut argv = vec!["peripheral-emulator"];
        argv.extend_from_slice(args);
        Cli::parse_from(argv)
    }

    #[test]
    fn test_into_config_custom_port_and_method() {
        // Arrange
        let cli = cli(&["--ws-port", "9200", "--method", "Contactless", "--decline"]);

        // Act
        let config = cli.into_config().unwrap();

        // Assert
        assert_eq!(config.ws_bind_addr.port(), 9200);
        assert_eq!(config.method, "contactless");
        assert!(config.decline);
    }

    #[test]
    fn test_into_config_step_ms_sets_every_step() {
        let config = cli(&["--step-ms", "5"]).into_config().unwrap();
        assert_eq!(config.steps, StepDelays::uniform(Duration::from_millis(5)));
    }

    #[test]
    fn test_into_config_invalid_bind_returns_error() {
        let result = cli(&["--ws-bind", "not.an.ip"]).into_config();
        assert!(result.is_err());
    }

    #[test]
    fn test_into_config_unknown_method_returns_error() {
        let result = cli(&["--method", "cheque"]).into_config();
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_scan_line_shapes() {
        assert_eq!(
            parse_scan_line("4006381333931"),
            Some((Symbology::Ean13, "4006381333931"))
        );
        assert_eq!(
            parse_scan_line("qr  https://example.com "),
            Some((Symbology::Qr, "https://example.com"))
        );
        assert_eq!(parse_scan_line("   "), None);
    }
}
