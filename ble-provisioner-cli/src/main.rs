mod runner;

use anyhow::Context;
use ble_provisioner_core::config::{load_config_from_path, load_config_from_toml_str};
use ble_provisioner_core::{AppConfig, BleTransport, ProvisioningSession};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

// Exactly one transport backend per build.
const BACKEND_COUNT: usize =
    cfg!(feature = "backend_mock") as usize + cfg!(feature = "backend_btleplug") as usize;
const _: () = assert!(
    BACKEND_COUNT == 1,
    "Select exactly ONE backend feature (backend_mock or backend_btleplug)."
);

#[cfg(feature = "backend_mock")]
fn get_transport(_config: &AppConfig) -> Arc<dyn BleTransport> {
    tracing::info!("🚀 Using mock BLE transport");
    use ble_provisioner_core::backends::mock::{MockBehavior, MockTransport};
    Arc::new(MockTransport::new(MockBehavior::default()))
}

#[cfg(feature = "backend_btleplug")]
fn get_transport(config: &AppConfig) -> Arc<dyn BleTransport> {
    tracing::info!("🚀 Using btleplug BLE transport");
    use ble_provisioner_core::backends::btleplug::BtleplugTransport;
    Arc::new(BtleplugTransport::new(config.selection.clone()))
}

#[derive(Parser)]
#[command(name = "ble-provisioner")]
#[command(about = "Provision WiFi credentials onto a peripheral over BLE")]
struct Cli {
    /// TOML configuration file (defaults to the built-in configs.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect, read the address, scan and push credentials
    Provision {
        #[arg(short, long)]
        ssid: String,
        #[arg(short, long)]
        password: String,
    },
    /// Print the peripheral's hardware address
    Address,
    /// List the WiFi networks the peripheral can see
    Scan {
        /// Print the raw list as JSON
        #[arg(long)]
        json: bool,
    },
    /// Push credentials without scanning first
    Configure {
        #[arg(short, long)]
        ssid: String,
        #[arg(short, long)]
        password: String,
    },
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<AppConfig> {
    const CONFIG_TOML: &str = include_str!("../../configs.toml");
    match path {
        Some(path) => load_config_from_path(path)
            .with_context(|| format!("failed to load {}", path.display())),
        None => Ok(load_config_from_toml_str(CONFIG_TOML)?),
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(cli.config.as_ref())?;
    let transport = get_transport(&config);
    let session = ProvisioningSession::new(transport, config.session.clone());

    let result = match cli.command {
        Commands::Provision { ssid, password } => {
            let report = runner::provision(&session, &ssid, &password).await;
            report.map(|report| {
                println!("Peripheral: {}", report.address);
                println!("Networks:   {}", report.ssids.join(", "));
                if report.configured {
                    println!("✅ Credentials for '{}' accepted", ssid);
                } else {
                    println!("❌ Credentials for '{}' not accepted", ssid);
                }
            })
        }
        Commands::Address => runner::address(&session).await.map(|address| println!("{address}")),
        Commands::Scan { json } => match runner::scan(&session).await {
            Ok(networks) if json => serde_json::to_string_pretty(&networks)
                .map(|out| println!("{out}"))
                .map_err(anyhow::Error::from),
            Ok(networks) => {
                for network in networks {
                    println!("{:>5} dBm  {}", network.signal_strength, network.ssid);
                }
                Ok(())
            }
            Err(e) => Err(e),
        },
        Commands::Configure { ssid, password } => runner::configure(&session, &ssid, &password)
            .await
            .map(|accepted| {
                if accepted {
                    println!("✅ Credentials for '{}' accepted", ssid);
                } else {
                    println!("❌ Credentials for '{}' not accepted", ssid);
                }
            }),
    };

    if let Err(e) = session.disconnect().await {
        tracing::warn!("Disconnect failed: {}", e);
    }
    result
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        tracing::error!("❌ Provisioning failed: {:#}", e);
        std::process::exit(1);
    }
}
