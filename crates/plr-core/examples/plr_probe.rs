//! PLR Communication Test Tool
//!
//! Talks to a paired PLR over its RFCOMM serial port and runs one command.
//!
//! Usage:
//!   cargo run --example plr_probe -- [OPTIONS] <COMMAND>
//!
//! Examples:
//!   cargo run --example plr_probe -- ports
//!   cargo run --example plr_probe -- --port /dev/rfcomm0 info
//!   RUST_LOG=plr_core=trace cargo run --example plr_probe -- --port /dev/rfcomm0 watch

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use plr_core::protocol::{list_ports, Device, DeviceConfig};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Probe a PLR laser distance meter")]
struct Args {
    /// Serial port bound to the device
    #[arg(short, long)]
    port: Option<String>,

    /// JSON configuration file (command line flags override it)
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,

    /// Reply timeout in milliseconds, 0 waits forever
    #[arg(short, long)]
    timeout: Option<u64>,

    #[command(subcommand)]
    command: Action,
}

#[derive(Subcommand, Debug)]
enum Action {
    /// List candidate serial ports
    Ports,
    Name,
    Info,
    /// Trigger one distance measurement
    Measure,
    LaserOn,
    LaserOff,
    BacklightOn,
    BacklightOff,
    /// Enable pushes and print every measurement taken on the device
    Watch {
        /// Stop after this many measurements
        #[arg(short, long)]
        count: Option<usize>,
    },
}

fn load_config(args: &Args) -> anyhow::Result<DeviceConfig> {
    let mut config = match &args.config {
        Some(path) => DeviceConfig::from_json_file(path)?,
        None => DeviceConfig::default(),
    };
    if let Some(port) = &args.port {
        config.port_name = port.clone();
    }
    if let Some(timeout) = args.timeout {
        config.reply_timeout_ms = (timeout > 0).then_some(timeout);
    }
    if config.port_name.is_empty() {
        bail!("no port given; use --port or a config file (see `ports`)");
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    if let Action::Ports = args.command {
        for port in list_ports() {
            let kind = if port.bluetooth { "bluetooth" } else { "serial" };
            println!("{:<20} {:<10} {}", port.name, kind, port.product.unwrap_or_default());
        }
        return Ok(());
    }

    let config = load_config(&args)?;
    let device = Device::connect(config.clone())
        .with_context(|| format!("connecting to {}", config.port_name))?;

    match args.command {
        Action::Ports => unreachable!(),
        Action::Name => println!("{}", device.name().await?),
        Action::Info => println!("{}", serde_json::to_string_pretty(&device.info().await?)?),
        Action::Measure => println!("{:.2} mm", device.measure().await?),
        Action::LaserOn => device.laser_on().await?,
        Action::LaserOff => device.laser_off().await?,
        Action::BacklightOn => device.backlight_on().await?,
        Action::BacklightOff => device.backlight_off().await?,
        Action::Watch { count } => {
            let current = device.begin_receive().await?;
            println!("{}", serde_json::to_string_pretty(&current)?);

            let mut seen = 0;
            while count.map_or(true, |limit| seen < limit) {
                let data = device.wait_for_next_measurement().await?;
                println!("{}", serde_json::to_string_pretty(&data)?);
                seen += 1;
            }
        }
    }

    device.disconnect().await;
    Ok(())
}
