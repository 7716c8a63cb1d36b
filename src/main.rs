//! FXS bridge main application

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use fxs_bridge::{
    config::BridgeConfig,
    core::{BridgeEvent, FxsBridge},
    interfaces::{HardwareEventKind, SimulatedDevice},
    protocols::RtpPacket,
    services::StaticDialplan,
    utils::setup_logging,
};

#[derive(Parser)]
#[command(name = "fxs-bridge")]
#[command(about = "Analog FXS line bridge")]
#[command(version = fxs_bridge::VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bridge until interrupted
    Run,
    /// Place one scripted call on a simulated line and print the port status
    Simulate {
        /// Port to go off hook on (1-based)
        #[arg(short, long, default_value_t = 1)]
        port: usize,
        /// Digits to dial; the terminator is appended
        #[arg(short, long, default_value = "201")]
        digits: String,
        /// Number of 20 ms A-law packets to send once the call is up
        #[arg(long, default_value_t = 5)]
        packets: u16,
    },
    /// Validate configuration
    ValidateConfig,
    /// Generate default configuration
    GenerateConfig {
        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = load_configuration(&cli)?;
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }

    // Keep the guard alive so buffered file output is flushed on exit
    let _guard = setup_logging(&config.logging)?;

    info!("Starting {} v{}", fxs_bridge::NAME, fxs_bridge::VERSION);
    info!("Description: {}", fxs_bridge::DESCRIPTION);

    match cli.command {
        Some(Commands::Run) | None => run_bridge(config).await,
        Some(Commands::Simulate {
            port,
            digits,
            packets,
        }) => simulate(config, port, &digits, packets).await,
        Some(Commands::ValidateConfig) => validate_configuration(&config),
        Some(Commands::GenerateConfig { output }) => generate_default_config(output),
    }
}

fn load_configuration(cli: &Cli) -> Result<BridgeConfig> {
    let config = if let Some(config_path) = &cli.config {
        BridgeConfig::load_from_file(config_path)
            .with_context(|| format!("Loading {}", config_path.display()))?
    } else {
        match BridgeConfig::load_from_env() {
            Ok(config) => config,
            Err(_) => BridgeConfig::default_config(),
        }
    };

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn build_bridge(
    config: BridgeConfig,
) -> Result<(FxsBridge, Arc<SimulatedDevice>, Arc<StaticDialplan>)> {
    let device = Arc::new(SimulatedDevice::new(config.interfaces.channels));
    let dialplan = Arc::new(StaticDialplan::new(&config.dialplan)?);
    let mut bridge = FxsBridge::new(config, device.clone(), dialplan.clone())?;
    bridge.attach_dialplan(dialplan.clone())?;
    Ok((bridge, device, dialplan))
}

async fn run_bridge(config: BridgeConfig) -> Result<()> {
    info!("Initializing FXS bridge");
    warn!("No line driver is bound, serving simulated ports");

    let (mut bridge, _device, _dialplan) = build_bridge(config)?;
    let mut event_rx = bridge
        .take_event_receiver()
        .ok_or_else(|| anyhow!("Failed to get event receiver"))?;

    bridge.start().await?;

    let bridge = Arc::new(tokio::sync::Mutex::new(bridge));
    let (restart_tx, mut restart_rx) = mpsc::unbounded_channel::<String>();

    let event_task = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            if let BridgeEvent::RestartRequested { reason } = &event {
                let _ = restart_tx.send(reason.clone());
            }
            handle_bridge_event(event);
        }
    });

    let restart = tokio::select! {
        result = signal::ctrl_c() => {
            if let Err(err) = result {
                error!("Unable to listen for shutdown signal: {}", err);
            }
            info!("Received Ctrl+C, shutting down gracefully");
            None
        }
        reason = restart_rx.recv() => reason,
    };

    {
        let mut bridge = bridge.lock().await;
        if bridge.is_running().await {
            bridge.stop().await?;
        }
    }
    event_task.abort();

    if let Some(reason) = restart {
        bail!("Bridge requested a restart: {}", reason);
    }

    info!("FXS bridge shutdown complete");
    Ok(())
}

fn handle_bridge_event(event: BridgeEvent) {
    match event {
        BridgeEvent::Started => info!("✓ Bridge started"),
        BridgeEvent::Stopped => info!("✓ Bridge stopped"),
        BridgeEvent::CallStarted { port, extension } => {
            info!("📞 Port {} called {}", port + 1, extension)
        }
        BridgeEvent::CallEnded { port } => info!("📞 Call on port {} ended", port + 1),
        BridgeEvent::RestartRequested { reason } => {
            error!("✗ Restart requested: {}", reason)
        }
    }
}

async fn simulate(config: BridgeConfig, port: usize, digits: &str, packets: u16) -> Result<()> {
    if port == 0 || port > config.interfaces.channels {
        bail!(
            "Port {} out of range (1..={})",
            port,
            config.interfaces.channels
        );
    }
    let index = port - 1;
    let terminator = config.dialing.terminator;

    let (mut bridge, device, _dialplan) = build_bridge(config)?;
    let mut event_rx = bridge
        .take_event_receiver()
        .ok_or_else(|| anyhow!("Failed to get event receiver"))?;
    bridge.start().await?;

    device.inject_event(index, HardwareEventKind::HookOff);
    for digit in digits.chars().chain(std::iter::once(terminator)) {
        device.inject_event(index, HardwareEventKind::DtmfDigit(digit));
    }

    let answered = wait_for(&mut event_rx, |event| {
        matches!(event, BridgeEvent::CallStarted { .. })
    })
    .await;
    if !answered {
        warn!("Dialed '{}' was not answered", digits);
    } else {
        for i in 0..packets {
            let unit = RtpPacket::new(
                8,
                i,
                u32::from(i) * 160,
                Bytes::from(vec![0xd5; 160]),
            )
            .encode();
            device.inject_media(index, unit);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        info!(
            "Port {} echoed {} packets",
            port,
            device.line(index).written.len()
        );
    }

    let status = bridge.get_status().await;
    println!("{}", serde_json::to_string_pretty(&status)?);

    device.inject_event(index, HardwareEventKind::HookOn);
    if answered {
        wait_for(&mut event_rx, |event| {
            matches!(event, BridgeEvent::CallEnded { .. })
        })
        .await;
    }

    bridge.stop().await?;
    Ok(())
}

async fn wait_for<F>(event_rx: &mut mpsc::UnboundedReceiver<BridgeEvent>, wanted: F) -> bool
where
    F: Fn(&BridgeEvent) -> bool,
{
    let search = async {
        while let Some(event) = event_rx.recv().await {
            let found = wanted(&event);
            handle_bridge_event(event);
            if found {
                return true;
            }
        }
        false
    };
    tokio::time::timeout(Duration::from_secs(5), search)
        .await
        .unwrap_or(false)
}

fn validate_configuration(config: &BridgeConfig) -> Result<()> {
    info!("Validating configuration...");

    config.validate()?;

    println!("✓ Configuration is valid");
    println!("  Device: {}", config.interfaces.base_path);
    println!("  Channels: {}", config.interfaces.channels);
    println!("  Default context: {}", config.interfaces.default_context);
    println!(
        "  Interdigit timeout: {} ms",
        config.dialing.interdigit_ms
    );
    println!("  Codec: {:?}", config.media.codec);
    println!("  Dialplan rules: {}", config.dialplan.rules.len());

    Ok(())
}

fn generate_default_config(output_path: Option<PathBuf>) -> Result<()> {
    let config = BridgeConfig::default_config();
    let toml_content =
        toml::to_string_pretty(&config).context("Failed to serialize config")?;

    match output_path {
        Some(path) => {
            std::fs::write(&path, toml_content)?;
            println!("✓ Default configuration written to: {}", path.display());
        }
        None => {
            println!("{}", toml_content);
        }
    }

    Ok(())
}
