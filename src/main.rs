// src/main.rs
//! GPS Engine - detect GPS devices and watch live navigation data

use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use gps_engine::{
    Device, DeviceRegistry, Interpreter, InterpreterEvent, InterpreterOptions, NavData,
    SerialConnector, TcpConnector,
};

#[derive(Parser)]
#[command(name = "gps-engine", version, about = "GPS device detection and NMEA interpretation engine")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List candidate serial devices and their cached statistics
    List {
        /// Baud rate to assume for candidates
        #[arg(long, default_value_t = 4800)]
        baud: u32,
    },
    /// Probe all candidate devices for the NMEA protocol
    Detect {
        #[arg(long, default_value_t = 4800)]
        baud: u32,
        /// Seconds to wait for each device to produce a valid sentence
        #[arg(long, default_value_t = 6)]
        timeout: u64,
    },
    /// Run the interpreter and print navigation updates
    Watch {
        /// Serial port to use, e.g. /dev/ttyUSB0 (default: auto-detect)
        #[arg(long)]
        port: Option<String>,
        /// TCP endpoint serving raw NMEA, e.g. 10.0.0.5:10110
        #[arg(long)]
        tcp: Option<String>,
        #[arg(long, default_value_t = 4800)]
        baud: u32,
        /// Disable position smoothing
        #[arg(long)]
        no_filter: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gps_engine=info,gps-engine=info".into()),
        )
        .init();

    let args = Args::parse();
    match args.command {
        Command::List { baud } => list(baud),
        Command::Detect { baud, timeout } => detect(baud, Duration::from_secs(timeout)).await,
        Command::Watch {
            port,
            tcp,
            baud,
            no_filter,
        } => watch(port, tcp, baud, no_filter).await,
    }
}

fn list(baud: u32) -> anyhow::Result<()> {
    let registry = DeviceRegistry::new();
    let devices = registry
        .discover_serial_devices(baud)
        .context("could not enumerate serial ports")?;

    if devices.is_empty() {
        println!("No serial ports found.");
        return Ok(());
    }

    for device in devices {
        let stats = device.stats();
        println!(
            "{:<32} detected: {:<5} reliability: {:>5.1}% ({} ok / {} failed)",
            device.name(),
            stats.is_gps_device,
            device.reliability() * 100.0,
            stats.successful_detection_count,
            stats.failed_detection_count,
        );
    }
    Ok(())
}

async fn detect(baud: u32, timeout: Duration) -> anyhow::Result<()> {
    let registry = DeviceRegistry::new();
    registry.set_detection_timeout(timeout)?;
    let devices = registry
        .discover_serial_devices(baud)
        .context("could not enumerate serial ports")?;
    if devices.is_empty() {
        println!("No serial ports found.");
        return Ok(());
    }

    info!("probing {} candidate device(s)", devices.len());
    registry.begin_detection().await;
    for device in &devices {
        if let Err(e) = device
            .wait_for_detection(timeout + Duration::from_secs(2))
            .await
        {
            warn!("{}: {}", device.name(), e);
        }
    }

    let confirmed = registry.gps_devices();
    if confirmed.is_empty() {
        println!("No GPS devices found.");
    } else {
        for device in confirmed {
            println!("GPS device: {}", device.name());
        }
    }
    registry.shutdown().await;
    Ok(())
}

async fn watch(
    port: Option<String>,
    tcp: Option<String>,
    baud: u32,
    no_filter: bool,
) -> anyhow::Result<()> {
    let registry = DeviceRegistry::new();
    registry.set_is_stream_needed(true);

    let explicit = match (port, tcp) {
        (Some(port), _) => Some(Device::new(Box::new(SerialConnector::new(port, baud)))),
        (None, Some(endpoint)) => {
            let (host, port) = endpoint
                .rsplit_once(':')
                .context("TCP endpoint must look like host:port")?;
            let port: u16 = port.parse().context("invalid TCP port")?;
            Some(Device::new(Box::new(TcpConnector::new(host, port))))
        }
        (None, None) => {
            registry.discover_serial_devices(baud)?;
            None
        }
    };

    let mut options = InterpreterOptions::default();
    options.set_is_filter_enabled(!no_filter);
    let interpreter = Interpreter::with_options(registry.clone(), options);
    let mut events = interpreter.subscribe();

    match explicit {
        Some(device) => interpreter.start_with(registry.register(device)).await?,
        None => interpreter.start().await?,
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
            event = events.recv() => match event {
                Ok(InterpreterEvent::Changed(data)) => print_change(&data),
                Ok(InterpreterEvent::FixAcquired) => println!("Fix acquired"),
                Ok(InterpreterEvent::FixLost) => println!("Fix lost"),
                Ok(InterpreterEvent::ConnectionLost { reason }) => {
                    warn!("connection lost: {}", reason);
                }
                Ok(InterpreterEvent::Stopped) => {
                    warn!("interpreter stopped");
                    break;
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("event consumer lagged, {} event(s) missed", missed);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    interpreter.stop().await?;
    registry.shutdown().await;
    Ok(())
}

fn print_change(data: &NavData) {
    match data {
        NavData::Position(position) => println!("Position:   {}", position),
        NavData::Speed(speed) => println!("Speed:      {:.1} km/h", speed),
        NavData::Bearing(bearing) => println!("Bearing:    {:.1}°", bearing),
        NavData::Altitude(altitude) => println!("Altitude:   {:.1} m", altitude),
        NavData::FixQuality(quality) => println!("Fix:        {}", quality.description()),
        NavData::FixedSatelliteCount(count) => println!("Satellites: {} in fix", count),
        _ => {}
    }
}
