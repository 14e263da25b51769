// blemsg — BLE messaging command-line tool
//
// Runs the dual-role engine over the in-memory loopback radio and manages the
// persisted engine configuration.

mod config;

use anyhow::{Context, Result};
use blemsg_core::transport::ble::{expand_short_uuid, MessagingEvent, CCCD_UUID};
use blemsg_core::{
    parse_service_uuid, BleMessaging, ChannelEventSink, LoopbackAir, LoopbackProvider,
};
use clap::{Parser, Subcommand};
use colored::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

#[derive(Parser)]
#[command(name = "blemsg")]
#[command(about = "blemsg — text messaging over BLE GATT", long_about = None)]
#[command(version)]
struct Cli {
    /// Debug logging (overrides the configured level)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a peripheral and a central against each other over loopback
    Demo {
        /// Message the central sends
        #[arg(short, long)]
        message: Option<String>,
        /// Reply the peripheral sends back
        #[arg(short, long)]
        reply: Option<String>,
        /// Simulate a transmit queue that fills after this many chunks
        #[arg(short, long)]
        window: Option<usize>,
    },
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Normalize a service UUID (full or 16/32-bit short form)
    Uuid { input: String },
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
    /// Print the config file location
    Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = config::Config::load()?;

    let default_level = if cli.verbose {
        "debug".to_string()
    } else {
        config.log_level.clone()
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    match cli.command {
        Commands::Demo {
            message,
            reply,
            window,
        } => cmd_demo(config, message, reply, window).await,
        Commands::Config { action } => cmd_config(config, action),
        Commands::Uuid { input } => cmd_uuid(&input),
    }
}

fn cmd_config(mut config: config::Config, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            config.save()?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }

        ConfigAction::Get { key } => {
            if let Some(value) = config.get(&key) {
                println!("{} = {}", key.bright_cyan(), value);
            } else {
                anyhow::bail!("Unknown config key: {}", key);
            }
        }

        ConfigAction::List => {
            println!("{}", "Configuration".bold());
            println!();

            for (key, value) in config.list() {
                println!("  {:<20} {}", key.bright_cyan(), value);
            }
        }

        ConfigAction::Path => {
            println!("{}", config::Config::config_file()?.display());
        }
    }

    Ok(())
}

fn cmd_uuid(input: &str) -> Result<()> {
    let uuid = parse_service_uuid(input)?;
    println!("{}", uuid.to_string().to_uppercase());

    let short = input.trim().trim_start_matches("0x").trim_start_matches("0X");
    if short.len() <= 8 {
        if let Ok(value) = u32::from_str_radix(short, 16) {
            if expand_short_uuid(value) == CCCD_UUID {
                println!("  {}", "(client characteristic configuration descriptor)".dimmed());
            }
        }
    }
    Ok(())
}

async fn cmd_demo(
    config: config::Config,
    message: Option<String>,
    reply: Option<String>,
    window: Option<usize>,
) -> Result<()> {
    let message = message.unwrap_or_else(|| config.demo.message.clone());
    let reply = reply.unwrap_or_else(|| config.demo.reply.clone());
    let window = window.unwrap_or(config.demo.write_window);
    let service = config.messaging.service_uuid.to_string();

    println!("{}", "Starting loopback demo...".bold());
    println!("  service   {}", service.bright_cyan());
    println!(
        "  chunking  {} bytes{}",
        config.messaging.max_chunk_bytes,
        if window > 0 {
            format!(", queue window {}", window)
        } else {
            String::new()
        }
    );
    println!();

    let mut air = LoopbackAir::new();
    if window > 0 {
        air = air.with_write_window(window);
    }

    let (peripheral_sink, mut peripheral_events) = ChannelEventSink::new();
    let (central_sink, mut central_events) = ChannelEventSink::new();
    let peripheral = BleMessaging::new(
        config.messaging.clone(),
        Arc::new(LoopbackProvider::new(air.clone(), "peripheral")),
        Arc::new(peripheral_sink),
    )?;
    let central = BleMessaging::new(
        config.messaging.clone(),
        Arc::new(LoopbackProvider::new(air.clone(), "central")),
        Arc::new(central_sink),
    )?;

    air.power_on();
    println!("{} Adapter powered on", "✓".green());

    peripheral.start_advertising(&service).await?;
    wait_for(&mut peripheral_events, "advertising", |e| {
        matches!(e, MessagingEvent::AdvertisingStarted)
    })
    .await?;
    println!("{} Peripheral advertising", "✓".green());

    central.start_scan(&service, None).await?;
    let found = wait_for(&mut central_events, "discovery", |e| {
        matches!(e, MessagingEvent::DeviceFound { .. })
    })
    .await?;
    let MessagingEvent::DeviceFound { uuid: peer, rssi } = found else {
        anyhow::bail!("Unexpected event during discovery");
    };
    println!("{} Found {} (rssi {})", "✓".green(), peer.bright_cyan(), rssi);

    central.connect_to_device(&peer).await?;
    wait_for(&mut peripheral_events, "subscription", |e| {
        matches!(e, MessagingEvent::DeviceConnected { .. })
    })
    .await?;
    central.stop_scan().await?;
    println!("{} Connected and subscribed", "✓".green());

    central.send_message(&peer, &message).await?;
    let received = wait_for(&mut peripheral_events, "message", |e| {
        matches!(e, MessagingEvent::MessageReceived { .. })
    })
    .await?;
    print_message("peripheral", &received);

    if let MessagingEvent::MessageReceived { from, .. } = &received {
        peripheral.send_message(from, &reply).await?;
        let received = wait_for(&mut central_events, "reply", |e| {
            matches!(e, MessagingEvent::MessageReceived { .. })
        })
        .await?;
        print_message("central", &received);
    }

    central.disconnect_from_device(&peer).await?;
    wait_for(&mut peripheral_events, "disconnect", |e| {
        matches!(e, MessagingEvent::DeviceDisconnected { .. })
    })
    .await?;
    println!("{} Disconnected", "✓".green());

    central.cleanup().await?;
    peripheral.cleanup().await?;
    println!();
    println!("{}", "Demo complete".green().bold());
    Ok(())
}

fn print_message(receiver: &str, event: &MessagingEvent) {
    if let MessagingEvent::MessageReceived { from, message, .. } = event {
        println!(
            "{} {} received from {}: {}",
            "✓".green(),
            receiver,
            from.bright_cyan(),
            message
        );
    }
}

/// Print events until one matches `predicate`, for up to five seconds
async fn wait_for<F>(
    events: &mut UnboundedReceiver<MessagingEvent>,
    label: &str,
    predicate: F,
) -> Result<MessagingEvent>
where
    F: Fn(&MessagingEvent) -> bool,
{
    let wait = async {
        while let Some(event) = events.recv().await {
            tracing::debug!("event: {}", event);
            println!("  {} {}", "·".dimmed(), event.to_string().dimmed());
            if predicate(&event) {
                return Some(event);
            }
        }
        None
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .with_context(|| format!("Timed out waiting for {}", label))?
        .with_context(|| format!("Event stream closed before {}", label))
}
