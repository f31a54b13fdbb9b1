//! tspl-usb
//!
//! Talks to a TSPL label printer over USB: lists the hub tree, sends
//! command files and monitors what the printer sends back.

mod config;
mod logging;

use anyhow::{Context, Result, anyhow};
use async_channel::Receiver;
use clap::{Parser, Subcommand};
use config::CliConfig;
use connection::identity::{decode_ascii, encode_ascii};
use connection::locator::MAX_HUB_DEPTH;
use connection::platform::{UsbHost, UsbNode};
use connection::rusb_host::RusbNode;
use connection::{
    ClientEvent, ConnectionClient, DeviceIdentity, ErrorPolicy, RusbHost, channel_listener,
};
use logging::setup_logging;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "tspl-usb")]
#[command(author, version, about = "Send TSPL commands to a USB label printer")]
#[command(long_about = "
Locates a TSPL label printer anywhere in the USB hub tree, claims its
interface (detaching any kernel driver) and talks to it over bulk pipes.

EXAMPLES:
    # Show the USB tree and where the printer sits
    tspl-usb list

    # Print a label from a command file
    tspl-usb send --file label.tspl

    # Send a single command and show the reply
    tspl-usb send --wait-ms 500 '~!T'

    # Watch everything the printer sends
    tspl-usb monitor

CONFIGURATION:
    Configuration is read from the first of:
    1. Path specified with --config
    2. ~/.config/tspl-usb/config.toml
    3. /etc/tspl-usb/config.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL", global = true)]
    log_level: Option<String>,

    /// Printer vendor id in hex, overrides the configuration
    #[arg(long, value_name = "HEX", value_parser = parse_hex_id, global = true)]
    vendor_id: Option<u16>,

    /// Printer product id in hex, overrides the configuration
    #[arg(long, value_name = "HEX", value_parser = parse_hex_id, global = true)]
    product_id: Option<u16>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the USB hub tree and mark the printer
    List,

    /// Send a command file or a single command line
    Send {
        /// File with raw printer commands
        #[arg(short, long, value_name = "PATH", conflicts_with = "text")]
        file: Option<PathBuf>,

        /// Command text; CRLF is appended when missing
        text: Option<String>,

        /// Keep listening for replies this long after sending
        #[arg(long, value_name = "MS", default_value_t = 0)]
        wait_ms: u64,
    },

    /// Connect and print everything the printer sends until Ctrl+C
    Monitor,

    /// Save the default configuration and exit
    SaveConfig {
        /// Destination, defaults to the per-user location
        #[arg(value_name = "PATH")]
        path: Option<PathBuf>,
    },
}

fn parse_hex_id(raw: &str) -> Result<u16, String> {
    let digits = raw
        .strip_prefix("0x")
        .or_else(|| raw.strip_prefix("0X"))
        .unwrap_or(raw);
    u16::from_str_radix(digits, 16).map_err(|e| format!("invalid USB id '{}': {}", raw, e))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle save-config early (before loading config)
    if let Command::SaveConfig { path } = &args.command {
        let path = path.clone().unwrap_or_else(CliConfig::default_path);
        CliConfig::default()
            .save(&path)
            .context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let mut config = match &args.config {
        Some(path) => CliConfig::load(Some(path.clone())).context("Failed to load configuration")?,
        None => CliConfig::load_or_default(),
    };
    if let Some(vendor_id) = args.vendor_id {
        config.printer.vendor_id = vendor_id;
    }
    if let Some(product_id) = args.product_id {
        config.printer.product_id = product_id;
    }

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.logging.level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("tspl-usb v{}", env!("CARGO_PKG_VERSION"));
    info!("Printer: {}", config.printer.identity());

    match args.command {
        Command::List => {
            tokio::task::spawn_blocking(move || list_mode(&config))
                .await
                .context("USB task panicked")?
        }
        Command::Send {
            file,
            text,
            wait_ms,
        } => {
            let payload = match (file, text) {
                (Some(path), _) => std::fs::read(&path)
                    .with_context(|| format!("Failed to read {}", path.display()))?,
                (None, Some(text)) => encode_ascii(&with_line_ending(text)),
                (None, None) => return Err(anyhow!("Nothing to send, pass --file or a command")),
            };
            send_mode(config, payload, Duration::from_millis(wait_ms)).await
        }
        Command::Monitor => monitor_mode(config).await,
        Command::SaveConfig { .. } => Ok(()),
    }
}

fn with_line_ending(mut text: String) -> String {
    if !text.ends_with('\n') {
        text.push_str("\r\n");
    }
    text
}

/// Print the USB tree and exit
fn list_mode(config: &CliConfig) -> Result<()> {
    let host = RusbHost::new(config.usb.clone());
    let usb = host.info();
    info!("USB host: {} {}", usb.description, usb.version);

    let root = host.root_hub().context("Failed to open libusb")?;
    let target = config.printer.identity();
    let hubs = root.children();

    if hubs.is_empty() {
        println!("No USB devices found.");
        return Ok(());
    }

    let mut found = 0;
    for hub in &hubs {
        print_tree(hub, target, 0, &mut found);
    }

    if found == 0 {
        println!("\nPrinter {} not found.", target);
    } else {
        println!("\nPrinter {} found ({} match(es)).", target, found);
    }
    Ok(())
}

fn print_tree(node: &RusbNode, target: DeviceIdentity, depth: usize, found: &mut usize) {
    if depth >= MAX_HUB_DEPTH {
        return;
    }

    let identity = node.identity();
    let marker = if identity == Some(target) {
        *found += 1;
        "  <- printer"
    } else {
        ""
    };

    println!(
        "{:indent$}Bus {:03} Device {:03}: {}{}{}",
        "",
        node.bus_number().unwrap_or_default(),
        node.address().unwrap_or_default(),
        identity
            .map(|id| id.to_string())
            .unwrap_or_else(|| "????:????".to_string()),
        if node.is_hub() { " [hub]" } else { "" },
        marker,
        indent = depth * 2
    );

    if node.is_hub() {
        for child in node.children() {
            print_tree(&child, target, depth + 1, found);
        }
    }
}

/// Client whose failures surface as errors, for one-shot commands
fn open_client(config: &CliConfig) -> Arc<ConnectionClient<RusbHost>> {
    let printer = config
        .printer
        .clone()
        .with_error_policy(ErrorPolicy::Propagate);
    Arc::new(ConnectionClient::with_host(
        RusbHost::new(config.usb.clone()),
        printer,
    ))
}

/// Subscribe to every notification of `client`
fn subscribe(client: &ConnectionClient<RusbHost>) -> Receiver<ClientEvent> {
    let (listener, events) = channel_listener();
    client.add_client_listener(listener.clone());
    client.add_data_listener(listener);
    events
}

async fn connect(client: &Arc<ConnectionClient<RusbHost>>) -> Result<()> {
    let client = Arc::clone(client);
    tokio::task::spawn_blocking(move || -> Result<()> {
        client.init()?;
        client.connect()?;
        Ok(())
    })
    .await
    .context("USB task panicked")?
    .context("Failed to connect to printer")
}

async fn shutdown(client: Arc<ConnectionClient<RusbHost>>) -> Result<()> {
    tokio::task::spawn_blocking(move || client.shutdown())
        .await
        .context("USB task panicked")?
        .context("Failed to shut down printer connection")
}

/// Print one notification; false once the printer is gone
fn print_event(event: ClientEvent) -> bool {
    match event {
        ClientEvent::MessageReceived(data) => {
            print!("{}", decode_ascii(&data));
            if let Err(e) = std::io::stdout().flush() {
                warn!("Failed to flush stdout: {}", e);
            }
            true
        }
        ClientEvent::MessageSent(data) => {
            info!("Sent {} bytes", data.len());
            true
        }
        ClientEvent::ConnectionEstablished => {
            info!("Connection established");
            true
        }
        ClientEvent::ConnectionFailed(e) => {
            warn!("Printer reported a failure: {}", e);
            true
        }
        ClientEvent::ConnectionLost => {
            warn!("Connection to printer lost");
            false
        }
    }
}

async fn send_mode(config: CliConfig, payload: Vec<u8>, wait: Duration) -> Result<()> {
    let client = open_client(&config);
    let events = subscribe(&client);
    connect(&client).await?;

    let worker = Arc::clone(&client);
    let length = payload.len();
    let sent = tokio::task::spawn_blocking(move || worker.transfer(&payload))
        .await
        .context("USB task panicked")?;

    match sent {
        Ok(written) => println!("Sent {} of {} bytes to {}", written, length, client.identity()),
        Err(e) => {
            shutdown(client).await?;
            return Err(e).context("Failed to send to printer");
        }
    }

    if !wait.is_zero() {
        let deadline = tokio::time::sleep(wait);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                event = events.recv() => match event {
                    Ok(event) => {
                        if !print_event(event) {
                            break;
                        }
                    }
                    Err(_) => break,
                },
            }
        }
        println!();
    }

    shutdown(client).await
}

async fn monitor_mode(config: CliConfig) -> Result<()> {
    let client = open_client(&config);
    let events = subscribe(&client);
    connect(&client).await?;

    info!("Monitoring {}, press Ctrl+C to stop", client.identity());

    loop {
        tokio::select! {
            result = signal::ctrl_c() => {
                match result {
                    Ok(()) => info!("Received Ctrl+C, shutting down..."),
                    Err(e) => warn!("Error waiting for Ctrl+C: {}", e),
                }
                break;
            }
            event = events.recv() => match event {
                Ok(event) => {
                    if !print_event(event) {
                        break;
                    }
                }
                Err(_) => break,
            },
        }
    }

    shutdown(client).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex_id() {
        assert_eq!(parse_hex_id("0x1203"), Ok(0x1203));
        assert_eq!(parse_hex_id("0172"), Ok(0x0172));
        assert_eq!(parse_hex_id("0XFFFF"), Ok(0xffff));
        assert!(parse_hex_id("0x10000").is_err());
        assert!(parse_hex_id("printer").is_err());
    }

    #[test]
    fn test_line_ending_appended_once() {
        assert_eq!(with_line_ending("CLS".to_string()), "CLS\r\n");
        assert_eq!(with_line_ending("CLS\r\n".to_string()), "CLS\r\n");
        assert_eq!(with_line_ending("PRINT 1\n".to_string()), "PRINT 1\n");
    }

    #[test]
    fn test_args_parse_send() {
        let args = Args::try_parse_from([
            "tspl-usb",
            "--vendor-id",
            "0x1203",
            "send",
            "--wait-ms",
            "250",
            "CLS",
        ])
        .unwrap();

        assert_eq!(args.vendor_id, Some(0x1203));
        match args.command {
            Command::Send { file, text, wait_ms } => {
                assert!(file.is_none());
                assert_eq!(text.as_deref(), Some("CLS"));
                assert_eq!(wait_ms, 250);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_args_reject_file_and_text() {
        assert!(Args::try_parse_from(["tspl-usb", "send", "--file", "a.tspl", "CLS"]).is_err());
    }

    #[test]
    fn test_print_event_stops_on_loss() {
        assert!(print_event(ClientEvent::ConnectionEstablished));
        assert!(!print_event(ClientEvent::ConnectionLost));
    }
}
