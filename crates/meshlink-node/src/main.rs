//! Meshlink Node - command-line host for a mesh radio
//!
//! Connects to one radio over serial, TCP or Bluetooth LE, keeps the link
//! alive across drops, optionally sends one message, and prints every mesh
//! update until interrupted.

mod console;

use anyhow::{bail, Context};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use meshlink_radio::model::node_id_string;
use meshlink_radio::{
    default_transport_factory, ConnectionParameters, MeshContext, MeshlinkConfig, NoopStore,
    ReconnectionCoordinator, BROADCAST_ADDR, DEFAULT_TCP_PORT,
};

use console::ConsoleObserver;

/// How long `--send` waits for the radio session before giving up
const READY_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "meshlink-node")]
#[command(about = "Connect to a mesh radio and print what it hears")]
struct Args {
    /// Serial port of the radio (e.g. /dev/ttyUSB0)
    #[arg(long, conflicts_with_all = ["tcp", "ble"])]
    serial: Option<String>,

    /// Network address of the radio, host[:port]
    #[arg(long, conflicts_with = "ble")]
    tcp: Option<String>,

    /// BLE name or address of the radio
    #[arg(long)]
    ble: Option<String>,

    /// Send this text once the radio is ready
    #[arg(long)]
    send: Option<String>,

    /// Destination node (!hex id, 0x hex or decimal); broadcast if omitted
    #[arg(long, requires = "send")]
    to: Option<String>,

    /// Channel index for --send
    #[arg(long, default_value_t = 0)]
    channel: u32,

    /// Do not reconnect when the link drops
    #[arg(long)]
    no_reconnect: bool,

    /// Print updates as JSON lines
    #[arg(long)]
    json: bool,

    /// Enable verbose logging
    #[arg(long, short)]
    verbose: bool,
}

impl Args {
    fn connection(&self) -> anyhow::Result<ConnectionParameters> {
        if let Some(port) = &self.serial {
            return Ok(ConnectionParameters::serial(port));
        }
        if let Some(addr) = &self.tcp {
            let (host, port) = parse_tcp_address(addr)?;
            return Ok(ConnectionParameters::tcp(host, port));
        }
        if let Some(device) = &self.ble {
            return Ok(ConnectionParameters::ble(device));
        }
        bail!("one of --serial, --tcp or --ble is required");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging; stderr keeps stdout clean for --json
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let params = args.connection()?;
    let destination = match &args.to {
        Some(to) => parse_node(to)?,
        None => BROADCAST_ADDR,
    };

    let mut config = MeshlinkConfig::default();
    config.reconnect.enabled = !args.no_reconnect;
    config.validate()?;

    let ctx = Arc::new(MeshContext::new(
        Arc::new(config.client.clone()),
        Arc::new(NoopStore),
        Arc::new(ConsoleObserver::new(args.json)),
        config.client.message_history,
    ));

    info!("Connecting to {}", params);
    let coordinator = ReconnectionCoordinator::new(default_transport_factory(), ctx, config);
    coordinator
        .connect(params.clone())
        .await
        .with_context(|| format!("failed to connect to {}", params))?;

    if let Some(text) = &args.send {
        match send_when_ready(&coordinator, text, destination, args.channel).await {
            Ok(id) => info!(
                "Sent message {:08x} to {}",
                id,
                node_id_string(destination)
            ),
            Err(e) => warn!("Message not sent: {:#}", e),
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    coordinator.disconnect().await?;
    Ok(())
}

/// Wait for the handshake to finish, then send
async fn send_when_ready(
    coordinator: &ReconnectionCoordinator,
    text: &str,
    to: u32,
    channel: u32,
) -> anyhow::Result<u32> {
    let engine = coordinator
        .engine()
        .await
        .context("radio is not connected")?;
    let mut session = engine.subscribe();
    tokio::time::timeout(READY_TIMEOUT, session.wait_for(|s| s.is_ready()))
        .await
        .context("radio did not finish its handshake")?
        .context("connection closed during handshake")?;
    Ok(engine.send_text(text, to, channel).await?)
}

/// Parse `host` or `host:port`; bracketed IPv6 literals keep their colons
fn parse_tcp_address(addr: &str) -> anyhow::Result<(String, u16)> {
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .with_context(|| format!("unterminated IPv6 address: {}", addr))?;
        let port = match tail.strip_prefix(':') {
            Some(p) => p.parse().with_context(|| format!("invalid port: {}", p))?,
            None if tail.is_empty() => DEFAULT_TCP_PORT,
            None => bail!("invalid address: {}", addr),
        };
        return Ok((host.to_string(), port));
    }
    match addr.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            let port = port
                .parse()
                .with_context(|| format!("invalid port: {}", port))?;
            Ok((host.to_string(), port))
        }
        _ => Ok((addr.to_string(), DEFAULT_TCP_PORT)),
    }
}

/// Parse a node number from `!1a2b3c4d`, `0x1a2b3c4d` or decimal
fn parse_node(s: &str) -> anyhow::Result<u32> {
    let s = s.trim();
    if s.eq_ignore_ascii_case("all") || s.eq_ignore_ascii_case("broadcast") {
        return Ok(BROADCAST_ADDR);
    }
    let parsed = if let Some(hex) = s.strip_prefix('!') {
        u32::from_str_radix(hex, 16)
    } else if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
    } else {
        s.parse()
    };
    parsed.with_context(|| format!("invalid node id: {}", s))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_node() {
        assert_eq!(parse_node("!0a0b0c0d").unwrap(), 0x0A0B0C0D);
        assert_eq!(parse_node("0xFF").unwrap(), 255);
        assert_eq!(parse_node("1234").unwrap(), 1234);
        assert_eq!(parse_node("all").unwrap(), BROADCAST_ADDR);
        assert!(parse_node("!zz").is_err());
    }

    #[test]
    fn test_parse_tcp_address() {
        assert_eq!(
            parse_tcp_address("radio.local").unwrap(),
            ("radio.local".to_string(), DEFAULT_TCP_PORT)
        );
        assert_eq!(
            parse_tcp_address("10.0.0.5:4000").unwrap(),
            ("10.0.0.5".to_string(), 4000)
        );
        assert_eq!(
            parse_tcp_address("[fe80::1]:4403").unwrap(),
            ("fe80::1".to_string(), 4403)
        );
        assert_eq!(
            parse_tcp_address("fe80::1").unwrap(),
            ("fe80::1".to_string(), DEFAULT_TCP_PORT)
        );
        assert!(parse_tcp_address("host:notaport").is_err());
    }

    #[test]
    fn test_connection_from_args() {
        let args = Args::parse_from(["meshlink-node", "--tcp", "radio:4403"]);
        assert_eq!(
            args.connection().unwrap(),
            ConnectionParameters::tcp("radio", 4403)
        );

        let args = Args::parse_from(["meshlink-node"]);
        assert!(args.connection().is_err());

        assert!(Args::try_parse_from(["meshlink-node", "--serial", "/dev/ttyUSB0", "--ble", "x"])
            .is_err());
    }
}
