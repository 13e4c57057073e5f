//! Threshold-signing node binary
//!
//! Reads the node's secp256k1 private key from standard input, brings up
//! the overlay and the HTTP control plane, and runs until SIGINT/SIGTERM.

use anyhow::{Context, Result};
use clap::Parser;
use k256::ecdsa::SigningKey;
use std::io::{BufRead, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tss_core::party::sim::SimProvider;
use tss_core::TssConfig;
use tss_node::p2p::NetAddress;
use tss_node::TssServer;

#[derive(Parser)]
#[command(name = "tss-node", about = "Threshold-ECDSA signing node", version)]
struct Cli {
    /// Address the HTTP control plane listens on
    #[arg(long = "tss-port", default_value = "127.0.0.1:8080")]
    tss_addr: SocketAddr,

    /// Overlay listening port
    #[arg(long = "p2p-port", default_value_t = 6668)]
    p2p_port: u16,

    /// External IP of this node, advertised to peers
    #[arg(long = "external-ip")]
    external_ip: Option<String>,

    /// Bootstrap peer address, repeatable (/ip4/<ip>/tcp/<port>/p2p/<id>)
    #[arg(long = "peer")]
    peers: Vec<NetAddress>,

    /// String identifying the group of nodes to join
    #[arg(long, default_value = "Asgard")]
    rendezvous: String,

    /// Bech32 account prefix committee public keys are encoded with
    #[arg(long = "bech32-prefix", default_value = "tss")]
    bech32_prefix: String,

    /// Home folder storing the keygen state files
    #[arg(long, default_value = "")]
    home: PathBuf,

    /// Keygen timeout in seconds
    #[arg(long = "gentimeout", default_value_t = 30)]
    gen_timeout: u64,

    /// Keysign timeout in seconds
    #[arg(long = "signtimeout", default_value_t = 30)]
    sign_timeout: u64,

    /// Pre-parameter generation timeout in seconds
    #[arg(long = "preparamtimeout", default_value_t = 300)]
    pre_param_timeout: u64,

    /// Log level
    #[arg(long = "loglevel", default_value = "info")]
    log_level: String,

    /// Enables unstructured prettified logging, useful for local debugging
    #[arg(long = "pretty-log")]
    pretty_log: bool,
}

fn init_log(level: &str, pretty: bool) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| {
        eprintln!("{level} is not a valid log-level, falling back to 'info'");
        EnvFilter::new("info")
    });
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if pretty {
        builder.pretty().init();
    } else {
        builder.init();
    }
}

fn read_private_key() -> Result<SigningKey> {
    print!("input node secret key: ");
    std::io::stdout().flush().ok();
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("fail to read the secret key")?;
    let raw = hex::decode(line.trim()).context("secret key is not valid hex")?;
    let bytes: [u8; 32] = raw
        .as_slice()
        .try_into()
        .context("secret key must be 32 bytes")?;
    SigningKey::from_bytes(&bytes.into()).context("secret key is not a valid scalar")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_log(&cli.log_level, cli.pretty_log);
    tss_core::identity::set_bech32_prefix(&cli.bech32_prefix);

    let private_key = read_private_key()?;
    let conf = TssConfig {
        party_timeout: Duration::from_secs(45),
        keygen_timeout: Duration::from_secs(cli.gen_timeout),
        keysign_timeout: Duration::from_secs(cli.sign_timeout),
        pre_param_timeout: Duration::from_secs(cli.pre_param_timeout),
    };

    let server = TssServer::new(
        cli.peers,
        cli.p2p_port,
        private_key,
        &cli.rendezvous,
        &cli.home,
        conf,
        cli.external_ip,
        Arc::new(SimProvider),
    )
    .await
    .context("fail to create the TSS node")?;
    server.start();
    info!(peer = %server.local_peer_id(), "node is up");

    let shutdown_server = Arc::clone(&server);
    let shutdown = async move {
        shutdown_signal().await;
        shutdown_server.stop();
    };
    tss_node::http::serve(server, cli.tss_addr, shutdown)
        .await
        .context("control plane failed")?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
