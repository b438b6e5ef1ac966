use anyhow::{Context, Result};
use cabcar::motor::SimMotor;
use cabcar::source::H264FileSource;
use cabcar::transport::TransportId;
use cabcar::{AgentConfig, TrainAgent};
use clap::Parser;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// The Cabcar train agent
///
/// Streams encoded video and telemetry to a switchyard relay and executes
/// the driving commands consoles send back.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Relay hostname or address
    #[arg(long, default_value = "localhost")]
    server: String,

    /// Relay HTTP/WebSocket port
    #[arg(long, default_value_t = 8000)]
    http_port: u16,

    /// Relay QUIC port
    #[arg(long, default_value_t = 4437)]
    quic_port: u16,

    /// MQTT broker port on the relay host
    #[arg(long, default_value_t = 1883)]
    mqtt_port: u16,

    /// Train identity; generated when omitted
    #[arg(long)]
    train_id: Option<String>,

    /// Annex-B H.264 file replayed as the video source
    #[arg(long)]
    video: PathBuf,

    /// Source frame rate
    #[arg(long, default_value_t = 30)]
    fps: u32,

    /// On-wire MTU for video fragmentation
    #[arg(long, default_value_t = 1200)]
    mtu: usize,

    /// Transport carrying video at startup
    #[arg(long, value_parser = parse_transport, default_value = "quic")]
    protocol: TransportId,

    /// Use wss/https toward the relay
    #[arg(long)]
    tls: bool,

    /// Skip TLS certificate verification (self-signed relay)
    #[arg(long)]
    insecure: bool,
}

fn parse_transport(value: &str) -> Result<TransportId, String> {
    match value.to_ascii_lowercase().as_str() {
        "quic" => Ok(TransportId::Quic),
        "websocket" | "ws" => Ok(TransportId::Ws),
        other => Err(format!("unknown transport: {other} (quic|websocket)")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        tracing::warn!("rustls crypto provider already installed");
    }

    let train_id = cli
        .train_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    info!(train_id, "cabcar starting");

    let source =
        H264FileSource::open(&cli.video, cli.fps).context("opening video source")?;

    let config = AgentConfig {
        train_id,
        server_host: cli.server,
        http_port: cli.http_port,
        quic_port: cli.quic_port,
        mqtt_port: cli.mqtt_port,
        tls: cli.tls,
        insecure: cli.insecure,
        fps: cli.fps,
        mtu: cli.mtu,
        initial_transport: cli.protocol,
    };

    let agent = TrainAgent::new(config, Box::new(source), Box::<SimMotor>::default());

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received SIGINT, shutting down...");
        signal_cancel.cancel();
    });

    agent.run(cancel).await
}
