use anyhow::{Context, Result};
use clap::Parser;
use railconf::RelayConfig;
use std::path::PathBuf;
use std::sync::Arc;
use switchyard::state::AppState;
use switchyard::{liveness, mqtt, quic, state};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// The Switchyard relay server
///
/// Routes video, telemetry and driving commands between train agents and
/// operator consoles over WebSocket, QUIC and MQTT.
///
/// Configuration is loaded from (in order, later wins):
/// 1. Compiled defaults
/// 2. /etc/switchyard/config.toml
/// 3. ~/.config/switchyard/config.toml
/// 4. ./switchyard.toml (or --config path)
/// 5. Environment variables (SWITCHYARD_*, HOST, FAST_API_PORT, QUIC_PORT,
///    MQTT_PORT)
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to config file (overrides ./switchyard.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Show loaded configuration and exit
    #[arg(long)]
    show_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (config, sources) = RelayConfig::load_with_sources_from(cli.config.as_deref())
        .context("Failed to load configuration")?;

    if cli.show_config {
        println!("# Configuration sources:");
        for path in &sources.files {
            println!("#   - {}", path.display());
        }
        if !sources.env_overrides.is_empty() {
            println!("# Environment overrides:");
            for var in &sources.env_overrides {
                println!("#   - {}", var);
            }
        }
        println!();
        println!("{}", config.to_toml());
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.telemetry.log_level.clone().into()),
        )
        .init();

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        warn!("rustls crypto provider already installed");
    }

    info!("Configuration loaded from:");
    for path in &sources.files {
        info!("   - {}", path.display());
    }
    if !sources.env_overrides.is_empty() {
        info!("   Environment overrides: {:?}", sources.env_overrides);
    }

    let state = AppState::new(config);
    let cancel = CancellationToken::new();

    // Datagram fan-out relay task.
    tokio::spawn(
        Arc::clone(&state.fanout).run(Arc::clone(&state.router), cancel.clone()),
    );

    // Registry event pump: notifications, stream gating, sim hooks.
    state::spawn_event_pump(Arc::clone(&state), cancel.clone());

    // Liveness scheduler.
    tokio::spawn(liveness::run(
        Arc::clone(&state.registry),
        state.config.limits.clone(),
        cancel.clone(),
    ));

    // MQTT bridge.
    let bridge = mqtt::MqttBridge::new(Arc::clone(&state));
    tokio::spawn(bridge.run(cancel.clone()));

    // QUIC listener. TLS material is mandatory here; with TLS disabled and
    // no certificates present the relay still serves WS/HTTP.
    match quic::build_server_config(&state.config) {
        Ok(_) => {
            let quic_state = Arc::clone(&state);
            let quic_cancel = cancel.clone();
            tokio::spawn(async move {
                if let Err(err) = quic::run(quic_state, quic_cancel).await {
                    error!(%err, "QUIC listener failed");
                    std::process::exit(1);
                }
            });
        }
        Err(err) if state.config.tls.enabled => {
            error!(%err, "failed to load TLS material");
            std::process::exit(1);
        }
        Err(err) => {
            warn!(%err, "QUIC disabled: no TLS material");
        }
    }

    // HTTP + WebSocket + signaling listener.
    let addr: std::net::SocketAddr =
        format!("{}:{}", state.config.bind.host, state.config.bind.http_port)
            .parse()
            .context("invalid HTTP bind address")?;
    let app = switchyard::app(Arc::clone(&state));

    if state.config.tls.enabled {
        let tls = axum_server::tls_rustls::RustlsConfig::from_pem_file(
            &state.config.tls.cert_path,
            &state.config.tls.key_path,
        )
        .await;
        let tls = match tls {
            Ok(tls) => tls,
            Err(err) => {
                error!(%err, "failed to load TLS material for HTTPS");
                std::process::exit(1);
            }
        };
        info!(%addr, "HTTPS listener ready");
        if let Err(err) = axum_server::bind_rustls(addr, tls)
            .serve(app.into_make_service())
            .await
        {
            error!(%err, "HTTPS server failed");
            std::process::exit(1);
        }
    } else {
        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(err) => {
                error!(%err, %addr, "failed to bind HTTP listener");
                std::process::exit(1);
            }
        };
        info!(%addr, "HTTP listener ready");
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(cancel.clone()))
            .await
            .context("HTTP server failed")?;
    }

    cancel.cancel();
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT, shutting down...");
        }
        _ = async {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                let mut sigterm = signal(SignalKind::terminate()).expect("Failed to setup SIGTERM");
                sigterm.recv().await;
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        } => {
            info!("Received SIGTERM, shutting down...");
        }
    }
    cancel.cancel();
}
