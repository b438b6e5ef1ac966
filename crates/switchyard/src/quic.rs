//! Multiplexed datagram transport (QUIC).
//!
//! One connection per endpoint: exactly one bidirectional control stream
//! (identification, bindings, commands, telemetry, keepalives, RTT and
//! speed-test signaling) plus the unreliable datagram lane, which carries
//! video only.
//!
//! Control-stream messages are u32 big-endian length-prefixed packet frames;
//! the first frame is the `TRAIN:<id>` / `REMOTE_CONTROL:<id>` line, answered
//! with `HELLO:<id>`. Video datagrams from trains are pushed into the bounded
//! fan-out ring and relayed by the dedicated fan-out task so the receive path
//! never blocks.

use crate::endpoint::{DatagramLane, Endpoint, EndpointRole, SendError, TransportKind};
use crate::state::AppState;
use crate::webtransport;
use anyhow::{bail, Context, Result};
use bytes::Bytes;
use quinn::{Connection, RecvStream, SendStream};
use railproto::packet::peek_type;
use railproto::{Identify, MapConnection, PacketType, Role};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Upper bound for one control-stream frame.
const MAX_FRAME: usize = 16 * 1024 * 1024;

/// ALPN ids this listener accepts. `h3` and `webtransport` negotiate the
/// WebTransport-style session first; the native id uses raw streams directly.
pub const ALPN_PROTOCOLS: &[&[u8]] = &[b"switchyard", b"h3", b"webtransport"];

struct QuicLane(Connection);

impl DatagramLane for QuicLane {
    fn send_datagram(&self, data: Bytes) -> Result<(), SendError> {
        self.0
            .send_datagram(data)
            .map_err(|err| SendError(err.to_string()))
    }
}

/// Load the TLS material and build the quinn server config.
pub fn build_server_config(config: &railconf::RelayConfig) -> Result<quinn::ServerConfig> {
    // Idempotent; the error just means a provider is already installed.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let certs = {
        let pem = std::fs::read(&config.tls.cert_path).with_context(|| {
            format!("reading certificate chain {}", config.tls.cert_path.display())
        })?;
        rustls_pemfile::certs(&mut pem.as_slice())
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("parsing certificate chain")?
    };
    let key = {
        let pem = std::fs::read(&config.tls.key_path)
            .with_context(|| format!("reading private key {}", config.tls.key_path.display()))?;
        rustls_pemfile::private_key(&mut pem.as_slice())
            .context("parsing private key")?
            .context("no private key found")?
    };

    let mut tls = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("building TLS config")?;
    tls.alpn_protocols = ALPN_PROTOCOLS.iter().map(|p| p.to_vec()).collect();

    let crypto = quinn::crypto::rustls::QuicServerConfig::try_from(tls)
        .context("building QUIC crypto config")?;
    let mut server = quinn::ServerConfig::with_crypto(Arc::new(crypto));

    let mut transport = quinn::TransportConfig::default();
    // Transport-level idle is a backstop; the liveness scheduler owns
    // eviction at quic_idle_secs.
    transport.max_idle_timeout(Some(
        Duration::from_secs(config.limits.quic_idle_secs * 2)
            .try_into()
            .context("idle timeout out of range")?,
    ));
    server.transport_config(Arc::new(transport));

    Ok(server)
}

/// Bind the QUIC endpoint and accept connections until cancelled.
pub async fn run(state: Arc<AppState>, cancel: CancellationToken) -> Result<()> {
    let server_config = build_server_config(&state.config)?;
    let addr = format!("{}:{}", state.config.bind.host, state.config.bind.quic_port)
        .parse()
        .context("invalid QUIC bind address")?;
    let endpoint = quinn::Endpoint::server(server_config, addr)
        .with_context(|| format!("binding QUIC endpoint to {addr}"))?;
    info!(%addr, "QUIC listener ready");

    loop {
        let incoming = tokio::select! {
            _ = cancel.cancelled() => break,
            incoming = endpoint.accept() => match incoming {
                Some(incoming) => incoming,
                None => break,
            },
        };
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            if let Err(err) = handle_connection(state, incoming).await {
                debug!(%err, "QUIC connection ended with error");
            }
        });
    }

    endpoint.close(0u32.into(), b"shutdown");
    Ok(())
}

async fn handle_connection(state: Arc<AppState>, incoming: quinn::Incoming) -> Result<()> {
    let connection = incoming.await.context("QUIC handshake failed")?;
    let remote = connection.remote_address();
    debug!(%remote, "QUIC connection established");

    if negotiated_webtransport_alpn(&connection) {
        webtransport::accept_session(&connection).await?;
    }

    // The first bidirectional stream is the control stream.
    let (mut send, mut recv) = connection
        .accept_bi()
        .await
        .context("accepting control stream")?;

    let identity = match read_frame(&mut recv).await? {
        Some(frame) => Identify::parse(&frame).context("parsing identification")?,
        None => bail!("control stream closed before identification"),
    };
    write_frame(&mut send, railproto::ident::hello_line(&identity.id).as_bytes()).await?;

    let role = match identity.role {
        Role::Train => EndpointRole::Train,
        Role::Console => EndpointRole::Console,
    };
    let endpoint = Endpoint::with_datagram_lane(
        &identity.id,
        role,
        TransportKind::Quic,
        &state.config.limits,
        Box::new(QuicLane(connection.clone())),
    );

    match role {
        EndpointRole::Train => {
            state
                .registry
                .add_train(&identity.id, TransportKind::Quic, Arc::clone(&endpoint))
        }
        EndpointRole::Console => {
            state
                .registry
                .add_console(&identity.id, TransportKind::Quic, Arc::clone(&endpoint))
        }
    }

    let writer = spawn_writer(Arc::clone(&endpoint), send);
    let datagrams = spawn_datagram_receiver(
        Arc::clone(&state),
        Arc::clone(&endpoint),
        connection.clone(),
        role,
        identity.id.clone(),
    );

    let result = control_loop(&state, &endpoint, &identity.id, role, &mut recv).await;

    endpoint.close("connection closed");
    let _ = tokio::time::timeout(Duration::from_secs(1), writer).await;
    datagrams.abort();
    state.registry.remove_endpoint(&endpoint);
    connection.close(0u32.into(), b"bye");
    debug!(%remote, id = %identity.id, "QUIC connection torn down");
    result
}

fn negotiated_webtransport_alpn(connection: &Connection) -> bool {
    connection
        .handshake_data()
        .and_then(|data| data.downcast::<quinn::crypto::rustls::HandshakeData>().ok())
        .and_then(|data| data.protocol)
        .map(|alpn| alpn == b"h3" || alpn == b"webtransport")
        .unwrap_or(false)
}

/// Sender: drains the bounded outbound queue onto the control stream.
fn spawn_writer(endpoint: Arc<Endpoint>, mut send: SendStream) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let cancel = endpoint.cancellation().clone();
        loop {
            let data = tokio::select! {
                _ = cancel.cancelled() => break,
                data = endpoint.queue().pop() => match data {
                    Some(data) => data,
                    None => break,
                },
            };
            if write_frame(&mut send, &data).await.is_err() {
                break;
            }
        }
        let _ = send.finish();
    })
}

/// Receiver for the unreliable lane. Only train video flows here; it feeds
/// the fan-out ring and never blocks.
fn spawn_datagram_receiver(
    state: Arc<AppState>,
    endpoint: Arc<Endpoint>,
    connection: Connection,
    role: EndpointRole,
    id: String,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let meter = match role {
            EndpointRole::Train => Some(state.bandwidth_meter(&id)),
            EndpointRole::Console => None,
        };
        loop {
            let datagram = match connection.read_datagram().await {
                Ok(datagram) => datagram,
                Err(_) => break,
            };
            endpoint.touch();
            match role {
                EndpointRole::Train => {
                    if matches!(peek_type(&datagram), Ok(PacketType::Video)) {
                        if let Some(meter) = &meter {
                            meter.record(datagram.len());
                        }
                        state.fanout.push(&id, datagram);
                    } else {
                        state.metrics.incr_unknown_type();
                    }
                }
                EndpointRole::Console => {
                    debug!(id, "ignoring datagram from console");
                }
            }
        }
    })
}

async fn control_loop(
    state: &AppState,
    endpoint: &Arc<Endpoint>,
    id: &str,
    role: EndpointRole,
    recv: &mut RecvStream,
) -> Result<()> {
    let cancel = endpoint.cancellation().clone();
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = read_frame(recv) => frame?,
        };
        let Some(frame) = frame else { break };
        endpoint.touch();

        if MapConnection::matches(&frame) {
            handle_map_connection(state, &frame);
            continue;
        }

        match peek_type(&frame) {
            Ok(PacketType::Keepalive) => {
                debug!(id, "keepalive");
            }
            Ok(PacketType::Rtt) => {
                endpoint.queue().push_control(frame).await;
            }
            Ok(_) => match role {
                EndpointRole::Train => state.router.route_train_packet(id, frame).await,
                EndpointRole::Console => state.router.route_console_packet(id, frame).await,
            },
            Err(railproto::ProtoError::UnknownType(_)) => state.metrics.incr_unknown_type(),
            Err(_) => state.metrics.incr_codec_errors(),
        }
    }
    Ok(())
}

fn handle_map_connection(state: &AppState, frame: &[u8]) {
    let map = match MapConnection::parse(frame) {
        Ok(map) => map,
        Err(err) => {
            warn!(%err, "malformed MAP_CONNECTION");
            state.metrics.incr_codec_errors();
            return;
        }
    };
    info!(console_id = %map.console_id, train_id = %map.train_id, "in-band bind");
    if state.registry.bind(&map.console_id, &map.train_id).is_err() {
        warn!(train_id = %map.train_id, "bind failed: unknown train");
        if !state.registry.has_trains() {
            state.hooks.fire_bind_with_no_train();
        }
    }
}

/// Read one length-prefixed frame; `None` on orderly stream end.
async fn read_frame(recv: &mut RecvStream) -> Result<Option<Bytes>> {
    let mut len_buf = [0u8; 4];
    match recv.read_exact(&mut len_buf).await {
        Ok(()) => {}
        Err(quinn::ReadExactError::FinishedEarly(_)) => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME {
        bail!("control frame of {len} bytes exceeds limit");
    }
    let mut data = vec![0u8; len];
    recv.read_exact(&mut data)
        .await
        .context("reading control frame body")?;
    Ok(Some(Bytes::from(data)))
}

async fn write_frame(send: &mut SendStream, data: &[u8]) -> Result<()> {
    send.write_all(&(data.len() as u32).to_be_bytes()).await?;
    send.write_all(data).await?;
    Ok(())
}
