//! QUIC transport: one control stream plus the unreliable datagram lane
//! that carries video.
//!
//! Control-stream messages are u32 big-endian length-prefixed packet frames,
//! matching the relay. Identification is the first frame (`TRAIN:<id>`); the
//! relay answers `HELLO:<id>` before any other traffic.

use super::{Transport, TransportEvent, TransportId};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use quinn::{Connection, RecvStream, SendStream};
use railproto::{ident, Identify};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const MAX_FRAME: usize = 16 * 1024 * 1024;

/// ALPN offered to the relay.
const ALPN: &[u8] = b"switchyard";

pub struct QuicTransport {
    connection: Connection,
    control: mpsc::Sender<Bytes>,
    // Keeps the endpoint driver alive for the lifetime of the transport.
    _endpoint: quinn::Endpoint,
}

impl QuicTransport {
    pub async fn connect(
        addr: SocketAddr,
        server_name: &str,
        train_id: &str,
        insecure: bool,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Arc<Self>> {
        let mut tls = if insecure {
            danger::insecure_client_config()
        } else {
            let mut roots = rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        };
        tls.alpn_protocols = vec![ALPN.to_vec()];

        let crypto = quinn::crypto::rustls::QuicClientConfig::try_from(tls)
            .context("building QUIC client crypto")?;
        let client_config = quinn::ClientConfig::new(Arc::new(crypto));

        let mut endpoint = quinn::Endpoint::client("0.0.0.0:0".parse().expect("wildcard addr"))
            .context("binding local QUIC socket")?;
        endpoint.set_default_client_config(client_config);

        let connection = endpoint
            .connect(addr, server_name)
            .context("initiating QUIC connection")?
            .await
            .context("QUIC handshake failed")?;
        debug!(%addr, "QUIC connected");

        let (mut send, mut recv) = connection
            .open_bi()
            .await
            .context("opening control stream")?;

        write_frame(&mut send, Identify::train(train_id).to_line().as_bytes()).await?;
        let hello = read_frame(&mut recv)
            .await?
            .context("relay closed before HELLO")?;
        let confirmed = ident::parse_hello(&hello).context("parsing HELLO")?;
        if confirmed != train_id {
            bail!("relay confirmed a different id: {confirmed}");
        }
        info!(train_id, "QUIC identification confirmed");

        let (control, mut control_rx) = mpsc::channel::<Bytes>(64);

        tokio::spawn(async move {
            while let Some(data) = control_rx.recv().await {
                if write_frame(&mut send, &data).await.is_err() {
                    break;
                }
            }
            let _ = send.finish();
        });

        let reader_events = events.clone();
        tokio::spawn(async move {
            loop {
                match read_frame(&mut recv).await {
                    Ok(Some(data)) => {
                        let event = TransportEvent::Packet {
                            transport: TransportId::Quic,
                            data,
                        };
                        if reader_events.send(event).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) | Err(_) => break,
                }
            }
            let _ = reader_events
                .send(TransportEvent::Disconnected {
                    transport: TransportId::Quic,
                })
                .await;
        });

        events
            .send(TransportEvent::Identified {
                transport: TransportId::Quic,
            })
            .await
            .ok();

        Ok(Arc::new(Self {
            connection,
            control,
            _endpoint: endpoint,
        }))
    }
}

#[async_trait]
impl Transport for QuicTransport {
    fn id(&self) -> TransportId {
        TransportId::Quic
    }

    async fn send_control(&self, data: Bytes) -> Result<()> {
        self.control
            .send(data)
            .await
            .map_err(|_| anyhow::anyhow!("QUIC control writer gone"))
    }

    async fn send_video(&self, data: Bytes) -> Result<()> {
        // Unreliable lane: losing a packet is preferable to stalling the
        // burst, so oversized or congested sends are only logged.
        if let Err(err) = self.connection.send_datagram(data) {
            warn!(%err, "video datagram dropped");
        }
        Ok(())
    }
}

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

mod danger {
    //! Certificate verification bypass for bench setups running the relay
    //! with self-signed material. Never enabled by default.

    use rustls::client::danger::{
        HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
    };
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use std::sync::Arc;

    #[derive(Debug)]
    struct SkipServerVerification(rustls::crypto::CryptoProvider);

    pub fn insecure_client_config() -> rustls::ClientConfig {
        let provider = rustls::crypto::ring::default_provider();
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipServerVerification(provider)))
            .with_no_client_auth()
    }

    impl ServerCertVerifier for SkipServerVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &rustls::DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls12_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &rustls::DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls13_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
            self.0.signature_verification_algorithms.supported_schemes()
        }
    }
}
