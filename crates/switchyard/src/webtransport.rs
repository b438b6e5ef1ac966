//! WebTransport-style session acceptance for h3-negotiated connections.
//!
//! Browsers dialing over WebTransport expect a `CONNECT` request with
//! `:protocol = webtransport` answered with a 200 before they use the
//! connection. This module performs that exchange leniently: it sniffs the
//! first client-initiated stream for the protocol token and replies with a
//! minimal draft-style response. Bit-level compatibility with any specific
//! HTTP/3 extension draft is out of scope; interop targets clients that
//! tolerate a permissive handshake.

use anyhow::{Context, Result};
use quinn::Connection;
use tracing::debug;

const RESPONSE_OK: &[u8] = b":status: 200\r\nsec-webtransport-http3-draft: draft02\r\n\r\n";
const RESPONSE_BAD: &[u8] = b":status: 400\r\n\r\n";

/// Accept the session-establishing stream and answer the CONNECT request.
pub async fn accept_session(connection: &Connection) -> Result<()> {
    let (mut send, mut recv) = connection
        .accept_bi()
        .await
        .context("accepting WebTransport session stream")?;

    let mut buf = vec![0u8; 4096];
    let n = recv
        .read(&mut buf)
        .await
        .context("reading CONNECT request")?
        .unwrap_or(0);
    let request = &buf[..n];

    if contains(request, b"webtransport") {
        debug!("WebTransport session established");
        send.write_all(RESPONSE_OK)
            .await
            .context("writing session response")?;
        Ok(())
    } else {
        send.write_all(RESPONSE_BAD)
            .await
            .context("writing session rejection")?;
        let _ = send.finish();
        anyhow::bail!("stream did not request a webtransport session");
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack
        .windows(needle.len())
        .any(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_scan() {
        assert!(contains(b"CONNECT :protocol=webtransport", b"webtransport"));
        assert!(contains(b"webtransport", b"webtransport"));
        assert!(!contains(b"GET /index", b"webtransport"));
        assert!(!contains(b"short", b"webtransport"));
    }
}
