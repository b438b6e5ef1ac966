//! Network speed measurement against the relay's speedtest endpoints.
//!
//! Triggered by the CALCULATE_NETWORK_SPEED command; timing happens on this
//! side, the relay only serves and swallows bytes.

use anyhow::{Context, Result};
use rand::RngCore;
use std::time::{Duration, Instant};
use tracing::info;

/// Upload payload size in megabytes.
const UPLOAD_MB: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpeedReport {
    pub download_mbps: f64,
    pub upload_mbps: f64,
    pub ping_ms: f64,
}

/// Run download and upload passes against the relay at `base_url`
/// (e.g. `http://relay:8000`).
pub async fn measure(base_url: &str) -> Result<SpeedReport> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(60))
        .build()
        .context("building speedtest client")?;

    // Ping: a tiny request round trip.
    let started = Instant::now();
    client
        .get(format!("{base_url}/api/trains"))
        .send()
        .await
        .context("ping request failed")?;
    let ping_ms = started.elapsed().as_secs_f64() * 1000.0;

    // Download pass.
    let started = Instant::now();
    let body = client
        .get(format!("{base_url}/api/speedtest/download"))
        .send()
        .await
        .context("download request failed")?
        .bytes()
        .await
        .context("download body failed")?;
    let download_mbps = mbps(body.len(), started.elapsed());

    // Upload pass.
    let mut payload = vec![0u8; UPLOAD_MB * 1024 * 1024];
    rand::thread_rng().fill_bytes(&mut payload);
    let started = Instant::now();
    client
        .post(format!("{base_url}/api/speedtest/upload"))
        .body(payload)
        .send()
        .await
        .context("upload request failed")?;
    let upload_mbps = mbps(UPLOAD_MB * 1024 * 1024, started.elapsed());

    let report = SpeedReport {
        download_mbps,
        upload_mbps,
        ping_ms,
    };
    info!(
        download_mbps = format_args!("{download_mbps:.2}"),
        upload_mbps = format_args!("{upload_mbps:.2}"),
        ping_ms = format_args!("{ping_ms:.1}"),
        "network speed measured"
    );
    Ok(report)
}

fn mbps(bytes: usize, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64().max(1e-6);
    (bytes as f64 * 8.0) / secs / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mbps_math() {
        // 1 MB in one second = 8 Mbit/s
        let rate = mbps(1_000_000, Duration::from_secs(1));
        assert!((rate - 8.0).abs() < 1e-9);

        // Twice the data in half the time = 32 Mbit/s
        let rate = mbps(2_000_000, Duration::from_millis(500));
        assert!((rate - 32.0).abs() < 1e-9);
    }
}
