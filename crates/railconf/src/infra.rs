//! Configuration sections - things that cannot change at runtime.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Network bind addresses for the relay process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindConfig {
    /// Listen address for every transport.
    /// Default: 0.0.0.0
    #[serde(default = "BindConfig::default_host")]
    pub host: String,

    /// HTTP + WebSocket port.
    /// Default: 8000
    #[serde(default = "BindConfig::default_http_port")]
    pub http_port: u16,

    /// QUIC (UDP) port.
    /// Default: 4437
    #[serde(default = "BindConfig::default_quic_port")]
    pub quic_port: u16,

    /// MQTT broker host the bridge connects to.
    /// Default: localhost
    #[serde(default = "BindConfig::default_mqtt_host")]
    pub mqtt_host: String,

    /// MQTT broker port.
    /// Default: 1883
    #[serde(default = "BindConfig::default_mqtt_port")]
    pub mqtt_port: u16,
}

impl BindConfig {
    fn default_host() -> String {
        "0.0.0.0".to_string()
    }

    fn default_http_port() -> u16 {
        8000
    }

    fn default_quic_port() -> u16 {
        4437
    }

    fn default_mqtt_host() -> String {
        "localhost".to_string()
    }

    fn default_mqtt_port() -> u16 {
        1883
    }
}

impl Default for BindConfig {
    fn default() -> Self {
        Self {
            host: Self::default_host(),
            http_port: Self::default_http_port(),
            quic_port: Self::default_quic_port(),
            mqtt_host: Self::default_mqtt_host(),
            mqtt_port: Self::default_mqtt_port(),
        }
    }
}

/// TLS certificate configuration, shared by the HTTPS/WSS listener and the
/// QUIC endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Serve HTTPS/WSS. QUIC always requires the certificate.
    #[serde(default = "TlsConfig::default_enabled")]
    pub enabled: bool,

    /// Full certificate chain (PEM).
    #[serde(default = "TlsConfig::default_cert_path")]
    pub cert_path: PathBuf,

    /// Private key (PEM).
    #[serde(default = "TlsConfig::default_key_path")]
    pub key_path: PathBuf,
}

impl TlsConfig {
    fn default_enabled() -> bool {
        false
    }

    fn default_cert_path() -> PathBuf {
        if cfg!(windows) {
            PathBuf::from(r"C:\quic_conf\certificate.pem")
        } else {
            PathBuf::from("/etc/letsencrypt/live/switchyard/fullchain.pem")
        }
    }

    fn default_key_path() -> PathBuf {
        if cfg!(windows) {
            PathBuf::from(r"C:\quic_conf\certificate.key")
        } else {
            PathBuf::from("/etc/letsencrypt/live/switchyard/privkey.pem")
        }
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
            cert_path: Self::default_cert_path(),
            key_path: Self::default_key_path(),
        }
    }
}

/// Timeouts, queue bounds and protocol constants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Idle eviction for WebSocket endpoints, seconds. Default: 60
    #[serde(default = "LimitsConfig::default_ws_idle_secs")]
    pub ws_idle_secs: u64,

    /// Idle eviction for QUIC endpoints, seconds. Default: 30
    #[serde(default = "LimitsConfig::default_quic_idle_secs")]
    pub quic_idle_secs: u64,

    /// Keepalive emission interval, seconds. Default: 25
    #[serde(default = "LimitsConfig::default_keepalive_secs")]
    pub keepalive_secs: u64,

    /// Per-endpoint outbound video queue bound (drop-oldest). Default: 256
    #[serde(default = "LimitsConfig::default_video_queue")]
    pub video_queue: usize,

    /// Per-endpoint outbound control queue bound (blocking). Default: 64
    #[serde(default = "LimitsConfig::default_control_queue")]
    pub control_queue: usize,

    /// Datagram fan-out ring bound (drop-oldest). Default: 1024
    #[serde(default = "LimitsConfig::default_fanout_queue")]
    pub fanout_queue: usize,

    /// On-wire MTU controlling video fragmentation. Default: 1200
    #[serde(default = "LimitsConfig::default_mtu")]
    pub mtu: usize,

    /// Speedtest download payload size in megabytes. Default: 20
    #[serde(default = "LimitsConfig::default_speedtest_mb")]
    pub speedtest_mb: usize,

    /// RTT handshake sample count. Default: 5
    #[serde(default = "LimitsConfig::default_rtt_samples")]
    pub rtt_samples: u8,

    /// Per-sample RTT handshake timeout, seconds. Default: 2
    #[serde(default = "LimitsConfig::default_rtt_sample_timeout_secs")]
    pub rtt_sample_timeout_secs: u64,
}

impl LimitsConfig {
    fn default_ws_idle_secs() -> u64 {
        60
    }

    fn default_quic_idle_secs() -> u64 {
        30
    }

    fn default_keepalive_secs() -> u64 {
        25
    }

    fn default_video_queue() -> usize {
        256
    }

    fn default_control_queue() -> usize {
        64
    }

    fn default_fanout_queue() -> usize {
        1024
    }

    fn default_mtu() -> usize {
        1200
    }

    fn default_speedtest_mb() -> usize {
        20
    }

    fn default_rtt_samples() -> u8 {
        5
    }

    fn default_rtt_sample_timeout_secs() -> u64 {
        2
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            ws_idle_secs: Self::default_ws_idle_secs(),
            quic_idle_secs: Self::default_quic_idle_secs(),
            keepalive_secs: Self::default_keepalive_secs(),
            video_queue: Self::default_video_queue(),
            control_queue: Self::default_control_queue(),
            fanout_queue: Self::default_fanout_queue(),
            mtu: Self::default_mtu(),
            speedtest_mb: Self::default_speedtest_mb(),
            rtt_samples: Self::default_rtt_samples(),
            rtt_sample_timeout_secs: Self::default_rtt_sample_timeout_secs(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log filter (trace, debug, info, warn, error or an env-filter spec).
    /// Default: info
    #[serde(default = "TelemetryConfig::default_log_level")]
    pub log_level: String,
}

impl TelemetryConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
        }
    }
}
