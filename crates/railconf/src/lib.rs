//! Minimal configuration loading for the switchyard relay and cabcar agent.
//!
//! This crate provides configuration loading with minimal dependencies so
//! every workspace crate can import it without dependency cycles.
//!
//! # Config File Locations
//!
//! Files are loaded in order (later wins):
//! 1. `/etc/switchyard/config.toml` (system)
//! 2. `~/.config/switchyard/config.toml` (user)
//! 3. `./switchyard.toml` (local override, or `--config` path)
//! 4. Environment variables (`SWITCHYARD_*`, plus the legacy `HOST`,
//!    `FAST_API_PORT`, `QUIC_PORT` and `MQTT_PORT` names the deployment
//!    scripts already export)
//!
//! # Example Config
//!
//! ```toml
//! [bind]
//! host = "0.0.0.0"
//! http_port = 8000
//! quic_port = 4437
//!
//! [tls]
//! enabled = true
//! cert_path = "/etc/letsencrypt/live/relay.example.org/fullchain.pem"
//! key_path = "/etc/letsencrypt/live/relay.example.org/privkey.pem"
//!
//! [limits]
//! ws_idle_secs = 60
//! quic_idle_secs = 30
//!
//! [telemetry]
//! log_level = "info"
//! ```

pub mod infra;
pub mod loader;

pub use infra::{BindConfig, LimitsConfig, TelemetryConfig, TlsConfig};
pub use loader::ConfigSources;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Complete relay configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub bind: BindConfig,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl RelayConfig {
    /// Load configuration from all sources.
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load configuration from an optional CLI-provided path and return
    /// information about which sources contributed.
    pub fn load_with_sources_from(
        config_path: Option<&std::path::Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut config = RelayConfig::default();

        for path in loader::discover_config_files_with_override(config_path) {
            config = loader::load_from_file(&path, config)?;
            sources.files.push(path);
        }

        loader::apply_env_overrides(&mut config, &mut sources);

        Ok((config, sources))
    }

    /// Serialize config to TOML string for `--show-config`.
    pub fn to_toml(&self) -> String {
        let mut out = String::from("# Switchyard Configuration\n\n");

        out.push_str("[bind]\n");
        out.push_str(&format!("host = \"{}\"\n", self.bind.host));
        out.push_str(&format!("http_port = {}\n", self.bind.http_port));
        out.push_str(&format!("quic_port = {}\n", self.bind.quic_port));
        out.push_str(&format!("mqtt_host = \"{}\"\n", self.bind.mqtt_host));
        out.push_str(&format!("mqtt_port = {}\n", self.bind.mqtt_port));

        out.push_str("\n[tls]\n");
        out.push_str(&format!("enabled = {}\n", self.tls.enabled));
        out.push_str(&format!("cert_path = \"{}\"\n", self.tls.cert_path.display()));
        out.push_str(&format!("key_path = \"{}\"\n", self.tls.key_path.display()));

        out.push_str("\n[limits]\n");
        out.push_str(&format!("ws_idle_secs = {}\n", self.limits.ws_idle_secs));
        out.push_str(&format!("quic_idle_secs = {}\n", self.limits.quic_idle_secs));
        out.push_str(&format!("keepalive_secs = {}\n", self.limits.keepalive_secs));
        out.push_str(&format!("video_queue = {}\n", self.limits.video_queue));
        out.push_str(&format!("control_queue = {}\n", self.limits.control_queue));
        out.push_str(&format!("fanout_queue = {}\n", self.limits.fanout_queue));
        out.push_str(&format!("mtu = {}\n", self.limits.mtu));
        out.push_str(&format!("speedtest_mb = {}\n", self.limits.speedtest_mb));
        out.push_str(&format!("rtt_samples = {}\n", self.limits.rtt_samples));
        out.push_str(&format!(
            "rtt_sample_timeout_secs = {}\n",
            self.limits.rtt_sample_timeout_secs
        ));

        out.push_str("\n[telemetry]\n");
        out.push_str(&format!("log_level = \"{}\"\n", self.telemetry.log_level));

        out
    }
}
