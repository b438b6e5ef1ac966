//! Config file discovery, loading, and environment variable overlay.

use crate::{ConfigError, RelayConfig};
use std::env;
use std::path::{Path, PathBuf};

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order)
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values
    pub env_overrides: Vec<String>,
}

/// Discover config files in standard locations.
///
/// Returns paths in load order (system, user, local/cli).
/// Only returns files that exist.
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/switchyard/config.toml");
    if system.exists() {
        files.push(system);
    }

    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("switchyard/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    // CLI override takes precedence over local
    if let Some(path) = cli_path {
        if path.exists() {
            files.push(path.to_path_buf());
            return files;
        }
    }

    let local = PathBuf::from("switchyard.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Load a TOML file on top of an already-loaded base config. Only keys the
/// file actually sets are overridden.
pub fn load_from_file(path: &Path, base: RelayConfig) -> Result<RelayConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;
    parse_toml(&contents, path, base)
}

/// Parse a TOML overlay on top of `base`.
fn parse_toml(contents: &str, path: &Path, base: RelayConfig) -> Result<RelayConfig, ConfigError> {
    let overlay: toml::Table = contents.parse().map_err(|e: toml::de::Error| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    let mut merged = toml::Table::try_from(&base).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    merge_tables(&mut merged, overlay);

    merged.try_into().map_err(|e: toml::de::Error| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Recursive table merge, overlay wins leaf-by-leaf.
fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(base_sub)), toml::Value::Table(overlay_sub)) => {
                merge_tables(base_sub, overlay_sub);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Apply environment variable overrides to config.
///
/// `SWITCHYARD_*` names are authoritative; the bare `HOST` / `FAST_API_PORT`
/// / `QUIC_PORT` / `MQTT_PORT` names existing deployments export are also
/// honored.
pub fn apply_env_overrides(config: &mut RelayConfig, sources: &mut ConfigSources) {
    let mut set = |name: &str| sources.env_overrides.push(name.to_string());

    if let Ok(v) = env::var("HOST") {
        config.bind.host = v;
        set("HOST");
    }
    if let Ok(v) = env::var("SWITCHYARD_HOST") {
        config.bind.host = v;
        set("SWITCHYARD_HOST");
    }
    if let Ok(v) = env::var("FAST_API_PORT") {
        if let Ok(port) = v.parse() {
            config.bind.http_port = port;
            set("FAST_API_PORT");
        }
    }
    if let Ok(v) = env::var("SWITCHYARD_HTTP_PORT") {
        if let Ok(port) = v.parse() {
            config.bind.http_port = port;
            set("SWITCHYARD_HTTP_PORT");
        }
    }
    if let Ok(v) = env::var("QUIC_PORT") {
        if let Ok(port) = v.parse() {
            config.bind.quic_port = port;
            set("QUIC_PORT");
        }
    }
    if let Ok(v) = env::var("SWITCHYARD_QUIC_PORT") {
        if let Ok(port) = v.parse() {
            config.bind.quic_port = port;
            set("SWITCHYARD_QUIC_PORT");
        }
    }
    if let Ok(v) = env::var("MQTT_PORT") {
        if let Ok(port) = v.parse() {
            config.bind.mqtt_port = port;
            set("MQTT_PORT");
        }
    }
    if let Ok(v) = env::var("SWITCHYARD_MQTT_HOST") {
        config.bind.mqtt_host = v;
        set("SWITCHYARD_MQTT_HOST");
    }
    if let Ok(v) = env::var("SWITCHYARD_TLS_CERT") {
        config.tls.cert_path = PathBuf::from(v);
        config.tls.enabled = true;
        set("SWITCHYARD_TLS_CERT");
    }
    if let Ok(v) = env::var("SWITCHYARD_TLS_KEY") {
        config.tls.key_path = PathBuf::from(v);
        set("SWITCHYARD_TLS_KEY");
    }
    if let Ok(v) = env::var("SWITCHYARD_LOG_LEVEL") {
        config.telemetry.log_level = v;
        set("SWITCHYARD_LOG_LEVEL");
    }
    if let Ok(v) = env::var("RUST_LOG") {
        config.telemetry.log_level = v;
        set("RUST_LOG");
    }
}
