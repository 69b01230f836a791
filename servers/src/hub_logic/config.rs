use clap::Parser;
use lib_hub::HubSettings;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_PORT: u16 = 9010;
const DEFAULT_CONFIG_FILE: &str = "server_hub.conf";
const DEFAULT_LOG_DIR: &str = "./logs";
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_HEARTBEAT_INTERVAL_SECONDS: u64 = 30;
const DEFAULT_HEARTBEAT_TIMEOUT_SECONDS: u64 = 60;

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[clap(about = "Data distribution hub: one upstream engine per provider, shared by every client port", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "HUB_PORT", help = "Port to listen on for client connections.")]
    pub port: Option<u16>,

    #[clap(long, env = "HUB_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "HUB_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "HUB_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "HUB_HEARTBEAT_INTERVAL_SECONDS", help = "Seconds between two dead-port sweeps.")]
    pub heartbeat_interval_seconds: Option<u64>,

    #[clap(long, env = "HUB_HEARTBEAT_TIMEOUT_SECONDS", help = "Seconds of silence after which a port is reaped.")]
    pub heartbeat_timeout_seconds: Option<u64>,

    #[clap(long, env = "TLS_CERT_PATH", help = "Path to the TLS certificate file.")]
    pub tls_cert_path: Option<PathBuf>,

    #[clap(long, env = "TLS_KEY_PATH", help = "Path to the TLS private key file.")]
    pub tls_key_path: Option<PathBuf>,
}

impl Config {
    // 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            port: other.port.or(self.port),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            heartbeat_interval_seconds: other.heartbeat_interval_seconds.or(self.heartbeat_interval_seconds),
            heartbeat_timeout_seconds: other.heartbeat_timeout_seconds.or(self.heartbeat_timeout_seconds),
            tls_cert_path: other.tls_cert_path.or(self.tls_cert_path),
            tls_key_path: other.tls_key_path.or(self.tls_key_path),
        }
    }

    fn defaults() -> Config {
        Config {
            port: Some(DEFAULT_PORT),
            log_dir: Some(PathBuf::from(DEFAULT_LOG_DIR)),
            log_level: Some(DEFAULT_LOG_LEVEL.to_string()),
            heartbeat_interval_seconds: Some(DEFAULT_HEARTBEAT_INTERVAL_SECONDS),
            heartbeat_timeout_seconds: Some(DEFAULT_HEARTBEAT_TIMEOUT_SECONDS),
            ..Default::default()
        }
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_DIR))
    }

    pub fn log_level(&self) -> String {
        self.log_level.clone().unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string())
    }

    pub fn hub_settings(&self) -> HubSettings {
        HubSettings::new(
            Duration::from_secs(self.heartbeat_interval_seconds.unwrap_or(DEFAULT_HEARTBEAT_INTERVAL_SECONDS)),
            Duration::from_secs(self.heartbeat_timeout_seconds.unwrap_or(DEFAULT_HEARTBEAT_TIMEOUT_SECONDS)),
        )
    }

    /// Cert and key paths, only when both files exist.
    pub fn tls_paths(&self) -> Option<(PathBuf, PathBuf)> {
        match (&self.tls_cert_path, &self.tls_key_path) {
            (Some(cert), Some(key)) if cert.exists() && key.exists() => Some((cert.clone(), key.clone())),
            _ => None,
        }
    }
}

/// Reads a JSON config file. Problems are reported as a note, never as a
/// failure: the server still starts from the other sources.
fn read_config_file(path: &Path) -> Result<Config, String> {
    if !path.exists() {
        return Err(format!(
            "Config file not found at {}. Using defaults and environment/CLI variables.",
            path.display()
        ));
    }
    let config_str = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config file {}: {}. Falling back to other sources.", path.display(), e))?;
    serde_json::from_str::<Config>(&config_str)
        .map_err(|e| format!("Failed to parse config file {}: {}. Falling back to other sources.", path.display(), e))
}

/// Builds the effective configuration: defaults < config file < env/CLI.
///
/// Returns the notes gathered along the way so they can be logged once the
/// logger is up.
pub fn load_config() -> (Config, Vec<String>) {
    let cli_args = Config::parse();
    resolve(cli_args)
}

fn resolve(cli_args: Config) -> (Config, Vec<String>) {
    let mut notes = Vec::new();

    let config_file_path = cli_args
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let mut current_config = Config::defaults();
    match read_config_file(&config_file_path) {
        Ok(file_config) => {
            notes.push(format!("Loaded config file {}", config_file_path.display()));
            current_config = current_config.merge(file_config);
        }
        Err(note) => notes.push(note),
    }
    current_config = current_config.merge(cli_args);

    // Default TLS material lives where certbot-style tooling puts it.
    if current_config.tls_cert_path.is_none() || current_config.tls_key_path.is_none() {
        if let Some(home_dir) = dirs::home_dir() {
            let letsencrypt_dir = home_dir.join(".letsencrypt");
            if current_config.tls_cert_path.is_none() {
                current_config.tls_cert_path = Some(letsencrypt_dir.join("fullchain.pem"));
            }
            if current_config.tls_key_path.is_none() {
                current_config.tls_key_path = Some(letsencrypt_dir.join("privkey.pem"));
            }
        } else {
            notes.push("Could not determine home directory for default TLS paths.".to_string());
        }
    }

    (current_config, notes)
}
