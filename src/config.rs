//! Server configuration: ambient settings from the environment (teacher's
//! `Config::from_env` pattern), plus the two INI files spec.md §6 mandates —
//! a global server section and a per-application table (the latter parsed
//! in `registry.rs`, which owns binding construction).

use ini::Ini;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Ambient server configuration, loaded from the environment the way the
/// teacher's `Config::from_env` loads its settings.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub port: u16,

    /// Path to the global INI file (`[server]` section: debug, allowed
    /// hosts, async mode, cassandra contact points, spool dir).
    pub config_path: PathBuf,

    /// Path to the application-table INI file (one section per app).
    pub applications_path: PathBuf,

    /// Credentials directory; relative vendor paths in the application
    /// table resolve against this.
    pub credentials_dir: PathBuf,

    /// Default per-target remote-log timeout (spec.md §5: `log_time_out`,
    /// default 2s).
    pub log_time_out: Duration,

    /// Registry reload poll interval (spec.md §4.1: 100ms).
    pub reload_interval: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            bind_addr: std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: std::env::var("PORT").ok().and_then(|p| p.parse().ok()).unwrap_or(8400),
            config_path: std::env::var("PUSHD_CONFIG")
                .unwrap_or_else(|_| "config/config.ini".to_string())
                .into(),
            applications_path: std::env::var("PUSHD_APPLICATIONS")
                .unwrap_or_else(|_| "config/applications.ini".to_string())
                .into(),
            credentials_dir: std::env::var("PUSHD_CREDENTIALS")
                .unwrap_or_else(|_| "config/credentials".to_string())
                .into(),
            log_time_out: Duration::from_secs(
                std::env::var("LOG_TIME_OUT_SECS").ok().and_then(|s| s.parse().ok()).unwrap_or(2),
            ),
            reload_interval: Duration::from_millis(
                std::env::var("RELOAD_INTERVAL_MS").ok().and_then(|s| s.parse().ok()).unwrap_or(100),
            ),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}

/// The `[server]` section of the global INI file.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub debug: bool,
    pub allowed_hosts: Vec<String>,
    pub return_async: bool,
    pub cassandra_contact_points: Vec<String>,
    pub spool_dir: PathBuf,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            debug: false,
            allowed_hosts: Vec::new(),
            return_async: false,
            cassandra_contact_points: Vec::new(),
            spool_dir: PathBuf::from("spool"),
        }
    }
}

/// Load the `[server]` section. A missing file yields defaults — the global
/// config file is optional, same as the original's `config.ini.example`
/// being a template rather than a requirement.
pub fn load_server_settings(path: &Path) -> Result<ServerSettings, String> {
    if !path.exists() {
        return Ok(ServerSettings::default());
    }
    let ini = Ini::load_from_file(path).map_err(|e| format!("{}: {e}", path.display()))?;
    let section = ini.section(Some("server"));

    let debug = section.and_then(|s| s.get("debug")).map(|v| v == "true" || v == "1").unwrap_or(false);
    let allowed_hosts = section
        .and_then(|s| s.get("allowed_hosts"))
        .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
        .unwrap_or_default();
    let return_async = section.and_then(|s| s.get("return_async")).map(|v| v == "true" || v == "1").unwrap_or(false);
    let cassandra_contact_points = section
        .and_then(|s| s.get("cassandra_contact_points"))
        .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
        .unwrap_or_default();
    let spool_dir = section.and_then(|s| s.get("spool_dir")).map(PathBuf::from).unwrap_or_else(|| PathBuf::from("spool"));

    Ok(ServerSettings { debug, allowed_hosts, return_async, cassandra_contact_points, spool_dir })
}
