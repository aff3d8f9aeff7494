//! Host configuration.
//!
//! Loaded from `apphost.json` in the platform config dir. Every field is
//! serde-defaulted so a partial (or absent, or corrupt) file still yields a
//! usable config; problems are logged instead of aborting startup.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Config directory using the platform-appropriate location.
///
/// - macOS: `~/Library/Application Support/apphost/`
/// - Linux: `~/.config/apphost/` (or `$XDG_CONFIG_HOME`)
/// - Windows: `%APPDATA%/apphost/`
///
/// Falls back to `~/.apphost/` if the platform dir is unavailable.
pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .map(|d| d.join("apphost"))
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".apphost")
        })
}

/// Data directory for ephemeral extracted instances.
fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("apphost"))
        .unwrap_or_else(|| std::env::temp_dir().join("apphost"))
}

fn default_bind_addr() -> String {
    "127.0.0.1:7700".to_string()
}

fn default_blob_root() -> PathBuf {
    default_data_dir().join("bundles")
}

fn default_packages_root() -> PathBuf {
    default_data_dir().join("shared-packages")
}

fn default_port_base() -> u16 {
    4100
}

fn default_port_span() -> u16 {
    500
}

fn default_max_port_attempts() -> u32 {
    50
}

fn default_spawn_retries() -> u32 {
    3
}

fn default_readiness_attempts() -> u32 {
    40
}

fn default_readiness_interval_ms() -> u64 {
    250
}

fn default_idle_timeout_secs() -> u64 {
    300
}

fn default_hard_ttl_secs() -> u64 {
    1800
}

fn default_sweep_interval_secs() -> u64 {
    30
}

fn default_kill_grace_secs() -> u64 {
    3
}

fn default_cdn_fixups() -> bool {
    true
}

fn default_allowed_origins() -> Vec<String> {
    vec![
        "http://localhost:3000".to_string(),
        "http://127.0.0.1:3000".to_string(),
    ]
}

/// Host configuration, one flat struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HostConfig {
    /// Address the gateway listens on.
    pub bind_addr: String,
    /// Scratch area: extracted instances live under `{data_dir}/instances/`.
    pub data_dir: PathBuf,
    /// Blob store root: `{blob_root}/{plugin_id}/<archive>.zip`.
    pub blob_root: PathBuf,
    /// Shared package store root: `{packages_root}/{name}@{version}/`.
    pub packages_root: PathBuf,
    /// First port the instance port scan starts from.
    pub port_base: u16,
    /// Size of the port window the rolling counter wraps within.
    pub port_span: u16,
    /// Port reservation attempts before giving up.
    pub max_port_attempts: u32,
    /// Process spawn retries (each on a fresh port) before StartupFailed.
    pub spawn_retries: u32,
    /// Readiness poll attempt budget.
    pub readiness_attempts: u32,
    /// Delay between readiness poll attempts.
    pub readiness_interval_ms: u64,
    /// Instance is evictable after this much time without a request.
    pub idle_timeout_secs: u64,
    /// Hard cap on instance lifetime, idle or not.
    pub hard_ttl_secs: u64,
    /// How often the eviction sweep runs.
    pub sweep_interval_secs: u64,
    /// Grace period between graceful termination and forceful kill.
    pub kill_grace_secs: u64,
    /// Whether dependency fixups may download known-good assets from a CDN.
    /// When false (air-gapped deployments), fixups write diagnostic stubs.
    pub cdn_fixups: bool,
    /// Dashboard origins allowed by CORS.
    pub allowed_origins: Vec<String>,
    /// Override for the static server command, e.g. `["node", "server.js"]`.
    /// The port is passed via the `PORT` env var and the serving root is
    /// appended as the final argument. Defaults to `<current_exe> static-serve`.
    pub static_server_command: Option<Vec<String>>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            data_dir: default_data_dir(),
            blob_root: default_blob_root(),
            packages_root: default_packages_root(),
            port_base: default_port_base(),
            port_span: default_port_span(),
            max_port_attempts: default_max_port_attempts(),
            spawn_retries: default_spawn_retries(),
            readiness_attempts: default_readiness_attempts(),
            readiness_interval_ms: default_readiness_interval_ms(),
            idle_timeout_secs: default_idle_timeout_secs(),
            hard_ttl_secs: default_hard_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            kill_grace_secs: default_kill_grace_secs(),
            cdn_fixups: default_cdn_fixups(),
            allowed_origins: default_allowed_origins(),
            static_server_command: None,
        }
    }
}

impl HostConfig {
    /// Load `apphost.json` from the config dir, falling back to defaults.
    /// A corrupt file is logged and ignored rather than failing startup.
    pub fn load() -> Self {
        Self::load_from(&config_dir().join("apphost.json"))
    }

    /// Load from an explicit path (used by `--config` and tests).
    pub fn load_from(path: &std::path::Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        let content = match std::fs::read_to_string(path) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!("could not read config {}: {e}", path.display());
                return Self::default();
            }
        };
        match serde_json::from_str(&content) {
            Ok(v) => v,
            Err(e) => {
                tracing::error!("corrupt config {}: {e}. Using defaults.", path.display());
                Self::default()
            }
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn hard_ttl(&self) -> Duration {
        Duration::from_secs(self.hard_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }

    pub fn readiness_interval(&self) -> Duration {
        Duration::from_millis(self.readiness_interval_ms)
    }

    /// Where extracted instances are materialized.
    pub fn instances_dir(&self) -> PathBuf {
        self.data_dir.join("instances")
    }
}
