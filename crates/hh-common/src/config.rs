use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Immutable configuration loaded once at startup.
///
/// Every component receives this by `Arc`; nothing reads the environment
/// after boot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Bus broker host
    pub bus_host: String,
    /// Bus broker port
    pub bus_port: u16,
    /// Optional bus credentials
    pub bus_username: Option<String>,
    pub bus_password: Option<String>,
    /// Bus session identifier
    pub bus_client_id: String,
    /// SQLite database path (`:memory:` accepted)
    pub store_path: String,
    /// Query surface + fan-out port
    pub api_port: u16,
    /// Root of the firmware source tree used by OTA enumeration
    pub source_root: PathBuf,
    /// Public raw-content base URL (strategy a)
    pub raw_base_url: Option<String>,
    /// Proxy base URL (strategy b); overrides the raw base when set
    pub proxy_base_url: Option<String>,
    /// Ref used when an update trigger omits one
    pub default_ref: String,
    /// Health sweeper threshold in seconds
    pub offline_timeout_secs: u64,
    /// Weather-stuck alert threshold in seconds
    pub weather_stall_secs: u64,
    /// Optional sensor-reading retention window in days (None = keep forever)
    pub retention_days: Option<u32>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bus_host: "localhost".to_string(),
            bus_port: 1883,
            bus_username: None,
            bus_password: None,
            bus_client_id: "homehub".to_string(),
            store_path: "/var/lib/homehub/homehub.db".to_string(),
            api_port: 4000,
            source_root: PathBuf::from("/opt/homehub/firmware"),
            raw_base_url: None,
            proxy_base_url: None,
            default_ref: "main".to_string(),
            offline_timeout_secs: 90,
            weather_stall_secs: 120,
            retention_days: None,
        }
    }
}

impl HubConfig {
    /// Build the configuration from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(v) = std::env::var("BUS_HOST") {
            config.bus_host = v;
        }
        if let Ok(v) = std::env::var("BUS_PORT") {
            if let Ok(port) = v.parse() {
                config.bus_port = port;
            }
        }
        if let Ok(v) = std::env::var("BUS_USERNAME") {
            config.bus_username = Some(v);
        }
        if let Ok(v) = std::env::var("BUS_PASSWORD") {
            config.bus_password = Some(v);
        }
        if let Ok(v) = std::env::var("BUS_CLIENT_ID") {
            config.bus_client_id = v;
        }
        if let Ok(v) = std::env::var("STORE_PATH") {
            config.store_path = v;
        }
        if let Ok(v) = std::env::var("API_PORT") {
            if let Ok(port) = v.parse() {
                config.api_port = port;
            }
        }
        if let Ok(v) = std::env::var("SOURCE_ROOT") {
            config.source_root = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("RAW_BASE_URL") {
            config.raw_base_url = Some(v);
        }
        if let Ok(v) = std::env::var("PROXY_BASE_URL") {
            config.proxy_base_url = Some(v);
        }
        if let Ok(v) = std::env::var("DEFAULT_REF") {
            config.default_ref = v;
        }
        if let Ok(v) = std::env::var("OFFLINE_TIMEOUT_SECS") {
            if let Ok(secs) = v.parse() {
                config.offline_timeout_secs = secs;
            }
        }
        if let Ok(v) = std::env::var("WEATHER_STALL_SECS") {
            if let Ok(secs) = v.parse() {
                config.weather_stall_secs = secs;
            }
        }
        if let Ok(v) = std::env::var("RETENTION_DAYS") {
            if let Ok(days) = v.parse() {
                config.retention_days = Some(days);
            }
        }

        config
    }

    /// Load a `.env` file (if present) then the environment.
    pub fn load(env_file: Option<&Path>) -> Self {
        if let Some(path) = env_file {
            load_dotenv(path);
        } else {
            let candidates = [PathBuf::from("/opt/homehub/.env"), PathBuf::from(".env")];
            for candidate in &candidates {
                if candidate.exists() {
                    load_dotenv(candidate);
                    break;
                }
            }
        }

        Self::from_env()
    }

    pub fn offline_timeout_ms(&self) -> i64 {
        self.offline_timeout_secs as i64 * 1000
    }

    pub fn weather_stall_ms(&self) -> i64 {
        self.weather_stall_secs as i64 * 1000
    }
}

/// Load a basic .env file (KEY=VALUE per line)
fn load_dotenv(path: &Path) {
    if let Ok(content) = std::fs::read_to_string(path) {
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                let key = key.trim();
                let value = value.trim().trim_matches('"').trim_matches('\'');
                if std::env::var(key).is_err() {
                    // SAFETY: called before spawning any threads (single-threaded init)
                    unsafe { std::env::set_var(key, value) };
                }
            }
        }
    }
}
