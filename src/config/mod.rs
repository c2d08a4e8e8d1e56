//! Configuration management

use std::path::PathBuf;

use anyhow::Result;
use serde::Deserialize;

use crate::boards::BoardLimits;

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default = "default_port")]
    pub port: u16,

    /// Token required on `/admin/api` routes; admin routes are closed when unset
    #[serde(default)]
    pub admin_token: Option<String>,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub boards: BoardLimits,

    #[serde(default)]
    pub mqtt: Option<MqttConfig>,
}

fn default_port() -> u16 {
    5000
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    #[default]
    File,
}

#[derive(Debug, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    #[serde(default = "default_store_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_store_timeout_ms() -> u64 {
    2000
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            timeout_ms: default_store_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_topic_prefix() -> String {
    "luminous".to_string()
}

/// Get config directory (XDG_CONFIG_HOME or platform default)
pub fn get_config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("LUMINOUS_CONFIG_DIR") {
        return PathBuf::from(dir);
    }

    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join("Library/Application Support/luminous-hub");
        }
    }

    #[cfg(target_os = "linux")]
    {
        if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
            return PathBuf::from(xdg).join("luminous-hub");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(".config/luminous-hub");
        }
    }

    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("luminous-hub");
        }
    }

    PathBuf::from(".")
}

/// Get data directory (XDG_DATA_HOME or platform default)
pub fn get_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("LUMINOUS_DATA_DIR") {
        return PathBuf::from(dir);
    }

    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join("Library/Application Support/luminous-hub");
        }
    }

    #[cfg(target_os = "linux")]
    {
        if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
            return PathBuf::from(xdg).join("luminous-hub");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(".local/share/luminous-hub");
        }
    }

    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("LOCALAPPDATA") {
            return PathBuf::from(appdata).join("luminous-hub");
        }
    }

    PathBuf::from("./data")
}

pub fn load_config() -> Result<Config> {
    let config_dir = get_config_dir();

    let mut builder = ::config::Config::builder()
        .set_default("port", 5000)?
        .add_source(
            ::config::File::with_name(&config_dir.join("config").to_string_lossy()).required(false),
        )
        // LUMINOUS_PORT, LUMINOUS_STORE__BACKEND, LUMINOUS_MQTT__HOST, ...
        .add_source(
            ::config::Environment::with_prefix("LUMINOUS")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

    // Port precedence: LUMINOUS_PORT > PORT > config file > default
    if let Ok(port) = std::env::var("LUMINOUS_PORT") {
        if let Ok(port_num) = port.parse::<u16>() {
            builder = builder.set_override("port", port_num as i64)?;
        }
    } else if let Ok(port) = std::env::var("PORT") {
        if let Ok(port_num) = port.parse::<u16>() {
            builder = builder.set_override("port", port_num as i64)?;
        }
    }

    // Legacy broker variables from older deployments
    if let Ok(host) = std::env::var("MQTT_BROKER") {
        builder = builder.set_override("mqtt.host", host)?;
    }
    if let Ok(port) = std::env::var("MQTT_PORT") {
        if let Ok(port_num) = port.parse::<u16>() {
            builder = builder.set_override("mqtt.port", port_num as i64)?;
        }
    }

    let config: Config = builder.build()?.try_deserialize()?;
    if config.boards.default_relay_count == 0
        || config.boards.default_relay_count > config.boards.max_relay_count
    {
        anyhow::bail!(
            "boards.default_relay_count must be between 1 and boards.max_relay_count ({})",
            config.boards.max_relay_count
        );
    }
    Ok(config)
}
