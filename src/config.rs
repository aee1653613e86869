//! Settings file of the `hass-device` runner.
//!
//! ```toml
//! [broker]
//! host = "homeassistant.local"
//! port = 1883
//! username = "example"
//! password = "example"
//!
//! [device]
//! name = "Example Device"
//! manufacturer = "Example"
//!
//! [runtime]
//! settle_delay_ms = 500
//! status_interval_secs = 10
//! ```

use crate::device::{DeviceConfig, DeviceIdentity, DeviceOptions};
use crate::symbols::{Availability, Qos};
use crate::transport::{ConnectOptions, LastWill};
use crate::validate;
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

const CONFIG_DIR: &str = ".config/hass-device";
const CONFIG_FILE: &str = "device.toml";

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct BrokerSettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: Option<String>,
    pub keep_alive_secs: u64,
    pub connect_timeout_ms: u64,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        let options = ConnectOptions::default();
        Self {
            host: options.host,
            port: options.port,
            username: None,
            password: None,
            client_id: None,
            keep_alive_secs: options.keep_alive.as_secs(),
            connect_timeout_ms: options.connect_timeout.as_millis() as u64,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct RuntimeSettings {
    pub settle_delay_ms: u64,
    pub operation_timeout_ms: u64,
    pub retain_config: bool,
    pub qos: Qos,
    /// Zero disables the periodic status update.
    pub status_interval_secs: u64,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            settle_delay_ms: 500,
            operation_timeout_ms: 5000,
            retain_config: false,
            qos: Qos::AtMostOnce,
            status_interval_secs: 10,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct Settings {
    #[serde(default)]
    pub broker: BrokerSettings,
    pub device: DeviceConfig,
    #[serde(default)]
    pub runtime: RuntimeSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            broker: BrokerSettings::default(),
            device: DeviceConfig::new("Example Device"),
            runtime: RuntimeSettings::default(),
        }
    }
}

impl Settings {
    pub fn default_path() -> PathBuf {
        let mut path = get_home_dir();
        path.push(CONFIG_DIR);
        path.push(CONFIG_FILE);
        path
    }

    pub async fn load(path: &Path) -> Result<Self> {
        debug!("Loading settings from {}", path.display());
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| eyre!("Failed to read settings file {}: {}", path.display(), e))?;
        Self::parse(&content)
    }

    /// Loads `path`, writing the default settings there first if it is missing.
    pub async fn load_or_create(path: &Path) -> Result<Self> {
        if !tokio::fs::try_exists(path)
            .await
            .map_err(|e| eyre!("Failed to check if settings file exists: {}", e))?
        {
            warn!("Settings file {} does not exist, writing defaults", path.display());
            Settings::default().save(path).await?;
        }
        Self::load(path).await
    }

    pub fn parse(content: &str) -> Result<Self> {
        let settings: Settings =
            toml::from_str(content).map_err(|e| eyre!("Failed to parse settings: {}", e))?;
        validate::name(&settings.device.name)
            .map_err(|e| eyre!("Invalid device settings: {}", e))?;
        Ok(settings)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| eyre!("Failed to create config directory: {}", e))?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| eyre!("Failed to serialize settings: {}", e))?;
        tokio::fs::write(path, content)
            .await
            .map_err(|e| eyre!("Failed to write settings file: {}", e))?;
        info!("Settings saved to {}", path.display());
        Ok(())
    }

    /// Broker options, with a last will that marks the device offline.
    pub fn connect_options(&self) -> Result<ConnectOptions> {
        let broker = &self.broker;
        let identity = DeviceIdentity::from_config(&self.device)
            .map_err(|e| eyre!("Invalid device settings: {}", e))?;

        let mut options = ConnectOptions::new(broker.host.clone(), broker.port);
        options.username = broker.username.clone();
        options.password = broker.password.clone();
        options.client_id = broker.client_id.clone();
        options.keep_alive = Duration::from_secs(broker.keep_alive_secs);
        options.connect_timeout = Duration::from_millis(broker.connect_timeout_ms);
        options.operation_timeout = Duration::from_millis(self.runtime.operation_timeout_ms);
        options.last_will = Some(LastWill {
            topic: identity.topics.availability,
            payload: Availability::Offline.as_str().as_bytes().to_vec(),
            qos: self.runtime.qos,
            retain: true,
        });
        Ok(options)
    }

    pub fn device_options(&self) -> DeviceOptions {
        DeviceOptions {
            settle_delay: Duration::from_millis(self.runtime.settle_delay_ms),
            qos: self.runtime.qos,
            retain_config: self.runtime.retain_config,
        }
    }
}

fn get_home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| {
        warn!("Could not determine home directory, using current directory");
        PathBuf::from(".")
    })
}
