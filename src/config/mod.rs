use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

const CONFIG_FILE: &str = "config.toml";
const ENV_PREFIX: &str = "BLE_BRIDGE_";

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct Config {
    pub device: DeviceConfig,
    pub protocol: ProtocolConfig,
    pub bridge: BridgeConfig,
    pub storage: StorageConfig,
    pub console: ConsoleConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub address: String,
    pub service_uuid: String,
    pub characteristic_uuid: String,
    pub scan_timeout_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            address: "1773840C-16AD-9822-65C7-87488BCE5B7C".to_string(),
            service_uuid: "12345678-1234-1234-1234-1234567890ab".to_string(),
            characteristic_uuid: "abcd1234-5678-90ab-cdef-1234567890ab".to_string(),
            scan_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProtocolConfig {
    pub record_size_bytes: u64,
    pub ack_timeout_ms: u64,
    pub block_ack_with_response: bool,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            record_size_bytes: crate::protocol::RECORD_WIRE_SIZE,
            ack_timeout_ms: 10_000,
            block_ack_with_response: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub capacity: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            capacity: crate::bridge::DEFAULT_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    pub output_dir: String,
    pub file_prefix: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: ".".to_string(),
            file_prefix: "esp32_data".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConsoleConfig {
    pub poll_interval_ms: u64,
    pub json: bool,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 200,
            json: false,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        let mut config = Self::default();
        let config_path = active_config_path();

        if let Ok(raw) = fs::read_to_string(&config_path) {
            match toml::from_str::<Config>(&raw) {
                Ok(file_config) => config = file_config,
                Err(err) => {
                    tracing::warn!(path = %config_path.display(), error = %err, "ignoring unreadable config file");
                }
            }
        }

        config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| env::var(format!("{}{}", ENV_PREFIX, key)).ok());
    }

    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        // Device settings
        if let Some(val) = lookup("DEVICE_ADDRESS") {
            self.device.address = val;
        }
        if let Some(val) = lookup("SERVICE_UUID") {
            self.device.service_uuid = val;
        }
        if let Some(val) = lookup("CHARACTERISTIC_UUID") {
            self.device.characteristic_uuid = val;
        }
        if let Some(val) = lookup("SCAN_TIMEOUT_MS") {
            if let Ok(ms) = val.parse() {
                self.device.scan_timeout_ms = ms;
            }
        }

        // Protocol settings
        if let Some(val) = lookup("RECORD_SIZE_BYTES") {
            if let Ok(size) = val.parse() {
                self.protocol.record_size_bytes = size;
            }
        }
        if let Some(val) = lookup("ACK_TIMEOUT_MS") {
            if let Ok(ms) = val.parse() {
                self.protocol.ack_timeout_ms = ms;
            }
        }
        if let Some(val) = lookup("BLOCK_ACK_WITH_RESPONSE") {
            self.protocol.block_ack_with_response = val.parse().unwrap_or(false);
        }

        // Bridge settings
        if let Some(val) = lookup("BRIDGE_CAPACITY") {
            if let Ok(capacity) = val.parse() {
                self.bridge.capacity = capacity;
            }
        }

        // Storage settings
        if let Some(val) = lookup("OUTPUT_DIR") {
            self.storage.output_dir = val;
        }
        if let Some(val) = lookup("FILE_PREFIX") {
            self.storage.file_prefix = val;
        }

        // Console settings
        if let Some(val) = lookup("POLL_INTERVAL_MS") {
            if let Ok(ms) = val.parse() {
                self.console.poll_interval_ms = ms;
            }
        }
        if let Some(val) = lookup("JSON") {
            self.console.json = val.parse().unwrap_or(false);
        }
    }

    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.device.address.trim().is_empty() {
            return Err("device.address must be set".into());
        }
        if self.device.characteristic_uuid.trim().is_empty() {
            return Err("device.characteristic_uuid must be set".into());
        }
        if self.device.scan_timeout_ms == 0 {
            return Err("device.scan_timeout_ms must be non-zero".into());
        }
        if self.protocol.record_size_bytes == 0 {
            return Err("protocol.record_size_bytes must be non-zero".into());
        }
        if self.protocol.ack_timeout_ms < 100 {
            return Err("protocol.ack_timeout_ms must be >= 100".into());
        }
        if self.bridge.capacity == 0 {
            return Err("bridge.capacity must be non-zero".into());
        }
        if self.storage.file_prefix.trim().is_empty() {
            return Err("storage.file_prefix must be set".into());
        }
        if self.console.poll_interval_ms == 0 {
            return Err("console.poll_interval_ms must be non-zero".into());
        }
        Ok(())
    }

    pub fn write_default<P: AsRef<Path>>(path: P) -> Result<(), Box<dyn std::error::Error>> {
        if path.as_ref().exists() {
            return Err("config.toml already exists".into());
        }
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let data = toml::to_string_pretty(&Config::default())?;
        fs::write(path, data)?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        managed_config_path()
    }
}

fn managed_config_path() -> PathBuf {
    if let Ok(path) = env::var(format!("{}CONFIG_PATH", ENV_PREFIX)) {
        return PathBuf::from(path);
    }
    let appdata = env::var("APPDATA").unwrap_or_else(|_| ".".to_string());
    Path::new(&appdata)
        .join("BleTelemetryBridge")
        .join(CONFIG_FILE)
}

fn active_config_path() -> PathBuf {
    let local = PathBuf::from(CONFIG_FILE);
    if local.exists() {
        local
    } else {
        managed_config_path()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_config_serializes() {
        let cfg = Config::default();
        let toml = toml::to_string_pretty(&cfg).unwrap();
        let parsed: Config = toml::from_str(&toml).unwrap();
        parsed.validate().unwrap();
        assert_eq!(parsed.protocol.record_size_bytes, 27);
        assert_eq!(parsed.device.scan_timeout_ms, 5000);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let parsed: Config = toml::from_str(
            r#"
            [device]
            address = "AA:BB:CC:DD:EE:FF"

            [storage]
            output_dir = "captures"
            "#,
        )
        .unwrap();
        assert_eq!(parsed.device.address, "AA:BB:CC:DD:EE:FF");
        assert_eq!(parsed.storage.output_dir, "captures");
        assert_eq!(parsed.storage.file_prefix, "esp32_data");
        assert_eq!(parsed.bridge.capacity, crate::bridge::DEFAULT_CAPACITY);
    }

    #[test]
    fn overrides_apply_and_ignore_garbage() {
        let vars: HashMap<&str, &str> = [
            ("DEVICE_ADDRESS", "AA:BB:CC:DD:EE:FF"),
            ("SCAN_TIMEOUT_MS", "not-a-number"),
            ("ACK_TIMEOUT_MS", "2500"),
            ("BLOCK_ACK_WITH_RESPONSE", "true"),
            ("JSON", "true"),
        ]
        .into_iter()
        .collect();

        let mut cfg = Config::default();
        cfg.apply_overrides(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(cfg.device.address, "AA:BB:CC:DD:EE:FF");
        assert_eq!(cfg.device.scan_timeout_ms, 5000);
        assert_eq!(cfg.protocol.ack_timeout_ms, 2500);
        assert!(cfg.protocol.block_ack_with_response);
        assert!(cfg.console.json);
    }

    #[test]
    fn validate_rejects_zero_sizes() {
        let mut cfg = Config::default();
        cfg.protocol.record_size_bytes = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.bridge.capacity = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.device.scan_timeout_ms = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_requires_device_address() {
        let mut cfg = Config::default();
        cfg.device.address = "  ".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn write_default_refuses_to_clobber() {
        let dir = std::env::temp_dir().join(format!("ble-bridge-cfg-{}", uuid::Uuid::new_v4()));
        let path = dir.join(CONFIG_FILE);
        Config::write_default(&path).unwrap();
        assert!(Config::write_default(&path).is_err());

        let raw = fs::read_to_string(&path).unwrap();
        let parsed: Config = toml::from_str(&raw).unwrap();
        assert_eq!(parsed.device.address, DeviceConfig::default().address);
        let _ = fs::remove_dir_all(&dir);
    }
}
