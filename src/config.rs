//! Configuration management for modpoller

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;
use crate::planner::{PlannerSettings, DEFAULT_MAX_SPAN, DEFAULT_MERGE_GAP};
use crate::register::{
    Bank, BitExtraction, Derivation, Encoding, Format, PollTier, RegisterDescriptor, WordOrder,
};
use crate::scheduler::SchedulerSettings;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// MQTT broker configuration, publishing is disabled without it
    #[serde(default)]
    pub mqtt: Option<MqttConfig>,
    /// Tier intervals and planner tuning shared by every device
    #[serde(default)]
    pub polling: PollingConfig,
    /// List of Modbus devices
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP API host
    pub host: String,
    /// HTTP API port
    pub port: u16,
    /// Enable metrics endpoint
    #[serde(default)]
    pub metrics_enabled: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            metrics_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    /// MQTT broker host
    pub host: String,
    /// MQTT broker port
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    /// Client ID
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Topic prefix
    #[serde(default = "default_client_id")]
    pub topic_prefix: String,
    /// QoS level (0, 1, or 2)
    #[serde(default = "default_qos")]
    pub qos: u8,
    /// Retain value messages
    #[serde(default)]
    pub retain: bool,
    /// Username (optional)
    pub username: Option<String>,
    /// Password (optional)
    pub password: Option<String>,
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "modpoller".to_string()
}

fn default_qos() -> u8 {
    1
}

/// Polling settings, all durations in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub fast_ms: u64,
    pub normal_ms: u64,
    pub slow_ms: u64,
    /// Timeout of a single transport request
    pub timeout_ms: u64,
    /// Largest number of words in one read
    pub max_span: u16,
    /// Unused words that may be read to merge two ranges
    pub merge_gap: u16,
    /// Consecutive failed batches before a tier backs off
    pub failure_threshold: u32,
    pub max_backoff_ms: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            fast_ms: 1_000,
            normal_ms: 5_000,
            slow_ms: 30_000,
            timeout_ms: 3_000,
            max_span: DEFAULT_MAX_SPAN,
            merge_gap: DEFAULT_MERGE_GAP,
            failure_threshold: 3,
            max_backoff_ms: 60_000,
        }
    }
}

impl PollingConfig {
    pub fn planner(&self) -> PlannerSettings {
        PlannerSettings {
            max_span: self.max_span,
            merge_gap: self.merge_gap,
        }
    }
}

/// Per-device tier interval overrides
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntervalOverrides {
    pub fast_ms: Option<u64>,
    pub normal_ms: Option<u64>,
    pub slow_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Unique device ID
    pub id: String,
    /// Human-readable name
    #[serde(default)]
    pub name: String,
    /// Connection settings
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub intervals: IntervalOverrides,
    /// Registers to read or derive
    pub registers: Vec<RegisterConfig>,
}

impl DeviceConfig {
    /// Scheduler settings for this device, applying its interval overrides.
    pub fn scheduler_settings(&self, polling: &PollingConfig) -> Result<SchedulerSettings, ConfigError> {
        let ms = Duration::from_millis;
        let settings = SchedulerSettings {
            fast: ms(self.intervals.fast_ms.unwrap_or(polling.fast_ms)),
            normal: ms(self.intervals.normal_ms.unwrap_or(polling.normal_ms)),
            slow: ms(self.intervals.slow_ms.unwrap_or(polling.slow_ms)),
            timeout: ms(polling.timeout_ms),
            failure_threshold: polling.failure_threshold,
            max_backoff: ms(polling.max_backoff_ms),
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Convert every register entry, rejecting duplicate names.
    pub fn descriptors(&self) -> Result<Vec<RegisterDescriptor>, ConfigError> {
        let mut seen = HashSet::new();
        let mut descriptors = Vec::with_capacity(self.registers.len());
        for register in &self.registers {
            if !seen.insert(register.name.as_str()) {
                return Err(ConfigError::DuplicateName(register.name.clone()));
            }
            descriptors.push(register.to_descriptor()?);
        }
        Ok(descriptors)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConnectionConfig {
    Tcp(TcpConnection),
    Rtu(RtuConnection),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpConnection {
    /// Host address
    pub host: String,
    /// Port (default: 502)
    #[serde(default = "default_tcp_port")]
    pub port: u16,
    /// Modbus unit ID
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RtuConnection {
    /// Serial port path (e.g., /dev/ttyUSB0)
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Data bits
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    /// Stop bits
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    /// Parity: "none", "even", "odd"
    #[serde(default = "default_parity")]
    pub parity: String,
    /// Modbus unit ID
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,
}

fn default_tcp_port() -> u16 {
    502
}

fn default_unit_id() -> u8 {
    1
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

fn default_parity() -> String {
    "none".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegisterConfig {
    /// Register name, unique per device
    pub name: String,
    /// Start address for registers read from the device
    pub address: Option<u16>,
    /// Bank: "read_only"/"input" or "read_write"/"holding"
    pub bank: Option<Bank>,
    /// Derivation for computed registers
    #[serde(default, with = "serde_yaml::with::singleton_map_recursive")]
    pub derive: Option<Derivation>,
    /// Data type for interpretation
    #[serde(default)]
    pub data_type: DataType,
    /// Register count of string registers
    pub words: Option<u16>,
    #[serde(default)]
    pub word_order: WordOrder,
    /// Scaling factor (optional)
    pub scale: Option<f64>,
    /// Decimal places after scaling (optional)
    pub precision: Option<u32>,
    /// Bit extraction applied before scaling (optional)
    #[serde(default, with = "serde_yaml::with::singleton_map_recursive")]
    pub bits: Option<BitExtraction>,
    #[serde(default)]
    pub tier: PollTier,
    /// Unit of measurement (optional)
    pub unit: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    #[default]
    U16,
    I16,
    U32,
    I32,
    U64,
    I64,
    F32,
    F64,
    Bool,
    String,
}

impl RegisterConfig {
    fn format(&self) -> Result<Format, ConfigError> {
        let format = match self.data_type {
            DataType::U16 => Format::new(Encoding::UInt, 16),
            DataType::I16 => Format::new(Encoding::Int, 16),
            DataType::U32 => Format::new(Encoding::UInt, 32),
            DataType::I32 => Format::new(Encoding::Int, 32),
            DataType::U64 => Format::new(Encoding::UInt, 64),
            DataType::I64 => Format::new(Encoding::Int, 64),
            DataType::F32 => Format::new(Encoding::Float, 32),
            DataType::F64 => Format::new(Encoding::Float, 64),
            DataType::Bool => Format::new(Encoding::Boolean, 16),
            DataType::String => {
                let words = self.words.ok_or_else(|| ConfigError::InvalidFormat {
                    name: self.name.clone(),
                    reason: "string registers need `words`".to_string(),
                })?;
                Format::string(words)
            }
        };
        let mut format = format
            .with_word_order(self.word_order)
            .with_scale(self.scale.unwrap_or(1.0));
        format.precision = self.precision;
        format.bit_extraction = self.bits;
        Ok(format)
    }

    /// Build and validate the descriptor for this entry.
    pub fn to_descriptor(&self) -> Result<RegisterDescriptor, ConfigError> {
        let mut descriptor = match (&self.address, &self.derive) {
            (Some(_), Some(_)) => return Err(ConfigError::AddressAndDerivation(self.name.clone())),
            (None, None) => return Err(ConfigError::NoSource(self.name.clone())),
            (Some(address), None) => {
                let bank = self
                    .bank
                    .ok_or_else(|| ConfigError::MissingBank(self.name.clone()))?;
                RegisterDescriptor::direct(&self.name, *address, bank, self.format()?)
            }
            (None, Some(derivation)) => {
                let mut descriptor = RegisterDescriptor::derived(&self.name, derivation.clone());
                descriptor.format.precision = self.precision;
                descriptor
            }
        };
        descriptor.tier = self.tier;
        descriptor.unit = self.unit.clone();
        descriptor.validate()?;
        Ok(descriptor)
    }
}

/// Load configuration from file or use defaults
pub fn load_config() -> Result<Config> {
    let config_path =
        std::env::var("MODPOLLER_CONFIG").unwrap_or_else(|_| "config.yaml".to_string());
    load_from(Path::new(&config_path))
}

pub fn load_from(path: &Path) -> Result<Config> {
    if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config =
            serde_yaml::from_str(&content).with_context(|| "Failed to parse config file")?;

        Ok(config)
    } else {
        tracing::warn!("Config file {} not found, using defaults", path.display());
        Ok(Config::default())
    }
}
