// src/config.rs

//! Manages node configuration: loading, per-section defaults, and validation.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const MIB: u64 = 1024 * 1024;

/// The salt mode of the capability cipher.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CipherSaltMode {
    /// Derive a fresh key from a random 16-byte salt for every envelope.
    #[default]
    PerMessageSalt,
    /// Derive the salt deterministically from the password and cache the key.
    FixedSalt,
}

/// Where the cipher password comes from.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum CipherSecretSource {
    /// Password is the SHA-256 digest of the file contents.
    FilePath(String),
    /// Password is used verbatim.
    RawPassword(String),
}

/// Configuration for the URI capability cipher.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CipherConfig {
    #[serde(default)]
    pub mode: CipherSaltMode,
    pub secret_source: CipherSecretSource,
}

/// Configuration for the shared-object bus.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BusConfig {
    /// Message-bus destination used when a subject carries no broadcast queue.
    #[serde(default = "default_bus_queue")]
    pub default_queue: String,
    /// The reply address this node advertises in broadcast requests.
    #[serde(default = "default_bus_client_id")]
    pub client_id: String,
    /// Capacity of the bounded queue between the broker reader and the apply loop.
    #[serde(default = "default_bus_inflight")]
    pub inflight_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            default_queue: default_bus_queue(),
            client_id: default_bus_client_id(),
            inflight_capacity: default_bus_inflight(),
        }
    }
}

fn default_bus_queue() -> String {
    "/garnet/*".to_string()
}
fn default_bus_client_id() -> String {
    format!("/garnet/node/{}", std::process::id())
}
fn default_bus_inflight() -> usize {
    1024
}

/// Configuration for the page-aligned buffer pool.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BufferPoolConfig {
    /// Ceiling on the total bytes retained by the pool.
    #[serde(default = "default_pool_max_size")]
    pub max_size: u64,
    /// Number of power-of-two slots above the base slot.
    #[serde(default = "default_pool_slots")]
    pub slots: u32,
    /// Capacity of the buffers in slot 0.
    #[serde(default = "default_pool_base_size")]
    pub base_size: u64,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            max_size: default_pool_max_size(),
            slots: default_pool_slots(),
            base_size: default_pool_base_size(),
        }
    }
}

fn default_pool_max_size() -> u64 {
    256 * MIB
}
fn default_pool_slots() -> u32 {
    6
}
fn default_pool_base_size() -> u64 {
    MIB
}

/// Configuration for the audit sink.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct AuditConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Directory receiving the compressed audit segments.
    #[serde(default)]
    pub base_dir: String,
    /// Segment rotation interval in seconds, >= 1.
    #[serde(default = "default_audit_rotation")]
    pub rotation_seconds: u64,
    /// zstd compression level for the segments.
    #[serde(default = "default_audit_level")]
    pub compression_level: i32,
}

fn default_audit_rotation() -> u64 {
    300
}
fn default_audit_level() -> i32 {
    3
}

/// Configuration for the erasure-coded layout geometry.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RainConfig {
    /// Width of one stripe unit in bytes.
    #[serde(default = "default_stripe_width")]
    pub stripe_width: u64,
    /// Number of parity stripes.
    #[serde(default = "default_nb_parity")]
    pub nb_parity: u32,
    /// Total number of stripes, data + parity.
    #[serde(default = "default_nb_total")]
    pub nb_total: u32,
}

impl Default for RainConfig {
    fn default() -> Self {
        Self {
            stripe_width: default_stripe_width(),
            nb_parity: default_nb_parity(),
            nb_total: default_nb_total(),
        }
    }
}

fn default_stripe_width() -> u64 {
    MIB
}
fn default_nb_parity() -> u32 {
    2
}
fn default_nb_total() -> u32 {
    6
}

/// The root configuration of a node.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    /// Instance name used in logs and in manager identifiers on the wire.
    #[serde(default = "default_instance")]
    pub instance: String,
    /// Space name used when scheduling layout conversions.
    #[serde(default = "default_space")]
    pub space: String,
    #[serde(default)]
    pub bus: BusConfig,
    pub cipher: Option<CipherConfig>,
    #[serde(default)]
    pub buffers: BufferPoolConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub rain: RainConfig,
}

fn default_instance() -> String {
    "garnet".to_string()
}
fn default_space() -> String {
    "default".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            instance: default_instance(),
            space: default_space(),
            bus: BusConfig::default(),
            cipher: None,
            buffers: BufferPoolConfig::default(),
            audit: AuditConfig::default(),
            rain: RainConfig::default(),
        }
    }
}

impl Config {
    /// Loads the configuration from a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(Path::new(path)))
            .build()
            .with_context(|| format!("failed to read config file '{path}'"))?;

        let cfg: Config = settings
            .try_deserialize()
            .with_context(|| format!("failed to parse config file '{path}'"))?;

        cfg.validate()?;
        Ok(cfg)
    }

    /// Validates the configuration. Violations here are fatal at startup.
    pub fn validate(&self) -> Result<()> {
        if self.buffers.base_size == 0 {
            return Err(anyhow!("buffers.base_size must be non-zero"));
        }

        if self.buffers.max_size < self.buffers.base_size {
            return Err(anyhow!(
                "buffers.max_size ({}) is smaller than buffers.base_size ({})",
                self.buffers.max_size,
                self.buffers.base_size
            ));
        }

        if self.audit.enabled {
            if self.audit.base_dir.is_empty() {
                return Err(anyhow!("audit.base_dir must be set when audit is enabled"));
            }
            if self.audit.rotation_seconds == 0 {
                return Err(anyhow!("audit.rotation_seconds must be >= 1"));
            }
        }

        if self.rain.stripe_width < 64 {
            return Err(anyhow!(
                "rain.stripe_width ({}) must be >= 64",
                self.rain.stripe_width
            ));
        }

        if self.rain.nb_parity < 1 {
            return Err(anyhow!("rain.nb_parity must be >= 1"));
        }

        if self.rain.nb_total < self.rain.nb_parity + 1 {
            return Err(anyhow!(
                "rain.nb_total ({}) must be >= nb_parity + 1 ({})",
                self.rain.nb_total,
                self.rain.nb_parity + 1
            ));
        }

        if self.bus.inflight_capacity == 0 {
            return Err(anyhow!("bus.inflight_capacity must be non-zero"));
        }

        Ok(())
    }
}
