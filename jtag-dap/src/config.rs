//! Configuration of the backend, the scan chain, its DAPs and their targets.
//!
//! A configuration is usually loaded from YAML:
//!
//! ```yaml
//! backend:
//!   kind: jtag_driver
//!   instance: 0
//! speed_hz: 1000000
//! taps:
//!   - name: cpu.tap
//!     ir_len: 4
//! daps:
//!   - name: cpu.dap
//!     chain_position: cpu.tap
//!     adi_version: 6
//! targets:
//!   - name: cpu.core0
//!     dap: cpu.dap
//!     ap_num: 0
//!     ap_base: 0x80000000
//! ```

use std::{collections::HashSet, fs, path::Path};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::architecture::arm::ap::{AP_BASE_ALIGNMENT, AP_COUNT};
use crate::architecture::arm::dap::{AdiTarget, DapRegistry};
use crate::architecture::arm::dp::AdiVersion;
use crate::probe::dpi::{DpiBackend, DpiConfig};
use crate::probe::jtag_driver::JtagDriverConfig;
use crate::probe::{DebugProbeError, JtagBackend, JtagEngine, ScanChain, TapConfig};

/// Rejected configuration values.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("AP number {0} is out of range, valid numbers are 0 to 255")]
    ApNumberOutOfRange(u32),
    #[error("AP base address {0:#x} is not aligned to 4 KiB")]
    ApBaseUnaligned(u64),
    #[error("Memory access wait of {0} TCK cycles exceeds the maximum of 255")]
    MemaccessTckOutOfRange(u32),
    #[error("Target {0} sets an AP base address without an AP number")]
    ApNumberNotConfigured(String),
    #[error("Target {0} has neither a DAP nor a chain position")]
    DapNotConfigured(String),
    #[error("There is no DAP named {0}")]
    UnknownDap(String),
    #[error("There is no TAP named {0} on the scan chain")]
    UnknownTap(String),
    #[error("DAP {0} has no chain position")]
    MissingChainPosition(String),
    #[error("Target {0} sets both a DAP and a chain position")]
    ConflictingChainPosition(String),
    #[error("The DAP of target {target} is {current} and cannot change to {requested}")]
    DapReassigned {
        target: String,
        current: String,
        requested: String,
    },
    #[error("The name {0} is used more than once")]
    DuplicateName(String),
    #[error("ADI version {0} is not supported, use 5 or 6")]
    InvalidAdiVersion(u8),
    #[error("The configuration could not be parsed")]
    Parse(#[from] serde_yaml::Error),
    #[error("The configuration file could not be read")]
    Io(#[from] std::io::Error),
}

/// The backend the engine drives.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    /// A simulator reached over the DPI socket protocol.
    Dpi(DpiConfig),
    /// The Linux JTAG class driver.
    JtagDriver(JtagDriverConfig),
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Dpi(DpiConfig::default())
    }
}

/// A debug port on the scan chain.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct DapConfig {
    pub name: String,
    /// Name of the TAP the DAP sits behind.
    #[serde(default)]
    pub chain_position: Option<String>,
    /// 5 or 6. Negotiated from DPIDR when absent.
    #[serde(default)]
    pub adi_version: Option<u8>,
    /// Do not wait for CSYSPWRUPACK during power-up.
    #[serde(default)]
    pub ignore_syspwrupack: bool,
}

impl DapConfig {
    pub fn builder(name: impl Into<String>) -> DapConfigBuilder {
        DapConfigBuilder {
            config: DapConfig {
                name: name.into(),
                chain_position: None,
                adi_version: None,
                ignore_syspwrupack: false,
            },
        }
    }
}

#[derive(Clone, Debug)]
pub struct DapConfigBuilder {
    config: DapConfig,
}

impl DapConfigBuilder {
    pub fn chain_position(mut self, tap: impl Into<String>) -> Self {
        self.config.chain_position = Some(tap.into());
        self
    }

    pub fn adi_version(mut self, version: u8) -> Result<Self, ConfigError> {
        AdiVersion::try_from(version)?;
        self.config.adi_version = Some(version);
        Ok(self)
    }

    pub fn ignore_syspwrupack(mut self, ignore: bool) -> Self {
        self.config.ignore_syspwrupack = ignore;
        self
    }

    pub fn build(self) -> Result<DapConfig, ConfigError> {
        if self.config.chain_position.is_none() {
            return Err(ConfigError::MissingChainPosition(self.config.name));
        }
        Ok(self.config)
    }
}

/// A target using one AP of a DAP.
///
/// The DAP is either named directly or implied by a chain position.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct AdiTargetConfig {
    pub name: String,
    #[serde(default)]
    pub dap: Option<String>,
    #[serde(default)]
    pub chain_position: Option<String>,
    #[serde(default)]
    pub ap_num: Option<u32>,
    #[serde(default)]
    pub ap_base: Option<u64>,
}

impl AdiTargetConfig {
    pub fn builder(name: impl Into<String>) -> AdiTargetConfigBuilder {
        AdiTargetConfigBuilder {
            config: AdiTargetConfig {
                name: name.into(),
                dap: None,
                chain_position: None,
                ap_num: None,
                ap_base: None,
            },
        }
    }

    /// Checks the rules the builder enforces, for configurations that were
    /// deserialized instead of built.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dap.is_some() && self.chain_position.is_some() {
            return Err(ConfigError::ConflictingChainPosition(self.name.clone()));
        }
        if let Some(ap_num) = self.ap_num {
            check_ap_num(ap_num)?;
        }
        if let Some(base) = self.ap_base {
            if self.ap_num.is_none() {
                return Err(ConfigError::ApNumberNotConfigured(self.name.clone()));
            }
            check_ap_base(base)?;
        }
        Ok(())
    }
}

fn check_ap_num(ap_num: u32) -> Result<(), ConfigError> {
    if ap_num as usize >= AP_COUNT {
        return Err(ConfigError::ApNumberOutOfRange(ap_num));
    }
    Ok(())
}

fn check_ap_base(base: u64) -> Result<(), ConfigError> {
    if base % AP_BASE_ALIGNMENT != 0 {
        return Err(ConfigError::ApBaseUnaligned(base));
    }
    Ok(())
}

#[derive(Clone, Debug)]
pub struct AdiTargetConfigBuilder {
    config: AdiTargetConfig,
}

impl AdiTargetConfigBuilder {
    /// Assigns the DAP. Once set, the DAP can only be set again to the same name.
    pub fn dap(mut self, dap: impl Into<String>) -> Result<Self, ConfigError> {
        let dap = dap.into();
        match &self.config.dap {
            Some(current) if *current != dap => {
                return Err(ConfigError::DapReassigned {
                    target: self.config.name,
                    current: current.clone(),
                    requested: dap,
                })
            }
            _ => {}
        }
        if self.config.chain_position.is_some() {
            return Err(ConfigError::ConflictingChainPosition(self.config.name));
        }
        self.config.dap = Some(dap);
        Ok(self)
    }

    pub fn chain_position(mut self, tap: impl Into<String>) -> Result<Self, ConfigError> {
        if self.config.dap.is_some() {
            return Err(ConfigError::ConflictingChainPosition(self.config.name));
        }
        self.config.chain_position = Some(tap.into());
        Ok(self)
    }

    pub fn ap_num(mut self, ap_num: u32) -> Result<Self, ConfigError> {
        check_ap_num(ap_num)?;
        self.config.ap_num = Some(ap_num);
        Ok(self)
    }

    /// Sets the base of the AP's register window. Needs the AP number first.
    pub fn ap_base(mut self, base: u64) -> Result<Self, ConfigError> {
        if self.config.ap_num.is_none() {
            return Err(ConfigError::ApNumberNotConfigured(self.config.name));
        }
        check_ap_base(base)?;
        self.config.ap_base = Some(base);
        Ok(self)
    }

    pub fn build(self) -> AdiTargetConfig {
        self.config
    }
}

/// The complete configuration.
#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct Configuration {
    #[serde(default)]
    pub backend: BackendConfig,
    /// TCK frequency applied when the engine is opened.
    #[serde(default)]
    pub speed_hz: Option<u32>,
    #[serde(default)]
    pub taps: Vec<TapConfig>,
    #[serde(default)]
    pub daps: Vec<DapConfig>,
    #[serde(default)]
    pub targets: Vec<AdiTargetConfig>,
}

impl Configuration {
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        tracing::debug!("Loading configuration from {}", path.display());
        Self::from_yaml(&fs::read_to_string(path)?)
    }

    /// Opens the configured backend.
    pub fn open_backend(&self) -> Result<Box<dyn JtagBackend>, DebugProbeError> {
        match &self.backend {
            BackendConfig::Dpi(config) => Ok(Box::new(DpiBackend::connect(config)?)),
            BackendConfig::JtagDriver(config) => open_jtag_driver(config),
        }
    }

    /// Opens the backend and applies the configured speed.
    pub fn open_engine(&self) -> Result<JtagEngine, DebugProbeError> {
        let mut engine = JtagEngine::new(self.open_backend()?);
        if let Some(hz) = self.speed_hz {
            let actual = engine.set_speed(hz)?;
            tracing::info!("JTAG speed set to {} Hz (requested {} Hz)", actual, hz);
        }
        Ok(engine)
    }

    /// Creates the scan chain, every configured DAP and resolves the targets.
    pub fn build_registry(&self) -> Result<(DapRegistry, Vec<AdiTarget>), ConfigError> {
        let mut seen = HashSet::new();
        for tap in &self.taps {
            if !seen.insert(tap.name.as_str()) {
                return Err(ConfigError::DuplicateName(tap.name.clone()));
            }
        }

        let mut registry = DapRegistry::new(ScanChain::new(self.taps.clone()));
        for dap in &self.daps {
            registry.create(dap)?;
        }

        let targets = self
            .targets
            .iter()
            .map(|target| registry.configure_target(target))
            .collect::<Result<Vec<_>, _>>()?;

        Ok((registry, targets))
    }
}

#[cfg(target_os = "linux")]
fn open_jtag_driver(config: &JtagDriverConfig) -> Result<Box<dyn JtagBackend>, DebugProbeError> {
    use crate::probe::jtag_driver::JtagDriverBackend;

    Ok(Box::new(JtagDriverBackend::open(config)?))
}

#[cfg(not(target_os = "linux"))]
fn open_jtag_driver(_config: &JtagDriverConfig) -> Result<Box<dyn JtagBackend>, DebugProbeError> {
    Err(DebugProbeError::NotSupported(
        "the Linux JTAG driver on this platform",
    ))
}
