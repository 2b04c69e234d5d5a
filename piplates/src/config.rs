//! Configuration management for piplates.
//!
//! Configuration comes from a TOML file and a handful of environment
//! variables. Every field has a default, so an empty or missing file
//! describes a stock Raspberry Pi with the plates' usual wiring.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::board::PlateModel;
use crate::error::{Error, Result};
use crate::protocol::Timing;
use crate::tracing::prelude::*;

/// Names a config file explicitly, bypassing the search path.
pub const CONFIG_ENV: &str = "PIPLATES_CONFIG";
pub const SPI_DEVICE_ENV: &str = "PIPLATES_SPI_DEVICE";
pub const SPI_CLOCK_ENV: &str = "PIPLATES_SPI_CLOCK_HZ";

const SYSTEM_CONFIG: &str = "/etc/piplates/piplates.toml";
const USER_CONFIG: &str = ".config/piplates/piplates.toml";

/// Main configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub bus: BusConfig,
    pub timing: Timing,
    pub scan: ScanConfig,
}

/// SPI device and control-line wiring. Pin numbers are BCM GPIO numbers.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct BusConfig {
    pub spi_device: PathBuf,
    pub clock_hz: u32,
    pub frame_pin: u32,
    pub ack_pin: u32,
    /// Omit to leave the interrupt line unused.
    pub interrupt_pin: Option<u32>,
    pub gpio_root: PathBuf,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            spi_device: PathBuf::from("/dev/spidev0.1"),
            clock_hz: 500_000,
            frame_pin: 25,
            ack_pin: 23,
            interrupt_pin: Some(22),
            gpio_root: PathBuf::from("/sys/class/gpio"),
        }
    }
}

/// Slot range probed by discovery.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ScanConfig {
    pub first_index: u8,
    pub last_index: u8,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            first_index: 0,
            last_index: PlateModel::MAX_PLATES - 1,
        }
    }
}

impl ScanConfig {
    pub fn indices(&self) -> std::ops::RangeInclusive<u8> {
        self.first_index..=self.last_index
    }
}

impl Config {
    /// Load configuration from the default locations.
    ///
    /// `$PIPLATES_CONFIG` wins if set and must exist. Otherwise the first of
    /// `/etc/piplates/piplates.toml` and `~/.config/piplates/piplates.toml`
    /// that exists is used, falling back to defaults.
    pub fn load() -> Result<Self> {
        let mut config = match Self::find() {
            Some(path) => Self::parse_file(&path)?,
            None => {
                debug!("No configuration file, using defaults");
                Self::default()
            }
        };
        config.apply_env(|key| env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = Self::parse_file(path)?;
        config.apply_env(|key| env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    fn find() -> Option<PathBuf> {
        if let Ok(path) = env::var(CONFIG_ENV) {
            return Some(PathBuf::from(path));
        }
        let user = env::var_os("HOME").map(|home| PathBuf::from(home).join(USER_CONFIG));
        std::iter::once(PathBuf::from(SYSTEM_CONFIG))
            .chain(user)
            .find(|path| path.exists())
    }

    fn parse_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        let config = Self::parse(&content)?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Parse TOML text. Missing sections and fields take their defaults.
    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Apply `PIPLATES_SPI_*` overrides. Unparseable values are ignored
    /// with a warning.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(device) = lookup(SPI_DEVICE_ENV) {
            self.bus.spi_device = PathBuf::from(device);
        }
        if let Some(value) = lookup(SPI_CLOCK_ENV) {
            match value.parse::<u32>() {
                Ok(hz) => self.bus.clock_hz = hz,
                Err(e) => warn!(%value, error = %e, "Ignoring {}", SPI_CLOCK_ENV),
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.bus.clock_hz == 0 {
            return Err(Error::Config("bus.clock_hz must be non-zero".into()));
        }

        let mut pins = vec![self.bus.frame_pin, self.bus.ack_pin];
        pins.extend(self.bus.interrupt_pin);
        pins.sort_unstable();
        if pins.windows(2).any(|pair| pair[0] == pair[1]) {
            return Err(Error::Config(format!(
                "control lines must use distinct pins: {:?}",
                pins
            )));
        }

        let scan = &self.scan;
        if scan.first_index > scan.last_index || scan.last_index >= PlateModel::MAX_PLATES {
            return Err(Error::Config(format!(
                "scan range {}..={} must lie within 0..={}",
                scan.first_index,
                scan.last_index,
                PlateModel::MAX_PLATES - 1
            )));
        }
        Ok(())
    }
}
