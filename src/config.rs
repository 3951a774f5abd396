//! Run configuration.
//!
//! A run is described either by a TOML file or by the four positional
//! arguments `<stations> <packets/s> <packets> <mac>`. Every table besides the
//! top-level counts is optional and falls back to the defaults below.

use anyhow::{Context, anyhow};
use embassy_time::Duration;
use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::simulation::arbiter::RadioThresholds;
use crate::simulation::mac::{CsmaParameters, MacProtocol};
use crate::simulation::signal_calculations::Propagation;
use crate::simulation::station::{DEFAULT_JITTER_FRACTION, StationTiming};
use crate::simulation::types::MAX_STATION_COUNT;

const MIN_TIME_SCALE_PERCENT: u32 = 1;
const MAX_TIME_SCALE_PERCENT: u32 = 1000;

/// Per-station timing shared by every station (`[station]`).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct StationConfig {
    pub airtime_ms: u64,
    pub jitter_fraction: f32,
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            airtime_ms: 10,
            jitter_fraction: DEFAULT_JITTER_FRACTION,
        }
    }
}

/// Square area the stations are dropped into, in meters (`[placement]`).
///
/// Both coordinates are drawn independently from `[min, max]` and rounded to
/// 0.1 m. The access point sits at the origin.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Placement {
    pub min: f32,
    pub max: f32,
}

impl Default for Placement {
    fn default() -> Self {
        Self { min: -9.9, max: 40.0 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SimulationConfig {
    pub station_count: usize,
    pub packets_per_second: f64,
    pub packets_to_receive: usize,
    #[serde(default)]
    pub mac: MacProtocol,
    #[serde(default = "default_time_scale_percent")]
    pub time_scale_percent: u32,
    /// Base seed; station `i` uses `seed + i`. Drawn from entropy when absent.
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub radio: RadioThresholds,
    #[serde(default)]
    pub propagation: Propagation,
    #[serde(default)]
    pub station: StationConfig,
    #[serde(default)]
    pub placement: Placement,
    #[serde(default)]
    pub csma: CsmaParameters,
}

fn default_time_scale_percent() -> u32 {
    100
}

impl SimulationConfig {
    /// Reads, parses and validates a TOML configuration file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let data = fs::read_to_string(path).with_context(|| format!("Failed to read file: {}", path.display()))?;
        let config = toml::from_str::<SimulationConfig>(&data).context("Invalid TOML format")?;
        config.validate().map_err(|e| anyhow!("Invalid simulation configuration: {e}"))?;
        Ok(config)
    }

    /// Builds a configuration from `<stations> <packets/s> <packets> <mac>`.
    pub fn from_positional(args: &[String]) -> anyhow::Result<Self> {
        let [stations, rate, packets, mac] = args else {
            return Err(anyhow!("expected 4 positional arguments, got {}", args.len()));
        };
        let config = Self {
            station_count: stations.parse().with_context(|| format!("Invalid station count: {stations}"))?,
            packets_per_second: rate.parse().with_context(|| format!("Invalid packet rate: {rate}"))?,
            packets_to_receive: packets.parse().with_context(|| format!("Invalid packet target: {packets}"))?,
            mac: mac.parse().map_err(|e: String| anyhow!(e))?,
            ..Self::default()
        };
        config.validate().map_err(|e| anyhow!("Invalid simulation configuration: {e}"))?;
        Ok(config)
    }

    /// Rejects configurations the simulation cannot run.
    pub fn validate(&self) -> Result<(), String> {
        if self.station_count == 0 {
            return Err("At least one station is required".to_string());
        }
        if self.station_count > MAX_STATION_COUNT {
            return Err(format!("Station count {} exceeds maximum of {}", self.station_count, MAX_STATION_COUNT));
        }
        if !(self.packets_per_second > 0.0) || !self.packets_per_second.is_finite() {
            return Err(format!("Invalid packets-per-second {}, must be positive", self.packets_per_second));
        }
        if self.packets_to_receive == 0 {
            return Err("packets-to-receive must be at least 1".to_string());
        }
        if !(MIN_TIME_SCALE_PERCENT..=MAX_TIME_SCALE_PERCENT).contains(&self.time_scale_percent) {
            return Err(format!(
                "time-scale-percent {} outside {}..={}",
                self.time_scale_percent, MIN_TIME_SCALE_PERCENT, MAX_TIME_SCALE_PERCENT
            ));
        }
        if !(0.0..=1.0).contains(&self.station.jitter_fraction) {
            return Err(format!("jitter-fraction {} outside 0..=1", self.station.jitter_fraction));
        }
        if self.station.airtime_ms == 0 {
            return Err("airtime-ms must be positive".to_string());
        }
        if !(self.placement.min < self.placement.max) {
            return Err(format!("Empty placement range {}..{}", self.placement.min, self.placement.max));
        }
        if self.mac == MacProtocol::Csma {
            self.csma.validate()?;
        }
        Ok(())
    }

    /// Time between two packets of one station.
    pub fn cadence(&self) -> Duration {
        Duration::from_micros((1_000_000.0 / self.packets_per_second).round() as u64)
    }

    pub fn station_timing(&self) -> StationTiming {
        StationTiming {
            cadence: self.cadence(),
            airtime: Duration::from_millis(self.station.airtime_ms),
            jitter_fraction: self.station.jitter_fraction,
        }
    }

    /// Offset between consecutive station start times, spreading the first
    /// packets evenly over one cadence.
    pub fn start_stagger(&self) -> Duration {
        Duration::from_micros(self.cadence().as_micros() / self.station_count as u64)
    }

    /// Rough lower bound of the simulated run time, used for reporting only.
    pub fn goal_time(&self) -> Duration {
        let secs = self.packets_to_receive as f64 / self.packets_per_second * self.station_count as f64 / 10.0;
        Duration::from_micros((secs * 1_000_000.0) as u64)
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            station_count: 1,
            packets_per_second: 10.0,
            packets_to_receive: 10,
            mac: MacProtocol::default(),
            time_scale_percent: default_time_scale_percent(),
            seed: None,
            radio: RadioThresholds::default(),
            propagation: Propagation::default(),
            station: StationConfig::default(),
            placement: Placement::default(),
            csma: CsmaParameters::default(),
        }
    }
}
