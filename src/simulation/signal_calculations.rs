//! Radio signal calculations.
//!
//! Contains:
//! - The `PropagationModel` contract the coordinator is written against
//! - Path loss models selectable from configuration (free space, log-distance, fixed)
//! - Logarithmic/linear power conversions used to sum interference
//!
//! Units:
//! - Power: dB (relative to an arbitrary reference), linear power for summation
//! - Distance: the caller's world units; the models treat them as meters

use serde::Deserialize;

use super::error::PropagationError;

/// Injected physics used by the coordinator.
///
/// Contract:
/// - `path_loss_db` is non-decreasing in distance and rejects negative distances.
/// - `snr_db` is pure, strictly increasing in `tx_power_db` and strictly decreasing
///   in `path_loss_db` and `noise_db`.
///
/// The coordinator never looks at the formulas, only at the numbers they produce.
pub trait PropagationModel {
    fn path_loss_db(&self, distance: f32) -> Result<f32, PropagationError>;

    fn snr_db(&self, tx_power_db: f32, path_loss_db: f32, noise_db: f32) -> f32 {
        tx_power_db - path_loss_db - noise_db
    }
}

fn check_distance(distance: f32) -> Result<f32, PropagationError> {
    // Written so NaN is rejected as well.
    if !(distance >= 0.0) {
        return Err(PropagationError::InvalidDistance(distance));
    }
    Ok(distance)
}

/// Free-space path loss.
///
/// # Formula
///
/// ```text
/// FSPL(d) = 20 × log₁₀(d) + 20 × log₁₀(f) − 27.55
/// ```
///
/// with `d` in meters and `f` in MHz. Distances below one meter are treated as one
/// meter, which keeps the function finite and non-decreasing near the antenna.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FreeSpace {
    #[serde(default = "FreeSpace::default_frequency_mhz")]
    pub frequency_mhz: f32,
}

impl FreeSpace {
    fn default_frequency_mhz() -> f32 {
        2437.0
    }
}

impl Default for FreeSpace {
    fn default() -> Self {
        Self {
            frequency_mhz: Self::default_frequency_mhz(),
        }
    }
}

impl PropagationModel for FreeSpace {
    fn path_loss_db(&self, distance: f32) -> Result<f32, PropagationError> {
        let distance = check_distance(distance)?.max(1.0);
        Ok(20.0 * distance.log10() + 20.0 * self.frequency_mhz.log10() - 27.55)
    }
}

/// Log-distance path loss without shadowing.
///
/// ```text
/// PL(d) = PL(d₀) + 10 × n × log₁₀(d / d₀),  d₀ = 1
/// ```
///
/// - n = 2.0: free space
/// - n = 2.7 to 3.5: urban
/// - n = 3.0 to 5.0: indoor, obstructed
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LogDistance {
    pub path_loss_exponent: f32,
    pub path_loss_at_reference_distance: f32,
}

impl PropagationModel for LogDistance {
    fn path_loss_db(&self, distance: f32) -> Result<f32, PropagationError> {
        let distance = check_distance(distance)?;
        if distance < 1.0 {
            return Ok(self.path_loss_at_reference_distance);
        }
        Ok(self.path_loss_at_reference_distance + 10.0 * self.path_loss_exponent * distance.log10())
    }
}

/// Same loss at every distance.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Fixed {
    pub loss_db: f32,
}

impl PropagationModel for Fixed {
    fn path_loss_db(&self, distance: f32) -> Result<f32, PropagationError> {
        check_distance(distance)?;
        Ok(self.loss_db)
    }
}

/// Model selected in the `[propagation]` section of the configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "model", rename_all = "kebab-case")]
pub enum Propagation {
    FreeSpace(FreeSpace),
    LogDistance(LogDistance),
    Fixed(Fixed),
}

impl Default for Propagation {
    fn default() -> Self {
        Propagation::FreeSpace(FreeSpace::default())
    }
}

impl PropagationModel for Propagation {
    fn path_loss_db(&self, distance: f32) -> Result<f32, PropagationError> {
        match self {
            Propagation::FreeSpace(model) => model.path_loss_db(distance),
            Propagation::LogDistance(model) => model.path_loss_db(distance),
            Propagation::Fixed(model) => model.path_loss_db(distance),
        }
    }

    fn snr_db(&self, tx_power_db: f32, path_loss_db: f32, noise_db: f32) -> f32 {
        match self {
            Propagation::FreeSpace(model) => model.snr_db(tx_power_db, path_loss_db, noise_db),
            Propagation::LogDistance(model) => model.snr_db(tx_power_db, path_loss_db, noise_db),
            Propagation::Fixed(model) => model.snr_db(tx_power_db, path_loss_db, noise_db),
        }
    }
}

/// Convert a logarithmic power level to linear power.
///
/// ```text
/// P(lin) = 10^(P(dB) / 10)
/// ```
pub fn db_to_linear(db: f32) -> f32 {
    10f32.powf(db / 10.0)
}

/// Inverse of `db_to_linear`. `linear` must be positive.
pub fn linear_to_db(linear: f32) -> f32 {
    10.0 * linear.log10()
}
