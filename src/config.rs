//! Configuration of the geometry pipeline and the model,
//! readable from TOML.
//!
//! Every field has a default, so a configuration file only needs
//! to list what differs from it:
//!
//! ```
//! # use dynacomp::config::Config;
//! let config = Config::from_toml_str(
//!     r#"
//!     [geometry.fiber_angles]
//!     alpha_endo_lv = 70.0
//!
//!     [model]
//!     refinement = 1
//!
//!     [model.bc]
//!     pericardium_spring = 0.5
//!     base_constraint = "fixed"
//!     "#,
//! )
//! .unwrap();
//! assert_eq!(config.geometry.fiber_angles.alpha_epi_lv, -60.0);
//! assert_eq!(config.model.refinement, Some(1));
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{
    microstructure::{FiberAngles, FiberSpace},
    problem::{BoundaryParams, SolverConfig},
    tagging::TaggingConfig,
    HolzapfelOgden,
};

/// Error in reading or validating a configuration.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// The configuration file couldn't be read.
    #[error("Failed to read configuration file")]
    Io(#[from] std::io::Error),
    /// The configuration file isn't valid TOML for [`Config`].
    #[error("Failed to parse configuration: {0}")]
    Toml(#[from] toml::de::Error),
    /// A value is outside its valid range.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Settings for turning a mesh into a geometry with microstructure.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeometryConfig {
    /// Face tagging.
    pub tagging: TaggingConfig,
    /// Fiber and sheet angles.
    pub fiber_angles: FiberAngles,
    /// Where fibers are evaluated.
    pub fiber_space: FiberSpace,
}

/// Largest load increments taken in one step of [`HeartModel::compute_volume`].
///
/// [`HeartModel::compute_volume`]: crate::HeartModel::compute_volume
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContinuationConfig {
    /// Largest activation change per step.
    pub max_activation_step: f64,
    /// Largest pressure change per step.
    pub max_pressure_step: f64,
}

impl Default for ContinuationConfig {
    fn default() -> Self {
        Self {
            max_activation_step: 10.,
            max_pressure_step: 0.5,
        }
    }
}

/// Settings of a [`HeartModel`][crate::HeartModel].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Number of uniform refinement levels applied to the geometry.
    pub refinement: Option<u32>,
    /// Boundary conditions.
    pub bc: BoundaryParams,
    /// Material parameters.
    pub material: HolzapfelOgden,
    /// Newton iteration.
    pub solver: SolverConfig,
    /// Load stepping.
    pub continuation: ContinuationConfig,
}

/// Complete configuration of the geometry pipeline and the model.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Geometry and microstructure.
    pub geometry: GeometryConfig,
    /// Mechanics model.
    pub model: ModelConfig,
}

impl Config {
    /// Parse and validate a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Check that all values are in their valid ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.geometry.tagging.tolerance > 0.) {
            return Err(invalid("geometry.tagging.tolerance must be positive"));
        }
        self.model.validate()
    }
}

impl ContinuationConfig {
    /// Check that both step sizes are positive and finite.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = |step: f64| step > 0. && step.is_finite();
        if !(positive(self.max_activation_step) && positive(self.max_pressure_step)) {
            return Err(invalid("continuation step sizes must be positive and finite"));
        }
        Ok(())
    }
}

impl ModelConfig {
    /// Check that all values are in their valid ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let bc = &self.bc;
        if !(bc.pericardium_spring >= 0. && bc.base_spring >= 0.) {
            return Err(invalid("spring stiffnesses must be non-negative"));
        }
        self.continuation.validate()?;
        let solver = &self.solver;
        if !(solver.abs_tol >= 0. && solver.rel_tol >= 0.) || solver.abs_tol + solver.rel_tol == 0. {
            return Err(invalid("solver tolerances must be non-negative and not both zero"));
        }
        if solver.max_iterations == 0 {
            return Err(invalid("solver.max_iterations must be at least 1"));
        }
        if !(self.material.kappa > 0.) {
            return Err(invalid("material.kappa must be positive"));
        }
        Ok(())
    }
}

fn invalid(msg: &str) -> ConfigError {
    ConfigError::Invalid(msg.to_string())
}
