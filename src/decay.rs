use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

use crate::{ReachError, Result};

/// Maps a path distance in meters to the share of a node's weight that still counts.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DecayKernel {
    /// 2D Gaussian density with standard deviation `sigma` meters.
    Gaussian { sigma: f64 },
    /// `1 / (d / scale + 1)^exponent`. Always 1 at zero distance.
    ///
    /// Older runs squared the denominator, later ones cubed it; neither is the agreed
    /// form, so the exponent stays explicit.
    PowerLaw {
        scale: f64,
        #[serde(default = "default_exponent")]
        exponent: f64,
    },
}

fn default_exponent() -> f64 {
    2.0
}

impl DecayKernel {
    pub fn power_law(scale: f64) -> Self {
        DecayKernel::PowerLaw { scale, exponent: default_exponent() }
    }

    pub fn decay(&self, distance: f64) -> f64 {
        match *self {
            DecayKernel::Gaussian { sigma } => {
                let variance = sigma * sigma;
                (-(distance * distance) / (2.0 * variance)).exp() / (2.0 * PI * variance)
            }
            DecayKernel::PowerLaw { scale, exponent } => 1.0 / (distance / scale + 1.0).powf(exponent),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let (name, value) = match *self {
            DecayKernel::Gaussian { sigma } => ("sigma", sigma),
            DecayKernel::PowerLaw { scale, exponent } => {
                if !exponent.is_finite() || exponent <= 0.0 {
                    return Err(ReachError::InvalidKernel(format!("exponent must be positive, got {exponent}")));
                }
                ("scale", scale)
            }
        };
        if !value.is_finite() || value <= 0.0 {
            return Err(ReachError::InvalidKernel(format!("{name} must be positive, got {value}")));
        }
        Ok(())
    }
}
