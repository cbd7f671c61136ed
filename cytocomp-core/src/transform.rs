//! Axis value transforms.
//!
//! Pure, stateless mappings used to stretch or compress an axis before
//! binning. Every transform is monotone and defined for negative values.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Default arcsinh cofactor.
pub const DEFAULT_ARCSINH_COFACTOR: f64 = 150.0;

/// Default symlog linear threshold.
pub const DEFAULT_SYMLOG_LINTHRESH: f64 = 100.0;

/// An axis transform together with its parameter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Transform {
    /// Identity.
    #[default]
    Linear,
    /// `asinh(x / cofactor)`.
    Arcsinh { cofactor: f64 },
    /// Symmetric log10: `sign(x) * log10(1 + |x| / linthresh)`.
    Symlog { linthresh: f64 },
}

/// Returns `value` when it is finite and strictly positive, else `fallback`.
fn positive_or(value: f64, fallback: f64) -> f64 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        fallback
    }
}

impl Transform {
    /// Arcsinh with a sanitized cofactor.
    #[must_use]
    pub fn arcsinh(cofactor: f64) -> Self {
        Self::Arcsinh {
            cofactor: positive_or(cofactor, DEFAULT_ARCSINH_COFACTOR),
        }
    }

    /// Symlog with a sanitized linear threshold.
    #[must_use]
    pub fn symlog(linthresh: f64) -> Self {
        Self::Symlog {
            linthresh: positive_or(linthresh, DEFAULT_SYMLOG_LINTHRESH),
        }
    }

    /// Short name used on the command line and in cache keys.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Linear => "linear",
            Self::Arcsinh { .. } => "arcsinh",
            Self::Symlog { .. } => "symlog",
        }
    }

    /// Maps a raw value into display space.
    #[must_use]
    #[inline]
    pub fn apply(&self, x: f64) -> f64 {
        match *self {
            Self::Linear => x,
            Self::Arcsinh { cofactor } => {
                let c = positive_or(cofactor, DEFAULT_ARCSINH_COFACTOR);
                (x / c).asinh()
            }
            Self::Symlog { linthresh } => {
                let t = positive_or(linthresh, DEFAULT_SYMLOG_LINTHRESH);
                let y = (1.0 + x.abs() / t).log10();
                if x < 0.0 {
                    -y
                } else {
                    y
                }
            }
        }
    }

    /// Maps a display-space value back to raw space.
    #[must_use]
    #[inline]
    pub fn inverse(&self, y: f64) -> f64 {
        match *self {
            Self::Linear => y,
            Self::Arcsinh { cofactor } => {
                y.sinh() * positive_or(cofactor, DEFAULT_ARCSINH_COFACTOR)
            }
            Self::Symlog { linthresh } => {
                let t = positive_or(linthresh, DEFAULT_SYMLOG_LINTHRESH);
                let x = (10f64.powf(y.abs()) - 1.0) * t;
                if y < 0.0 {
                    -x
                } else {
                    x
                }
            }
        }
    }
}

impl FromStr for Transform {
    type Err = std::convert::Infallible;

    /// Parses a transform name with default parameters.
    ///
    /// `logicle` is accepted as an alias of `symlog`; unknown names map to linear.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "arcsinh" => Self::arcsinh(DEFAULT_ARCSINH_COFACTOR),
            "symlog" | "logicle" => Self::symlog(DEFAULT_SYMLOG_LINTHRESH),
            _ => Self::Linear,
        })
    }
}
