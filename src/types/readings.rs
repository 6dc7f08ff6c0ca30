//! Sensor readings carried in `key=value` payloads.
//!
//! The sensor firmware sends orientation frames (`w`, `i`, `j`, `k`
//! quaternion components) and environment frames (`temp`, `baro`). One
//! payload may carry both.

use crate::error::{Error, Result};
use crate::kv::extract;

/// Marker whose presence identifies an orientation payload.
pub const ORIENTATION_MARKER: &str = ",k=";

/// Marker whose presence identifies an environment payload.
pub const ENVIRONMENT_MARKER: &str = ",baro=";

/// Unit quaternion describing the sensor's orientation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Orientation {
    /// Scalar part.
    pub w: f64,
    /// `i` component.
    pub x: f64,
    /// `j` component.
    pub y: f64,
    /// `k` component.
    pub z: f64,
}

/// Temperature and barometric pressure.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Environment {
    /// Temperature as reported by the sensor.
    pub temperature: f64,
    /// Barometric pressure as reported by the sensor.
    pub pressure: f64,
}

/// Everything decoded from one payload.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Readings {
    /// Present for orientation payloads.
    pub orientation: Option<Orientation>,
    /// Present for environment payloads.
    pub environment: Option<Environment>,
}

impl Readings {
    /// Decodes a payload.
    ///
    /// Payloads without either marker decode to empty readings.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedPayload`] if a marked payload lacks one of
    /// its keys or a value is not a finite decimal number.
    pub fn parse(payload: &str) -> Result<Self> {
        let mut readings = Self::default();

        if payload.contains(ORIENTATION_MARKER) {
            readings.orientation = Some(Orientation {
                w: number(payload, "w")?,
                x: number(payload, "i")?,
                y: number(payload, "j")?,
                z: number(payload, "k")?,
            });
        }

        if payload.contains(ENVIRONMENT_MARKER) {
            readings.environment = Some(Environment {
                temperature: number(payload, "temp")?,
                pressure: number(payload, "baro")?,
            });
        }

        Ok(readings)
    }

    /// Returns true if nothing was decoded.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.orientation.is_none() && self.environment.is_none()
    }
}

fn number(payload: &str, key: &str) -> Result<f64> {
    let raw = extract(payload, key);
    raw.map(str::trim)
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .ok_or_else(|| Error::MalformedPayload {
            key: key.to_owned(),
            value: raw.map(str::to_owned),
        })
}
