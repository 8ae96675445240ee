//! Type-safe wrappers for the physical units the simulator juggles
//!
//! Profiles are authored in km/h, the integrator works in m/s and the
//! controller wants km/h again, so conversions live here instead of being
//! sprinkled as `* 3.6` across the codebase.
//!
//! The `round*` helpers are used by telemetry frames to keep JSON payloads small.

use serde::{Deserialize, Serialize};

/// km/h in one m/s
pub const KMH_PER_MPS: f64 = 3.6;

/// Round f64 to 3 decimal places for compact JSON serialization
pub fn round3<S: serde::Serializer>(val: &f64, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64((*val * 1_000.0).round() / 1_000.0)
}

/// Round f64 to 7 decimal places (~1 cm of latitude)
pub fn round7<S: serde::Serializer>(val: &f64, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64((*val * 10_000_000.0).round() / 10_000_000.0)
}

/// Meters per second
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct MetersPerSecond(pub f64);

impl MetersPerSecond {
    pub fn to_kmh(self) -> KilometersPerHour {
        KilometersPerHour(self.0 * KMH_PER_MPS)
    }
}

/// Kilometers per hour
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct KilometersPerHour(pub f64);

impl KilometersPerHour {
    pub fn to_mps(self) -> MetersPerSecond {
        MetersPerSecond(self.0 / KMH_PER_MPS)
    }
}

/// Compass heading in degrees, clockwise from true north
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Degrees(pub f64);

impl Degrees {
    /// Wrap into `[0, 360)`
    pub fn normalized(self) -> Self {
        let wrapped = self.0.rem_euclid(360.0);
        // rem_euclid can return 360.0 for tiny negative inputs
        Self(if wrapped >= 360.0 { 0.0 } else { wrapped })
    }

    /// Signed shortest rotation from `self` to `to`, in `[-180, 180)`
    pub fn delta_to(self, to: Degrees) -> f64 {
        (to.0 - self.0 + 180.0).rem_euclid(360.0) - 180.0
    }

    /// Rotate toward `target` by at most `max_step` degrees
    pub fn slew_toward(self, target: Degrees, max_step: f64) -> Self {
        let delta = self.delta_to(target);
        if delta.abs() <= max_step {
            target.normalized()
        } else {
            Self(self.0 + max_step.copysign(delta)).normalized()
        }
    }
}
