//! Scenario, route and trajectory data model
//!
//! The JSON shapes here double as the UI's save/load contract:
//!
//! ```json
//! { "schema_version": 1,
//!   "scenario": { "meta": {..}, "route": { "points": [..] },
//!                 "motion_profile": { "type": "simple", "params": {..} } } }
//! ```

use crate::error::SimError;
use crate::geo;
use crate::trajectory::MIN_SEGMENT_M;
use crate::units::{round3, round7, MetersPerSecond};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

pub const SCENARIO_SCHEMA_VERSION: u32 = 1;

/// A route vertex in WGS84 degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Waypoint {
    pub lat: f64,
    pub lon: f64,
    #[serde(default)]
    pub alt_m: f64,
}

impl Waypoint {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon, alt_m: 0.0 }
    }

    fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && self.alt_m.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
    }
}

/// Ordered polyline. Segment `i` joins point `i` and `i + 1`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub points: Vec<Waypoint>,
}

impl Route {
    pub fn new(points: Vec<Waypoint>) -> Self {
        Self { points }
    }

    pub fn segment_count(&self) -> usize {
        self.points.len().saturating_sub(1)
    }

    pub fn validate(&self) -> Result<(), SimError> {
        if self.points.len() < 2 {
            return Err(SimError::InvalidRoute(format!(
                "route must have at least 2 points, got {}",
                self.points.len()
            )));
        }
        if let Some(idx) = self.points.iter().position(|p| !p.is_valid()) {
            return Err(SimError::InvalidRoute(format!(
                "point {} has invalid coordinates",
                idx
            )));
        }
        Ok(())
    }

    /// [`Route::validate`], plus at least one segment the integrator can drive
    pub fn validate_drivable(&self) -> Result<(), SimError> {
        self.validate()?;
        let drivable = self
            .points
            .windows(2)
            .any(|pair| geo::distance_m(&pair[0], &pair[1]) >= MIN_SEGMENT_M);
        if !drivable {
            return Err(SimError::InvalidRoute("every segment has zero length".into()));
        }
        Ok(())
    }
}

/// Kinematic parameters of the simulated vehicle
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MotionProfile {
    pub cruise_speed_kmh: f64,
    pub accel_mps2: f64,
    pub decel_mps2: f64,
    /// km/h shaved off the cruise speed per degree of heading change
    #[serde(default)]
    pub turn_slowdown_factor_per_deg: f64,
    #[serde(default)]
    pub min_turn_speed_kmh: f64,
    #[serde(default)]
    pub turn_rate_deg_s: f64,
    #[serde(default)]
    pub start_hold_s: f64,
    #[serde(default)]
    pub start_speed_kmh: f64,
    #[serde(default)]
    pub start_speed_s: f64,
}

impl MotionProfile {
    /// Plain cruise profile: no turn slowdown, no hold, instant heading
    pub fn new(cruise_speed_kmh: f64, accel_mps2: f64, decel_mps2: f64) -> Self {
        Self {
            cruise_speed_kmh,
            accel_mps2,
            decel_mps2,
            turn_slowdown_factor_per_deg: 0.0,
            min_turn_speed_kmh: 0.0,
            turn_rate_deg_s: 0.0,
            start_hold_s: 0.0,
            start_speed_kmh: 0.0,
            start_speed_s: 0.0,
        }
    }

    pub fn validate(&self) -> Result<(), SimError> {
        let fields = [
            ("cruise_speed_kmh", self.cruise_speed_kmh),
            ("accel_mps2", self.accel_mps2),
            ("decel_mps2", self.decel_mps2),
            ("turn_slowdown_factor_per_deg", self.turn_slowdown_factor_per_deg),
            ("min_turn_speed_kmh", self.min_turn_speed_kmh),
            ("turn_rate_deg_s", self.turn_rate_deg_s),
            ("start_hold_s", self.start_hold_s),
            ("start_speed_kmh", self.start_speed_kmh),
            ("start_speed_s", self.start_speed_s),
        ];
        for (name, value) in fields {
            if !value.is_finite() || value < 0.0 {
                return Err(SimError::InvalidProfile(format!(
                    "{} must be a finite value >= 0, got {}",
                    name, value
                )));
            }
        }
        if self.accel_mps2 <= 0.0 {
            return Err(SimError::InvalidProfile("accel_mps2 must be > 0".into()));
        }
        if self.decel_mps2 <= 0.0 {
            return Err(SimError::InvalidProfile("decel_mps2 must be > 0".into()));
        }
        if self.cruise_speed_kmh <= 0.0 {
            return Err(SimError::InvalidProfile("cruise_speed_kmh must be > 0".into()));
        }
        Ok(())
    }
}

/// Named profile as stored in scenario files
///
/// Serializes as `{"type": "simple", "params": {..}}`. On input the flat form
/// (parameters at the top level, optional `type`/`kind`) is accepted too.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "MotionProfileDoc")]
pub struct MotionProfileSpec {
    #[serde(rename = "type")]
    pub kind: String,
    pub params: MotionProfile,
}

impl MotionProfileSpec {
    pub fn simple(params: MotionProfile) -> Self {
        Self {
            kind: "simple".to_string(),
            params,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum MotionProfileDoc {
    Nested {
        #[serde(rename = "type", alias = "kind", default)]
        kind: Option<String>,
        params: MotionProfile,
    },
    Flat {
        #[serde(rename = "type", alias = "kind", default)]
        kind: Option<String>,
        #[serde(flatten)]
        params: MotionProfile,
    },
}

impl TryFrom<MotionProfileDoc> for MotionProfileSpec {
    type Error = String;

    fn try_from(doc: MotionProfileDoc) -> Result<Self, Self::Error> {
        let (kind, params) = match doc {
            MotionProfileDoc::Nested { kind, params } | MotionProfileDoc::Flat { kind, params } => {
                (kind, params)
            }
        };
        let kind = kind.unwrap_or_else(|| "simple".to_string());
        if !kind.eq_ignore_ascii_case("simple") {
            return Err(format!(
                "unsupported motion profile type '{}', only 'simple' is supported",
                kind
            ));
        }
        Ok(Self { kind, params })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScenarioMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
}

/// Route plus motion profile: everything a build consumes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<ScenarioMeta>,
    pub route: Route,
    pub motion_profile: MotionProfileSpec,
}

impl Scenario {
    pub fn new(route: Route, profile: MotionProfile) -> Self {
        Self {
            meta: None,
            route,
            motion_profile: MotionProfileSpec::simple(profile),
        }
    }

    pub fn profile(&self) -> &MotionProfile {
        &self.motion_profile.params
    }

    pub fn validate(&self) -> Result<(), SimError> {
        self.route.validate()?;
        self.motion_profile.params.validate()
    }

    /// Stable hash of the parts that affect a build (meta is ignored)
    pub fn content_hash(&self) -> String {
        let mut hasher = DefaultHasher::new();
        // f64 is not Hash; the JSON encoding is canonical for these types
        serde_json::to_vec(&(&self.route, &self.motion_profile))
            .unwrap_or_default()
            .hash(&mut hasher);
        format!("{:016x}", hasher.finish())
    }
}

/// Versioned envelope used for scenario save/load
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioFile {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub scenario: Scenario,
}

fn default_schema_version() -> u32 {
    SCENARIO_SCHEMA_VERSION
}

impl ScenarioFile {
    pub fn new(scenario: Scenario) -> Self {
        Self {
            schema_version: SCENARIO_SCHEMA_VERSION,
            scenario,
        }
    }

    pub fn validate_version(&self) -> Result<(), SimError> {
        if self.schema_version == 0 || self.schema_version > SCENARIO_SCHEMA_VERSION {
            return Err(SimError::InvalidRequest(format!(
                "unsupported schema_version {}",
                self.schema_version
            )));
        }
        Ok(())
    }
}

/// One integrator tick. Also the row type of the motion table.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MotionSample {
    pub t_s: f64,
    pub lat: f64,
    pub lon: f64,
    #[serde(default)]
    pub alt_m: f64,
    pub speed_mps: f64,
    pub bearing_deg: f64,
    #[serde(default)]
    pub segment_index: usize,
}

impl MotionSample {
    pub fn speed(&self) -> MetersPerSecond {
        MetersPerSecond(self.speed_mps)
    }
}

/// Inclusive segment window of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentRange {
    pub start_segment: usize,
    pub end_segment: usize,
}

impl SegmentRange {
    pub fn new(start_segment: usize, end_segment: usize) -> Self {
        Self {
            start_segment,
            end_segment,
        }
    }

    pub fn contains(&self, segment: usize) -> bool {
        (self.start_segment..=self.end_segment).contains(&segment)
    }

    /// Waypoint `i` bounds segments `i - 1` and `i`
    pub fn locks_waypoint(&self, index: usize) -> bool {
        (self.start_segment..=self.end_segment + 1).contains(&index)
    }
}

/// Live position frame pushed to observers while a run is playing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryFrame {
    #[serde(serialize_with = "round3")]
    pub t: f64,
    #[serde(serialize_with = "round7")]
    pub lat: f64,
    #[serde(serialize_with = "round7")]
    pub lon: f64,
    /// m/s
    #[serde(serialize_with = "round3")]
    pub speed: f64,
    #[serde(serialize_with = "round3")]
    pub speed_kmh: f64,
    #[serde(serialize_with = "round3")]
    pub bearing: f64,
    pub segment_index: usize,
}

impl TelemetryFrame {
    pub fn from_sample(sample: &MotionSample, playback_t: f64) -> Self {
        Self {
            t: playback_t,
            lat: sample.lat,
            lon: sample.lon,
            speed: sample.speed_mps,
            speed_kmh: sample.speed().to_kmh().0,
            bearing: sample.bearing_deg,
            segment_index: sample.segment_index,
        }
    }
}
