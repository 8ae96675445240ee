//! Flat-earth distance and bearing math
//!
//! Routes are short (a test track, a parking lot, a few city blocks), so an
//! equirectangular projection around the segment's mean latitude is accurate
//! to well below GPS noise and keeps position interpolation linear in lat/lon.

use crate::model::Waypoint;
use crate::units::Degrees;

/// Meters per degree of latitude
pub const METERS_PER_DEG: f64 = 111_320.0;

/// East/north offset in meters from `a` to `b`
pub fn offset_m(a: &Waypoint, b: &Waypoint) -> (f64, f64) {
    let mean_lat = ((a.lat + b.lat) * 0.5).to_radians();
    let east = (b.lon - a.lon) * METERS_PER_DEG * mean_lat.cos();
    let north = (b.lat - a.lat) * METERS_PER_DEG;
    (east, north)
}

pub fn distance_m(a: &Waypoint, b: &Waypoint) -> f64 {
    let (east, north) = offset_m(a, b);
    east.hypot(north)
}

/// Initial bearing from `a` to `b`; 0 = north, 90 = east
pub fn bearing(a: &Waypoint, b: &Waypoint) -> Degrees {
    let (east, north) = offset_m(a, b);
    Degrees(east.atan2(north).to_degrees()).normalized()
}

/// Linear interpolation of position (and altitude) along `a -> b`
pub fn interpolate(a: &Waypoint, b: &Waypoint, ratio: f64) -> Waypoint {
    let r = ratio.clamp(0.0, 1.0);
    Waypoint {
        lat: a.lat + (b.lat - a.lat) * r,
        lon: a.lon + (b.lon - a.lon) * r,
        alt_m: a.alt_m + (b.alt_m - a.alt_m) * r,
    }
}

/// Point `north` meters north and `east` meters east of `origin`
pub fn displace(origin: &Waypoint, north: f64, east: f64) -> Waypoint {
    let lat_rad = origin.lat.to_radians();
    Waypoint {
        lat: origin.lat + north / METERS_PER_DEG,
        lon: origin.lon + east / (METERS_PER_DEG * lat_rad.cos()),
        alt_m: origin.alt_m,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wp(lat: f64, lon: f64) -> Waypoint {
        Waypoint::new(lat, lon)
    }

    #[test]
    fn test_distance_one_degree_latitude() {
        let d = distance_m(&wp(0.0, 0.0), &wp(1.0, 0.0));
        assert!((d - METERS_PER_DEG).abs() < 1e-6);
    }

    #[test]
    fn test_cardinal_bearings() {
        let o = wp(10.0, 106.0);
        assert!((bearing(&o, &wp(10.001, 106.0)).0 - 0.0).abs() < 1e-9);
        assert!((bearing(&o, &wp(10.0, 106.001)).0 - 90.0).abs() < 1e-9);
        assert!((bearing(&o, &wp(9.999, 106.0)).0 - 180.0).abs() < 1e-9);
        assert!((bearing(&o, &wp(10.0, 105.999)).0 - 270.0).abs() < 1e-9);
    }

    #[test]
    fn test_displace_round_trips_through_distance() {
        let o = wp(48.0, 11.0);
        let p = displace(&o, 30.0, 40.0);
        assert!((distance_m(&o, &p) - 50.0).abs() < 1e-3);
    }

    #[test]
    fn test_interpolate_clamps_ratio() {
        let a = wp(0.0, 0.0);
        let b = wp(1.0, 2.0);
        assert_eq!(interpolate(&a, &b, 1.5), b);
        let mid = interpolate(&a, &b, 0.5);
        assert_eq!((mid.lat, mid.lon), (0.5, 1.0));
    }
}
