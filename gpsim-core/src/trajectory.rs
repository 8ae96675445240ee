//! Motion-profile integrator
//!
//! Turns a [`Route`] and a [`MotionProfile`] into a time-ordered sequence of
//! [`MotionSample`]s. The walk is an arc-length parameterization of the
//! polyline: each tick the speed moves toward the lesser of cruise speed and
//! the braking envelope of the next waypoint, and the vehicle advances `v·dt`.
//!
//! Ticks that would overshoot a waypoint are truncated so that every waypoint
//! gets a sample at its exact position; those samples have a shorter time step.

use crate::error::SimError;
use crate::geo;
use crate::model::{MotionProfile, MotionSample, Route, Waypoint};
use crate::units::{Degrees, KilometersPerHour};

/// Segments shorter than this are treated as duplicate waypoints
pub const MIN_SEGMENT_M: f64 = 1e-3;

/// A step within this distance of a waypoint snaps onto it
const LANDING_EPS_M: f64 = 1e-6;

/// Immutable output of [`integrate`]
#[derive(Debug, Clone, PartialEq)]
pub struct Trajectory {
    samples: Vec<MotionSample>,
    segment_count: usize,
}

impl Trajectory {
    pub fn new(samples: Vec<MotionSample>, segment_count: usize) -> Self {
        Self {
            samples,
            segment_count,
        }
    }

    pub fn samples(&self) -> &[MotionSample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Number of route segments the trajectory was built from
    pub fn segment_count(&self) -> usize {
        self.segment_count
    }

    pub fn last_segment(&self) -> Option<usize> {
        self.segment_count.checked_sub(1)
    }

    /// Time of the final sample
    pub fn duration(&self) -> f64 {
        self.samples.last().map(|s| s.t_s).unwrap_or(0.0)
    }

    /// Sample whose time is closest to `t`
    pub fn sample_at(&self, t: f64) -> Option<&MotionSample> {
        let idx = self.samples.partition_point(|s| s.t_s < t);
        if idx == 0 {
            return self.samples.first();
        }
        if idx >= self.samples.len() {
            return self.samples.last();
        }
        let before = &self.samples[idx - 1];
        let after = &self.samples[idx];
        if t - before.t_s <= after.t_s - t {
            Some(before)
        } else {
            Some(after)
        }
    }

    /// Time span from the first sample of segment `start` to the last sample
    /// of segment `end`
    ///
    /// Returns `None` when the range is inverted, runs past the route, or
    /// contains no samples (only zero-length segments).
    pub fn segment_window(&self, start: usize, end: usize) -> Option<(f64, f64)> {
        if start > end || end >= self.segment_count {
            return None;
        }
        let first = self.samples.partition_point(|s| s.segment_index < start);
        let past_end = self.samples.partition_point(|s| s.segment_index <= end);
        if first >= past_end {
            return None;
        }
        Some((self.samples[first].t_s, self.samples[past_end - 1].t_s))
    }

    /// Linear resampling at a fixed step, covering `[0, duration]`
    ///
    /// The final row is the last sample held in place if the duration is not
    /// a multiple of `step`.
    pub fn resample(&self, step: f64) -> Vec<MotionSample> {
        let (Some(first), Some(last)) = (self.samples.first(), self.samples.last()) else {
            return Vec::new();
        };
        if step <= 0.0 || !step.is_finite() {
            return self.samples.clone();
        }

        let rows = (self.duration() / step - 1e-9).ceil().max(0.0) as usize;
        let mut out = Vec::with_capacity(rows + 1);
        let mut cursor = 0usize;
        for i in 0..=rows {
            let t = i as f64 * step;
            if t >= last.t_s || i == rows {
                out.push(MotionSample { t_s: t, ..*last });
                continue;
            }
            if t <= first.t_s {
                out.push(MotionSample { t_s: t, ..*first });
                continue;
            }
            while cursor + 1 < self.samples.len() && self.samples[cursor + 1].t_s <= t {
                cursor += 1;
            }
            let a = &self.samples[cursor];
            let b = &self.samples[(cursor + 1).min(self.samples.len() - 1)];
            let span = b.t_s - a.t_s;
            let r = if span > 0.0 { (t - a.t_s) / span } else { 0.0 };
            let pos = geo::interpolate(
                &Waypoint { lat: a.lat, lon: a.lon, alt_m: a.alt_m },
                &Waypoint { lat: b.lat, lon: b.lon, alt_m: b.alt_m },
                r,
            );
            out.push(MotionSample {
                t_s: t,
                lat: pos.lat,
                lon: pos.lon,
                alt_m: pos.alt_m,
                speed_mps: a.speed_mps + (b.speed_mps - a.speed_mps) * r,
                bearing_deg: a.bearing_deg,
                segment_index: a.segment_index,
            });
        }
        out
    }
}

/// Non-degenerate segment of the route
struct Leg {
    segment_index: usize,
    from: Waypoint,
    to: Waypoint,
    length_m: f64,
    bearing: Degrees,
}

fn legs(route: &Route) -> Vec<Leg> {
    route
        .points
        .windows(2)
        .enumerate()
        .filter_map(|(segment_index, pair)| {
            let length_m = geo::distance_m(&pair[0], &pair[1]);
            (length_m >= MIN_SEGMENT_M).then(|| Leg {
                segment_index,
                from: pair[0],
                to: pair[1],
                length_m,
                bearing: geo::bearing(&pair[0], &pair[1]),
            })
        })
        .collect()
}

/// Arrival speed limit (m/s) at the end of each leg, after lookahead braking
fn arrival_caps(legs: &[Leg], profile: &MotionProfile) -> Vec<f64> {
    let cruise_kmh = profile.cruise_speed_kmh;
    let mut caps: Vec<f64> = legs
        .windows(2)
        .map(|pair| {
            let turn = pair[0].bearing.delta_to(pair[1].bearing).abs();
            let cap_kmh = (cruise_kmh - profile.turn_slowdown_factor_per_deg * turn)
                .max(profile.min_turn_speed_kmh)
                .clamp(0.0, cruise_kmh);
            KilometersPerHour(cap_kmh).to_mps().0
        })
        .collect();
    // end of route
    caps.push(0.0);

    for k in (0..caps.len().saturating_sub(1)).rev() {
        let next = caps[k + 1];
        let reachable = (next * next + 2.0 * profile.decel_mps2 * legs[k + 1].length_m).sqrt();
        caps[k] = caps[k].min(reachable);
    }
    caps
}

fn sample(pos: Waypoint, t_s: f64, speed_mps: f64, heading: Degrees, segment_index: usize) -> MotionSample {
    MotionSample {
        t_s,
        lat: pos.lat,
        lon: pos.lon,
        alt_m: pos.alt_m,
        speed_mps,
        bearing_deg: heading.0,
        segment_index,
    }
}

/// Integrate `profile` along `route` with a tick of `dt_s` seconds
pub fn integrate(route: &Route, profile: &MotionProfile, dt_s: f64) -> Result<Trajectory, SimError> {
    if !dt_s.is_finite() || dt_s <= 0.0 {
        return Err(SimError::InvalidProfile(format!("dt_s must be > 0, got {}", dt_s)));
    }
    route.validate()?;
    profile.validate()?;

    let legs = legs(route);
    let Some(first_leg) = legs.first() else {
        return Err(SimError::InvalidRoute("every segment has zero length".into()));
    };
    let caps = arrival_caps(&legs, profile);

    let cruise = KilometersPerHour(profile.cruise_speed_kmh).to_mps().0;
    let accel = profile.accel_mps2;
    let decel = profile.decel_mps2;
    let start_speed = KilometersPerHour(profile.start_speed_kmh.min(profile.cruise_speed_kmh))
        .to_mps()
        .0;
    let ramp_s = if start_speed > 0.0 { profile.start_speed_s } else { 0.0 };

    let origin = route.points[0];
    let mut heading = first_leg.bearing;
    let mut samples = Vec::new();

    let initial_speed = if profile.start_hold_s > 0.0 { 0.0 } else { start_speed };
    samples.push(sample(origin, 0.0, initial_speed, heading, 0));

    let mut t = 0.0;
    if profile.start_hold_s > 0.0 {
        let hold_ticks = (profile.start_hold_s / dt_s - 1e-9).ceil() as usize;
        for i in 1..=hold_ticks {
            t = i as f64 * dt_s;
            samples.push(sample(origin, t, 0.0, heading, 0));
        }
    }

    let mut v = start_speed;
    let mut moving_s = 0.0;

    for (leg, &cap_end) in legs.iter().zip(&caps) {
        let mut traveled = 0.0;
        loop {
            let remaining = leg.length_m - traveled;
            let allowed = (cap_end * cap_end + 2.0 * decel * remaining).sqrt();
            let desired = cruise.min(allowed);

            if moving_s < ramp_s {
                let progress = ((moving_s + dt_s) / ramp_s).min(1.0);
                v = (start_speed + (cruise - start_speed) * progress).min(allowed);
            } else if v < desired {
                v = (v + accel * dt_s).min(desired);
            } else if v > desired {
                v = (v - decel * dt_s).max(desired);
            }
            if v <= 0.0 {
                v = desired;
            }

            let landing = v * dt_s + LANDING_EPS_M >= remaining;
            let (step, dt_eff) = if landing {
                (remaining, remaining / v)
            } else {
                (v * dt_s, dt_s)
            };
            traveled = if landing { leg.length_m } else { traveled + step };
            t += dt_eff;
            moving_s += dt_eff;

            heading = if profile.turn_rate_deg_s > 0.0 {
                heading.slew_toward(leg.bearing, profile.turn_rate_deg_s * dt_eff)
            } else {
                leg.bearing
            };

            let pos = if landing {
                leg.to
            } else {
                geo::interpolate(&leg.from, &leg.to, traveled / leg.length_m)
            };

            if landing {
                v = v.min(cap_end);
                samples.push(sample(pos, t, v, heading, leg.segment_index));
                break;
            }
            samples.push(sample(pos, t, v, heading, leg.segment_index));
        }
    }

    // trailing duplicate waypoints collapse onto the route's end point
    if let (Some(last), Some(end)) = (samples.last_mut(), route.points.last()) {
        last.lat = end.lat;
        last.lon = end.lon;
        last.alt_m = end.alt_m;
        last.speed_mps = 0.0;
    }

    Ok(Trajectory::new(samples, route.segment_count()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(cruise_kmh: f64, accel: f64, decel: f64) -> MotionProfile {
        MotionProfile {
            cruise_speed_kmh: cruise_kmh,
            accel_mps2: accel,
            decel_mps2: decel,
            turn_slowdown_factor_per_deg: 0.0,
            min_turn_speed_kmh: 0.0,
            turn_rate_deg_s: 0.0,
            start_hold_s: 0.0,
            start_speed_kmh: 0.0,
            start_speed_s: 0.0,
        }
    }

    /// Waypoints every `spacing_m` meters due north of a fixed origin
    fn straight_route(count: usize, spacing_m: f64) -> Route {
        let origin = Waypoint::new(10.0, 106.0);
        Route::new(
            (0..count)
                .map(|i| geo::displace(&origin, spacing_m * i as f64, 0.0))
                .collect(),
        )
    }

    fn l_route() -> Route {
        let origin = Waypoint::new(10.0, 106.0);
        Route::new(vec![
            origin,
            geo::displace(&origin, 200.0, 0.0),
            geo::displace(&origin, 200.0, 200.0),
        ])
    }

    fn assert_strictly_increasing(traj: &Trajectory) {
        for pair in traj.samples().windows(2) {
            assert!(
                pair[1].t_s > pair[0].t_s,
                "time not increasing: {} -> {}",
                pair[0].t_s,
                pair[1].t_s
            );
        }
    }

    #[test]
    fn test_rejects_short_route() {
        let route = Route::new(vec![Waypoint::new(10.0, 106.0)]);
        let err = integrate(&route, &profile(36.0, 2.0, 2.0), 0.1).unwrap_err();
        assert!(matches!(err, SimError::InvalidRoute(_)));
    }

    #[test]
    fn test_rejects_all_zero_length_route() {
        let p = Waypoint::new(10.0, 106.0);
        let route = Route::new(vec![p, p, p]);
        let err = integrate(&route, &profile(36.0, 2.0, 2.0), 0.1).unwrap_err();
        assert!(matches!(err, SimError::InvalidRoute(_)));
    }

    #[test]
    fn test_rejects_bad_profile_and_dt() {
        let route = straight_route(2, 100.0);
        assert!(matches!(
            integrate(&route, &profile(36.0, 0.0, 2.0), 0.1),
            Err(SimError::InvalidProfile(_))
        ));
        assert!(matches!(
            integrate(&route, &profile(36.0, 2.0, 0.0), 0.1),
            Err(SimError::InvalidProfile(_))
        ));
        assert!(matches!(
            integrate(&route, &profile(36.0, 2.0, 2.0), 0.0),
            Err(SimError::InvalidProfile(_))
        ));
    }

    #[test]
    fn test_deterministic() {
        let mut p = profile(40.0, 1.5, 2.5);
        p.turn_slowdown_factor_per_deg = 0.2;
        p.min_turn_speed_kmh = 8.0;
        p.turn_rate_deg_s = 30.0;
        p.start_hold_s = 1.0;
        let a = integrate(&l_route(), &p, 0.1).unwrap();
        let b = integrate(&l_route(), &p, 0.1).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_three_collinear_waypoints() {
        let route = straight_route(3, 100.0);
        let traj = integrate(&route, &profile(36.0, 2.0, 2.0), 0.1).unwrap();
        let samples = traj.samples();
        assert_strictly_increasing(&traj);

        // accelerates 0 -> 10 m/s in about 5 s
        let at_5s = traj.sample_at(5.0).unwrap();
        assert!((at_5s.speed_mps - 10.0).abs() < 1e-6, "speed at 5s: {}", at_5s.speed_mps);
        let at_4s = traj.sample_at(4.0).unwrap();
        assert!(at_4s.speed_mps < 10.0);

        // passes the middle waypoint at cruise, no turn means no slowdown
        let middle = samples
            .iter()
            .find(|s| s.segment_index == 0 && (s.lat - route.points[1].lat).abs() < 1e-12)
            .expect("sample on middle waypoint");
        assert!((middle.speed_mps - 10.0).abs() < 1e-6);
        let first_on_last_segment = samples.iter().position(|s| s.segment_index == 1).unwrap();
        assert!(samples[first_on_last_segment - 1].t_s <= middle.t_s);

        // ends stopped, exactly on the last waypoint
        let last = samples.last().unwrap();
        assert_eq!(last.speed_mps, 0.0);
        assert_eq!((last.lat, last.lon), (route.points[2].lat, route.points[2].lon));

        // braking from 10 m/s at 2 m/s^2 takes at most 5 s
        let braking_starts = samples
            .iter()
            .rev()
            .find(|s| (s.speed_mps - 10.0).abs() < 1e-9)
            .unwrap();
        let braking = last.t_s - braking_starts.t_s;
        assert!(braking > 4.0 && braking <= 5.2, "braking took {}", braking);
        // 200 m: ~25 m accel, ~150 m cruise, ~25 m decel
        assert!(traj.duration() > 24.0 && traj.duration() < 25.5, "duration {}", traj.duration());
        assert!(samples.iter().all(|s| s.speed_mps <= 10.0 + 1e-9));
    }

    #[test]
    fn test_speed_bounds_and_turn_cap() {
        let mut p = profile(36.0, 2.0, 2.0);
        p.turn_slowdown_factor_per_deg = 0.3;
        p.min_turn_speed_kmh = 10.0;
        let route = l_route();
        let traj = integrate(&route, &p, 0.1).unwrap();
        let cruise = 10.0;
        for s in traj.samples() {
            assert!(s.speed_mps >= 0.0 && s.speed_mps <= cruise + 1e-9);
        }

        let cap = KilometersPerHour((36.0_f64 - 0.3 * 90.0).max(10.0)).to_mps().0;
        let corner = traj
            .samples()
            .iter()
            .find(|s| s.lat == route.points[1].lat && s.lon == route.points[1].lon)
            .expect("sample on the corner");
        assert!(corner.speed_mps <= cap + 1e-9, "{} > {}", corner.speed_mps, cap);
    }

    #[test]
    fn test_segment_coverage() {
        let route = Route::new(vec![
            Waypoint::new(10.0, 106.0),
            Waypoint::new(10.0005, 106.0),
            Waypoint::new(10.0005, 106.0007),
            Waypoint::new(10.0012, 106.0007),
            Waypoint::new(10.0012, 106.0),
        ]);
        let mut p = profile(30.0, 1.0, 1.0);
        p.turn_slowdown_factor_per_deg = 0.2;
        p.min_turn_speed_kmh = 5.0;
        let traj = integrate(&route, &p, 0.1).unwrap();
        let indices: Vec<usize> = traj.samples().iter().map(|s| s.segment_index).collect();
        assert!(indices.windows(2).all(|w| w[0] <= w[1]));
        for seg in 0..route.segment_count() {
            assert!(indices.contains(&seg), "segment {} not covered", seg);
        }
        assert_eq!(traj.segment_count(), 4);
    }

    #[test]
    fn test_zero_length_segment_is_skipped() {
        let origin = Waypoint::new(10.0, 106.0);
        let corner = geo::displace(&origin, 100.0, 0.0);
        let route = Route::new(vec![origin, corner, corner, geo::displace(&origin, 100.0, 100.0)]);
        let traj = integrate(&route, &profile(36.0, 2.0, 2.0), 0.1).unwrap();
        assert_strictly_increasing(&traj);
        assert!(traj.samples().iter().all(|s| s.segment_index != 1));
        assert_eq!(traj.samples().last().unwrap().segment_index, 2);
    }

    #[test]
    fn test_start_hold() {
        let mut p = profile(36.0, 2.0, 2.0);
        p.start_hold_s = 1.0;
        p.start_speed_kmh = 18.0;
        let traj = integrate(&straight_route(2, 100.0), &p, 0.1).unwrap();
        let held: Vec<_> = traj.samples().iter().take_while(|s| s.speed_mps == 0.0).collect();
        // t = 0 plus ten hold ticks
        assert_eq!(held.len(), 11);
        assert!((held.last().unwrap().t_s - 1.0).abs() < 1e-9);
        assert!(held.iter().all(|s| s.segment_index == 0));
        // then moves at the start speed plus one tick of acceleration
        let first_moving = traj.samples()[11];
        assert!((first_moving.speed_mps - 5.2).abs() < 1e-9);
    }

    #[test]
    fn test_start_speed_ramp_ignores_accel() {
        let mut p = profile(36.0, 0.5, 2.0);
        p.start_speed_kmh = 18.0;
        p.start_speed_s = 2.0;
        let traj = integrate(&straight_route(2, 200.0), &p, 0.1).unwrap();
        assert!((traj.samples()[0].speed_mps - 5.0).abs() < 1e-9);
        // linear ramp 5 -> 10 m/s over 2 s, far faster than accel allows
        let at_1s = traj.sample_at(1.0).unwrap();
        assert!((at_1s.speed_mps - 7.5).abs() < 1e-6, "{}", at_1s.speed_mps);
        let at_2s = traj.sample_at(2.0).unwrap();
        assert!((at_2s.speed_mps - 10.0).abs() < 1e-6);
    }

    #[test]
    fn test_heading_slews_at_turn_rate() {
        let mut p = profile(18.0, 1.0, 1.0);
        p.min_turn_speed_kmh = 5.0;
        p.turn_rate_deg_s = 20.0;
        let traj = integrate(&l_route(), &p, 0.1).unwrap();
        let samples = traj.samples();
        for pair in samples.windows(2) {
            let dt = pair[1].t_s - pair[0].t_s;
            let turned = Degrees(pair[0].bearing_deg).delta_to(Degrees(pair[1].bearing_deg)).abs();
            assert!(turned <= 20.0 * dt + 1e-9);
        }
        assert!((samples.last().unwrap().bearing_deg - 90.0).abs() < 1e-6);
    }

    #[test]
    fn test_segment_window_and_lookup() {
        let route = straight_route(4, 100.0);
        let traj = integrate(&route, &profile(36.0, 2.0, 2.0), 0.1).unwrap();
        let (t0, t1) = traj.segment_window(1, 1).unwrap();
        let first = traj.samples().iter().find(|s| s.segment_index == 1).unwrap();
        let last = traj.samples().iter().rev().find(|s| s.segment_index == 1).unwrap();
        assert_eq!((t0, t1), (first.t_s, last.t_s));
        assert_eq!(traj.segment_window(0, 2).unwrap().1, traj.duration());
        assert!(traj.segment_window(2, 3).is_none());
        assert!(traj.segment_window(2, 1).is_none());

        assert_eq!(traj.sample_at(-1.0).unwrap().t_s, 0.0);
        assert_eq!(traj.sample_at(1e6).unwrap().t_s, traj.duration());
    }

    #[test]
    fn test_resample_fixed_step() {
        let traj = integrate(&straight_route(2, 50.0), &profile(36.0, 2.0, 2.0), 0.25).unwrap();
        let rows = traj.resample(0.1);
        assert_eq!(rows[0].t_s, 0.0);
        for pair in rows.windows(2) {
            assert!((pair[1].t_s - pair[0].t_s - 0.1).abs() < 1e-9);
        }
        assert!(rows.last().unwrap().t_s >= traj.duration() - 1e-9);
        let end = traj.samples().last().unwrap();
        assert_eq!(rows.last().unwrap().lat, end.lat);
    }
}
