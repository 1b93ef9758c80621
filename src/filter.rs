// src/filter.rs
//! Scalar-gain Kalman smoothing for reported positions

use crate::nav::Position;

/// Nominal seconds between consecutive position reports. Consumer GPS
/// receivers emit one fix per second; using the nominal cadence instead of
/// wall-clock deltas keeps the filter deterministic under test.
const NOMINAL_UPDATE_INTERVAL: f64 = 1.0;

const METERS_PER_DEGREE_LATITUDE: f64 = 111_320.0;

const MIN_VARIANCE: f64 = 1e-6;

/// Smooths raw position reports with a one-dimensional Kalman blend.
///
/// Between observations the estimate is dead-reckoned along the current
/// bearing at the current speed; each observation then pulls the estimate
/// toward the measurement with a gain derived from the accumulated error
/// variance and the reported precision.
///
/// The filter fails open: whenever the precision context is degenerate
/// (zero, NaN or infinite) the raw observation is passed through untouched.
#[derive(Debug)]
pub struct PositionFilter {
    estimate: Option<Position>,
    variance: f64,
}

impl PositionFilter {
    pub fn new() -> Self {
        Self {
            estimate: None,
            variance: 0.0,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.estimate.is_some()
    }

    /// Forget the current estimate; the next observation re-initializes.
    pub fn reset(&mut self) {
        self.estimate = None;
        self.variance = 0.0;
    }

    /// Fold one observation into the estimate and return the smoothed
    /// position.
    ///
    /// * `precision_estimate` - expected error of the current fix, meters
    /// * `horizontal_dop` / `vertical_dop` - dilution of precision context
    /// * `bearing` - direction of travel in degrees
    /// * `speed` - ground speed in km/h
    pub fn filter(
        &mut self,
        raw: Position,
        precision_estimate: f64,
        horizontal_dop: f32,
        vertical_dop: f32,
        bearing: f64,
        speed: f64,
    ) -> Position {
        if !context_is_usable(precision_estimate, horizontal_dop, vertical_dop, bearing, speed) {
            return raw;
        }

        let measurement_variance = (precision_estimate * horizontal_dop as f64).powi(2);

        let Some(previous) = self.estimate else {
            self.estimate = Some(raw);
            self.variance = measurement_variance;
            return raw;
        };

        // Predict: dead-reckon one nominal interval along the bearing.
        let meters_moved = speed / 3.6 * NOMINAL_UPDATE_INTERVAL;
        let predicted = project(previous, bearing, meters_moved);
        let process_noise = (meters_moved * 0.5 + 1.0).powi(2);
        self.variance += process_noise;

        // Update: blend the measurement in, weighted by relative confidence.
        let gain = self.variance / (self.variance + measurement_variance);
        let latitude = predicted.latitude() + gain * (raw.latitude() - predicted.latitude());
        let longitude = predicted.longitude() + gain * (raw.longitude() - predicted.longitude());
        self.variance = (self.variance * (1.0 - gain)).max(MIN_VARIANCE);

        let blended = Position::new(latitude, longitude).unwrap_or(raw);
        self.estimate = Some(blended);
        blended
    }
}

impl Default for PositionFilter {
    fn default() -> Self {
        Self::new()
    }
}

fn context_is_usable(
    precision_estimate: f64,
    horizontal_dop: f32,
    vertical_dop: f32,
    bearing: f64,
    speed: f64,
) -> bool {
    precision_estimate.is_finite()
        && precision_estimate > 0.0
        && horizontal_dop.is_finite()
        && horizontal_dop > 0.0
        && vertical_dop.is_finite()
        && vertical_dop > 0.0
        && bearing.is_finite()
        && speed.is_finite()
        && speed >= 0.0
}

/// Move a position `meters` along `bearing` degrees, flat-earth style.
/// Good to well under a meter for the sub-kilometer steps seen here.
fn project(position: Position, bearing: f64, meters: f64) -> Position {
    if meters == 0.0 {
        return position;
    }
    let theta = bearing.to_radians();
    let delta_latitude = meters * theta.cos() / METERS_PER_DEGREE_LATITUDE;
    let latitude_radians = position.latitude().to_radians();
    let delta_longitude =
        meters * theta.sin() / (METERS_PER_DEGREE_LATITUDE * latitude_radians.cos().max(1e-6));

    Position::new(
        position.latitude() + delta_latitude,
        position.longitude() + delta_longitude,
    )
    .unwrap_or(position)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRECISION: f64 = 6.0;

    fn position(latitude: f64, longitude: f64) -> Position {
        Position::new(latitude, longitude).unwrap()
    }

    #[test]
    fn test_first_observation_passes_through() {
        let mut filter = PositionFilter::new();
        let raw = position(48.0, 11.0);

        let out = filter.filter(raw, PRECISION, 1.0, 1.3, 0.0, 0.0);
        assert_eq!(out, raw);
        assert!(filter.is_initialized());
    }

    #[test]
    fn test_degenerate_context_fails_open() {
        let mut filter = PositionFilter::new();
        let a = position(48.0, 11.0);
        let b = position(48.001, 11.0);

        filter.filter(a, PRECISION, 1.0, 1.3, 0.0, 0.0);

        // each bad input leaves the raw value untouched
        assert_eq!(filter.filter(b, f64::NAN, 1.0, 1.3, 0.0, 0.0), b);
        assert_eq!(filter.filter(b, 0.0, 1.0, 1.3, 0.0, 0.0), b);
        assert_eq!(filter.filter(b, PRECISION, f32::NAN, 1.3, 0.0, 0.0), b);
        assert_eq!(filter.filter(b, PRECISION, 1.0, 0.0, 0.0, 0.0), b);
        assert_eq!(
            filter.filter(b, PRECISION, 1.0, 1.3, f64::INFINITY, 0.0),
            b
        );
        assert_eq!(filter.filter(b, PRECISION, 1.0, 1.3, 0.0, -5.0), b);
    }

    #[test]
    fn test_jump_is_smoothed_between_old_and_new() {
        let mut filter = PositionFilter::new();
        let a = position(48.0, 11.0);
        let b = position(48.001, 11.0); // roughly 111 m north

        filter.filter(a, PRECISION, 1.0, 1.3, 0.0, 0.0);
        let out = filter.filter(b, PRECISION, 1.0, 1.3, 0.0, 0.0);

        assert!(out.latitude() > a.latitude());
        assert!(out.latitude() < b.latitude());
    }

    #[test]
    fn test_repeated_observations_converge() {
        let mut filter = PositionFilter::new();
        let a = position(48.0, 11.0);
        let b = position(48.001, 11.0015);

        filter.filter(a, PRECISION, 1.0, 1.3, 0.0, 0.0);
        let mut out = a;
        for _ in 0..20 {
            out = filter.filter(b, PRECISION, 1.0, 1.3, 0.0, 0.0);
        }

        assert!((out.latitude() - b.latitude()).abs() < 1e-6);
        assert!((out.longitude() - b.longitude()).abs() < 1e-6);
    }

    #[test]
    fn test_prediction_leads_in_direction_of_travel() {
        let mut filter = PositionFilter::new();
        let a = position(48.0, 11.0);

        filter.filter(a, PRECISION, 1.0, 1.3, 0.0, 0.0);
        // moving north at 36 km/h but the receiver repeats the old position:
        // the dead-reckoned estimate drags the output north of it
        let out = filter.filter(a, PRECISION, 1.0, 1.3, 0.0, 36.0);

        assert!(out.latitude() > a.latitude());
    }

    #[test]
    fn test_reset_forgets_estimate() {
        let mut filter = PositionFilter::new();
        let a = position(48.0, 11.0);
        let b = position(10.0, 10.0);

        filter.filter(a, PRECISION, 1.0, 1.3, 0.0, 0.0);
        filter.reset();
        assert!(!filter.is_initialized());

        // far jump passes through untouched after a reset
        assert_eq!(filter.filter(b, PRECISION, 1.0, 1.3, 0.0, 0.0), b);
    }

    #[test]
    fn test_projection_math() {
        let origin = position(0.0, 0.0);
        let north = project(origin, 0.0, 1113.2);
        assert!((north.latitude() - 0.01).abs() < 1e-6);
        assert!(north.longitude().abs() < 1e-9);

        let east = project(origin, 90.0, 1113.2);
        assert!((east.longitude() - 0.01).abs() < 1e-6);
    }
}
