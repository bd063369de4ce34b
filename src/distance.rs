use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

use crate::types::Location;

pub const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

/// A distance between two coordinates in meters (or coordinate units for the p-norm).
/// Anything with this call shape can drive the matcher, closures included.
pub trait Distance: Sync {
    fn distance(&self, a: &Location, b: &Location) -> f64;
}

impl<F> Distance for F
where
    F: Fn(&Location, &Location) -> f64 + Sync,
{
    fn distance(&self, a: &Location, b: &Location) -> f64 {
        self(a, b)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DistanceMetric {
    #[default]
    Haversine,
    /// Only accurate when both points are close; see [`approx_haversine_meters`].
    ApproxHaversine,
    /// Minkowski distance over raw latitude/longitude values.
    Minkowski {
        #[serde(default = "default_p")]
        p: f64,
    },
}

fn default_p() -> f64 {
    2.0
}

impl Distance for DistanceMetric {
    fn distance(&self, a: &Location, b: &Location) -> f64 {
        match *self {
            DistanceMetric::Haversine => haversine_meters(a, b),
            DistanceMetric::ApproxHaversine => approx_haversine_meters(a, b),
            DistanceMetric::Minkowski { p } => p_norm(a, b, p),
        }
    }
}

pub fn haversine_meters(a: &Location, b: &Location) -> f64 {
    let ap = haversine_rs::point::Point { latitude: a.latitude, longitude: a.longitude };
    let bp = haversine_rs::point::Point { latitude: b.latitude, longitude: b.longitude };
    let distance = haversine_rs::distance(ap, bp, haversine_rs::units::Unit::Meters);
    // Near antipodes the haversine term rounds past 1 and the distance comes back NaN.
    if distance.is_nan() {
        PI * EARTH_RADIUS_METERS
    } else {
        distance
    }
}

/// Haversine with `sin(x) ≈ x` on the half-angle terms. The angular deltas must be small.
pub fn approx_haversine_meters(a: &Location, b: &Location) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let half_dlat = (a.latitude - b.latitude).to_radians() / 2.0;
    let half_dlon = (a.longitude - b.longitude).to_radians() / 2.0;

    let h = half_dlat * half_dlat + lat1.cos() * lat2.cos() * half_dlon * half_dlon;
    // The approximation can push h past 1 for far apart points.
    let h = h.min(1.0);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    EARTH_RADIUS_METERS * c
}

pub fn p_norm(a: &Location, b: &Location, p: f64) -> f64 {
    let sum = (a.latitude - b.latitude).abs().powf(p) + (a.longitude - b.longitude).abs().powf(p);
    sum.powf(1.0 / p)
}
