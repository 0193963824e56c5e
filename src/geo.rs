//! Geodesic helpers over WGS84 coordinates.
//!
//! All distances are great-circle (haversine) meters; bearings are compass
//! degrees with north at 0 and east at 90.

use geo::{HaversineBearing, HaversineDistance, Point};

/// Great-circle distance in meters between two coordinate pairs.
pub fn distance_meters(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let from = Point::new(lon1, lat1);
    let to = Point::new(lon2, lat2);
    from.haversine_distance(&to)
}

/// Initial bearing in degrees from the first coordinate towards the second,
/// normalized to [0, 360). Identical coordinates yield 0.
pub fn bearing_degrees(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let from = Point::new(lon1, lat1);
    let to = Point::new(lon2, lat2);
    from.haversine_bearing(to).rem_euclid(360.0)
}

/// Smallest angular difference between two bearings, in [0, 180].
pub fn bearing_delta(a: f64, b: f64) -> f64 {
    let diff = (a - b).rem_euclid(360.0);
    if diff > 180.0 { 360.0 - diff } else { diff }
}
