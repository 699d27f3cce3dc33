use crate::models::chair::Coordinate;

/// Rectilinear distance `|Δlat| + |Δlon|`, used for travel accounting,
/// dispatch ranking and fares alike.
pub fn manhattan_distance(a: &Coordinate, b: &Coordinate) -> i64 {
    let delta_lat = i64::from(a.latitude) - i64::from(b.latitude);
    let delta_lon = i64::from(a.longitude) - i64::from(b.longitude);

    delta_lat.abs() + delta_lon.abs()
}
