use crate::model::Coordinates;

/// Mean Earth radius, kilometres.
const EARTH_RADIUS_KM: f64 = 6371.0088;

/// Great-circle distance between two optional points. Missing or invalid
/// coordinates yield an infinite distance so scoring and allocation can
/// treat unresolved entities as maximally unattractive without special
/// cases.
pub fn distance_km(a: Option<Coordinates>, b: Option<Coordinates>) -> f64 {
    match (a, b) {
        (Some(a), Some(b)) if a.is_valid() && b.is_valid() => haversine_km(a, b),
        _ => f64::INFINITY,
    }
}

fn haversine_km(a: Coordinates, b: Coordinates) -> f64 {
    let lat_a = a.latitude.to_radians();
    let lat_b = b.latitude.to_radians();
    let d_lat = (b.latitude - a.latitude).to_radians();
    let d_lng = (b.longitude - a.longitude).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat_a.cos() * lat_b.cos() * (d_lng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().asin()
}
