//! Geometry helpers for route drawing and distance display.

use geojson::{Geometry, Value};
use thiserror::Error;

use crate::model::LatLng;
use crate::{AppError, ErrorKind, EARTH_RADIUS_M};

const POLYLINE_PRECISION: f64 = 1e5;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolylineError {
    #[error("polyline ended in the middle of a value at byte {offset}")]
    Truncated { offset: usize },
    #[error("invalid polyline character {ch:?} at byte {offset}")]
    InvalidCharacter { ch: char, offset: usize },
    #[error("polyline value overflows at byte {offset}")]
    Overflow { offset: usize },
    #[error("polyline point at byte {offset} is not a valid coordinate")]
    OutOfRange { offset: usize },
}

impl From<PolylineError> for AppError {
    fn from(e: PolylineError) -> Self {
        AppError::new(ErrorKind::Deserialization, "Route geometry could not be read")
            .with_internal(e.to_string())
    }
}

#[must_use]
pub fn haversine_distance(p1: LatLng, p2: LatLng) -> f64 {
    const EPSILON: f64 = 1e-10;

    if (p1.lat - p2.lat).abs() < EPSILON && (p1.lng - p2.lng).abs() < EPSILON {
        return 0.0;
    }

    let lat1_rad = p1.lat.to_radians();
    let lat2_rad = p2.lat.to_radians();
    let delta_lat = (p2.lat - p1.lat).to_radians();
    let delta_lng = (p2.lng - p1.lng).to_radians();

    let a = (delta_lat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (delta_lng / 2.0).sin().powi(2);

    let a = a.clamp(0.0, 1.0);

    let c = 2.0 * a.sqrt().asin();

    let result = EARTH_RADIUS_M * c;

    if result.is_finite() {
        result
    } else {
        f64::MAX
    }
}

/// Decodes an encoded polyline (Google format, five decimal places).
pub fn decode_polyline(encoded: &str) -> Result<Vec<LatLng>, PolylineError> {
    let bytes = encoded.as_bytes();
    let mut points = Vec::new();
    let mut index = 0;
    let mut lat: i64 = 0;
    let mut lng: i64 = 0;

    while index < bytes.len() {
        let (dlat, next) = decode_value(bytes, index)?;
        let (dlng, next) = decode_value(bytes, next)?;
        let offset = index;
        index = next;
        lat = lat
            .checked_add(dlat)
            .ok_or(PolylineError::Overflow { offset })?;
        lng = lng
            .checked_add(dlng)
            .ok_or(PolylineError::Overflow { offset })?;

        #[allow(clippy::cast_precision_loss)]
        let point = LatLng::new(lat as f64 / POLYLINE_PRECISION, lng as f64 / POLYLINE_PRECISION)
            .map_err(|_| PolylineError::OutOfRange { offset })?;
        points.push(point);
    }

    Ok(points)
}

fn decode_value(bytes: &[u8], mut index: usize) -> Result<(i64, usize), PolylineError> {
    let mut result: i64 = 0;
    let mut shift = 0;

    loop {
        let byte = *bytes
            .get(index)
            .ok_or(PolylineError::Truncated { offset: index })?;
        if !(63..127).contains(&byte) {
            return Err(PolylineError::InvalidCharacter {
                ch: char::from(byte),
                offset: index,
            });
        }
        if shift > 60 {
            return Err(PolylineError::Overflow { offset: index });
        }

        let chunk = i64::from(byte - 63);
        result |= (chunk & 0x1f) << shift;
        shift += 5;
        index += 1;

        if chunk < 0x20 {
            break;
        }
    }

    let value = if result & 1 == 1 {
        !(result >> 1)
    } else {
        result >> 1
    };
    Ok((value, index))
}

/// Two-point route used when the routing service has nothing better.
#[must_use]
pub fn straight_line(from: LatLng, to: LatLng) -> Vec<LatLng> {
    vec![from, to]
}

/// GeoJSON `LineString` for the map layer. GeoJSON positions are `[lng, lat]`.
#[must_use]
pub fn route_to_geojson(points: &[LatLng]) -> Geometry {
    Geometry::new(Value::LineString(
        points.iter().map(|p| vec![p.lng, p.lat]).collect(),
    ))
}

#[must_use]
pub fn format_location_text(point: LatLng) -> String {
    format!("{:.5}, {:.5}", point.lat, point.lng)
}

#[must_use]
pub fn format_distance(meters: f64) -> String {
    if !meters.is_finite() || meters < 0.0 {
        return "Unknown".to_string();
    }

    if meters < 1000.0 {
        format!("{meters:.0} m")
    } else if meters < 10_000.0 {
        format!("{:.1} km", meters / 1000.0)
    } else {
        format!("{:.0} km", meters / 1000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_reference_polyline() {
        let points = decode_polyline("_p~iF~ps|U_ulLnnqC_mqNvxq`@").unwrap();
        assert_eq!(points.len(), 3);
        assert!((points[0].lat - 38.5).abs() < 1e-9);
        assert!((points[0].lng - -120.2).abs() < 1e-9);
        assert!((points[1].lat - 40.7).abs() < 1e-9);
        assert!((points[1].lng - -120.95).abs() < 1e-9);
        assert!((points[2].lat - 43.252).abs() < 1e-9);
        assert!((points[2].lng - -126.453).abs() < 1e-9);
    }

    #[test]
    fn empty_polyline_has_no_points() {
        assert_eq!(decode_polyline("").unwrap(), Vec::new());
    }

    #[test]
    fn truncated_polyline_is_rejected() {
        assert!(matches!(
            decode_polyline("_p~iF"),
            Err(PolylineError::Truncated { .. })
        ));
        assert!(matches!(
            decode_polyline("_p~iF~ps|U\n"),
            Err(PolylineError::InvalidCharacter { ch: '\n', .. })
        ));
    }

    #[test]
    fn runaway_deltas_are_rejected_instead_of_wrapping() {
        let hostile = ("~".repeat(12) + "F").repeat(8);
        assert!(matches!(
            decode_polyline(&hostile),
            Err(PolylineError::Overflow { .. } | PolylineError::OutOfRange { .. })
        ));

        // 100 degrees of latitude: decodes fine as an integer, but is no coordinate.
        assert!(matches!(
            decode_polyline("_gjaR?"),
            Err(PolylineError::OutOfRange { offset: 0 })
        ));
    }

    #[test]
    fn haversine_known_distance() {
        let a = LatLng { lat: 19.4326, lng: -99.1332 };
        let b = LatLng { lat: 19.4270, lng: -99.1677 };
        let d = haversine_distance(a, b);
        assert!((3_500.0..3_800.0).contains(&d), "distance was {d}");
        assert!(haversine_distance(a, a).abs() < f64::EPSILON);
    }

    #[test]
    fn geojson_positions_are_lng_first() {
        let geometry = route_to_geojson(&straight_line(
            LatLng { lat: 1.0, lng: 2.0 },
            LatLng { lat: 3.0, lng: 4.0 },
        ));
        match geometry.value {
            Value::LineString(coords) => {
                assert_eq!(coords, vec![vec![2.0, 1.0], vec![4.0, 3.0]]);
            }
            other => panic!("unexpected geometry {other:?}"),
        }
    }

    #[test]
    fn location_text_has_five_decimals() {
        assert_eq!(
            format_location_text(LatLng { lat: 19.432_612_3, lng: -99.133_2 }),
            "19.43261, -99.13320"
        );
        assert_eq!(format_distance(850.0), "850 m");
        assert_eq!(format_distance(2_345.0), "2.3 km");
    }
}
