//! Lat/lon rectangles used for viewports and cached regions.

use rstar::AABB;
use serde::{Deserialize, Serialize};

use crate::{CaseMapError, Coordinate, Result};

/// Axis-aligned lat/lon rectangle.
///
/// The constructor rejects `min > max` instead of swapping the edges: an inverted
/// rectangle almost always means the caller mixed up corners upstream.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoBounds {
    min_lat: f64,
    min_lon: f64,
    max_lat: f64,
    max_lon: f64,
}

impl GeoBounds {
    /// Create bounds from explicit edges.
    pub fn new(min_lat: f64, min_lon: f64, max_lat: f64, max_lon: f64) -> Result<Self> {
        let invalid = |message: &str| CaseMapError::InvalidBounds {
            min_lat,
            min_lon,
            max_lat,
            max_lon,
            message: message.to_string(),
        };

        if ![min_lat, min_lon, max_lat, max_lon]
            .iter()
            .all(|v| v.is_finite())
        {
            return Err(invalid("edges must be finite"));
        }
        if min_lat > max_lat {
            return Err(invalid("min_lat > max_lat"));
        }
        if min_lon > max_lon {
            return Err(invalid("min_lon > max_lon"));
        }

        Ok(Self {
            min_lat,
            min_lon,
            max_lat,
            max_lon,
        })
    }

    /// Degenerate bounds covering a single point. The point must lie in WGS84 ranges.
    pub fn from_point(point: Coordinate) -> Result<Self> {
        if !point.is_valid() {
            return Err(CaseMapError::InvalidCoordinate {
                latitude: point.latitude,
                longitude: point.longitude,
            });
        }
        Self::new(
            point.latitude,
            point.longitude,
            point.latitude,
            point.longitude,
        )
    }

    /// Smallest bounds containing all points. `None` on empty input.
    pub fn from_points(points: &[Coordinate]) -> Option<Self> {
        if points.is_empty() {
            return None;
        }
        let mut min_lat = f64::MAX;
        let mut max_lat = f64::MIN;
        let mut min_lon = f64::MAX;
        let mut max_lon = f64::MIN;

        for p in points {
            min_lat = min_lat.min(p.latitude);
            max_lat = max_lat.max(p.latitude);
            min_lon = min_lon.min(p.longitude);
            max_lon = max_lon.max(p.longitude);
        }

        Self::new(min_lat, min_lon, max_lat, max_lon).ok()
    }

    pub fn min_lat(&self) -> f64 {
        self.min_lat
    }

    pub fn min_lon(&self) -> f64 {
        self.min_lon
    }

    pub fn max_lat(&self) -> f64 {
        self.max_lat
    }

    pub fn max_lon(&self) -> f64 {
        self.max_lon
    }

    /// True if `other` lies fully inside `self` (edges inclusive).
    pub fn contains(&self, other: &GeoBounds) -> bool {
        self.min_lat <= other.min_lat
            && self.min_lon <= other.min_lon
            && self.max_lat >= other.max_lat
            && self.max_lon >= other.max_lon
    }

    /// True if the rectangles overlap on both axes. Touching edges count.
    pub fn intersects(&self, other: &GeoBounds) -> bool {
        self.min_lat <= other.max_lat
            && other.min_lat <= self.max_lat
            && self.min_lon <= other.max_lon
            && other.min_lon <= self.max_lon
    }

    /// Smallest rectangle enclosing both.
    pub fn union(&self, other: &GeoBounds) -> GeoBounds {
        GeoBounds {
            min_lat: self.min_lat.min(other.min_lat),
            min_lon: self.min_lon.min(other.min_lon),
            max_lat: self.max_lat.max(other.max_lat),
            max_lon: self.max_lon.max(other.max_lon),
        }
    }

    pub fn contains_point(&self, point: &Coordinate) -> bool {
        point.latitude >= self.min_lat
            && point.latitude <= self.max_lat
            && point.longitude >= self.min_lon
            && point.longitude <= self.max_lon
    }

    /// Get the center point of the bounds.
    pub fn center(&self) -> Coordinate {
        Coordinate::new(
            (self.min_lat + self.max_lat) / 2.0,
            (self.min_lon + self.max_lon) / 2.0,
        )
    }

    /// R-tree envelope in `[lon, lat]` order.
    pub fn envelope(&self) -> AABB<[f64; 2]> {
        AABB::from_corners([self.min_lon, self.min_lat], [self.max_lon, self.max_lat])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(min_lat: f64, min_lon: f64, max_lat: f64, max_lon: f64) -> GeoBounds {
        GeoBounds::new(min_lat, min_lon, max_lat, max_lon).unwrap()
    }

    #[test]
    fn test_inverted_bounds_rejected() {
        assert!(matches!(
            GeoBounds::new(10.0, 0.0, 0.0, 10.0),
            Err(CaseMapError::InvalidBounds { .. })
        ));
        assert!(GeoBounds::new(0.0, 10.0, 10.0, 0.0).is_err());
        assert!(GeoBounds::new(0.0, 0.0, f64::NAN, 1.0).is_err());
    }

    #[test]
    fn test_contains_is_reflexive() {
        let area = b(0.0, 0.0, 10.0, 10.0);
        assert!(area.contains(&area));

        let point = GeoBounds::from_point(Coordinate::new(3.0, 4.0)).unwrap();
        assert!(point.contains(&point));
        assert!(area.contains(&point));
    }

    #[test]
    fn test_from_point_rejects_out_of_range() {
        assert!(matches!(
            GeoBounds::from_point(Coordinate::new(91.0, 0.0)),
            Err(CaseMapError::InvalidCoordinate { latitude, .. }) if latitude == 91.0
        ));
        assert!(matches!(
            GeoBounds::from_point(Coordinate::new(0.0, f64::INFINITY)),
            Err(CaseMapError::InvalidCoordinate { .. })
        ));
        assert!(GeoBounds::from_point(Coordinate::new(-90.0, 180.0)).is_ok());
    }

    #[test]
    fn test_contains_inclusive_edges() {
        let area = b(0.0, 0.0, 10.0, 10.0);
        assert!(area.contains(&b(0.0, 0.0, 10.0, 5.0)));
        assert!(!area.contains(&b(-0.1, 0.0, 5.0, 5.0)));
        assert!(!area.contains(&b(2.0, 2.0, 5.0, 10.5)));
    }

    #[test]
    fn test_intersects() {
        let area = b(0.0, 0.0, 10.0, 10.0);
        assert!(area.intersects(&b(5.0, 5.0, 15.0, 15.0)));
        assert!(area.intersects(&b(10.0, 10.0, 12.0, 12.0)));
        assert!(!area.intersects(&b(11.0, 0.0, 12.0, 10.0)));
        assert!(!area.intersects(&b(0.0, 11.0, 10.0, 12.0)));
    }

    #[test]
    fn test_union_contains_both() {
        let pairs = [
            (b(0.0, 0.0, 1.0, 1.0), b(5.0, 5.0, 6.0, 6.0)),
            (b(-3.0, 2.0, 1.0, 4.0), b(0.0, -8.0, 0.5, 3.0)),
            (b(1.0, 1.0, 1.0, 1.0), b(1.0, 1.0, 1.0, 1.0)),
        ];
        for (a, other) in pairs {
            let u = a.union(&other);
            assert!(u.contains(&a));
            assert!(u.contains(&other));
        }
    }

    #[test]
    fn test_from_points() {
        assert!(GeoBounds::from_points(&[]).is_none());

        let bounds = GeoBounds::from_points(&[
            Coordinate::new(1.0, 5.0),
            Coordinate::new(-2.0, 7.0),
            Coordinate::new(0.5, 6.0),
        ])
        .unwrap();
        assert_eq!(bounds, b(-2.0, 5.0, 1.0, 7.0));
        assert_eq!(bounds.center(), Coordinate::new(-0.5, 6.0));
        assert!(bounds.contains_point(&Coordinate::new(0.0, 6.5)));
    }
}
