//! Spherical point math and the radius-based user locator.
//!
//! SQLite has no spherical index, so every nearby query is two-phase: a bounding
//! box over the `(latitude, longitude)` index narrows the candidate rows, then the
//! exact great-circle distance decides membership.
use anyhow::Context as _;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::db::Db;

/// Mean earth radius used for spherical distance, in meters.
pub const EARTH_RADIUS_METERS: f64 = 6_378_100.0;

/// Radius used to target users around a verified disaster.
pub const DEFAULT_RADIUS_METERS: f64 = 50_000.0;

/// A `(longitude, latitude)` pair in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub longitude: f64,
    pub latitude: f64,
}

impl Point {
    pub const fn new(longitude: f64, latitude: f64) -> Self {
        Self {
            longitude,
            latitude,
        }
    }

    /// Checks that both coordinates are finite and in range.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.longitude.is_finite() && (-180.0..=180.0).contains(&self.longitude),
            "longitude must be between -180 and 180"
        );
        anyhow::ensure!(
            self.latitude.is_finite() && (-90.0..=90.0).contains(&self.latitude),
            "latitude must be between -90 and 90"
        );
        Ok(())
    }

    /// Great-circle distance in meters (haversine).
    pub fn distance_to(&self, other: &Self) -> f64 {
        let (lat1, lat2) = (self.latitude.to_radians(), other.latitude.to_radians());
        let dlat = lat2 - lat1;
        let dlon = (other.longitude - self.longitude).to_radians();

        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_METERS * a.sqrt().min(1.0).asin()
    }
}

/// A degree-aligned box that contains every point within `radius` of `center`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
}

impl BoundingBox {
    pub fn around(center: Point, radius_meters: f64) -> Self {
        // Slightly oversized; the exact distance check does the real filtering.
        let angular = (radius_meters / EARTH_RADIUS_METERS).to_degrees() * 1.001 + 1e-9;

        let min_lat = (center.latitude - angular).max(-90.0);
        let max_lat = (center.latitude + angular).min(90.0);

        let cos_lat = min_lat
            .to_radians()
            .cos()
            .min(max_lat.to_radians().cos());
        let lon_span = if cos_lat <= f64::EPSILON {
            360.0
        } else {
            angular / cos_lat
        };

        let (min_lon, max_lon) =
            if lon_span >= 180.0 || center.longitude - lon_span < -180.0 || center.longitude + lon_span > 180.0 {
                // Wraps the antimeridian or covers a pole: longitude cannot narrow it.
                (-180.0, 180.0)
            } else {
                (center.longitude - lon_span, center.longitude + lon_span)
            };

        Self {
            min_lat,
            max_lat,
            min_lon,
            max_lon,
        }
    }
}

/// Keep only `candidates` within `radius_meters` of `center`, nearest first.
pub fn within_radius<T>(
    center: Point,
    radius_meters: f64,
    candidates: impl IntoIterator<Item = (Point, T)>,
) -> Vec<(f64, T)> {
    let mut hits: Vec<(f64, T)> = candidates
        .into_iter()
        .map(|(p, item)| (center.distance_to(&p), item))
        .filter(|(d, _)| *d <= radius_meters)
        .collect();
    hits.sort_by(|a, b| a.0.total_cmp(&b.0));
    hits
}

/// A user found inside a search radius.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NearbyUser {
    pub user_id: String,
    pub email: String,
    pub name: String,
    pub distance_meters: f64,
}

/// Finds users whose stored location lies within a radius of a point.
#[async_trait]
pub trait UserLocator: Send + Sync {
    /// Users with a location set, nearest first. A miss is an empty list, not an error.
    async fn find_nearby(
        &self,
        center: Point,
        radius_meters: f64,
        limit: Option<usize>,
    ) -> anyhow::Result<Vec<NearbyUser>>;
}

/// Locator backed by the `users` table.
#[derive(Clone)]
pub struct SqlLocator {
    db: Db,
}

impl SqlLocator {
    pub const fn new(db: Db) -> Self {
        Self { db }
    }
}

#[derive(sqlx::FromRow)]
struct Candidate {
    id: String,
    email: String,
    name: String,
    longitude: f64,
    latitude: f64,
}

#[async_trait]
impl UserLocator for SqlLocator {
    #[tracing::instrument(skip(self))]
    async fn find_nearby(
        &self,
        center: Point,
        radius_meters: f64,
        limit: Option<usize>,
    ) -> anyhow::Result<Vec<NearbyUser>> {
        center.validate()?;
        anyhow::ensure!(radius_meters >= 0.0, "radius must not be negative");

        let bbox = BoundingBox::around(center, radius_meters);
        let rows: Vec<Candidate> = sqlx::query_as(
            r#"
            SELECT id, email, name, longitude, latitude FROM users
                WHERE longitude IS NOT NULL AND latitude IS NOT NULL
                AND latitude BETWEEN ? AND ?
                AND longitude BETWEEN ? AND ?
            "#,
        )
        .bind(bbox.min_lat)
        .bind(bbox.max_lat)
        .bind(bbox.min_lon)
        .bind(bbox.max_lon)
        .fetch_all(&self.db)
        .await
        .context("failed to query user locations")?;

        let mut users: Vec<NearbyUser> = within_radius(
            center,
            radius_meters,
            rows.into_iter()
                .map(|c| (Point::new(c.longitude, c.latitude), c)),
        )
        .into_iter()
        .map(|(distance, c)| NearbyUser {
            user_id: c.id,
            email: c.email,
            name: c.name,
            distance_meters: distance,
        })
        .collect();

        if let Some(limit) = limit {
            users.truncate(limit);
        }

        tracing::debug!(found = users.len(), "located nearby users");
        Ok(users)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DHAKA: Point = Point::new(90.4125, 23.8103);

    #[test]
    fn distance_is_zero_at_same_point() {
        assert!(DHAKA.distance_to(&DHAKA).abs() < 1e-6);
    }

    #[test]
    fn one_degree_of_latitude() {
        let north = Point::new(DHAKA.longitude, DHAKA.latitude + 1.0);
        let d = DHAKA.distance_to(&north);
        // 2 * pi * R / 360
        assert!((d - 111_319.49).abs() < 1.0, "got {d}");
    }

    #[test]
    fn bounding_box_contains_radius() {
        let bbox = BoundingBox::around(DHAKA, DEFAULT_RADIUS_METERS);
        for bearing in 0..36 {
            let theta = f64::from(bearing * 10).to_radians();
            let angular = DEFAULT_RADIUS_METERS / EARTH_RADIUS_METERS;
            let lat1 = DHAKA.latitude.to_radians();
            let lat2 = (lat1.sin() * angular.cos() + lat1.cos() * angular.sin() * theta.cos()).asin();
            let lon2 = DHAKA.longitude.to_radians()
                + (theta.sin() * angular.sin() * lat1.cos()).atan2(angular.cos() - lat1.sin() * lat2.sin());
            let (lat, lon) = (lat2.to_degrees(), lon2.to_degrees());

            assert!((bbox.min_lat..=bbox.max_lat).contains(&lat), "bearing {bearing}");
            assert!((bbox.min_lon..=bbox.max_lon).contains(&lon), "bearing {bearing}");
        }
    }

    #[test]
    fn bounding_box_near_antimeridian_spans_all_longitudes() {
        let bbox = BoundingBox::around(Point::new(179.9, 0.0), DEFAULT_RADIUS_METERS);
        assert_eq!((bbox.min_lon, bbox.max_lon), (-180.0, 180.0));
    }

    #[test]
    fn radius_is_a_closed_interval() {
        let edge = Point::new(DHAKA.longitude + 0.3, DHAKA.latitude);
        let radius = DHAKA.distance_to(&edge);

        let hits = within_radius(DHAKA, radius, [(edge, "edge")]);
        assert_eq!(hits.len(), 1);

        let hits = within_radius(DHAKA, radius - 0.01, [(edge, "edge")]);
        assert!(hits.is_empty());
    }

    #[test]
    fn results_are_sorted_nearest_first() {
        let far = Point::new(DHAKA.longitude + 0.2, DHAKA.latitude);
        let near = Point::new(DHAKA.longitude + 0.1, DHAKA.latitude);
        let hits = within_radius(DHAKA, DEFAULT_RADIUS_METERS, [(far, "far"), (near, "near")]);
        let names: Vec<_> = hits.into_iter().map(|(_, n)| n).collect();
        assert_eq!(names, ["near", "far"]);
    }

    #[test]
    fn rejects_out_of_range_points() {
        assert!(Point::new(181.0, 0.0).validate().is_err());
        assert!(Point::new(0.0, -90.5).validate().is_err());
        assert!(Point::new(f64::NAN, 0.0).validate().is_err());
        assert!(DHAKA.validate().is_ok());
    }
}
