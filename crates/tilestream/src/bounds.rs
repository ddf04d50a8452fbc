//! Bounding volumes used for distance, error and culling computations.
//!
//! Manifest volumes come in three shapes (`box`, `sphere`, `region`). All of
//! them are resolved into world space when the tree is built, so the per-frame
//! traversal only ever deals with [`BoundingVolume::Box`] and
//! [`BoundingVolume::Sphere`].

use glam::{DMat3, DMat4, DVec3};

/// WGS84 semi-major axis in meters.
const WGS84_A: f64 = 6_378_137.0;
/// WGS84 first eccentricity squared.
const WGS84_E2: f64 = 6.694_379_990_14e-3;

/// An oriented bounding box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrientedBoundingBox {
    /// Center in world space.
    pub center: DVec3,
    /// Half-lengths along each local axis.
    pub extents: DVec3,
    /// Orthonormal local axes, one per column.
    pub orientation: DMat3,
}

impl OrientedBoundingBox {
    /// Build a box from a center and three half-axis vectors, as stored in
    /// a manifest `box` array.
    #[must_use]
    pub fn from_half_axes(center: DVec3, x: DVec3, y: DVec3, z: DVec3) -> Self {
        let extents = DVec3::new(x.length(), y.length(), z.length());
        let mut axes = [x, y, z];

        // Flat boxes are common (terrain tiles). Rebuild a missing axis from
        // the other two so the orientation stays orthonormal.
        for i in 0..3 {
            if extents[i] <= f64::EPSILON {
                let a = axes[(i + 1) % 3];
                let b = axes[(i + 2) % 3];
                let cross = a.cross(b);
                axes[i] = if cross.length_squared() > 0.0 {
                    cross
                } else {
                    [DVec3::X, DVec3::Y, DVec3::Z][i]
                };
            }
        }

        let orientation = DMat3::from_cols(
            axes[0].normalize_or_zero(),
            axes[1].normalize_or_zero(),
            axes[2].normalize_or_zero(),
        );

        Self {
            center,
            extents,
            orientation,
        }
    }

    /// Distance from a point to the box surface, or 0 if inside.
    #[must_use]
    pub fn distance_to_point(&self, point: DVec3) -> f64 {
        let offset = point - self.center;
        let mut sq = 0.0;
        for i in 0..3 {
            let d = offset.dot(self.orientation.col(i)).abs();
            let excess = (d - self.extents[i]).max(0.0);
            sq += excess * excess;
        }
        sq.sqrt()
    }

    fn half_axis(&self, i: usize) -> DVec3 {
        self.orientation.col(i) * self.extents[i]
    }

    fn transformed(&self, transform: &DMat4) -> Self {
        Self::from_half_axes(
            transform.transform_point3(self.center),
            transform.transform_vector3(self.half_axis(0)),
            transform.transform_vector3(self.half_axis(1)),
            transform.transform_vector3(self.half_axis(2)),
        )
    }
}

/// An axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    /// Minimum corner.
    pub min: DVec3,
    /// Maximum corner.
    pub max: DVec3,
}

impl Aabb {
    /// Create a box from its corners.
    #[must_use]
    pub fn new(min: DVec3, max: DVec3) -> Self {
        Self { min, max }
    }

    /// Smallest box containing every point, or `None` for an empty set.
    pub fn from_points(points: impl IntoIterator<Item = DVec3>) -> Option<Self> {
        points.into_iter().fold(None, |acc, p| match acc {
            None => Some(Self::new(p, p)),
            Some(b) => Some(Self::new(b.min.min(p), b.max.max(p))),
        })
    }

    /// Grow this box to contain `other`.
    #[must_use]
    pub fn union(self, other: Self) -> Self {
        Self::new(self.min.min(other.min), self.max.max(other.max))
    }

    /// Center of the box.
    #[must_use]
    pub fn center(&self) -> DVec3 {
        (self.min + self.max) * 0.5
    }

    /// Full size along each axis.
    #[must_use]
    pub fn size(&self) -> DVec3 {
        self.max - self.min
    }
}

/// A world-space bounding volume attached to a tile.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BoundingVolume {
    /// Oriented box.
    Box(OrientedBoundingBox),
    /// Sphere.
    Sphere {
        /// Center in world space.
        center: DVec3,
        /// Radius in meters.
        radius: f64,
    },
}

impl BoundingVolume {
    /// Parse a manifest `box` array: center followed by three half-axes.
    #[must_use]
    pub fn from_box_array(v: &[f64; 12]) -> Self {
        BoundingVolume::Box(OrientedBoundingBox::from_half_axes(
            DVec3::new(v[0], v[1], v[2]),
            DVec3::new(v[3], v[4], v[5]),
            DVec3::new(v[6], v[7], v[8]),
            DVec3::new(v[9], v[10], v[11]),
        ))
    }

    /// Parse a manifest `sphere` array: center followed by radius.
    #[must_use]
    pub fn from_sphere_array(v: &[f64; 4]) -> Self {
        BoundingVolume::Sphere {
            center: DVec3::new(v[0], v[1], v[2]),
            radius: v[3].abs(),
        }
    }

    /// Approximate a geographic region `[west, south, east, north, min_h, max_h]`
    /// (radians, meters above the WGS84 ellipsoid) with an ECEF bounding sphere.
    #[must_use]
    pub fn from_region_array(v: &[f64; 6]) -> Self {
        let [west, south, east, north, min_h, max_h] = *v;
        let lons = [west, (west + east) * 0.5, east];
        let lats = [south, (south + north) * 0.5, north];

        let mut points = Vec::with_capacity(18);
        for &lat in &lats {
            for &lon in &lons {
                for &h in &[min_h, max_h] {
                    points.push(geodetic_to_ecef(lat, lon, h));
                }
            }
        }

        let center = Aabb::from_points(points.iter().copied()).map_or(DVec3::ZERO, |b| b.center());
        let radius = points
            .iter()
            .map(|p| p.distance(center))
            .fold(0.0_f64, f64::max);
        BoundingVolume::Sphere { center, radius }
    }

    /// Apply an affine transform.
    #[must_use]
    pub fn transformed(&self, transform: &DMat4) -> Self {
        match self {
            BoundingVolume::Box(obb) => BoundingVolume::Box(obb.transformed(transform)),
            BoundingVolume::Sphere { center, radius } => {
                let scale = transform
                    .x_axis
                    .truncate()
                    .length()
                    .max(transform.y_axis.truncate().length())
                    .max(transform.z_axis.truncate().length());
                BoundingVolume::Sphere {
                    center: transform.transform_point3(*center),
                    radius: radius * scale,
                }
            }
        }
    }

    /// Center of the volume.
    #[must_use]
    pub fn center(&self) -> DVec3 {
        match self {
            BoundingVolume::Box(obb) => obb.center,
            BoundingVolume::Sphere { center, .. } => *center,
        }
    }

    /// Distance from a point to the volume, or 0 if the point is inside.
    #[must_use]
    pub fn distance_to_point(&self, point: DVec3) -> f64 {
        match self {
            BoundingVolume::Box(obb) => obb.distance_to_point(point),
            BoundingVolume::Sphere { center, radius } => (point.distance(*center) - radius).max(0.0),
        }
    }

    /// Axis-aligned box enclosing the volume.
    #[must_use]
    pub fn aabb(&self) -> Aabb {
        match self {
            BoundingVolume::Box(obb) => {
                let half = (0..3).fold(DVec3::ZERO, |acc, i| acc + obb.half_axis(i).abs());
                Aabb::new(obb.center - half, obb.center + half)
            }
            BoundingVolume::Sphere { center, radius } => {
                Aabb::new(*center - DVec3::splat(*radius), *center + DVec3::splat(*radius))
            }
        }
    }
}

/// Convert geodetic coordinates (radians, meters) to WGS84 ECEF.
fn geodetic_to_ecef(lat: f64, lon: f64, height: f64) -> DVec3 {
    let sin_lat = lat.sin();
    let n = WGS84_A / (1.0 - WGS84_E2 * sin_lat * sin_lat).sqrt();
    DVec3::new(
        (n + height) * lat.cos() * lon.cos(),
        (n + height) * lat.cos() * lon.sin(),
        (n * (1.0 - WGS84_E2) + height) * sin_lat,
    )
}
