//! Per-frame view input: camera position, projection and culling frustum.

use glam::{DMat4, DVec3};

use crate::bounds::{BoundingVolume, OrientedBoundingBox};

/// A frustum for culling tiles based on their bounding volumes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Frustum {
    /// Frustum planes (left, right, bottom, top, near, far).
    /// Each plane is represented as (normal, distance).
    planes: [(DVec3, f64); 6],
}

impl Frustum {
    /// Create a frustum from a view-projection matrix.
    #[must_use]
    pub fn from_matrix(vp: DMat4) -> Self {
        let m = vp.to_cols_array_2d();
        let row = |i: usize| (m[0][i], m[1][i], m[2][i], m[3][i]);
        let (x, y, z, w) = (row(0), row(1), row(2), row(3));

        let plane = |a: (f64, f64, f64, f64), sign: f64| {
            Self::normalize_plane(
                w.0 + sign * a.0,
                w.1 + sign * a.1,
                w.2 + sign * a.2,
                w.3 + sign * a.3,
            )
        };

        Self {
            planes: [
                plane(x, 1.0),
                plane(x, -1.0),
                plane(y, 1.0),
                plane(y, -1.0),
                plane(z, 1.0),
                plane(z, -1.0),
            ],
        }
    }

    fn normalize_plane(a: f64, b: f64, c: f64, d: f64) -> (DVec3, f64) {
        let normal = DVec3::new(a, b, c);
        let length = normal.length();
        if length > 0.0 {
            (normal / length, d / length)
        } else {
            (DVec3::ZERO, 0.0)
        }
    }

    /// Test if an oriented bounding box intersects the frustum.
    #[must_use]
    pub fn intersects_obb(&self, obb: &OrientedBoundingBox) -> bool {
        self.planes.iter().all(|&(normal, distance)| {
            // Project the box onto the plane normal.
            let r = obb.extents.x * obb.orientation.col(0).dot(normal).abs()
                + obb.extents.y * obb.orientation.col(1).dot(normal).abs()
                + obb.extents.z * obb.orientation.col(2).dot(normal).abs();
            normal.dot(obb.center) + distance >= -r
        })
    }

    /// Test if a bounding volume intersects the frustum.
    #[must_use]
    pub fn intersects(&self, volume: &BoundingVolume) -> bool {
        match volume {
            BoundingVolume::Box(obb) => self.intersects_obb(obb),
            BoundingVolume::Sphere { center, radius } => self
                .planes
                .iter()
                .all(|&(normal, distance)| normal.dot(*center) + distance >= -radius),
        }
    }
}

/// Camera state supplied by the caller every tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct View {
    /// Camera position in world space.
    pub position: DVec3,
    /// Vertical field of view in radians.
    pub fov_y: f64,
    /// Viewport width in pixels.
    pub viewport_width: f64,
    /// Viewport height in pixels.
    pub viewport_height: f64,
    /// Optional culling frustum. Without one every tile is considered in view.
    pub frustum: Option<Frustum>,
}

impl View {
    /// Create a view with no frustum culling.
    #[must_use]
    pub fn new(position: DVec3, fov_y: f64, viewport_width: f64, viewport_height: f64) -> Self {
        Self {
            position,
            fov_y,
            viewport_width,
            viewport_height,
            frustum: None,
        }
    }

    /// Create a view from a perspective camera looking at `target`, with the
    /// culling frustum derived from the same parameters.
    #[must_use]
    pub fn looking_at(
        position: DVec3,
        target: DVec3,
        up: DVec3,
        fov_y: f64,
        (viewport_width, viewport_height): (f64, f64),
        (near, far): (f64, f64),
    ) -> Self {
        let aspect = if viewport_height > 0.0 {
            viewport_width / viewport_height
        } else {
            1.0
        };
        let view = DMat4::look_at_rh(position, target, up);
        let proj = DMat4::perspective_rh(fov_y, aspect, near, far);
        Self {
            frustum: Some(Frustum::from_matrix(proj * view)),
            ..Self::new(position, fov_y, viewport_width, viewport_height)
        }
    }

    /// Scale the viewport, as a renderer does when its resolution scale changes.
    #[must_use]
    pub fn with_resolution_scale(mut self, scale: f64) -> Self {
        self.viewport_width *= scale;
        self.viewport_height *= scale;
        self
    }

    /// Pixels covered by one meter at distance 1 from the camera.
    #[must_use]
    pub fn pixels_per_meter(&self) -> f64 {
        // pixels_per_meter = screen_height / (2 * tan(fov_y / 2))
        self.viewport_height / (2.0 * (self.fov_y / 2.0).tan())
    }

    /// Screen-space error in pixels of a tile with `geometric_error` seen from
    /// `distance`. A camera inside the volume sees unbounded error.
    #[must_use]
    pub fn screen_space_error(&self, geometric_error: f64, distance: f64) -> f64 {
        if distance <= 0.0 {
            return if geometric_error > 0.0 {
                f64::INFINITY
            } else {
                0.0
            };
        }
        geometric_error * self.pixels_per_meter() / distance
    }

    /// Whether a volume is inside the view, or `true` without a frustum.
    #[must_use]
    pub fn contains(&self, volume: &BoundingVolume) -> bool {
        self.frustum.is_none_or(|f| f.intersects(volume))
    }
}
