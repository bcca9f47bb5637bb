//! Pinhole camera model used by the in-memory scene.
//!
//! Cameras look down their local -Z axis. The projection maps camera-space
//! points to normalized device coordinates where the film back spans [-1, 1]
//! on both axes, so marker positions are expressed in the same space.
//!
//! A camera may carry a [`ClassicDistortion`] lens. Observed marker positions
//! are then distorted image coordinates, and are undistorted before they are
//! compared with projected bundles.

use nalgebra::{
    Isometry3, Matrix2, Matrix4, Point2, Point3, Translation3, UnitQuaternion, Vector3,
};
use serde::{Deserialize, Serialize};

/// Default near clipping plane distance.
pub const DEFAULT_NEAR_CLIP: f64 = 0.1;

/// Default far clipping plane distance.
pub const DEFAULT_FAR_CLIP: f64 = 10_000.0;

const DISTORT_MAX_ITERATIONS: usize = 20;
const DISTORT_TOLERANCE: f64 = 1e-12;

/// The 3DE4 classic lens model.
///
/// The polynomial maps distorted to undistorted lens coordinates, measured
/// from the lens centre and scaled so the film back corner lies at radius one:
///
/// ```text
/// xu = x (1 + cxx x² + cxy y² + cxxx x⁴ + cxxy x²y² + cxyy y⁴)
/// yu = y (1 + cyx x² + cyy y² + cyxx x⁴ + cyyx x²y² + cyyy y⁴)
/// ```
///
/// Distorting has no closed form and is solved with Newton's method.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassicDistortion {
    pub distortion: f64,
    pub anamorphic_squeeze: f64,
    pub curvature_x: f64,
    pub curvature_y: f64,
    pub quartic_distortion: f64,
}

impl Default for ClassicDistortion {
    fn default() -> Self {
        Self {
            distortion: 0.0,
            anamorphic_squeeze: 1.0,
            curvature_x: 0.0,
            curvature_y: 0.0,
            quartic_distortion: 0.0,
        }
    }
}

impl ClassicDistortion {
    pub fn new(distortion: f64) -> Self {
        Self {
            distortion,
            ..Self::default()
        }
    }

    /// Whether the lens leaves every point where it is.
    pub fn is_identity(&self) -> bool {
        self.distortion == 0.0
            && self.curvature_x == 0.0
            && self.curvature_y == 0.0
            && self.quartic_distortion == 0.0
    }

    /// Whether the coefficients can be evaluated at all.
    pub fn is_valid(&self) -> bool {
        self.anamorphic_squeeze.is_finite()
            && self.anamorphic_squeeze > 0.0
            && self.distortion.is_finite()
            && self.curvature_x.is_finite()
            && self.curvature_y.is_finite()
            && self.quartic_distortion.is_finite()
    }

    /// Coefficients of the x² y² x⁴ x²y² y⁴ terms for the x and y polynomials.
    fn coefficients(&self) -> ([f64; 5], [f64; 5]) {
        let sq = self.anamorphic_squeeze;
        let ld = self.distortion;
        let qu = self.quartic_distortion;
        (
            [
                ld / sq,
                (ld + self.curvature_x) / sq,
                qu / sq,
                2.0 * qu / sq,
                qu / sq,
            ],
            [ld + self.curvature_y, ld, qu, 2.0 * qu, qu],
        )
    }

    /// Undistorted lens coordinates of a distorted point.
    pub fn undistort(&self, distorted: &Point2<f64>) -> Point2<f64> {
        let (cx, cy) = self.coefficients();
        let (x2, y2) = (distorted.x * distorted.x, distorted.y * distorted.y);
        let terms = [x2, y2, x2 * x2, x2 * y2, y2 * y2];
        let scale = |c: &[f64; 5]| 1.0 + c.iter().zip(&terms).map(|(c, t)| c * t).sum::<f64>();
        Point2::new(distorted.x * scale(&cx), distorted.y * scale(&cy))
    }

    /// Distorted lens coordinates of an undistorted point.
    pub fn distort(&self, undistorted: &Point2<f64>) -> Point2<f64> {
        let (a, b) = self.coefficients();
        let mut point = *undistorted;
        for _ in 0..DISTORT_MAX_ITERATIONS {
            let residual = self.undistort(&point) - undistorted;
            if residual.norm() < DISTORT_TOLERANCE {
                break;
            }
            let (x, y) = (point.x, point.y);
            let (x2, y2) = (x * x, y * y);
            #[rustfmt::skip]
            let jacobian = Matrix2::new(
                1.0 + 3.0 * a[0] * x2 + a[1] * y2 + 5.0 * a[2] * x2 * x2
                    + 3.0 * a[3] * x2 * y2 + a[4] * y2 * y2,
                x * (2.0 * a[1] * y + 2.0 * a[3] * x2 * y + 4.0 * a[4] * y2 * y),
                y * (2.0 * b[0] * x + 4.0 * b[2] * x2 * x + 2.0 * b[3] * x * y2),
                1.0 + b[0] * x2 + 3.0 * b[1] * y2 + b[2] * x2 * x2
                    + 3.0 * b[3] * x2 * y2 + 5.0 * b[4] * y2 * y2,
            );
            let Some(inverse) = jacobian.try_inverse() else {
                break;
            };
            point -= inverse * residual;
        }
        point
    }
}

/// Intrinsics of a pinhole camera. Focal length and film back share units (mm).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PinholeModel {
    pub focal_length: f64,
    pub film_back_width: f64,
    pub film_back_height: f64,
    pub near_clip: f64,
    pub far_clip: f64,
    pub distortion: Option<ClassicDistortion>,
}

impl PinholeModel {
    pub fn new(focal_length: f64, film_back_width: f64, film_back_height: f64) -> Self {
        Self {
            focal_length,
            film_back_width,
            film_back_height,
            near_clip: DEFAULT_NEAR_CLIP,
            far_clip: DEFAULT_FAR_CLIP,
            distortion: None,
        }
    }

    pub fn with_clip_planes(mut self, near_clip: f64, far_clip: f64) -> Self {
        self.near_clip = near_clip;
        self.far_clip = far_clip;
        self
    }

    pub fn with_distortion(mut self, distortion: ClassicDistortion) -> Self {
        self.distortion = Some(distortion);
        self
    }

    /// Per-axis scale from normalized device to lens coordinates.
    fn lens_scale(&self) -> (f64, f64) {
        let half_diagonal = 0.5 * self.film_back_width.hypot(self.film_back_height);
        (
            0.5 * self.film_back_width / half_diagonal,
            0.5 * self.film_back_height / half_diagonal,
        )
    }

    fn active_distortion(&self) -> Option<&ClassicDistortion> {
        self.distortion.as_ref().filter(|d| !d.is_identity())
    }

    /// Remove the lens distortion from an observed image coordinate.
    pub fn undistort_image(&self, image: &Point2<f64>) -> Point2<f64> {
        let Some(distortion) = self.active_distortion() else {
            return *image;
        };
        let (sx, sy) = self.lens_scale();
        let lens = distortion.undistort(&Point2::new(image.x * sx, image.y * sy));
        Point2::new(lens.x / sx, lens.y / sy)
    }

    /// Apply the lens distortion to an ideal pinhole image coordinate.
    pub fn distort_image(&self, image: &Point2<f64>) -> Point2<f64> {
        let Some(distortion) = self.active_distortion() else {
            return *image;
        };
        let (sx, sy) = self.lens_scale();
        let lens = distortion.distort(&Point2::new(image.x * sx, image.y * sy));
        Point2::new(lens.x / sx, lens.y / sy)
    }

    /// Perspective projection from camera space to homogeneous clip space.
    pub fn projection_matrix(&self) -> Matrix4<f64> {
        let sx = 2.0 * self.focal_length / self.film_back_width;
        let sy = 2.0 * self.focal_length / self.film_back_height;
        let (near, far) = (self.near_clip, self.far_clip);
        let a = -(far + near) / (far - near);
        let b = -2.0 * far * near / (far - near);

        #[rustfmt::skip]
        let projection = Matrix4::new(
            sx,  0.0,  0.0, 0.0,
            0.0, sy,   0.0, 0.0,
            0.0, 0.0,  a,   b,
            0.0, 0.0, -1.0, 0.0,
        );
        projection
    }

    /// Camera-space point on the plane at unit depth that projects to `image`.
    pub fn film_point(&self, image: &Point2<f64>) -> Point3<f64> {
        Point3::new(
            image.x * 0.5 * self.film_back_width / self.focal_length,
            image.y * 0.5 * self.film_back_height / self.focal_length,
            -1.0,
        )
    }
}

/// Camera-to-world transform from a translation and XYZ-order euler rotation in degrees.
pub fn transform_from_trs(
    translate: &Vector3<f64>,
    rotate_degrees: &Vector3<f64>,
) -> Isometry3<f64> {
    let rotation = UnitQuaternion::from_euler_angles(
        rotate_degrees.x.to_radians(),
        rotate_degrees.y.to_radians(),
        rotate_degrees.z.to_radians(),
    );
    Isometry3::from_parts(Translation3::from(*translate), rotation)
}

/// World-to-image matrix for a camera placed at `camera_to_world`.
pub fn world_projection_matrix(
    model: &PinholeModel,
    camera_to_world: &Isometry3<f64>,
) -> Matrix4<f64> {
    model.projection_matrix() * camera_to_world.inverse().to_homogeneous()
}
