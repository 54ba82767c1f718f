use std::sync::RwLock;

use nalgebra::{Matrix3, Matrix4, Vector3, Vector4};

use crate::error::{Result, RigError};
use crate::protocol::{Mat3, Mat4, Vec3};

pub type Point3 = Vector3<f64>;

/// Below this |w| a homogeneous point is treated as lying at infinity.
const MIN_HOMOGENEOUS_W: f64 = 1e-12;

/// Axis flip correcting the vision service's handedness: `diag(-1, -1, 1)`.
pub const DEFAULT_AXIS_REFLECTION: [f64; 3] = [-1.0, -1.0, 1.0];

pub fn to_homogeneous(p: &Point3) -> Vector4<f64> {
    Vector4::new(p.x, p.y, p.z, 1.0)
}

pub fn from_homogeneous(h: &Vector4<f64>) -> Result<Point3> {
    let w = h[3];
    if !w.is_finite() || w.abs() < MIN_HOMOGENEOUS_W {
        return Err(RigError::DegenerateTransform);
    }
    let p = Point3::new(h[0] / w, h[1] / w, h[2] / w);
    if p.iter().all(|v| v.is_finite()) {
        Ok(p)
    } else {
        Err(RigError::DegenerateTransform)
    }
}

pub fn point_from_wire(v: &Vec3) -> Point3 {
    Point3::new(v[0], v[1], v[2])
}

pub fn point_to_wire(p: &Point3) -> Vec3 {
    [p.x, p.y, p.z]
}

pub fn mat3_from_wire(m: &Mat3) -> Matrix3<f64> {
    Matrix3::from_fn(|r, c| m[r][c])
}

pub fn mat3_to_wire(m: &Matrix3<f64>) -> Mat3 {
    std::array::from_fn(|r| std::array::from_fn(|c| m[(r, c)]))
}

/// 4x4 camera→world transform.
///
/// Can only be built from a finite, invertible matrix, so holders never need
/// to re-check it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlignmentMatrix(Matrix4<f64>);

impl AlignmentMatrix {
    pub fn new(m: Matrix4<f64>) -> Result<Self> {
        if !m.iter().all(|v| v.is_finite()) || m.try_inverse().is_none() {
            return Err(RigError::DegenerateTransform);
        }
        Ok(Self(m))
    }

    pub fn identity() -> Self {
        Self(Matrix4::identity())
    }

    pub fn from_wire(m: &Mat4) -> Result<Self> {
        Self::new(Matrix4::from_fn(|r, c| m[r][c]))
    }

    pub fn to_wire(&self) -> Mat4 {
        std::array::from_fn(|r| std::array::from_fn(|c| self.0[(r, c)]))
    }

    /// Parse the operator's JSON form (`[[..4]..4]`, row-major).
    pub fn from_json(text: &str) -> Result<Self> {
        let rows: Vec<Vec<f64>> = serde_json::from_str(text)
            .map_err(|e| RigError::MalformedInput(format!("alignment matrix: {e}")))?;
        if rows.len() != 4 || rows.iter().any(|r| r.len() != 4) {
            return Err(RigError::MalformedInput(
                "alignment matrix must be 4x4".to_string(),
            ));
        }
        Self::new(Matrix4::from_fn(|r, c| rows[r][c]))
            .map_err(|_| RigError::MalformedInput("alignment matrix is not invertible".to_string()))
    }

    pub fn matrix(&self) -> &Matrix4<f64> {
        &self.0
    }

    /// Rotation/scale block; translation does not apply to orientations.
    pub fn linear(&self) -> Matrix3<f64> {
        self.0.fixed_view::<3, 3>(0, 0).into_owned()
    }
}

impl Default for AlignmentMatrix {
    fn default() -> Self {
        Self::identity()
    }
}

/// Shift `alignment` so that the world point `reference` maps to the origin.
///
/// `reference` is a point already expressed in world space under
/// `alignment`; the result is `T(-reference) * alignment`.
pub fn translated_to_origin(reference: &Point3, alignment: &AlignmentMatrix) -> Result<AlignmentMatrix> {
    let mut shift = Matrix4::identity();
    shift[(0, 3)] = -reference.x;
    shift[(1, 3)] = -reference.y;
    shift[(2, 3)] = -reference.z;
    AlignmentMatrix::new(shift * alignment.matrix())
}

/// Located object after normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct LocatedObject {
    pub position: Point3,
    pub orientation: Matrix3<f64>,
    pub error: f64,
}

/// Camera-relative → world conversion under the current alignment.
///
/// The alignment sits behind a lock and is copied out on every call, so a
/// reader never sees a half-written matrix.
pub struct CoordinateTransform {
    reflection: Matrix3<f64>,
    alignment: RwLock<AlignmentMatrix>,
}

impl CoordinateTransform {
    pub fn new() -> Self {
        Self::with_reflection(DEFAULT_AXIS_REFLECTION)
    }

    /// `diagonal` entries must be ±1 (or at least non-zero).
    pub fn with_reflection(diagonal: [f64; 3]) -> Self {
        Self {
            reflection: Matrix3::from_diagonal(&Vector3::from(diagonal)),
            alignment: RwLock::new(AlignmentMatrix::identity()),
        }
    }

    pub fn alignment(&self) -> AlignmentMatrix {
        match self.alignment.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn set_alignment(&self, alignment: AlignmentMatrix) {
        let mut guard = match self.alignment.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = alignment;
    }

    /// reflect → lift → align → project
    pub fn to_world(&self, p: &Point3) -> Result<Point3> {
        Self::apply(&self.reflection, &self.alignment(), p)
    }

    fn apply(reflection: &Matrix3<f64>, alignment: &AlignmentMatrix, p: &Point3) -> Result<Point3> {
        let reflected = reflection * p;
        from_homogeneous(&(alignment.matrix() * to_homogeneous(&reflected)))
    }

    /// Inverse of `to_world` under the current alignment.
    pub fn to_camera(&self, world: &Point3) -> Result<Point3> {
        let alignment = self.alignment();
        let inverse = alignment
            .matrix()
            .try_inverse()
            .ok_or(RigError::DegenerateTransform)?;
        let reflection_inv = self
            .reflection
            .try_inverse()
            .ok_or(RigError::DegenerateTransform)?;
        let aligned = from_homogeneous(&(inverse * to_homogeneous(world)))?;
        Ok(reflection_inv * aligned)
    }

    pub fn orientation_to_world(&self, rotation: &Matrix3<f64>) -> Matrix3<f64> {
        self.alignment().linear() * self.reflection * rotation
    }

    /// Convert a batch under a single alignment snapshot.
    pub fn batch(&self) -> TransformSnapshot<'_> {
        TransformSnapshot {
            reflection: &self.reflection,
            alignment: self.alignment(),
        }
    }
}

impl Default for CoordinateTransform {
    fn default() -> Self {
        Self::new()
    }
}

/// Frozen view of a `CoordinateTransform` used to normalize one whole frame.
pub struct TransformSnapshot<'a> {
    reflection: &'a Matrix3<f64>,
    alignment: AlignmentMatrix,
}

impl TransformSnapshot<'_> {
    pub fn to_world(&self, p: &Point3) -> Result<Point3> {
        CoordinateTransform::apply(self.reflection, &self.alignment, p)
    }

    pub fn locate(&self, position: &Point3, orientation: &Matrix3<f64>, error: f64) -> Result<LocatedObject> {
        Ok(LocatedObject {
            position: self.to_world(position)?,
            orientation: self.alignment.linear() * self.reflection * orientation,
            error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn translation(x: f64, y: f64, z: f64) -> Matrix4<f64> {
        let mut m = Matrix4::identity();
        m[(0, 3)] = x;
        m[(1, 3)] = y;
        m[(2, 3)] = z;
        m
    }

    #[test]
    fn test_identity_alignment_only_reflects() {
        let t = CoordinateTransform::new();
        let cases = [
            (Point3::new(1.0, 0.0, 0.0), Point3::new(-1.0, 0.0, 0.0)),
            (Point3::new(0.0, 1.0, 0.0), Point3::new(0.0, -1.0, 0.0)),
            (Point3::new(0.0, 0.0, 1.0), Point3::new(0.0, 0.0, 1.0)),
        ];
        for (input, expected) in cases {
            assert_relative_eq!(t.to_world(&input).unwrap(), expected);
        }
    }

    #[test]
    fn test_alignment_applies_after_reflection() {
        let t = CoordinateTransform::new();
        t.set_alignment(AlignmentMatrix::new(translation(0.0, 0.0, 2.0)).unwrap());
        let world = t.to_world(&Point3::new(1.0, 2.0, 3.0)).unwrap();
        assert_relative_eq!(world, Point3::new(-1.0, -2.0, 5.0));
    }

    #[test]
    fn test_round_trip() {
        let t = CoordinateTransform::new();
        let rot = nalgebra::Rotation3::from_euler_angles(0.3, -0.2, 1.1);
        let mut m = translation(0.5, -1.0, 2.0);
        m.fixed_view_mut::<3, 3>(0, 0).copy_from(&(rot.matrix() * 2.5));
        t.set_alignment(AlignmentMatrix::new(m).unwrap());

        let p = Point3::new(0.7, -3.1, 4.2);
        let back = t.to_camera(&t.to_world(&p).unwrap()).unwrap();
        assert_relative_eq!(back, p, epsilon = 1e-9);
    }

    #[test]
    fn test_singular_alignment_rejected() {
        let mut m = Matrix4::identity();
        m[(2, 2)] = 0.0;
        assert_eq!(AlignmentMatrix::new(m), Err(RigError::DegenerateTransform));

        let mut m = Matrix4::identity();
        m[(0, 0)] = f64::NAN;
        assert_eq!(AlignmentMatrix::new(m), Err(RigError::DegenerateTransform));
    }

    #[test]
    fn test_zero_w_is_degenerate() {
        // invertible, but maps this particular point to w = 0
        let mut m = Matrix4::identity();
        m[(3, 0)] = 1.0;
        let t = CoordinateTransform::new();
        t.set_alignment(AlignmentMatrix::new(m).unwrap());
        // reflected x = -1 → w = 0
        let result = t.to_world(&Point3::new(1.0, 0.0, 0.0));
        assert_eq!(result, Err(RigError::DegenerateTransform));
    }

    #[test]
    fn test_orientation_ignores_translation() {
        let t = CoordinateTransform::new();
        t.set_alignment(AlignmentMatrix::new(translation(5.0, 5.0, 5.0)).unwrap());
        let r = t.orientation_to_world(&Matrix3::identity());
        assert_relative_eq!(r, Matrix3::from_diagonal(&Vector3::new(-1.0, -1.0, 1.0)));
    }

    #[test]
    fn test_translated_to_origin() {
        let t = CoordinateTransform::new();
        let camera_point = Point3::new(2.0, 3.0, 4.0);
        let world = t.to_world(&camera_point).unwrap();
        t.set_alignment(translated_to_origin(&world, &t.alignment()).unwrap());
        assert_relative_eq!(t.to_world(&camera_point).unwrap(), Point3::zeros(), epsilon = 1e-12);
    }

    #[test]
    fn test_alignment_from_json() {
        let m = AlignmentMatrix::from_json("[[1,0,0,1],[0,1,0,2],[0,0,1,3],[0,0,0,1]]").unwrap();
        assert_eq!(m.to_wire()[1][3], 2.0);

        assert!(matches!(
            AlignmentMatrix::from_json("[[1,0,0],[0,1,0],[0,0,1]]"),
            Err(RigError::MalformedInput(_))
        ));
        assert!(matches!(
            AlignmentMatrix::from_json("not json"),
            Err(RigError::MalformedInput(_))
        ));
    }
}
