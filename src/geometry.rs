// Copyright 2016 spatial-rs Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Points, boxes, planes, and the fixed octant/face/corner orderings shared
//! across the octree, topology, boundary, and mesh layers.

use nalgebra::Vector3;

/// A 3D point or displacement, in meters.
pub type Vec3 = Vector3<f64>;

/// Axis-aligned bounding box, used for shape/node intersection tests.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    pub fn new(min: Vec3, max: Vec3) -> Aabb {
        Aabb {
            min: Vec3::new(min.x.min(max.x), min.y.min(max.y), min.z.min(max.z)),
            max: Vec3::new(min.x.max(max.x), min.y.max(max.y), min.z.max(max.z)),
        }
    }

    /// Whether this box has collapsed to a single point on every axis. Boxes
    /// that are thin on one or two axes (the common case for line-segment or
    /// planar shapes) are not considered degenerate.
    pub fn is_degenerate(&self) -> bool {
        self.max.x <= self.min.x && self.max.y <= self.min.y && self.max.z <= self.min.z
    }

    pub fn from_points(points: impl IntoIterator<Item = Vec3>) -> Option<Aabb> {
        let mut iter = points.into_iter();
        let first = iter.next()?;
        let mut min = first;
        let mut max = first;
        for p in iter {
            min = min.inf(&p);
            max = max.sup(&p);
        }
        Some(Aabb { min, max })
    }

    pub fn union(&self, other: &Aabb) -> Aabb {
        Aabb {
            min: self.min.inf(&other.min),
            max: self.max.sup(&other.max),
        }
    }

    pub fn contains_point(&self, p: &Vec3) -> bool {
        p.x >= self.min.x
            && p.x <= self.max.x
            && p.y >= self.min.y
            && p.y <= self.max.y
            && p.z >= self.min.z
            && p.z <= self.max.z
    }

    pub fn intersects(&self, other: &Aabb) -> bool {
        self.min.x <= other.max.x
            && self.max.x >= other.min.x
            && self.min.y <= other.max.y
            && self.max.y >= other.min.y
            && self.min.z <= other.max.z
            && self.max.z >= other.min.z
    }

    pub fn contains(&self, other: &Aabb) -> bool {
        self.contains_point(&other.min) && self.contains_point(&other.max)
    }

    /// Box for a cube node given its center and halfwidth.
    pub fn cube(center: Vec3, half_width: f64) -> Aabb {
        let h = Vec3::new(half_width, half_width, half_width);
        Aabb {
            min: center - h,
            max: center + h,
        }
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }
}

/// Nearest point on segment `a..b` to `p`, and its arc-length parameter in `[0,1]`.
pub fn closest_point_on_segment(a: &Vec3, b: &Vec3, p: &Vec3) -> (Vec3, f64) {
    let ab = b - a;
    let len_sq = ab.norm_squared();
    if len_sq <= f64::EPSILON {
        return (*a, 0.0);
    }
    let t = ((p - a).dot(&ab) / len_sq).clamp(0.0, 1.0);
    (a + ab * t, t)
}

/// Slab-method segment/AABB intersection test (Kay-Kajiya).
pub fn segment_intersects_aabb(a: &Vec3, b: &Vec3, aabb: &Aabb) -> bool {
    let d = b - a;
    let mut t_min = 0.0_f64;
    let mut t_max = 1.0_f64;
    for axis in 0..3 {
        let (a0, d0, lo, hi) = (a[axis], d[axis], aabb.min[axis], aabb.max[axis]);
        if d0.abs() < f64::EPSILON {
            if a0 < lo || a0 > hi {
                return false;
            }
            continue;
        }
        let inv = 1.0 / d0;
        let mut t0 = (lo - a0) * inv;
        let mut t1 = (hi - a0) * inv;
        if t0 > t1 {
            std::mem::swap(&mut t0, &mut t1);
        }
        t_min = t_min.max(t0);
        t_max = t_max.min(t1);
        if t_min > t_max {
            return false;
        }
    }
    true
}

/// An unbounded plane, point + unit normal.
#[derive(Debug, Clone, Copy)]
pub struct Plane {
    pub point: Vec3,
    pub normal: Vec3,
}

impl Plane {
    pub fn new(point: Vec3, normal: Vec3) -> Plane {
        Plane {
            point,
            normal: normal.normalize(),
        }
    }

    /// Signed distance from `p` to the plane, positive on the normal side.
    pub fn signed_distance(&self, p: &Vec3) -> f64 {
        self.normal.dot(&(p - self.point))
    }

    pub fn distance(&self, p: &Vec3) -> f64 {
        self.signed_distance(p).abs()
    }

    /// Project `p` onto the plane.
    pub fn project(&self, p: &Vec3) -> Vec3 {
        p - self.normal * self.signed_distance(p)
    }
}

/// One of the six faces of a cube node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Face {
    PosX,
    NegX,
    PosY,
    NegY,
    PosZ,
    NegZ,
}

impl Face {
    pub const ALL: [Face; 6] = [
        Face::PosX,
        Face::NegX,
        Face::PosY,
        Face::NegY,
        Face::PosZ,
        Face::NegZ,
    ];

    /// Axis index this face lies perpendicular to: 0=x, 1=y, 2=z.
    pub fn axis(self) -> usize {
        match self {
            Face::PosX | Face::NegX => 0,
            Face::PosY | Face::NegY => 1,
            Face::PosZ | Face::NegZ => 2,
        }
    }

    /// +1 for the positive-facing side, -1 for the negative-facing side.
    pub fn sign(self) -> f64 {
        match self {
            Face::PosX | Face::PosY | Face::PosZ => 1.0,
            Face::NegX | Face::NegY | Face::NegZ => -1.0,
        }
    }

    pub fn opposite(self) -> Face {
        match self {
            Face::PosX => Face::NegX,
            Face::NegX => Face::PosX,
            Face::PosY => Face::NegY,
            Face::NegY => Face::PosY,
            Face::PosZ => Face::NegZ,
            Face::NegZ => Face::PosZ,
        }
    }

    /// Outward unit normal for this face.
    pub fn normal(self) -> Vec3 {
        let mut v = Vec3::zeros();
        v[self.axis()] = self.sign();
        v
    }
}

/// Octant ordering used for both child layout and corner indexing:
/// 0: +x+y+z, 1: -x+y+z, 2: -x-y+z, 3: +x-y+z, 4..7: the same quadrants with -z.
pub const OCTANT_SIGNS: [(f64, f64, f64); 8] = [
    (1.0, 1.0, 1.0),
    (-1.0, 1.0, 1.0),
    (-1.0, -1.0, 1.0),
    (1.0, -1.0, 1.0),
    (1.0, 1.0, -1.0),
    (-1.0, 1.0, -1.0),
    (-1.0, -1.0, -1.0),
    (1.0, -1.0, -1.0),
);

/// Child/corner offset direction for octant `index`, as a sign vector.
pub fn octant_sign_vec(index: usize) -> Vec3 {
    let (sx, sy, sz) = OCTANT_SIGNS[index];
    Vec3::new(sx, sy, sz)
}

/// Octant index whose sign vector matches the sign of `v` component-wise
/// (zero components are treated as positive, matching domain-growth's
/// reparenting rule of choosing a quadrant for an escaping point).
pub fn octant_of_sign(v: &Vec3) -> usize {
    let sx = if v.x >= 0.0 { 1.0 } else { -1.0 };
    let sy = if v.y >= 0.0 { 1.0 } else { -1.0 };
    let sz = if v.z >= 0.0 { 1.0 } else { -1.0 };
    OCTANT_SIGNS
        .iter()
        .position(|&(x, y, z)| x == sx && y == sy && z == sz)
        .expect("sign vector always matches one octant")
}

/// World-space center of child `index` given the parent's center/halfwidth.
pub fn child_center(parent_center: Vec3, parent_half_width: f64, index: usize) -> Vec3 {
    let child_hw = parent_half_width / 2.0;
    parent_center + octant_sign_vec(index) * child_hw
}

/// World-space position of corner `index` (0..7) of a cube node.
pub fn corner_position(center: Vec3, half_width: f64, index: usize) -> Vec3 {
    center + octant_sign_vec(index) * half_width
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn octant_signs_are_self_consistent() {
        for i in 0..8 {
            let v = octant_sign_vec(i);
            assert_eq!(octant_of_sign(&v), i);
        }
    }

    #[test]
    fn face_normals_are_unit_axis_aligned() {
        for f in Face::ALL {
            let n = f.normal();
            assert_relative_eq!(n.norm(), 1.0, epsilon = 1e-12);
            assert_eq!(f.opposite().normal(), -n);
        }
    }

    #[test]
    fn child_centers_are_offset_by_quarter_width() {
        let parent = Vec3::new(0.0, 0.0, 0.0);
        let c0 = child_center(parent, 2.0, 0);
        assert_relative_eq!(c0, Vec3::new(1.0, 1.0, 1.0));
    }

    #[test]
    fn aabb_cube_is_centered() {
        let b = Aabb::cube(Vec3::new(1.0, 2.0, 3.0), 0.5);
        assert_relative_eq!(b.min, Vec3::new(0.5, 1.5, 2.5));
        assert_relative_eq!(b.max, Vec3::new(1.5, 2.5, 3.5));
    }
}
