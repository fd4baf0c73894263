// Copyright 2016 spatial-rs Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Shapes that can be carved into the tree. A closed, tagged set rather
//! than open dynamic dispatch (§9): line-segment ray, wedge, extruded
//! polygon, bounding box, and plane.

use crate::error::{Error, Result};
use crate::geometry::{closest_point_on_segment, segment_intersects_aabb, Aabb, Vec3};
use crate::payload::LeafPayload;

/// Result of testing a shape against a node's box.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intersection {
    Disjoint,
    Inside,
    Straddles,
}

/// Capability set every shape kind implements: a conservative AABB, a
/// per-node-box intersection test, and a leaf-merge contribution.
pub trait ShapeGeometry {
    fn aabb(&self) -> Aabb;
    fn test(&self, node_box: &Aabb) -> Intersection;
    fn apply_to_leaf(&self, payload: &mut LeafPayload, node_box: &Aabb);
}

/// Steepness and placement of the occupancy transition band near the ray's
/// far endpoint B (§8's open question on endpoint handling is pinned here:
/// a logistic rise occupying the last `1 - BAND_CENTER` of the ray).
const BAND_CENTER: f64 = 0.9;
const BAND_STEEPNESS: f64 = 30.0;

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Occupancy and its derivative-shaped "band weight" at arc-length `t` along
/// a carved ray, under the pinned parameterization.
fn ray_occupancy(t: f64) -> (f64, f64) {
    let x = BAND_STEEPNESS * (t - BAND_CENTER);
    let occ = sigmoid(x);
    let band = 4.0 * occ * (1.0 - occ);
    (occ, band)
}

/// A weighted ray from a range sensor: empty along most of its length,
/// rising to solid in a narrow band near `end` (§4.1's ray-carve shape).
#[derive(Debug, Clone, Copy)]
pub struct RaySegment {
    pub start: Vec3,
    pub end: Vec3,
    pub weight: f64,
    pub surface_prior: f64,
    pub planar_prior: f64,
    pub corner_prior: f64,
}

impl RaySegment {
    pub fn new(
        start: Vec3,
        end: Vec3,
        weight: f64,
        surface_prior: f64,
        planar_prior: f64,
        corner_prior: f64,
    ) -> Result<RaySegment> {
        if (end - start).norm() <= f64::EPSILON {
            return Err(Error::InvalidInput(
                "ray segment start and end coincide".into(),
            ));
        }
        if !(weight > 0.0 && weight.is_finite()) {
            return Err(Error::InvalidInput(format!(
                "ray weight must be positive and finite, got {weight}"
            )));
        }
        for (name, prior) in [
            ("surface_prior", surface_prior),
            ("planar_prior", planar_prior),
            ("corner_prior", corner_prior),
        ] {
            if !(0.0..=1.0).contains(&prior) {
                return Err(Error::InvalidInput(format!(
                    "{name} must be in [0,1], got {prior}"
                )));
            }
        }
        Ok(RaySegment {
            start,
            end,
            weight,
            surface_prior,
            planar_prior,
            corner_prior,
        })
    }
}

impl ShapeGeometry for RaySegment {
    fn aabb(&self) -> Aabb {
        Aabb::from_points([self.start, self.end]).expect("two points always form a box")
    }

    fn test(&self, node_box: &Aabb) -> Intersection {
        if segment_intersects_aabb(&self.start, &self.end, node_box) {
            Intersection::Straddles
        } else {
            Intersection::Disjoint
        }
    }

    fn apply_to_leaf(&self, payload: &mut LeafPayload, node_box: &Aabb) {
        let (_, t) = closest_point_on_segment(&self.start, &self.end, &node_box.center());
        let (occ, band) = ray_occupancy(t);
        payload.count += 1;
        payload.total_weight += self.weight;
        payload.prob_sum += self.weight * occ;
        payload.prob_sum_sq += self.weight * occ * occ;
        payload.surface_sum += self.weight * band * self.surface_prior;
        payload.planar_sum += self.weight * band * self.planar_prior;
        payload.corner_sum += self.weight * band * self.corner_prior;
    }
}

/// A flat probabilistic envelope between two scan points observed across two
/// frames: the fan of segments from `apex` to every point on `target_a ..
/// target_b` (§4.2). Carries the same priors as a ray.
#[derive(Debug, Clone, Copy)]
pub struct Wedge {
    pub apex: Vec3,
    pub target_a: Vec3,
    pub target_b: Vec3,
    pub weight: f64,
    pub surface_prior: f64,
    pub planar_prior: f64,
    pub corner_prior: f64,
}

impl Wedge {
    pub fn new(
        apex: Vec3,
        target_a: Vec3,
        target_b: Vec3,
        weight: f64,
        surface_prior: f64,
        planar_prior: f64,
        corner_prior: f64,
    ) -> Result<Wedge> {
        if (target_a - apex).norm() <= f64::EPSILON || (target_b - apex).norm() <= f64::EPSILON {
            return Err(Error::InvalidInput(
                "wedge apex coincides with a target point".into(),
            ));
        }
        if !(weight > 0.0 && weight.is_finite()) {
            return Err(Error::InvalidInput(format!(
                "wedge weight must be positive and finite, got {weight}"
            )));
        }
        Ok(Wedge {
            apex,
            target_a,
            target_b,
            weight,
            surface_prior,
            planar_prior,
            corner_prior,
        })
    }

    /// The representative ray for a leaf: from the apex through whichever
    /// point of the `target_a..target_b` edge is nearest the leaf center.
    fn representative_ray(&self, node_center: &Vec3) -> (Vec3, Vec3) {
        let (near_target, _) = closest_point_on_segment(&self.target_a, &self.target_b, node_center);
        (self.apex, near_target)
    }
}

impl ShapeGeometry for Wedge {
    fn aabb(&self) -> Aabb {
        Aabb::from_points([self.apex, self.target_a, self.target_b])
            .expect("three points always form a box")
    }

    fn test(&self, node_box: &Aabb) -> Intersection {
        // A zero-thickness sheet has no volume, so it is never wholly
        // inside a node box; conservatively flag any box whose extent
        // touches the wedge's two bounding edges.
        let edge_a = segment_intersects_aabb(&self.apex, &self.target_a, node_box);
        let edge_b = segment_intersects_aabb(&self.apex, &self.target_b, node_box);
        let mid = (self.target_a + self.target_b) * 0.5;
        let edge_mid = segment_intersects_aabb(&self.apex, &mid, node_box);
        if edge_a || edge_b || edge_mid {
            Intersection::Straddles
        } else {
            Intersection::Disjoint
        }
    }

    fn apply_to_leaf(&self, payload: &mut LeafPayload, node_box: &Aabb) {
        let (a, b) = self.representative_ray(&node_box.center());
        let (_, t) = closest_point_on_segment(&a, &b, &node_box.center());
        let (occ, band) = ray_occupancy(t);
        payload.count += 1;
        payload.total_weight += self.weight;
        payload.prob_sum += self.weight * occ;
        payload.prob_sum_sq += self.weight * occ * occ;
        payload.surface_sum += self.weight * band * self.surface_prior;
        payload.planar_sum += self.weight * band * self.planar_prior;
        payload.corner_sum += self.weight * band * self.corner_prior;
    }
}

/// A vertically extruded polygon footprint, for importing floorplan rooms.
/// `hollow` toggles a boundary-preserving subdivide pass (only leaves
/// straddling the footprint's boundary are touched) versus an interior-fill
/// pass (every leaf inside the footprint is tagged, regardless of straddle).
#[derive(Debug, Clone)]
pub struct ExtrudedPolygon {
    /// Footprint vertices, in order, projected onto the xy plane.
    pub footprint: Vec<Vec3>,
    pub floor_z: f64,
    pub ceil_z: f64,
    pub room: i64,
    pub hollow: bool,
}

impl ExtrudedPolygon {
    pub fn new(
        footprint: Vec<Vec3>,
        floor_z: f64,
        ceil_z: f64,
        room: i64,
        hollow: bool,
    ) -> Result<ExtrudedPolygon> {
        if footprint.len() < 3 {
            return Err(Error::InvalidInput(
                "extruded polygon footprint needs at least 3 vertices".into(),
            ));
        }
        if !(ceil_z > floor_z) {
            return Err(Error::InvalidInput(format!(
                "ceil_z ({ceil_z}) must exceed floor_z ({floor_z})"
            )));
        }
        if room < 0 {
            return Err(Error::InvalidInput("room index must be >= 0".into()));
        }
        Ok(ExtrudedPolygon {
            footprint,
            floor_z,
            ceil_z,
            room,
            hollow,
        })
    }

    /// Even-odd point-in-polygon test in the xy plane.
    fn contains_xy(&self, p: &Vec3) -> bool {
        let mut inside = false;
        let n = self.footprint.len();
        let mut j = n - 1;
        for i in 0..n {
            let vi = self.footprint[i];
            let vj = self.footprint[j];
            if ((vi.y > p.y) != (vj.y > p.y))
                && (p.x < (vj.x - vi.x) * (p.y - vi.y) / (vj.y - vi.y) + vi.x)
            {
                inside = !inside;
            }
            j = i;
        }
        inside
    }
}

impl ShapeGeometry for ExtrudedPolygon {
    fn aabb(&self) -> Aabb {
        let mut points: Vec<Vec3> = self
            .footprint
            .iter()
            .flat_map(|v| {
                [
                    Vec3::new(v.x, v.y, self.floor_z),
                    Vec3::new(v.x, v.y, self.ceil_z),
                ]
            })
            .collect();
        points.push(Vec3::new(0.0, 0.0, self.floor_z));
        Aabb::from_points(points).expect("non-empty footprint")
    }

    fn test(&self, node_box: &Aabb) -> Intersection {
        if node_box.max.z <= self.floor_z || node_box.min.z >= self.ceil_z {
            return Intersection::Disjoint;
        }
        let corners = [
            Vec3::new(node_box.min.x, node_box.min.y, 0.0),
            Vec3::new(node_box.max.x, node_box.min.y, 0.0),
            Vec3::new(node_box.min.x, node_box.max.y, 0.0),
            Vec3::new(node_box.max.x, node_box.max.y, 0.0),
        ];
        let inside_count = corners.iter().filter(|c| self.contains_xy(c)).count();
        if inside_count == 0 {
            Intersection::Disjoint
        } else if inside_count == corners.len() && node_box.min.z >= self.floor_z && node_box.max.z <= self.ceil_z {
            Intersection::Inside
        } else {
            Intersection::Straddles
        }
    }

    fn apply_to_leaf(&self, payload: &mut LeafPayload, node_box: &Aabb) {
        let center = node_box.center();
        let in_footprint = self.contains_xy(&center) && center.z >= self.floor_z && center.z <= self.ceil_z;
        if self.hollow {
            // Boundary-preserving: only nudge occupancy toward "known
            // empty interior", leaving the room's tag for boundary leaves.
            if in_footprint {
                payload.fp_room = self.room;
            }
            return;
        }
        if in_footprint {
            payload.count += 1;
            payload.total_weight += 1.0;
            payload.prob_sum += 0.0; // interior fill marks the room as known-empty space
            payload.fp_room = self.room;
        }
    }
}

/// A plain solid/empty box stamp, used to seed known regions (tests,
/// synthetic fixtures) without a ray.
#[derive(Debug, Clone, Copy)]
pub struct BoundingBoxShape {
    pub bounds: Aabb,
    pub weight: f64,
    pub occupancy: f64,
    pub planar_prior: f64,
}

impl BoundingBoxShape {
    pub fn new(bounds: Aabb, weight: f64, occupancy: f64, planar_prior: f64) -> Result<BoundingBoxShape> {
        if bounds.is_degenerate() {
            return Err(Error::InvalidInput("bounding box shape has zero volume".into()));
        }
        if !(weight > 0.0 && weight.is_finite()) {
            return Err(Error::InvalidInput("bounding box weight must be positive".into()));
        }
        Ok(BoundingBoxShape {
            bounds,
            weight,
            occupancy: occupancy.clamp(0.0, 1.0),
            planar_prior: planar_prior.clamp(0.0, 1.0),
        })
    }
}

impl ShapeGeometry for BoundingBoxShape {
    fn aabb(&self) -> Aabb {
        self.bounds
    }

    fn test(&self, node_box: &Aabb) -> Intersection {
        if !self.bounds.intersects(node_box) {
            Intersection::Disjoint
        } else if self.bounds.contains(node_box) {
            Intersection::Inside
        } else {
            Intersection::Straddles
        }
    }

    fn apply_to_leaf(&self, payload: &mut LeafPayload, _node_box: &Aabb) {
        payload.count += 1;
        payload.total_weight += self.weight;
        payload.prob_sum += self.weight * self.occupancy;
        payload.prob_sum_sq += self.weight * self.occupancy * self.occupancy;
        payload.planar_sum += self.weight * self.planar_prior;
    }
}

/// A bounded rectangular patch of a plane, used to stamp a known surface
/// directly (synthetic fixtures, floorplan wall imports).
#[derive(Debug, Clone, Copy)]
pub struct PlaneShape {
    pub center: Vec3,
    pub normal: Vec3,
    pub half_extent_u: f64,
    pub half_extent_v: f64,
    pub u_axis: Vec3,
    pub v_axis: Vec3,
    pub weight: f64,
    pub thickness: f64,
}

impl PlaneShape {
    pub fn new(
        center: Vec3,
        normal: Vec3,
        u_axis: Vec3,
        half_extent_u: f64,
        half_extent_v: f64,
        weight: f64,
        thickness: f64,
    ) -> Result<PlaneShape> {
        let normal = normal.try_normalize(f64::EPSILON).ok_or_else(|| {
            Error::InvalidInput("plane shape normal must be non-zero".into())
        })?;
        let u_axis = (u_axis - normal * u_axis.dot(&normal))
            .try_normalize(f64::EPSILON)
            .ok_or_else(|| Error::InvalidInput("plane shape u_axis must not be parallel to normal".into()))?;
        let v_axis = normal.cross(&u_axis);
        if !(weight > 0.0 && weight.is_finite()) {
            return Err(Error::InvalidInput("plane shape weight must be positive".into()));
        }
        if !(thickness > 0.0) {
            return Err(Error::InvalidInput("plane shape thickness must be positive".into()));
        }
        Ok(PlaneShape {
            center,
            normal,
            half_extent_u,
            half_extent_v,
            u_axis,
            v_axis,
            weight,
            thickness,
        })
    }

    fn in_patch(&self, p: &Vec3) -> bool {
        let d = p - self.center;
        let u = d.dot(&self.u_axis);
        let v = d.dot(&self.v_axis);
        u.abs() <= self.half_extent_u && v.abs() <= self.half_extent_v
    }
}

impl ShapeGeometry for PlaneShape {
    fn aabb(&self) -> Aabb {
        let corners = [
            self.center + self.u_axis * self.half_extent_u + self.v_axis * self.half_extent_v,
            self.center + self.u_axis * self.half_extent_u - self.v_axis * self.half_extent_v,
            self.center - self.u_axis * self.half_extent_u + self.v_axis * self.half_extent_v,
            self.center - self.u_axis * self.half_extent_u - self.v_axis * self.half_extent_v,
        ];
        let mut b = Aabb::from_points(corners).expect("four corners always form a box");
        b.min -= self.normal * self.thickness;
        b.max += self.normal * self.thickness;
        Aabb::new(b.min, b.max)
    }

    fn test(&self, node_box: &Aabb) -> Intersection {
        if !self.aabb().intersects(node_box) {
            return Intersection::Disjoint;
        }
        Intersection::Straddles
    }

    fn apply_to_leaf(&self, payload: &mut LeafPayload, node_box: &Aabb) {
        let center = node_box.center();
        let dist = self.normal.dot(&(center - self.center));
        if dist.abs() > self.thickness || !self.in_patch(&center) {
            return;
        }
        let occ = if dist >= 0.0 { 1.0 } else { 0.0 };
        payload.count += 1;
        payload.total_weight += self.weight;
        payload.prob_sum += self.weight * occ;
        payload.prob_sum_sq += self.weight * occ * occ;
        payload.planar_sum += self.weight;
    }
}

/// The closed set of shapes the carving engine can insert.
#[derive(Debug, Clone)]
pub enum Shape {
    Ray(RaySegment),
    Wedge(Wedge),
    ExtrudedPolygon(ExtrudedPolygon),
    BoundingBox(BoundingBoxShape),
    Plane(PlaneShape),
}

impl ShapeGeometry for Shape {
    fn aabb(&self) -> Aabb {
        match self {
            Shape::Ray(s) => s.aabb(),
            Shape::Wedge(s) => s.aabb(),
            Shape::ExtrudedPolygon(s) => s.aabb(),
            Shape::BoundingBox(s) => s.aabb(),
            Shape::Plane(s) => s.aabb(),
        }
    }

    fn test(&self, node_box: &Aabb) -> Intersection {
        match self {
            Shape::Ray(s) => s.test(node_box),
            Shape::Wedge(s) => s.test(node_box),
            Shape::ExtrudedPolygon(s) => s.test(node_box),
            Shape::BoundingBox(s) => s.test(node_box),
            Shape::Plane(s) => s.test(node_box),
        }
    }

    fn apply_to_leaf(&self, payload: &mut LeafPayload, node_box: &Aabb) {
        match self {
            Shape::Ray(s) => s.apply_to_leaf(payload, node_box),
            Shape::Wedge(s) => s.apply_to_leaf(payload, node_box),
            Shape::ExtrudedPolygon(s) => s.apply_to_leaf(payload, node_box),
            Shape::BoundingBox(s) => s.apply_to_leaf(payload, node_box),
            Shape::Plane(s) => s.apply_to_leaf(payload, node_box),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ray_occupancy_rises_monotonically_near_the_end() {
        let mut prev = 0.0;
        let mut t = 0.0;
        while t <= 1.0 {
            let (occ, _) = ray_occupancy(t);
            assert!(occ >= prev - 1e-12);
            prev = occ;
            t += 0.05;
        }
        let (occ_near_start, _) = ray_occupancy(0.01);
        let (occ_near_end, _) = ray_occupancy(0.99);
        assert!(occ_near_start < 0.5);
        assert!(occ_near_end > 0.5);
    }

    #[test]
    fn ray_segment_rejects_zero_length() {
        let p = Vec3::new(1.0, 1.0, 1.0);
        assert!(RaySegment::new(p, p, 1.0, 0.5, 0.5, 0.5).is_err());
    }

    #[test]
    fn ray_segment_rejects_nonpositive_weight() {
        let a = Vec3::new(0.0, 0.0, 0.0);
        let b = Vec3::new(1.0, 0.0, 0.0);
        assert!(RaySegment::new(a, b, 0.0, 0.5, 0.5, 0.5).is_err());
    }

    #[test]
    fn axis_aligned_ray_is_not_degenerate() {
        let r = RaySegment::new(
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(10.0, 0.0, 0.0),
            1.0,
            0.5,
            0.5,
            0.5,
        )
        .unwrap();
        assert!(!r.aabb().is_degenerate());
    }
}
