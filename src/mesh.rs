// Copyright 2016 spatial-rs Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The region mesher (C7): snaps multi-region corners to plane
//! intersections, triangulates each region, and emits a watertight mesh.

use std::collections::HashMap;

use nalgebra::{Matrix3, SymmetricEigen};

use crate::boundary::Boundary;
use crate::config::Options;
use crate::corner::{face_corner_indices, CornerKey, CornerMap};
use crate::error::{Error, Result};
use crate::geometry::{corner_position, Plane, Vec3};
use crate::octree::Tree;
use crate::region::RegionGraph;

/// A vertex list and triangle index list (§6's output mesh).
#[derive(Debug, Clone, Default)]
pub struct Mesh {
    pub vertices: Vec<Vec3>,
    pub triangles: Vec<[u32; 3]>,
}

/// Merge plane constraints whose unit normals are nearly colinear
/// (`|dot| >= max_colinearity`) into a single averaged constraint. Without
/// this, two incident regions with near-duplicate normals would masquerade
/// as two independent rows of `N`, letting their shared direction pass the
/// singular-value test as "determined" when it is really still within noise
/// of collapsing to the kernel (§6's "kernel collapse guard").
fn merge_colinear_planes(planes: &[Plane], max_colinearity: f64) -> Vec<Plane> {
    let mut used = vec![false; planes.len()];
    let mut merged = Vec::new();
    for i in 0..planes.len() {
        if used[i] {
            continue;
        }
        used[i] = true;
        let mut normal_sum = planes[i].normal;
        let mut offset_sum = planes[i].normal.dot(&planes[i].point);
        let mut count = 1.0_f64;
        for j in (i + 1)..planes.len() {
            if used[j] {
                continue;
            }
            let dot = planes[i].normal.dot(&planes[j].normal);
            if dot.abs() >= max_colinearity {
                let sign = dot.signum();
                normal_sum += planes[j].normal * sign;
                offset_sum += planes[j].normal.dot(&planes[j].point) * sign;
                count += 1.0;
                used[j] = true;
            }
        }
        let unit_normal = normal_sum.normalize();
        let offset = offset_sum / count;
        merged.push(Plane::new(unit_normal * offset, unit_normal));
    }
    merged
}

/// Solve the least-squares intersection `N*x = b` for a vertex incident on
/// `planes`, preserving `initial`'s component along any direction the
/// planes leave undetermined (§4.7).
///
/// Built from the normal matrix `N^T*N` (a fixed `3x3`, regardless of how
/// many planes are incident) rather than an SVD of `N` itself: `N^T*N`'s
/// eigenvectors are `N`'s right singular vectors and its eigenvalues are
/// the squared singular values, so this always yields the full orthonormal
/// basis of R^3 needed to preserve the kernel direction, even when `N` has
/// fewer than 3 rows (a compact SVD of `N` would not) -- the same
/// eigendecomposition-of-the-covariance route `fit_plane` uses.
fn snap_vertex(initial: Vec3, planes: &[Plane], min_singular_value: f64, max_colinearity: f64) -> Vec3 {
    let planes = merge_colinear_planes(planes, max_colinearity);
    let mut ntn = Matrix3::zeros();
    let mut ntb = Vec3::zeros();
    for p in &planes {
        let n = p.normal;
        ntn += n * n.transpose();
        ntb += n * n.dot(&p.point);
    }
    let eig = SymmetricEigen::new(ntn);
    let sigma = |e: f64| e.max(0.0).sqrt();
    let sigma1 = (0..3).map(|j| sigma(eig.eigenvalues[j])).fold(0.0_f64, f64::max).max(1e-12);

    let mut result = Vec3::zeros();
    for j in 0..3 {
        let v_j = eig.eigenvectors.column(j).into_owned();
        let sigma_j = sigma(eig.eigenvalues[j]);
        if sigma_j >= min_singular_value * sigma1 && sigma_j > 1e-12 {
            result += v_j * (v_j.dot(&ntb) / (sigma_j * sigma_j));
        } else {
            result += v_j * initial.dot(&v_j);
        }
    }
    result
}

impl Mesh {
    /// Vertex discovery + snapping + per-face triangulation (§4.7). Every
    /// corner touching >= 2 regions is snapped to their plane intersection;
    /// corners touching exactly one region keep their raw position (an
    /// interior grid point of that region's own triangulation).
    pub fn build(
        tree: &Tree,
        boundary: &Boundary,
        corners: &CornerMap,
        regions: &RegionGraph,
        options: &Options,
    ) -> Result<Mesh> {
        let mut vertex_index: HashMap<CornerKey, u32> = HashMap::new();
        let mut vertices = Vec::new();

        for key in corners.keys() {
            let raw = corners
                .position_of(key)
                .ok_or_else(|| Error::MissingReference("corner key missing its registered position".into()))?;
            let mut region_ids = std::collections::HashSet::new();
            for &face in corners.faces_for(key) {
                if let Some(r) = regions.region_of(face) {
                    region_ids.insert(r);
                }
            }
            let position = if region_ids.len() >= 2 {
                let planes: Vec<Plane> = region_ids
                    .iter()
                    .filter_map(|&r| regions.region(r).map(|reg| reg.plane))
                    .collect();
                snap_vertex(raw, &planes, options.min_singular_value, options.max_colinearity)
            } else {
                raw
            };
            let idx = vertices.len() as u32;
            vertices.push(position);
            vertex_index.insert(key, idx);
        }

        let mut triangles = Vec::with_capacity(boundary.len() * 2);
        for face in &boundary.faces {
            let interior_node = tree.node(face.interior);
            // A boundary face's true footprint is the smaller of the two
            // adjoining leaves: when the interior side is coarser than its
            // exterior neighbor, `Boundary::extract` still emits one
            // boundary face per finer neighbor touching it, all sharing the
            // same (coarse) `interior` handle. Using that handle's own
            // corners for every such face would reuse the same four
            // corners across all of them -- overlapping quads instead of
            // tiling the coarse face. Use the finer leaf's own corners
            // instead, so each face's quad only covers its actual patch.
            let (ref_center, ref_half_width, ref_direction) = match face.exterior {
                Some(ext) => {
                    let ext_node = tree.node(ext);
                    if ext_node.half_width < interior_node.half_width - 1e-9 {
                        (ext_node.center, ext_node.half_width, face.direction.opposite())
                    } else {
                        (interior_node.center, interior_node.half_width, face.direction)
                    }
                }
                None => (interior_node.center, interior_node.half_width, face.direction),
            };
            let keys: Vec<CornerKey> = face_corner_indices(ref_direction)
                .iter()
                .map(|&idx| crate::corner::corner_key(corner_position(ref_center, ref_half_width, idx)))
                .collect();
            let idx: Vec<u32> = keys
                .iter()
                .map(|k| {
                    vertex_index
                        .get(k)
                        .copied()
                        .ok_or_else(|| Error::MissingReference("boundary face corner missing a vertex".into()))
                })
                .collect::<Result<Vec<u32>>>()?;

            let normal = face.direction.normal();
            let p0 = vertices[idx[0] as usize];
            let p1 = vertices[idx[1] as usize];
            let p2 = vertices[idx[2] as usize];
            let winding = (p1 - p0).cross(&(p2 - p0));
            let (a, b, c, d) = if winding.dot(&normal) >= 0.0 {
                (idx[0], idx[1], idx[2], idx[3])
            } else {
                (idx[0], idx[3], idx[2], idx[1])
            };
            triangles.push([a, b, c]);
            triangles.push([a, c, d]);
        }

        Ok(Mesh { vertices, triangles })
    }

    /// Every interior edge must appear exactly once in each direction
    /// across the triangle set (§3 invariant 6, §8's manifoldness property).
    pub fn verify_manifold(&self) -> Result<()> {
        let mut directed: HashMap<(u32, u32), u32> = HashMap::new();
        for tri in &self.triangles {
            for i in 0..3 {
                let a = tri[i];
                let b = tri[(i + 1) % 3];
                *directed.entry((a, b)).or_insert(0) += 1;
            }
        }
        for (&(a, b), &count) in &directed {
            if count != 1 {
                return Err(Error::InconsistentTopology(format!(
                    "directed edge ({a},{b}) used {count} times, expected 1"
                )));
            }
            let reverse = directed.get(&(b, a)).copied().unwrap_or(0);
            if reverse != 1 {
                return Err(Error::InconsistentTopology(format!(
                    "edge ({a},{b}) has no matching opposite-orientation use"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn two_plane_snap_matches_the_intersection_line() {
        let planes = vec![
            Plane::new(Vec3::new(3.0, 0.0, 0.0), Vec3::new(1.0, 0.0, 0.0)),
            Plane::new(Vec3::new(0.0, 5.0, 0.0), Vec3::new(0.0, 1.0, 0.0)),
        ];
        let initial = Vec3::new(2.9, 5.1, 7.3);
        let snapped = snap_vertex(initial, &planes, 0.1, 0.99);
        assert_relative_eq!(snapped.x, 3.0, epsilon = 1e-9);
        assert_relative_eq!(snapped.y, 5.0, epsilon = 1e-9);
        assert_relative_eq!(snapped.z, 7.3, epsilon = 1e-9);
    }

    #[test]
    fn single_plane_snap_projects_onto_it() {
        let planes = vec![Plane::new(Vec3::new(0.0, 0.0, 2.0), Vec3::new(0.0, 0.0, 1.0))];
        let initial = Vec3::new(1.0, 1.0, 5.0);
        let snapped = snap_vertex(initial, &planes, 0.1, 0.99);
        assert_relative_eq!(snapped.z, 2.0, epsilon = 1e-9);
        assert_relative_eq!(snapped.x, 1.0, epsilon = 1e-9);
        assert_relative_eq!(snapped.y, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn manifold_check_rejects_a_dangling_triangle() {
        let mesh = Mesh {
            vertices: vec![Vec3::zeros(), Vec3::new(1.0, 0.0, 0.0), Vec3::new(0.0, 1.0, 0.0)],
            triangles: vec![[0, 1, 2]],
        };
        assert!(mesh.verify_manifold().is_err());
    }

    #[test]
    fn manifold_check_accepts_two_triangles_sharing_an_edge_with_opposite_winding() {
        let mesh = Mesh {
            vertices: vec![
                Vec3::new(0.0, 0.0, 0.0),
                Vec3::new(1.0, 0.0, 0.0),
                Vec3::new(1.0, 1.0, 0.0),
                Vec3::new(0.0, 1.0, 0.0),
            ],
            triangles: vec![[0, 1, 2], [0, 2, 3], [2, 1, 0], [3, 2, 0]],
        };
        assert!(mesh.verify_manifold().is_ok());
    }

    #[test]
    fn three_plane_snap_does_not_panic_and_pins_the_corner() {
        // k=3: the fully-determined case, with a non-axis-aligned third
        // plane so none of the three rows are redundant with each other.
        let planes = vec![
            Plane::new(Vec3::new(1.0, 0.0, 0.0), Vec3::new(1.0, 0.0, 0.0)),
            Plane::new(Vec3::new(0.0, 1.0, 0.0), Vec3::new(0.0, 1.0, 0.0)),
            Plane::new(Vec3::new(0.0, 0.0, 1.0), Vec3::new(0.3, 0.4, 1.0)),
        ];
        let snapped = snap_vertex(Vec3::new(0.9, 0.9, 0.9), &planes, 0.1, 0.99);
        for p in &planes {
            assert_relative_eq!(p.normal.dot(&(snapped - p.point)), 0.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn near_colinear_normals_still_preserve_the_kernel_direction() {
        // Two planes whose normals differ by a fraction of a degree should
        // be treated as one constraint, leaving y/z as a preserved kernel
        // direction rather than spuriously "determined" by noise.
        let tilt = 0.002_f64;
        let planes = vec![
            Plane::new(Vec3::new(3.0, 0.0, 0.0), Vec3::new(1.0, 0.0, 0.0)),
            Plane::new(Vec3::new(3.0, 0.0, 0.0), Vec3::new(1.0, tilt, 0.0)),
        ];
        let initial = Vec3::new(2.9, 5.1, 7.3);
        let snapped = snap_vertex(initial, &planes, 0.1, 0.99);
        assert_relative_eq!(snapped.x, 3.0, epsilon = 1e-2);
        assert_relative_eq!(snapped.y, 5.1, epsilon = 1e-2);
        assert_relative_eq!(snapped.z, 7.3, epsilon = 1e-9);
    }

    #[test]
    fn mesh_stays_manifold_across_a_resolution_change_at_the_boundary() {
        use crate::boundary::{Boundary, Scheme};
        use crate::corner::CornerMap;
        use crate::geometry::Aabb;
        use crate::octree::shapes::{BoundingBoxShape, Shape};
        use crate::region::RegionGraph;
        use crate::topology::Topology;

        // The shape's surface at +-1.3 does not align with a node boundary
        // at this resolution, so only the leaves straddling it subdivide
        // down to the finest depth; the fully-enclosed interior stays
        // coarse. This leaves a coarse interior leaf face-adjacent to
        // several finer exterior leaves -- exactly the cross-resolution
        // case `Boundary::extract` emits one face per finer neighbor for.
        let mut tree = Tree::new(0.25).unwrap();
        let shape = Shape::BoundingBox(
            BoundingBoxShape::new(
                Aabb::new(Vec3::new(-1.3, -1.3, -1.3), Vec3::new(1.3, 1.3, 1.3)),
                1.0,
                0.9,
                0.0,
            )
            .unwrap(),
        );
        tree.insert_shape(&shape).unwrap();
        assert!(tree.leaf_count() > 8, "expected genuine cross-resolution adjacency, got a uniform grid");

        let topo = Topology::build(&tree);
        topo.verify(&tree).unwrap();

        let boundary = Boundary::extract(&tree, &topo, Scheme::All);
        assert!(!boundary.is_empty());
        let corners = CornerMap::add(&tree, &boundary);
        let options = Options::default();
        let mut regions = RegionGraph::form(&tree, &boundary, &options);
        regions
            .coalesce(&tree, &boundary, &options, &crate::cancel::CancellationToken::new())
            .unwrap();

        let mesh = Mesh::build(&tree, &boundary, &corners, &regions, &options).unwrap();
        mesh.verify_manifold().unwrap();
    }
}
