// Copyright 2016 spatial-rs Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The planar-region graph (C6): flood-fills boundary faces into regions,
//! fits planes, and coalesces regions under a statistical distance
//! threshold.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};

use log::trace;
use nalgebra::{Matrix3, SymmetricEigen};
use ordered_float::OrderedFloat;

use crate::boundary::{Boundary, FaceId};
use crate::cancel::CancellationToken;
use crate::config::Options;
use crate::error::{Error, ProcessingSummary, Result};
use crate::geometry::{Plane, Vec3};
use crate::octree::Tree;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegionId(pub u32);

#[derive(Debug, Clone)]
pub struct Region {
    pub faces: Vec<FaceId>,
    pub plane: Plane,
    pub neighbor_seeds: HashSet<RegionId>,
}

/// The region partition over a boundary's faces, plus the adjacency needed
/// to drive coalescence (§4.6).
#[derive(Debug, Clone, Default)]
pub struct RegionGraph {
    regions: Vec<Option<Region>>,
    face_region: HashMap<FaceId, RegionId>,
}

fn planarity(tree: &Tree, boundary: &Boundary, face: FaceId) -> f64 {
    tree.node(boundary.face(face).interior)
        .payload()
        .map(|p| p.planar())
        .unwrap_or(0.0)
}

fn face_stats(tree: &Tree, boundary: &Boundary, face: FaceId) -> (f64, f64, f64, f64, f64, f64) {
    let f = boundary.face(face);
    let interior = tree.node(f.interior);
    let mu_i = interior.payload().map(|p| p.probability()).unwrap_or(0.5);
    let var_i = interior.payload().map(|p| p.variance()).unwrap_or(1.0);
    let hw_i = interior.half_width;
    let (mu_e, var_e, hw_e) = match f.exterior {
        Some(e) => {
            let n = tree.node(e);
            (
                n.payload().map(|p| p.probability()).unwrap_or(0.5),
                n.payload().map(|p| p.variance()).unwrap_or(1.0),
                n.half_width,
            )
        }
        None => (0.5, 1.0, 0.0),
    };
    (mu_i, var_i, hw_i, mu_e, var_e, hw_e)
}

/// Whether a boundary face sits between two leaves on the same side of the
/// 1/2 probability threshold -- isosurface geometry is undefined there.
fn is_hidden(mu_i: f64, mu_e: f64) -> bool {
    (mu_i - 0.5).signum() == (mu_e - 0.5).signum()
}

/// Statistical position variance of a face's geometric center (§4.6).
fn face_position_variance(tree: &Tree, boundary: &Boundary, face: FaceId) -> f64 {
    let (mu_i, var_i, hw_i, mu_e, var_e, hw_e) = face_stats(tree, boundary, face);
    if is_hidden(mu_i, mu_e) {
        (hw_e - hw_i).powi(2) / 12.0
    } else {
        let s = (mu_i - 0.5) / (mu_i - mu_e);
        let var_s = (1.0 - s * s) * var_i + s * s * var_e;
        var_s * (hw_i + hw_e).powi(2)
    }
}

/// Estimated probability-1/2 crossing position for a face (§4.6), or the
/// plain geometric center for a hidden face.
fn face_isosurface_position(tree: &Tree, boundary: &Boundary, face: FaceId) -> Vec3 {
    let f = boundary.face(face);
    let (mu_i, _, hw_i, mu_e, _, hw_e) = face_stats(tree, boundary, face);
    if is_hidden(mu_i, mu_e) {
        f.position(tree)
    } else {
        let s = (mu_i - 0.5) / (mu_i - mu_e);
        tree.node(f.interior).center + f.direction.normal() * (s * (hw_i + hw_e))
    }
}

fn face_position(tree: &Tree, boundary: &Boundary, face: FaceId, use_isosurface: bool) -> Vec3 {
    if use_isosurface {
        face_isosurface_position(tree, boundary, face)
    } else {
        boundary.face(face).position(tree)
    }
}

/// Least-squares plane fit via the covariance matrix's smallest
/// eigenvector; falls back to `fallback_normal` when the two smallest
/// singular values are too close to distinguish (§9).
fn fit_plane(points: &[Vec3], fallback_normal: Vec3, min_singular_value: f64) -> Plane {
    let n = points.len() as f64;
    let centroid = points.iter().fold(Vec3::zeros(), |a, &b| a + b) / n;
    if points.len() < 3 {
        return Plane::new(centroid, fallback_normal);
    }
    let mut cov = Matrix3::zeros();
    for &p in points {
        let d = p - centroid;
        cov += d * d.transpose();
    }
    let eig = SymmetricEigen::new(cov);
    let mut order: [usize; 3] = [0, 1, 2];
    order.sort_by(|&a, &b| eig.eigenvalues[b].partial_cmp(&eig.eigenvalues[a]).unwrap());
    let sigma = |e: f64| e.max(0.0).sqrt();
    let s1 = sigma(eig.eigenvalues[order[0]]);
    let s2 = sigma(eig.eigenvalues[order[1]]);
    let s3 = sigma(eig.eigenvalues[order[2]]);
    if (s2 - s3).abs() < min_singular_value * s1.max(1e-12) {
        Plane::new(centroid, fallback_normal)
    } else {
        let normal = eig.eigenvectors.column(order[2]).into_owned();
        Plane::new(centroid, normal)
    }
}

impl RegionGraph {
    /// Seed-and-grow flood fill over same-direction boundary-face
    /// adjacency, gated by per-face planarity (§4.6).
    pub fn form(tree: &Tree, boundary: &Boundary, options: &Options) -> RegionGraph {
        let mut visited = HashSet::new();
        let mut regions: Vec<Option<Region>> = Vec::new();
        let mut face_region = HashMap::new();

        for i in 0..boundary.len() {
            let seed = FaceId(i as u32);
            if visited.contains(&seed) {
                continue;
            }
            let seed_face = boundary.face(seed);
            let seed_normal = seed_face.direction.normal();
            let mut members = vec![seed];
            visited.insert(seed);

            if planarity(tree, boundary, seed) >= options.coalesce_planethresh {
                let mut queue = VecDeque::from([seed]);
                while let Some(current) = queue.pop_front() {
                    for &adj in boundary.adjacent(current) {
                        if visited.contains(&adj) {
                            continue;
                        }
                        let adj_face = boundary.face(adj);
                        if adj_face.direction != seed_face.direction {
                            continue;
                        }
                        if planarity(tree, boundary, adj) < options.coalesce_planethresh {
                            continue;
                        }
                        visited.insert(adj);
                        members.push(adj);
                        queue.push_back(adj);
                    }
                }
            }

            let id = RegionId(regions.len() as u32);
            for &m in &members {
                face_region.insert(m, id);
            }
            let points: Vec<Vec3> = members
                .iter()
                .map(|&m| face_position(tree, boundary, m, options.use_isosurface_pos))
                .collect();
            let plane = fit_plane(&points, seed_normal, options.min_singular_value);
            regions.push(Some(Region {
                faces: members,
                plane,
                neighbor_seeds: HashSet::new(),
            }));
        }

        let mut graph = RegionGraph { regions, face_region };
        graph.rebuild_neighbor_seeds(boundary);
        graph
    }

    fn rebuild_neighbor_seeds(&mut self, boundary: &Boundary) {
        let mut adds: Vec<(RegionId, RegionId)> = Vec::new();
        for (idx, region) in self.regions.iter().enumerate() {
            let Some(region) = region else { continue };
            let own = RegionId(idx as u32);
            for &face in &region.faces {
                for &adj in boundary.adjacent(face) {
                    if let Some(&other) = self.face_region.get(&adj) {
                        if other != own {
                            adds.push((own, other));
                        }
                    }
                }
            }
        }
        for (a, b) in adds {
            if let Some(Some(r)) = self.regions.get_mut(a.0 as usize) {
                r.neighbor_seeds.insert(b);
            }
        }
    }

    pub fn regions(&self) -> impl Iterator<Item = (RegionId, &Region)> {
        self.regions
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.as_ref().map(|r| (RegionId(i as u32), r)))
    }

    pub fn region(&self, id: RegionId) -> Option<&Region> {
        self.regions.get(id.0 as usize).and_then(|r| r.as_ref())
    }

    pub fn region_of(&self, face: FaceId) -> Option<RegionId> {
        self.face_region.get(&face).copied()
    }

    fn score_pair(
        &self,
        tree: &Tree,
        boundary: &Boundary,
        options: &Options,
        a: RegionId,
        b: RegionId,
    ) -> (f64, Plane) {
        let ra = self.region(a).expect("region a exists while scoring");
        let rb = self.region(b).expect("region b exists while scoring");
        let all_faces: Vec<FaceId> = ra.faces.iter().chain(rb.faces.iter()).copied().collect();
        let points: Vec<Vec3> = all_faces
            .iter()
            .map(|&f| face_position(tree, boundary, f, options.use_isosurface_pos))
            .collect();
        let plane = fit_plane(&points, ra.plane.normal, options.min_singular_value);
        let max_err = all_faces
            .iter()
            .map(|&f| {
                let pos = face_position(tree, boundary, f, options.use_isosurface_pos);
                let var = face_position_variance(tree, boundary, f).max(1e-12);
                plane.distance(&pos) / var.sqrt()
            })
            .fold(0.0_f64, f64::max);
        (max_err, plane)
    }

    /// Repeatedly pop the best-scoring pair and merge it if still valid and
    /// within `distance_threshold`, rescoring stale entries as needed
    /// (§4.6).
    pub fn coalesce(
        &mut self,
        tree: &Tree,
        boundary: &Boundary,
        options: &Options,
        cancel: &CancellationToken,
    ) -> Result<ProcessingSummary> {
        let mut summary = ProcessingSummary::new();
        let mut heap: BinaryHeap<Reverse<(OrderedFloat<f64>, u32, u32, usize, usize)>> = BinaryHeap::new();
        let mut pushed = HashSet::new();

        for (id, region) in self.regions() {
            for &nb in &region.neighbor_seeds {
                let key = if id.0 < nb.0 { (id.0, nb.0) } else { (nb.0, id.0) };
                if pushed.insert(key) {
                    self.push_candidate(tree, boundary, options, RegionId(key.0), RegionId(key.1), &mut heap);
                }
            }
        }

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let Some(Reverse((err, a, b, ca, cb))) = heap.pop() else {
                break;
            };
            if err.0 > options.coalesce_distthresh {
                break;
            }
            let (ra, rb) = (RegionId(a), RegionId(b));
            let (current_a, current_b) = match (self.region(ra), self.region(rb)) {
                (Some(x), Some(y)) => (x.faces.len(), y.faces.len()),
                _ => continue,
            };
            if current_a != ca || current_b != cb {
                trace!("rescoring stale region pair {a}/{b}");
                self.push_candidate(tree, boundary, options, ra, rb, &mut heap);
                continue;
            }
            let (_, plane) = self.score_pair(tree, boundary, options, ra, rb);
            self.merge(ra, rb, plane);
            summary.record_accepted();
            trace!("merged region {b} into {a}");

            let survivor_neighbors: Vec<RegionId> = self
                .region(ra)
                .map(|r| r.neighbor_seeds.iter().copied().collect())
                .unwrap_or_default();
            for nb in survivor_neighbors {
                if nb == ra {
                    continue;
                }
                self.push_candidate(tree, boundary, options, ra, nb, &mut heap);
            }
        }
        Ok(summary)
    }

    fn push_candidate(
        &self,
        tree: &Tree,
        boundary: &Boundary,
        options: &Options,
        a: RegionId,
        b: RegionId,
        heap: &mut BinaryHeap<Reverse<(OrderedFloat<f64>, u32, u32, usize, usize)>>,
    ) {
        if self.region(a).is_none() || self.region(b).is_none() {
            return;
        }
        let (err, _) = self.score_pair(tree, boundary, options, a, b);
        let ca = self.region(a).unwrap().faces.len();
        let cb = self.region(b).unwrap().faces.len();
        heap.push(Reverse((OrderedFloat(err), a.0, b.0, ca, cb)));
    }

    /// Merge `b` into `a`: union face sets, reassign the moved faces in the
    /// face->region index, union neighbor-seed sets, and fix up every
    /// neighbor that referenced `b` to reference `a` instead.
    fn merge(&mut self, a: RegionId, b: RegionId, plane: Plane) {
        let taken = self.regions[b.0 as usize].take().expect("region b still present");
        for &f in &taken.faces {
            self.face_region.insert(f, a);
        }
        let survivor = self.regions[a.0 as usize].as_mut().expect("region a still present");
        survivor.faces.extend(taken.faces.iter().copied());
        survivor.plane = plane;
        survivor.neighbor_seeds.extend(taken.neighbor_seeds.iter().copied());
        survivor.neighbor_seeds.remove(&a);
        survivor.neighbor_seeds.remove(&b);

        for (idx, region) in self.regions.iter_mut().enumerate() {
            if idx == a.0 as usize {
                continue;
            }
            if let Some(region) = region {
                if region.neighbor_seeds.remove(&b) {
                    region.neighbor_seeds.insert(a);
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.regions.iter().filter(|r| r.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Aabb;
    use crate::octree::shapes::{BoundingBoxShape, Shape};
    use crate::topology::Topology;

    fn cube_tree() -> Tree {
        let mut tree = Tree::new(0.5).unwrap();
        let shape = Shape::BoundingBox(
            BoundingBoxShape::new(Aabb::new(Vec3::new(-1.0, -1.0, -1.0), Vec3::new(1.0, 1.0, 1.0)), 1.0, 1.0, 1.0)
                .unwrap(),
        );
        tree.insert_shape(&shape).unwrap();
        tree
    }

    #[test]
    fn flood_fill_partitions_every_face_exactly_once() {
        let tree = cube_tree();
        let topo = Topology::build(&tree);
        let boundary = crate::boundary::Boundary::extract(&tree, &topo, crate::boundary::Scheme::All);
        let options = Options::default();
        let graph = RegionGraph::form(&tree, &boundary, &options);

        let mut covered = HashSet::new();
        for (_, region) in graph.regions() {
            for &f in &region.faces {
                assert!(covered.insert(f), "face {f:?} claimed by more than one region");
            }
        }
        assert_eq!(covered.len(), boundary.len());
    }

    #[test]
    fn coalescing_a_cube_converges_to_six_regions() {
        let tree = cube_tree();
        let topo = Topology::build(&tree);
        let boundary = crate::boundary::Boundary::extract(&tree, &topo, crate::boundary::Scheme::All);
        let options = Options::default();
        let mut graph = RegionGraph::form(&tree, &boundary, &options);
        graph.coalesce(&tree, &boundary, &options, &CancellationToken::new()).unwrap();
        assert!(graph.len() <= 6);
    }
}
