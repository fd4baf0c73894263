// Copyright 2016 spatial-rs Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The boundary extractor (C4): enumerates oriented boundary faces between
//! interior and exterior leaves, and links face-to-face adjacency.

use std::collections::HashMap;

use crate::geometry::{Face, Vec3};
use crate::octree::node::Handle;
use crate::octree::Tree;
use crate::payload::LeafPayload;

/// Which leaves count as "interior" for boundary extraction (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    /// Pure probability label.
    All,
    /// A leaf counts as interior only if it is both occupied and inside a
    /// mapped floorplan room -- isolates furniture/fixtures from the shell.
    Objects,
    /// A leaf counts as interior if occupied, or if it falls inside a
    /// mapped room regardless of occupancy -- isolates only fixture-scale
    /// voids that fall outside any room.
    Room,
}

impl Scheme {
    pub fn is_interior(self, payload: Option<&LeafPayload>) -> bool {
        let occupied = payload.map(|p| p.is_interior()).unwrap_or(false);
        let has_room = payload.map(|p| p.has_room()).unwrap_or(false);
        match self {
            Scheme::All => occupied,
            Scheme::Objects => occupied && has_room,
            Scheme::Room => occupied || has_room,
        }
    }
}

/// An oriented tuple `(interior, exterior, direction)` (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundaryFace {
    pub interior: Handle,
    pub exterior: Option<Handle>,
    pub direction: Face,
}

impl BoundaryFace {
    pub fn area(&self, tree: &Tree) -> f64 {
        let hw_i = tree.node(self.interior).half_width;
        let hw_e = self
            .exterior
            .map(|e| tree.node(e).half_width)
            .unwrap_or(hw_i);
        4.0 * hw_i.min(hw_e) * hw_i.min(hw_e)
    }

    /// Face center biased toward the smaller node (§3).
    pub fn position(&self, tree: &Tree) -> Vec3 {
        let leaf = tree.node(self.interior);
        let hw_i = leaf.half_width;
        let hw_e = self.exterior.map(|e| tree.node(e).half_width).unwrap_or(hw_i);
        let bias = hw_i.min(hw_e);
        leaf.center + self.direction.normal() * bias
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FaceId(pub u32);

/// The output of `extract`: every boundary face plus face-to-face adjacency
/// and a per-leaf index.
#[derive(Debug, Clone, Default)]
pub struct Boundary {
    pub faces: Vec<BoundaryFace>,
    adjacency: Vec<Vec<FaceId>>,
    node_faces: HashMap<Handle, Vec<FaceId>>,
}

impl Boundary {
    pub fn face(&self, id: FaceId) -> &BoundaryFace {
        &self.faces[id.0 as usize]
    }

    pub fn adjacent(&self, id: FaceId) -> &[FaceId] {
        &self.adjacency[id.0 as usize]
    }

    pub fn faces_of(&self, node: Handle) -> &[FaceId] {
        self.node_faces.get(&node).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.faces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.faces.is_empty()
    }

    /// Walk every interior leaf's six faces, emitting a boundary face for
    /// each non-interior (or absent) neighbor, then link adjacency between
    /// faces that share an edge (§4.4).
    pub fn extract(tree: &Tree, topology: &crate::topology::Topology, scheme: Scheme) -> Boundary {
        let mut faces = Vec::new();
        let mut node_faces: HashMap<Handle, Vec<FaceId>> = HashMap::new();

        for leaf in tree.leaves() {
            if !scheme.is_interior(tree.node(leaf).payload()) {
                continue;
            }
            for &direction in &Face::ALL {
                let neighbors = topology.neighbors(leaf, direction);
                if neighbors.is_empty() {
                    push_face(&mut faces, &mut node_faces, BoundaryFace {
                        interior: leaf,
                        exterior: None,
                        direction,
                    });
                    continue;
                }
                for &n in neighbors {
                    if !scheme.is_interior(tree.node(n).payload()) {
                        push_face(&mut faces, &mut node_faces, BoundaryFace {
                            interior: leaf,
                            exterior: Some(n),
                            direction,
                        });
                    }
                }
            }
        }

        let adjacency = link_adjacency(tree, topology, &faces, &node_faces);
        Boundary {
            faces,
            adjacency,
            node_faces,
        }
    }
}

fn push_face(
    faces: &mut Vec<BoundaryFace>,
    node_faces: &mut HashMap<Handle, Vec<FaceId>>,
    face: BoundaryFace,
) {
    let id = FaceId(faces.len() as u32);
    node_faces.entry(face.interior).or_default().push(id);
    faces.push(face);
}

fn perpendicular_faces(axis: usize) -> [Face; 4] {
    match axis {
        0 => [Face::PosY, Face::NegY, Face::PosZ, Face::NegZ],
        1 => [Face::PosX, Face::NegX, Face::PosZ, Face::NegZ],
        _ => [Face::PosX, Face::NegX, Face::PosY, Face::NegY],
    }
}

fn link_adjacency(
    tree: &Tree,
    topology: &crate::topology::Topology,
    faces: &[BoundaryFace],
    node_faces: &HashMap<Handle, Vec<FaceId>>,
) -> Vec<Vec<FaceId>> {
    let mut adjacency: Vec<Vec<FaceId>> = vec![Vec::new(); faces.len()];

    for (i, face) in faces.iter().enumerate() {
        let id = FaceId(i as u32);
        let axis = face.direction.axis();
        let leaf_center = tree.node(face.interior).center;
        let plane_coord = leaf_center[axis] + face.direction.sign() * tree.node(face.interior).half_width;

        for perp in perpendicular_faces(axis) {
            for &neighbor_leaf in topology.neighbors(face.interior, perp) {
                for &other_id in node_faces.get(&neighbor_leaf).map(|v| v.as_slice()).unwrap_or(&[]) {
                    if other_id.0 == id.0 {
                        continue;
                    }
                    let other = &faces[other_id.0 as usize];
                    if other.direction == face.direction {
                        let other_center = tree.node(other.interior).center;
                        let other_plane_coord = other_center[axis]
                            + other.direction.sign() * tree.node(other.interior).half_width;
                        if (plane_coord - other_plane_coord).abs() < 1e-9 {
                            link(&mut adjacency, id, other_id);
                        }
                    } else if perpendicular_adjacent(tree, face, other) {
                        link(&mut adjacency, id, other_id);
                    }
                }
            }
        }
    }
    adjacency
}

fn link(adjacency: &mut [Vec<FaceId>], a: FaceId, b: FaceId) {
    if !adjacency[a.0 as usize].contains(&b) {
        adjacency[a.0 as usize].push(b);
    }
    if !adjacency[b.0 as usize].contains(&a) {
        adjacency[b.0 as usize].push(a);
    }
}

/// Inner/outer corner test between two perpendicular-direction boundary
/// faces (§4.4): the component of the face-center displacement
/// perpendicular to `n_a x n_b` must match the offset implied by the two
/// halfwidths, within a convex or concave corner, and the parallel
/// component must stay inside the larger face's extent.
fn perpendicular_adjacent(tree: &Tree, a: &BoundaryFace, b: &BoundaryFace) -> bool {
    let hw_a = tree.node(a.interior).half_width;
    let hw_b = tree.node(b.interior).half_width;
    let n_a = a.direction.normal();
    let n_b = b.direction.normal();
    let cross = n_a.cross(&n_b);
    if cross.norm() < 1e-9 {
        return false;
    }
    let cross = cross.normalize();

    let center_a = tree.node(a.interior).center + n_a * hw_a;
    let center_b = tree.node(b.interior).center + n_b * hw_b;
    let d = center_b - center_a;
    let parallel = d.dot(&cross);
    let perp = d - cross * parallel;

    let expected = n_a * hw_b - n_b * hw_a;
    let convex = (perp - expected).norm() < 1e-6;
    let concave = (perp + expected).norm() < 1e-6;
    (convex || concave) && parallel.abs() < hw_a.max(hw_b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Aabb;
    use crate::octree::shapes::{BoundingBoxShape, Shape};
    use crate::topology::Topology;

    fn carve_box(tree: &mut Tree, min: Vec3, max: Vec3, occupancy: f64) {
        let shape = Shape::BoundingBox(BoundingBoxShape::new(Aabb::new(min, max), 1.0, occupancy, 0.0).unwrap());
        tree.insert_shape(&shape).unwrap();
    }

    #[test]
    fn extracts_faces_between_interior_and_exterior() {
        let mut tree = Tree::new(1.0).unwrap();
        carve_box(&mut tree, Vec3::new(-1.0, -1.0, -1.0), Vec3::new(1.0, 1.0, 1.0), 1.0);
        let topo = Topology::build(&tree);
        let boundary = Boundary::extract(&tree, &topo, Scheme::All);
        assert!(!boundary.is_empty());
        for face in &boundary.faces {
            assert!(Scheme::All.is_interior(tree.node(face.interior).payload()));
            assert!(!Scheme::All.is_interior(face.exterior.and_then(|e| tree.node(e).payload())));
        }
    }

    #[test]
    fn every_face_has_a_finite_area() {
        let mut tree = Tree::new(1.0).unwrap();
        carve_box(&mut tree, Vec3::new(-1.0, -1.0, -1.0), Vec3::new(1.0, 1.0, 1.0), 1.0);
        let topo = Topology::build(&tree);
        let boundary = Boundary::extract(&tree, &topo, Scheme::All);
        for face in &boundary.faces {
            assert!(face.area(&tree) > 0.0);
        }
    }
}
