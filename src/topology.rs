// Copyright 2016 spatial-rs Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The topology layer (C3): face-adjacent neighbor sets across nodes of
//! possibly different depths, and outlier flipping.

use std::collections::{HashMap, HashSet, VecDeque};

use log::trace;

use crate::cancel::CancellationToken;
use crate::error::{Error, ProcessingSummary, Result};
use crate::geometry::{octant_of_sign, octant_sign_vec, Face};
use crate::octree::node::Handle;
use crate::octree::Tree;

/// Face-keyed neighbor sets for every leaf in a tree, built once and held
/// as plain handles -- it does not own or borrow the tree (§9).
#[derive(Debug, Clone, Default)]
pub struct Topology {
    neighbors: HashMap<Handle, [Vec<Handle>; 6]>,
}

fn face_index(f: Face) -> usize {
    Face::ALL.iter().position(|&x| x == f).unwrap()
}

/// The octant obtained by flipping the sign of `axis` on octant `index`,
/// keeping the other two axes' signs unchanged -- the in-parent sibling
/// reached by crossing that face.
fn mirror_octant(index: usize, axis: usize) -> usize {
    let mut v = octant_sign_vec(index);
    v[axis] = -v[axis];
    octant_of_sign(&v)
}

fn collect_all_leaves(tree: &Tree, handle: Handle, out: &mut Vec<Handle>) {
    match tree.node(handle).children() {
        None => out.push(handle),
        Some(children) => {
            for &c in children {
                collect_all_leaves(tree, c, out);
            }
        }
    }
}

/// Leaf descendants of `handle` lying on the side of `handle`'s own cube
/// whose sign along `axis` equals `sign` -- the near-face subset reached
/// when a coarser neighbor has since been subdivided further than us.
fn leaves_touching_face(tree: &Tree, handle: Handle, axis: usize, sign: f64) -> Vec<Handle> {
    match tree.node(handle).children() {
        None => vec![handle],
        Some(children) => {
            let mut out = Vec::new();
            for i in 0..8 {
                if octant_sign_vec(i)[axis] == sign {
                    collect_all_leaves(tree, children[i], &mut out);
                }
            }
            out
        }
    }
}

impl Topology {
    /// Walk the tree top-down, deriving each child's six-face neighbor sets
    /// from its siblings and from the parent's same-face neighbor (§4.3).
    pub fn build(tree: &Tree) -> Topology {
        let mut raw: HashMap<Handle, [Option<Handle>; 6]> = HashMap::new();
        assign(tree, tree.root(), [None; 6], &mut raw);

        let mut neighbors = HashMap::with_capacity(raw.len());
        for (leaf, entry) in raw {
            let mut finalized: [Vec<Handle>; 6] = Default::default();
            for (idx, &face) in Face::ALL.iter().enumerate() {
                finalized[idx] = match entry[idx] {
                    None => Vec::new(),
                    Some(h) if tree.is_leaf(h) => vec![h],
                    Some(h) => leaves_touching_face(tree, h, face.axis(), -face.sign()),
                };
            }
            neighbors.insert(leaf, finalized);
        }
        Topology { neighbors }
    }

    pub fn neighbors(&self, node: Handle, face: Face) -> &[Handle] {
        match self.neighbors.get(&node) {
            Some(entry) => &entry[face_index(face)],
            None => &[],
        }
    }

    pub fn are_neighbors(&self, a: Handle, b: Handle) -> bool {
        Face::ALL.iter().any(|&f| self.neighbors(a, f).contains(&b))
    }

    /// Every face of `node`, paired with the neighbor set recorded on it.
    pub fn faces(&self, node: Handle) -> impl Iterator<Item = (Face, &[Handle])> {
        Face::ALL.iter().map(move |&f| (f, self.neighbors(node, f)))
    }

    /// The §3 invariants (1)-(2) and the §8 neighbor-symmetry property,
    /// checked in deterministic (node index, face) order. Returns the
    /// first violation found.
    pub fn verify(&self, tree: &Tree) -> Result<()> {
        let mut handles: Vec<Handle> = self.neighbors.keys().copied().collect();
        handles.sort_by_key(|h| h.index());
        for node in handles {
            for &face in &Face::ALL {
                for &neighbor in self.neighbors(node, face) {
                    if !tree.is_leaf(neighbor) {
                        return Err(Error::InconsistentTopology(format!(
                            "neighbor {:?} of {:?} across {:?} is not a leaf",
                            neighbor, node, face
                        )));
                    }
                    if !self.neighbors(neighbor, face.opposite()).contains(&node) {
                        return Err(Error::InconsistentTopology(format!(
                            "{:?} lists {:?} across {:?}, but {:?} does not list {:?} back across {:?}",
                            node, neighbor, face, neighbor, node, face.opposite()
                        )));
                    }
                    let node_box = tree.node_box(node);
                    let neighbor_box = tree.node_box(neighbor);
                    let axis = face.axis();
                    let expected = tree.node(node).half_width + tree.node(neighbor).half_width;
                    let actual = (node_box.center()[axis] - neighbor_box.center()[axis]).abs();
                    if (actual - expected).abs() > 1e-9 {
                        return Err(Error::InconsistentTopology(format!(
                            "{:?}/{:?} axis-distance {actual} does not match halfwidth sum {expected}",
                            node, neighbor
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Post-process interior/exterior labels: flip a leaf whose disagreeing
    /// boundary-area fraction with its neighbors exceeds `threshold` (§4.3).
    /// Re-queues affected neighbors; two FIFOs (interior-first,
    /// exterior-second) drain until both are empty.
    pub fn remove_outliers(
        &self,
        tree: &mut Tree,
        threshold: f64,
        cancel: &CancellationToken,
    ) -> Result<ProcessingSummary> {
        if !(threshold > 0.5 && threshold <= 1.0) {
            return Err(Error::InvalidInput(format!(
                "node_outlierthresh must be in (0.5, 1.0], got {threshold}"
            )));
        }
        let mut summary = ProcessingSummary::new();
        let mut interior_q: VecDeque<Handle> = VecDeque::new();
        let mut exterior_q: VecDeque<Handle> = VecDeque::new();
        let mut queued: HashSet<Handle> = HashSet::new();

        for &leaf in self.neighbors.keys() {
            let is_interior = tree
                .node(leaf)
                .payload()
                .map(|p| p.is_interior())
                .unwrap_or(false);
            if is_interior {
                interior_q.push_back(leaf);
            } else {
                exterior_q.push_back(leaf);
            }
            queued.insert(leaf);
        }

        loop {
            if interior_q.is_empty() && exterior_q.is_empty() {
                break;
            }
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            self.drain_queue(tree, &mut interior_q, &mut exterior_q, &mut queued, threshold, &mut summary, cancel)?;
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            self.drain_queue(tree, &mut exterior_q, &mut interior_q, &mut queued, threshold, &mut summary, cancel)?;
        }
        Ok(summary)
    }

    #[allow(clippy::too_many_arguments)]
    fn drain_queue(
        &self,
        tree: &mut Tree,
        this_q: &mut VecDeque<Handle>,
        other_q: &mut VecDeque<Handle>,
        queued: &mut HashSet<Handle>,
        threshold: f64,
        summary: &mut ProcessingSummary,
        cancel: &CancellationToken,
    ) -> Result<()> {
        while let Some(leaf) = this_q.pop_front() {
            queued.remove(&leaf);
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if self.disagreeing_fraction(tree, leaf) > threshold {
                if let Some(payload) = tree.node_mut(leaf).payload_mut() {
                    *payload = payload.flip();
                }
                summary.record_accepted();
                trace!("flipped outlier leaf {:?}", leaf);
                for &face in &Face::ALL {
                    for &neighbor in self.neighbors(leaf, face) {
                        if queued.insert(neighbor) {
                            let is_interior = tree
                                .node(neighbor)
                                .payload()
                                .map(|p| p.is_interior())
                                .unwrap_or(false);
                            if is_interior {
                                this_q.push_back(neighbor);
                                queued.remove(&neighbor);
                                queued.insert(neighbor);
                            } else {
                                other_q.push_back(neighbor);
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Fraction of `leaf`'s total boundary area whose neighbor disagrees on
    /// interior/exterior. An absent neighbor on a face counts as exterior.
    fn disagreeing_fraction(&self, tree: &Tree, leaf: Handle) -> f64 {
        let node = tree.node(leaf);
        let hw = node.half_width;
        let is_interior = node.payload().map(|p| p.is_interior()).unwrap_or(false);
        let face_area = (2.0 * hw) * (2.0 * hw);
        let mut total = 0.0;
        let mut disagree = 0.0;
        for &face in &Face::ALL {
            let neighbors = self.neighbors(leaf, face);
            total += face_area;
            if neighbors.is_empty() {
                // No neighbor: treated as exterior.
                if is_interior {
                    disagree += face_area;
                }
                continue;
            }
            for &n in neighbors {
                let n_hw = tree.node(n).half_width;
                let n_interior = tree.node(n).payload().map(|p| p.is_interior()).unwrap_or(false);
                let shared_area = 4.0 * hw.min(n_hw) * hw.min(n_hw);
                if n_interior != is_interior {
                    disagree += shared_area;
                }
            }
        }
        if total == 0.0 {
            0.0
        } else {
            disagree / total
        }
    }
}

fn assign(
    tree: &Tree,
    handle: Handle,
    incoming: [Option<Handle>; 6],
    raw: &mut HashMap<Handle, [Option<Handle>; 6]>,
) {
    match tree.node(handle).children() {
        None => {
            raw.insert(handle, incoming);
        }
        Some(children) => {
            let children = *children;
            for (i, &child) in children.iter().enumerate() {
                let mut child_neighbors = [None; 6];
                for (idx, &face) in Face::ALL.iter().enumerate() {
                    let axis = face.axis();
                    let sign = face.sign();
                    child_neighbors[idx] = if octant_sign_vec(i)[axis] == sign {
                        incoming[idx]
                    } else {
                        Some(children[mirror_octant(i, axis)])
                    };
                }
                assign(tree, child, child_neighbors, raw);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Vec3;
    use crate::octree::shapes::{BoundingBoxShape, Shape};
    use crate::geometry::Aabb;

    fn carve_box(tree: &mut Tree, min: Vec3, max: Vec3, occupancy: f64) {
        let shape = Shape::BoundingBox(BoundingBoxShape::new(Aabb::new(min, max), 1.0, occupancy, 0.0).unwrap());
        tree.insert_shape(&shape).unwrap();
    }

    #[test]
    fn two_leaf_tree_has_symmetric_neighbors() {
        let mut tree = Tree::new(1.0).unwrap();
        // Force a subdivision so the root splits into two adjacent leaves
        // sharing the +x/-x face pair (among the other six).
        carve_box(&mut tree, Vec3::new(-1.0, -1.0, -1.0), Vec3::new(0.0, 1.0, 1.0), 1.0);
        carve_box(&mut tree, Vec3::new(0.0, -1.0, -1.0), Vec3::new(1.0, 1.0, 1.0), 0.0);

        let topo = Topology::build(&tree);
        topo.verify(&tree).unwrap();

        let a = tree.leaf_at(Vec3::new(-0.5, 0.0, 0.0));
        let b = tree.leaf_at(Vec3::new(0.5, 0.0, 0.0));
        assert!(topo.are_neighbors(a, b));
        assert!(topo.neighbors(a, Face::PosX).contains(&b));
        assert!(topo.neighbors(b, Face::NegX).contains(&a));
    }

    #[test]
    fn outlier_flip_respects_threshold() {
        let mut tree = Tree::new(0.5).unwrap();
        carve_box(&mut tree, Vec3::new(-1.5, -1.5, -1.5), Vec3::new(1.5, 1.5, 1.5), 0.1);
        carve_box(&mut tree, Vec3::new(-0.5, -0.5, -0.5), Vec3::new(0.5, 0.5, 0.5), 0.9);

        let topo = Topology::build(&tree);
        topo.verify(&tree).unwrap();

        let mut loose = tree.clone();
        let summary = topo.remove_outliers(&mut loose, 0.6, &CancellationToken::new()).unwrap();
        assert!(summary.accepted > 0);
        let center = loose.leaf_at(Vec3::new(0.0, 0.0, 0.0));
        assert!(loose.node(center).payload().unwrap().probability() < 0.5);

        let mut strict = tree.clone();
        let summary_strict = topo.remove_outliers(&mut strict, 0.99, &CancellationToken::new()).unwrap();
        assert_eq!(summary_strict.accepted, 0);
        let center_strict = strict.leaf_at(Vec3::new(0.0, 0.0, 0.0));
        assert!(strict.node(center_strict).payload().unwrap().probability() > 0.5);
    }
}
