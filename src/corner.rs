// Copyright 2016 spatial-rs Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The corner map (C5): maps node corners (shared vertices of boundary
//! faces) to the set of incident boundary faces and the dual graph's edges.

use std::collections::{HashMap, HashSet};

use crate::boundary::{Boundary, FaceId};
use crate::geometry::{corner_position, octant_sign_vec, Face, Vec3};
use crate::octree::Tree;

/// Canonical corner identity: the world position, quantized so that corners
/// computed from different leaves (possibly different halfwidths) that
/// coincide geometrically collapse to the same key. This plays the role of
/// the "(finest-node, finest-corner-index)" canonical form: any leaf that
/// touches the corner yields the same quantized position.
pub type CornerKey = (i64, i64, i64);

const QUANTIZE_SCALE: f64 = 1.0e6;

fn quantize(v: f64) -> i64 {
    (v * QUANTIZE_SCALE).round() as i64
}

pub fn corner_key(p: Vec3) -> CornerKey {
    (quantize(p.x), quantize(p.y), quantize(p.z))
}

/// The four octant indices touching `direction`'s face, ordered cyclically
/// around the face so that consecutive pairs (wrapping) are quad edges.
pub fn face_corner_indices(direction: Face) -> [usize; 4] {
    let axis = direction.axis();
    let sign = direction.sign();
    let other_axes: Vec<usize> = (0..3).filter(|&a| a != axis).collect();
    let mut indices: Vec<usize> = (0..8).filter(|&i| octant_sign_vec(i)[axis] == sign).collect();
    indices.sort_by(|&a, &b| {
        let va = octant_sign_vec(a);
        let vb = octant_sign_vec(b);
        let angle_a = va[other_axes[1]].atan2(va[other_axes[0]]);
        let angle_b = vb[other_axes[1]].atan2(vb[other_axes[0]]);
        angle_a.partial_cmp(&angle_b).unwrap()
    });
    [indices[0], indices[1], indices[2], indices[3]]
}

#[derive(Debug, Clone)]
struct CornerEntry {
    position: Vec3,
    faces: Vec<FaceId>,
}

/// Corner-to-incident-faces map, plus the dual graph's edges.
#[derive(Debug, Clone, Default)]
pub struct CornerMap {
    entries: HashMap<CornerKey, CornerEntry>,
}

impl CornerMap {
    /// For every boundary face, register its four corners and record the
    /// face as incident on each (§4.5).
    pub fn add(tree: &Tree, boundary: &Boundary) -> CornerMap {
        let mut map = CornerMap::default();
        for (i, face) in boundary.faces.iter().enumerate() {
            let id = FaceId(i as u32);
            let leaf = tree.node(face.interior);
            for &corner_idx in &face_corner_indices(face.direction) {
                let p = corner_position(leaf.center, leaf.half_width, corner_idx);
                let key = corner_key(p);
                let entry = map.entries.entry(key).or_insert_with(|| CornerEntry {
                    position: p,
                    faces: Vec::new(),
                });
                if !entry.faces.contains(&id) {
                    entry.faces.push(id);
                }
            }
        }
        map
    }

    /// The dual graph's edges: pairs of corners sharing a boundary
    /// face-edge, canonicalized so `(a, b)` orders `a <= b`.
    pub fn populate_edges(&self, tree: &Tree, boundary: &Boundary) -> Vec<(CornerKey, CornerKey)> {
        let mut edges = HashSet::new();
        for face in &boundary.faces {
            let leaf = tree.node(face.interior);
            let indices = face_corner_indices(face.direction);
            let keys: Vec<CornerKey> = indices
                .iter()
                .map(|&idx| corner_key(corner_position(leaf.center, leaf.half_width, idx)))
                .collect();
            for i in 0..keys.len() {
                let a = keys[i];
                let b = keys[(i + 1) % keys.len()];
                let edge = if a <= b { (a, b) } else { (b, a) };
                edges.insert(edge);
            }
        }
        edges.into_iter().collect()
    }

    pub fn faces_for(&self, key: CornerKey) -> &[FaceId] {
        self.entries.get(&key).map(|e| e.faces.as_slice()).unwrap_or(&[])
    }

    pub fn position_of(&self, key: CornerKey) -> Option<Vec3> {
        self.entries.get(&key).map(|e| e.position)
    }

    pub fn keys(&self) -> impl Iterator<Item = CornerKey> + '_ {
        self.entries.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
