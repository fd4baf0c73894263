// Copyright 2016 spatial-rs Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The adaptive octree store (C1): domain growth, shape-driven subdivision,
//! and leaf lookup. Payload merge/subdivide/flip laws live in
//! [`crate::payload`]; shape kinds live in [`shapes`].

pub mod carve;
pub mod node;
pub mod shapes;

use log::debug;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

use crate::error::{Error, Result};
use crate::geometry::{child_center, octant_of_sign, Aabb, Vec3};
use crate::payload::LeafPayload;
use node::{Arena, Handle, Node, NodeKind};
use shapes::{Intersection, Shape, ShapeGeometry};

/// An adaptive 8-way spatial index with per-leaf probabilistic payloads.
#[derive(Debug, Clone)]
pub struct Tree {
    arena: Arena,
    root: Handle,
    resolution: f64,
    max_depth: u32,
}

impl Tree {
    /// A new, empty tree whose root is a single leaf of halfwidth `resolution`.
    pub fn new(resolution: f64) -> Result<Tree> {
        if !(resolution > 0.0 && resolution.is_finite()) {
            return Err(Error::InvalidInput(format!(
                "resolution must be positive and finite, got {resolution}"
            )));
        }
        let mut arena = Arena::new();
        let root = arena.push(Node::new_leaf(Vec3::zeros(), resolution));
        Ok(Tree {
            arena,
            root,
            resolution,
            max_depth: 0,
        })
    }

    pub fn resolution(&self) -> f64 {
        self.resolution
    }

    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }

    pub fn root(&self) -> Handle {
        self.root
    }

    pub fn node(&self, handle: Handle) -> &Node {
        self.arena.get(handle)
    }

    pub fn node_mut(&mut self, handle: Handle) -> &mut Node {
        self.arena.get_mut(handle)
    }

    pub fn node_box(&self, handle: Handle) -> Aabb {
        let n = self.arena.get(handle);
        Aabb::cube(n.center, n.half_width)
    }

    pub fn is_leaf(&self, handle: Handle) -> bool {
        self.arena.get(handle).is_leaf()
    }

    pub fn leaf_count(&self) -> usize {
        self.arena.iter_handles().filter(|&h| self.is_leaf(h)).count()
    }

    pub fn leaves(&self) -> impl Iterator<Item = Handle> + '_ {
        self.arena.iter_handles().filter(move |&h| self.is_leaf(h))
    }

    /// Change the target leaf resolution and recompute `max_depth` for the
    /// current domain size. Does not retroactively refine or coarsen.
    pub fn set_resolution(&mut self, resolution: f64) -> Result<()> {
        if !(resolution > 0.0 && resolution.is_finite()) {
            return Err(Error::InvalidInput(format!(
                "resolution must be positive and finite, got {resolution}"
            )));
        }
        self.resolution = resolution;
        self.recompute_max_depth();
        Ok(())
    }

    fn recompute_max_depth(&mut self) {
        let root_hw = self.arena.get(self.root).half_width;
        let mut depth = 0u32;
        let mut hw = root_hw;
        while hw > self.resolution {
            hw /= 2.0;
            depth += 1;
        }
        self.max_depth = depth;
    }

    /// Grow the domain (reparenting the root inside a larger cube, as many
    /// times as needed) until it contains `p`.
    pub fn insert_point(&mut self, p: Vec3) -> Handle {
        self.grow_to_contain(&p);
        self.leaf_at(p)
    }

    fn grow_to_contain(&mut self, p: &Vec3) {
        while !self.node_box(self.root).contains_point(p) {
            let old_root = self.root;
            let old = self.arena.get(old_root).clone();
            let dir = *p - old.center;
            let new_half_width = old.half_width * 2.0;
            let new_center = old.center + sign_vec(&dir) * old.half_width;
            let quadrant = octant_of_sign(&(old.center - new_center));

            let mut children = [Handle(0); 8];
            for i in 0..8 {
                if i == quadrant {
                    children[i] = old_root;
                } else {
                    let c_center = child_center(new_center, new_half_width, i);
                    children[i] = self.arena.push(Node::new_leaf(c_center, old.half_width));
                }
            }
            self.root = self.arena.push(Node {
                center: new_center,
                half_width: new_half_width,
                kind: NodeKind::Internal(children),
            });
            self.recompute_max_depth();
            debug!(
                "domain grew to halfwidth {} to contain point",
                new_half_width
            );
        }
    }

    /// Walk down to the leaf containing `p`. Panics if `p` lies outside the
    /// current domain; callers that may be out of bounds should
    /// `insert_point` first.
    pub fn leaf_at(&self, p: Vec3) -> Handle {
        let mut current = self.root;
        loop {
            let node = self.arena.get(current);
            match &node.kind {
                NodeKind::Leaf(_) => return current,
                NodeKind::Internal(children) => {
                    let dir = p - node.center;
                    let q = octant_of_sign(&dir);
                    current = children[q];
                }
            }
        }
    }

    /// Insert a shape, subdividing as necessary, and return every leaf the
    /// shape's merge law touched.
    pub fn insert_shape(&mut self, shape: &Shape) -> Result<Vec<Handle>> {
        let aabb = shape.aabb();
        if aabb.is_degenerate() {
            return Err(Error::InvalidInput(
                "shape's bounding box has collapsed to a point".into(),
            ));
        }
        self.grow_to_contain(&aabb.min);
        self.grow_to_contain(&aabb.max);

        let mut affected = Vec::new();
        self.insert_rec(self.root, shape, 0, &mut affected);
        Ok(affected)
    }

    fn insert_rec(&mut self, handle: Handle, shape: &Shape, depth: u32, affected: &mut Vec<Handle>) {
        let node_box = self.node_box(handle);
        let is_leaf = self.arena.get(handle).is_leaf();
        match (shape.test(&node_box), is_leaf) {
            (Intersection::Disjoint, _) => {}
            (Intersection::Inside, true) => self.apply_leaf(handle, shape, &node_box, affected),
            (Intersection::Straddles, true) if depth >= self.max_depth => {
                self.apply_leaf(handle, shape, &node_box, affected)
            }
            (Intersection::Straddles, true) => {
                self.subdivide(handle);
                self.recurse_children(handle, shape, depth, affected);
            }
            (_, false) => self.recurse_children(handle, shape, depth, affected),
        }
    }

    fn recurse_children(&mut self, handle: Handle, shape: &Shape, depth: u32, affected: &mut Vec<Handle>) {
        let children = match &self.arena.get(handle).kind {
            NodeKind::Internal(children) => *children,
            NodeKind::Leaf(_) => unreachable!("recurse_children called on a leaf"),
        };
        for child in children {
            self.insert_rec(child, shape, depth + 1, affected);
        }
    }

    fn apply_leaf(&mut self, handle: Handle, shape: &Shape, node_box: &Aabb, affected: &mut Vec<Handle>) {
        let payload = self.arena.get_mut(handle).payload_or_default_mut();
        shape.apply_to_leaf(payload, node_box);
        payload.is_carved = true;
        affected.push(handle);
    }

    /// Split a leaf into eight children, dividing its payload (if any)
    /// among them per the merge law's `subdivide(8)`.
    fn subdivide(&mut self, handle: Handle) {
        let node = self.arena.get(handle).clone();
        let parent_payload = match &node.kind {
            NodeKind::Leaf(p) => p.clone(),
            NodeKind::Internal(_) => panic!("subdivide called on an internal node"),
        };
        let child_payload = parent_payload.map(|p| p.subdivide(8));
        let child_half_width = node.half_width / 2.0;

        let mut children = [Handle(0); 8];
        for i in 0..8 {
            let c_center = child_center(node.center, node.half_width, i);
            let mut child = Node::new_leaf(c_center, child_half_width);
            if let Some(cp) = child_payload {
                child.kind = NodeKind::Leaf(Some(cp));
            }
            children[i] = self.arena.push(child);
        }
        *self.arena.get_mut(handle) = Node {
            center: node.center,
            half_width: node.half_width,
            kind: NodeKind::Internal(children),
        };
    }

    pub fn serialize_into<W: Write>(&self, w: &mut W) -> Result<()> {
        let mut nodes = Vec::with_capacity(self.arena.len());
        flatten(&self.arena, self.root, &mut nodes);
        let data = TreeData {
            version: FORMAT_VERSION,
            resolution: self.resolution,
            root_center: [self.arena.get(self.root).center.x, self.arena.get(self.root).center.y, self.arena.get(self.root).center.z],
            root_half_width: self.arena.get(self.root).half_width,
            nodes,
        };
        bincode::serialize_into(w, &data).map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))
    }

    pub fn parse_from<R: Read>(r: &mut R) -> Result<Tree> {
        let data: TreeData = bincode::deserialize_from(r)
            .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
        let mut arena = Arena::new();
        let center = Vec3::new(data.root_center[0], data.root_center[1], data.root_center[2]);
        let mut idx = 0usize;
        let root = parse_rec(&data, &mut idx, &mut arena, center, data.root_half_width)?;
        if idx != data.nodes.len() {
            return Err(Error::InconsistentTopology(
                "serialized node list had trailing data".into(),
            ));
        }
        let mut tree = Tree {
            arena,
            root,
            resolution: data.resolution,
            max_depth: 0,
        };
        tree.recompute_max_depth();
        Ok(tree)
    }
}

fn sign_vec(v: &Vec3) -> Vec3 {
    let s = |x: f64| if x >= 0.0 { 1.0 } else { -1.0 };
    Vec3::new(s(v.x), s(v.y), s(v.z))
}

const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct SerializedPayload {
    count: u64,
    total_weight: f64,
    prob_sum: f64,
    prob_sum_sq: f64,
    surface_sum: f64,
    corner_sum: f64,
    planar_sum: f64,
    fp_room: i64,
    is_carved: bool,
}

/// Version-0 payload shape, predating `corner_sum`/`planar_sum`/`is_carved`.
#[derive(Debug, Serialize, Deserialize)]
struct SerializedPayloadV0 {
    count: u64,
    total_weight: f64,
    prob_sum: f64,
    prob_sum_sq: f64,
    surface_sum: f64,
    fp_room: i64,
}

#[derive(Debug, Serialize, Deserialize)]
enum SerializedPayloadAny {
    V0(SerializedPayloadV0),
    V1(SerializedPayload),
}

#[derive(Debug, Serialize, Deserialize)]
struct SerializedNode {
    has_children: bool,
    payload: Option<SerializedPayloadAny>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TreeData {
    version: u32,
    resolution: f64,
    root_center: [f64; 3],
    root_half_width: f64,
    nodes: Vec<SerializedNode>,
}

fn flatten(arena: &Arena, handle: Handle, out: &mut Vec<SerializedNode>) {
    let node = arena.get(handle);
    match &node.kind {
        NodeKind::Leaf(payload) => {
            out.push(SerializedNode {
                has_children: false,
                payload: payload.as_ref().map(|p| {
                    SerializedPayloadAny::V1(SerializedPayload {
                        count: p.count,
                        total_weight: p.total_weight,
                        prob_sum: p.prob_sum,
                        prob_sum_sq: p.prob_sum_sq,
                        surface_sum: p.surface_sum,
                        corner_sum: p.corner_sum,
                        planar_sum: p.planar_sum,
                        fp_room: p.fp_room,
                        is_carved: p.is_carved,
                    })
                }),
            });
        }
        NodeKind::Internal(children) => {
            out.push(SerializedNode {
                has_children: true,
                payload: None,
            });
            for &child in children {
                flatten(arena, child, out);
            }
        }
    }
}

fn payload_from_serialized(any: &SerializedPayloadAny) -> LeafPayload {
    match any {
        SerializedPayloadAny::V1(p) => LeafPayload {
            count: p.count,
            total_weight: p.total_weight,
            prob_sum: p.prob_sum,
            prob_sum_sq: p.prob_sum_sq,
            surface_sum: p.surface_sum,
            corner_sum: p.corner_sum,
            planar_sum: p.planar_sum,
            fp_room: p.fp_room,
            is_carved: p.is_carved,
        },
        SerializedPayloadAny::V0(p) => LeafPayload {
            count: p.count,
            total_weight: p.total_weight,
            prob_sum: p.prob_sum,
            prob_sum_sq: p.prob_sum_sq,
            surface_sum: p.surface_sum,
            corner_sum: 0.0,
            planar_sum: 0.0,
            fp_room: p.fp_room,
            is_carved: false,
        },
    }
}

fn parse_rec(
    data: &TreeData,
    idx: &mut usize,
    arena: &mut Arena,
    center: Vec3,
    half_width: f64,
) -> Result<Handle> {
    let desc = data
        .nodes
        .get(*idx)
        .ok_or_else(|| Error::InconsistentTopology("serialized node list ended early".into()))?;
    *idx += 1;
    if desc.has_children {
        let mut children = [Handle(0); 8];
        for (i, child) in children.iter_mut().enumerate() {
            let c_center = child_center(center, half_width, i);
            *child = parse_rec(data, idx, arena, c_center, half_width / 2.0)?;
        }
        Ok(arena.push(Node {
            center,
            half_width,
            kind: NodeKind::Internal(children),
        }))
    } else {
        let payload = desc.payload.as_ref().map(payload_from_serialized);
        Ok(arena.push(Node {
            center,
            half_width,
            kind: NodeKind::Leaf(payload),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::octree::shapes::RaySegment;
    use approx::assert_relative_eq;

    #[test]
    fn single_ray_carve_is_monotonic_along_the_ray() {
        let mut tree = Tree::new(1.0).unwrap();
        let ray = Shape::Ray(
            RaySegment::new(
                Vec3::new(0.0, 0.0, 0.0),
                Vec3::new(10.0, 0.0, 0.0),
                1.0,
                0.5,
                0.5,
                0.5,
            )
            .unwrap(),
        );
        tree.insert_shape(&ray).unwrap();

        let near_end = tree.leaf_at(Vec3::new(9.9, 0.0, 0.0));
        let near_start = tree.leaf_at(Vec3::new(0.1, 0.0, 0.0));
        let p_end = tree.node(near_end).payload().unwrap().probability();
        let p_start = tree.node(near_start).payload().unwrap().probability();
        assert!(p_end > 0.5, "p_end={p_end}");
        assert!(p_start < 0.5, "p_start={p_start}");
    }

    #[test]
    fn domain_grows_to_contain_far_points_and_keeps_old_payloads() {
        let mut tree = Tree::new(1.0).unwrap();
        let ray = Shape::Ray(
            RaySegment::new(
                Vec3::new(0.0, 0.0, 0.0),
                Vec3::new(1.0, 0.0, 0.0),
                1.0,
                0.5,
                0.5,
                0.5,
            )
            .unwrap(),
        );
        tree.insert_shape(&ray).unwrap();
        let leaf_before = tree.leaf_at(Vec3::new(0.9, 0.0, 0.0));
        let payload_before = tree.node(leaf_before).payload().cloned();

        let far = tree.insert_point(Vec3::new(100.0, 0.0, 0.0));
        let root_hw = tree.node(tree.root()).half_width;
        assert!(root_hw >= 100.0);
        assert!(tree.node_box(tree.root()).contains_point(&Vec3::new(100.0, 0.0, 0.0)));
        assert!(tree.node(far).is_leaf());

        let leaf_after = tree.leaf_at(Vec3::new(0.9, 0.0, 0.0));
        assert_eq!(tree.node(leaf_after).payload().cloned(), payload_before);
    }

    #[test]
    fn rejects_degenerate_shape() {
        let mut tree = Tree::new(1.0).unwrap();
        let p = Vec3::new(0.0, 0.0, 0.0);
        let degenerate = RaySegment::new(p, p, 1.0, 0.5, 0.5, 0.5);
        assert!(degenerate.is_err());
        let _ = tree.insert_shape(&Shape::Ray(
            RaySegment::new(p, Vec3::new(1.0, 0.0, 0.0), 1.0, 0.5, 0.5, 0.5).unwrap(),
        ));
    }

    #[test]
    fn serialize_round_trips() {
        let mut tree = Tree::new(1.0).unwrap();
        let ray = Shape::Ray(
            RaySegment::new(
                Vec3::new(0.0, 0.0, 0.0),
                Vec3::new(5.0, 0.0, 0.0),
                1.0,
                0.4,
                0.6,
                0.2,
            )
            .unwrap(),
        );
        tree.insert_shape(&ray).unwrap();

        let mut buf = Vec::new();
        tree.serialize_into(&mut buf).unwrap();
        let restored = Tree::parse_from(&mut buf.as_slice()).unwrap();

        assert_eq!(restored.leaf_count(), tree.leaf_count());
        assert_relative_eq!(restored.resolution(), tree.resolution());
        let p = tree.node(tree.leaf_at(Vec3::new(4.9, 0.0, 0.0))).payload().unwrap().probability();
        let p2 = restored
            .node(restored.leaf_at(Vec3::new(4.9, 0.0, 0.0)))
            .payload()
            .unwrap()
            .probability();
        assert_relative_eq!(p, p2, epsilon = 1e-9);
    }
}
