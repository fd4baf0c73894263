// Copyright 2016 spatial-rs Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Probabilistic octree volumetric reconstruction: carve noisy range-sensor
//! rays into an adaptive octree, derive face adjacency and a watertight
//! boundary, coalesce that boundary into planar regions, and mesh the
//! result.
//!
//! The pipeline runs front to back through this crate's modules:
//!
//! 1. [`octree`] -- the adaptive store ([`octree::Tree`]) and the shape
//!    carving engine ([`octree::carve::ShapeCarver`]) that subdivides and
//!    accumulates probabilistic leaf statistics ([`payload::LeafPayload`]).
//! 2. [`topology`] -- face-adjacent neighbor sets between leaves of
//!    possibly different depths, and outlier flipping.
//! 3. [`boundary`] -- the oriented interior/exterior face set.
//! 4. [`corner`] -- the shared-vertex map used both to link region
//!    adjacency implicitly and to drive mesh vertex discovery.
//! 5. [`region`] -- flood-filled, then coalesced, planar patches of the
//!    boundary.
//! 6. [`mesh`] -- snapped vertices and a watertight triangle mesh.

pub mod boundary;
pub mod cancel;
pub mod config;
pub mod corner;
pub mod error;
pub mod geometry;
pub mod mesh;
pub mod octree;
pub mod payload;
pub mod region;
pub mod topology;

pub use boundary::{Boundary, BoundaryFace, FaceId, Scheme};
pub use cancel::CancellationToken;
pub use config::Options;
pub use corner::CornerMap;
pub use error::{Error, ProcessingSummary, Result};
pub use geometry::{Aabb, Face, Plane, Vec3};
pub use mesh::Mesh;
pub use octree::carve::{RayStreamItem, ShapeCarver};
pub use octree::node::Handle;
pub use octree::Tree;
pub use payload::LeafPayload;
pub use region::{Region, RegionGraph, RegionId};
pub use topology::Topology;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Vec3;
    use crate::octree::shapes::{BoundingBoxShape, Shape};

    /// End-to-end smoke test: carve a cube, build every derived layer in
    /// order, and check the final mesh is a closed manifold.
    #[test]
    fn full_pipeline_runs_end_to_end_on_a_solid_cube() {
        let _ = env_logger::try_init();

        let options = Options::default();
        options.validate().unwrap();

        let mut tree = Tree::new(options.resolution).unwrap();
        let shape = Shape::BoundingBox(
            BoundingBoxShape::new(
                Aabb::new(Vec3::new(-1.0, -1.0, -1.0), Vec3::new(1.0, 1.0, 1.0)),
                1.0,
                1.0,
                1.0,
            )
            .unwrap(),
        );
        tree.insert_shape(&shape).unwrap();

        let topo = Topology::build(&tree);
        topo.verify(&tree).unwrap();

        let cancel = CancellationToken::new();
        topo.remove_outliers(&mut tree, options.node_outlierthresh, &cancel).unwrap();

        let boundary = Boundary::extract(&tree, &topo, Scheme::All);
        assert!(!boundary.is_empty());

        let corners = CornerMap::add(&tree, &boundary);
        assert!(!corners.is_empty());

        let mut regions = RegionGraph::form(&tree, &boundary, &options);
        regions.coalesce(&tree, &boundary, &options, &cancel).unwrap();
        assert!(!regions.is_empty());

        let mesh = Mesh::build(&tree, &boundary, &corners, &regions, &options).unwrap();
        assert!(!mesh.vertices.is_empty());
        assert!(!mesh.triangles.is_empty());
        mesh.verify_manifold().unwrap();
    }
}
