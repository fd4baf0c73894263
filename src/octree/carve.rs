// Copyright 2016 spatial-rs Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The shape-carving engine (C2): drives a pull-style ray-stream iterator
//! into the tree, and imports floorplan rooms as extruded polygons.

use log::debug;

use crate::cancel::CancellationToken;
use crate::error::{Error, ProcessingSummary, Result};
use crate::geometry::Vec3;
use crate::octree::node::Handle;
use crate::octree::shapes::{ExtrudedPolygon, RaySegment, Shape};
use crate::octree::Tree;

/// One item of the external ray stream (§6): a weighted line segment with
/// its three probabilistic priors, in meters.
#[derive(Debug, Clone, Copy)]
pub struct RayStreamItem {
    pub start: Vec3,
    pub end: Vec3,
    pub weight: f64,
    pub surface_prior: f64,
    pub planar_prior: f64,
    pub corner_prior: f64,
}

/// Drives shape insertion into a tree. Carries no state of its own; ordering
/// across segments is not guaranteed beyond the commutative merge law (§4.2).
#[derive(Debug, Default, Clone, Copy)]
pub struct ShapeCarver;

impl ShapeCarver {
    pub fn new() -> ShapeCarver {
        ShapeCarver
    }

    /// Consume a pull-style ray-stream iterator, carving each item into
    /// `tree`. Invalid items (malformed segment, zero weight) are skipped
    /// and counted rather than aborting the whole batch (§7). Checked for
    /// cancellation between items.
    pub fn carve_stream<I>(
        &self,
        tree: &mut Tree,
        rays: I,
        cancel: &CancellationToken,
    ) -> Result<ProcessingSummary>
    where
        I: IntoIterator<Item = RayStreamItem>,
    {
        let mut summary = ProcessingSummary::new();
        for item in rays {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            match RaySegment::new(
                item.start,
                item.end,
                item.weight,
                item.surface_prior,
                item.planar_prior,
                item.corner_prior,
            ) {
                Ok(ray) => match tree.insert_shape(&Shape::Ray(ray)) {
                    Ok(_) => summary.record_accepted(),
                    Err(e) => summary.record_skipped(e.to_string()),
                },
                Err(e) => summary.record_skipped(e.to_string()),
            }
        }
        debug!(
            "carved ray batch: {} accepted, {} skipped",
            summary.accepted, summary.skipped
        );
        Ok(summary)
    }

    /// Import a floorplan room's footprint, tagging intersected leaves with
    /// its room index. `hollow` toggles a boundary-only pass versus a full
    /// interior fill (§4.2).
    pub fn import_room(&self, tree: &mut Tree, polygon: ExtrudedPolygon) -> Result<Vec<Handle>> {
        tree.insert_shape(&Shape::ExtrudedPolygon(polygon))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ray(start: Vec3, end: Vec3) -> RayStreamItem {
        RayStreamItem {
            start,
            end,
            weight: 1.0,
            surface_prior: 0.5,
            planar_prior: 0.5,
            corner_prior: 0.5,
        }
    }

    #[test]
    fn skips_degenerate_items_but_keeps_going() {
        let mut tree = Tree::new(1.0).unwrap();
        let carver = ShapeCarver::new();
        let p = Vec3::new(0.0, 0.0, 0.0);
        let rays = vec![
            ray(p, p), // degenerate: start == end
            ray(p, Vec3::new(2.0, 0.0, 0.0)),
        ];
        let summary = carver
            .carve_stream(&mut tree, rays, &CancellationToken::new())
            .unwrap();
        assert_eq!(summary.accepted, 1);
        assert_eq!(summary.skipped, 1);
    }

    #[test]
    fn cancellation_is_observed_between_items() {
        let mut tree = Tree::new(1.0).unwrap();
        let carver = ShapeCarver::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let rays = vec![ray(Vec3::new(0.0, 0.0, 0.0), Vec3::new(1.0, 0.0, 0.0))];
        let result = carver.carve_stream(&mut tree, rays, &cancel);
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[test]
    fn merge_order_does_not_matter_for_disjoint_segments() {
        let mut tree_a = Tree::new(1.0).unwrap();
        let mut tree_b = Tree::new(1.0).unwrap();
        let carver = ShapeCarver::new();

        let sigma = vec![ray(Vec3::new(0.0, 0.0, 0.0), Vec3::new(1.0, 0.0, 0.0))];
        let tau = vec![ray(Vec3::new(0.0, 10.0, 0.0), Vec3::new(1.0, 10.0, 0.0))];

        carver
            .carve_stream(&mut tree_a, sigma.clone(), &CancellationToken::new())
            .unwrap();
        carver
            .carve_stream(&mut tree_a, tau.clone(), &CancellationToken::new())
            .unwrap();

        carver
            .carve_stream(&mut tree_b, tau, &CancellationToken::new())
            .unwrap();
        carver
            .carve_stream(&mut tree_b, sigma, &CancellationToken::new())
            .unwrap();

        let p1 = Vec3::new(0.9, 0.0, 0.0);
        let p2 = Vec3::new(0.9, 10.0, 0.0);
        let prob_a1 = tree_a.node(tree_a.leaf_at(p1)).payload().unwrap().probability();
        let prob_b1 = tree_b.node(tree_b.leaf_at(p1)).payload().unwrap().probability();
        let prob_a2 = tree_a.node(tree_a.leaf_at(p2)).payload().unwrap().probability();
        let prob_b2 = tree_b.node(tree_b.leaf_at(p2)).payload().unwrap().probability();
        assert!((prob_a1 - prob_b1).abs() < 1e-9);
        assert!((prob_a2 - prob_b2).abs() < 1e-9);
    }
}
