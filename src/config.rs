// Copyright 2016 spatial-rs Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The single options record accepted at the configuration surface (§6).

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// All tunables enumerated in §4.7, plus the tree's target resolution.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Options {
    /// Target leaf halfwidth `r` the tree subdivides down to.
    pub resolution: f64,
    /// Sigma threshold for region-pair coalescence.
    pub coalesce_distthresh: f64,
    /// Minimum planarity prior for a face to seed/join a region.
    pub coalesce_planethresh: f64,
    /// Use the isosurface-adjusted face position rather than the geometric center.
    pub use_isosurface_pos: bool,
    /// Fraction of disagreeing boundary area that marks a leaf an outlier.
    pub node_outlierthresh: f64,
    /// SVD singular-value ratio below which a basis direction is treated as kernel.
    pub min_singular_value: f64,
    /// Guard against near-colinear plane normals collapsing the kernel.
    pub max_colinearity: f64,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            resolution: 0.1,
            coalesce_distthresh: 2.0,
            coalesce_planethresh: 0.5,
            use_isosurface_pos: true,
            node_outlierthresh: 0.6,
            min_singular_value: 0.1,
            max_colinearity: 0.99,
        }
    }
}

impl Options {
    /// Rejects any field outside its documented range (§6: unrecognized or
    /// out-of-range configuration fields are rejected with an error).
    pub fn validate(&self) -> Result<()> {
        if !(self.resolution > 0.0 && self.resolution.is_finite()) {
            return Err(Error::InvalidInput(format!(
                "resolution must be positive and finite, got {}",
                self.resolution
            )));
        }
        if !(self.coalesce_distthresh > 0.0 && self.coalesce_distthresh.is_finite()) {
            return Err(Error::InvalidInput(format!(
                "coalesce_distthresh must be positive, got {}",
                self.coalesce_distthresh
            )));
        }
        if !(0.0..=1.0).contains(&self.coalesce_planethresh) {
            return Err(Error::InvalidInput(format!(
                "coalesce_planethresh must be in [0,1], got {}",
                self.coalesce_planethresh
            )));
        }
        if !(0.5..=1.0).contains(&self.node_outlierthresh) {
            return Err(Error::InvalidInput(format!(
                "node_outlierthresh must be in (0.5,1], got {}",
                self.node_outlierthresh
            )));
        }
        if !(self.min_singular_value > 0.0 && self.min_singular_value < 1.0) {
            return Err(Error::InvalidInput(format!(
                "min_singular_value must be in (0,1), got {}",
                self.min_singular_value
            )));
        }
        if !(0.0..=1.0).contains(&self.max_colinearity) {
            return Err(Error::InvalidInput(format!(
                "max_colinearity must be in [0,1], got {}",
                self.max_colinearity
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(Options::default().validate().is_ok());
    }

    #[test]
    fn rejects_out_of_range_outlier_threshold() {
        let mut opts = Options::default();
        opts.node_outlierthresh = 0.1;
        assert!(opts.validate().is_err());
    }

    #[test]
    fn rejects_negative_resolution() {
        let mut opts = Options::default();
        opts.resolution = -1.0;
        assert!(opts.validate().is_err());
    }
}
