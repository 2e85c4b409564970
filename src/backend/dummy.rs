// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! This file contains a dummy backend whose only purpose is to let the decoder
//! run so we can test it in isolation.
//!
//! Instead of reconstructing pixels, the backend fills every plane with a value derived from the
//! layer and POC of the picture, so tests can predict the decoded samples.

use crate::codec::mvd::parser::LayerId;
use crate::codec::mvd::parser::Sps;
use crate::codec::mvd::picture::PicturePlanes;
use crate::codec::mvd::refs::PicHandle;

/// The luma value the dummy backend writes into the picture with `poc` of `layer`.
pub fn sample_value(layer: LayerId, poc: i32) -> u8 {
    let value = i32::from(layer.view_idx) * 32 + i32::from(layer.is_depth) * 16 + poc;
    value.rem_euclid(256) as u8
}

/// Fills the planes the way the dummy backend does for a picture whose luma is `value`.
pub fn fill_planes(planes: &mut PicturePlanes, value: u8) {
    planes.luma.fill(value);
    planes.cb.fill(value / 2);
    planes.cr.fill(255 - value);
}

/// Dummy backend that records what the decoder asked of it.
#[derive(Debug, Default)]
pub struct Backend {
    /// Sequences started so far.
    pub sequences: Vec<Sps>,
    /// Layer and POC of every slice decoded.
    pub decoded_slices: Vec<(LayerId, i32)>,
    /// Pictures every decoded slice was bound to, texture last.
    pub bindings: Vec<Vec<PicHandle>>,
    /// Layer and POC of every picture submitted.
    pub submitted: Vec<(LayerId, i32)>,
}

impl Backend {
    /// Create a new dummy backend.
    pub fn new() -> Self {
        Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_values_differ_per_layer() {
        assert_ne!(
            sample_value(LayerId::texture(0), 0),
            sample_value(LayerId::depth(0), 0)
        );
        assert_ne!(
            sample_value(LayerId::texture(0), 0),
            sample_value(LayerId::texture(1), 0)
        );
        assert_eq!(sample_value(LayerId::texture(0), -1), 255);

        let mut planes = PicturePlanes::new(4, 4, Default::default());
        fill_planes(&mut planes, 10);
        assert!(planes.luma.iter().all(|&v| v == 10));
        assert!(planes.cb.iter().all(|&v| v == 5));
        assert!(planes.cr.iter().all(|&v| v == 245));
    }
}
