// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::codec::mvd::parser::CtuGeometry;
use crate::codec::mvd::parser::LayerId;
use crate::codec::mvd::parser::NaluType;
use crate::codec::mvd::parser::SeiMessage;
use crate::codec::mvd::parser::SliceHeader;
use crate::codec::mvd::parser::Sps;
use crate::Resolution;

/// Data associated with a picture. Most fields are extracted from the first slice header and
/// kept for future processing.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PictureData {
    pub nalu_type: NaluType,
    pub poc: i32,
    pub layer: LayerId,
    pub view_order_idx: i32,
    pub output_flag: bool,

    // Internal state.
    reference: bool,
    /// Holds reconstructed samples that may still be referenced or displayed.
    pub reconstructed: bool,
    /// Has been handed to the output consumer.
    pub displayed: bool,
}

impl PictureData {
    /// Instantiates a new `PictureData` from the first slice of a picture.
    pub fn new_from_slice(hdr: &SliceHeader, sps: &Sps, output_flag: bool) -> Self {
        Self {
            nalu_type: hdr.nalu_type,
            poc: hdr.poc,
            layer: hdr.layer(),
            view_order_idx: sps.view_order_idx,
            output_flag,
            reference: hdr.nal_ref_idc != 0,
            reconstructed: false,
            displayed: false,
        }
    }

    /// Whether the picture is used for reference.
    pub fn is_ref(&self) -> bool {
        self.reference
    }

    pub fn set_reference(&mut self, reference: bool) {
        if self.reference != reference {
            log::debug!(
                "Set reference of POC {} (layer {:?}) to {}",
                self.poc,
                self.layer,
                reference
            );
        }

        self.reference = reference;
    }
}

/// Reconstructed 8-bit 4:2:0 samples of a picture.
///
/// The planes are written by the pixel-decode backend. The decoder only allocates them and
/// tracks whether the border padding used by motion compensation is up to date.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PicturePlanes {
    pub resolution: Resolution,
    pub geometry: CtuGeometry,
    pub luma: Vec<u8>,
    pub cb: Vec<u8>,
    pub cr: Vec<u8>,
    border_extended: bool,
}

impl PicturePlanes {
    pub fn new(width: u32, height: u32, geometry: CtuGeometry) -> Self {
        let mut planes = Self::default();
        planes.reshape(width, height, geometry);
        planes
    }

    /// Resizes the planes for a new sequence, reusing the allocations.
    pub fn reshape(&mut self, width: u32, height: u32, geometry: CtuGeometry) {
        let resolution = Resolution::from((width, height));
        let chroma = Resolution::from((width.div_ceil(2), height.div_ceil(2)));

        self.resolution = resolution;
        self.geometry = geometry;
        self.luma.resize(resolution.get_area(), 0);
        self.cb.resize(chroma.get_area(), 0);
        self.cr.resize(chroma.get_area(), 0);
        self.border_extended = false;
    }

    /// Marks the border padding as extended. The padding itself is done by the backend.
    pub fn extend_border(&mut self) {
        self.border_extended = true;
    }

    pub fn reset_border(&mut self) {
        self.border_extended = false;
    }

    pub fn is_border_extended(&self) -> bool {
        self.border_extended
    }

    /// MD5 digests of the luma and both chroma planes.
    pub fn md5(&self) -> [[u8; 16]; 3] {
        [
            md5::compute(&self.luma).0,
            md5::compute(&self.cb).0,
            md5::compute(&self.cr).0,
        ]
    }
}

/// A picture buffer of the DPB.
///
/// `A` is the type of the heavyweight per-picture side buffers of the backend.
#[derive(Debug)]
pub struct Picture<A> {
    pub data: PictureData,
    pub planes: PicturePlanes,
    /// Headers of the slices decoded so far.
    pub slices: Vec<SliceHeader>,
    /// SEI messages received ahead of the first slice.
    pub sei: Vec<SeiMessage>,
    /// Backend side buffers, dropped once the access unit is complete.
    pub aux: Option<A>,
}

impl<A> Picture<A> {
    pub fn new(width: u32, height: u32, geometry: CtuGeometry) -> Self {
        Self {
            data: Default::default(),
            planes: PicturePlanes::new(width, height, geometry),
            slices: Default::default(),
            sei: Default::default(),
            aux: None,
        }
    }

    /// Prepares a recycled buffer for a new picture.
    pub(crate) fn recycle(&mut self, width: u32, height: u32, geometry: CtuGeometry) {
        self.data.set_reference(false);
        self.data.reconstructed = false;
        self.data.displayed = false;
        self.planes.reshape(width, height, geometry);
        self.slices.clear();
        self.sei.clear();
        self.aux = None;
    }
}
