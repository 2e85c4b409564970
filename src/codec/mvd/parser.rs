// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! NAL unit headers, parameter sets and slice headers of the multiview plus depth syntax.
//!
//! Entropy decoding of the payloads happens upstream: parameter sets and slice headers reach
//! this crate already parsed. Only the NAL unit header itself is read from raw bytes here.

use std::collections::BTreeMap;

use anyhow::anyhow;
use bitreader::BitReader;
use bytes::Bytes;
use enumn::N;
use thiserror::Error;

/// Maximum number of camera views supported by the decoder.
pub const MAX_NUM_VIEWS: usize = 16;
/// Maximum number of entries of a single reference picture list.
pub const MAX_NUM_REF: usize = 16;

/// NAL unit type codes.
#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum NaluType {
    #[default]
    Unspecified = 0,
    CodedSlice = 1,
    CodedSliceDataPartA = 2,
    CodedSliceDataPartB = 3,
    CodedSliceCdr = 4,
    CodedSliceIdr = 5,
    Sei = 6,
    Sps = 7,
    Pps = 8,
    AccessUnitDelimiter = 9,
    EndOfSequence = 10,
    EndOfStream = 11,
    FillerData = 12,
    Reserved13 = 13,
    Aps = 14,
}

impl NaluType {
    /// Whether this NAL unit carries a coded slice handled by the decoder.
    pub fn is_slice(&self) -> bool {
        matches!(
            self,
            NaluType::CodedSlice | NaluType::CodedSliceCdr | NaluType::CodedSliceIdr
        )
    }

    pub fn is_idr(&self) -> bool {
        matches!(self, NaluType::CodedSliceIdr)
    }

    pub fn is_cdr(&self) -> bool {
        matches!(self, NaluType::CodedSliceCdr)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NaluHeader {
    /// The NALU type.
    pub type_: NaluType,
    /// Non-zero if the picture this unit belongs to is used for reference.
    pub nal_ref_idc: u8,
    /// Temporal layer of a coded slice.
    pub temporal_id: u8,
    /// Whether the picture is meant for output.
    pub output_flag: bool,
}

impl NaluHeader {
    /// Parses the header at the start of `data`.
    pub fn parse(data: &[u8]) -> anyhow::Result<Self> {
        let first = data.first().ok_or(anyhow!("Empty NALU"))?;
        let mut r = BitReader::new(std::slice::from_ref(first));

        if r.read_bool()? {
            return Err(anyhow!("forbidden_zero_bit is set"));
        }

        let nal_ref_idc = r.read_u8(2)?;
        let type_ = NaluType::n(r.read_u8(5)?).ok_or(anyhow!("Invalid NALU type"))?;

        let mut hdr = Self {
            type_,
            nal_ref_idc,
            temporal_id: 0,
            output_flag: true,
        };

        if type_.is_slice() {
            let second = data
                .get(1)
                .ok_or(anyhow!("Slice NALU header is truncated"))?;
            let mut r = BitReader::new(std::slice::from_ref(second));
            hdr.temporal_id = r.read_u8(3)?;
            hdr.output_flag = r.read_bool()?;
            // reserved_one_4bits
            r.skip(4)?;
        }

        Ok(hdr)
    }

    /// Length of the header in bytes.
    pub fn len(&self) -> usize {
        if self.type_.is_slice() {
            2
        } else {
            1
        }
    }

    pub fn is_reference(&self) -> bool {
        self.nal_ref_idc != 0
    }
}

/// Identifies a decoding layer: one camera view, either its texture or its depth map.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LayerId {
    pub view_idx: u8,
    pub is_depth: bool,
}

impl LayerId {
    pub fn texture(view_idx: u8) -> Self {
        Self {
            view_idx,
            is_depth: false,
        }
    }

    pub fn depth(view_idx: u8) -> Self {
        Self {
            view_idx,
            is_depth: true,
        }
    }
}

/// Coding tree unit geometry of a sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CtuGeometry {
    pub width: u32,
    pub height: u32,
    /// Maximum partitioning depth.
    pub depth: u32,
}

impl Default for CtuGeometry {
    fn default() -> Self {
        Self {
            width: 64,
            height: 64,
            depth: 4,
        }
    }
}

/// Scale and offset of one directed view pair, as coded in the stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScaleOffset {
    pub scale: i32,
    pub offset: i32,
}

/// Coded camera parameters of a view relative to each of its base views.
///
/// `forward[base]` converts depth of the base view into disparity towards this view, and
/// `inverse[base]` the other way around. Both are coded independently.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CodedCameraParameters {
    pub forward: Vec<ScaleOffset>,
    pub inverse: Vec<ScaleOffset>,
}

impl CodedCameraParameters {
    /// Returns the `(forward, inverse)` pair towards `base_view`, if coded.
    pub fn for_base(&self, base_view: usize) -> Option<(ScaleOffset, ScaleOffset)> {
        Some((*self.forward.get(base_view)?, *self.inverse.get(base_view)?))
    }
}

/// A sequence parameter set.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Sps {
    pub seq_parameter_set_id: u8,
    pub view_idx: u8,
    pub view_order_idx: i32,
    pub is_depth: bool,
    pub width: u32,
    pub height: u32,
    pub ctu: CtuGeometry,
    /// Number of picture buffers the layer needs.
    pub max_dec_pic_buffering: usize,
    /// Precision of the coded camera parameters.
    pub cam_par_precision: u32,
    /// Camera parameters are coded per slice instead of once in this set.
    pub cam_par_in_slice_header: bool,
    pub camera_parameters: CodedCameraParameters,
    /// Inter-view prediction from generated depth maps is enabled.
    pub depth_map_generation: bool,
}

impl Sps {
    pub fn layer(&self) -> LayerId {
        LayerId {
            view_idx: self.view_idx,
            is_depth: self.is_depth,
        }
    }
}

/// A picture parameter set.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Pps {
    pub pic_parameter_set_id: u8,
    pub seq_parameter_set_id: u8,
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SliceType {
    B = 0,
    P = 1,
    #[default]
    I = 2,
}

/// How the POCs of the reference entries of a slice are expressed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RefPocMode {
    /// Entries carry the POC of the referenced picture.
    #[default]
    Absolute,
    /// Entries carry an offset to the POC of the current picture.
    Relative,
}

/// A slice header, as produced by the upstream syntax parser.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SliceHeader {
    pub nalu_type: NaluType,
    pub nal_ref_idc: u8,
    pub pic_parameter_set_id: u8,
    pub poc: i32,
    pub view_idx: u8,
    pub is_depth: bool,
    pub slice_type: SliceType,
    /// The first slice of its picture.
    pub first_slice_in_picture: bool,
    /// Starts a new slice. Entropy slices continuing the previous one have this unset.
    pub next_slice: bool,
    pub num_ref_idx: [usize; 2],
    pub ref_poc_mode: RefPocMode,
    pub ref_poc_list: [Vec<i32>; 2],
    pub ref_view_list: [Vec<u8>; 2],
    pub ref_pic_list_combination: bool,
    pub ref_pic_list_modification_lc: bool,
    /// Per-slice camera parameters, only meaningful when the SPS defers them to slices.
    pub camera_parameters: CodedCameraParameters,
}

impl SliceHeader {
    pub fn layer(&self) -> LayerId {
        LayerId {
            view_idx: self.view_idx,
            is_depth: self.is_depth,
        }
    }

    /// Number of active entries of reference list `list`.
    pub fn num_active_refs(&self, list: usize) -> usize {
        match (self.slice_type, list) {
            (SliceType::I, _) | (SliceType::P, 1) => 0,
            _ => self.num_ref_idx[list]
                .min(self.ref_poc_list[list].len())
                .min(self.ref_view_list[list].len()),
        }
    }

    /// Absolute POC requested by entry `idx` of list `list`.
    pub fn ref_poc(&self, list: usize, idx: usize) -> Option<i32> {
        let value = *self.ref_poc_list[list].get(idx)?;
        match self.ref_poc_mode {
            RefPocMode::Absolute => Some(value),
            RefPocMode::Relative => Some(self.poc + value),
        }
    }

    pub fn ref_view(&self, list: usize, idx: usize) -> Option<u8> {
        self.ref_view_list[list].get(idx).copied()
    }
}

/// MD5 digests of the three planes of a decoded picture.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PictureHash {
    pub md5: [[u8; 16]; 3],
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SeiMessage {
    DecodedPictureHash(PictureHash),
    /// Any payload the decoder does not interpret. It is carried along with the picture.
    Opaque { payload_type: u32, payload: Bytes },
}

/// Parsed content of a NAL unit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NaluPayload {
    Sps(Sps),
    Pps(Pps),
    Sei(Vec<SeiMessage>),
    Slice(SliceHeader),
    /// Units carrying no payload the decoder needs.
    Empty,
}

/// A NAL unit whose payload has been parsed upstream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Nalu {
    pub header: NaluHeader,
    pub payload: NaluPayload,
}

impl Nalu {
    pub fn sps(sps: Sps) -> Self {
        Self::with_type(NaluType::Sps, NaluPayload::Sps(sps))
    }

    pub fn pps(pps: Pps) -> Self {
        Self::with_type(NaluType::Pps, NaluPayload::Pps(pps))
    }

    pub fn sei(messages: Vec<SeiMessage>) -> Self {
        Self::with_type(NaluType::Sei, NaluPayload::Sei(messages))
    }

    pub fn slice(hdr: SliceHeader) -> Self {
        Self {
            header: NaluHeader {
                type_: hdr.nalu_type,
                nal_ref_idc: hdr.nal_ref_idc,
                temporal_id: 0,
                output_flag: true,
            },
            payload: NaluPayload::Slice(hdr),
        }
    }

    pub fn with_type(type_: NaluType, payload: NaluPayload) -> Self {
        Self {
            header: NaluHeader {
                type_,
                nal_ref_idc: 0,
                temporal_id: 0,
                output_flag: true,
            },
            payload,
        }
    }
}

#[derive(Debug, Error)]
pub enum ParameterSetError {
    /// The SPS belongs to another layer. It is handed back so the caller can route it.
    #[error(
        "SPS {} of view {} (depth: {}) does not belong to this layer",
        .0.seq_parameter_set_id,
        .0.view_idx,
        .0.is_depth
    )]
    Foreign(Box<Sps>),
    #[error("PPS {pps_id} references unknown SPS {sps_id}")]
    UnknownSps { pps_id: u8, sps_id: u8 },
    #[error("slice references unknown PPS {0}")]
    UnknownPps(u8),
}

/// Holds the parameter sets of one decoding layer.
#[derive(Debug, Default)]
pub struct Parser {
    target: LayerId,
    active_spses: BTreeMap<u8, Sps>,
    active_ppses: BTreeMap<u8, Pps>,
    /// Id of the SPS activated last.
    cur_sps_id: Option<u8>,
}

impl Parser {
    /// Creates a cache accepting only the parameter sets of `target`.
    pub fn new(target: LayerId) -> Self {
        Self {
            target,
            ..Default::default()
        }
    }

    pub fn target(&self) -> LayerId {
        self.target
    }

    /// Activates `sps`, replacing any previous set with the same id.
    pub fn activate_sps(&mut self, sps: Sps) -> Result<&Sps, ParameterSetError> {
        if sps.layer() != self.target {
            return Err(ParameterSetError::Foreign(Box::new(sps)));
        }

        let id = sps.seq_parameter_set_id;
        log::debug!("Activating SPS {} for layer {:?}", id, self.target);

        self.cur_sps_id = Some(id);
        self.active_spses.insert(id, sps);
        Ok(&self.active_spses[&id])
    }

    /// Activates `pps`, which must reference a known SPS.
    pub fn activate_pps(&mut self, pps: Pps) -> Result<&Pps, ParameterSetError> {
        let pps_id = pps.pic_parameter_set_id;
        let sps_id = pps.seq_parameter_set_id;

        if !self.active_spses.contains_key(&sps_id) {
            return Err(ParameterSetError::UnknownSps { pps_id, sps_id });
        }

        self.active_ppses.insert(pps_id, pps);
        Ok(&self.active_ppses[&pps_id])
    }

    /// Whether both an SPS and a PPS referencing it are available.
    pub fn is_ready(&self) -> bool {
        match self.cur_sps_id {
            Some(sps_id) => self
                .active_ppses
                .values()
                .any(|pps| pps.seq_parameter_set_id == sps_id),
            None => false,
        }
    }

    pub fn has_sps(&self, sps_id: u8) -> bool {
        self.active_spses.contains_key(&sps_id)
    }

    /// Returns a previously activated sps given `sps_id`, if any.
    pub fn get_sps(&self, sps_id: u8) -> Option<&Sps> {
        self.active_spses.get(&sps_id)
    }

    /// Returns a previously activated pps given `pps_id`, if any.
    pub fn get_pps(&self, pps_id: u8) -> Option<&Pps> {
        self.active_ppses.get(&pps_id)
    }

    /// The SPS activated last.
    pub fn active_sps(&self) -> Option<&Sps> {
        self.get_sps(self.cur_sps_id?)
    }

    /// Looks up the PPS referenced by a slice and the SPS behind it.
    pub fn sets_for_slice(&self, pps_id: u8) -> Result<(&Sps, &Pps), ParameterSetError> {
        let pps = self
            .get_pps(pps_id)
            .ok_or(ParameterSetError::UnknownPps(pps_id))?;
        let sps = self
            .get_sps(pps.seq_parameter_set_id)
            .ok_or(ParameterSetError::UnknownSps {
                pps_id,
                sps_id: pps.seq_parameter_set_id,
            })?;

        Ok((sps, pps))
    }

    /// Drops every parameter set.
    pub fn clear(&mut self) {
        let target = self.target;
        *self = Self::new(target);
    }
}
