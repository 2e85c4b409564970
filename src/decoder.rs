// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

pub mod stateless;

use std::collections::VecDeque;

use anyhow::anyhow;

use crate::codec::mvd::camera::CameraParameterError;
use crate::codec::mvd::camera::CameraParameterRecord;
use crate::codec::mvd::dpb::DpbEntrySummary;
use crate::codec::mvd::parser::LayerId;
use crate::codec::mvd::parser::NaluType;
use crate::codec::mvd::parser::SeiMessage;
use crate::codec::mvd::parser::MAX_NUM_VIEWS;
use crate::codec::mvd::picture::PicturePlanes;

/// What to do when the references of a picture cannot be resolved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Stop decoding. Every further call fails until the decoder is torn down.
    #[default]
    AbortSession,
    /// Drop the picture and carry on with the next one.
    DropPicture,
}

/// Configuration of a decoder session. Validated once when the decoder is created and only read
/// afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecoderConfig {
    /// Number of pictures per layer DPB. Taken from the SPS if `None`.
    pub dpb_capacity: Option<usize>,
    /// Number of leading pictures of each layer to skip.
    pub skip_frames: u32,
    pub reference_failure: FailurePolicy,
    /// Retry missing future references mirrored around the current POC when the slice uses
    /// relative reference POCs. Only some unusual GOP structures rely on this.
    pub mirrored_poc_fallback: bool,
    /// Check decoded pictures against their picture hash SEI.
    pub verify_picture_hash: bool,
    /// Number of camera views the session may carry.
    pub max_views: usize,
    /// Fractional bits of the depth-to-disparity tables.
    pub lut_log2_precision: u32,
    /// Bit depth of the depth samples fed to the depth-to-disparity tables.
    pub lut_bit_depth: u32,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            dpb_capacity: None,
            skip_frames: 0,
            reference_failure: Default::default(),
            mirrored_poc_fallback: true,
            verify_picture_hash: true,
            max_views: MAX_NUM_VIEWS,
            lut_log2_precision: 2,
            lut_bit_depth: 8,
        }
    }
}

impl DecoderConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_views == 0 || self.max_views > MAX_NUM_VIEWS {
            return Err(anyhow!(
                "max_views must be between 1 and {}, got {}",
                MAX_NUM_VIEWS,
                self.max_views
            ));
        }

        if self.dpb_capacity == Some(0) {
            return Err(anyhow!("DPB capacity cannot be zero"));
        }

        if i32::try_from(self.skip_frames).is_err() {
            return Err(anyhow!("cannot skip {} pictures", self.skip_frames));
        }

        if self.lut_bit_depth == 0 || self.lut_bit_depth > 16 {
            return Err(anyhow!("unsupported LUT bit depth {}", self.lut_bit_depth));
        }

        if self.lut_log2_precision > self.lut_bit_depth {
            return Err(anyhow!(
                "LUT precision of {} bits exceeds the bit depth {}",
                self.lut_log2_precision,
                self.lut_bit_depth
            ));
        }

        Ok(())
    }
}

/// A decoded picture, handed out in display order per layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedPicture {
    pub layer: LayerId,
    pub poc: i32,
    pub planes: PicturePlanes,
    /// SEI messages that were attached to the picture.
    pub sei: Vec<SeiMessage>,
}

/// A picture of the store, as listed when an access unit completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEntry {
    pub layer: LayerId,
    pub picture: DpbEntrySummary,
}

/// Abnormal conditions the decoder can recover from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeWarning {
    /// Decoding started on a picture that is not a refresh point.
    UnsafeRandomAccessPoint {
        layer: LayerId,
        poc: i32,
        nalu_type: NaluType,
    },
    /// The decoded samples do not match the picture hash SEI.
    PictureHashMismatch { layer: LayerId, poc: i32 },
    /// The views of an access unit disagree on some camera parameter.
    InconsistentCameraParameters {
        poc: i32,
        error: CameraParameterError,
    },
}

/// Events that can be retrieved using the `next_event` method of a decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecoderEvent {
    /// The next picture of a layer is ready for display.
    FrameReady(DecodedPicture),
    /// Camera parameters of an access unit.
    CameraParameters(CameraParameterRecord),
    /// An access unit is complete. `store` lists the pictures left in every layer, sorted by
    /// POC.
    AccessUnitComplete { poc: i32, store: Vec<StoreEntry> },
    Warning(DecodeWarning),
}

/// A queue where events wait until they are retrieved.
#[derive(Default)]
struct EventQueue {
    /// Queue of all the events waiting to be sent to the client.
    queue: VecDeque<DecoderEvent>,
}

impl EventQueue {
    /// Push `event` to the back of the queue.
    fn push(&mut self, event: DecoderEvent) {
        self.queue.push_back(event)
    }

    fn clear(&mut self) {
        self.queue.clear()
    }
}

impl Extend<DecoderEvent> for EventQueue {
    fn extend<I: IntoIterator<Item = DecoderEvent>>(&mut self, iter: I) {
        self.queue.extend(iter)
    }
}

/// Allows us to manipulate the event list like an iterator without consuming it.
impl<'a> Iterator for &'a mut EventQueue {
    type Item = DecoderEvent;

    /// Returns the next event (if any) waiting to be dequeued.
    fn next(&mut self) -> Option<DecoderEvent> {
        self.queue.pop_front()
    }
}
