// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

#[cfg(any(test, fuzzing))]
mod dummy;

use std::collections::BTreeMap;
use std::collections::VecDeque;

use anyhow::Context;

use crate::codec::mvd::camera::CameraParameterCollector;
use crate::codec::mvd::camera::CameraParameterRecord;
use crate::codec::mvd::camera::CameraParameterTable;
use crate::codec::mvd::dpb::Dpb;
use crate::codec::mvd::dpb::DpbSlot;
use crate::codec::mvd::parser::LayerId;
use crate::codec::mvd::parser::Nalu;
use crate::codec::mvd::parser::NaluPayload;
use crate::codec::mvd::parser::NaluType;
use crate::codec::mvd::parser::ParameterSetError;
use crate::codec::mvd::parser::Parser;
use crate::codec::mvd::parser::Pps;
use crate::codec::mvd::parser::SeiMessage;
use crate::codec::mvd::parser::SliceHeader;
use crate::codec::mvd::parser::Sps;
use crate::codec::mvd::picture::Picture;
use crate::codec::mvd::picture::PictureData;
use crate::codec::mvd::refs::InterViewPicture;
use crate::codec::mvd::refs::PicHandle;
use crate::codec::mvd::refs::ReferencePicLists;
use crate::codec::mvd::refs::ReferencePictureResolver;
use crate::decoder::stateless::DecodeError;
use crate::decoder::stateless::DecodingState;
use crate::decoder::stateless::SessionState;
use crate::decoder::stateless::StatelessBackendResult;
use crate::decoder::stateless::StatelessCodec;
use crate::decoder::stateless::StatelessDecoder;
use crate::decoder::stateless::StatelessDecoderBackendPicture;
use crate::decoder::stateless::StatelessVideoDecoder;
use crate::decoder::DecodeWarning;
use crate::decoder::DecodedPicture;
use crate::decoder::DecoderConfig;
use crate::decoder::DecoderEvent;
use crate::decoder::FailurePolicy;
use crate::decoder::StoreEntry;

/// Stateless backend methods specific to the multiview plus depth decoder.
///
/// The backend does the pixel reconstruction. `Self::Picture` holds its per-picture side buffers,
/// which are dropped once the access unit of the picture is complete.
pub trait StatelessMvdDecoderBackend: StatelessDecoderBackendPicture<Mvd> {
    /// Called when a new SPS is parsed.
    fn new_sequence(&mut self, sps: &Sps) -> StatelessBackendResult<()>;

    /// Called when the decoder determines that a new picture was found.
    fn new_picture(
        &mut self,
        picture: &PictureData,
        sps: &Sps,
        pps: &Pps,
    ) -> StatelessBackendResult<Self::Picture>;

    /// Called to dispatch a decode operation to the backend.
    ///
    /// `refs` gives access to the pictures bound in `ref_lists`.
    #[allow(clippy::too_many_arguments)]
    fn decode_slice(
        &mut self,
        picture: &mut Picture<Self::Picture>,
        slice: &SliceHeader,
        sps: &Sps,
        pps: &Pps,
        ref_lists: &ReferencePicLists,
        refs: &PictureLookup<Self::Picture>,
        camera: &CameraParameterTable,
    ) -> StatelessBackendResult<()>;

    /// Called when the decoder wants the backend to finish the decoding
    /// operations for `picture`. At this point, `decode_slice` has been called
    /// for all slices.
    fn submit_picture(
        &mut self,
        picture: &mut Picture<Self::Picture>,
    ) -> StatelessBackendResult<()>;
}

/// Read access to the stored pictures of every layer.
pub struct PictureLookup<'a, A> {
    layers: &'a BTreeMap<LayerId, MvdLayer<A>>,
}

impl<'a, A> PictureLookup<'a, A> {
    pub fn get(&self, handle: PicHandle) -> Option<&'a Picture<A>> {
        self.layers.get(&handle.layer)?.dpb.get(handle.slot)
    }
}

/// Random access state of a layer.
#[derive(Debug, Clone, Copy, Default)]
struct RandomAccess {
    /// Pictures left to skip at the start of the stream.
    skip_frames: u32,
    /// Pictures with a lower POC are skipped. `None` until the entry point is known.
    poc_ra: Option<i32>,
}

/// Decoding state of one (view, texture or depth) layer.
struct MvdLayer<A> {
    id: LayerId,
    parser: Parser,
    dpb: Dpb<A>,
    /// POC of the last picture decoded or skipped.
    prev_poc: Option<i32>,
    random_access: RandomAccess,
    last_displayed_poc: i32,
}

impl<A> MvdLayer<A> {
    fn new(id: LayerId, config: &DecoderConfig) -> Self {
        Self {
            id,
            parser: Parser::new(id),
            dpb: Dpb::new(config.dpb_capacity.unwrap_or(1)),
            prev_poc: None,
            random_access: RandomAccess {
                skip_frames: config.skip_frames,
                poc_ra: None,
            },
            last_displayed_poc: i32::try_from(config.skip_frames)
                .unwrap_or(i32::MAX)
                .saturating_sub(1),
        }
    }

    /// Decides whether the picture starting with `hdr` is skipped.
    ///
    /// The first decoded picture sets the entry point. An instantaneous refresh makes every later
    /// picture decodable, anything else makes the pictures with a lower POC undecodable. Entry
    /// points that are not refresh points are reported.
    ///
    /// `refresh` is set for the pictures of an access unit whose base view is an IDR picture.
    fn random_access_skip(
        &mut self,
        hdr: &SliceHeader,
        refresh: bool,
    ) -> (bool, Option<DecodeWarning>) {
        if self.random_access.skip_frames > 0 {
            self.random_access.skip_frames -= 1;
            return (true, None);
        }

        let refresh = refresh || hdr.nalu_type.is_idr();
        match self.random_access.poc_ra {
            None => {
                let mut warning = None;
                let poc_ra = if refresh {
                    i32::MIN
                } else {
                    if !hdr.nalu_type.is_cdr() {
                        warning = Some(DecodeWarning::UnsafeRandomAccessPoint {
                            layer: self.id,
                            poc: hdr.poc,
                            nalu_type: hdr.nalu_type,
                        });
                    }
                    hdr.poc
                };

                log::debug!(
                    "Layer {:?} enters the stream at POC {} ({:?})",
                    self.id,
                    hdr.poc,
                    hdr.nalu_type
                );

                self.random_access.poc_ra = Some(poc_ra);
                self.last_displayed_poc = self.last_displayed_poc.max(hdr.poc.saturating_sub(1));
                (false, warning)
            }
            Some(_) if refresh => {
                self.random_access.poc_ra = Some(i32::MIN);
                (false, None)
            }
            Some(poc_ra) => (hdr.poc < poc_ra, None),
        }
    }

    /// Starts over at an instantaneous refresh with `poc`: hands out every picture still waiting
    /// for display and frees all the buffers.
    fn refresh(&mut self, poc: i32) -> Vec<DecodedPicture> {
        log::debug!("Refresh of layer {:?} at POC {}", self.id, poc);

        let ready = self.output_pictures(true);

        self.dpb.mark_unreferenced(&[]);
        let live = self
            .dpb
            .live_pictures()
            .map(|(slot, _)| slot)
            .collect::<Vec<_>>();
        for slot in live {
            self.dpb.retire(slot);
        }

        self.last_displayed_poc = poc.saturating_sub(1);
        ready
    }

    /// Hands out the pictures that are next in display order, then retires the pictures that
    /// are neither waiting for display nor used for reference.
    ///
    /// When `drain` is set, every picture still waiting is handed out.
    fn output_pictures(&mut self, drain: bool) -> Vec<DecodedPicture> {
        self.dpb.sort_by_poc();

        let waiting = self
            .dpb
            .live_pictures()
            .filter(|(_, pic)| !pic.data.displayed)
            .map(|(slot, _)| slot)
            .collect::<Vec<_>>();

        let mut ready = vec![];
        for slot in waiting {
            let Some(pic) = self.dpb.get_mut(slot) else {
                continue;
            };

            let poc = pic.data.poc;
            if !drain && poc != self.last_displayed_poc.saturating_add(1) {
                continue;
            }

            pic.data.displayed = true;
            self.last_displayed_poc = self.last_displayed_poc.max(poc);

            if pic.data.output_flag {
                log::debug!("Output POC {} of layer {:?}", poc, self.id);
                ready.push(DecodedPicture {
                    layer: self.id,
                    poc,
                    planes: pic.planes.clone(),
                    sei: pic.sei.clone(),
                });
            }
        }

        let last_displayed_poc = self.last_displayed_poc;
        let unused = self
            .dpb
            .live_pictures()
            .filter(|(_, pic)| {
                !pic.data.is_ref() && (pic.data.displayed || pic.data.poc <= last_displayed_poc)
            })
            .map(|(slot, _)| slot)
            .collect::<Vec<_>>();

        for slot in unused {
            self.dpb.retire(slot);
        }

        ready
    }

    /// Forgets the random access entry point, for a new coded video sequence.
    fn reset_random_access(&mut self) {
        self.random_access.poc_ra = None;
        self.prev_poc = None;
        self.last_displayed_poc = -1;
    }
}

/// A slice waiting to be processed.
struct PilotSlice {
    hdr: SliceHeader,
    output_flag: bool,
}

/// One slice of lookahead. A slice that turns out to start a new picture is kept here while the
/// current picture is finished, then processed again.
#[derive(Default)]
struct SlicePilot {
    pending: Option<PilotSlice>,
    /// The pending slice was already deferred once without being consumed since.
    replayed: bool,
}

impl SlicePilot {
    fn take_pending_or_next(&mut self, incoming: &mut Option<PilotSlice>) -> Option<PilotSlice> {
        self.pending.take().or_else(|| incoming.take())
    }

    /// Keeps `slice` to be processed again. A slice may only be deferred once in a row.
    fn defer(&mut self, slice: PilotSlice) -> Result<(), DecodeError> {
        if self.replayed {
            self.reset();
            return Err(DecodeError::ReplayLoop {
                poc: slice.hdr.poc,
            });
        }

        self.replayed = true;
        self.pending = Some(slice);
        Ok(())
    }

    fn consumed(&mut self) {
        self.replayed = false;
    }

    fn reset(&mut self) {
        self.pending = None;
        self.replayed = false;
    }
}

/// What became of a slice handed to [`StatelessDecoder::assemble_slice`].
enum SliceDisposition {
    Consumed,
    /// The slice starts a new picture and must be processed again.
    Replay(PilotSlice),
}

/// Identifies the picture a slice belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PictureKey {
    layer: LayerId,
    poc: i32,
    pps_id: u8,
}

impl PictureKey {
    fn of(hdr: &SliceHeader) -> Self {
        Self {
            layer: hdr.layer(),
            poc: hdr.poc,
            pps_id: hdr.pic_parameter_set_id,
        }
    }

    /// Whether `hdr` continues this picture. Entropy slices always continue it, other slices
    /// only if they share its POC and PPS.
    fn continued_by(&self, hdr: &SliceHeader) -> bool {
        self.layer == hdr.layer()
            && !hdr.first_slice_in_picture
            && (!hdr.next_slice
                || (hdr.poc == self.poc && hdr.pic_parameter_set_id == self.pps_id))
    }
}

/// State of the picture being currently decoded.
///
/// Stored between calls to [`StatelessDecoder::handle_slice`] that belong to the same picture.
struct CurrentPicState<B: StatelessDecoderBackendPicture<Mvd>> {
    key: PictureKey,
    /// Buffer the picture is decoded into.
    slot: DpbSlot,
    picture: Picture<B::Picture>,
    sps: Sps,
    pps: Pps,
    /// Reference lists of the last slice.
    ref_lists: ReferencePicLists,
}

enum Assembly<B: StatelessDecoderBackendPicture<Mvd>> {
    Idle,
    Decoding(CurrentPicState<B>),
    /// The remaining slices of a skipped or dropped picture are ignored.
    Skipping(PictureKey),
}

impl<B: StatelessDecoderBackendPicture<Mvd>> Default for Assembly<B> {
    fn default() -> Self {
        Assembly::Idle
    }
}

pub struct MvdDecoderState<B: StatelessDecoderBackendPicture<Mvd>> {
    /// Layers in view order, texture before depth.
    layers: BTreeMap<LayerId, MvdLayer<B::Picture>>,

    camera: CameraParameterCollector<VecDeque<CameraParameterRecord>>,

    resolver: ReferencePictureResolver,

    pilot: SlicePilot,

    /// The picture currently being assembled. We need to preserve it between
    /// calls to `decode` because multiple slices will be processed in different
    /// calls to `decode`.
    current: Assembly<B>,

    /// POC of the access unit in progress.
    au_poc: Option<i32>,

    /// Pictures completed in the access unit in progress, in decoding order.
    au_pictures: Vec<InterViewPicture>,

    /// The base view of the access unit in progress is an IDR picture.
    au_refresh: bool,

    /// SEI messages waiting for the next picture.
    pending_sei: Vec<SeiMessage>,
}

impl<B: StatelessDecoderBackendPicture<Mvd>> MvdDecoderState<B> {
    fn new(config: &DecoderConfig) -> anyhow::Result<Self> {
        let mut camera = CameraParameterCollector::new(VecDeque::new(), config.max_views)?;
        camera.set_lut_format(config.lut_log2_precision, config.lut_bit_depth);

        Ok(Self {
            layers: Default::default(),
            camera,
            resolver: ReferencePictureResolver::new(config.mirrored_poc_fallback),
            pilot: Default::default(),
            current: Default::default(),
            au_poc: None,
            au_pictures: Default::default(),
            au_refresh: false,
            pending_sei: Default::default(),
        })
    }

    /// The camera parameters and depth-to-disparity tables of the access unit in progress.
    pub fn camera_parameters(&self) -> &CameraParameterTable {
        self.camera.table()
    }
}

/// [`StatelessCodec`] structure to use in order to create a multiview plus depth stateless
/// decoder.
///
/// # Accepted input
///
/// A decoder using this codec processes exactly one NAL unit per call to
/// [`StatelessVideoDecoder::decode`]. The payload of the unit must have been parsed already.
pub struct Mvd;

impl StatelessCodec for Mvd {
    type FormatInfo = Sps;
    type DecoderState<B: StatelessDecoderBackendPicture<Self>> = MvdDecoderState<B>;
}

impl<B> StatelessDecoder<Mvd, B>
where
    B: StatelessMvdDecoderBackend,
{
    pub fn new(backend: B, config: DecoderConfig) -> anyhow::Result<Self> {
        config.validate()?;

        Ok(Self {
            codec: MvdDecoderState::new(&config)?,
            backend,
            config,
            events: Default::default(),
            decoding_state: Default::default(),
        })
    }

    fn process_sps(&mut self, sps: Sps) -> Result<(), DecodeError> {
        let layer_id = sps.layer();
        if usize::from(sps.view_idx) >= self.config.max_views {
            return Err(DecodeError::ProtocolError(format!(
                "SPS {} is for view {}, but only {} views are configured",
                sps.seq_parameter_set_id, sps.view_idx, self.config.max_views
            )));
        }

        let config = &self.config;
        let layer = self.codec.layers.entry(layer_id).or_insert_with(|| {
            log::debug!("New layer {:?}", layer_id);
            MvdLayer::new(layer_id, config)
        });

        let sps = layer.parser.activate_sps(sps)?;

        let capacity = config
            .dpb_capacity
            .unwrap_or(sps.max_dec_pic_buffering)
            .max(1);
        if let Err(e) = layer.dpb.set_max_num_pics(capacity) {
            log::warn!("Keeping the DPB size of layer {:?}: {:#}", layer_id, e);
        }

        self.backend.new_sequence(sps)?;

        Ok(())
    }

    /// Delivers `pps` to every layer that knows the SPS it references.
    fn process_pps(&mut self, pps: Pps) -> Result<(), DecodeError> {
        let pps_id = pps.pic_parameter_set_id;
        let sps_id = pps.seq_parameter_set_id;

        let mut delivered = false;
        for layer in self
            .codec
            .layers
            .values_mut()
            .filter(|layer| layer.parser.has_sps(sps_id))
        {
            layer.parser.activate_pps(pps.clone())?;
            delivered = true;
        }

        if !delivered {
            return Err(ParameterSetError::UnknownSps { pps_id, sps_id }.into());
        }

        Ok(())
    }

    fn process_slice(&mut self, hdr: SliceHeader, output_flag: bool) -> Result<(), DecodeError> {
        if self.decoding_state != DecodingState::Decoding {
            return Err(DecodeError::ProtocolError(format!(
                "slice of POC {} received before any parameter set was ready",
                hdr.poc
            )));
        }

        let mut incoming = Some(PilotSlice { hdr, output_flag });
        self.codec.pilot.reset();

        while let Some(slice) = self.codec.pilot.take_pending_or_next(&mut incoming) {
            match self.assemble_slice(slice)? {
                SliceDisposition::Consumed => self.codec.pilot.consumed(),
                SliceDisposition::Replay(slice) => {
                    log::debug!(
                        "Slice of POC {} (layer {:?}) starts a new picture",
                        slice.hdr.poc,
                        slice.hdr.layer()
                    );
                    self.codec.pilot.defer(slice)?;
                }
            }
        }

        Ok(())
    }

    /// Adds `slice` to the picture being assembled, or finishes that picture if `slice` does not
    /// belong to it.
    fn assemble_slice(&mut self, slice: PilotSlice) -> Result<SliceDisposition, DecodeError> {
        let layer_id = slice.hdr.layer();
        let layer = self.codec.layers.get(&layer_id).ok_or_else(|| {
            DecodeError::ProtocolError(format!(
                "slice for view {} (depth: {}) without an SPS",
                layer_id.view_idx, layer_id.is_depth
            ))
        })?;
        if !layer.parser.is_ready() {
            return Err(DecodeError::ProtocolError(format!(
                "slice for view {} (depth: {}) before its parameter sets",
                layer_id.view_idx, layer_id.is_depth
            )));
        }

        match std::mem::take(&mut self.codec.current) {
            Assembly::Decoding(cur) if cur.key.continued_by(&slice.hdr) => {
                self.decode_slice(cur, &slice.hdr)?;
                Ok(SliceDisposition::Consumed)
            }
            Assembly::Skipping(key) if key.continued_by(&slice.hdr) => {
                self.codec.current = Assembly::Skipping(key);
                Ok(SliceDisposition::Consumed)
            }
            Assembly::Decoding(cur) => {
                self.finish_picture(cur)?;
                Ok(SliceDisposition::Replay(slice))
            }
            Assembly::Skipping(_) => Ok(SliceDisposition::Replay(slice)),
            Assembly::Idle => {
                self.start_picture(&slice)?;
                Ok(SliceDisposition::Consumed)
            }
        }
    }

    /// Processes the first slice of a picture.
    fn start_picture(&mut self, slice: &PilotSlice) -> Result<(), DecodeError> {
        let hdr = &slice.hdr;
        let layer_id = hdr.layer();

        // The base texture view always opens a new access unit, even if the POC repeats.
        if let Some(au_poc) = self.codec.au_poc {
            if au_poc != hdr.poc || layer_id == LayerId::texture(0) {
                self.complete_access_unit(au_poc)?;
            }
        }
        self.codec.au_poc = Some(hdr.poc);
        if layer_id == LayerId::texture(0) {
            self.codec.au_refresh = hdr.nalu_type.is_idr();
        }

        let layer = self
            .codec
            .layers
            .get_mut(&layer_id)
            .context("Slice layer is gone")?;

        let (skip, warning) = layer.random_access_skip(hdr, self.codec.au_refresh);
        if skip {
            log::debug!("Skipping picture POC {} of layer {:?}", hdr.poc, layer_id);
            layer.prev_poc = Some(hdr.poc);
            self.codec.pending_sei.clear();
            self.codec.current = Assembly::Skipping(PictureKey::of(hdr));
            return Ok(());
        }

        // Pictures before an instantaneous refresh are never referenced again, even if their POC
        // comes back.
        if hdr.nalu_type.is_idr() || self.codec.au_refresh {
            let ready = layer.refresh(hdr.poc);
            self.codec.au_pictures.retain(|pic| pic.handle.layer != layer_id);
            self.events
                .extend(ready.into_iter().map(DecoderEvent::FrameReady));
        }

        if let Some(warning) = warning {
            log::warn!("{:?}, decoding may be corrupted", warning);
            self.push_event(DecoderEvent::Warning(warning));
        }

        let cur = self.begin_picture(hdr, slice.output_flag)?;
        self.decode_slice(cur, hdr)
    }

    fn begin_picture(
        &mut self,
        hdr: &SliceHeader,
        output_flag: bool,
    ) -> Result<CurrentPicState<B>, DecodeError> {
        let layer_id = hdr.layer();
        let layer = self
            .codec
            .layers
            .get_mut(&layer_id)
            .context("Slice layer is gone")?;

        let (sps, pps) = layer.parser.sets_for_slice(hdr.pic_parameter_set_id)?;
        let (sps, pps) = (sps.clone(), pps.clone());

        log::debug!(
            "Decode picture POC {} of layer {:?} ({:?})",
            hdr.poc,
            layer_id,
            hdr.nalu_type
        );

        let data = PictureData::new_from_slice(hdr, &sps, output_flag);
        let aux = self.backend.new_picture(&data, &sps, &pps)?;

        let (slot, mut picture) = layer.dpb.acquire(sps.width, sps.height, sps.ctu)?;
        picture.data = data;
        picture.sei = std::mem::take(&mut self.codec.pending_sei);
        picture.aux = Some(aux);

        Ok(CurrentPicState {
            key: PictureKey::of(hdr),
            slot,
            picture,
            sps,
            pps,
            ref_lists: Default::default(),
        })
    }

    /// Decodes `hdr` into `cur`. The picture is dropped if that fails.
    fn decode_slice(
        &mut self,
        mut cur: CurrentPicState<B>,
        hdr: &SliceHeader,
    ) -> Result<(), DecodeError> {
        match self.handle_slice(&mut cur, hdr) {
            Ok(()) => {
                self.codec.current = Assembly::Decoding(cur);
                Ok(())
            }
            Err(e) => {
                log::warn!(
                    "Dropping picture POC {} of layer {:?}: {}",
                    cur.key.poc,
                    cur.key.layer,
                    e
                );

                self.codec.current = Assembly::Skipping(cur.key);
                self.discard_picture(cur)?;
                Err(e)
            }
        }
    }

    /// Handle a slice. Called once per slice NALU.
    fn handle_slice(
        &mut self,
        cur: &mut CurrentPicState<B>,
        hdr: &SliceHeader,
    ) -> Result<(), DecodeError> {
        let layer_id = cur.key.layer;
        let poc = hdr.poc;

        match self.codec.camera.observe_slice(Some((hdr, &cur.sps))) {
            Ok(()) => (),
            Err(error) if error.is_recoverable() => self.push_event(DecoderEvent::Warning(
                DecodeWarning::InconsistentCameraParameters { poc, error },
            )),
            Err(e) => return Err(e.into()),
        }

        // Lower views of the same kind, already decoded in this access unit. The latest picture
        // of a layer wins.
        let mut siblings = Vec::<InterViewPicture>::new();
        for pic in self.codec.au_pictures.iter().rev() {
            let id = pic.handle.layer;
            if id.is_depth == layer_id.is_depth
                && id.view_idx < layer_id.view_idx
                && pic.poc == poc
                && !siblings.iter().any(|s| s.handle.layer == id)
            {
                siblings.push(*pic);
            }
        }

        let texture = if layer_id.is_depth {
            let texture_id = LayerId::texture(layer_id.view_idx);
            self.codec
                .au_pictures
                .iter()
                .rev()
                .find(|pic| pic.handle.layer == texture_id && pic.poc == poc)
                .copied()
        } else {
            None
        };

        let layer = self
            .codec
            .layers
            .get_mut(&layer_id)
            .context("Slice layer is gone")?;

        layer.dpb.decoding_refresh_marking(poc, hdr.nalu_type);

        let ref_lists =
            self.codec
                .resolver
                .resolve(hdr, &mut layer.dpb, &siblings, texture.as_ref())?;

        for entry in ref_lists.entries().filter(|e| e.handle.layer != layer_id) {
            if let Some(layer) = self.codec.layers.get_mut(&entry.handle.layer) {
                layer.dpb.extend_border(entry.handle.slot);
            }
        }

        self.backend.decode_slice(
            &mut cur.picture,
            hdr,
            &cur.sps,
            &cur.pps,
            &ref_lists,
            &PictureLookup {
                layers: &self.codec.layers,
            },
            self.codec.camera.table(),
        )?;

        cur.picture.slices.push(hdr.clone());
        cur.ref_lists = ref_lists;

        Ok(())
    }

    fn finish_picture(&mut self, mut cur: CurrentPicState<B>) -> Result<(), DecodeError> {
        log::debug!(
            "Finishing picture POC {} of layer {:?}, {} slices",
            cur.key.poc,
            cur.key.layer,
            cur.picture.slices.len()
        );

        if let Err(e) = self.backend.submit_picture(&mut cur.picture) {
            self.discard_picture(cur)?;
            return Err(e.into());
        }

        if self.config.verify_picture_hash {
            self.verify_picture_hash(&cur.picture);
        }

        let layer = self
            .codec
            .layers
            .get_mut(&cur.key.layer)
            .context("Picture layer is gone")?;

        layer.prev_poc = Some(cur.key.poc);
        layer.dpb.commit(cur.slot, cur.picture)?;

        self.codec.au_pictures.push(InterViewPicture {
            poc: cur.key.poc,
            view_idx: cur.key.layer.view_idx,
            handle: PicHandle {
                layer: cur.key.layer,
                slot: cur.slot,
            },
        });

        Ok(())
    }

    fn verify_picture_hash(&mut self, picture: &Picture<B::Picture>) {
        let expected = picture.sei.iter().find_map(|sei| match sei {
            SeiMessage::DecodedPictureHash(hash) => Some(hash),
            _ => None,
        });

        if let Some(expected) = expected {
            if expected.md5 != picture.planes.md5() {
                let warning = DecodeWarning::PictureHashMismatch {
                    layer: picture.data.layer,
                    poc: picture.data.poc,
                };
                log::warn!("{:?}", warning);
                self.push_event(DecoderEvent::Warning(warning));
            } else {
                log::trace!("Picture hash of POC {} matches", picture.data.poc);
            }
        }
    }

    /// Gives the buffer of a picture that will not be completed back to its DPB.
    fn discard_picture(&mut self, cur: CurrentPicState<B>) -> Result<(), DecodeError> {
        let layer = self
            .codec
            .layers
            .get_mut(&cur.key.layer)
            .context("Picture layer is gone")?;

        layer.dpb.discard(cur.slot, cur.picture)?;

        Ok(())
    }

    /// Finishes the picture being assembled, if any.
    fn end_picture(&mut self) -> Result<(), DecodeError> {
        self.codec.pilot.reset();

        match std::mem::take(&mut self.codec.current) {
            Assembly::Decoding(cur) => self.finish_picture(cur),
            Assembly::Skipping(_) | Assembly::Idle => Ok(()),
        }
    }

    /// Closes the access unit with `poc`: emits its camera parameters, the pictures that are
    /// next in display order and a listing of the stores.
    fn complete_access_unit(&mut self, poc: i32) -> Result<(), DecodeError> {
        log::debug!("Access unit with POC {} complete", poc);
        self.codec.au_poc = None;
        self.codec.au_pictures.clear();
        self.codec.au_refresh = false;

        let flushed = self.codec.camera.flush(poc);
        self.drain_camera_records();
        flushed?;

        for layer in self.codec.layers.values_mut() {
            if let Err(e) = layer.dpb.release(poc) {
                log::debug!("Layer {:?}: {}", layer.id, e);
            }
        }

        self.output_pictures(false);

        let mut store = self
            .codec
            .layers
            .iter()
            .flat_map(|(id, layer)| {
                layer.dpb.snapshot().into_iter().map(|picture| StoreEntry {
                    layer: *id,
                    picture,
                })
            })
            .collect::<Vec<_>>();
        store.sort_by_key(|entry| entry.picture.poc);

        self.push_event(DecoderEvent::AccessUnitComplete { poc, store });

        Ok(())
    }

    /// Finishes the current picture and access unit.
    fn end_access_unit(&mut self) -> Result<(), DecodeError> {
        self.end_picture()?;

        if let Some(poc) = self.codec.au_poc {
            self.complete_access_unit(poc)?;
        }

        Ok(())
    }

    fn drain_camera_records(&mut self) {
        self.events.extend(
            self.codec
                .camera
                .sink_mut()
                .drain(..)
                .map(DecoderEvent::CameraParameters),
        );
    }

    fn output_pictures(&mut self, drain: bool) {
        for layer in self.codec.layers.values_mut() {
            let ready = layer.output_pictures(drain);
            self.events
                .extend(ready.into_iter().map(DecoderEvent::FrameReady));
        }
    }

    fn drain(&mut self) -> Result<(), DecodeError> {
        self.end_access_unit()?;

        let flushed = self.codec.camera.observe_slice(None);
        self.drain_camera_records();
        flushed?;

        self.output_pictures(true);

        Ok(())
    }

    fn process_nalu(&mut self, nalu: Nalu) -> Result<(), DecodeError> {
        log::debug!("Processing NALU {:?}", nalu.header.type_);

        match nalu.payload {
            NaluPayload::Sps(sps) => self.process_sps(sps)?,
            NaluPayload::Pps(pps) => self.process_pps(pps)?,
            NaluPayload::Sei(messages) => self.codec.pending_sei.extend(messages),
            NaluPayload::Slice(hdr) => self.process_slice(hdr, nalu.header.output_flag)?,
            NaluPayload::Empty => match nalu.header.type_ {
                NaluType::AccessUnitDelimiter => self.end_access_unit()?,
                NaluType::EndOfSequence => {
                    self.drain()?;
                    for layer in self.codec.layers.values_mut() {
                        layer.reset_random_access();
                    }
                }
                NaluType::EndOfStream => {
                    self.drain()?;
                    self.decoding_state = DecodingState::Ended;
                }
                other => log::debug!("Unsupported NAL unit type {:?}", other),
            },
        }

        if self.decoding_state == DecodingState::AwaitingParameterSets
            && self.codec.layers.values().any(|layer| layer.parser.is_ready())
        {
            log::debug!("Parameter sets are ready, decoding can start");
            self.decoding_state = DecodingState::Decoding;
        }

        Ok(())
    }

    /// Aborts the session if `result` carries an error it cannot survive.
    fn escalate(&mut self, result: Result<(), DecodeError>) -> Result<(), DecodeError> {
        if let Err(e) = &result {
            let fatal = e.is_session_fatal()
                || (matches!(e, DecodeError::Reference(_))
                    && self.config.reference_failure == FailurePolicy::AbortSession);

            if fatal {
                log::error!("Aborting the decoding session: {}", e);
                self.abort();
            }
        }

        result
    }

    fn abort(&mut self) {
        if let Assembly::Decoding(cur) = std::mem::take(&mut self.codec.current) {
            if let Err(e) = self.discard_picture(cur) {
                log::debug!("Could not discard the current picture: {}", e);
            }
        }

        self.codec.pilot.reset();
        self.decoding_state = DecodingState::Aborted;
    }

    fn check_session(&self) -> Result<(), DecodeError> {
        match self.decoding_state {
            DecodingState::Aborted => Err(DecodeError::SessionAborted),
            DecodingState::Ended => Err(DecodeError::ProtocolError(String::from(
                "the stream has already ended",
            ))),
            _ => Ok(()),
        }
    }
}

impl<B> StatelessVideoDecoder for StatelessDecoder<Mvd, B>
where
    B: StatelessMvdDecoderBackend,
{
    fn decode(&mut self, nalu: Nalu) -> Result<(), DecodeError> {
        self.check_session()?;

        let result = self.process_nalu(nalu);
        self.escalate(result)
    }

    fn flush(&mut self) -> Result<(), DecodeError> {
        if self.decoding_state == DecodingState::Aborted {
            return Err(DecodeError::SessionAborted);
        }

        let result = self.drain();
        self.escalate(result)
    }

    fn next_event(&mut self) -> Option<DecoderEvent> {
        (&mut self.events).next()
    }

    fn session_state(&self) -> SessionState {
        match self.decoding_state {
            DecodingState::AwaitingParameterSets => SessionState::WaitingForParameterSets,
            DecodingState::Ended => SessionState::SessionEnd,
            DecodingState::Aborted => SessionState::Aborted,
            DecodingState::Decoding => match &self.codec.current {
                Assembly::Decoding(cur) => SessionState::InPicture {
                    layer: cur.key.layer,
                    slice_idx: cur.picture.slices.len(),
                },
                Assembly::Skipping(_) | Assembly::Idle => SessionState::ReadyForPicture,
            },
        }
    }

    fn teardown(&mut self) {
        log::debug!("Tearing down the decoding session");

        self.codec.layers.clear();
        self.codec.camera.reset();
        self.codec.camera.sink_mut().clear();
        self.codec.pilot = Default::default();
        self.codec.current = Assembly::Idle;
        self.codec.au_poc = None;
        self.codec.au_pictures.clear();
        self.codec.au_refresh = false;
        self.codec.pending_sei.clear();
        self.events.clear();
        self.decoding_state = DecodingState::AwaitingParameterSets;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::fill_planes;
    use crate::backend::dummy::sample_value;
    use crate::backend::dummy::Backend;
    use crate::codec::mvd::camera::ShiftLut;
    use crate::codec::mvd::parser::CodedCameraParameters;
    use crate::codec::mvd::parser::PictureHash;
    use crate::codec::mvd::parser::ScaleOffset;
    use crate::codec::mvd::parser::SliceType;
    use crate::codec::mvd::picture::PicturePlanes;
    use crate::codec::mvd::refs::ReferenceError;

    fn sps(view_idx: u8, is_depth: bool) -> Sps {
        let v = i32::from(view_idx);
        Sps {
            seq_parameter_set_id: 0,
            view_idx,
            view_order_idx: v,
            is_depth,
            width: 64,
            height: 64,
            max_dec_pic_buffering: 4,
            cam_par_precision: 5,
            camera_parameters: CodedCameraParameters {
                forward: (0..v)
                    .map(|b| ScaleOffset {
                        scale: 1024 + b,
                        offset: 10 * v,
                    })
                    .collect(),
                inverse: (0..v)
                    .map(|b| ScaleOffset {
                        scale: -1024 - b,
                        offset: -10 * v,
                    })
                    .collect(),
            },
            ..Default::default()
        }
    }

    fn pps() -> Pps {
        Pps {
            pic_parameter_set_id: 0,
            seq_parameter_set_id: 0,
        }
    }

    fn slice(nalu_type: NaluType, view_idx: u8, poc: i32) -> SliceHeader {
        SliceHeader {
            nalu_type,
            nal_ref_idc: 1,
            poc,
            view_idx,
            slice_type: SliceType::I,
            first_slice_in_picture: true,
            next_slice: true,
            ..Default::default()
        }
    }

    /// A temporal P slice referencing `refs` in view 0.
    fn p_slice(poc: i32, refs: &[i32]) -> SliceHeader {
        SliceHeader {
            slice_type: SliceType::P,
            num_ref_idx: [refs.len(), 0],
            ref_poc_list: [refs.to_vec(), vec![]],
            ref_view_list: [vec![0; refs.len()], vec![]],
            ..slice(NaluType::CodedSlice, 0, poc)
        }
    }

    /// A temporal B slice of view 0.
    fn b_slice(poc: i32, l0: &[i32], l1: &[i32], reference: bool) -> SliceHeader {
        SliceHeader {
            slice_type: SliceType::B,
            nal_ref_idc: u8::from(reference),
            num_ref_idx: [l0.len(), l1.len()],
            ref_poc_list: [l0.to_vec(), l1.to_vec()],
            ref_view_list: [vec![0; l0.len()], vec![0; l1.len()]],
            ..slice(NaluType::CodedSlice, 0, poc)
        }
    }

    fn decoder(config: DecoderConfig) -> StatelessDecoder<Mvd, Backend> {
        StatelessDecoder::<Mvd, _>::new_dummy(config).unwrap()
    }

    /// Decoder with parameter sets for the texture of `num_views` views.
    fn ready_decoder(config: DecoderConfig, num_views: u8) -> StatelessDecoder<Mvd, Backend> {
        let mut decoder = decoder(config);
        for view_idx in 0..num_views {
            decoder.decode(Nalu::sps(sps(view_idx, false))).unwrap();
        }
        decoder.decode(Nalu::pps(pps())).unwrap();
        decoder
    }

    fn events(decoder: &mut StatelessDecoder<Mvd, Backend>) -> Vec<DecoderEvent> {
        std::iter::from_fn(|| decoder.next_event()).collect()
    }

    fn frame_pocs(events: &[DecoderEvent]) -> Vec<i32> {
        events
            .iter()
            .filter_map(|event| match event {
                DecoderEvent::FrameReady(frame) => Some(frame.poc),
                _ => None,
            })
            .collect()
    }

    fn warnings(events: &[DecoderEvent]) -> Vec<DecodeWarning> {
        events
            .iter()
            .filter_map(|event| match event {
                DecoderEvent::Warning(warning) => Some(warning.clone()),
                _ => None,
            })
            .collect()
    }

    fn num_live(decoder: &StatelessDecoder<Mvd, Backend>) -> usize {
        decoder
            .codec
            .layers
            .values()
            .map(|layer| layer.dpb.num_live())
            .sum()
    }

    #[test]
    fn slice_before_parameter_sets() {
        let _ = env_logger::try_init();

        let mut decoder = decoder(Default::default());
        assert_eq!(decoder.session_state(), SessionState::WaitingForParameterSets);

        decoder.decode(Nalu::sps(sps(0, false))).unwrap();
        assert_eq!(decoder.session_state(), SessionState::WaitingForParameterSets);

        let err = decoder
            .decode(Nalu::slice(slice(NaluType::CodedSliceIdr, 0, 0)))
            .unwrap_err();
        assert!(matches!(err, DecodeError::ProtocolError(_)));
        assert_eq!(decoder.session_state(), SessionState::Aborted);
        assert!(matches!(
            decoder.decode(Nalu::pps(pps())),
            Err(DecodeError::SessionAborted)
        ));
        assert!(matches!(decoder.flush(), Err(DecodeError::SessionAborted)));

        decoder.teardown();
        decoder.teardown();
        assert_eq!(decoder.session_state(), SessionState::WaitingForParameterSets);
        assert!(decoder.codec.layers.is_empty());
    }

    #[test]
    fn slice_for_unknown_layer() {
        let mut decoder = ready_decoder(Default::default(), 1);
        assert_eq!(decoder.session_state(), SessionState::ReadyForPicture);

        let err = decoder
            .decode(Nalu::slice(slice(NaluType::CodedSliceIdr, 3, 0)))
            .unwrap_err();
        assert!(matches!(err, DecodeError::ProtocolError(_)));
        assert!(err.is_session_fatal());
    }

    #[test]
    fn pps_with_unknown_sps() {
        let mut decoder = decoder(Default::default());
        decoder.decode(Nalu::sps(sps(0, false))).unwrap();

        let err = decoder
            .decode(Nalu::pps(Pps {
                pic_parameter_set_id: 1,
                seq_parameter_set_id: 4,
            }))
            .unwrap_err();
        assert!(matches!(
            err,
            DecodeError::ParameterSet(ParameterSetError::UnknownSps {
                pps_id: 1,
                sps_id: 4
            })
        ));
        assert_eq!(decoder.session_state(), SessionState::Aborted);
    }

    #[test]
    fn lookahead_replay() {
        let _ = env_logger::try_init();

        let mut decoder = ready_decoder(Default::default(), 1);
        let layer = LayerId::texture(0);

        decoder
            .decode(Nalu::slice(slice(NaluType::CodedSliceIdr, 0, 5)))
            .unwrap();
        assert_eq!(
            decoder.session_state(),
            SessionState::InPicture {
                layer,
                slice_idx: 1
            }
        );
        assert!(decoder.backend().submitted.is_empty());

        let mut second = slice(NaluType::CodedSlice, 0, 6);
        second.first_slice_in_picture = false;
        decoder.decode(Nalu::slice(second)).unwrap();

        assert_eq!(decoder.backend().submitted, vec![(layer, 5)]);
        assert_eq!(decoder.backend().decoded_slices, vec![(layer, 5), (layer, 6)]);
        assert_eq!(
            decoder.session_state(),
            SessionState::InPicture {
                layer,
                slice_idx: 1
            }
        );

        let dpb = &decoder.codec.layers[&layer].dpb;
        let slot = dpb.find_by_poc(5).unwrap();
        let pic = dpb.get(slot).unwrap();
        assert_eq!(pic.slices.len(), 1);
        assert_eq!(pic.slices[0].poc, 5);

        let events = events(&mut decoder);
        assert_eq!(frame_pocs(&events), vec![5]);
        assert!(events
            .iter()
            .any(|event| matches!(event, DecoderEvent::AccessUnitComplete { poc: 5, .. })));
    }

    #[test]
    fn slices_of_one_picture() {
        let mut decoder = ready_decoder(Default::default(), 1);
        let layer = LayerId::texture(0);

        decoder
            .decode(Nalu::slice(slice(NaluType::CodedSliceIdr, 0, 0)))
            .unwrap();

        let mut next = slice(NaluType::CodedSliceIdr, 0, 0);
        next.first_slice_in_picture = false;
        decoder.decode(Nalu::slice(next.clone())).unwrap();

        // Entropy slices continue the picture.
        next.next_slice = false;
        decoder.decode(Nalu::slice(next)).unwrap();

        assert_eq!(
            decoder.session_state(),
            SessionState::InPicture {
                layer,
                slice_idx: 3
            }
        );
        assert!(decoder.backend().submitted.is_empty());

        decoder.flush().unwrap();
        assert_eq!(decoder.backend().submitted, vec![(layer, 0)]);
        assert_eq!(decoder.session_state(), SessionState::ReadyForPicture);
    }

    #[test]
    fn three_views_fixed_camera_parameters() {
        let _ = env_logger::try_init();

        let mut decoder = ready_decoder(Default::default(), 3);
        for view_idx in 0..3 {
            decoder
                .decode(Nalu::slice(slice(NaluType::CodedSliceIdr, view_idx, 0)))
                .unwrap();
        }
        decoder.flush().unwrap();

        let events = events(&mut decoder);
        let records = events
            .iter()
            .filter_map(|event| match event {
                DecoderEvent::CameraParameters(record) => Some(record),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].rows.len(), 6);
        assert!(records[0].consistent);
        assert!(warnings(&events).is_empty());

        assert_eq!(num_live(&decoder), 3);
        let store = events
            .iter()
            .find_map(|event| match event {
                DecoderEvent::AccessUnitComplete { poc: 0, store } => Some(store),
                _ => None,
            })
            .unwrap();
        assert_eq!(store.len(), 3);
        assert_eq!(frame_pocs(&events), vec![0, 0, 0]);
    }

    #[test]
    fn inter_view_prediction() {
        let mut decoder = ready_decoder(Default::default(), 2);

        decoder
            .decode(Nalu::slice(slice(NaluType::CodedSliceIdr, 0, 0)))
            .unwrap();

        let inter_view = SliceHeader {
            slice_type: SliceType::P,
            num_ref_idx: [1, 0],
            ref_poc_list: [vec![0], vec![]],
            ref_view_list: [vec![0], vec![]],
            ..slice(NaluType::CodedSliceIdr, 1, 0)
        };
        decoder.decode(Nalu::slice(inter_view.clone())).unwrap();
        decoder.decode(Nalu::slice(inter_view.clone())).unwrap();

        assert_eq!(
            decoder.backend().decoded_slices,
            vec![
                (LayerId::texture(0), 0),
                (LayerId::texture(1), 0),
                (LayerId::texture(1), 0)
            ]
        );

        // Inter-view references cannot cross access units.
        let inter_view = SliceHeader {
            ref_poc_list: [vec![1], vec![]],
            ..inter_view
        };
        let err = decoder.decode(Nalu::slice(inter_view)).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::Reference(ReferenceError::InterViewConsistency {
                poc: 0,
                ref_poc: 1,
                ref_view_idx: 0,
                ..
            })
        ));
        assert_eq!(decoder.session_state(), SessionState::Aborted);
    }

    #[test]
    fn depth_follows_texture() {
        let mut decoder = decoder(Default::default());
        decoder.decode(Nalu::sps(sps(0, false))).unwrap();
        decoder.decode(Nalu::sps(sps(0, true))).unwrap();
        decoder.decode(Nalu::pps(pps())).unwrap();

        let mut depth = slice(NaluType::CodedSliceIdr, 0, 0);
        depth.is_depth = true;

        decoder
            .decode(Nalu::slice(slice(NaluType::CodedSliceIdr, 0, 0)))
            .unwrap();
        decoder.decode(Nalu::slice(depth.clone())).unwrap();
        assert_eq!(
            decoder.session_state(),
            SessionState::InPicture {
                layer: LayerId::depth(0),
                slice_idx: 1
            }
        );

        depth.poc = 1;
        depth.nalu_type = NaluType::CodedSlice;
        assert!(matches!(
            decoder.decode(Nalu::slice(depth)),
            Err(DecodeError::Reference(ReferenceError::InterViewConsistency { .. }))
        ));
    }

    #[test]
    fn drop_picture_on_reference_failure() {
        let _ = env_logger::try_init();

        let config = DecoderConfig {
            reference_failure: FailurePolicy::DropPicture,
            ..Default::default()
        };
        let mut decoder = ready_decoder(config, 1);
        let layer = LayerId::texture(0);

        decoder
            .decode(Nalu::slice(slice(NaluType::CodedSliceIdr, 0, 0)))
            .unwrap();

        let broken = p_slice(1, &[7]);
        assert!(matches!(
            decoder.decode(Nalu::slice(broken.clone())),
            Err(DecodeError::Reference(ReferenceError::StreamInconsistency {
                ref_poc: 7,
                ..
            }))
        ));
        assert_eq!(decoder.session_state(), SessionState::ReadyForPicture);

        // The rest of the dropped picture is ignored.
        let mut rest = broken;
        rest.first_slice_in_picture = false;
        decoder.decode(Nalu::slice(rest)).unwrap();

        decoder.decode(Nalu::slice(p_slice(2, &[0]))).unwrap();
        decoder.flush().unwrap();

        assert_eq!(
            decoder.backend().decoded_slices,
            vec![(layer, 0), (layer, 2)]
        );
        let events = events(&mut decoder);
        assert_eq!(frame_pocs(&events), vec![0, 2]);
        assert_eq!(num_live(&decoder), 2);
    }

    #[test]
    fn abort_on_reference_failure() {
        let mut decoder = ready_decoder(Default::default(), 1);

        decoder
            .decode(Nalu::slice(slice(NaluType::CodedSliceIdr, 0, 0)))
            .unwrap();
        assert!(matches!(
            decoder.decode(Nalu::slice(p_slice(1, &[7]))),
            Err(DecodeError::Reference(_))
        ));
        assert_eq!(decoder.session_state(), SessionState::Aborted);
        assert!(matches!(
            decoder.decode(Nalu::slice(p_slice(2, &[0]))),
            Err(DecodeError::SessionAborted)
        ));

        // The buffer of the broken picture went back to the DPB.
        assert_eq!(num_live(&decoder), 1);
    }

    #[test]
    fn display_order() {
        let _ = env_logger::try_init();

        let mut decoder = ready_decoder(Default::default(), 1);

        decoder
            .decode(Nalu::slice(slice(NaluType::CodedSliceIdr, 0, 0)))
            .unwrap();
        decoder.decode(Nalu::slice(p_slice(4, &[0]))).unwrap();
        decoder
            .decode(Nalu::slice(b_slice(2, &[0], &[4], true)))
            .unwrap();
        decoder
            .decode(Nalu::slice(b_slice(1, &[0], &[2], false)))
            .unwrap();
        decoder
            .decode(Nalu::slice(b_slice(3, &[2], &[4], false)))
            .unwrap();
        decoder
            .decode(Nalu::with_type(NaluType::EndOfStream, NaluPayload::Empty))
            .unwrap();

        let events = events(&mut decoder);
        assert_eq!(frame_pocs(&events), vec![0, 1, 2, 3, 4]);
        assert_eq!(decoder.session_state(), SessionState::SessionEnd);
        assert!(decoder.codec.layers[&LayerId::texture(0)].dpb.len() <= 4);

        // Non-reference pictures are retired once displayed.
        assert_eq!(num_live(&decoder), 3);

        assert!(matches!(
            decoder.decode(Nalu::slice(p_slice(5, &[4]))),
            Err(DecodeError::ProtocolError(_))
        ));
    }

    #[test]
    fn random_access_from_cdr() {
        let mut decoder = ready_decoder(Default::default(), 1);
        let layer = LayerId::texture(0);

        decoder
            .decode(Nalu::slice(slice(NaluType::CodedSliceCdr, 0, 8)))
            .unwrap();
        // Leading picture referencing pictures before the entry point.
        decoder.decode(Nalu::slice(p_slice(6, &[4]))).unwrap();
        decoder.decode(Nalu::slice(p_slice(12, &[8]))).unwrap();
        decoder.flush().unwrap();

        assert_eq!(
            decoder.backend().decoded_slices,
            vec![(layer, 8), (layer, 12)]
        );
        assert_eq!(decoder.codec.layers[&layer].prev_poc, Some(12));

        let events = events(&mut decoder);
        assert_eq!(frame_pocs(&events), vec![8, 12]);
        assert!(warnings(&events).is_empty());
    }

    #[test]
    fn unsafe_random_access_point() {
        let mut decoder = ready_decoder(Default::default(), 1);
        let layer = LayerId::texture(0);

        decoder
            .decode(Nalu::slice(slice(NaluType::CodedSlice, 0, 3)))
            .unwrap();
        decoder.decode(Nalu::slice(p_slice(2, &[0]))).unwrap();
        decoder.flush().unwrap();

        let events = events(&mut decoder);
        assert_eq!(
            warnings(&events),
            vec![DecodeWarning::UnsafeRandomAccessPoint {
                layer,
                poc: 3,
                nalu_type: NaluType::CodedSlice
            }]
        );
        assert_eq!(decoder.backend().decoded_slices, vec![(layer, 3)]);
    }

    #[test]
    fn skip_leading_frames() {
        let config = DecoderConfig {
            skip_frames: 2,
            ..Default::default()
        };
        let mut decoder = ready_decoder(config, 1);
        let layer = LayerId::texture(0);

        decoder
            .decode(Nalu::slice(slice(NaluType::CodedSliceIdr, 0, 0)))
            .unwrap();
        for poc in 1..4 {
            decoder
                .decode(Nalu::slice(slice(NaluType::CodedSlice, 0, poc)))
                .unwrap();
        }
        decoder.flush().unwrap();

        assert_eq!(
            decoder.backend().decoded_slices,
            vec![(layer, 2), (layer, 3)]
        );
        let events = events(&mut decoder);
        assert_eq!(frame_pocs(&events), vec![2, 3]);
    }

    #[test]
    fn picture_hash() {
        let _ = env_logger::try_init();

        let mut decoder = ready_decoder(Default::default(), 1);
        let layer = LayerId::texture(0);

        let mut planes = PicturePlanes::new(64, 64, Default::default());
        fill_planes(&mut planes, sample_value(layer, 0));
        decoder
            .decode(Nalu::sei(vec![SeiMessage::DecodedPictureHash(PictureHash {
                md5: planes.md5(),
            })]))
            .unwrap();
        decoder
            .decode(Nalu::slice(slice(NaluType::CodedSliceIdr, 0, 0)))
            .unwrap();

        decoder
            .decode(Nalu::sei(vec![SeiMessage::DecodedPictureHash(PictureHash {
                md5: [[0; 16]; 3],
            })]))
            .unwrap();
        decoder
            .decode(Nalu::slice(slice(NaluType::CodedSlice, 0, 1)))
            .unwrap();
        decoder.flush().unwrap();

        let events = events(&mut decoder);
        assert_eq!(
            warnings(&events),
            vec![DecodeWarning::PictureHashMismatch { layer, poc: 1 }]
        );

        // The SEI travels with the picture.
        let frame = events
            .iter()
            .find_map(|event| match event {
                DecoderEvent::FrameReady(frame) if frame.poc == 0 => Some(frame),
                _ => None,
            })
            .unwrap();
        assert_eq!(frame.sei.len(), 1);
        assert_eq!(frame.planes.md5(), planes.md5());
    }

    #[test]
    fn side_buffers_are_released() {
        let mut decoder = ready_decoder(Default::default(), 1);
        let layer = LayerId::texture(0);

        decoder
            .decode(Nalu::slice(slice(NaluType::CodedSliceIdr, 0, 0)))
            .unwrap();
        decoder
            .decode(Nalu::with_type(NaluType::AccessUnitDelimiter, NaluPayload::Empty))
            .unwrap();

        let dpb = &decoder.codec.layers[&layer].dpb;
        let pic = dpb.get(dpb.find_by_poc(0).unwrap()).unwrap();
        assert!(pic.aux.is_none());
        assert!(pic.data.reconstructed);
    }

    fn live_slots(decoder: &StatelessDecoder<Mvd, Backend>, layer: LayerId) -> Vec<DpbSlot> {
        decoder.codec.layers[&layer]
            .dpb
            .live_pictures()
            .map(|(slot, _)| slot)
            .collect()
    }

    #[test]
    fn repeated_idr_access_units_bind_current_pictures() {
        let _ = env_logger::try_init();

        let mut decoder = ready_decoder(Default::default(), 2);
        let base = LayerId::texture(0);

        let inter_view = SliceHeader {
            slice_type: SliceType::P,
            num_ref_idx: [1, 0],
            ref_poc_list: [vec![0], vec![]],
            ref_view_list: [vec![0], vec![]],
            ..slice(NaluType::CodedSlice, 1, 0)
        };

        for _ in 0..4 {
            decoder
                .decode(Nalu::slice(slice(NaluType::CodedSliceIdr, 0, 0)))
                .unwrap();
            decoder.decode(Nalu::slice(inter_view.clone())).unwrap();

            // Only the base picture of this access unit is left to bind to.
            let live = live_slots(&decoder, base);
            assert_eq!(live.len(), 1);
            assert_eq!(
                decoder.backend().bindings.last(),
                Some(&vec![PicHandle {
                    layer: base,
                    slot: live[0]
                }])
            );
        }
        decoder.flush().unwrap();

        let events = events(&mut decoder);
        assert_eq!(frame_pocs(&events), vec![0; 8]);
        assert!(warnings(&events).is_empty());
        assert_eq!(live_slots(&decoder, base).len(), 1);
        assert_eq!(live_slots(&decoder, LayerId::texture(1)).len(), 1);
    }

    #[test]
    fn idr_restarts_pocs_without_end_of_sequence() {
        let mut decoder = ready_decoder(Default::default(), 1);
        let layer = LayerId::texture(0);

        for _ in 0..2 {
            decoder
                .decode(Nalu::slice(slice(NaluType::CodedSliceIdr, 0, 0)))
                .unwrap();
            decoder.decode(Nalu::slice(p_slice(1, &[0]))).unwrap();
        }
        decoder.flush().unwrap();

        let events = events(&mut decoder);
        assert_eq!(frame_pocs(&events), vec![0, 1, 0, 1]);
        assert_eq!(decoder.backend().decoded_slices.len(), 4);

        // The second P picture predicts from the second IDR picture.
        let dpb = &decoder.codec.layers[&layer].dpb;
        let idr = dpb.find_by_poc(0).unwrap();
        assert_eq!(
            decoder.backend().bindings.last(),
            Some(&vec![PicHandle { layer, slot: idr }])
        );
        assert_eq!(dpb.num_live(), 2);
    }

    #[test]
    fn exhausted_dpb_evicts_lowest_poc() {
        let _ = env_logger::try_init();

        let config = DecoderConfig {
            dpb_capacity: Some(2),
            ..Default::default()
        };
        let mut decoder = ready_decoder(config, 1);
        let layer = LayerId::texture(0);

        decoder
            .decode(Nalu::slice(slice(NaluType::CodedSliceIdr, 0, 0)))
            .unwrap();
        for poc in [2, 4, 6] {
            decoder
                .decode(Nalu::slice(p_slice(poc, &[poc - 2])))
                .unwrap();
        }
        decoder.flush().unwrap();

        assert_eq!(
            decoder.backend().decoded_slices,
            vec![(layer, 0), (layer, 2), (layer, 4), (layer, 6)]
        );

        // POC 2 never got its turn for display before its buffer was taken.
        let events = events(&mut decoder);
        assert_eq!(frame_pocs(&events), vec![0, 4, 6]);

        let dpb = &decoder.codec.layers[&layer].dpb;
        assert_eq!(dpb.len(), 2);
        assert_eq!(dpb.find_by_poc(0), None);
        assert_eq!(dpb.find_by_poc(2), None);
        assert_eq!(num_live(&decoder), 2);
    }

    #[test]
    fn slice_is_deferred_once() {
        let pilot_slice = || PilotSlice {
            hdr: slice(NaluType::CodedSlice, 0, 3),
            output_flag: true,
        };
        let mut pilot = SlicePilot::default();

        pilot.defer(pilot_slice()).unwrap();
        let pending = pilot.take_pending_or_next(&mut None).unwrap();
        assert!(matches!(
            pilot.defer(pending),
            Err(DecodeError::ReplayLoop { poc: 3 })
        ));
        assert!(pilot.pending.is_none());

        pilot.defer(pilot_slice()).unwrap();
        let mut incoming = Some(pilot_slice());
        assert!(pilot.take_pending_or_next(&mut incoming).is_some());
        pilot.consumed();
        assert!(pilot.take_pending_or_next(&mut incoming).is_some());
        assert!(pilot.defer(pilot_slice()).is_ok());
    }

    #[test]
    fn camera_lookup_tables_follow_config() {
        let config = DecoderConfig {
            lut_log2_precision: 3,
            ..Default::default()
        };
        let mut decoder = ready_decoder(config, 2);
        for view_idx in 0..2 {
            decoder
                .decode(Nalu::slice(slice(NaluType::CodedSliceIdr, view_idx, 0)))
                .unwrap();
        }

        let forward = ScaleOffset {
            scale: 1024,
            offset: 10,
        };
        let expected = ShiftLut::new(forward, 5, 3, 8).unwrap();
        let table = decoder.codec.camera_parameters();
        assert_eq!(table.shift_lut(0, 1), Some(&expected));
        assert_ne!(table.shift_lut(0, 1), ShiftLut::new(forward, 5, 2, 8).ok().as_ref());
        assert!(table.shift_lut(1, 0).is_some());
    }

    #[test]
    fn huge_skip_count_saturates() {
        let config = DecoderConfig {
            skip_frames: i32::MAX as u32,
            ..Default::default()
        };
        let layer = MvdLayer::<()>::new(LayerId::texture(0), &config);
        assert_eq!(layer.last_displayed_poc, i32::MAX - 1);
    }

    #[test]
    fn intra_only_access_units_reuse_poc() {
        let mut decoder = ready_decoder(Default::default(), 2);

        for _ in 0..3 {
            for view_idx in 0..2 {
                decoder
                    .decode(Nalu::slice(slice(NaluType::CodedSliceIdr, view_idx, 0)))
                    .unwrap();
            }
        }
        decoder.flush().unwrap();

        let events = events(&mut decoder);
        let completed = events
            .iter()
            .filter(|event| matches!(event, DecoderEvent::AccessUnitComplete { .. }))
            .count();
        assert_eq!(completed, 3);
        assert!(warnings(&events).is_empty());
    }
}
