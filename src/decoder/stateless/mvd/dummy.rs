// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! This file contains a dummy backend whose only purpose is to let the decoder
//! run so we can test it in isolation.

use anyhow::anyhow;

use crate::backend::dummy::*;
use crate::codec::mvd::camera::CameraParameterTable;
use crate::codec::mvd::parser::Pps;
use crate::codec::mvd::parser::SliceHeader;
use crate::codec::mvd::parser::Sps;
use crate::codec::mvd::picture::Picture;
use crate::codec::mvd::picture::PictureData;
use crate::codec::mvd::refs::ReferencePicLists;
use crate::decoder::stateless::mvd::Mvd;
use crate::decoder::stateless::mvd::PictureLookup;
use crate::decoder::stateless::mvd::StatelessMvdDecoderBackend;
use crate::decoder::stateless::StatelessBackendResult;
use crate::decoder::stateless::StatelessDecoder;
use crate::decoder::stateless::StatelessDecoderBackendPicture;
use crate::decoder::DecoderConfig;

impl StatelessDecoderBackendPicture<Mvd> for Backend {
    type Picture = ();
}

impl StatelessMvdDecoderBackend for Backend {
    fn new_sequence(&mut self, sps: &Sps) -> StatelessBackendResult<()> {
        self.sequences.push(sps.clone());
        Ok(())
    }

    fn new_picture(&mut self, _: &PictureData, _: &Sps, _: &Pps) -> StatelessBackendResult<()> {
        Ok(())
    }

    fn decode_slice(
        &mut self,
        picture: &mut Picture<Self::Picture>,
        slice: &SliceHeader,
        _: &Sps,
        _: &Pps,
        ref_lists: &ReferencePicLists,
        refs: &PictureLookup<Self::Picture>,
        _: &CameraParameterTable,
    ) -> StatelessBackendResult<()> {
        let handles = ref_lists
            .entries()
            .map(|entry| entry.handle)
            .chain(ref_lists.texture);

        let mut bound = vec![];
        for handle in handles {
            match refs.get(handle) {
                Some(pic) if pic.data.reconstructed => bound.push(handle),
                _ => return Err(anyhow!("reference {:?} is not a decoded picture", handle).into()),
            }
        }

        fill_planes(
            &mut picture.planes,
            sample_value(picture.data.layer, picture.data.poc),
        );
        self.decoded_slices.push((slice.layer(), slice.poc));
        self.bindings.push(bound);

        Ok(())
    }

    fn submit_picture(
        &mut self,
        picture: &mut Picture<Self::Picture>,
    ) -> StatelessBackendResult<()> {
        self.submitted.push((picture.data.layer, picture.data.poc));
        Ok(())
    }
}

impl StatelessDecoder<Mvd, Backend> {
    // Creates a new instance of the decoder using the dummy backend.
    pub fn new_dummy(config: DecoderConfig) -> anyhow::Result<Self> {
        Self::new(Backend::new(), config)
    }
}
