// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decoding core of a multiview video plus depth decoder.
//!
//! This crate decides, for every incoming slice, which previously decoded pictures it may
//! reference, manages the lifetime of those pictures and propagates the camera parameters of
//! the views. Entropy decoding and pixel reconstruction are left to a
//! [backend](decoder::stateless::mvd::StatelessMvdDecoderBackend).

pub mod backend;
pub mod codec;
pub mod decoder;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    /// Returns the number of samples of a plane of this resolution.
    pub fn get_area(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

impl From<(u32, u32)> for Resolution {
    fn from(value: (u32, u32)) -> Self {
        Self {
            width: value.0,
            height: value.1,
        }
    }
}

impl From<Resolution> for (u32, u32) {
    fn from(value: Resolution) -> Self {
        (value.width, value.height)
    }
}
